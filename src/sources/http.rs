//! Shared HTTP plumbing for the REST adapters: client construction and the
//! mapping from transport outcomes to `FetchError` classes.

use anyhow::Context;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::FetchError;

pub fn build_client(timeout: Duration) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("raceweek-bot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// Join path segments and query pairs onto a base URL.
pub fn endpoint(base: &str, segments: &[&str], query: &[(&str, String)]) -> Result<Url, FetchError> {
    let mut url = Url::parse(base)
        .map_err(|e| FetchError::Permanent(format!("bad base URL '{base}': {e}")))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| FetchError::Permanent(format!("base URL '{base}' cannot hold a path")))?;
        path.pop_if_empty();
        path.extend(segments);
    }
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

/// 404/425 mean "nothing published yet"; throttling and server faults are
/// transient; every other non-success status is permanent.
pub fn classify_status(status: StatusCode, what: &str) -> FetchError {
    match status.as_u16() {
        404 | 425 => FetchError::NotYetAvailable(format!("{what}: HTTP {status}")),
        408 | 429 => FetchError::Transient(format!("{what}: HTTP {status}")),
        500..=599 => FetchError::Transient(format!("{what}: HTTP {status}")),
        _ => FetchError::Permanent(format!("{what}: HTTP {status}")),
    }
}

pub fn classify_transport(err: &reqwest::Error, what: &str) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        FetchError::Transient(format!("{what}: {err}"))
    } else if err.is_decode() {
        FetchError::Permanent(format!("{what}: undecodable body: {err}"))
    } else {
        FetchError::Transient(format!("{what}: {err}"))
    }
}

/// GET a JSON document, classifying every failure.
pub async fn get_json(http: &Client, url: Url, what: &str) -> Result<serde_json::Value, FetchError> {
    debug!("GET {}", url);
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| classify_transport(&e, what))?;
    if !resp.status().is_success() {
        return Err(classify_status(resp.status(), what));
    }
    resp.json().await.map_err(|e| classify_transport(&e, what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "x"),
            FetchError::NotYetAvailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "x"),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "x"),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "x"),
            FetchError::Permanent(_)
        ));
    }

    #[test]
    fn endpoint_appends_segments_and_query() {
        let url = endpoint(
            "https://api.jolpi.ca/ergast/f1/",
            &["2025", "13", "results.json"],
            &[("limit", "100".to_string())],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.jolpi.ca/ergast/f1/2025/13/results.json?limit=100"
        );
    }
}
