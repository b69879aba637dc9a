use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;

use super::http::{endpoint, get_json};
use super::provider::{OddsQuote, SourceAdapter, SourcePayload};
use crate::db::models::{Event, RecordCategory};
use crate::error::FetchError;

/// Race-winner outright prices from The Odds API.
/// Docs: <https://the-odds-api.com/liveapi/guides/v4/>
pub struct OddsApi {
    http: Client,
    base_url: String,
    api_key: String,
    sport_key: String,
}

impl OddsApi {
    pub fn new(http: Client, base_url: &str, api_key: &str, sport_key: &str) -> Self {
        OddsApi {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            sport_key: sport_key.to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for OddsApi {
    fn name(&self) -> &str {
        "odds_api"
    }

    async fn fetch(&self, event: &Event, category: RecordCategory) -> Result<SourcePayload, FetchError> {
        if category != RecordCategory::Odds {
            return Err(FetchError::Permanent(format!("odds_api does not serve {category}")));
        }
        let url = endpoint(
            &self.base_url,
            &["sports", &self.sport_key, "odds"],
            &[
                ("regions", "eu".to_string()),
                ("markets", "outrights".to_string()),
                ("oddsFormat", "decimal".to_string()),
                ("apiKey", self.api_key.clone()),
            ],
        )?;
        let raw = get_json(&self.http, url, "odds_api").await?;
        let quotes = parse_outrights(&raw, event.start);
        if quotes.is_empty() {
            return Err(FetchError::NotYetAvailable(format!(
                "no market open for {}",
                event.key
            )));
        }
        Ok(SourcePayload::Odds(quotes))
    }
}

/// Quotes from the listed event whose commence time is within a day of the
/// race start.
fn parse_outrights(raw: &serde_json::Value, start: DateTime<Utc>) -> Vec<OddsQuote> {
    let Some(listing) = raw.as_array().and_then(|events| {
        events.iter().find(|ev| {
            ev["commence_time"]
                .as_str()
                .and_then(|t| t.parse::<DateTime<Utc>>().ok())
                .is_some_and(|t| (t - start).abs() <= Duration::days(1))
        })
    }) else {
        return vec![];
    };

    let mut quotes = Vec::new();
    for book in listing["bookmakers"].as_array().into_iter().flatten() {
        let bookmaker = book["key"].as_str().or_else(|| book["title"].as_str()).unwrap_or("unknown");
        for market in book["markets"].as_array().into_iter().flatten() {
            let quoted_at = market["last_update"]
                .as_str()
                .or_else(|| book["last_update"].as_str())
                .and_then(|t| t.parse::<DateTime<Utc>>().ok());
            for outcome in market["outcomes"].as_array().into_iter().flatten() {
                let (Some(driver), Some(price)) = (outcome["name"].as_str(), outcome["price"].as_f64())
                else {
                    continue;
                };
                quotes.push(OddsQuote {
                    driver: driver.to_string(),
                    odds: price,
                    bookmaker: bookmaker.to_string(),
                    market: "winner".to_string(),
                    quoted_at,
                });
            }
        }
    }
    quotes
}
