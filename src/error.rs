//! Failure taxonomy shared by the acquisition, persistence and scheduling
//! layers.
//!
//! `NotYetAvailable` is an error variant at the adapter level but never
//! escalates: the scheduler treats it as "try again on a later pass" and
//! writes no firing record.

use thiserror::Error;

use crate::db::models::{EventKey, EventStatus};

/// Outcome classification for a single source-adapter call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// The source understood the request but has no data yet.
    #[error("not yet available: {0}")]
    NotYetAvailable(String),
    /// Network / rate-limit / timeout; eligible for in-process retry.
    #[error("transient error: {0}")]
    Transient(String),
    /// Malformed request or unsupported event; move on without retrying.
    #[error("permanent error: {0}")]
    Permanent(String),
}

/// Result of walking a whole source chain without a success.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChainError {
    #[error("no source has data yet (asked: {})", sources.join(", "))]
    NotYetAvailable { sources: Vec<String> },
    #[error("all sources failed: {}", format_failures(failures))]
    AllSourcesFailed { failures: Vec<(String, String)> },
}

fn format_failures(failures: &[(String, String)]) -> String {
    if failures.is_empty() {
        return "no sources configured".to_string();
    }
    failures
        .iter()
        .map(|(source, reason)| format!("{source}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Persistence failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Busy / locked / connectivity; retried by the gateway.
    #[error("transient store error: {0}")]
    Transient(String),
    /// Transient failures exhausted the retry budget.
    #[error("store unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },
    /// Anything else (schema, constraint, corrupt row).
    #[error("store error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::CannotOpen
                ) =>
            {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("json column: {err}"))
    }
}

/// Errors from timeline status mutation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TimelineError {
    #[error("invalid transition for {event}: {from} -> {to}")]
    InvalidTransition {
        event: EventKey,
        from: EventStatus,
        to: EventStatus,
    },
    #[error("unknown event {0}")]
    UnknownEvent(EventKey),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_sqlite_errors_are_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(StoreError::from(err), StoreError::Transient(_)));
    }

    #[test]
    fn constraint_errors_are_backend() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(matches!(StoreError::from(err), StoreError::Backend(_)));
    }

    #[test]
    fn all_sources_failed_lists_every_source() {
        let err = ChainError::AllSourcesFailed {
            failures: vec![
                ("openf1".into(), "timed out".into()),
                ("ergast".into(), "HTTP 400".into()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("openf1: timed out"));
        assert!(msg.contains("ergast: HTTP 400"));
    }
}
