use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{Event, RecordCategory};
use crate::error::FetchError;

/// One classified finisher (or non-finisher) as reported by a results source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub driver: String,
    /// Classified position; `None` for unclassified / DNF
    pub position: Option<u32>,
    #[serde(default)]
    pub points: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub constructor: Option<String>,
    #[serde(default)]
    pub grid: Option<u32>,
}

/// A race-winner price from one bookmaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsQuote {
    pub driver: String,
    /// Decimal odds (e.g. 3.20)
    pub odds: f64,
    pub bookmaker: String,
    #[serde(default = "default_market")]
    pub market: String,
    /// When the bookmaker last moved this price, if reported
    #[serde(default)]
    pub quoted_at: Option<DateTime<Utc>>,
}

fn default_market() -> String {
    "winner".to_string()
}

/// Provider-shaped data before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePayload {
    Results(Vec<ResultRow>),
    Odds(Vec<OddsQuote>),
}

impl SourcePayload {
    pub fn len(&self) -> usize {
        match self {
            SourcePayload::Results(rows) => rows.len(),
            SourcePayload::Odds(quotes) => quotes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait that every external data provider must implement.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetch one category of data for an event.
    async fn fetch(&self, event: &Event, category: RecordCategory) -> Result<SourcePayload, FetchError>;

    /// Provenance tag, also used for logging.
    fn name(&self) -> &str;
}
