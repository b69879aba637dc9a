use chrono::{Datelike, Duration as ChronoDuration, Utc};
use clap::Parser;
use std::time::Duration;

use crate::db::models::{RecordCategory, TriggerDefinition};
use crate::model::recommend::Criteria;
use crate::retry::RetryPolicy;
use crate::scheduler::triggers::parse_trigger_table;

/// Source adapters that can serve race results.
pub const RESULT_SOURCES: &[&str] = &["openf1", "ergast", "file_drop"];
/// Source adapters that can serve pre-race odds.
pub const ODDS_SOURCES: &[&str] = &["odds_api", "file_drop"];

/// Race-weekend scheduler: acquires odds and results, produces predictions
/// and recommendations, and signals model retraining.
#[derive(Parser, Debug, Clone)]
#[command(name = "raceweek-bot", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "raceweek.db")]
    pub database_path: String,

    /// Operator API listen address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: String,

    /// Seconds between scheduling passes
    #[arg(long, env = "CADENCE_SECS", default_value = "1800")]
    pub cadence_secs: u64,

    /// Events starting up to this many hours ahead are considered
    #[arg(long, env = "LOOK_AHEAD_HOURS", default_value = "96")]
    pub look_ahead_hours: i64,

    /// Events that started up to this many hours ago are considered
    #[arg(long, env = "LOOK_BEHIND_HOURS", default_value = "168")]
    pub look_behind_hours: i64,

    /// Minutes after start at which an event counts as completed
    #[arg(long, env = "EVENT_DURATION_MINS", default_value = "120")]
    pub event_duration_mins: i64,

    /// Trigger table: comma-separated `category@offset` entries
    #[arg(
        long,
        env = "TRIGGERS",
        default_value = "odds_fetch@-72h,odds_fetch@-24h,prediction@-24h,recommendation@-23h,results_fetch@+2h,results_fetch@+4h,results_fetch@+6h,results_fetch@+12h,results_fetch@+24h"
    )]
    pub triggers: String,

    /// Results adapters in priority order
    #[arg(long, env = "RESULTS_SOURCES", value_delimiter = ',', default_value = "openf1,ergast,file_drop")]
    pub results_sources: Vec<String>,

    /// Odds adapters in priority order
    #[arg(long, env = "ODDS_SOURCES", value_delimiter = ',', default_value = "odds_api,file_drop")]
    pub odds_sources: Vec<String>,

    /// Attempts per adapter before moving to the next one
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value = "3")]
    pub retry_max_attempts: u32,

    /// Base backoff delay in milliseconds
    #[arg(long, env = "RETRY_BASE_MS", default_value = "500")]
    pub retry_base_ms: u64,

    /// Backoff cap in milliseconds
    #[arg(long, env = "RETRY_CAP_MS", default_value = "8000")]
    pub retry_cap_ms: u64,

    /// Random extra backoff as a fraction of the delay (0.0–1.0)
    #[arg(long, env = "RETRY_JITTER", default_value = "0.0")]
    pub retry_jitter: f64,

    /// Per-call timeout for a source adapter, in seconds
    #[arg(long, env = "SOURCE_TIMEOUT_SECS", default_value = "20")]
    pub source_timeout_secs: u64,

    /// Finalized events between retraining signals
    #[arg(long, env = "RETRAIN_THRESHOLD", default_value = "5")]
    pub retrain_threshold: u32,

    /// Trigger dispatches allowed in flight within one pass
    #[arg(long, env = "MAX_CONCURRENT_DISPATCHES", default_value = "4")]
    pub max_concurrent_dispatches: usize,

    /// Result rows required to call results final when an event has no roster
    #[arg(long, env = "MIN_RESULT_ROWS", default_value = "10")]
    pub min_result_rows: usize,

    /// JSON calendar file; when absent the Ergast season calendar is used
    #[arg(long, env = "CALENDAR_FILE")]
    pub calendar_file: Option<String>,

    /// Seconds between calendar refreshes
    #[arg(long, env = "CALENDAR_REFRESH_SECS", default_value = "21600")]
    pub calendar_refresh_secs: u64,

    /// Season to track (defaults to the current UTC year)
    #[arg(long, env = "SEASON")]
    pub season: Option<i32>,

    /// OpenF1 API base URL
    #[arg(long, env = "OPENF1_URL", default_value = "https://api.openf1.org/v1")]
    pub openf1_url: String,

    /// Ergast-compatible API base URL
    #[arg(long, env = "ERGAST_URL", default_value = "https://api.jolpi.ca/ergast/f1")]
    pub ergast_url: String,

    /// Odds API base URL
    #[arg(long, env = "ODDS_API_URL", default_value = "https://api.the-odds-api.com/v4")]
    pub odds_api_url: String,

    /// Odds API key (required when odds_api is an odds source)
    #[arg(long, env = "ODDS_API_KEY")]
    pub odds_api_key: Option<String>,

    /// Odds API sport key for race-winner outrights
    #[arg(long, env = "ODDS_SPORT_KEY", default_value = "motorsport_formula_one_winner")]
    pub odds_sport_key: String,

    /// Directory watched for operator-dropped JSON data files
    #[arg(long, env = "FILE_DROP_DIR", default_value = "data/incoming")]
    pub file_drop_dir: String,

    /// External model service; the odds-implied model is used when unset
    #[arg(long, env = "MODEL_URL")]
    pub model_url: Option<String>,

    /// Minimum expected value (per stake) to recommend a bet
    #[arg(long, env = "MIN_EV", default_value = "0.0")]
    pub min_ev: f64,

    /// Minimum model win probability (0.0–1.0) to recommend a bet
    #[arg(long, env = "MIN_PROBABILITY", default_value = "0.15")]
    pub min_probability: f64,

    /// Minimum decimal odds to recommend a bet
    #[arg(long, env = "MIN_ODDS", default_value = "2.5")]
    pub min_odds: f64,

    /// Maximum stake per recommended bet
    #[arg(long, env = "STAKE", default_value = "10.0")]
    pub stake: f64,

    /// Fractional Kelly multiplier applied to the stake (0.0–1.0)
    #[arg(long, env = "KELLY_FRACTION", default_value = "0.25")]
    pub kelly_fraction: f64,
}

impl Config {
    /// Check everything that would otherwise fail later. Any error here is
    /// fatal: the scheduling loop never starts on a bad configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.trigger_table()?;
        validate_sources("results", &self.results_sources, RESULT_SOURCES)?;
        validate_sources("odds", &self.odds_sources, ODDS_SOURCES)?;
        if self.odds_sources.iter().any(|s| s == "odds_api") && self.odds_api_key.is_none() {
            anyhow::bail!("ODDS_API_KEY is required when odds_api is an odds source");
        }
        if self.cadence_secs == 0 {
            anyhow::bail!("cadence_secs must be positive");
        }
        if self.look_ahead_hours < 0 || self.look_behind_hours < 0 {
            anyhow::bail!("look-ahead/look-behind windows must not be negative");
        }
        if self.retry_max_attempts == 0 {
            anyhow::bail!("retry_max_attempts must be at least 1");
        }
        if self.retry_cap_ms < self.retry_base_ms {
            anyhow::bail!("retry_cap_ms must be >= retry_base_ms");
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            anyhow::bail!("retry_jitter must be between 0.0 and 1.0");
        }
        if self.retrain_threshold == 0 {
            anyhow::bail!("retrain_threshold must be at least 1");
        }
        if self.max_concurrent_dispatches == 0 {
            anyhow::bail!("max_concurrent_dispatches must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.min_probability) {
            anyhow::bail!("min_probability must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.kelly_fraction) {
            anyhow::bail!("kelly_fraction must be between 0.0 and 1.0");
        }
        if self.stake <= 0.0 {
            anyhow::bail!("stake must be positive");
        }
        Ok(())
    }

    pub fn trigger_table(&self) -> anyhow::Result<Vec<TriggerDefinition>> {
        parse_trigger_table(&self.triggers)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_cap_ms),
            jitter: self.retry_jitter,
        }
    }

    pub fn criteria(&self) -> Criteria {
        Criteria {
            min_ev: self.min_ev,
            min_probability: self.min_probability,
            min_odds: self.min_odds,
            stake: self.stake,
            kelly_fraction: self.kelly_fraction,
        }
    }

    pub fn sources_for(&self, category: RecordCategory) -> &[String] {
        match category {
            RecordCategory::Odds => &self.odds_sources,
            RecordCategory::Result => &self.results_sources,
            _ => &[],
        }
    }

    pub fn season(&self) -> i32 {
        self.season.unwrap_or_else(|| Utc::now().year())
    }

    pub fn look_ahead(&self) -> ChronoDuration {
        ChronoDuration::hours(self.look_ahead_hours)
    }

    pub fn look_behind(&self) -> ChronoDuration {
        ChronoDuration::hours(self.look_behind_hours)
    }

    pub fn event_duration(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.event_duration_mins)
    }
}

fn validate_sources(kind: &str, configured: &[String], known: &[&str]) -> anyhow::Result<()> {
    if configured.is_empty() {
        anyhow::bail!("no {kind} sources configured");
    }
    for (i, name) in configured.iter().enumerate() {
        if !known.contains(&name.as_str()) {
            anyhow::bail!(
                "unknown {kind} source '{name}' (expected one of: {})",
                known.join(", ")
            );
        }
        if configured[..i].contains(name) {
            anyhow::bail!("{kind} source '{name}' is listed twice");
        }
    }
    Ok(())
}
