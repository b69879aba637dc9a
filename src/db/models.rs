use chrono::{DateTime, Duration, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stores a fieldless enum as its `as_str()` text in SQLite.
macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Stable identity of a race weekend: season plus round number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub season: i32,
    pub round: u32,
}

impl EventKey {
    pub fn new(season: i32, round: u32) -> Self {
        EventKey { season, round }
    }

    /// Primary-key text used in every table, e.g. `2025-R13`.
    pub fn id(&self) -> String {
        format!("{}-R{:02}", self.season, self.round)
    }

    pub fn parse_id(id: &str) -> Option<Self> {
        let (season, round) = id.split_once("-R")?;
        Some(EventKey {
            season: season.parse().ok()?,
            round: round.parse().ok()?,
        })
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Lifecycle of a race weekend. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Scheduled,
    InProgress,
    Completed,
    ResultsPending,
    ResultsFinal,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::InProgress => "in_progress",
            EventStatus::Completed => "completed",
            EventStatus::ResultsPending => "results_pending",
            EventStatus::ResultsFinal => "results_final",
        }
    }

    /// Single-step forward moves. `completed` may be skipped; nothing else may.
    pub fn can_advance_to(self, to: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, to),
            (Scheduled, InProgress)
                | (InProgress, Completed)
                | (InProgress, ResultsPending)
                | (Completed, ResultsPending)
                | (ResultsPending, ResultsFinal)
        )
    }

    /// Legal single steps leading from `self` to `target`, or `None` when
    /// `target` lies behind `self`. Empty when already there.
    pub fn path_to(self, target: EventStatus) -> Option<Vec<EventStatus>> {
        use EventStatus::*;
        if target < self {
            return None;
        }
        let chain = [Scheduled, InProgress, Completed, ResultsPending, ResultsFinal];
        let mut path = Vec::new();
        let mut current = self;
        for next in chain.into_iter().filter(|s| *s > self && *s <= target) {
            // `completed` is optional: skip it unless it is the destination
            if next == Completed && target != Completed {
                continue;
            }
            if !current.can_advance_to(next) {
                return None;
            }
            path.push(next);
            current = next;
        }
        Some(path)
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(EventStatus::Scheduled),
            "in_progress" => Ok(EventStatus::InProgress),
            "completed" => Ok(EventStatus::Completed),
            "results_pending" => Ok(EventStatus::ResultsPending),
            "results_final" => Ok(EventStatus::ResultsFinal),
            other => Err(format!("unknown event status '{other}'")),
        }
    }
}

sql_text_enum!(EventStatus);

/// A race weekend on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub key: EventKey,
    pub name: String,
    /// Scheduled race start
    pub start: DateTime<Utc>,
    pub status: EventStatus,
    /// Expected classified participants (driver names); may be empty
    pub participants: Vec<String>,
    pub country: Option<String>,
    pub location: Option<String>,
}

/// What a trigger does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCategory {
    OddsFetch,
    Prediction,
    Recommendation,
    ResultsFetch,
}

impl TriggerCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerCategory::OddsFetch => "odds_fetch",
            TriggerCategory::Prediction => "prediction",
            TriggerCategory::Recommendation => "recommendation",
            TriggerCategory::ResultsFetch => "results_fetch",
        }
    }

    /// Pre-event work is pointless once the event has started.
    pub fn is_pre_event(&self) -> bool {
        !matches!(self, TriggerCategory::ResultsFetch)
    }
}

impl FromStr for TriggerCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "odds_fetch" => Ok(TriggerCategory::OddsFetch),
            "prediction" => Ok(TriggerCategory::Prediction),
            "recommendation" => Ok(TriggerCategory::Recommendation),
            "results_fetch" => Ok(TriggerCategory::ResultsFetch),
            other => Err(format!("unknown trigger category '{other}'")),
        }
    }
}

sql_text_enum!(TriggerCategory);

/// A time-relative rule: `category` fires at `event.start + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub category: TriggerCategory,
    /// Signed offset from event start in seconds (negative = before)
    pub offset_secs: i64,
}

impl TriggerDefinition {
    pub fn new(category: TriggerCategory, offset: Duration) -> Self {
        TriggerDefinition {
            category,
            offset_secs: offset.num_seconds(),
        }
    }

    pub fn offset(&self) -> Duration {
        Duration::seconds(self.offset_secs)
    }

    pub fn due_at(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + self.offset()
    }
}

/// Terminal outcome of a fired trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiringOutcome {
    Success,
    Failure,
    Skipped,
}

impl FiringOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FiringOutcome::Success => "success",
            FiringOutcome::Failure => "failure",
            FiringOutcome::Skipped => "skipped",
        }
    }
}

impl FromStr for FiringOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(FiringOutcome::Success),
            "failure" => Ok(FiringOutcome::Failure),
            "skipped" => Ok(FiringOutcome::Skipped),
            other => Err(format!("unknown firing outcome '{other}'")),
        }
    }
}

sql_text_enum!(FiringOutcome);

/// Idempotency-ledger row: one per (event, trigger) that has fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiringRecord {
    pub event: EventKey,
    pub trigger: TriggerDefinition,
    pub fired_at: DateTime<Utc>,
    pub outcome: FiringOutcome,
    /// Human-readable summary or failure reason
    pub detail: Option<String>,
}

/// Kind of acquired / produced data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCategory {
    Odds,
    Result,
    Prediction,
    Recommendation,
}

impl RecordCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordCategory::Odds => "odds",
            RecordCategory::Result => "result",
            RecordCategory::Prediction => "prediction",
            RecordCategory::Recommendation => "recommendation",
        }
    }
}

impl FromStr for RecordCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "odds" => Ok(RecordCategory::Odds),
            "result" => Ok(RecordCategory::Result),
            "prediction" => Ok(RecordCategory::Prediction),
            "recommendation" => Ok(RecordCategory::Recommendation),
            other => Err(format!("unknown record category '{other}'")),
        }
    }
}

sql_text_enum!(RecordCategory);

/// Source-agnostic data point. Unique on
/// (event, category, natural_key, measured_at).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquiredRecord {
    pub id: Option<i64>,
    pub event: EventKey,
    pub category: RecordCategory,
    /// Canonical participant name
    pub entity: String,
    /// Identity within the category, e.g. `max verstappen` or
    /// `max verstappen@pinnacle/outright`
    pub natural_key: String,
    /// Primary numeric value: position, decimal odds, probability or stake
    pub value: Option<f64>,
    /// Category-specific extras
    pub fields: serde_json::Value,
    /// Provenance: adapter or model that produced the row
    pub source: String,
    /// When the measured quantity was true
    pub measured_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

/// Persisted retrain counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainState {
    pub events_since_retrain: u32,
    pub last_signal_at: Option<DateTime<Utc>>,
}

/// A retraining signal that was emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainSignal {
    pub id: i64,
    pub events_counted: u32,
    /// Event whose finalization crossed the threshold
    pub triggered_by: EventKey,
    pub emitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_key_id_round_trips() {
        let key = EventKey::new(2025, 7);
        assert_eq!(key.id(), "2025-R07");
        assert_eq!(EventKey::parse_id("2025-R07"), Some(key));
        assert_eq!(EventKey::parse_id("garbage"), None);
    }

    #[test]
    fn status_only_moves_forward() {
        use EventStatus::*;
        assert!(Scheduled.can_advance_to(InProgress));
        assert!(InProgress.can_advance_to(ResultsPending));
        assert!(!InProgress.can_advance_to(ResultsFinal));
        assert!(!ResultsFinal.can_advance_to(Scheduled));
        assert!(!Scheduled.can_advance_to(Scheduled));
    }

    #[test]
    fn path_to_skips_optional_completed() {
        use EventStatus::*;
        assert_eq!(
            Scheduled.path_to(ResultsPending),
            Some(vec![InProgress, ResultsPending])
        );
        assert_eq!(
            Scheduled.path_to(Completed),
            Some(vec![InProgress, Completed])
        );
        assert_eq!(Completed.path_to(ResultsFinal), Some(vec![ResultsPending, ResultsFinal]));
        assert_eq!(ResultsPending.path_to(ResultsPending), Some(vec![]));
        assert_eq!(ResultsFinal.path_to(InProgress), None);
    }

    #[test]
    fn enums_parse_their_own_text() {
        for s in ["scheduled", "in_progress", "completed", "results_pending", "results_final"] {
            assert_eq!(s.parse::<EventStatus>().map(|v| v.as_str()), Ok(s));
        }
        assert!("odds_fetch".parse::<TriggerCategory>().is_ok());
        assert!("bogus".parse::<RecordCategory>().is_err());
    }

    #[test]
    fn trigger_due_at_applies_signed_offset() {
        let start = "2025-08-03T13:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let before = TriggerDefinition::new(TriggerCategory::OddsFetch, Duration::hours(-72));
        let after = TriggerDefinition::new(TriggerCategory::ResultsFetch, Duration::hours(4));
        assert_eq!(before.due_at(start), start - Duration::hours(72));
        assert_eq!(after.due_at(start), start + Duration::hours(4));
    }
}
