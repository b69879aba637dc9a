use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use std::collections::HashMap;
use tracing::debug;

use super::http::{endpoint, get_json};
use super::provider::{ResultRow, SourceAdapter, SourcePayload};
use crate::db::models::{Event, RecordCategory};
use crate::error::FetchError;

/// Results provider backed by the OpenF1 REST API.
/// Docs: <https://openf1.org>
pub struct OpenF1 {
    http: Client,
    /// Base URL for overriding in tests
    base_url: String,
}

/// The race session matched to an event.
#[derive(Debug, Clone, PartialEq)]
struct RaceSession {
    key: i64,
    /// Absent while the session has not been closed out
    date_end: Option<DateTime<Utc>>,
}

impl RaceSession {
    /// Positions are only a classification once the session is over.
    fn ensure_finished(&self, now: DateTime<Utc>) -> Result<(), FetchError> {
        match self.date_end {
            Some(end) if end <= now => Ok(()),
            Some(end) => Err(FetchError::NotYetAvailable(format!(
                "session {} runs until {}",
                self.key, end
            ))),
            None => Err(FetchError::NotYetAvailable(format!(
                "session {} has no end time yet",
                self.key
            ))),
        }
    }
}

impl OpenF1 {
    pub fn new(http: Client, base_url: &str) -> Self {
        OpenF1 {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn race_session(&self, event: &Event) -> Result<RaceSession, FetchError> {
        let url = endpoint(
            &self.base_url,
            &["sessions"],
            &[
                ("year", event.key.season.to_string()),
                ("session_name", "Race".to_string()),
            ],
        )?;
        let raw = get_json(&self.http, url, "openf1 sessions").await?;
        match_session(&raw, event.start).ok_or_else(|| {
            FetchError::NotYetAvailable(format!("no race session near {}", event.start))
        })
    }
}

#[async_trait]
impl SourceAdapter for OpenF1 {
    fn name(&self) -> &str {
        "openf1"
    }

    async fn fetch(&self, event: &Event, category: RecordCategory) -> Result<SourcePayload, FetchError> {
        if category != RecordCategory::Result {
            return Err(FetchError::Permanent(format!("openf1 does not serve {category}")));
        }
        let session = self.race_session(event).await?;
        debug!("{} maps to OpenF1 session {}", event.key, session.key);
        session.ensure_finished(Utc::now())?;
        let session_key = session.key;

        let query = [("session_key", session_key.to_string())];
        let positions = get_json(
            &self.http,
            endpoint(&self.base_url, &["position"], &query)?,
            "openf1 position",
        )
        .await?;
        let drivers = get_json(
            &self.http,
            endpoint(&self.base_url, &["drivers"], &query)?,
            "openf1 drivers",
        )
        .await?;

        let rows = parse_results(&positions, &drivers);
        if rows.is_empty() {
            return Err(FetchError::NotYetAvailable(format!(
                "session {session_key} has no positions"
            )));
        }
        Ok(SourcePayload::Results(rows))
    }
}

/// Race session whose `date_start` is within two days of the event start.
fn match_session(raw: &serde_json::Value, start: DateTime<Utc>) -> Option<RaceSession> {
    raw.as_array()?
        .iter()
        .filter_map(|s| {
            let key = s["session_key"].as_i64()?;
            let date = s["date_start"].as_str()?.parse::<DateTime<Utc>>().ok()?;
            let date_end = s["date_end"].as_str().and_then(|d| d.parse::<DateTime<Utc>>().ok());
            let gap = (date - start).abs();
            (gap <= Duration::days(2)).then_some((gap, RaceSession { key, date_end }))
        })
        .min_by_key(|(gap, _)| *gap)
        .map(|(_, session)| session)
}

/// Final classification from the position feed: the last sample per driver
/// number wins, joined to the driver list for names and teams.
fn parse_results(positions: &serde_json::Value, drivers: &serde_json::Value) -> Vec<ResultRow> {
    let mut names: HashMap<i64, (String, Option<String>)> = HashMap::new();
    for d in drivers.as_array().into_iter().flatten() {
        let Some(number) = d["driver_number"].as_i64() else { continue };
        let Some(name) = d["full_name"].as_str().or_else(|| d["broadcast_name"].as_str()) else {
            continue;
        };
        let team = d["team_name"].as_str().map(str::to_string);
        names.insert(number, (name.to_string(), team));
    }

    let mut last: HashMap<i64, (String, u32)> = HashMap::new();
    for p in positions.as_array().into_iter().flatten() {
        let (Some(number), Some(pos)) = (p["driver_number"].as_i64(), p["position"].as_u64()) else {
            continue;
        };
        let date = p["date"].as_str().unwrap_or_default().to_string();
        let entry = last.entry(number).or_insert_with(|| (date.clone(), pos as u32));
        // ISO-8601 strings from one feed compare chronologically
        if date >= entry.0 {
            *entry = (date, pos as u32);
        }
    }

    let mut rows: Vec<ResultRow> = last
        .into_iter()
        .filter_map(|(number, (_, pos))| {
            let (name, team) = names.get(&number)?.clone();
            Some(ResultRow {
                driver: name,
                position: Some(pos),
                points: None,
                status: None,
                constructor: team,
                grid: None,
            })
        })
        .collect();
    rows.sort_by_key(|r| r.position);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn picks_session_closest_to_start() {
        let start = "2025-08-03T13:00:00Z".parse().unwrap();
        let raw = json!([
            { "session_key": 9001, "date_start": "2025-07-27T13:00:00+00:00" },
            { "session_key": 9002, "date_start": "2025-08-03T13:00:00+00:00" },
        ]);
        assert_eq!(match_session(&raw, start).map(|s| s.key), Some(9002));
        assert_eq!(match_session(&json!([]), start), None);
    }

    #[test]
    fn running_session_is_not_yet_a_classification() {
        let start: DateTime<Utc> = "2025-08-03T13:00:00Z".parse().unwrap();
        let raw = json!([{
            "session_key": 9002,
            "date_start": "2025-08-03T13:00:00+00:00",
            "date_end": "2025-08-03T16:10:00+00:00",
        }]);
        let session = match_session(&raw, start).unwrap();
        // Red flag: still running two hours after the start
        assert!(matches!(
            session.ensure_finished(start + Duration::hours(2)),
            Err(FetchError::NotYetAvailable(_))
        ));
        assert!(session.ensure_finished(start + Duration::hours(4)).is_ok());

        let open = json!([{ "session_key": 9003, "date_start": "2025-08-03T13:00:00+00:00" }]);
        let session = match_session(&open, start).unwrap();
        assert!(matches!(
            session.ensure_finished(start + Duration::hours(24)),
            Err(FetchError::NotYetAvailable(_))
        ));
    }

    #[test]
    fn last_position_sample_wins() {
        let positions = json!([
            { "driver_number": 1, "position": 1, "date": "2025-08-03T13:03:00" },
            { "driver_number": 4, "position": 2, "date": "2025-08-03T13:03:00" },
            { "driver_number": 4, "position": 1, "date": "2025-08-03T14:40:00" },
            { "driver_number": 1, "position": 2, "date": "2025-08-03T14:40:00" },
            { "driver_number": 99, "position": 3, "date": "2025-08-03T14:40:00" },
        ]);
        let drivers = json!([
            { "driver_number": 1, "full_name": "Max VERSTAPPEN", "team_name": "Red Bull Racing" },
            { "driver_number": 4, "full_name": "Lando NORRIS", "team_name": "McLaren" },
        ]);
        let rows = parse_results(&positions, &drivers);
        assert_eq!(rows.len(), 2, "unknown driver numbers are dropped");
        assert_eq!(rows[0].driver, "Lando NORRIS");
        assert_eq!(rows[0].position, Some(1));
        assert_eq!(rows[1].constructor.as_deref(), Some("Red Bull Racing"));
    }
}
