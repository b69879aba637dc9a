use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::debug;

use crate::db::models::{Event, EventKey, EventStatus};
use crate::sources::http::endpoint;

/// External collaborator that supplies the season's race calendar.
#[async_trait]
pub trait CalendarSource: Send + Sync {
    async fn fetch_season(&self, season: i32) -> Result<Vec<Event>>;

    fn name(&self) -> &str;
}

/// Calendar entry as written in a JSON calendar file.
#[derive(Debug, Deserialize)]
struct CalendarEntry {
    season: Option<i32>,
    round: u32,
    name: String,
    start: DateTime<Utc>,
    #[serde(default)]
    participants: Vec<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

/// Operator-maintained JSON calendar (an array of entries).
pub struct JsonFileCalendar {
    path: PathBuf,
}

impl JsonFileCalendar {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileCalendar { path: path.into() }
    }
}

#[async_trait]
impl CalendarSource for JsonFileCalendar {
    fn name(&self) -> &str {
        "calendar-file"
    }

    async fn fetch_season(&self, season: i32) -> Result<Vec<Event>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read calendar {}", self.path.display()))?;
        parse_calendar_file(&text, season)
            .with_context(|| format!("Malformed calendar {}", self.path.display()))
    }
}

fn parse_calendar_file(text: &str, season: i32) -> Result<Vec<Event>> {
    let entries: Vec<CalendarEntry> = serde_json::from_str(text)?;
    Ok(entries
        .into_iter()
        .filter(|e| e.season.unwrap_or(season) == season)
        .map(|e| Event {
            key: EventKey::new(season, e.round),
            name: e.name,
            start: e.start,
            status: EventStatus::Scheduled,
            participants: e.participants,
            country: e.country,
            location: e.location,
        })
        .collect())
}

/// Season schedule from an Ergast-compatible API.
pub struct ErgastCalendar {
    http: Client,
    base_url: String,
}

impl ErgastCalendar {
    pub fn new(http: Client, base_url: &str) -> Self {
        ErgastCalendar {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CalendarSource for ErgastCalendar {
    fn name(&self) -> &str {
        "ergast-calendar"
    }

    async fn fetch_season(&self, season: i32) -> Result<Vec<Event>> {
        let url = endpoint(&self.base_url, &[&format!("{season}.json")], &[])?;
        debug!("Fetching calendar from {}", url);
        let resp = self.http.get(url).send().await.context("Calendar request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Calendar API error: {}", resp.status());
        }
        let raw: serde_json::Value = resp.json().await.context("Failed to parse calendar response")?;
        Ok(parse_ergast_schedule(&raw, season))
    }
}

fn parse_ergast_schedule(raw: &serde_json::Value, season: i32) -> Vec<Event> {
    raw["MRData"]["RaceTable"]["Races"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|race| {
            let round: u32 = race["round"].as_str()?.parse().ok()?;
            let date = NaiveDate::parse_from_str(race["date"].as_str()?, "%Y-%m-%d").ok()?;
            // Older seasons publish no start time; assume a 14:00 UTC start
            let time = race["time"]
                .as_str()
                .and_then(|t| NaiveTime::parse_from_str(t.trim_end_matches('Z'), "%H:%M:%S").ok())
                .or_else(|| NaiveTime::from_hms_opt(14, 0, 0))?;
            let location = &race["Circuit"]["Location"];
            Some(Event {
                key: EventKey::new(season, round),
                name: race["raceName"].as_str()?.to_string(),
                start: date.and_time(time).and_utc(),
                status: EventStatus::Scheduled,
                participants: vec![],
                country: location["country"].as_str().map(str::to_string),
                location: location["locality"].as_str().map(str::to_string),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ergast_schedule_with_and_without_time() {
        let raw = json!({ "MRData": { "RaceTable": { "Races": [
            {
                "round": "1", "raceName": "Australian Grand Prix",
                "date": "2025-03-16", "time": "04:00:00Z",
                "Circuit": { "Location": { "locality": "Melbourne", "country": "Australia" } }
            },
            { "round": "2", "raceName": "Chinese Grand Prix", "date": "2025-03-23" },
            { "round": "x", "raceName": "Broken", "date": "2025-03-30" }
        ]}}});
        let events = parse_ergast_schedule(&raw, 2025);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].start, "2025-03-16T04:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(events[0].country.as_deref(), Some("Australia"));
        assert_eq!(events[1].start, "2025-03-23T14:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert!(events.iter().all(|e| e.status == EventStatus::Scheduled));
    }

    #[test]
    fn file_calendar_filters_other_seasons() {
        let text = r#"[
            {"round": 1, "name": "Bahrain Grand Prix", "start": "2025-04-13T15:00:00Z",
             "participants": ["Max Verstappen", "Lando Norris"]},
            {"season": 2024, "round": 24, "name": "Abu Dhabi Grand Prix", "start": "2024-12-08T13:00:00Z"}
        ]"#;
        let events = parse_calendar_file(text, 2025).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, EventKey::new(2025, 1));
        assert_eq!(events[0].participants.len(), 2);
    }

    #[tokio::test]
    async fn missing_calendar_file_is_an_error() {
        let cal = JsonFileCalendar::new("/nonexistent/raceweek-calendar.json");
        assert!(cal.fetch_season(2025).await.is_err());
    }
}
