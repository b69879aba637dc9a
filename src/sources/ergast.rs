use async_trait::async_trait;
use reqwest::Client;

use super::http::{endpoint, get_json};
use super::provider::{ResultRow, SourceAdapter, SourcePayload};
use crate::db::models::{Event, RecordCategory};
use crate::error::FetchError;

/// Results provider for Ergast-compatible APIs (Jolpica by default).
pub struct Ergast {
    http: Client,
    base_url: String,
}

impl Ergast {
    pub fn new(http: Client, base_url: &str) -> Self {
        Ergast {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for Ergast {
    fn name(&self) -> &str {
        "ergast"
    }

    async fn fetch(&self, event: &Event, category: RecordCategory) -> Result<SourcePayload, FetchError> {
        if category != RecordCategory::Result {
            return Err(FetchError::Permanent(format!("ergast does not serve {category}")));
        }
        let season = event.key.season.to_string();
        let round = event.key.round.to_string();
        let url = endpoint(&self.base_url, &[&season, &round, "results.json"], &[])?;
        let raw = get_json(&self.http, url, "ergast results").await?;
        let rows = parse_results(&raw)?;
        if rows.is_empty() {
            return Err(FetchError::NotYetAvailable(format!(
                "no results published for {}",
                event.key
            )));
        }
        Ok(SourcePayload::Results(rows))
    }
}

fn parse_results(raw: &serde_json::Value) -> Result<Vec<ResultRow>, FetchError> {
    let races = raw["MRData"]["RaceTable"]["Races"]
        .as_array()
        .ok_or_else(|| FetchError::Permanent("ergast response has no RaceTable".into()))?;
    let Some(race) = races.first() else {
        return Ok(vec![]);
    };

    let rows = race["Results"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|r| {
            let driver = &r["Driver"];
            let name = format!(
                "{} {}",
                driver["givenName"].as_str()?,
                driver["familyName"].as_str()?
            );
            // positionText is "R"/"D"/"W" for unclassified finishers
            let classified = r["positionText"]
                .as_str()
                .map_or(true, |t| t.chars().all(|c| c.is_ascii_digit()));
            let position = r["position"]
                .as_str()
                .and_then(|p| p.parse().ok())
                .filter(|_| classified);
            Some(ResultRow {
                driver: name,
                position,
                points: r["points"].as_str().and_then(|p| p.parse().ok()),
                status: r["status"].as_str().map(str::to_string),
                constructor: r["Constructor"]["name"].as_str().map(str::to_string),
                grid: r["grid"].as_str().and_then(|g| g.parse().ok()),
            })
        })
        .collect();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_classified_and_retired_drivers() {
        let raw = json!({ "MRData": { "RaceTable": { "Races": [{
            "raceName": "Hungarian Grand Prix",
            "Results": [
                {
                    "position": "1", "positionText": "1", "points": "25", "grid": "3",
                    "status": "Finished",
                    "Driver": { "givenName": "Lando", "familyName": "Norris" },
                    "Constructor": { "name": "McLaren" }
                },
                {
                    "position": "20", "positionText": "R", "points": "0", "grid": "12",
                    "status": "Retired",
                    "Driver": { "givenName": "Lance", "familyName": "Stroll" },
                    "Constructor": { "name": "Aston Martin" }
                }
            ]
        }]}}});
        let rows = parse_results(&raw).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].driver, "Lando Norris");
        assert_eq!(rows[0].position, Some(1));
        assert_eq!(rows[0].points, Some(25.0));
        assert_eq!(rows[1].position, None);
        assert_eq!(rows[1].status.as_deref(), Some("Retired"));
    }

    #[test]
    fn empty_race_table_is_empty_not_error() {
        let raw = json!({ "MRData": { "RaceTable": { "Races": [] } } });
        assert!(parse_results(&raw).unwrap().is_empty());
    }

    #[test]
    fn malformed_document_is_permanent() {
        assert!(matches!(
            parse_results(&json!({ "oops": true })),
            Err(FetchError::Permanent(_))
        ));
    }
}
