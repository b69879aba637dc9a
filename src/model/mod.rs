pub mod kelly;
pub mod recommend;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::db::models::{AcquiredRecord, Event, RecordCategory, RetrainSignal};
use crate::sources::normalize::{canonical_driver, entity_key};

/// Stored data handed to the model for one event.
#[derive(Debug, Clone, Default)]
pub struct PredictionInputs {
    /// Latest quote per (driver, bookmaker, market)
    pub odds: Vec<AcquiredRecord>,
    pub roster: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverProbability {
    pub driver: String,
    pub probability: f64,
}

/// Model output: a win probability per driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionArtifact {
    #[serde(default = "default_model_name")]
    pub model: String,
    pub probabilities: Vec<DriverProbability>,
}

fn default_model_name() -> String {
    "external".to_string()
}

/// Black-box prediction model.
#[async_trait]
pub trait ModelCollaborator: Send + Sync {
    async fn predict(&self, event: &Event, inputs: &PredictionInputs) -> Result<PredictionArtifact>;

    /// Deliver a retraining signal.
    async fn retrain(&self, signal: &RetrainSignal) -> Result<()>;

    fn name(&self) -> &str;
}

/// Prediction records for the store, one per driver, measured at `measured_at`.
pub fn artifact_records(
    artifact: &PredictionArtifact,
    event: &Event,
    measured_at: DateTime<Utc>,
) -> Vec<AcquiredRecord> {
    let now = Utc::now();
    artifact
        .probabilities
        .iter()
        .filter(|p| p.probability.is_finite() && (0.0..=1.0).contains(&p.probability))
        .map(|p| {
            let entity = canonical_driver(&p.driver);
            AcquiredRecord {
                id: None,
                event: event.key.clone(),
                category: RecordCategory::Prediction,
                natural_key: entity.to_lowercase(),
                entity,
                value: Some(p.probability),
                fields: json!({ "model": artifact.model }),
                source: artifact.model.clone(),
                measured_at,
                fetched_at: now,
            }
        })
        .collect()
}

// ── Odds-implied baseline ─────────────────────────────────────────────────────

/// Baseline model: mean implied probability per driver across bookmakers,
/// scaled so the field sums to one (removes the bookmaker margin).
pub struct ImpliedOddsModel;

#[async_trait]
impl ModelCollaborator for ImpliedOddsModel {
    fn name(&self) -> &str {
        "implied_odds"
    }

    async fn predict(&self, event: &Event, inputs: &PredictionInputs) -> Result<PredictionArtifact> {
        let mut implied: BTreeMap<String, (String, f64, u32)> = BTreeMap::new();
        for quote in &inputs.odds {
            let Some(price) = quote.value.filter(|p| *p > 1.0) else { continue };
            let entry = implied
                .entry(entity_key(&quote.entity))
                .or_insert_with(|| (quote.entity.clone(), 0.0, 0));
            entry.1 += kelly::implied_probability(price);
            entry.2 += 1;
        }
        if !inputs.roster.is_empty() {
            let roster: Vec<String> = inputs.roster.iter().map(|d| entity_key(d)).collect();
            implied.retain(|key, _| roster.contains(key));
        }
        let total: f64 = implied.values().map(|(_, sum, n)| sum / f64::from(*n)).sum();
        if implied.is_empty() || total <= 0.0 {
            anyhow::bail!("no usable odds for {}", event.key);
        }
        let probabilities = implied
            .into_values()
            .map(|(driver, sum, n)| DriverProbability {
                driver,
                probability: (sum / f64::from(n)) / total,
            })
            .collect();
        Ok(PredictionArtifact {
            model: self.name().to_string(),
            probabilities,
        })
    }

    async fn retrain(&self, signal: &RetrainSignal) -> Result<()> {
        info!(
            "implied_odds model has no parameters; retrain signal #{} acknowledged",
            signal.id
        );
        Ok(())
    }
}

// ── External model service ────────────────────────────────────────────────────

/// Model service reached over HTTP: `POST {base}/predict`, `POST {base}/retrain`.
pub struct HttpModel {
    http: Client,
    base_url: String,
}

impl HttpModel {
    pub fn new(http: Client, base_url: &str) -> Self {
        HttpModel {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ModelCollaborator for HttpModel {
    fn name(&self) -> &str {
        "http_model"
    }

    async fn predict(&self, event: &Event, inputs: &PredictionInputs) -> Result<PredictionArtifact> {
        let url = format!("{}/predict", self.base_url);
        let odds: Vec<serde_json::Value> = inputs
            .odds
            .iter()
            .map(|q| {
                json!({
                    "driver": q.entity,
                    "odds": q.value,
                    "bookmaker": q.fields["bookmaker"],
                    "measured_at": q.measured_at,
                })
            })
            .collect();
        let body = json!({ "event": event, "roster": inputs.roster, "odds": odds });
        debug!("POST {}", url);
        let artifact: PredictionArtifact = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Model predict request failed")?
            .error_for_status()
            .context("Model predict returned an error")?
            .json()
            .await
            .context("Failed to parse model prediction")?;
        Ok(artifact)
    }

    async fn retrain(&self, signal: &RetrainSignal) -> Result<()> {
        let url = format!("{}/retrain", self.base_url);
        self.http
            .post(&url)
            .json(signal)
            .send()
            .await
            .context("Model retrain request failed")?
            .error_for_status()
            .context("Model retrain returned an error")?;
        info!("Retrain signal #{} delivered to {}", signal.id, url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{EventKey, EventStatus};
    use approx::assert_relative_eq;

    fn event() -> Event {
        Event {
            key: EventKey::new(2025, 14),
            name: "Hungarian Grand Prix".into(),
            start: "2025-08-03T13:00:00Z".parse().unwrap(),
            status: EventStatus::Scheduled,
            participants: vec![],
            country: None,
            location: None,
        }
    }

    fn quote(driver: &str, odds: f64, book: &str) -> AcquiredRecord {
        AcquiredRecord {
            id: None,
            event: EventKey::new(2025, 14),
            category: RecordCategory::Odds,
            entity: driver.into(),
            natural_key: format!("{}@{}/winner", driver.to_lowercase(), book),
            value: Some(odds),
            fields: json!({ "bookmaker": book }),
            source: "odds_api".into(),
            measured_at: Utc::now(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn implied_model_removes_overround() {
        let inputs = PredictionInputs {
            odds: vec![
                quote("Lando Norris", 1.8, "pinnacle"),
                quote("Lando Norris", 2.2, "betfair"),
                quote("Oscar Piastri", 2.5, "pinnacle"),
            ],
            roster: vec![],
        };
        let artifact = ImpliedOddsModel.predict(&event(), &inputs).await.unwrap();
        let total: f64 = artifact.probabilities.iter().map(|p| p.probability).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        let norris = artifact
            .probabilities
            .iter()
            .find(|p| p.driver == "Lando Norris")
            .unwrap();
        // mean(1/1.8, 1/2.2) = 0.5051; Piastri 0.4; share = 0.5081
        assert_relative_eq!(norris.probability, 0.50505 / 0.90505, epsilon = 1e-4);
    }

    #[tokio::test]
    async fn roster_limits_the_field_and_empty_odds_fail() {
        let inputs = PredictionInputs {
            odds: vec![quote("Lando Norris", 2.0, "pinnacle"), quote("Guest Driver", 50.0, "pinnacle")],
            roster: vec!["NOR".into()],
        };
        let artifact = ImpliedOddsModel.predict(&event(), &inputs).await.unwrap();
        assert_eq!(artifact.probabilities.len(), 1);
        assert_relative_eq!(artifact.probabilities[0].probability, 1.0, epsilon = 1e-12);

        assert!(ImpliedOddsModel
            .predict(&event(), &PredictionInputs::default())
            .await
            .is_err());
    }

    #[test]
    fn artifact_records_drop_out_of_range_probabilities() {
        let artifact = PredictionArtifact {
            model: "implied_odds".into(),
            probabilities: vec![
                DriverProbability { driver: "VER".into(), probability: 0.3 },
                DriverProbability { driver: "Lando Norris".into(), probability: 1.7 },
            ],
        };
        let due = "2025-08-02T13:00:00Z".parse().unwrap();
        let records = artifact_records(&artifact, &event(), due);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity, "Max Verstappen");
        assert_eq!(records[0].measured_at, due);
        assert_eq!(records[0].source, "implied_odds");
    }
}
