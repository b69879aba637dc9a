use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

use super::kelly::{expected_value, kelly_fraction};
use crate::db::models::{AcquiredRecord, Event, RecordCategory};
use crate::sources::normalize::entity_key;

/// Value-bet filter and stake sizing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Criteria {
    /// Minimum expected profit on a full `stake`
    pub min_ev: f64,
    pub min_probability: f64,
    pub min_odds: f64,
    /// Stake budget per bet
    pub stake: f64,
    /// Fractional Kelly multiplier
    pub kelly_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub driver: String,
    pub probability: f64,
    pub odds: f64,
    pub bookmaker: String,
    pub expected_value: f64,
    pub stake: f64,
}

/// Pair each predicted driver with the best available price and keep the
/// bets passing every criterion, best expected value first.
pub fn recommend(predictions: &[AcquiredRecord], odds: &[AcquiredRecord], criteria: &Criteria) -> Vec<Recommendation> {
    let mut best: HashMap<String, (f64, String)> = HashMap::new();
    for quote in odds.iter().filter(|r| r.category == RecordCategory::Odds) {
        let Some(price) = quote.value else { continue };
        let bookmaker = quote.fields["bookmaker"].as_str().unwrap_or(&quote.source).to_string();
        let key = entity_key(&quote.entity);
        match best.get(&key) {
            Some((seen, _)) if *seen >= price => {}
            _ => {
                best.insert(key, (price, bookmaker));
            }
        }
    }

    let mut picks: Vec<Recommendation> = predictions
        .iter()
        .filter_map(|pred| {
            let p = pred.value?;
            let (price, bookmaker) = best.get(&entity_key(&pred.entity))?;
            let ev = expected_value(p, *price, criteria.stake);
            if ev <= criteria.min_ev || p <= criteria.min_probability || *price <= criteria.min_odds {
                return None;
            }
            let stake = round_cents(criteria.stake * kelly_fraction(p, *price, criteria.kelly_fraction));
            (stake > 0.0).then(|| Recommendation {
                driver: pred.entity.clone(),
                probability: p,
                odds: *price,
                bookmaker: bookmaker.clone(),
                expected_value: round_cents(ev),
                stake,
            })
        })
        .collect();
    picks.sort_by(|a, b| b.expected_value.total_cmp(&a.expected_value));
    picks
}

/// Persistable form; measured at the trigger's due instant so a repeated
/// dispatch dedups.
pub fn recommendation_records(
    picks: &[Recommendation],
    event: &Event,
    measured_at: DateTime<Utc>,
) -> Vec<AcquiredRecord> {
    let now = Utc::now();
    picks
        .iter()
        .map(|r| AcquiredRecord {
            id: None,
            event: event.key.clone(),
            category: RecordCategory::Recommendation,
            entity: r.driver.clone(),
            natural_key: entity_key(&r.driver),
            value: Some(r.stake),
            fields: json!({
                "probability": r.probability,
                "odds": r.odds,
                "bookmaker": r.bookmaker,
                "expected_value": r.expected_value,
            }),
            source: "recommender".to_string(),
            measured_at,
            fetched_at: now,
        })
        .collect()
}

fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::EventKey;
    use approx::assert_relative_eq;

    fn rec(category: RecordCategory, driver: &str, value: f64, bookmaker: &str) -> AcquiredRecord {
        AcquiredRecord {
            id: None,
            event: EventKey::new(2025, 14),
            category,
            entity: driver.into(),
            natural_key: driver.to_lowercase(),
            value: Some(value),
            fields: json!({ "bookmaker": bookmaker }),
            source: "test".into(),
            measured_at: Utc::now(),
            fetched_at: Utc::now(),
        }
    }

    fn criteria() -> Criteria {
        Criteria {
            min_ev: 0.0,
            min_probability: 0.15,
            min_odds: 2.5,
            stake: 10.0,
            kelly_fraction: 0.25,
        }
    }

    #[test]
    fn picks_value_bets_at_best_price() {
        let preds = vec![
            rec(RecordCategory::Prediction, "Oscar Piastri", 0.30, ""),
            rec(RecordCategory::Prediction, "Lando Norris", 0.40, ""),
        ];
        let odds = vec![
            rec(RecordCategory::Odds, "Oscar Piastri", 3.5, "pinnacle"),
            rec(RecordCategory::Odds, "Oscar Piastri", 4.0, "betfair"),
            rec(RecordCategory::Odds, "Lando Norris", 2.2, "pinnacle"),
        ];
        let picks = recommend(&preds, &odds, &criteria());
        // Norris fails min_odds; Piastri at 4.0: EV = 0.3*3*10 - 0.7*10 = 2.0
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].bookmaker, "betfair");
        assert_relative_eq!(picks[0].expected_value, 2.0, epsilon = 1e-9);
        // kelly = (3*0.3 - 0.7)/3 = 0.0667; *0.25*10 = 0.17
        assert_relative_eq!(picks[0].stake, 0.17, epsilon = 1e-9);
    }

    #[test]
    fn low_probability_and_negative_ev_are_dropped() {
        let preds = vec![
            rec(RecordCategory::Prediction, "Lance Stroll", 0.05, ""),
            rec(RecordCategory::Prediction, "Charles Leclerc", 0.20, ""),
        ];
        let odds = vec![
            rec(RecordCategory::Odds, "Lance Stroll", 101.0, "pinnacle"),
            rec(RecordCategory::Odds, "Charles Leclerc", 4.0, "pinnacle"),
        ];
        assert!(recommend(&preds, &odds, &criteria()).is_empty());
    }

    #[test]
    fn records_use_given_measurement_instant() {
        let ev = Event {
            key: EventKey::new(2025, 14),
            name: "Hungarian Grand Prix".into(),
            start: "2025-08-03T13:00:00Z".parse().unwrap(),
            status: crate::db::models::EventStatus::Scheduled,
            participants: vec![],
            country: None,
            location: None,
        };
        let due = "2025-08-02T14:00:00Z".parse().unwrap();
        let picks = vec![Recommendation {
            driver: "Oscar Piastri".into(),
            probability: 0.3,
            odds: 4.0,
            bookmaker: "betfair".into(),
            expected_value: 2.0,
            stake: 0.17,
        }];
        let records = recommendation_records(&picks, &ev, due);
        assert_eq!(records[0].measured_at, due);
        assert_eq!(records[0].natural_key, "oscar piastri");
        assert_eq!(records[0].category, RecordCategory::Recommendation);
    }
}
