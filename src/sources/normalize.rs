//! Maps provider payloads into the shared `AcquiredRecord` shape. The store
//! never sees source-specific formats.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;

use super::provider::{OddsQuote, ResultRow, SourcePayload};
use crate::db::models::{AcquiredRecord, Event, RecordCategory};

/// Surname / timing-code aliases to full driver names.
const DRIVER_ALIASES: &[(&str, &str)] = &[
    ("verstappen", "Max Verstappen"),
    ("ver", "Max Verstappen"),
    ("norris", "Lando Norris"),
    ("nor", "Lando Norris"),
    ("leclerc", "Charles Leclerc"),
    ("lec", "Charles Leclerc"),
    ("piastri", "Oscar Piastri"),
    ("pia", "Oscar Piastri"),
    ("sainz", "Carlos Sainz"),
    ("sai", "Carlos Sainz"),
    ("hamilton", "Lewis Hamilton"),
    ("ham", "Lewis Hamilton"),
    ("russell", "George Russell"),
    ("rus", "George Russell"),
    ("alonso", "Fernando Alonso"),
    ("alo", "Fernando Alonso"),
    ("stroll", "Lance Stroll"),
    ("str", "Lance Stroll"),
    ("gasly", "Pierre Gasly"),
    ("gas", "Pierre Gasly"),
    ("ocon", "Esteban Ocon"),
    ("oco", "Esteban Ocon"),
    ("hulkenberg", "Nico Hulkenberg"),
    ("hülkenberg", "Nico Hulkenberg"),
    ("hul", "Nico Hulkenberg"),
    ("tsunoda", "Yuki Tsunoda"),
    ("tsu", "Yuki Tsunoda"),
    ("lawson", "Liam Lawson"),
    ("law", "Liam Lawson"),
    ("albon", "Alexander Albon"),
    ("alb", "Alexander Albon"),
    ("colapinto", "Franco Colapinto"),
    ("col", "Franco Colapinto"),
    ("bearman", "Oliver Bearman"),
    ("bea", "Oliver Bearman"),
    ("antonelli", "Andrea Kimi Antonelli"),
    ("ant", "Andrea Kimi Antonelli"),
    ("bortoleto", "Gabriel Bortoleto"),
    ("bor", "Gabriel Bortoleto"),
    ("hadjar", "Isack Hadjar"),
    ("had", "Isack Hadjar"),
    ("doohan", "Jack Doohan"),
    ("doo", "Jack Doohan"),
    ("bottas", "Valtteri Bottas"),
    ("bot", "Valtteri Bottas"),
    ("zhou", "Zhou Guanyu"),
    ("zho", "Zhou Guanyu"),
    ("magnussen", "Kevin Magnussen"),
    ("mag", "Kevin Magnussen"),
    ("perez", "Sergio Perez"),
    ("pérez", "Sergio Perez"),
    ("per", "Sergio Perez"),
];

/// Canonical display form of a driver name: known aliases resolve to the
/// full name, anything else is whitespace-collapsed and title-cased.
pub fn canonical_driver(raw: &str) -> String {
    let tokens: Vec<String> = raw.split_whitespace().map(str::to_lowercase).collect();
    // Prefer the last token (surname / code) so "M. Verstappen" resolves too
    for token in tokens.iter().rev() {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric());
        if let Some((_, full)) = DRIVER_ALIASES.iter().find(|(alias, _)| *alias == token) {
            return full.to_string();
        }
    }
    tokens
        .iter()
        .map(|t| {
            let mut chars = t.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case-insensitive identity used for keys and roster comparison.
pub fn entity_key(name: &str) -> String {
    canonical_driver(name).to_lowercase()
}

/// Turn a provider payload into normalized records tagged with provenance.
/// Results, and quotes without a timestamp, are measured at `observed_at`.
pub fn normalize(
    payload: SourcePayload,
    event: &Event,
    source: &str,
    observed_at: DateTime<Utc>,
    fetched_at: DateTime<Utc>,
) -> Vec<AcquiredRecord> {
    let mut seen = HashSet::new();
    let records: Vec<AcquiredRecord> = match payload {
        SourcePayload::Results(rows) => rows
            .into_iter()
            .filter_map(|row| result_record(row, event, source, observed_at, fetched_at))
            .collect(),
        SourcePayload::Odds(quotes) => quotes
            .into_iter()
            .filter_map(|q| odds_record(q, event, source, observed_at, fetched_at))
            .collect(),
    };
    // One row per identity within a single payload; first occurrence wins
    records
        .into_iter()
        .filter(|r| seen.insert((r.natural_key.clone(), r.measured_at)))
        .collect()
}

fn result_record(
    row: ResultRow,
    event: &Event,
    source: &str,
    observed_at: DateTime<Utc>,
    fetched_at: DateTime<Utc>,
) -> Option<AcquiredRecord> {
    if row.driver.trim().is_empty() {
        return None;
    }
    let entity = canonical_driver(&row.driver);
    Some(AcquiredRecord {
        id: None,
        event: event.key.clone(),
        category: RecordCategory::Result,
        natural_key: entity.to_lowercase(),
        entity,
        value: row.position.map(f64::from),
        fields: json!({
            "position": row.position,
            "points": row.points,
            "status": row.status,
            "constructor": row.constructor,
            "grid": row.grid,
        }),
        source: source.to_string(),
        measured_at: observed_at,
        fetched_at,
    })
}

fn odds_record(
    quote: OddsQuote,
    event: &Event,
    source: &str,
    observed_at: DateTime<Utc>,
    fetched_at: DateTime<Utc>,
) -> Option<AcquiredRecord> {
    if quote.driver.trim().is_empty() || !quote.odds.is_finite() || quote.odds <= 1.0 {
        return None;
    }
    let entity = canonical_driver(&quote.driver);
    let bookmaker = quote.bookmaker.trim().to_lowercase();
    let market = quote.market.trim().to_lowercase();
    Some(AcquiredRecord {
        id: None,
        event: event.key.clone(),
        category: RecordCategory::Odds,
        natural_key: format!("{}@{}/{}", entity.to_lowercase(), bookmaker, market),
        entity,
        value: Some(quote.odds),
        fields: json!({ "bookmaker": bookmaker, "market": market }),
        source: source.to_string(),
        measured_at: quote.quoted_at.unwrap_or(observed_at),
        fetched_at,
    })
}
