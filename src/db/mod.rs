use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StoreError;

pub mod models;
use models::*;

/// Abstract key-indexed record table. The Dedup Store Gateway only talks to
/// storage through this trait.
pub trait RecordStore: Send + Sync {
    /// Insert every record whose identity key is not yet present, atomically.
    /// Returns how many rows were actually inserted.
    fn insert_records(&self, records: &[AcquiredRecord]) -> Result<usize, StoreError>;

    /// Distinct entity names stored for an event and category.
    fn record_entities(
        &self,
        event: &EventKey,
        category: RecordCategory,
    ) -> Result<HashSet<String>, StoreError>;

    /// Every stored record for an event and category, oldest first.
    fn records_for(
        &self,
        event: &EventKey,
        category: RecordCategory,
    ) -> Result<Vec<AcquiredRecord>, StoreError>;
}

/// Thread-safe SQLite connection pool (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Result of one atomic retrain-counter step.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterStep {
    /// The event had already been counted; nothing changed.
    AlreadyCounted { count: u32 },
    Incremented { count: u32 },
    Signalled(RetrainSignal),
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("connection mutex poisoned".into()))
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Insert a calendar event, or refresh its calendar attributes while
    /// keeping the lifecycle status already recorded.
    pub fn upsert_event(&self, ev: &Event) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events (id, season, round, name, start_at, status,
                                 participants, country, location)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                start_at=excluded.start_at,
                participants=excluded.participants,
                country=excluded.country,
                location=excluded.location",
            params![
                ev.key.id(),
                ev.key.season,
                ev.key.round,
                ev.name,
                ev.start,
                ev.status,
                serde_json::to_string(&ev.participants)?,
                ev.country,
                ev.location,
            ],
        )?;
        Ok(())
    }

    pub fn list_events(&self) -> Result<Vec<Event>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT season, round, name, start_at, status, participants, country, location
             FROM events ORDER BY start_at ASC",
        )?;
        let events = stmt
            .query_map([], map_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn update_event_status(&self, key: &EventKey, status: EventStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE events SET status=?1 WHERE id=?2",
            params![status, key.id()],
        )?;
        if changed == 0 {
            return Err(StoreError::Backend(format!("event {key} not persisted")));
        }
        Ok(())
    }

    // ── Trigger firings ───────────────────────────────────────────────────────

    /// Write a firing record unless one already exists for the pair.
    /// Returns `false` when the ledger already had it.
    pub fn insert_firing(&self, rec: &FiringRecord) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO trigger_firings
                (event_id, category, offset_secs, fired_at, outcome, detail)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                rec.event.id(),
                rec.trigger.category,
                rec.trigger.offset_secs,
                rec.fired_at,
                rec.outcome,
                rec.detail,
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn find_firing(
        &self,
        event: &EventKey,
        trigger: &TriggerDefinition,
    ) -> Result<Option<FiringRecord>, StoreError> {
        let conn = self.lock()?;
        let rec = conn
            .query_row(
                "SELECT event_id, category, offset_secs, fired_at, outcome, detail
                 FROM trigger_firings
                 WHERE event_id=?1 AND category=?2 AND offset_secs=?3",
                params![event.id(), trigger.category, trigger.offset_secs],
                map_firing,
            )
            .optional()?;
        Ok(rec)
    }

    pub fn list_firings(&self, limit: i64) -> Result<Vec<FiringRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, category, offset_secs, fired_at, outcome, detail
             FROM trigger_firings ORDER BY fired_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], map_firing)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Administrative reset: removes a terminal firing record so the trigger
    /// becomes pending again. Returns whether a record existed.
    pub fn delete_firing(
        &self,
        event: &EventKey,
        trigger: &TriggerDefinition,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM trigger_firings WHERE event_id=?1 AND category=?2 AND offset_secs=?3",
            params![event.id(), trigger.category, trigger.offset_secs],
        )?;
        Ok(deleted > 0)
    }

    // ── Acquired records ──────────────────────────────────────────────────────

    /// List recent records, optionally narrowed to an event and category.
    pub fn list_records(
        &self,
        event: Option<&EventKey>,
        category: Option<RecordCategory>,
        limit: i64,
    ) -> Result<Vec<AcquiredRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_id, category, entity, natural_key, value, fields,
                    source, measured_at, fetched_at
             FROM acquired_records
             WHERE (?1 IS NULL OR event_id=?1) AND (?2 IS NULL OR category=?2)
             ORDER BY fetched_at DESC, id DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![event.map(|e| e.id()), category, limit], map_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Retrain counter ───────────────────────────────────────────────────────

    pub fn retrain_state(&self) -> Result<RetrainState, StoreError> {
        let conn = self.lock()?;
        let state = conn.query_row(
            "SELECT events_since_retrain, last_signal_at FROM retrain_counter WHERE id=1",
            [],
            |row| {
                Ok(RetrainState {
                    events_since_retrain: row.get(0)?,
                    last_signal_at: row.get(1)?,
                })
            },
        )?;
        Ok(state)
    }

    /// Count `event` once toward the retrain threshold. Increment, threshold
    /// check, signal write and reset happen in one IMMEDIATE transaction.
    pub fn count_finalized_event(
        &self,
        event: &EventKey,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<CounterStep, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let newly_counted = tx.execute(
            "INSERT OR IGNORE INTO retrain_ledger (event_id, counted_at) VALUES (?1, ?2)",
            params![event.id(), now],
        )? == 1;

        let current: u32 = tx.query_row(
            "SELECT events_since_retrain FROM retrain_counter WHERE id=1",
            [],
            |row| row.get(0),
        )?;

        if !newly_counted {
            tx.commit()?;
            return Ok(CounterStep::AlreadyCounted { count: current });
        }

        let count = current + 1;
        let step = if count >= threshold {
            tx.execute(
                "INSERT INTO retrain_signals (events_counted, triggered_by, emitted_at)
                 VALUES (?1, ?2, ?3)",
                params![count, event.id(), now],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE retrain_counter SET events_since_retrain=0, last_signal_at=?1 WHERE id=1",
                params![now],
            )?;
            CounterStep::Signalled(RetrainSignal {
                id,
                events_counted: count,
                triggered_by: event.clone(),
                emitted_at: now,
            })
        } else {
            tx.execute(
                "UPDATE retrain_counter SET events_since_retrain=?1 WHERE id=1",
                params![count],
            )?;
            CounterStep::Incremented { count }
        };
        tx.commit()?;
        Ok(step)
    }

    /// Events marked `results_final` that never reached the retrain ledger,
    /// e.g. after a crash between the status write and the counter step.
    pub fn uncounted_final_events(&self) -> Result<Vec<EventKey>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT e.season, e.round FROM events e
             LEFT JOIN retrain_ledger l ON l.event_id = e.id
             WHERE e.status='results_final' AND l.event_id IS NULL
             ORDER BY e.start_at ASC",
        )?;
        let keys = stmt
            .query_map([], |row| Ok(EventKey::new(row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    pub fn recent_retrain_signals(&self, limit: i64) -> Result<Vec<RetrainSignal>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, events_counted, triggered_by, emitted_at
             FROM retrain_signals ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(RetrainSignal {
                    id: row.get(0)?,
                    events_counted: row.get(1)?,
                    triggered_by: parse_event_id(&row.get::<_, String>(2)?)?,
                    emitted_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl RecordStore for Database {
    fn insert_records(&self, records: &[AcquiredRecord]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO acquired_records (
                    event_id, category, entity, natural_key, value, fields,
                    source, measured_at, fetched_at
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            )?;
            for rec in records {
                inserted += stmt.execute(params![
                    rec.event.id(),
                    rec.category,
                    rec.entity,
                    rec.natural_key,
                    rec.value,
                    rec.fields.to_string(),
                    rec.source,
                    rec.measured_at,
                    rec.fetched_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn record_entities(
        &self,
        event: &EventKey,
        category: RecordCategory,
    ) -> Result<HashSet<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT entity FROM acquired_records WHERE event_id=?1 AND category=?2",
        )?;
        let names = stmt
            .query_map(params![event.id(), category], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(names)
    }

    fn records_for(
        &self,
        event: &EventKey,
        category: RecordCategory,
    ) -> Result<Vec<AcquiredRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_id, category, entity, natural_key, value, fields,
                    source, measured_at, fetched_at
             FROM acquired_records WHERE event_id=?1 AND category=?2
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![event.id(), category], map_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn parse_event_id(id: &str) -> rusqlite::Result<EventKey> {
    EventKey::parse_id(id).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad event id '{id}'").into(),
        )
    })
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn map_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let participants: String = row.get(5)?;
    Ok(Event {
        key: EventKey::new(row.get(0)?, row.get(1)?),
        name: row.get(2)?,
        start: row.get(3)?,
        status: row.get(4)?,
        participants: json_column(5, &participants)?,
        country: row.get(6)?,
        location: row.get(7)?,
    })
}

fn map_firing(row: &rusqlite::Row) -> rusqlite::Result<FiringRecord> {
    Ok(FiringRecord {
        event: parse_event_id(&row.get::<_, String>(0)?)?,
        trigger: TriggerDefinition {
            category: row.get(1)?,
            offset_secs: row.get(2)?,
        },
        fired_at: row.get(3)?,
        outcome: row.get(4)?,
        detail: row.get(5)?,
    })
}

fn map_record(row: &rusqlite::Row) -> rusqlite::Result<AcquiredRecord> {
    let fields: String = row.get(6)?;
    Ok(AcquiredRecord {
        id: row.get(0)?,
        event: parse_event_id(&row.get::<_, String>(1)?)?,
        category: row.get(2)?,
        entity: row.get(3)?,
        natural_key: row.get(4)?,
        value: row.get(5)?,
        fields: json_column(6, &fields)?,
        source: row.get(7)?,
        measured_at: row.get(8)?,
        fetched_at: row.get(9)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id           TEXT    PRIMARY KEY,
    season       INTEGER NOT NULL,
    round        INTEGER NOT NULL,
    name         TEXT    NOT NULL,
    start_at     TEXT    NOT NULL,
    status       TEXT    NOT NULL DEFAULT 'scheduled',
    participants TEXT    NOT NULL DEFAULT '[]',
    country      TEXT,
    location     TEXT
);

CREATE TABLE IF NOT EXISTS trigger_firings (
    event_id    TEXT    NOT NULL,
    category    TEXT    NOT NULL,
    offset_secs INTEGER NOT NULL,
    fired_at    TEXT    NOT NULL,
    outcome     TEXT    NOT NULL,
    detail      TEXT,
    PRIMARY KEY (event_id, category, offset_secs)
);

CREATE TABLE IF NOT EXISTS acquired_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id    TEXT    NOT NULL,
    category    TEXT    NOT NULL,
    entity      TEXT    NOT NULL,
    natural_key TEXT    NOT NULL,
    value       REAL,
    fields      TEXT    NOT NULL DEFAULT '{}',
    source      TEXT    NOT NULL,
    measured_at TEXT    NOT NULL,
    fetched_at  TEXT    NOT NULL,
    UNIQUE (event_id, category, natural_key, measured_at)
);

CREATE TABLE IF NOT EXISTS retrain_counter (
    id                   INTEGER PRIMARY KEY CHECK (id = 1),
    events_since_retrain INTEGER NOT NULL DEFAULT 0,
    last_signal_at       TEXT
);
INSERT OR IGNORE INTO retrain_counter (id, events_since_retrain) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS retrain_ledger (
    event_id   TEXT PRIMARY KEY,
    counted_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS retrain_signals (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    events_counted INTEGER NOT NULL,
    triggered_by   TEXT    NOT NULL,
    emitted_at     TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_start ON events(start_at);
CREATE INDEX IF NOT EXISTS idx_records_event ON acquired_records(event_id, category);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(round: u32) -> Event {
        Event {
            key: EventKey::new(2025, round),
            name: format!("Round {round} Grand Prix"),
            start: "2025-08-03T13:00:00Z".parse().unwrap(),
            status: EventStatus::Scheduled,
            participants: vec!["Max Verstappen".into(), "Lando Norris".into()],
            country: Some("Hungary".into()),
            location: None,
        }
    }

    #[test]
    fn upsert_event_preserves_status() {
        let db = Database::open(":memory:").unwrap();
        let ev = event(13);
        db.upsert_event(&ev).unwrap();
        db.update_event_status(&ev.key, EventStatus::InProgress).unwrap();

        let mut refreshed = ev.clone();
        refreshed.name = "Hungarian Grand Prix".into();
        db.upsert_event(&refreshed).unwrap();

        let events = db.list_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "Hungarian Grand Prix");
        assert_eq!(events[0].status, EventStatus::InProgress);
        assert_eq!(events[0].participants.len(), 2);
    }

    #[test]
    fn firing_insert_is_first_writer_wins() {
        let db = Database::open(":memory:").unwrap();
        let trigger = TriggerDefinition::new(TriggerCategory::OddsFetch, Duration::hours(-72));
        let rec = FiringRecord {
            event: EventKey::new(2025, 13),
            trigger,
            fired_at: Utc::now(),
            outcome: FiringOutcome::Success,
            detail: None,
        };
        assert!(db.insert_firing(&rec).unwrap());
        let mut second = rec.clone();
        second.outcome = FiringOutcome::Failure;
        assert!(!db.insert_firing(&second).unwrap());

        let stored = db.find_firing(&rec.event, &trigger).unwrap().unwrap();
        assert_eq!(stored.outcome, FiringOutcome::Success);

        assert!(db.delete_firing(&rec.event, &trigger).unwrap());
        assert!(db.find_firing(&rec.event, &trigger).unwrap().is_none());
    }

    #[test]
    fn counter_counts_each_event_once() {
        let db = Database::open(":memory:").unwrap();
        let now = Utc::now();
        let key = EventKey::new(2025, 1);
        assert_eq!(
            db.count_finalized_event(&key, 3, now).unwrap(),
            CounterStep::Incremented { count: 1 }
        );
        assert_eq!(
            db.count_finalized_event(&key, 3, now).unwrap(),
            CounterStep::AlreadyCounted { count: 1 }
        );
        assert_eq!(db.retrain_state().unwrap().events_since_retrain, 1);
    }

    #[test]
    fn uncounted_final_events_finds_gaps() {
        let db = Database::open(":memory:").unwrap();
        let ev = event(5);
        db.upsert_event(&ev).unwrap();
        db.update_event_status(&ev.key, EventStatus::ResultsFinal).unwrap();
        assert_eq!(db.uncounted_final_events().unwrap(), vec![ev.key.clone()]);

        db.count_finalized_event(&ev.key, 10, Utc::now()).unwrap();
        assert!(db.uncounted_final_events().unwrap().is_empty());
    }
}
