//! Dedup Store Gateway: the only path by which acquired and produced data is
//! persisted. Writes are idempotent on (event, category, natural key,
//! measured_at) and transient backend failures are retried with backoff.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::models::{AcquiredRecord, Event, EventKey, RecordCategory};
use crate::db::RecordStore;
use crate::error::StoreError;
use crate::retry::RetryPolicy;
use crate::sources::normalize::entity_key;

#[derive(Clone)]
pub struct StoreGateway {
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    /// Result rows that count as final when an event has no roster
    min_result_rows: usize,
}

impl StoreGateway {
    pub fn new(store: Arc<dyn RecordStore>, retry: RetryPolicy, min_result_rows: usize) -> Self {
        StoreGateway {
            store,
            retry,
            min_result_rows,
        }
    }

    /// Insert records not already present. Returns the number of new rows;
    /// re-submitting the same batch returns 0.
    pub async fn upsert(&self, records: &[AcquiredRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.insert_records(records) {
                Ok(inserted) => {
                    debug!(
                        "Stored {} new of {} submitted record(s)",
                        inserted,
                        records.len()
                    );
                    return Ok(inserted);
                }
                Err(StoreError::Transient(reason)) => {
                    if !self.retry.should_retry(attempt) {
                        return Err(StoreError::Unavailable {
                            attempts: attempt,
                            reason,
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!("Store busy ({}); retry {} in {:?}", reason, attempt, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Results are final when every rostered participant has a stored result
    /// row, or, without a roster, when at least `min_result_rows` exist.
    pub fn has_final_results(&self, event: &Event) -> Result<bool, StoreError> {
        let stored: HashSet<String> = self
            .store
            .record_entities(&event.key, RecordCategory::Result)?
            .iter()
            .map(|name| entity_key(name))
            .collect();
        if event.participants.is_empty() {
            return Ok(stored.len() >= self.min_result_rows.max(1));
        }
        Ok(event
            .participants
            .iter()
            .all(|p| stored.contains(&entity_key(p))))
    }

    /// Drop records whose content (value and fields) matches the newest stored
    /// row for the same identity. A later fetch that agrees with what is
    /// stored, from any source, is not new data; a correction is.
    pub fn changed_only(&self, records: Vec<AcquiredRecord>) -> Result<Vec<AcquiredRecord>, StoreError> {
        let mut stored: HashMap<(EventKey, RecordCategory), HashMap<String, AcquiredRecord>> = HashMap::new();
        let mut changed = Vec::with_capacity(records.len());
        for rec in records {
            let scope = (rec.event.clone(), rec.category);
            if !stored.contains_key(&scope) {
                let newest = self
                    .latest(&scope.0, scope.1)?
                    .into_iter()
                    .map(|r| (r.natural_key.clone(), r))
                    .collect();
                stored.insert(scope.clone(), newest);
            }
            let unchanged = stored
                .get(&scope)
                .and_then(|newest| newest.get(&rec.natural_key))
                .is_some_and(|prev| prev.value == rec.value && prev.fields == rec.fields);
            if !unchanged {
                changed.push(rec);
            }
        }
        Ok(changed)
    }

    /// Newest record per natural key, ordered by entity.
    pub fn latest(&self, event: &EventKey, category: RecordCategory) -> Result<Vec<AcquiredRecord>, StoreError> {
        let mut newest: HashMap<String, AcquiredRecord> = HashMap::new();
        for rec in self.store.records_for(event, category)? {
            match newest.get(&rec.natural_key) {
                Some(seen) if seen.measured_at >= rec.measured_at => {}
                _ => {
                    newest.insert(rec.natural_key.clone(), rec);
                }
            }
        }
        let mut out: Vec<AcquiredRecord> = newest.into_values().collect();
        out.sort_by(|a, b| a.entity.cmp(&b.entity).then_with(|| a.natural_key.cmp(&b.natural_key)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::EventStatus;
    use crate::db::Database;
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;

    fn event(participants: &[&str]) -> Event {
        Event {
            key: EventKey::new(2025, 14),
            name: "Hungarian Grand Prix".into(),
            start: "2025-08-03T13:00:00Z".parse().unwrap(),
            status: EventStatus::ResultsPending,
            participants: participants.iter().map(|p| p.to_string()).collect(),
            country: None,
            location: None,
        }
    }

    fn record(entity: &str, category: RecordCategory, value: f64, measured_at: DateTime<Utc>) -> AcquiredRecord {
        AcquiredRecord {
            id: None,
            event: EventKey::new(2025, 14),
            category,
            entity: entity.into(),
            natural_key: entity.to_lowercase(),
            value: Some(value),
            fields: json!({}),
            source: "test".into(),
            measured_at,
            fetched_at: Utc::now(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: StdDuration::from_millis(1),
            max_delay: StdDuration::from_millis(2),
            jitter: 0.0,
        }
    }

    fn gateway(min_rows: usize) -> StoreGateway {
        let db = Database::open(":memory:").unwrap();
        StoreGateway::new(Arc::new(db), fast_retry(), min_rows)
    }

    #[tokio::test]
    async fn resubmitting_a_batch_adds_nothing() {
        let gw = gateway(10);
        let t = Utc::now();
        let batch = vec![
            record("Max Verstappen", RecordCategory::Result, 1.0, t),
            record("Lando Norris", RecordCategory::Result, 2.0, t),
        ];
        assert_eq!(gw.upsert(&batch).await.unwrap(), 2);
        assert_eq!(gw.upsert(&batch).await.unwrap(), 0);
        assert_eq!(gw.latest(&EventKey::new(2025, 14), RecordCategory::Result).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn later_measurement_is_a_new_row_and_wins_latest() {
        let gw = gateway(10);
        let t = Utc::now();
        gw.upsert(&[record("Lando Norris", RecordCategory::Odds, 3.0, t)]).await.unwrap();
        let n = gw
            .upsert(&[record("Lando Norris", RecordCategory::Odds, 2.6, t + Duration::hours(48))])
            .await
            .unwrap();
        assert_eq!(n, 1);
        let latest = gw.latest(&EventKey::new(2025, 14), RecordCategory::Odds).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].value, Some(2.6));
    }

    #[tokio::test]
    async fn roster_completeness_decides_finality() {
        let gw = gateway(10);
        let t = Utc::now();
        let ev = event(&["Max Verstappen", "Lando Norris"]);
        gw.upsert(&[record("Max Verstappen", RecordCategory::Result, 1.0, t)]).await.unwrap();
        assert!(!gw.has_final_results(&ev).unwrap());
        gw.upsert(&[record("Lando Norris", RecordCategory::Result, 2.0, t)]).await.unwrap();
        assert!(gw.has_final_results(&ev).unwrap());
    }

    #[tokio::test]
    async fn rosterless_event_needs_minimum_rows() {
        let gw = gateway(3);
        let t = Utc::now();
        let ev = event(&[]);
        let rows: Vec<_> = ["A One", "B Two"]
            .iter()
            .map(|d| record(d, RecordCategory::Result, 1.0, t))
            .collect();
        gw.upsert(&rows).await.unwrap();
        assert!(!gw.has_final_results(&ev).unwrap());
        gw.upsert(&[record("C Three", RecordCategory::Result, 3.0, t)]).await.unwrap();
        assert!(gw.has_final_results(&ev).unwrap());
    }

    #[tokio::test]
    async fn untimestamped_quote_refetched_later_is_stored_once() {
        use crate::sources::normalize::normalize;
        use crate::sources::provider::{OddsQuote, SourcePayload};

        let gw = gateway(10);
        let ev = event(&[]);
        let due = ev.start - Duration::hours(72);
        let payload = SourcePayload::Odds(vec![OddsQuote {
            driver: "Lando Norris".into(),
            odds: 2.8,
            bookmaker: "file".into(),
            market: "winner".into(),
            quoted_at: None,
        }]);
        let first = normalize(payload.clone(), &ev, "file_drop", due, due);
        let second = normalize(payload, &ev, "file_drop", due, due + Duration::seconds(30));
        assert_eq!(gw.upsert(&first).await.unwrap(), 1);
        assert_eq!(gw.upsert(&second).await.unwrap(), 0);
        assert_eq!(gw.store.records_for(&ev.key, RecordCategory::Odds).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn agreeing_refetch_is_dropped_and_correction_kept() {
        let gw = gateway(10);
        let t = Utc::now();
        let mut first = vec![
            record("Max Verstappen", RecordCategory::Result, 1.0, t),
            record("Lando Norris", RecordCategory::Result, 2.0, t),
        ];
        first[0].source = "openf1".into();
        gw.upsert(&first).await.unwrap();

        // Another source two hours later: one row agrees, one is a correction
        let later = t + Duration::hours(2);
        let mut second = vec![
            record("Max Verstappen", RecordCategory::Result, 1.0, later),
            record("Lando Norris", RecordCategory::Result, 3.0, later),
        ];
        second.iter_mut().for_each(|r| r.source = "ergast".into());
        let changed = gw.changed_only(second).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].entity, "Lando Norris");
        assert_eq!(gw.upsert(&changed).await.unwrap(), 1);

        let latest = gw.latest(&EventKey::new(2025, 14), RecordCategory::Result).unwrap();
        let norris = latest.iter().find(|r| r.entity == "Lando Norris").unwrap();
        assert_eq!(norris.value, Some(3.0));
        assert_eq!(norris.source, "ergast");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_of_one_identity_store_one_row() {
        let gw = gateway(10);
        let rec = record("Oscar Piastri", RecordCategory::Result, 1.0, Utc::now());
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let gw = gw.clone();
                let rec = rec.clone();
                tokio::spawn(async move { gw.upsert(&[rec]).await })
            })
            .collect();
        let mut inserted = 0;
        for task in tasks {
            inserted += task.await.unwrap().unwrap();
        }
        assert_eq!(inserted, 1);
        assert_eq!(gw.store.records_for(&rec.event, RecordCategory::Result).unwrap().len(), 1);
    }

    /// Fails with a busy error for the first `failures` calls.
    struct FlakyStore {
        inner: Database,
        failures: u32,
        calls: AtomicU32,
    }

    impl RecordStore for FlakyStore {
        fn insert_records(&self, records: &[AcquiredRecord]) -> Result<usize, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::Transient("database is locked".into()));
            }
            self.inner.insert_records(records)
        }

        fn record_entities(&self, event: &EventKey, category: RecordCategory) -> Result<HashSet<String>, StoreError> {
            self.inner.record_entities(event, category)
        }

        fn records_for(&self, event: &EventKey, category: RecordCategory) -> Result<Vec<AcquiredRecord>, StoreError> {
            self.inner.records_for(event, category)
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: Database::open(":memory:").unwrap(),
            failures,
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn transient_store_errors_are_retried() {
        let store = flaky(2);
        let gw = StoreGateway::new(store.clone(), fast_retry(), 10);
        let n = gw
            .upsert(&[record("Max Verstappen", RecordCategory::Result, 1.0, Utc::now())])
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_unavailable() {
        let store = flaky(u32::MAX);
        let gw = StoreGateway::new(store.clone(), fast_retry(), 10);
        let err = gw
            .upsert(&[record("Max Verstappen", RecordCategory::Result, 1.0, Utc::now())])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { attempts: 3, .. }));
    }
}
