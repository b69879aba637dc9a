//! Action Scheduler: decides which (event, trigger) pairs are due and
//! dispatches each one at most once, using `trigger_firings` as the
//! idempotency ledger.
//!
//! ```text
//!   pending ──(due, status ok)──▶ dispatch ──▶ fired(success | failure | skipped)
//!      ▲                              │
//!      └──────── NotYetAvailable ─────┘   (no record; re-evaluated next pass)
//! ```

pub mod triggers;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::models::{
    Event, EventKey, EventStatus, FiringOutcome, FiringRecord, TriggerCategory, TriggerDefinition,
};
use crate::db::Database;
use crate::error::StoreError;
use triggers::label;

/// Where a single (event, trigger) pair stands right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    NotYetDue,
    /// Due by the clock, but the event's status does not allow it yet
    AwaitingStatus,
    Due,
    /// Pre-event trigger whose event has already started
    Expired,
    Fired(FiringOutcome),
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerState::NotYetDue => f.write_str("not_yet_due"),
            TriggerState::AwaitingStatus => f.write_str("awaiting_status"),
            TriggerState::Due => f.write_str("due"),
            TriggerState::Expired => f.write_str("expired"),
            TriggerState::Fired(outcome) => write!(f, "fired({outcome})"),
        }
    }
}

/// What an action handler reports back for one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Completed(String),
    Skipped(String),
    /// Nothing to act on yet; the trigger stays pending.
    NotYetAvailable(String),
    Failed(String),
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, event: &Event, trigger: &TriggerDefinition, due_at: DateTime<Utc>) -> ActionOutcome;
}

/// A trigger selected for this pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFiring {
    pub event: Event,
    pub trigger: TriggerDefinition,
    pub due_at: DateTime<Utc>,
    /// Recorded as skipped without dispatch
    pub expired: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub expired: usize,
    /// Dispatched but left pending (not yet available)
    pub deferred: usize,
    /// Firing records that could not be written; those triggers stay pending
    pub ledger_errors: usize,
}

impl PassReport {
    fn absorb(&mut self, other: PassReport) {
        self.dispatched += other.dispatched;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.expired += other.expired;
        self.deferred += other.deferred;
        self.ledger_errors += other.ledger_errors;
    }
}

#[derive(Clone)]
pub struct ActionScheduler {
    db: Database,
    triggers: Arc<Vec<TriggerDefinition>>,
    max_concurrent: usize,
}

impl ActionScheduler {
    pub fn new(db: Database, triggers: Vec<TriggerDefinition>, max_concurrent: usize) -> Self {
        ActionScheduler {
            db,
            triggers: Arc::new(triggers),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn triggers(&self) -> &[TriggerDefinition] {
        &self.triggers
    }

    pub fn evaluate(
        &self,
        event: &Event,
        trigger: &TriggerDefinition,
        now: DateTime<Utc>,
    ) -> Result<TriggerState, StoreError> {
        if let Some(rec) = self.db.find_firing(&event.key, trigger)? {
            return Ok(TriggerState::Fired(rec.outcome));
        }
        if now < trigger.due_at(event.start) {
            return Ok(TriggerState::NotYetDue);
        }
        let state = match (trigger.category, event.status) {
            (TriggerCategory::ResultsFetch, EventStatus::Scheduled) => TriggerState::AwaitingStatus,
            (category, status) if category.is_pre_event() && status != EventStatus::Scheduled => {
                TriggerState::Expired
            }
            _ => TriggerState::Due,
        };
        Ok(state)
    }

    /// Due by the clock, not yet fired, and compatible with the event status.
    pub fn is_due(&self, event: &Event, trigger: &TriggerDefinition, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.evaluate(event, trigger, now)? == TriggerState::Due)
    }

    /// Every trigger to act on this pass, ordered by offset ascending, then
    /// event start, then event key.
    pub fn due_triggers(&self, events: &[Event], now: DateTime<Utc>) -> Result<Vec<PlannedFiring>, StoreError> {
        let mut planned = Vec::new();
        for event in events {
            for trigger in self.triggers.iter() {
                let expired = match self.evaluate(event, trigger, now)? {
                    TriggerState::Due => false,
                    TriggerState::Expired => true,
                    _ => continue,
                };
                planned.push(PlannedFiring {
                    event: event.clone(),
                    trigger: *trigger,
                    due_at: trigger.due_at(event.start),
                    expired,
                });
            }
        }
        planned.sort_by(|a, b| {
            a.trigger
                .offset_secs
                .cmp(&b.trigger.offset_secs)
                .then_with(|| a.event.start.cmp(&b.event.start))
                .then_with(|| a.event.key.cmp(&b.event.key))
                .then_with(|| a.trigger.category.cmp(&b.trigger.category))
        });
        Ok(planned)
    }

    /// Run one scheduling pass. Triggers of the same event dispatch in order
    /// so later actions see earlier ones' data; distinct events run
    /// concurrently up to `max_concurrent`. A failing or panicking handler
    /// only affects its own trigger.
    pub async fn run_pass(
        &self,
        events: &[Event],
        now: DateTime<Utc>,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<PassReport, StoreError> {
        let planned = self.due_triggers(events, now)?;
        if planned.is_empty() {
            debug!("No triggers due");
            return Ok(PassReport::default());
        }

        let mut report = PassReport::default();
        let mut groups: Vec<(EventKey, Vec<PlannedFiring>)> = Vec::new();
        for p in planned {
            if p.expired {
                let detail = format!("event already {}", p.event.status);
                match self.record(&p, FiringOutcome::Skipped, Some(detail)) {
                    Ok(()) => report.expired += 1,
                    Err(_) => report.ledger_errors += 1,
                }
                continue;
            }
            match groups.iter().position(|(key, _)| *key == p.event.key) {
                Some(i) => groups[i].1.push(p),
                None => groups.push((p.event.key.clone(), vec![p])),
            }
        }

        let reports: Vec<PassReport> = stream::iter(groups)
            .map(|(_, firings)| {
                let handler = handler.clone();
                let this = self.clone();
                async move { this.dispatch_sequence(firings, handler).await }
            })
            .buffered(self.max_concurrent)
            .collect()
            .await;
        for r in reports {
            report.absorb(r);
        }

        info!(
            "Pass: {} dispatched ({} ok, {} failed, {} skipped, {} pending), {} expired",
            report.dispatched,
            report.succeeded,
            report.failed,
            report.skipped,
            report.deferred,
            report.expired
        );
        Ok(report)
    }

    async fn dispatch_sequence(&self, firings: Vec<PlannedFiring>, handler: Arc<dyn ActionHandler>) -> PassReport {
        let mut report = PassReport::default();
        for p in firings {
            report.dispatched += 1;
            let name = label(&p.trigger);
            info!("▶ {} {} (due {})", p.event.key, name, p.due_at);

            let task = {
                let handler = handler.clone();
                let event = p.event.clone();
                let trigger = p.trigger;
                let due_at = p.due_at;
                tokio::spawn(async move { handler.handle(&event, &trigger, due_at).await })
            };
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => ActionOutcome::Failed(format!("handler aborted: {e}")),
            };

            let (firing, detail) = match outcome {
                ActionOutcome::NotYetAvailable(reason) => {
                    info!("⏳ {} {}: {}; will retry next pass", p.event.key, name, reason);
                    report.deferred += 1;
                    continue;
                }
                ActionOutcome::Completed(detail) => {
                    info!("✅ {} {}: {}", p.event.key, name, detail);
                    report.succeeded += 1;
                    (FiringOutcome::Success, detail)
                }
                ActionOutcome::Skipped(detail) => {
                    info!("⏭ {} {}: {}", p.event.key, name, detail);
                    report.skipped += 1;
                    (FiringOutcome::Skipped, detail)
                }
                ActionOutcome::Failed(detail) => {
                    warn!("❌ {} {}: {}", p.event.key, name, detail);
                    report.failed += 1;
                    (FiringOutcome::Failure, detail)
                }
            };
            if self.record(&p, firing, Some(detail)).is_err() {
                report.ledger_errors += 1;
            }
        }
        report
    }

    fn record(&self, p: &PlannedFiring, outcome: FiringOutcome, detail: Option<String>) -> Result<(), StoreError> {
        let rec = FiringRecord {
            event: p.event.key.clone(),
            trigger: p.trigger,
            fired_at: Utc::now(),
            outcome,
            detail,
        };
        match self.db.insert_firing(&rec) {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!("{} {} already in ledger", rec.event, label(&rec.trigger));
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to record firing {} {}: {} (trigger stays pending)",
                    rec.event,
                    label(&rec.trigger),
                    e
                );
                Err(e)
            }
        }
    }

    /// Administrative reset: drop a terminal firing record so the trigger is
    /// evaluated afresh on the next pass.
    pub fn reset_firing(&self, event: &EventKey, trigger: &TriggerDefinition) -> Result<bool, StoreError> {
        let existed = self.db.delete_firing(event, trigger)?;
        if existed {
            info!("Reset firing {} {}", event, label(trigger));
        }
        Ok(existed)
    }
}
