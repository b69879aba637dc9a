use chrono::Utc;
use tracing::{debug, info};

use crate::db::models::{EventKey, RetrainSignal, RetrainState};
use crate::db::{CounterStep, Database};
use crate::error::StoreError;

/// What a finalization did to the counter.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrainDecision {
    Signal(RetrainSignal),
    NoSignal { count: u32 },
}

/// Counts events reaching `results_final` and emits a retraining signal every
/// `threshold` events. Each event is counted at most once, and the signal is
/// persisted in the same transaction that resets the counter.
#[derive(Clone)]
pub struct RetrainCounter {
    db: Database,
    threshold: u32,
}

impl RetrainCounter {
    pub fn new(db: Database, threshold: u32) -> Self {
        RetrainCounter {
            db,
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn on_event_finalized(&self, event: &EventKey) -> Result<RetrainDecision, StoreError> {
        match self.db.count_finalized_event(event, self.threshold, Utc::now())? {
            CounterStep::Signalled(signal) => {
                info!(
                    "🔁 Retrain signal #{} after {} finalized event(s) (last: {})",
                    signal.id, signal.events_counted, signal.triggered_by
                );
                Ok(RetrainDecision::Signal(signal))
            }
            CounterStep::Incremented { count } => {
                info!("{} finalized; {}/{} toward retrain", event, count, self.threshold);
                Ok(RetrainDecision::NoSignal { count })
            }
            CounterStep::AlreadyCounted { count } => {
                debug!("{} already counted toward retrain", event);
                Ok(RetrainDecision::NoSignal { count })
            }
        }
    }

    /// Count final events that never reached the ledger (a crash between the
    /// status write and the counter step). Returns any signals emitted.
    pub fn reconcile(&self) -> Result<Vec<RetrainSignal>, StoreError> {
        let mut signals = Vec::new();
        for key in self.db.uncounted_final_events()? {
            info!("{} is final but uncounted; counting now", key);
            if let RetrainDecision::Signal(signal) = self.on_event_finalized(&key)? {
                signals.push(signal);
            }
        }
        Ok(signals)
    }

    pub fn state(&self) -> Result<RetrainState, StoreError> {
        self.db.retrain_state()
    }

    pub fn recent_signals(&self, limit: i64) -> Result<Vec<RetrainSignal>, StoreError> {
        self.db.recent_retrain_signals(limit)
    }
}
