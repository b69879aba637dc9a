//! Priority-ordered source chain with per-adapter retry and fallback.
//!
//! ```text
//!  resolve(category, event, observed_at)
//!     │
//!     ├─▶ adapter[0] ── Success ───────────────▶ normalize ─▶ Resolution
//!     │      │ Transient ─▶ backoff, retry (≤ max_attempts)
//!     │      │ Permanent / retries exhausted ─▶ next adapter
//!     │      │ NotYetAvailable ─▶ next adapter
//!     ├─▶ adapter[1] ...
//!     ▼
//!  NotYetAvailable (every source said "not yet") | AllSourcesFailed
//! ```

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::normalize::normalize;
use super::provider::SourceAdapter;
use crate::db::models::{AcquiredRecord, Event, RecordCategory};
use crate::error::{ChainError, FetchError};
use crate::retry::RetryPolicy;

/// Normalized data plus which source satisfied the request.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub records: Vec<AcquiredRecord>,
    pub provenance: String,
    /// Attempts spent on the winning adapter
    pub attempts: u32,
}

/// Stateless resolver over per-category adapter lists.
#[derive(Clone)]
pub struct SourceChain {
    chains: HashMap<RecordCategory, Vec<Arc<dyn SourceAdapter>>>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

enum AdapterOutcome {
    Success(Resolution),
    NotYetAvailable(String),
    Failed(String),
}

impl SourceChain {
    pub fn new(retry: RetryPolicy, call_timeout: Duration) -> Self {
        SourceChain {
            chains: HashMap::new(),
            retry,
            call_timeout,
        }
    }

    /// Set the adapter priority list for a category (index 0 = highest).
    pub fn with_chain(mut self, category: RecordCategory, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        self.chains.insert(category, adapters);
        self
    }

    pub fn adapter_names(&self, category: RecordCategory) -> Vec<String> {
        self.chains
            .get(&category)
            .map(|list| list.iter().map(|a| a.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Records without a timestamp of their own are measured at `observed_at`
    /// (the trigger's due instant), so a re-dispatch of the same trigger
    /// yields identical identities.
    pub async fn resolve(
        &self,
        category: RecordCategory,
        event: &Event,
        observed_at: DateTime<Utc>,
    ) -> Result<Resolution, ChainError> {
        let adapters = self.chains.get(&category).map(Vec::as_slice).unwrap_or(&[]);
        let mut not_yet = Vec::new();
        let mut failures = Vec::new();

        for adapter in adapters {
            match self.try_adapter(adapter.as_ref(), category, event, observed_at).await {
                AdapterOutcome::Success(resolution) => {
                    info!(
                        "{} {}: {} record(s) from '{}'",
                        event.key,
                        category,
                        resolution.records.len(),
                        resolution.provenance
                    );
                    return Ok(resolution);
                }
                AdapterOutcome::NotYetAvailable(reason) => {
                    debug!("{} {}: '{}' not yet available: {}", event.key, category, adapter.name(), reason);
                    not_yet.push(adapter.name().to_string());
                }
                AdapterOutcome::Failed(reason) => {
                    warn!("{} {}: '{}' failed: {}", event.key, category, adapter.name(), reason);
                    failures.push((adapter.name().to_string(), reason));
                }
            }
        }

        // Only a unanimous "not yet" keeps the trigger pending; a real failure
        // anywhere in the chain is terminal for this trigger
        if failures.is_empty() && !not_yet.is_empty() {
            Err(ChainError::NotYetAvailable { sources: not_yet })
        } else {
            Err(ChainError::AllSourcesFailed { failures })
        }
    }

    async fn try_adapter(
        &self,
        adapter: &dyn SourceAdapter,
        category: RecordCategory,
        event: &Event,
        observed_at: DateTime<Utc>,
    ) -> AdapterOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.call_timeout, adapter.fetch(event, category)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Transient(format!(
                    "timed out after {:?}",
                    self.call_timeout
                ))),
            };

            match result {
                Ok(payload) => {
                    if payload.is_empty() {
                        return AdapterOutcome::NotYetAvailable("empty payload".into());
                    }
                    let records = normalize(payload, event, adapter.name(), observed_at, Utc::now());
                    if records.is_empty() {
                        return AdapterOutcome::NotYetAvailable("no usable rows in payload".into());
                    }
                    return AdapterOutcome::Success(Resolution {
                        records,
                        provenance: adapter.name().to_string(),
                        attempts: attempt,
                    });
                }
                Err(FetchError::NotYetAvailable(reason)) => return AdapterOutcome::NotYetAvailable(reason),
                Err(FetchError::Permanent(reason)) => return AdapterOutcome::Failed(reason),
                Err(FetchError::Transient(reason)) => {
                    if !self.retry.should_retry(attempt) {
                        return AdapterOutcome::Failed(format!(
                            "{reason} (gave up after {attempt} attempt(s))"
                        ));
                    }
                    let delay = self.retry.backoff(attempt);
                    debug!(
                        "'{}' attempt {} transient ({}); retrying in {:?}",
                        adapter.name(),
                        attempt,
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
