//! Orchestrator Loop: wakes on a fixed cadence (or on a force-check), moves
//! event statuses along with the clock, and hands due triggers to the
//! scheduler with a `TriggerHandler` that knows what each category does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::db::models::{
    Event, EventStatus, RecordCategory, RetrainSignal, TriggerCategory, TriggerDefinition,
};
use crate::error::{ChainError, StoreError};
use crate::model::recommend::{recommend, recommendation_records, Criteria};
use crate::model::{artifact_records, ModelCollaborator, PredictionInputs};
use crate::retrain::{RetrainCounter, RetrainDecision};
use crate::scheduler::{ActionHandler, ActionOutcome, ActionScheduler, PassReport};
use crate::sources::resolver::{Resolution, SourceChain};
use crate::store::StoreGateway;
use crate::timeline::calendar::CalendarSource;
use crate::timeline::{StatusChange, Timeline};

// ── Trigger handler ───────────────────────────────────────────────────────────

/// Dispatch target for every trigger category.
pub struct TriggerHandler {
    timeline: Timeline,
    chain: SourceChain,
    store: StoreGateway,
    retrain: RetrainCounter,
    model: Arc<dyn ModelCollaborator>,
    criteria: Criteria,
}

impl TriggerHandler {
    pub fn new(
        timeline: Timeline,
        chain: SourceChain,
        store: StoreGateway,
        retrain: RetrainCounter,
        model: Arc<dyn ModelCollaborator>,
        criteria: Criteria,
    ) -> Self {
        TriggerHandler {
            timeline,
            chain,
            store,
            retrain,
            model,
            criteria,
        }
    }

    async fn fetch_odds(&self, event: &Event, due_at: DateTime<Utc>) -> ActionOutcome {
        let resolution = match self.chain.resolve(RecordCategory::Odds, event, due_at).await {
            Ok(r) => r,
            Err(e) => return chain_outcome(e),
        };
        match self.store_changed(&resolution).await {
            Ok(n) => ActionOutcome::Completed(format!(
                "{} new of {} odds row(s) from {}",
                n,
                resolution.records.len(),
                resolution.provenance
            )),
            Err(e) => ActionOutcome::Failed(e.to_string()),
        }
    }

    /// Persist the rows of a resolution that differ from what is stored.
    async fn store_changed(&self, resolution: &Resolution) -> Result<usize, StoreError> {
        let changed = self.store.changed_only(resolution.records.clone())?;
        self.store.upsert(&changed).await
    }

    async fn predict(&self, event: &Event, due_at: DateTime<Utc>) -> ActionOutcome {
        let odds = match self.store.latest(&event.key, RecordCategory::Odds) {
            Ok(odds) => odds,
            Err(e) => return ActionOutcome::Failed(e.to_string()),
        };
        if odds.is_empty() {
            return ActionOutcome::NotYetAvailable("no odds stored yet".into());
        }
        let inputs = PredictionInputs {
            odds,
            roster: event.participants.clone(),
        };
        let artifact = match self.model.predict(event, &inputs).await {
            Ok(a) => a,
            Err(e) => return ActionOutcome::Failed(format!("{}: {:#}", self.model.name(), e)),
        };
        let records = artifact_records(&artifact, event, due_at);
        match self.store.upsert(&records).await {
            Ok(n) => ActionOutcome::Completed(format!(
                "{} prediction(s) from {} ({} new)",
                records.len(),
                artifact.model,
                n
            )),
            Err(e) => ActionOutcome::Failed(e.to_string()),
        }
    }

    async fn recommend(&self, event: &Event, due_at: DateTime<Utc>) -> ActionOutcome {
        let (predictions, odds) = match (
            self.store.latest(&event.key, RecordCategory::Prediction),
            self.store.latest(&event.key, RecordCategory::Odds),
        ) {
            (Ok(p), Ok(o)) => (p, o),
            (Err(e), _) | (_, Err(e)) => return ActionOutcome::Failed(e.to_string()),
        };
        if predictions.is_empty() {
            return ActionOutcome::NotYetAvailable("no predictions stored yet".into());
        }
        let picks = recommend(&predictions, &odds, &self.criteria);
        if picks.is_empty() {
            return ActionOutcome::Completed("no value bets".into());
        }
        for pick in &picks {
            info!(
                "💰 {} {} @ {:.2} ({}) p={:.1}% EV={:.2} stake={:.2}",
                event.key,
                pick.driver,
                pick.odds,
                pick.bookmaker,
                pick.probability * 100.0,
                pick.expected_value,
                pick.stake
            );
        }
        let records = recommendation_records(&picks, event, due_at);
        match self.store.upsert(&records).await {
            Ok(_) => ActionOutcome::Completed(format!("{} recommendation(s)", picks.len())),
            Err(e) => ActionOutcome::Failed(e.to_string()),
        }
    }

    async fn fetch_results(&self, event: &Event, due_at: DateTime<Utc>) -> ActionOutcome {
        if event.status == EventStatus::ResultsFinal {
            return self.fetch_corrections(event, due_at).await;
        }
        if let Err(e) = self.timeline.advance_to(&event.key, EventStatus::ResultsPending).await {
            return ActionOutcome::Failed(e.to_string());
        }
        let resolution = match self.chain.resolve(RecordCategory::Result, event, due_at).await {
            Ok(r) => r,
            Err(e) => return chain_outcome(e),
        };
        let inserted = match self.store_changed(&resolution).await {
            Ok(n) => n,
            Err(e) => return ActionOutcome::Failed(e.to_string()),
        };
        let summary = format!(
            "{} new of {} result row(s) from {}",
            inserted,
            resolution.records.len(),
            resolution.provenance
        );
        match self.finalize_if_complete(event).await {
            Ok(true) => ActionOutcome::Completed(format!("{summary}; results final")),
            Ok(false) => ActionOutcome::Completed(format!("{summary}; roster incomplete")),
            Err(e) => ActionOutcome::Failed(format!("{summary}; {e}")),
        }
    }

    /// Later results triggers on a final event only pick up corrections; the
    /// event is not counted toward retraining again.
    async fn fetch_corrections(&self, event: &Event, due_at: DateTime<Utc>) -> ActionOutcome {
        let resolution = match self.chain.resolve(RecordCategory::Result, event, due_at).await {
            Ok(r) => r,
            Err(e @ ChainError::NotYetAvailable { .. }) => {
                return ActionOutcome::Skipped(format!("results already final; {e}"))
            }
            Err(e) => return chain_outcome(e),
        };
        match self.store_changed(&resolution).await {
            Ok(0) => ActionOutcome::Skipped("results already final; no corrections".into()),
            Ok(n) => {
                info!("{} {} result correction(s) from {}", event.key, n, resolution.provenance);
                ActionOutcome::Completed(format!("{} correction(s) from {}", n, resolution.provenance))
            }
            Err(e) => ActionOutcome::Failed(e.to_string()),
        }
    }

    /// Mark the event final when its results are complete and count it
    /// toward retraining. Returns whether the event is final.
    async fn finalize_if_complete(&self, event: &Event) -> anyhow::Result<bool> {
        if !self.store.has_final_results(event)? {
            return Ok(false);
        }
        let change = self.timeline.mark_status(&event.key, EventStatus::ResultsFinal).await?;
        if let StatusChange::Changed { .. } = change {
            if let RetrainDecision::Signal(signal) = self.retrain.on_event_finalized(&event.key)? {
                deliver_signal(self.model.as_ref(), &signal).await;
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ActionHandler for TriggerHandler {
    async fn handle(&self, event: &Event, trigger: &TriggerDefinition, due_at: DateTime<Utc>) -> ActionOutcome {
        // Earlier dispatches in this pass may have moved the event on
        let event = match self.timeline.get(&event.key).await {
            Some(ev) => ev,
            None => return ActionOutcome::Failed(format!("{} is not on the timeline", event.key)),
        };
        match trigger.category {
            TriggerCategory::OddsFetch => self.fetch_odds(&event, due_at).await,
            TriggerCategory::Prediction => self.predict(&event, due_at).await,
            TriggerCategory::Recommendation => self.recommend(&event, due_at).await,
            TriggerCategory::ResultsFetch => self.fetch_results(&event, due_at).await,
        }
    }
}

fn chain_outcome(err: ChainError) -> ActionOutcome {
    match err {
        ChainError::NotYetAvailable { .. } => ActionOutcome::NotYetAvailable(err.to_string()),
        ChainError::AllSourcesFailed { .. } => ActionOutcome::Failed(err.to_string()),
    }
}

async fn deliver_signal(model: &dyn ModelCollaborator, signal: &RetrainSignal) {
    if let Err(e) = model.retrain(signal).await {
        warn!(
            "Retrain signal #{} not delivered to {}: {:#} (kept in retrain_signals)",
            signal.id,
            model.name(),
            e
        );
    }
}

// ── Loop ──────────────────────────────────────────────────────────────────────

/// Loop timing.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub cadence: Duration,
    pub calendar_refresh: Duration,
    /// Time after start at which an event counts as completed
    pub event_duration: chrono::Duration,
    pub season: i32,
}

pub struct Orchestrator {
    timeline: Timeline,
    scheduler: ActionScheduler,
    handler: Arc<TriggerHandler>,
    retrain: RetrainCounter,
    model: Arc<dyn ModelCollaborator>,
    calendar: Option<Arc<dyn CalendarSource>>,
    settings: LoopSettings,
}

impl Orchestrator {
    pub fn new(
        timeline: Timeline,
        scheduler: ActionScheduler,
        handler: Arc<TriggerHandler>,
        retrain: RetrainCounter,
        model: Arc<dyn ModelCollaborator>,
        settings: LoopSettings,
    ) -> Self {
        Orchestrator {
            timeline,
            scheduler,
            handler,
            retrain,
            model,
            calendar: None,
            settings,
        }
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn CalendarSource>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub async fn refresh_calendar(&self) -> anyhow::Result<usize> {
        let Some(calendar) = &self.calendar else {
            return Ok(0);
        };
        let events = calendar.fetch_season(self.settings.season).await?;
        debug!("{} returned {} event(s)", calendar.name(), events.len());
        Ok(self.timeline.load_calendar(events).await?)
    }

    /// Move events along `scheduled → in_progress → completed` by the clock.
    pub async fn advance_clock(&self, now: DateTime<Utc>) {
        for ev in self.timeline.all().await {
            let target = if now >= ev.start + self.settings.event_duration {
                EventStatus::Completed
            } else if now >= ev.start {
                EventStatus::InProgress
            } else {
                continue;
            };
            // Only nudge events that are behind; later statuses are owned by handlers
            if ev.status >= target {
                continue;
            }
            if let Err(e) = self.timeline.advance_to(&ev.key, target).await {
                warn!("Could not advance {}: {}", ev.key, e);
            }
        }
    }

    /// One full scheduling pass at `now`.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> anyhow::Result<PassReport> {
        self.advance_clock(now).await;
        for signal in self.retrain.reconcile()? {
            deliver_signal(self.model.as_ref(), &signal).await;
        }
        let events = self.timeline.due_events(now).await;
        debug!("{} event(s) in window", events.len());
        let handler: Arc<dyn ActionHandler> = self.handler.clone();
        Ok(self.scheduler.run_pass(&events, now, handler).await?)
    }

    /// Run until `shutdown` flips to true. A message on `force` starts a pass
    /// immediately; the pass in flight always completes before exit.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, mut force: mpsc::Receiver<()>) {
        info!(
            "Orchestrator started (cadence {:?}, {} trigger(s))",
            self.settings.cadence,
            self.scheduler.triggers().len()
        );
        let mut last_refresh: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if last_refresh.map_or(true, |t| t.elapsed() >= self.settings.calendar_refresh) {
                match self.refresh_calendar().await {
                    Ok(_) => last_refresh = Some(Instant::now()),
                    Err(e) => error!("Calendar refresh failed: {:#}", e),
                }
            }
            if let Err(e) = self.run_pass(Utc::now()).await {
                error!("Scheduling pass failed: {:#}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.cadence) => {}
                Some(()) = force.recv() => info!("Force-check requested"),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Orchestrator stopped");
    }
}
