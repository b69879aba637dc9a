pub mod calendar;

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::db::models::{Event, EventKey, EventStatus};
use crate::db::Database;
use crate::error::{StoreError, TimelineError};

/// Effect of a status mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Changed { from: EventStatus, to: EventStatus },
    /// Already in the requested status
    Unchanged,
}

/// In-memory view of the race calendar, written through to SQLite. The
/// timeline is the only owner of event status.
#[derive(Clone)]
pub struct Timeline {
    db: Database,
    events: Arc<RwLock<BTreeMap<EventKey, Event>>>,
    look_ahead: Duration,
    look_behind: Duration,
}

impl Timeline {
    /// Rebuild the timeline from persisted events.
    pub fn load(db: Database, look_ahead: Duration, look_behind: Duration) -> Result<Self, StoreError> {
        let events = db
            .list_events()?
            .into_iter()
            .map(|ev| (ev.key.clone(), ev))
            .collect();
        Ok(Timeline {
            db,
            events: Arc::new(RwLock::new(events)),
            look_ahead,
            look_behind,
        })
    }

    /// Merge a calendar snapshot. Known events keep their status; calendar
    /// attributes (name, start, roster) are refreshed. Returns how many
    /// events were new.
    pub async fn load_calendar(&self, calendar: Vec<Event>) -> Result<usize, StoreError> {
        let mut events = self.events.write().await;
        let mut added = 0;
        for mut ev in calendar {
            if let Some(known) = events.get(&ev.key) {
                ev.status = known.status;
            } else {
                added += 1;
            }
            self.db.upsert_event(&ev)?;
            events.insert(ev.key.clone(), ev);
        }
        if added > 0 {
            info!("Calendar: {} new event(s), {} total", added, events.len());
        }
        Ok(added)
    }

    /// Events starting within `[now - look_behind, now + look_ahead]`,
    /// soonest first, ties broken by key.
    pub async fn due_events(&self, now: DateTime<Utc>) -> Vec<Event> {
        let from = now - self.look_behind;
        let to = now + self.look_ahead;
        let events = self.events.read().await;
        let mut due: Vec<Event> = events
            .values()
            .filter(|ev| ev.start >= from && ev.start <= to)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.key.cmp(&b.key)));
        due
    }

    pub async fn get(&self, key: &EventKey) -> Option<Event> {
        self.events.read().await.get(key).cloned()
    }

    /// Every known event ordered by start.
    pub async fn all(&self) -> Vec<Event> {
        let mut all: Vec<Event> = self.events.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.key.cmp(&b.key)));
        all
    }

    /// Apply a single forward transition. Backward moves and skips fail with
    /// `InvalidTransition` and leave the event untouched.
    pub async fn mark_status(&self, key: &EventKey, status: EventStatus) -> Result<StatusChange, TimelineError> {
        let mut events = self.events.write().await;
        let ev = events
            .get_mut(key)
            .ok_or_else(|| TimelineError::UnknownEvent(key.clone()))?;
        let from = ev.status;
        if from == status {
            return Ok(StatusChange::Unchanged);
        }
        if !from.can_advance_to(status) {
            let err = TimelineError::InvalidTransition {
                event: key.clone(),
                from,
                to: status,
            };
            warn!("{}", err);
            return Err(err);
        }
        self.db.update_event_status(key, status)?;
        ev.status = status;
        info!("{} ({}): {} → {}", key, ev.name, from, status);
        Ok(StatusChange::Changed { from, to: status })
    }

    /// Walk forward through every legal step up to `target`. A target that
    /// lies behind the current status is an `InvalidTransition`.
    pub async fn advance_to(&self, key: &EventKey, target: EventStatus) -> Result<StatusChange, TimelineError> {
        let mut events = self.events.write().await;
        let ev = events
            .get_mut(key)
            .ok_or_else(|| TimelineError::UnknownEvent(key.clone()))?;
        let from = ev.status;
        let path = from.path_to(target).ok_or_else(|| TimelineError::InvalidTransition {
            event: key.clone(),
            from,
            to: target,
        })?;
        if path.is_empty() {
            return Ok(StatusChange::Unchanged);
        }
        for step in path {
            self.db.update_event_status(key, step)?;
            ev.status = step;
        }
        info!("{} ({}): {} → {}", key, ev.name, from, target);
        Ok(StatusChange::Changed { from, to: target })
    }
}
