use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::db::models::{Event, EventKey, RecordCategory};
use crate::db::Database;
use crate::retrain::RetrainCounter;
use crate::scheduler::triggers::{label, parse_trigger};
use crate::scheduler::ActionScheduler;
use crate::timeline::Timeline;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub timeline: Timeline,
    pub scheduler: ActionScheduler,
    pub retrain: RetrainCounter,
    /// Wakes the orchestrator; capacity 1 so repeated requests coalesce
    pub force_check: mpsc::Sender<()>,
}

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Build the Axum router for the operator API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/events", get(events_handler))
        .route("/api/firings", get(firings_handler))
        .route("/api/firings/reset", post(reset_firing_handler))
        .route("/api/records", get(records_handler))
        .route("/api/retrain", get(retrain_handler))
        .route("/api/force-check", post(force_check_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "time": Utc::now() }))
}

#[derive(Serialize)]
struct TriggerView {
    trigger: String,
    due_at: DateTime<Utc>,
    state: String,
}

#[derive(Serialize)]
struct EventView {
    #[serde(flatten)]
    event: Event,
    id: String,
    triggers: Vec<TriggerView>,
}

/// GET /api/events: timeline with per-trigger state
async fn events_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let mut views = Vec::new();
    for event in state.timeline.all().await {
        let mut triggers = Vec::new();
        for t in state.scheduler.triggers() {
            let trigger_state = state.scheduler.evaluate(&event, t, now).map_err(internal)?;
            triggers.push(TriggerView {
                trigger: label(t),
                due_at: t.due_at(event.start),
                state: trigger_state.to_string(),
            });
        }
        views.push(EventView {
            id: event.key.id(),
            event,
            triggers,
        });
    }
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

/// GET /api/firings?limit=100
async fn firings_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .list_firings(q.limit.unwrap_or(100))
        .map(Json)
        .map_err(internal)
}

#[derive(Debug, Deserialize)]
struct RecordsQuery {
    season: Option<i32>,
    round: Option<u32>,
    category: Option<String>,
    limit: Option<i64>,
}

/// GET /api/records?season=2025&round=14&category=result
async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RecordsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let event = match (q.season, q.round) {
        (Some(season), Some(round)) => Some(EventKey::new(season, round)),
        (None, None) => None,
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "season and round must be given together".into(),
            ))
        }
    };
    let category = q
        .category
        .as_deref()
        .map(str::parse::<RecordCategory>)
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    state
        .db
        .list_records(event.as_ref(), category, q.limit.unwrap_or(200))
        .map(Json)
        .map_err(internal)
}

/// GET /api/retrain
async fn retrain_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let counter = state.retrain.state().map_err(internal)?;
    let signals = state.retrain.recent_signals(20).map_err(internal)?;
    Ok(Json(json!({
        "threshold": state.retrain.threshold(),
        "events_since_retrain": counter.events_since_retrain,
        "last_signal_at": counter.last_signal_at,
        "signals": signals,
    })))
}

/// POST /api/force-check: run a pass now. The usual due/fired rules apply
async fn force_check_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // A full channel means a check is already queued
    let queued = state.force_check.try_send(()).is_ok();
    (StatusCode::ACCEPTED, Json(json!({ "queued": queued })))
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    season: i32,
    round: u32,
    /// `category@offset`, e.g. `results_fetch@+4h`
    trigger: String,
}

/// POST /api/firings/reset: make a fired trigger pending again
async fn reset_firing_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let trigger = parse_trigger(&req.trigger).map_err(|e| (StatusCode::BAD_REQUEST, format!("{e:#}")))?;
    if !state.scheduler.triggers().contains(&trigger) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("'{}' is not in the trigger table", req.trigger),
        ));
    }
    let key = EventKey::new(req.season, req.round);
    let reset = state.scheduler.reset_firing(&key, &trigger).map_err(internal)?;
    Ok(Json(json!({ "event": key.id(), "trigger": label(&trigger), "reset": reset })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{EventStatus, FiringOutcome, FiringRecord};
    use axum::response::Response;
    use chrono::Duration;

    fn state(capacity: usize) -> (Arc<AppState>, mpsc::Receiver<()>) {
        let db = Database::open(":memory:").unwrap();
        let timeline = Timeline::load(db.clone(), Duration::hours(96), Duration::hours(168)).unwrap();
        let scheduler = ActionScheduler::new(
            db.clone(),
            crate::scheduler::triggers::parse_trigger_table("odds_fetch@-72h,results_fetch@+4h").unwrap(),
            2,
        );
        let (tx, rx) = mpsc::channel(capacity);
        let state = AppState {
            retrain: RetrainCounter::new(db.clone(), 5),
            db,
            timeline,
            scheduler,
            force_check: tx,
        };
        (Arc::new(state), rx)
    }

    fn status(resp: impl IntoResponse) -> StatusCode {
        let resp: Response = resp.into_response();
        resp.status()
    }

    #[tokio::test]
    async fn force_check_coalesces() {
        let (st, mut rx) = state(1);
        assert_eq!(status(force_check_handler(State(st.clone())).await), StatusCode::ACCEPTED);
        assert_eq!(status(force_check_handler(State(st.clone())).await), StatusCode::ACCEPTED);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "second request coalesced into the first");
    }

    #[tokio::test]
    async fn reset_removes_a_firing() {
        let (st, _rx) = state(1);
        let trigger = parse_trigger("results_fetch@+4h").unwrap();
        st.db
            .insert_firing(&FiringRecord {
                event: EventKey::new(2025, 14),
                trigger,
                fired_at: Utc::now(),
                outcome: FiringOutcome::Failure,
                detail: Some("all sources failed".into()),
            })
            .unwrap();

        let req = ResetRequest {
            season: 2025,
            round: 14,
            trigger: "results_fetch@+4h".into(),
        };
        let resp = reset_firing_handler(State(st.clone()), Json(req)).await;
        assert_eq!(status(resp), StatusCode::OK);
        assert!(st.db.find_firing(&EventKey::new(2025, 14), &trigger).unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_rejects_unknown_triggers() {
        let (st, _rx) = state(1);
        let req = ResetRequest {
            season: 2025,
            round: 14,
            trigger: "prediction@-24h".into(),
        };
        let resp = reset_firing_handler(State(st), Json(req)).await;
        assert_eq!(status(resp), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn records_query_validates_category() {
        let (st, _rx) = state(1);
        let q = RecordsQuery {
            season: Some(2025),
            round: Some(14),
            category: Some("weather".into()),
            limit: None,
        };
        assert_eq!(
            status(records_handler(State(st), Query(q)).await),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn events_lists_trigger_states() {
        let (st, _rx) = state(1);
        st.timeline
            .load_calendar(vec![Event {
                key: EventKey::new(2030, 1),
                name: "Future GP".into(),
                start: Utc::now() + Duration::days(200),
                status: EventStatus::Scheduled,
                participants: vec![],
                country: None,
                location: None,
            }])
            .await
            .unwrap();
        assert_eq!(status(events_handler(State(st)).await), StatusCode::OK);
    }
}
