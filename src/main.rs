use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

mod api;
mod config;
mod db;
mod error;
mod model;
mod orchestrator;
mod retrain;
mod retry;
mod scheduler;
mod sources;
mod store;
mod timeline;

use api::AppState;
use config::Config;
use db::Database;
use model::{HttpModel, ImpliedOddsModel, ModelCollaborator};
use orchestrator::{LoopSettings, Orchestrator, TriggerHandler};
use retrain::RetrainCounter;
use scheduler::ActionScheduler;
use store::StoreGateway;
use timeline::calendar::{CalendarSource, ErgastCalendar, JsonFileCalendar};
use timeline::Timeline;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let triggers = config.trigger_table()?;
    info!(
        "🏁 Season {} with {} trigger(s): {}",
        config.season(),
        triggers.len(),
        config.triggers
    );

    // Open database
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    let timeline = Timeline::load(db.clone(), config.look_ahead(), config.look_behind())?;
    let chain = sources::build_chain(&config)?;
    let store = StoreGateway::new(Arc::new(db.clone()), config.retry_policy(), config.min_result_rows);
    let retrain = RetrainCounter::new(db.clone(), config.retrain_threshold);

    let http = sources::http::build_client(Duration::from_secs(config.source_timeout_secs))?;
    let model: Arc<dyn ModelCollaborator> = match &config.model_url {
        Some(url) => Arc::new(HttpModel::new(http.clone(), url)),
        None => Arc::new(ImpliedOddsModel),
    };
    info!("Prediction model: {}", model.name());

    let calendar: Arc<dyn CalendarSource> = match &config.calendar_file {
        Some(path) => Arc::new(JsonFileCalendar::new(path)),
        None => Arc::new(ErgastCalendar::new(http.clone(), &config.ergast_url)),
    };
    info!("Calendar source: {}", calendar.name());

    let handler = Arc::new(TriggerHandler::new(
        timeline.clone(),
        chain,
        store,
        retrain.clone(),
        model.clone(),
        config.criteria(),
    ));
    let scheduler = ActionScheduler::new(db.clone(), triggers, config.max_concurrent_dispatches);

    let settings = LoopSettings {
        cadence: Duration::from_secs(config.cadence_secs),
        calendar_refresh: Duration::from_secs(config.calendar_refresh_secs),
        event_duration: config.event_duration(),
        season: config.season(),
    };
    let orchestrator = Orchestrator::new(
        timeline.clone(),
        scheduler.clone(),
        handler,
        retrain.clone(),
        model,
        settings,
    )
    .with_calendar(calendar);

    // Orchestrator runs in its own task; the API only nudges it
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (force_tx, force_rx) = mpsc::channel(1);
    let loop_task = tokio::spawn(orchestrator.run(shutdown_rx, force_rx));

    let api_state = AppState {
        db,
        timeline,
        scheduler,
        retrain,
        force_check: force_tx,
    };
    let app = api::router(api_state);
    let addr: SocketAddr = config.api_addr.parse()?;
    info!("Operator API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Serve until ctrl-c, then let the in-flight pass finish
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = loop_task.await {
        error!("Orchestrator task ended abnormally: {}", e);
    }
    info!("👋 Stopped");
    Ok(())
}
