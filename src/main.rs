// =============================================================================
// Stratus Bot — Main Entry Point
// =============================================================================
//
// Low-latency weather trading engine: detects fresh NWP publications in
// public object storage, confirms forecast changes against a secondary API
// path, and converts confirmed deltas into sized, risk-managed trade
// intents.
//
// Exit codes: 0 normal, 1 fatal startup failure, 130 SIGINT shutdown.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod api_tracker;
mod app_state;
mod bus;
mod cities;
mod controller;
mod datastore;
mod error;
mod execution;
mod exits;
mod ingest;
mod kill_switch;
mod positions;
mod providers;
mod runtime_config;
mod schedule;
mod strategy;
mod types;
mod venue;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api_tracker::ApiCallTracker;
use crate::app_state::AppState;
use crate::bus::EventBus;
use crate::cities::CityRegistry;
use crate::controller::HybridController;
use crate::datastore::DataStore;
use crate::execution::ExecutionEngine;
use crate::exits::ExitMonitor;
use crate::ingest::{spawn_pipeline, PipelineDeps};
use crate::kill_switch::KillSwitch;
use crate::positions::PositionManager;
use crate::providers::{ProviderKind, ProviderRegistry};
use crate::runtime_config::RuntimeConfig;
use crate::schedule::ScheduleManager;
use crate::strategy::capture::CaptureRegistry;
use crate::strategy::engine::OpportunityEngine;
use crate::strategy::OpportunityLog;
use crate::venue::{run_price_stream, PaperVenue};

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Stratus Bot — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = match RuntimeConfig::load("runtime_config.json") {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "failed to load config, using defaults");
            RuntimeConfig::default()
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration inconsistent — aborting");
        return 1;
    }

    // ── 2. Core plumbing ─────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new());
    let tracker = Arc::new(ApiCallTracker::new(bus.clone()));
    let cities = Arc::new(CityRegistry::builtin());
    let provider_registry = Arc::new(ProviderRegistry::from_env());

    let Some(fallback_provider) = provider_registry.get(ProviderKind::OpenMeteo) else {
        error!("primary provider missing from registry — aborting");
        return 1;
    };

    // ── 3. Opportunity-core state ────────────────────────────────────────
    let store = Arc::new(DataStore::new());
    let positions = Arc::new(PositionManager::new(config.starting_capital));
    let kill_switch = Arc::new(KillSwitch::new(
        config.starting_capital,
        config.kill_switch_limits(),
    ));
    let capture = Arc::new(CaptureRegistry::new());
    let opportunity_log = Arc::new(OpportunityLog::new());

    // The live venue is an external collaborator; the paper venue backs
    // order flow until one is wired in.
    let venue = Arc::new(PaperVenue::new());

    let execution = Arc::new(ExecutionEngine::new(
        venue.clone(),
        positions.clone(),
        capture.clone(),
        config.execution_settings(),
    ));

    // ── 4. Shutdown plumbing ─────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 5. Ingestion pipeline ────────────────────────────────────────────
    let (pipeline_handles, confirmation) = spawn_pipeline(
        PipelineDeps {
            bus: bus.clone(),
            tracker: tracker.clone(),
            cities: cities.clone(),
            fallback_provider,
            decoder_binary: config.decoder_binary.clone(),
            detector_settings: config.detector_settings(),
            fallback_settings: config.fallback_settings(),
            tolerances: config.tolerances,
            triggers: config.change_triggers,
        },
        shutdown_rx.clone(),
    );
    info!(tasks = pipeline_handles.len(), "ingestion pipeline spawned");

    // ── 6. Schedule manager ──────────────────────────────────────────────
    let schedule = Arc::new(ScheduleManager::new(bus.clone(), config.schedule_settings()));
    {
        let schedule = schedule.clone();
        tokio::spawn(async move { schedule.run().await });
    }

    // ── 7. Mode controller ───────────────────────────────────────────────
    let controller = Arc::new(HybridController::new(
        bus.clone(),
        tracker.clone(),
        provider_registry.clone(),
        cities.clone(),
        config.controller_settings(),
    ));
    tokio::spawn(controller.clone().run(shutdown_rx.clone()));

    // ── 8. Opportunity engine ────────────────────────────────────────────
    let engine = Arc::new(OpportunityEngine::new(
        bus.clone(),
        store.clone(),
        positions.clone(),
        kill_switch.clone(),
        capture.clone(),
        execution,
        venue.clone(),
        opportunity_log.clone(),
        config.strategy_settings(),
    ));
    tokio::spawn(engine.run(shutdown_rx.clone()));

    // ── 9. Exit monitor ──────────────────────────────────────────────────
    let exit_monitor = Arc::new(ExitMonitor::new(
        store.clone(),
        positions.clone(),
        kill_switch.clone(),
        bus.clone(),
        config.exit_settings(),
    ));
    tokio::spawn(exit_monitor.run(shutdown_rx.clone()));

    // ── 10. Venue price stream ───────────────────────────────────────────
    if let Some(ws_url) = config.venue_ws_url.clone() {
        let stream_store = store.clone();
        let stream_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                if *stream_shutdown.borrow() {
                    return;
                }
                if let Err(e) =
                    run_price_stream(&ws_url, stream_store.clone(), stream_shutdown.clone()).await
                {
                    error!(error = %e, "price stream error — reconnecting in 5s");
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        });
    } else {
        warn!("no venue_ws_url configured — running against the paper venue only");
    }

    // ── 11. API server ───────────────────────────────────────────────────
    let graceful_ms = config.graceful_shutdown_ms;
    let bind_addr =
        std::env::var("STRATUS_BIND_ADDR").unwrap_or_else(|_| config.bind_addr.clone());

    let state = Arc::new(AppState {
        state_version: AtomicU64::new(1),
        config: Arc::new(RwLock::new(config)),
        bus: bus.clone(),
        tracker,
        store,
        positions,
        kill_switch,
        capture,
        controller,
        confirmation,
        opportunity_log,
        recent_errors: RwLock::new(Vec::new()),
        start_time: std::time::Instant::now(),
    });

    {
        let api_state = state.clone();
        let bind = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = match tokio::net::TcpListener::bind(&bind).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %bind, error = %e, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %bind, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 12. Graceful shutdown ────────────────────────────────────────────
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to listen for shutdown signal");
        return 1;
    }
    warn!("shutdown signal received — stopping gracefully");

    schedule.stop();
    let _ = shutdown_tx.send(true);

    // Give in-flight HTTP requests a bounded window before abort.
    tokio::time::sleep(std::time::Duration::from_millis(graceful_ms)).await;

    info!("Stratus Bot shut down complete.");
    130
}
