// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; control endpoints
// require a valid Bearer token via the `AuthBearer` extractor. The webhook
// route authenticates with its HMAC signature instead.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::api::webhook;
use crate::app_state::AppState;
use crate::types::EngineMode;

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Webhook (HMAC-authenticated) ────────────────────────────
        .route("/api/v1/webhook/forecast", post(webhook::forecast_webhook))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/markets", get(markets))
        .route("/api/v1/control/force-mode", post(force_mode))
        .route("/api/v1/control/return-to-normal", post(return_to_normal))
        .route("/api/v1/control/trigger-burst", post(trigger_burst))
        .route("/api/v1/control/kill-switch/reset", post(kill_switch_reset))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Read endpoints
// =============================================================================

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status_report())
}

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.positions.get_open_positions())
}

async fn markets(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.snapshot())
}

// =============================================================================
// Control endpoints
// =============================================================================

#[derive(Deserialize)]
struct ForceModeRequest {
    mode: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn force_mode(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ForceModeRequest>,
) -> impl IntoResponse {
    let mode: EngineMode = match req.mode.parse() {
        Ok(m) => m,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let reason = req.reason.unwrap_or_else(|| "api".to_string());
    info!(mode = %mode, reason = %reason, "force-mode requested");
    state.controller.force_mode(mode, &reason);
    state.increment_version();
    Json(serde_json::json!({ "mode": mode })).into_response()
}

async fn return_to_normal(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("return-to-normal requested");
    state.controller.return_to_normal();
    state.increment_version();
    Json(serde_json::json!({ "mode": state.controller.current_mode() }))
}

#[derive(Deserialize)]
struct TriggerBurstRequest {
    city_id: String,
}

async fn trigger_burst(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriggerBurstRequest>,
) -> impl IntoResponse {
    info!(city = %req.city_id, "manual burst requested");
    state.controller.trigger_burst(&req.city_id);
    state.increment_version();
    Json(serde_json::json!({ "mode": state.controller.current_mode() }))
}

async fn kill_switch_reset(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.kill_switch.reset();
    state.increment_version();
    Json(serde_json::json!({ "triggered": state.kill_switch.is_triggered() }))
}
