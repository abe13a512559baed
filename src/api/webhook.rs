// =============================================================================
// Webhook Ingress — venue forecast updates with HMAC validation
// =============================================================================
//
// Receives venue forecast-update webhooks. The `X-Stratus-Signature` header
// must carry a hex HMAC-SHA256 of the raw body under the shared secret
// (`STRATUS_WEBHOOK_SECRET`); the body is not deserialized until the
// signature verifies. Valid payloads are admitted to the bus as a
// `forecast-changed` event with `source=venue` — the only path that can
// trigger a burst.
// =============================================================================

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use crate::api::auth::constant_time_eq;
use crate::app_state::AppState;
use crate::bus::Event;
use crate::types::{ConfirmationState, ForecastSnapshot, ForecastSource, MetricType};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Stratus-Signature";

/// Wire shape of a venue forecast webhook. Values arrive in market units
/// (°F / mm).
#[derive(Debug, Deserialize)]
pub struct ForecastWebhook {
    pub city_id: String,
    pub metric: MetricType,
    pub value: f64,
    #[serde(default)]
    pub previous: Option<f64>,
}

/// Verify a hex HMAC-SHA256 signature over `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(sig) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    constant_time_eq(&expected, &sig)
}

/// Hex signature for a body (used by tests and integration tooling).
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// POST /api/v1/webhook/forecast
pub async fn forecast_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let secret = std::env::var("STRATUS_WEBHOOK_SECRET").unwrap_or_default();
    if secret.is_empty() {
        warn!("STRATUS_WEBHOOK_SECRET not set — webhook rejected");
        return (StatusCode::FORBIDDEN, "webhook not configured").into_response();
    }

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&secret, &body, signature) {
        warn!("webhook signature verification failed");
        return (StatusCode::FORBIDDEN, "invalid signature").into_response();
    }

    let payload: ForecastWebhook = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "unparseable webhook payload");
            return (StatusCode::BAD_REQUEST, "bad payload").into_response();
        }
    };

    // Market units -> native storage units.
    let native_value = match payload.metric {
        MetricType::Temperature => (payload.value - 32.0) * 5.0 / 9.0,
        _ => payload.value,
    };
    let native_previous = payload.previous.map(|p| match payload.metric {
        MetricType::Temperature => (p - 32.0) * 5.0 / 9.0,
        _ => p,
    });
    let delta = native_previous
        .map(|p| native_value - p)
        .unwrap_or(native_value);

    let now = Utc::now();
    let snapshot = ForecastSnapshot {
        city_id: payload.city_id.clone(),
        metric: payload.metric,
        value: native_value,
        valid_time: now,
        source: ForecastSource::Venue,
        confirmation: ConfirmationState::Unconfirmed,
        produced_at: now,
        cycle_key: None,
    };

    info!(
        city = %payload.city_id,
        metric = %payload.metric,
        value = payload.value,
        "venue webhook admitted"
    );
    state.bus.publish(Event::ForecastChanged {
        snapshot,
        previous: native_previous,
        delta,
    });
    state.increment_version();

    StatusCode::ACCEPTED.into_response()
}
