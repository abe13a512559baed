// =============================================================================
// Weather providers — trait, registry, and per-provider hard limits
// =============================================================================
//
// Every outbound weather-API call is gated through the ApiCallTracker first
// and recorded after, so quota accounting can never be bypassed. Burst
// rotation order is an explicit slice, never map iteration.
// =============================================================================

mod meteosource;
mod open_meteo;
mod openweather;
mod tomorrow_io;

pub use meteosource::Meteosource;
pub use open_meteo::OpenMeteo;
pub use openweather::OpenWeather;
pub use tomorrow_io::TomorrowIo;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api_tracker::ApiCallTracker;
use crate::bus::{Event, EventBus};
use crate::error::{EngineError, Result};
use crate::types::Coord;

/// Request timeout applied to every weather-API call.
pub const PROVIDER_TIMEOUT_SECS: u64 = 8;

// ---------------------------------------------------------------------------
// Provider identity & limits
// ---------------------------------------------------------------------------

/// Every provider the engine knows about, with its daily hard limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenMeteo,
    Meteosource,
    OpenWeather,
    TomorrowIo,
    WeatherApi,
    Weatherbit,
    VisualCrossing,
}

impl ProviderKind {
    /// All providers, in registry order.
    pub const ALL: [ProviderKind; 7] = [
        ProviderKind::OpenMeteo,
        ProviderKind::Meteosource,
        ProviderKind::OpenWeather,
        ProviderKind::TomorrowIo,
        ProviderKind::WeatherApi,
        ProviderKind::Weatherbit,
        ProviderKind::VisualCrossing,
    ];

    /// Burst-rotation providers in fixed rotation order.
    pub const BURST_ROTATION: [ProviderKind; 3] = [
        ProviderKind::OpenMeteo,
        ProviderKind::TomorrowIo,
        ProviderKind::OpenWeather,
    ];

    /// Daily hard quota. Reaching it excludes the provider for the UTC day.
    pub fn hard_quota(&self) -> u64 {
        match self {
            Self::OpenMeteo => 9_500,
            Self::Meteosource => 500,
            Self::OpenWeather => 1_000,
            Self::TomorrowIo => 1_000,
            Self::WeatherApi => 1_000_000,
            Self::Weatherbit => 500,
            Self::VisualCrossing => 1_000,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenMeteo => "open-meteo",
            Self::Meteosource => "meteosource",
            Self::OpenWeather => "openweather",
            Self::TomorrowIo => "tomorrow-io",
            Self::WeatherApi => "weatherapi",
            Self::Weatherbit => "weatherbit",
            Self::VisualCrossing => "visualcrossing",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ---------------------------------------------------------------------------
// Observation shape
// ---------------------------------------------------------------------------

/// One provider observation for a single coordinate, in native units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiForecast {
    pub coord: Coord,
    pub temp_c: f64,
    pub wind_kph: f64,
    pub precip_mm: f64,
    pub observed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A weather API client. Implementations own their HTTP plumbing; quota and
/// rate-limit gating happens in [`gated_forecast_batch`], not here.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// False when a required API key is absent; unconfigured providers are
    /// skipped by rotation and polling.
    fn is_configured(&self) -> bool;

    async fn forecast(&self, coord: Coord) -> Result<ApiForecast>;

    /// Batched fetch. Providers without a batch endpoint fan out internally.
    async fn forecast_batch(&self, coords: &[Coord]) -> Result<Vec<ApiForecast>>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Holds the constructed provider clients. Only the polling/burst providers
/// carry HTTP clients; the remaining kinds exist for quota bookkeeping.
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn WeatherProvider>>,
}

impl ProviderRegistry {
    /// Build the registry from the environment (API keys via env vars).
    pub fn from_env() -> Self {
        let mut providers: HashMap<ProviderKind, Arc<dyn WeatherProvider>> = HashMap::new();
        providers.insert(ProviderKind::OpenMeteo, Arc::new(OpenMeteo::new()));
        providers.insert(ProviderKind::Meteosource, Arc::new(Meteosource::from_env()));
        providers.insert(ProviderKind::TomorrowIo, Arc::new(TomorrowIo::from_env()));
        providers.insert(ProviderKind::OpenWeather, Arc::new(OpenWeather::from_env()));
        Self { providers }
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn WeatherProvider>> {
        self.providers.get(&kind).cloned()
    }

    /// Configured burst-rotation providers, in fixed order.
    pub fn burst_rotation(&self) -> Vec<Arc<dyn WeatherProvider>> {
        ProviderKind::BURST_ROTATION
            .iter()
            .filter_map(|k| self.get(*k))
            .filter(|p| p.is_configured())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Gated fetch
// ---------------------------------------------------------------------------

/// Quota/rate-limit gate around a batched provider fetch. Consults the
/// tracker before the call, records after, and publishes `provider-fetch`.
pub async fn gated_forecast_batch(
    provider: &Arc<dyn WeatherProvider>,
    tracker: &ApiCallTracker,
    bus: &EventBus,
    coords: &[Coord],
) -> Result<Vec<ApiForecast>> {
    let kind = provider.kind();

    if tracker.is_quota_exceeded(kind) {
        return Err(EngineError::QuotaExhausted(kind.name().to_string()));
    }
    if tracker.is_rate_limited(kind) {
        return Err(EngineError::RateLimited {
            provider: kind.name().to_string(),
            reset_secs: tracker.rate_limit_reset_secs(kind),
        });
    }

    let started = Instant::now();
    let result = provider.forecast_batch(coords).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match &result {
        Ok(observations) => {
            tracker.record(kind, true);
            debug!(
                provider = %kind,
                coords = coords.len(),
                observations = observations.len(),
                latency_ms,
                "provider fetch ok"
            );
        }
        Err(EngineError::RateLimited { .. }) => {
            tracker.record(kind, false);
            tracker.mark_rate_limited(kind);
        }
        Err(_) => {
            tracker.record(kind, false);
        }
    }

    bus.publish(Event::ProviderFetch {
        provider: kind,
        batch: coords.len() > 1,
        ok: result.is_ok(),
        latency_ms,
    });

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_quotas_match_provider_contracts() {
        assert_eq!(ProviderKind::OpenMeteo.hard_quota(), 9_500);
        assert_eq!(ProviderKind::Meteosource.hard_quota(), 500);
        assert_eq!(ProviderKind::WeatherApi.hard_quota(), 1_000_000);
    }

    #[test]
    fn burst_rotation_order_is_fixed() {
        assert_eq!(
            ProviderKind::BURST_ROTATION,
            [
                ProviderKind::OpenMeteo,
                ProviderKind::TomorrowIo,
                ProviderKind::OpenWeather
            ]
        );
    }
}
