// =============================================================================
// Meteosource client — secondary paid API
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future;

use super::{ApiForecast, ProviderKind, WeatherProvider, PROVIDER_TIMEOUT_SECS};
use crate::error::{EngineError, Result};
use crate::types::Coord;

const BASE_URL: &str = "https://www.meteosource.com/api/v1/free/point";

pub struct Meteosource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl Meteosource {
    /// Reads `METEOSOURCE_API_KEY` from the environment.
    pub fn from_env() -> Self {
        Self::with_key(std::env::var("METEOSOURCE_API_KEY").ok(), BASE_URL)
    }

    pub fn with_key(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }

    fn parse(body: &serde_json::Value, coord: Coord) -> Result<ApiForecast> {
        let current = body
            .get("current")
            .ok_or_else(|| EngineError::Transient("meteosource response missing current".into()))?;

        let temp_c = current
            .get("temperature")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| EngineError::Transient("meteosource missing temperature".into()))?;
        let wind_kph = current
            .get("wind")
            .and_then(|w| w.get("speed"))
            .and_then(|v| v.as_f64())
            // Meteosource reports m/s on the free tier.
            .map(|ms| ms * 3.6)
            .unwrap_or(0.0);
        let precip_mm = current
            .get("precipitation")
            .and_then(|p| p.get("total"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        Ok(ApiForecast {
            coord,
            temp_c,
            wind_kph,
            precip_mm,
            observed_at: Utc::now(),
        })
    }
}

#[async_trait]
impl WeatherProvider for Meteosource {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Meteosource
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn forecast(&self, coord: Coord) -> Result<ApiForecast> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| EngineError::Fatal("meteosource API key not configured".into()))?;

        let url = format!(
            "{}?lat={:.4}&lon={:.4}&sections=current&units=metric&key={key}",
            self.base_url, coord.lat, coord.lon
        );

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::from_response_status("meteosource", status));
        }

        let body: serde_json::Value = resp.json().await?;
        Self::parse(&body, coord)
    }

    /// No batch endpoint; fan out one request per coordinate.
    async fn forecast_batch(&self, coords: &[Coord]) -> Result<Vec<ApiForecast>> {
        let results = future::join_all(coords.iter().map(|c| self.forecast(*c))).await;
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_converts_wind_to_kph() {
        let body = serde_json::json!({
            "current": {
                "temperature": 2.0,
                "wind": { "speed": 5.0 },
                "precipitation": { "total": 0.1 }
            }
        });
        let fc = Meteosource::parse(&body, Coord { lat: 0.0, lon: 0.0 }).unwrap();
        assert!((fc.temp_c - 2.0).abs() < 1e-9);
        assert!((fc.wind_kph - 18.0).abs() < 1e-9);
    }

    #[test]
    fn unconfigured_without_key() {
        let p = Meteosource::with_key(None, "http://localhost");
        assert!(!p.is_configured());
    }
}
