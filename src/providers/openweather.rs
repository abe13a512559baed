// =============================================================================
// OpenWeather client — burst-rotation provider
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future;

use super::{ApiForecast, ProviderKind, WeatherProvider, PROVIDER_TIMEOUT_SECS};
use crate::error::{EngineError, Result};
use crate::types::Coord;

const BASE_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

pub struct OpenWeather {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenWeather {
    /// Reads `OPENWEATHER_API_KEY` from the environment.
    pub fn from_env() -> Self {
        Self::with_key(std::env::var("OPENWEATHER_API_KEY").ok(), BASE_URL)
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
        let temp_c = body
            .get("main")
            .and_then(|m| m.get("temp"))
            .and_then(|v| v.as_f64())
            .ok_or_else(|| EngineError::Transient("openweather missing main.temp".into()))?;
        let wind_kph = body
            .get("wind")
            .and_then(|w| w.get("speed"))
            .and_then(|v| v.as_f64())
            // metric units => m/s.
            .map(|ms| ms * 3.6)
            .unwrap_or(0.0);
        // Rain over the last hour when present.
        let precip_mm = body
            .get("rain")
            .and_then(|r| r.get("1h"))
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
impl WeatherProvider for OpenWeather {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenWeather
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn forecast(&self, coord: Coord) -> Result<ApiForecast> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| EngineError::Fatal("openweather API key not configured".into()))?;

        let url = format!(
            "{}?lat={:.4}&lon={:.4}&units=metric&appid={key}",
            self.base_url, coord.lat, coord.lon
        );

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::from_response_status("openweather", status));
        }

        let body: serde_json::Value = resp.json().await?;
        Self::parse(&body, coord)
    }

    async fn forecast_batch(&self, coords: &[Coord]) -> Result<Vec<ApiForecast>> {
        let results = future::join_all(coords.iter().map(|c| self.forecast(*c))).await;
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_handles_missing_rain_block() {
        let body = serde_json::json!({
            "main": { "temp": 21.0 },
            "wind": { "speed": 2.5 }
        });
        let fc = OpenWeather::parse(&body, Coord { lat: 0.0, lon: 0.0 }).unwrap();
        assert!((fc.temp_c - 21.0).abs() < 1e-9);
        assert!((fc.precip_mm - 0.0).abs() < 1e-9);
    }
}
