// =============================================================================
// Tomorrow.io client — burst-rotation provider
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future;

use super::{ApiForecast, ProviderKind, WeatherProvider, PROVIDER_TIMEOUT_SECS};
use crate::error::{EngineError, Result};
use crate::types::Coord;

const BASE_URL: &str = "https://api.tomorrow.io/v4/weather/realtime";

pub struct TomorrowIo {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl TomorrowIo {
    /// Reads `TOMORROW_API_KEY` from the environment.
    pub fn from_env() -> Self {
        Self::with_key(std::env::var("TOMORROW_API_KEY").ok(), BASE_URL)
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
        let values = body
            .get("data")
            .and_then(|d| d.get("values"))
            .ok_or_else(|| EngineError::Transient("tomorrow.io response missing values".into()))?;

        let temp_c = values
            .get("temperature")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| EngineError::Transient("tomorrow.io missing temperature".into()))?;
        let wind_kph = values
            .get("windSpeed")
            .and_then(|v| v.as_f64())
            // Reported in m/s.
            .map(|ms| ms * 3.6)
            .unwrap_or(0.0);
        let precip_mm = values
            .get("rainIntensity")
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
impl WeatherProvider for TomorrowIo {
    fn kind(&self) -> ProviderKind {
        ProviderKind::TomorrowIo
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn forecast(&self, coord: Coord) -> Result<ApiForecast> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| EngineError::Fatal("tomorrow.io API key not configured".into()))?;

        let url = format!(
            "{}?location={:.4},{:.4}&units=metric&apikey={key}",
            self.base_url, coord.lat, coord.lon
        );

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::from_response_status("tomorrow-io", status));
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
    fn parse_reads_nested_values() {
        let body = serde_json::json!({
            "data": { "values": { "temperature": -3.5, "windSpeed": 10.0, "rainIntensity": 0.0 } }
        });
        let fc = TomorrowIo::parse(&body, Coord { lat: 0.0, lon: 0.0 }).unwrap();
        assert!((fc.temp_c + 3.5).abs() < 1e-9);
        assert!((fc.wind_kph - 36.0).abs() < 1e-9);
    }
}
