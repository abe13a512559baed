// =============================================================================
// Open-Meteo client — primary free API, true batch endpoint
// =============================================================================
//
// Open-Meteo accepts comma-separated latitude/longitude lists and returns one
// result object per coordinate, which makes it the only provider here that
// can poll every tracked city in a single request. No API key required.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{ApiForecast, ProviderKind, WeatherProvider, PROVIDER_TIMEOUT_SECS};
use crate::error::{EngineError, Result};
use crate::types::Coord;

const BASE_URL: &str = "https://api.open-meteo.com/v1/forecast";

pub struct OpenMeteo {
    client: reqwest::Client,
    base_url: String,
}

impl OpenMeteo {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn parse_one(value: &serde_json::Value, coord: Coord) -> Result<ApiForecast> {
        let current = value
            .get("current")
            .ok_or_else(|| EngineError::Transient("open-meteo response missing current".into()))?;

        let temp_c = current
            .get("temperature_2m")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| EngineError::Transient("open-meteo missing temperature_2m".into()))?;
        let wind_kph = current
            .get("wind_speed_10m")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let precip_mm = current
            .get("precipitation")
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

impl Default for OpenMeteo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteo {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenMeteo
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn forecast(&self, coord: Coord) -> Result<ApiForecast> {
        let mut results = self.forecast_batch(std::slice::from_ref(&coord)).await?;
        results
            .pop()
            .ok_or_else(|| EngineError::Transient("open-meteo returned empty batch".into()))
    }

    async fn forecast_batch(&self, coords: &[Coord]) -> Result<Vec<ApiForecast>> {
        if coords.is_empty() {
            return Ok(Vec::new());
        }

        let lats = coords
            .iter()
            .map(|c| format!("{:.4}", c.lat))
            .collect::<Vec<_>>()
            .join(",");
        let lons = coords
            .iter()
            .map(|c| format!("{:.4}", c.lon))
            .collect::<Vec<_>>()
            .join(",");

        let url = format!(
            "{}?latitude={lats}&longitude={lons}&current=temperature_2m,wind_speed_10m,precipitation&wind_speed_unit=kmh",
            self.base_url
        );
        debug!(cities = coords.len(), "open-meteo batch request");

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::from_response_status("open-meteo", status));
        }

        let body: serde_json::Value = resp.json().await?;

        // Multi-coordinate requests return an array; single requests a bare
        // object.
        match body.as_array() {
            Some(items) => {
                if items.len() != coords.len() {
                    return Err(EngineError::Transient(format!(
                        "open-meteo returned {} results for {} coords",
                        items.len(),
                        coords.len()
                    )));
                }
                items
                    .iter()
                    .zip(coords.iter())
                    .map(|(item, coord)| Self::parse_one(item, *coord))
                    .collect()
            }
            None => Ok(vec![Self::parse_one(&body, coords[0])?]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_extracts_current_block() {
        let body = serde_json::json!({
            "current": {
                "temperature_2m": 1.7,
                "wind_speed_10m": 12.3,
                "precipitation": 0.4
            }
        });
        let coord = Coord {
            lat: 40.71,
            lon: -74.01,
        };
        let fc = OpenMeteo::parse_one(&body, coord).unwrap();
        assert!((fc.temp_c - 1.7).abs() < 1e-9);
        assert!((fc.wind_kph - 12.3).abs() < 1e-9);
        assert!((fc.precip_mm - 0.4).abs() < 1e-9);
    }

    #[test]
    fn parse_rejects_missing_temperature() {
        let body = serde_json::json!({ "current": {} });
        let coord = Coord { lat: 0.0, lon: 0.0 };
        assert!(OpenMeteo::parse_one(&body, coord).is_err());
    }
}
