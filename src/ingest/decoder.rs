// =============================================================================
// GRIB2 decoder invocation — external process contract and city extraction
// =============================================================================
//
// Decoding proper is delegated to an external binary (wgrib2-compatible).
// The contract:
//
//   <binary> <grib-path> -match '<FILTER>' -points 'id:lat,lon;id:lat,lon;…'
//
// The decoder prints one line per requested city:
//
//   <city-id> <tempK> <uWind m/s> <vWind m/s> <apcpMm>
//
// Cities the decoder cannot resolve (outside the file's grid) are simply
// absent from the output; that is not an error.
// =============================================================================

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cities::City;
use crate::error::{EngineError, Result};
use crate::types::{kelvin_to_celsius, wind_direction_deg, wind_speed, ModelKind};

/// Fields extracted from every detection file.
pub const FILTER_EXPRESSION: &str =
    ":(TMP:2 m above ground|UGRD:10 m above ground|VGRD:10 m above ground|APCP:surface):";

/// Decoder wall-clock budget.
const PARSE_TIMEOUT_MS: u64 = 1_000;

/// Converted per-city extraction result. Temperature is carried in °C; wind
/// in km/h; conversions to °F happen at the venue/display boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CityWeather {
    pub city_id: String,
    pub temp_c: f64,
    pub wind_kph: f64,
    pub wind_dir_deg: f64,
    pub precip_mm: f64,
}

pub struct GribDecoder {
    binary: PathBuf,
    timeout_ms: u64,
}

impl GribDecoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout_ms: PARSE_TIMEOUT_MS,
        }
    }

    /// Decode `grib_path`, extracting the given cities. The returned list
    /// preserves decoder output order and may be shorter than `cities`.
    pub async fn decode(
        &self,
        model: ModelKind,
        grib_path: &Path,
        cities: &[&City],
    ) -> Result<Vec<CityWeather>> {
        let points = cities
            .iter()
            .map(|c| format!("{}:{:.4},{:.4}", c.id, c.coord.lat, c.coord.lon))
            .collect::<Vec<_>>()
            .join(";");

        let mut cmd = Command::new(&self.binary);
        cmd.arg(grib_path)
            .arg("-match")
            .arg(FILTER_EXPRESSION)
            .arg("-points")
            .arg(&points)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(model = %model, grib = %grib_path.display(), cities = cities.len(), "invoking decoder");

        let output = tokio::time::timeout(
            std::time::Duration::from_millis(self.timeout_ms),
            cmd.output(),
        )
        .await
        .map_err(|_| EngineError::Timeout {
            operation: "grib-decode",
            ms: self.timeout_ms,
        })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Parse {
                model,
                detail: format!(
                    "decoder exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_decoder_output(model, &stdout)
    }
}

/// Parse the decoder's plain-text output, one city per line.
pub fn parse_decoder_output(model: ModelKind, stdout: &str) -> Result<Vec<CityWeather>> {
    let mut out = Vec::new();
    for (lineno, line) in stdout.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(EngineError::Parse {
                model,
                detail: format!("line {}: expected 5 fields, got {}", lineno + 1, fields.len()),
            });
        }
        let parse_f64 = |s: &str, what: &str| -> Result<f64> {
            s.parse::<f64>().map_err(|_| EngineError::Parse {
                model,
                detail: format!("line {}: bad {what}: {s}", lineno + 1),
            })
        };

        let temp_k = parse_f64(fields[1], "tempK")?;
        let u = parse_f64(fields[2], "uWind")?;
        let v = parse_f64(fields[3], "vWind")?;
        let apcp = parse_f64(fields[4], "apcpMm")?;

        if !(150.0..=350.0).contains(&temp_k) {
            warn!(city = fields[0], temp_k, "implausible temperature from decoder");
        }

        out.push(CityWeather {
            city_id: fields[0].to_string(),
            temp_c: kelvin_to_celsius(temp_k),
            // u/v arrive in m/s; store km/h.
            wind_kph: wind_speed(u, v) * 3.6,
            wind_dir_deg: wind_direction_deg(u, v),
            precip_mm: apcp,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_city_per_line() {
        let stdout = "nyc 275.15 3.0 4.0 0.2\nchi 270.00 0.0 0.0 0.0\n";
        let cities = parse_decoder_output(ModelKind::Hrrr, stdout).unwrap();
        assert_eq!(cities.len(), 2);

        let nyc = &cities[0];
        assert_eq!(nyc.city_id, "nyc");
        assert!((nyc.temp_c - 2.0).abs() < 1e-9);
        assert!((nyc.wind_kph - 5.0 * 3.6).abs() < 1e-9);
        assert!((nyc.precip_mm - 0.2).abs() < 1e-9);
    }

    #[test]
    fn empty_output_is_not_an_error() {
        // Every requested city outside the file's grid: decoder prints
        // nothing.
        let cities = parse_decoder_output(ModelKind::Hrrr, "\n").unwrap();
        assert!(cities.is_empty());
    }

    #[test]
    fn malformed_line_is_a_parse_failure() {
        let err = parse_decoder_output(ModelKind::Hrrr, "nyc 275.15 3.0\n").unwrap_err();
        assert!(matches!(err, EngineError::Parse { .. }));

        let err = parse_decoder_output(ModelKind::Hrrr, "nyc abc 3.0 4.0 0.0\n").unwrap_err();
        assert!(matches!(err, EngineError::Parse { .. }));
    }

    #[test]
    fn wind_direction_in_range() {
        let stdout = "nyc 280.0 -2.5 -7.1 0.0\n";
        let cities = parse_decoder_output(ModelKind::Hrrr, stdout).unwrap();
        assert!((0.0..360.0).contains(&cities[0].wind_dir_deg));
    }
}
