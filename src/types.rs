// =============================================================================
// Shared types used across the Stratus trading engine
// =============================================================================

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Numerical weather prediction models the engine ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    Hrrr,
    Rap,
    Gfs,
    Ecmwf,
}

impl ModelKind {
    /// All models in detection tie-break order (highest resolution first).
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Hrrr,
        ModelKind::Rap,
        ModelKind::Ecmwf,
        ModelKind::Gfs,
    ];

    /// Hours between consecutive cycles.
    pub fn cadence_hours(&self) -> u32 {
        match self {
            Self::Hrrr | Self::Rap => 1,
            Self::Gfs | Self::Ecmwf => 6,
        }
    }

    /// Public object-store bucket holding this model's output.
    pub fn bucket(&self) -> &'static str {
        match self {
            Self::Hrrr => "noaa-hrrr-pds",
            Self::Rap => "noaa-rap-pds",
            Self::Gfs => "noaa-gfs-pds",
            Self::Ecmwf => "noaa-ecmwf-pds",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hrrr => write!(f, "HRRR"),
            Self::Rap => write!(f, "RAP"),
            Self::Gfs => write!(f, "GFS"),
            Self::Ecmwf => write!(f, "ECMWF"),
        }
    }
}

impl std::str::FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HRRR" => Ok(Self::Hrrr),
            "RAP" => Ok(Self::Rap),
            "GFS" => Ok(Self::Gfs),
            "ECMWF" => Ok(Self::Ecmwf),
            other => Err(format!("unknown model kind: {other}")),
        }
    }
}

/// Uniquely names a single model run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleKey {
    pub model: ModelKind,
    pub cycle_date: NaiveDate,
    pub cycle_hour: u8,
}

impl CycleKey {
    pub fn new(model: ModelKind, cycle_date: NaiveDate, cycle_hour: u8) -> Self {
        Self {
            model,
            cycle_date,
            cycle_hour,
        }
    }

    /// UTC instant at which this cycle nominally starts.
    pub fn cycle_start(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(
            &self
                .cycle_date
                .and_hms_opt(self.cycle_hour as u32, 0, 0)
                .expect("cycle hour out of range"),
        )
    }

    /// The next run of the same model.
    pub fn next(&self) -> Self {
        let start = self.cycle_start() + Duration::hours(self.model.cadence_hours() as i64);
        Self {
            model: self.model,
            cycle_date: start.date_naive(),
            cycle_hour: start.hour() as u8,
        }
    }
}

impl std::fmt::Display for CycleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}{:02}z",
            self.model,
            self.cycle_date.format("%Y%m%d"),
            self.cycle_hour
        )
    }
}

/// Weather metric a market or forecast refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Stored in °C; converted to °F only at the venue/display boundary.
    Temperature,
    /// Stored in km/h.
    WindSpeed,
    /// Stored in mm.
    Precipitation,
}

impl MetricType {
    /// Native storage unit label (for logs and the status report).
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Temperature => "C",
            Self::WindSpeed => "km/h",
            Self::Precipitation => "mm",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temperature => write!(f, "temperature"),
            Self::WindSpeed => write!(f, "wind_speed"),
            Self::Precipitation => write!(f, "precipitation"),
        }
    }
}

/// Where a forecast observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastSource {
    File,
    Api,
    Venue,
}

/// Confirmation lifecycle of a snapshot. Transitions are monotone within a
/// single produced_at: Pending -> Unconfirmed -> FileConfirmed, with
/// ApiUnconfirmed as the entry state for API-first observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationState {
    Pending,
    Unconfirmed,
    ApiUnconfirmed,
    FileConfirmed,
}

/// A forecast observation for one (city, metric) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSnapshot {
    pub city_id: String,
    pub metric: MetricType,
    /// Native-unit value (°C / km/h / mm).
    pub value: f64,
    pub valid_time: DateTime<Utc>,
    pub source: ForecastSource,
    pub confirmation: ConfirmationState,
    pub produced_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_key: Option<CycleKey>,
}

impl ForecastSnapshot {
    /// Temperature in °F for venue-boundary math; identity for other metrics.
    pub fn value_for_market(&self) -> f64 {
        match self.metric {
            MetricType::Temperature => celsius_to_fahrenheit(self.value),
            _ => self.value,
        }
    }
}

/// One decoded grid point for a target city.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub lat: f64,
    pub lon: f64,
    pub temp_k: f64,
    pub wind_u: f64,
    pub wind_v: f64,
    pub precip_mm: f64,
}

/// Geographic coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
}

/// Which side of a binary market an order takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Yes,
    No,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "yes"),
            Self::No => write!(f, "no"),
        }
    }
}

/// Direction of a market's threshold question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Above,
    Below,
}

impl std::fmt::Display for Comparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Above => write!(f, "above"),
            Self::Below => write!(f, "below"),
        }
    }
}

/// Operational mode of the hybrid controller. Exactly one is active for the
/// whole process at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineMode {
    OpenMeteoPolling,
    MeteosourcePolling,
    WebsocketRest,
    RoundRobinBurst,
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenMeteoPolling => write!(f, "OPEN_METEO_POLLING"),
            Self::MeteosourcePolling => write!(f, "METEOSOURCE_POLLING"),
            Self::WebsocketRest => write!(f, "WEBSOCKET_REST"),
            Self::RoundRobinBurst => write!(f, "ROUND_ROBIN_BURST"),
        }
    }
}

impl std::str::FromStr for EngineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OPEN_METEO_POLLING" => Ok(Self::OpenMeteoPolling),
            "METEOSOURCE_POLLING" => Ok(Self::MeteosourcePolling),
            "WEBSOCKET_REST" => Ok(Self::WebsocketRest),
            "ROUND_ROBIN_BURST" => Ok(Self::RoundRobinBurst),
            other => Err(format!("unknown engine mode: {other}")),
        }
    }
}

/// UTC urgency regime used by the mode controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

/// A sized, risk-approved order request bound for the trading venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub intent_id: String,
    pub market_id: String,
    pub side: TradeSide,
    pub size_usd: f64,
    pub price_limit: f64,
    pub edge: f64,
    pub kelly_fraction: f64,
    pub sigma: f64,
    /// Forecast value in market units (°F / mm) at signal time.
    pub forecast_value: f64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Unit conversions
// ---------------------------------------------------------------------------

pub fn kelvin_to_celsius(k: f64) -> f64 {
    k - 273.15
}

pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

/// Wind speed from U/V components, same unit as the inputs.
pub fn wind_speed(u: f64, v: f64) -> f64 {
    (u * u + v * v).sqrt()
}

/// Wind direction from U/V components in degrees, normalized to [0, 360).
pub fn wind_direction_deg(u: f64, v: f64) -> f64 {
    v.atan2(u).to_degrees().rem_euclid(360.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_key_start_and_next() {
        let key = CycleKey::new(
            ModelKind::Hrrr,
            NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
            23,
        );
        assert_eq!(key.cycle_start().to_rfc3339(), "2026-02-01T23:00:00+00:00");

        let next = key.next();
        assert_eq!(next.cycle_hour, 0);
        assert_eq!(next.cycle_date, NaiveDate::from_ymd_opt(2026, 2, 2).unwrap());

        let gfs = CycleKey::new(
            ModelKind::Gfs,
            NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
            18,
        );
        assert_eq!(gfs.next().cycle_hour, 0);
    }

    #[test]
    fn kelvin_chain_matches_known_values() {
        // 275.15 K = 2.0 °C = 35.6 °F
        let c = kelvin_to_celsius(275.15);
        assert!((c - 2.0).abs() < 1e-9);
        assert!((celsius_to_fahrenheit(c) - 35.6).abs() < 1e-9);
    }

    #[test]
    fn wind_speed_squares() {
        let u = 3.0;
        let v = 4.0;
        let s = wind_speed(u, v);
        assert!((s * s - (u * u + v * v)).abs() < 1e-9);
    }

    #[test]
    fn wind_direction_normalized() {
        assert!((wind_direction_deg(1.0, 0.0) - 0.0).abs() < 1e-9);
        assert!((wind_direction_deg(0.0, 1.0) - 90.0).abs() < 1e-9);
        let d = wind_direction_deg(-1.0, -1.0);
        assert!((0.0..360.0).contains(&d));
    }

    #[test]
    fn engine_mode_round_trips_through_strings() {
        for mode in [
            EngineMode::OpenMeteoPolling,
            EngineMode::MeteosourcePolling,
            EngineMode::WebsocketRest,
            EngineMode::RoundRobinBurst,
        ] {
            let s = mode.to_string();
            assert_eq!(s.parse::<EngineMode>().unwrap(), mode);
        }
    }
}
