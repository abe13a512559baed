// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Every tunable lives here so the engine can be reconfigured without a
// restart. Persistence uses the tmp + rename pattern, and every field
// carries a serde default so older config files keep loading.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::controller::ControllerSettings;
use crate::execution::ExecutionSettings;
use crate::exits::ExitSettings;
use crate::ingest::confirmation::{ChangeTriggers, Tolerances};
use crate::ingest::detector::DetectorSettings;
use crate::ingest::fallback::FallbackSettings;
use crate::kill_switch::KillSwitchLimits;
use crate::schedule::ScheduleSettings;
use crate::strategy::engine::StrategySettings;
use crate::strategy::sizing::SizingConfig;
use crate::types::ModelKind;

// =============================================================================
// Default-value helpers (required by serde `default = "..."`)
// =============================================================================

fn default_poll_interval_ms() -> u64 {
    150
}

fn default_max_detection_minutes() -> i64 {
    30
}

fn default_download_timeout_ms() -> u64 {
    5_000
}

fn default_fallback_poll_ms() -> u64 {
    1_000
}

fn default_fallback_max_minutes() -> i64 {
    5
}

fn default_min_edge_threshold() -> f64 {
    0.08
}

fn default_min_sigma_for_arb() -> f64 {
    0.5
}

fn default_min_execution_edge() -> f64 {
    0.02
}

fn default_edge_degradation_tolerance() -> f64 {
    0.05
}

fn default_max_price_drift() -> f64 {
    0.15
}

fn default_trade_cooldown_ms() -> u64 {
    30_000
}

fn default_max_position_size() -> f64 {
    50.0
}

fn default_kelly_fraction() -> f64 {
    0.25
}

fn default_max_total_exposure() -> f64 {
    0.50
}

fn default_max_kelly_heat() -> f64 {
    0.30
}

fn default_min_cash_reserve() -> f64 {
    0.10
}

fn default_take_profit() -> f64 {
    0.10
}

fn default_stop_loss() -> f64 {
    -0.15
}

fn default_trailing_activation() -> f64 {
    0.05
}

fn default_trailing_offset() -> f64 {
    0.02
}

fn default_daily_loss_limit() -> f64 {
    0.20
}

fn default_max_drawdown_limit() -> f64 {
    0.25
}

fn default_consecutive_loss_limit() -> u32 {
    5
}

fn default_cooldown_hours() -> i64 {
    24
}

fn default_min_trades_before_kill() -> u32 {
    10
}

fn default_graceful_shutdown_ms() -> u64 {
    3_000
}

fn default_decoder_binary() -> String {
    "wgrib2".to_string()
}

fn default_starting_capital() -> f64 {
    1_000.0
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_burst_trigger_threshold() -> f64 {
    1.0
}

// =============================================================================
// Early-start buffers
// =============================================================================

/// Minutes before the typical publish instant at which head-polling begins,
/// per model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EarlyStartMinutes {
    pub hrrr: i64,
    pub rap: i64,
    pub gfs: i64,
    pub ecmwf: i64,
}

impl Default for EarlyStartMinutes {
    fn default() -> Self {
        Self {
            hrrr: 25,
            rap: 25,
            gfs: 2,
            ecmwf: 5,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Detection ----------------------------------------------------------
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_detection_minutes")]
    pub max_detection_minutes: i64,

    #[serde(default = "default_download_timeout_ms")]
    pub download_timeout_ms: u64,

    #[serde(default = "default_fallback_poll_ms")]
    pub fallback_poll_ms: u64,

    #[serde(default = "default_fallback_max_minutes")]
    pub fallback_max_minutes: i64,

    #[serde(default)]
    pub early_start_minutes: EarlyStartMinutes,

    /// External GRIB decoder binary.
    #[serde(default = "default_decoder_binary")]
    pub decoder_binary: String,

    // --- Confirmation -------------------------------------------------------
    #[serde(default)]
    pub tolerances: Tolerances,

    #[serde(default)]
    pub change_triggers: ChangeTriggers,

    // --- Strategy -----------------------------------------------------------
    #[serde(default = "default_min_edge_threshold")]
    pub min_edge_threshold: f64,

    #[serde(default = "default_min_sigma_for_arb")]
    pub min_sigma_for_arb: f64,

    #[serde(default = "default_trade_cooldown_ms")]
    pub trade_cooldown_ms: u64,

    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,

    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,

    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,

    #[serde(default = "default_max_kelly_heat")]
    pub max_kelly_heat: f64,

    #[serde(default = "default_min_cash_reserve")]
    pub min_cash_reserve: f64,

    // --- Execution ----------------------------------------------------------
    #[serde(default = "default_min_execution_edge")]
    pub min_execution_edge: f64,

    #[serde(default = "default_edge_degradation_tolerance")]
    pub edge_degradation_tolerance: f64,

    #[serde(default = "default_max_price_drift")]
    pub max_price_drift: f64,

    // --- Exits --------------------------------------------------------------
    #[serde(default = "default_take_profit")]
    pub take_profit: f64,

    #[serde(default = "default_stop_loss")]
    pub stop_loss: f64,

    #[serde(default = "default_trailing_activation")]
    pub trailing_activation: f64,

    #[serde(default = "default_trailing_offset")]
    pub trailing_offset: f64,

    // --- Kill switch --------------------------------------------------------
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,

    #[serde(default = "default_max_drawdown_limit")]
    pub max_drawdown_limit: f64,

    #[serde(default = "default_consecutive_loss_limit")]
    pub consecutive_loss_limit: u32,

    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: i64,

    #[serde(default = "default_min_trades_before_kill")]
    pub min_trades_before_kill: u32,

    // --- Controller ---------------------------------------------------------
    #[serde(default = "default_burst_trigger_threshold")]
    pub burst_trigger_threshold: f64,

    #[serde(default)]
    pub websocket_rest_enabled: bool,

    // --- Process ------------------------------------------------------------
    #[serde(default = "default_graceful_shutdown_ms")]
    pub graceful_shutdown_ms: u64,

    #[serde(default = "default_starting_capital")]
    pub starting_capital: f64,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Venue price-stream WebSocket URL; demo mode when absent.
    #[serde(default)]
    pub venue_ws_url: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(path = %path.display(), "runtime config loaded");
        config.validate()?;
        Ok(config)
    }

    /// Persist atomically (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialize runtime config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Startup-fatal consistency checks.
    pub fn validate(&self) -> Result<()> {
        if self.max_kelly_heat <= 0.0 || self.max_kelly_heat > 1.0 {
            anyhow::bail!("max_kelly_heat must be in (0, 1]");
        }
        if self.max_total_exposure <= 0.0 || self.max_total_exposure > 1.0 {
            anyhow::bail!("max_total_exposure must be in (0, 1]");
        }
        if !(0.0..1.0).contains(&self.min_cash_reserve) {
            anyhow::bail!("min_cash_reserve must be in [0, 1)");
        }
        if self.min_cash_reserve + self.max_total_exposure > 1.0 + 1e-9 {
            anyhow::bail!("min_cash_reserve + max_total_exposure exceed the portfolio");
        }
        if self.stop_loss >= 0.0 {
            anyhow::bail!("stop_loss must be negative");
        }
        if self.starting_capital <= 0.0 {
            anyhow::bail!("starting_capital must be positive");
        }
        if self.decoder_binary.is_empty() {
            anyhow::bail!("decoder_binary must be set");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Subsystem settings builders
    // -------------------------------------------------------------------------

    pub fn schedule_settings(&self) -> ScheduleSettings {
        let mut early = std::collections::HashMap::new();
        early.insert(ModelKind::Hrrr, self.early_start_minutes.hrrr);
        early.insert(ModelKind::Rap, self.early_start_minutes.rap);
        early.insert(ModelKind::Gfs, self.early_start_minutes.gfs);
        early.insert(ModelKind::Ecmwf, self.early_start_minutes.ecmwf);
        ScheduleSettings {
            max_detection_minutes: self.max_detection_minutes,
            fallback_max_minutes: self.fallback_max_minutes,
            early_start_minutes: early,
        }
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            poll_interval_ms: self.poll_interval_ms,
            download_timeout_ms: self.download_timeout_ms,
        }
    }

    pub fn fallback_settings(&self) -> FallbackSettings {
        FallbackSettings {
            poll_interval_ms: self.fallback_poll_ms,
        }
    }

    pub fn strategy_settings(&self) -> StrategySettings {
        StrategySettings {
            min_edge_threshold: self.min_edge_threshold,
            min_sigma_for_arb: self.min_sigma_for_arb,
            trade_cooldown_ms: self.trade_cooldown_ms,
            sizing: SizingConfig {
                kelly_fraction: self.kelly_fraction,
                max_position_size: self.max_position_size,
                max_total_exposure: self.max_total_exposure,
                max_kelly_heat: self.max_kelly_heat,
                min_cash_reserve: self.min_cash_reserve,
                ..SizingConfig::default()
            },
        }
    }

    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            min_execution_edge: self.min_execution_edge,
            edge_degradation_tolerance: self.edge_degradation_tolerance,
            max_price_drift: self.max_price_drift,
            ..ExecutionSettings::default()
        }
    }

    pub fn exit_settings(&self) -> ExitSettings {
        ExitSettings {
            take_profit: self.take_profit,
            stop_loss: self.stop_loss,
            trailing_activation: self.trailing_activation,
            trailing_offset: self.trailing_offset,
            ..ExitSettings::default()
        }
    }

    pub fn kill_switch_limits(&self) -> KillSwitchLimits {
        KillSwitchLimits {
            daily_loss_limit: self.daily_loss_limit,
            max_drawdown_limit: self.max_drawdown_limit,
            consecutive_loss_limit: self.consecutive_loss_limit,
            cooldown_hours: self.cooldown_hours,
            min_trades_before_kill: self.min_trades_before_kill,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            burst_trigger_threshold: self.burst_trigger_threshold,
            websocket_rest_enabled: self.websocket_rest_enabled,
            ..ControllerSettings::default()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.poll_interval_ms, 150);
        assert_eq!(cfg.max_detection_minutes, 30);
        assert_eq!(cfg.download_timeout_ms, 5_000);
        assert_eq!(cfg.fallback_poll_ms, 1_000);
        assert_eq!(cfg.fallback_max_minutes, 5);
        assert_eq!(cfg.early_start_minutes.hrrr, 25);
        assert_eq!(cfg.early_start_minutes.gfs, 2);
        assert_eq!(cfg.early_start_minutes.ecmwf, 5);
        assert!((cfg.min_edge_threshold - 0.08).abs() < 1e-12);
        assert!((cfg.min_sigma_for_arb - 0.5).abs() < 1e-12);
        assert!((cfg.min_execution_edge - 0.02).abs() < 1e-12);
        assert!((cfg.edge_degradation_tolerance - 0.05).abs() < 1e-12);
        assert!((cfg.max_price_drift - 0.15).abs() < 1e-12);
        assert_eq!(cfg.trade_cooldown_ms, 30_000);
        assert!((cfg.max_position_size - 50.0).abs() < 1e-12);
        assert!((cfg.kelly_fraction - 0.25).abs() < 1e-12);
        assert!((cfg.max_total_exposure - 0.50).abs() < 1e-12);
        assert!((cfg.max_kelly_heat - 0.30).abs() < 1e-12);
        assert!((cfg.min_cash_reserve - 0.10).abs() < 1e-12);
        assert!((cfg.take_profit - 0.10).abs() < 1e-12);
        assert!((cfg.stop_loss + 0.15).abs() < 1e-12);
        assert!((cfg.daily_loss_limit - 0.20).abs() < 1e-12);
        assert!((cfg.max_drawdown_limit - 0.25).abs() < 1e-12);
        assert_eq!(cfg.consecutive_loss_limit, 5);
        assert_eq!(cfg.cooldown_hours, 24);
        assert_eq!(cfg.graceful_shutdown_ms, 3_000);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.poll_interval_ms, 150);
        assert!(cfg.venue_ws_url.is_none());
        assert!(!cfg.websocket_rest_enabled);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "poll_interval_ms": 200, "kelly_fraction": 0.1 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.poll_interval_ms, 200);
        assert!((cfg.kelly_fraction - 0.1).abs() < 1e-12);
        assert_eq!(cfg.trade_cooldown_ms, 30_000);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.max_position_size = 75.0;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert!((loaded.max_position_size - 75.0).abs() < 1e-12);
        assert_eq!(loaded.poll_interval_ms, cfg.poll_interval_ms);
    }

    #[test]
    fn validation_rejects_inconsistent_risk_limits() {
        let mut cfg = RuntimeConfig::default();
        cfg.max_kelly_heat = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.stop_loss = 0.15;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.min_cash_reserve = 0.6;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn subsystem_builders_propagate_values() {
        let mut cfg = RuntimeConfig::default();
        cfg.kelly_fraction = 0.125;
        cfg.take_profit = 0.2;
        let strat = cfg.strategy_settings();
        assert!((strat.sizing.kelly_fraction - 0.125).abs() < 1e-12);
        let exits = cfg.exit_settings();
        assert!((exits.take_profit - 0.2).abs() < 1e-12);
        let sched = cfg.schedule_settings();
        assert_eq!(sched.early_start_minutes[&ModelKind::Hrrr], 25);
    }
}
