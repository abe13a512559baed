// =============================================================================
// Central Application State — Stratus trading engine
// =============================================================================
//
// Ties the subsystems together and builds the unified StatusReport consumed
// by the REST surface. Subsystems own their state behind their own locks;
// AppState only aggregates snapshots — building a report never holds a
// hot-path lock longer than a clone.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::api_tracker::{ApiCallTracker, DayArchive, ProviderUsageSnapshot};
use crate::bus::EventBus;
use crate::controller::{ControllerSnapshot, HybridController};
use crate::datastore::DataStore;
use crate::ingest::confirmation::ConfirmationManager;
use crate::kill_switch::{KillSwitch, KillSwitchState};
use crate::positions::{Position, PositionManager};
use crate::runtime_config::RuntimeConfig;
use crate::strategy::capture::{CaptureRegistry, CapturedOpportunity};
use crate::strategy::{OpportunityLog, RejectionRecord};
use crate::types::TradeIntent;

/// Maximum retained error records.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the status report.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: String,
}

pub struct AppState {
    pub state_version: AtomicU64,
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub bus: Arc<EventBus>,
    pub tracker: Arc<ApiCallTracker>,
    pub store: Arc<DataStore>,
    pub positions: Arc<PositionManager>,
    pub kill_switch: Arc<KillSwitch>,
    pub capture: Arc<CaptureRegistry>,
    pub controller: Arc<HybridController>,
    pub confirmation: Arc<ConfirmationManager>,
    pub opportunity_log: Arc<OpportunityLog>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn push_error(&self, msg: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message: msg,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    /// Build the full status report.
    pub fn status_report(&self) -> StatusReport {
        let positions = self.positions.get_open_positions();
        let total_exposure: f64 = positions.iter().map(|p| p.market_value()).sum();
        let kelly_heat: f64 = positions.iter().map(|p| p.kelly_fraction).sum();
        let unrealized_pnl: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();

        let portfolio = PortfolioReport {
            portfolio_value: self.positions.portfolio_value(),
            cash: self.positions.cash(),
            starting_capital: self.positions.starting_capital(),
            total_exposure,
            kelly_heat,
            unrealized_pnl,
            open_positions: positions.len(),
        };

        StatusReport {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            controller: self.controller.snapshot(),
            providers: self.tracker.snapshot(),
            previous_day: self.tracker.last_archive(),
            kill_switch: self.kill_switch.state(),
            portfolio,
            positions,
            captures: self.capture.snapshot(),
            tracked_markets: self.store.len(),
            recent_rejections: self.opportunity_log.recent_rejections(),
            recent_intents: self.opportunity_log.recent_intents(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

/// Portfolio aggregates for the status report.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioReport {
    pub portfolio_value: f64,
    pub cash: f64,
    pub starting_capital: f64,
    pub total_exposure: f64,
    pub kelly_heat: f64,
    pub unrealized_pnl: f64,
    pub open_positions: usize,
}

/// Full engine status, served by `GET /api/v1/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub controller: ControllerSnapshot,
    pub providers: Vec<ProviderUsageSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_day: Option<DayArchive>,
    pub kill_switch: KillSwitchState,
    pub portfolio: PortfolioReport,
    pub positions: Vec<Position>,
    pub captures: Vec<CapturedOpportunity>,
    pub tracked_markets: usize,
    pub recent_rejections: Vec<RejectionRecord>,
    pub recent_intents: Vec<TradeIntent>,
    pub recent_errors: Vec<ErrorRecord>,
}
