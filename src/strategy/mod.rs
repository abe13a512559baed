// =============================================================================
// Opportunity core — edge model, sizing, capture, and the signal pipeline
// =============================================================================

pub mod capture;
pub mod edge;
pub mod engine;
pub mod sizing;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::types::TradeIntent;

/// Retained rejection records.
const REJECTION_CAP: usize = 100;
/// Retained emitted intents.
const INTENT_CAP: usize = 50;

/// Pipeline stage at which an opportunity was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectStage {
    KillSwitch,
    Cooldown,
    SignalAge,
    Sigma,
    Edge,
    Capture,
    Sizing,
    Execution,
}

impl std::fmt::Display for RejectStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::KillSwitch => "kill_switch",
            Self::Cooldown => "cooldown",
            Self::SignalAge => "signal_age",
            Self::Sigma => "sigma",
            Self::Edge => "edge",
            Self::Capture => "capture",
            Self::Sizing => "sizing",
            Self::Execution => "execution",
        };
        write!(f, "{s}")
    }
}

/// One discarded opportunity, visible in the status report.
#[derive(Debug, Clone, Serialize)]
pub struct RejectionRecord {
    pub market_id: String,
    pub stage: RejectStage,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Ring buffers of recent rejections and emitted intents, shared between the
/// opportunity engine and the status report.
pub struct OpportunityLog {
    rejections: Mutex<VecDeque<RejectionRecord>>,
    intents: Mutex<VecDeque<TradeIntent>>,
}

impl OpportunityLog {
    pub fn new() -> Self {
        Self {
            rejections: Mutex::new(VecDeque::new()),
            intents: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_rejection(&self, market_id: &str, stage: RejectStage, detail: impl Into<String>) {
        let mut ring = self.rejections.lock();
        ring.push_back(RejectionRecord {
            market_id: market_id.to_string(),
            stage,
            detail: detail.into(),
            at: Utc::now(),
        });
        while ring.len() > REJECTION_CAP {
            ring.pop_front();
        }
    }

    pub fn push_intent(&self, intent: TradeIntent) {
        let mut ring = self.intents.lock();
        ring.push_back(intent);
        while ring.len() > INTENT_CAP {
            ring.pop_front();
        }
    }

    pub fn recent_rejections(&self) -> Vec<RejectionRecord> {
        self.rejections.lock().iter().cloned().collect()
    }

    pub fn recent_intents(&self) -> Vec<TradeIntent> {
        self.intents.lock().iter().cloned().collect()
    }
}

impl Default for OpportunityLog {
    fn default() -> Self {
        Self::new()
    }
}
