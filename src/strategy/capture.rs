// =============================================================================
// Capture registry — at-most-one capture per (market, forecast value)
// =============================================================================
//
// The single most important trade-duplication guard. A capture is stored on
// each successful submission; further signals on that market are blocked
// until the forecast moves by at least one unit (°F or mm) from the captured
// value, at which point the capture clears and the market is eligible again.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

/// Forecast drift (market units) required to supersede a capture.
pub const CAPTURE_RELEASE_DELTA: f64 = 1.0;

#[derive(Debug, Clone, Serialize)]
pub struct CapturedOpportunity {
    pub market_id: String,
    pub forecast_value_at_capture: f64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureDecision {
    /// No active capture (or it was just released by drift).
    Eligible,
    /// An active capture blocks this signal.
    Blocked,
}

pub struct CaptureRegistry {
    captures: Mutex<HashMap<String, CapturedOpportunity>>,
}

impl CaptureRegistry {
    pub fn new() -> Self {
        Self {
            captures: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate a new forecast value against any active capture. A drift of
    /// at least [`CAPTURE_RELEASE_DELTA`] clears the capture in the same
    /// call and reports the market eligible.
    pub fn check(&self, market_id: &str, forecast_value: f64) -> CaptureDecision {
        let mut captures = self.captures.lock();
        match captures.get(market_id) {
            None => CaptureDecision::Eligible,
            Some(cap) => {
                let drift = (forecast_value - cap.forecast_value_at_capture).abs();
                if drift >= CAPTURE_RELEASE_DELTA {
                    info!(
                        market = market_id,
                        captured = cap.forecast_value_at_capture,
                        new = forecast_value,
                        drift,
                        "capture superseded — market eligible again"
                    );
                    captures.remove(market_id);
                    CaptureDecision::Eligible
                } else {
                    debug!(
                        market = market_id,
                        captured = cap.forecast_value_at_capture,
                        new = forecast_value,
                        drift,
                        "capture active — signal blocked"
                    );
                    CaptureDecision::Blocked
                }
            }
        }
    }

    /// Record a capture after a successful submission.
    pub fn record(&self, market_id: &str, forecast_value: f64) {
        let cap = CapturedOpportunity {
            market_id: market_id.to_string(),
            forecast_value_at_capture: forecast_value,
            captured_at: Utc::now(),
        };
        self.captures.lock().insert(market_id.to_string(), cap);
    }

    /// Drop the capture for a market (e.g. market removed).
    pub fn clear(&self, market_id: &str) {
        self.captures.lock().remove(market_id);
    }

    pub fn snapshot(&self) -> Vec<CapturedOpportunity> {
        let mut out: Vec<CapturedOpportunity> = self.captures.lock().values().cloned().collect();
        out.sort_by(|a, b| a.market_id.cmp(&b.market_id));
        out
    }
}

impl Default for CaptureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_blocks_until_unit_drift() {
        let reg = CaptureRegistry::new();
        assert_eq!(reg.check("m1", 44.0), CaptureDecision::Eligible);
        reg.record("m1", 44.0);

        // Identical forecast 30 s later: blocked.
        assert_eq!(reg.check("m1", 44.0), CaptureDecision::Blocked);
        // Sub-unit drift: still blocked.
        assert_eq!(reg.check("m1", 44.9), CaptureDecision::Blocked);
        assert_eq!(reg.check("m1", 43.1), CaptureDecision::Blocked);

        // |45.2 − 44.0| ≥ 1: capture cleared, eligible again.
        assert_eq!(reg.check("m1", 45.2), CaptureDecision::Eligible);
        assert!(reg.snapshot().is_empty());
        // And stays eligible until the next record.
        assert_eq!(reg.check("m1", 44.0), CaptureDecision::Eligible);
    }

    #[test]
    fn captures_are_per_market() {
        let reg = CaptureRegistry::new();
        reg.record("m1", 44.0);
        assert_eq!(reg.check("m2", 44.0), CaptureDecision::Eligible);
        assert_eq!(reg.check("m1", 44.0), CaptureDecision::Blocked);
    }
}
