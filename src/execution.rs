// =============================================================================
// Execution Engine — re-validation between signal and order placement
// =============================================================================
//
// The price is re-fetched between signal formation and submission. The order
// is dropped when any of:
//   - absolute price drift since the signal snapshot exceeds the limit,
//   - the edge recomputed at the live price falls under the execution floor,
//   - the edge degraded from signal time beyond tolerance.
//
// Otherwise the limit is set to live + increment (wider for guaranteed
// outcomes), capped at 0.99, and the scale-in tranches are submitted.
// A capture is recorded on the first successful fill.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::datastore::MarketState;
use crate::positions::PositionManager;
use crate::strategy::capture::CaptureRegistry;
use crate::strategy::edge::EdgeComputation;
use crate::strategy::sizing::SizeDecision;
use crate::types::TradeIntent;
use crate::venue::{OrderReceipt, TradingVenue, SUBMIT_TIMEOUT_SECS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    pub min_execution_edge: f64,
    pub edge_degradation_tolerance: f64,
    pub max_price_drift: f64,
    pub price_increment: f64,
    pub guaranteed_price_increment: f64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            min_execution_edge: 0.02,
            edge_degradation_tolerance: 0.05,
            max_price_drift: 0.15,
            price_increment: 0.01,
            guaranteed_price_increment: 0.05,
        }
    }
}

/// Why an order was dropped at re-validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum DropReason {
    PriceDrift { drift: f64 },
    EdgeBelowMinimum { live_edge: f64 },
    EdgeDegraded { degradation: f64 },
    BookUnavailable,
    VenueError { detail: String },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PriceDrift { drift } => write!(f, "price_drift({drift:.3})"),
            Self::EdgeBelowMinimum { live_edge } => write!(f, "edge_below_minimum({live_edge:.3})"),
            Self::EdgeDegraded { degradation } => write!(f, "edge_degraded({degradation:.3})"),
            Self::BookUnavailable => write!(f, "book_unavailable"),
            Self::VenueError { detail } => write!(f, "venue_error({detail})"),
        }
    }
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    Submitted {
        position_id: String,
        receipts: Vec<OrderReceipt>,
        avg_fill_price: f64,
    },
    Dropped(DropReason),
}

pub struct ExecutionEngine {
    venue: Arc<dyn TradingVenue>,
    positions: Arc<PositionManager>,
    capture: Arc<CaptureRegistry>,
    settings: ExecutionSettings,
}

impl ExecutionEngine {
    pub fn new(
        venue: Arc<dyn TradingVenue>,
        positions: Arc<PositionManager>,
        capture: Arc<CaptureRegistry>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            venue,
            positions,
            capture,
            settings,
        }
    }

    /// Re-validate and submit a sized intent.
    pub async fn execute(
        &self,
        market: &MarketState,
        signal: &EdgeComputation,
        decision: &SizeDecision,
        intent: &TradeIntent,
    ) -> ExecutionOutcome {
        // ── Re-fetch the book ────────────────────────────────────────────
        let book = match tokio::time::timeout(
            Duration::from_secs(SUBMIT_TIMEOUT_SECS),
            self.venue.market_book(&market.market_id),
        )
        .await
        {
            Ok(Ok(book)) => book,
            Ok(Err(e)) => {
                warn!(market = %market.market_id, error = %e, "book refresh failed");
                return ExecutionOutcome::Dropped(DropReason::BookUnavailable);
            }
            Err(_) => {
                warn!(market = %market.market_id, "book refresh timed out");
                return ExecutionOutcome::Dropped(DropReason::BookUnavailable);
            }
        };

        let live_price = book.taker_price(signal.side);

        // ── Drift / edge re-checks ───────────────────────────────────────
        let drift = (live_price - signal.market_price).abs();
        if drift > self.settings.max_price_drift {
            info!(
                market = %market.market_id,
                signal_price = signal.market_price,
                live_price,
                drift,
                "order dropped: price drift"
            );
            return ExecutionOutcome::Dropped(DropReason::PriceDrift { drift });
        }

        let live_edge = signal.forecast_prob - live_price;
        if live_edge < self.settings.min_execution_edge {
            info!(
                market = %market.market_id,
                live_edge,
                "order dropped: edge below execution minimum"
            );
            return ExecutionOutcome::Dropped(DropReason::EdgeBelowMinimum { live_edge });
        }

        let degradation = signal.edge - live_edge;
        if degradation > self.settings.edge_degradation_tolerance {
            info!(
                market = %market.market_id,
                signal_edge = signal.edge,
                live_edge,
                degradation,
                "order dropped: edge degraded"
            );
            return ExecutionOutcome::Dropped(DropReason::EdgeDegraded { degradation });
        }

        // ── Price limit ──────────────────────────────────────────────────
        let increment = if signal.guaranteed {
            self.settings.guaranteed_price_increment
        } else {
            self.settings.price_increment
        };
        let price_limit = (live_price + increment).min(0.99);

        // ── Tranche submission ───────────────────────────────────────────
        let mut receipts: Vec<OrderReceipt> = Vec::new();
        for (i, tranche) in decision.tranches.iter().enumerate() {
            if tranche.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(tranche.delay_ms)).await;
            }
            let tranche_limit = (price_limit * (1.0 - tranche.price_improvement)).min(0.99);

            let submit = tokio::time::timeout(
                Duration::from_secs(SUBMIT_TIMEOUT_SECS),
                self.venue.submit_order(
                    &market.market_id,
                    signal.side,
                    tranche.size_usd,
                    tranche_limit,
                ),
            )
            .await;

            match submit {
                Ok(Ok(receipt)) => receipts.push(receipt),
                Ok(Err(e)) => {
                    if receipts.is_empty() {
                        warn!(market = %market.market_id, error = %e, "submission failed");
                        return ExecutionOutcome::Dropped(DropReason::VenueError {
                            detail: e.to_string(),
                        });
                    }
                    // Partial fill across tranches: keep what we have.
                    warn!(
                        market = %market.market_id,
                        tranche = i,
                        error = %e,
                        "tranche failed — keeping earlier fills"
                    );
                    break;
                }
                Err(_) => {
                    if receipts.is_empty() {
                        return ExecutionOutcome::Dropped(DropReason::VenueError {
                            detail: "submit timeout".to_string(),
                        });
                    }
                    break;
                }
            }
        }

        let filled_usd: f64 = receipts.iter().map(|r| r.size_usd).sum();
        let avg_fill_price = receipts
            .iter()
            .map(|r| r.fill_price * r.size_usd)
            .sum::<f64>()
            / filled_usd;

        // ── Book the position & record the capture ───────────────────────
        let position_id = self.positions.open_position(
            &market.market_id,
            &market.city_id,
            signal.side,
            filled_usd,
            avg_fill_price,
            decision.kelly_fraction,
            signal.signal_sigma,
            market.target_date,
        );
        self.capture
            .record(&market.market_id, intent.forecast_value);

        info!(
            market = %market.market_id,
            position_id = %position_id,
            side = %signal.side,
            filled_usd,
            avg_fill_price,
            price_limit,
            tranches = receipts.len(),
            "order submitted and captured"
        );

        ExecutionOutcome::Submitted {
            position_id,
            receipts,
            avg_fill_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::sizing::Tranche;
    use crate::types::{Comparison, MetricType, TradeSide};
    use crate::venue::{MarketBook, PaperVenue};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::VecDeque;

    fn market(yes: f64) -> MarketState {
        MarketState {
            market_id: "m1".into(),
            question: "NYC high >= 40F?".into(),
            city_id: "nyc".into(),
            metric: MetricType::Temperature,
            threshold: 40.0,
            comparison: Comparison::Above,
            yes_price: yes,
            no_price: 1.0 - yes,
            target_date: Utc::now() + ChronoDuration::days(1),
            last_forecast: Some(44.0),
            price_history: VecDeque::new(),
        }
    }

    fn signal(price: f64) -> EdgeComputation {
        EdgeComputation {
            forecast_value: 44.0,
            days_to_event: 1.0,
            sigma_m: 2.3,
            z: 1.74,
            forecast_prob: 0.959,
            signal_sigma: 1.74,
            edge: 0.959 - price,
            side: TradeSide::Yes,
            market_price: price,
            guaranteed: false,
        }
    }

    fn decision(size: f64) -> SizeDecision {
        SizeDecision {
            size_usd: size,
            kelly_fraction: 0.25,
            decay: 1.0,
            concentration_bonus: false,
            tranches: vec![Tranche {
                size_usd: size,
                price_improvement: 0.0,
                delay_ms: 0,
            }],
        }
    }

    fn intent() -> TradeIntent {
        TradeIntent {
            intent_id: "i1".into(),
            market_id: "m1".into(),
            side: TradeSide::Yes,
            size_usd: 25.0,
            price_limit: 0.47,
            edge: 0.509,
            kelly_fraction: 0.25,
            sigma: 1.74,
            forecast_value: 44.0,
            created_at: Utc::now(),
        }
    }

    fn engine(
        venue: Arc<PaperVenue>,
    ) -> (ExecutionEngine, Arc<PositionManager>, Arc<CaptureRegistry>) {
        let positions = Arc::new(PositionManager::new(1_000.0));
        let capture = Arc::new(CaptureRegistry::new());
        let e = ExecutionEngine::new(
            venue,
            positions.clone(),
            capture.clone(),
            ExecutionSettings::default(),
        );
        (e, positions, capture)
    }

    fn book(bid: f64, ask: f64) -> MarketBook {
        MarketBook {
            market_id: "m1".into(),
            yes_bid: bid,
            yes_ask: ask,
            bid_depth: 500.0,
            ask_depth: 500.0,
        }
    }

    #[tokio::test]
    async fn drops_on_price_drift() {
        let venue = Arc::new(PaperVenue::new());
        // Signal formed at 0.45; live ask now 0.61 → drift 0.16 > 0.15.
        venue.set_book(book(0.59, 0.61));
        let (e, positions, capture) = engine(venue);

        let out = e
            .execute(&market(0.45), &signal(0.45), &decision(25.0), &intent())
            .await;
        match out {
            ExecutionOutcome::Dropped(DropReason::PriceDrift { drift }) => {
                assert!((drift - 0.16).abs() < 1e-9);
            }
            other => panic!("expected drift drop, got {other:?}"),
        }
        assert!(positions.get_open_positions().is_empty());
        assert!(capture.snapshot().is_empty());
    }

    #[tokio::test]
    async fn submits_within_limits_and_records_capture() {
        let venue = Arc::new(PaperVenue::new());
        venue.set_book(book(0.44, 0.46));
        let (e, positions, capture) = engine(venue.clone());

        let out = e
            .execute(&market(0.45), &signal(0.45), &decision(25.0), &intent())
            .await;
        match out {
            ExecutionOutcome::Submitted { avg_fill_price, .. } => {
                assert!((avg_fill_price - 0.46).abs() < 1e-9);
            }
            other => panic!("expected submit, got {other:?}"),
        }
        assert_eq!(positions.get_open_positions().len(), 1);
        assert_eq!(capture.snapshot().len(), 1);
        assert_eq!(venue.submissions().len(), 1);
    }

    #[tokio::test]
    async fn drops_when_live_edge_below_floor() {
        let venue = Arc::new(PaperVenue::new());
        // Signal formed at 0.93; live ask 0.95 → live edge 0.009 < 0.02
        // while drift (0.02) stays inside the limit.
        venue.set_book(book(0.93, 0.95));
        let (e, _positions, _capture) = engine(venue);

        let out = e
            .execute(&market(0.93), &signal(0.93), &decision(25.0), &intent())
            .await;
        assert!(matches!(
            out,
            ExecutionOutcome::Dropped(DropReason::EdgeBelowMinimum { .. })
        ));
    }

    #[tokio::test]
    async fn drops_on_edge_degradation() {
        let venue = Arc::new(PaperVenue::new());
        // Signal at 0.45 (edge 0.509); live 0.52 → live edge 0.439,
        // degradation 0.07 > 0.05 while drift 0.07 < 0.15.
        venue.set_book(book(0.50, 0.52));
        let (e, _positions, _capture) = engine(venue);

        let out = e
            .execute(&market(0.45), &signal(0.45), &decision(25.0), &intent())
            .await;
        assert!(matches!(
            out,
            ExecutionOutcome::Dropped(DropReason::EdgeDegraded { .. })
        ));
    }

    #[tokio::test]
    async fn tranches_fill_at_improving_limits() {
        let venue = Arc::new(PaperVenue::new());
        venue.set_book(book(0.44, 0.46));
        let (e, positions, _capture) = engine(venue.clone());

        let d = SizeDecision {
            size_usd: 120.0,
            kelly_fraction: 0.25,
            decay: 1.0,
            concentration_bonus: false,
            tranches: vec![
                Tranche {
                    size_usd: 40.0,
                    price_improvement: 0.0,
                    delay_ms: 0,
                },
                Tranche {
                    size_usd: 40.0,
                    price_improvement: 0.005,
                    delay_ms: 0,
                },
                Tranche {
                    size_usd: 40.0,
                    price_improvement: 0.010,
                    delay_ms: 0,
                },
            ],
        };
        let out = e
            .execute(&market(0.45), &signal(0.45), &d, &intent())
            .await;
        match out {
            ExecutionOutcome::Submitted { receipts, .. } => assert_eq!(receipts.len(), 3),
            other => panic!("expected submit, got {other:?}"),
        }
        let pos = &positions.get_open_positions()[0];
        assert!((pos.size_usd() - 120.0).abs() < 1e-6);
    }
}
