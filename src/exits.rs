// =============================================================================
// Exit Monitor — take-profit / stop-loss / trailing / fair-value / time-out
// =============================================================================
//
// Wakes once a second, marks every open position with its market's latest
// side price, then evaluates the exit rules:
//
//   1. Target date passed        -> close (treated as resolution).
//   2. Trailing stop (dominates once armed at +5% profit; stop rides
//      peak × (1 − offset)).
//   3. Take-profit at +10%.      } exclusive with
//   4. Stop-loss at −15%.        } each other
//   5. Fair-value convergence: |live price − forecast probability| inside
//      the band.
//
// Realized PnL from every close feeds the kill switch.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::bus::{Event, EventBus};
use crate::datastore::DataStore;
use crate::kill_switch::KillSwitch;
use crate::positions::PositionManager;
use crate::strategy::edge;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitSettings {
    /// Fractional gain at which to take profit (0.10 = +10 %).
    pub take_profit: f64,
    /// Fractional loss at which to stop out (−0.15 = −15 %).
    pub stop_loss: f64,
    /// Profit fraction that arms the trailing stop.
    pub trailing_activation: f64,
    /// Trailing distance below the peak, fractional.
    pub trailing_offset: f64,
    /// Fair-value convergence band, absolute price.
    pub convergence_band: f64,
}

impl Default for ExitSettings {
    fn default() -> Self {
        Self {
            take_profit: 0.10,
            stop_loss: -0.15,
            trailing_activation: 0.05,
            trailing_offset: 0.02,
            convergence_band: 0.02,
        }
    }
}

/// A pending exit decision: (position id, reason, close price).
type ExitDecision = (String, String, f64);

pub struct ExitMonitor {
    store: Arc<DataStore>,
    positions: Arc<PositionManager>,
    kill_switch: Arc<KillSwitch>,
    bus: Arc<EventBus>,
    settings: ExitSettings,
}

impl ExitMonitor {
    pub fn new(
        store: Arc<DataStore>,
        positions: Arc<PositionManager>,
        kill_switch: Arc<KillSwitch>,
        bus: Arc<EventBus>,
        settings: ExitSettings,
    ) -> Self {
        Self {
            store,
            positions,
            kill_switch,
            bus,
            settings,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            take_profit = self.settings.take_profit,
            stop_loss = self.settings.stop_loss,
            "exit monitor started"
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }

    /// One evaluation pass. Split from the loop for tests.
    pub fn tick(&self) {
        let open = self.positions.get_open_positions();
        if open.is_empty() {
            return;
        }

        // Mark every touched market once.
        for pos in &open {
            if let Some(market) = self.store.get(&pos.market_id) {
                self.positions
                    .update_prices(&pos.market_id, market.yes_price, market.no_price);
            }
        }

        let exits = self.evaluate();
        for (id, reason, price) in exits {
            if let Some(realized) = self.positions.close_position(&id, &reason, price) {
                self.kill_switch.record_realized(realized);
                let market_id = self
                    .positions
                    .get_closed_positions(1)
                    .first()
                    .map(|p| p.market_id.clone())
                    .unwrap_or_default();
                self.bus.publish(Event::PositionClosed {
                    position_id: id,
                    market_id,
                    realized_pnl: realized,
                    reason,
                });
            }
        }
    }

    /// Evaluate all open positions and return the exits to apply. Arms and
    /// rides trailing stops as a side effect.
    fn evaluate(&self) -> Vec<ExitDecision> {
        let now = Utc::now();
        let mut exits: Vec<ExitDecision> = Vec::new();

        for pos in self.positions.get_open_positions() {
            let price = pos.current_price;
            if price <= 0.0 {
                continue;
            }
            let pnl_pct = pos.unrealized_pnl_pct;

            // ── 1. Target date passed ────────────────────────────────────
            if now >= pos.target_date {
                exits.push((pos.id.clone(), "TargetDatePassed".into(), price));
                continue;
            }

            // ── 2. Trailing stop management ──────────────────────────────
            let mut armed = pos.trailing_armed;
            if !armed && pnl_pct >= self.settings.trailing_activation {
                armed = true;
                let stop = pos.peak_price * (1.0 - self.settings.trailing_offset);
                self.positions.with_position(&pos.id, |p| {
                    p.trailing_armed = true;
                    p.trailing_stop = Some(stop);
                });
                debug!(id = %pos.id, stop, "trailing stop armed");
            } else if armed {
                // Ride the peak upward.
                let stop = pos.peak_price * (1.0 - self.settings.trailing_offset);
                if pos.trailing_stop.map(|s| stop > s).unwrap_or(true) {
                    self.positions
                        .with_position(&pos.id, |p| p.trailing_stop = Some(stop));
                }
            }

            if armed {
                // Trailing dominates take-profit and stop-loss once armed.
                let stop = pos
                    .trailing_stop
                    .unwrap_or(pos.peak_price * (1.0 - self.settings.trailing_offset));
                if price <= stop {
                    exits.push((pos.id.clone(), "TrailingStop".into(), price));
                    continue;
                }
            } else {
                // ── 3/4. Take-profit and stop-loss (exclusive) ───────────
                if pnl_pct >= self.settings.take_profit {
                    exits.push((pos.id.clone(), "TakeProfit".into(), price));
                    continue;
                }
                if pnl_pct <= self.settings.stop_loss {
                    exits.push((pos.id.clone(), "StopLoss".into(), price));
                    continue;
                }
            }

            // ── 5. Fair-value convergence ────────────────────────────────
            if let Some(market) = self.store.get(&pos.market_id) {
                if let Some(forecast) = market.last_forecast {
                    let fair = edge::side_probability(&market, forecast, pos.side, now);
                    if (price - fair).abs() < self.settings.convergence_band {
                        exits.push((pos.id.clone(), "FairValueConvergence".into(), price));
                        continue;
                    }
                }
            }
        }

        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MarketState;
    use crate::kill_switch::KillSwitchLimits;
    use crate::types::{Comparison, MetricType, TradeSide};
    use chrono::Duration as ChronoDuration;
    use std::collections::VecDeque;

    struct Rig {
        monitor: ExitMonitor,
        store: Arc<DataStore>,
        positions: Arc<PositionManager>,
        kill_switch: Arc<KillSwitch>,
    }

    fn rig() -> Rig {
        rig_with(ExitSettings::default())
    }

    fn rig_with(settings: ExitSettings) -> Rig {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(DataStore::new());
        let positions = Arc::new(PositionManager::new(1_000.0));
        let kill_switch = Arc::new(KillSwitch::new(1_000.0, KillSwitchLimits::default()));
        let monitor = ExitMonitor::new(
            store.clone(),
            positions.clone(),
            kill_switch.clone(),
            bus,
            settings,
        );
        Rig {
            monitor,
            store,
            positions,
            kill_switch,
        }
    }

    fn market(id: &str, yes: f64, forecast: Option<f64>, days: i64) -> MarketState {
        MarketState {
            market_id: id.into(),
            question: "q".into(),
            city_id: "nyc".into(),
            metric: MetricType::Temperature,
            threshold: 40.0,
            comparison: Comparison::Above,
            yes_price: yes,
            no_price: 1.0 - yes,
            target_date: Utc::now() + ChronoDuration::days(days),
            last_forecast: forecast,
            price_history: VecDeque::new(),
        }
    }

    fn open_yes(r: &Rig, id: &str, entry: f64) -> String {
        r.positions.open_position(
            id,
            "nyc",
            TradeSide::Yes,
            50.0,
            entry,
            0.25,
            1.7,
            Utc::now() + ChronoDuration::days(1),
        )
    }

    #[test]
    fn take_profit_closes_at_ten_percent() {
        // Activation above TP keeps the trail disarmed so the fixed
        // take-profit is observable.
        let r = rig_with(ExitSettings {
            trailing_activation: 0.50,
            ..ExitSettings::default()
        });
        r.store.upsert_market(market("m1", 0.50, None, 1));
        let id = open_yes(&r, "m1", 0.50);

        r.store.update_price("m1", 0.56, 0.44); // +12 %
        r.monitor.tick();

        assert!(r.positions.get_open_positions().is_empty());
        let closed = r.positions.get_closed_positions(1);
        assert_eq!(closed[0].id, id);
        assert_eq!(closed[0].close_reason.as_deref(), Some("TakeProfit"));
        assert!(closed[0].realized_pnl > 0.0);
    }

    #[test]
    fn stop_loss_closes_at_fifteen_percent_down() {
        let r = rig();
        r.store.upsert_market(market("m1", 0.50, None, 1));
        open_yes(&r, "m1", 0.50);

        r.store.update_price("m1", 0.42, 0.58); // −16 %
        r.monitor.tick();

        let closed = r.positions.get_closed_positions(1);
        assert_eq!(closed[0].close_reason.as_deref(), Some("StopLoss"));
        // Realized loss feeds the kill switch.
        assert_eq!(r.kill_switch.state().total_trades, 1);
        assert!(r.kill_switch.state().daily_pnl < 0.0);
    }

    #[test]
    fn trailing_arms_then_dominates_take_profit() {
        let r = rig();
        r.store.upsert_market(market("m1", 0.50, None, 1));
        let id = open_yes(&r, "m1", 0.50);

        // +6 %: arms the trail but no exit (under the 10 % TP too).
        r.store.update_price("m1", 0.53, 0.47);
        r.monitor.tick();
        let pos = &r.positions.get_open_positions()[0];
        assert!(pos.trailing_armed);

        // Rally to +20 %: trailing armed means no TakeProfit close.
        r.store.update_price("m1", 0.60, 0.40);
        r.monitor.tick();
        assert_eq!(r.positions.get_open_positions().len(), 1);

        // Pull back beyond 2 % off the 0.60 peak: trailing stop fires.
        r.store.update_price("m1", 0.58, 0.42);
        r.monitor.tick();
        let closed = r.positions.get_closed_positions(1);
        assert_eq!(closed[0].id, id);
        assert_eq!(closed[0].close_reason.as_deref(), Some("TrailingStop"));
    }

    #[test]
    fn fair_value_convergence_exits() {
        let r = rig();
        // Forecast 44 °F, 0 days out → σ = 1.5, P(yes) ≈ 0.996. Price at
        // 0.98 sits inside the 2 % band.
        r.store.upsert_market(market("m1", 0.98, Some(44.0), 0));
        let mut m = r.store.get("m1").unwrap();
        m.target_date = Utc::now() + ChronoDuration::hours(6);
        r.store.upsert_market(m);
        open_yes(&r, "m1", 0.95);

        r.monitor.tick();
        let closed = r.positions.get_closed_positions(1);
        assert_eq!(
            closed[0].close_reason.as_deref(),
            Some("FairValueConvergence")
        );
    }

    #[test]
    fn target_date_passing_closes_position() {
        let r = rig();
        r.store.upsert_market(market("m1", 0.50, None, 1));
        let id = r.positions.open_position(
            "m1",
            "nyc",
            TradeSide::Yes,
            50.0,
            0.50,
            0.25,
            1.7,
            Utc::now() - ChronoDuration::minutes(1),
        );
        r.monitor.tick();
        let closed = r.positions.get_closed_positions(1);
        assert_eq!(closed[0].id, id);
        assert_eq!(closed[0].close_reason.as_deref(), Some("TargetDatePassed"));
    }
}
