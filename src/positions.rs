// =============================================================================
// Position Manager — open/closed trade state and portfolio accounting
// =============================================================================
//
// Life-cycle: Open -> Closed (take-profit / stop-loss / trailing /
// fair-value / target-date / manual).
//
// Cash accounting: opening a position debits cash by its USD size; closing
// credits the proceeds at the close price. Portfolio value is cash plus the
// marked value of open positions. Thread-safety: all mutable state behind
// `parking_lot::RwLock`.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::strategy::sizing::PortfolioView;
use crate::types::TradeSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A single tracked position in a binary market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub market_id: String,
    pub city_id: String,
    pub side: TradeSide,
    pub shares: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub current_price: f64,
    pub entry_time: DateTime<Utc>,
    pub kelly_fraction: f64,
    pub sigma_at_entry: f64,
    pub target_date: DateTime<Utc>,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub unrealized_pnl_pct: f64,
    /// Highest side-price seen since entry.
    #[serde(default)]
    pub peak_price: f64,
    /// Armed once unrealized profit crosses the trailing activation.
    #[serde(default)]
    pub trailing_armed: bool,
    #[serde(default)]
    pub trailing_stop: Option<f64>,
    pub status: PositionStatus,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub realized_pnl: f64,
}

impl Position {
    pub fn size_usd(&self) -> f64 {
        self.shares * self.entry_price
    }

    pub fn market_value(&self) -> f64 {
        self.shares * self.current_price
    }
}

pub struct PositionManager {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
    cash: RwLock<f64>,
    starting_capital: f64,
}

impl PositionManager {
    pub fn new(starting_capital: f64) -> Self {
        Self {
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
            cash: RwLock::new(starting_capital),
            starting_capital,
        }
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &self,
        market_id: &str,
        city_id: &str,
        side: TradeSide,
        size_usd: f64,
        entry_price: f64,
        kelly_fraction: f64,
        sigma_at_entry: f64,
        target_date: DateTime<Utc>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let shares = if entry_price > 0.0 {
            size_usd / entry_price
        } else {
            0.0
        };

        let pos = Position {
            id: id.clone(),
            market_id: market_id.to_string(),
            city_id: city_id.to_string(),
            side,
            shares,
            entry_price,
            current_price: entry_price,
            entry_time: Utc::now(),
            kelly_fraction,
            sigma_at_entry,
            target_date,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            peak_price: entry_price,
            trailing_armed: false,
            trailing_stop: None,
            status: PositionStatus::Open,
            closed_at: None,
            close_reason: None,
            realized_pnl: 0.0,
        };

        info!(
            id = %id,
            market = market_id,
            side = %side,
            size_usd,
            entry_price,
            shares,
            kelly_fraction,
            "position opened"
        );

        *self.cash.write() -= size_usd;
        self.open.write().push(pos);
        id
    }

    // -------------------------------------------------------------------------
    // Price updates
    // -------------------------------------------------------------------------

    /// Mark open positions on `market_id` with the latest side prices and
    /// refresh peak tracking.
    pub fn update_prices(&self, market_id: &str, yes_price: f64, no_price: f64) {
        let mut positions = self.open.write();
        for pos in positions.iter_mut().filter(|p| p.market_id == market_id) {
            let price = match pos.side {
                TradeSide::Yes => yes_price,
                TradeSide::No => no_price,
            };
            if price <= 0.0 {
                continue;
            }
            pos.current_price = price;
            pos.unrealized_pnl = (price - pos.entry_price) * pos.shares;
            pos.unrealized_pnl_pct = if pos.entry_price > 0.0 {
                (price - pos.entry_price) / pos.entry_price
            } else {
                0.0
            };
            if price > pos.peak_price {
                pos.peak_price = price;
                debug!(id = %pos.id, peak = price, "peak price updated");
            }
        }
    }

    /// Mutate one position through a closure (trailing-stop arming).
    pub fn with_position<F: FnOnce(&mut Position)>(&self, id: &str, f: F) {
        let mut positions = self.open.write();
        if let Some(pos) = positions.iter_mut().find(|p| p.id == id) {
            f(pos);
        }
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close a position at `close_price`, crediting proceeds to cash.
    /// Returns the realized PnL, or `None` when no open position matches.
    pub fn close_position(&self, id: &str, reason: &str, close_price: f64) -> Option<f64> {
        let mut open = self.open.write();
        let idx = open.iter().position(|p| p.id == id)?;
        let mut pos = open.remove(idx);
        drop(open);

        let proceeds = pos.shares * close_price;
        let realized = proceeds - pos.size_usd();
        pos.realized_pnl = realized;
        pos.current_price = close_price;
        pos.unrealized_pnl = 0.0;
        pos.unrealized_pnl_pct = 0.0;
        pos.status = PositionStatus::Closed;
        pos.closed_at = Some(Utc::now());
        pos.close_reason = Some(reason.to_string());

        *self.cash.write() += proceeds;

        info!(
            id,
            reason,
            close_price,
            realized_pnl = realized,
            "position closed"
        );

        self.closed.write().push(pos);
        Some(realized)
    }

    // -------------------------------------------------------------------------
    // Portfolio aggregates
    // -------------------------------------------------------------------------

    pub fn cash(&self) -> f64 {
        *self.cash.read()
    }

    pub fn starting_capital(&self) -> f64 {
        self.starting_capital
    }

    /// Cash plus marked value of open positions.
    pub fn portfolio_value(&self) -> f64 {
        let open = self.open.read();
        let marked: f64 = open.iter().map(|p| p.market_value()).sum();
        *self.cash.read() + marked
    }

    /// Aggregates used by the sizing heat caps, scoped to one candidate
    /// (city, target date).
    pub fn portfolio_view(&self, city_id: &str, target_date: DateTime<Utc>) -> PortfolioView {
        let open = self.open.read();
        let cash = *self.cash.read();

        let mut total_exposure = 0.0;
        let mut kelly_heat = 0.0;
        let mut city_exposure = 0.0;
        let mut city_date_exposure = 0.0;
        let target_day = target_date.date_naive();

        for p in open.iter() {
            let value = p.market_value();
            total_exposure += value;
            kelly_heat += p.kelly_fraction;
            if p.city_id == city_id {
                city_exposure += value;
                if p.target_date.date_naive() == target_day {
                    city_date_exposure += value;
                }
            }
        }

        PortfolioView {
            portfolio_value: cash + total_exposure,
            cash,
            total_exposure,
            kelly_heat,
            city_exposure,
            city_date_exposure,
        }
    }

    pub fn get_open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    /// Most recent `count` closed positions, newest first.
    pub fn get_closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    /// True when a position is open on the given market.
    pub fn has_open_position(&self, market_id: &str) -> bool {
        self.open.read().iter().any(|p| p.market_id == market_id)
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("open", &self.open.read().len())
            .field("closed", &self.closed.read().len())
            .field("cash", &*self.cash.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn mgr() -> PositionManager {
        PositionManager::new(1_000.0)
    }

    fn open(m: &PositionManager, market: &str, size: f64, price: f64, kelly: f64) -> String {
        m.open_position(
            market,
            "nyc",
            TradeSide::Yes,
            size,
            price,
            kelly,
            1.7,
            Utc::now() + Duration::days(1),
        )
    }

    #[test]
    fn open_debits_cash_and_close_credits_proceeds() {
        let m = mgr();
        let id = open(&m, "m1", 50.0, 0.50, 0.25);
        assert!((m.cash() - 950.0).abs() < 1e-9);

        // 100 shares at 0.50; close at 0.55 → proceeds 55, pnl +5.
        m.update_prices("m1", 0.55, 0.45);
        let pnl = m.close_position(&id, "TakeProfit", 0.55).unwrap();
        assert!((pnl - 5.0).abs() < 1e-9);
        assert!((m.cash() - 1_005.0).abs() < 1e-9);
        assert!(m.get_open_positions().is_empty());
        assert_eq!(m.get_closed_positions(10).len(), 1);
    }

    #[test]
    fn no_side_positions_mark_with_no_price() {
        let m = mgr();
        let id = m.open_position(
            "m1",
            "nyc",
            TradeSide::No,
            50.0,
            0.55,
            0.25,
            1.0,
            Utc::now() + Duration::days(1),
        );
        m.update_prices("m1", 0.40, 0.60);
        let pos = m
            .get_open_positions()
            .into_iter()
            .find(|p| p.id == id)
            .unwrap();
        assert!((pos.current_price - 0.60).abs() < 1e-9);
        assert!(pos.unrealized_pnl > 0.0);
    }

    #[test]
    fn portfolio_view_aggregates_heat_and_city_exposure() {
        let m = mgr();
        let target = Utc::now() + Duration::days(1);
        open(&m, "m1", 50.0, 0.50, 0.10);
        open(&m, "m2", 30.0, 0.60, 0.05);
        m.open_position(
            "m3",
            "chi",
            TradeSide::Yes,
            20.0,
            0.40,
            0.05,
            1.0,
            target,
        );

        let view = m.portfolio_view("nyc", target);
        assert!((view.portfolio_value - 1_000.0).abs() < 1e-6);
        assert!((view.total_exposure - 100.0).abs() < 1e-6);
        assert!((view.kelly_heat - 0.20).abs() < 1e-12);
        assert!((view.city_exposure - 80.0).abs() < 1e-6);
    }

    #[test]
    fn peak_price_tracks_maximum() {
        let m = mgr();
        let id = open(&m, "m1", 50.0, 0.50, 0.25);
        m.update_prices("m1", 0.58, 0.42);
        m.update_prices("m1", 0.54, 0.46);
        let pos = m
            .get_open_positions()
            .into_iter()
            .find(|p| p.id == id)
            .unwrap();
        assert!((pos.peak_price - 0.58).abs() < 1e-9);
        assert!((pos.current_price - 0.54).abs() < 1e-9);
    }
}
