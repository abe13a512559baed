// =============================================================================
// Kill Switch — process-wide risk governor over realized PnL
// =============================================================================
//
// Triggers, halting new-position admission for the cooldown:
//   1. Daily Loss    — |loss| / daily-start capital reaches the limit.
//   2. Drawdown      — decline from peak capital reaches the limit.
//   3. Consecutive   — N losing trades in a row.
//
// A minimum-trade-count gate prevents triggering from tiny samples. Cooldown
// reset is automatic once elapsed; manual reset is explicit. On a new UTC
// day the daily counters reset but the triggered flag does not.
// =============================================================================

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchLimits {
    /// Fraction of daily-start capital (e.g. 0.20 = 20 %).
    pub daily_loss_limit: f64,
    /// Fraction of peak capital.
    pub max_drawdown_limit: f64,
    pub consecutive_loss_limit: u32,
    pub cooldown_hours: i64,
    /// Realized trades required before any trigger can fire.
    pub min_trades_before_kill: u32,
}

impl Default for KillSwitchLimits {
    fn default() -> Self {
        Self {
            daily_loss_limit: 0.20,
            max_drawdown_limit: 0.25,
            consecutive_loss_limit: 5,
            cooldown_hours: 24,
            min_trades_before_kill: 10,
        }
    }
}

/// Snapshot for the status report.
#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchState {
    pub triggered: bool,
    pub trigger_reason: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub daily_pnl: f64,
    pub daily_loss_pct: f64,
    pub drawdown_pct: f64,
    pub consecutive_losses: u32,
    pub trades_today: u32,
    pub total_trades: u32,
    pub current_capital: f64,
    pub peak_capital: f64,
}

struct Inner {
    current_capital: f64,
    peak_capital: f64,
    daily_start_capital: f64,
    daily_pnl: f64,
    consecutive_losses: u32,
    trades_today: u32,
    total_trades: u32,
    triggered: bool,
    trigger_reason: Option<String>,
    triggered_at: Option<DateTime<Utc>>,
    current_date: NaiveDate,
}

pub struct KillSwitch {
    inner: RwLock<Inner>,
    limits: KillSwitchLimits,
}

impl KillSwitch {
    pub fn new(starting_capital: f64, limits: KillSwitchLimits) -> Self {
        Self::new_at(starting_capital, limits, Utc::now())
    }

    fn new_at(starting_capital: f64, limits: KillSwitchLimits, now: DateTime<Utc>) -> Self {
        info!(
            starting_capital,
            daily_loss_limit = limits.daily_loss_limit,
            max_drawdown_limit = limits.max_drawdown_limit,
            consecutive_loss_limit = limits.consecutive_loss_limit,
            "kill switch initialized"
        );
        Self {
            inner: RwLock::new(Inner {
                current_capital: starting_capital,
                peak_capital: starting_capital,
                daily_start_capital: starting_capital,
                daily_pnl: 0.0,
                consecutive_losses: 0,
                trades_today: 0,
                total_trades: 0,
                triggered: false,
                trigger_reason: None,
                triggered_at: None,
                current_date: now.date_naive(),
            }),
            limits,
        }
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Record a realized trade PnL and evaluate the triggers.
    pub fn record_realized(&self, pnl: f64) {
        self.record_realized_at(pnl, Utc::now());
    }

    fn record_realized_at(&self, pnl: f64, now: DateTime<Utc>) {
        let mut s = self.inner.write();
        Self::maybe_rollover(&mut s, now);

        s.current_capital += pnl;
        s.daily_pnl += pnl;
        s.trades_today += 1;
        s.total_trades += 1;

        if pnl < 0.0 {
            s.consecutive_losses += 1;
        } else {
            s.consecutive_losses = 0;
        }
        if s.current_capital > s.peak_capital {
            s.peak_capital = s.current_capital;
        }

        if s.triggered || s.total_trades < self.limits.min_trades_before_kill {
            return;
        }

        let daily_loss_pct = if s.daily_start_capital > 0.0 {
            (-s.daily_pnl).max(0.0) / s.daily_start_capital
        } else {
            0.0
        };
        let drawdown_pct = if s.peak_capital > 0.0 {
            (s.peak_capital - s.current_capital) / s.peak_capital
        } else {
            0.0
        };

        let reason = if daily_loss_pct >= self.limits.daily_loss_limit {
            Some(format!(
                "daily loss {:.1}% >= {:.1}%",
                daily_loss_pct * 100.0,
                self.limits.daily_loss_limit * 100.0
            ))
        } else if drawdown_pct >= self.limits.max_drawdown_limit {
            Some(format!(
                "drawdown {:.1}% >= {:.1}%",
                drawdown_pct * 100.0,
                self.limits.max_drawdown_limit * 100.0
            ))
        } else if s.consecutive_losses >= self.limits.consecutive_loss_limit {
            Some(format!(
                "{} consecutive losses >= {}",
                s.consecutive_losses, self.limits.consecutive_loss_limit
            ))
        } else {
            None
        };

        if let Some(reason) = reason {
            s.triggered = true;
            s.trigger_reason = Some(reason.clone());
            s.triggered_at = Some(now);
            error!(
                reason = %reason,
                cooldown_hours = self.limits.cooldown_hours,
                "KILL SWITCH TRIGGERED — new positions halted"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Admission gate
    // -------------------------------------------------------------------------

    /// Whether new positions may be admitted. Clears automatically once the
    /// cooldown has elapsed.
    pub fn can_trade(&self) -> (bool, Option<String>) {
        self.can_trade_at(Utc::now())
    }

    fn can_trade_at(&self, now: DateTime<Utc>) -> (bool, Option<String>) {
        {
            let mut s = self.inner.write();
            Self::maybe_rollover(&mut s, now);

            if s.triggered {
                let elapsed_ok = s
                    .triggered_at
                    .is_some_and(|at| now - at >= Duration::hours(self.limits.cooldown_hours));
                if elapsed_ok {
                    info!("kill switch cooldown elapsed — trading re-enabled");
                    s.triggered = false;
                    s.trigger_reason = None;
                    s.triggered_at = None;
                    s.consecutive_losses = 0;
                } else {
                    let reason = s
                        .trigger_reason
                        .clone()
                        .unwrap_or_else(|| "kill switch active".to_string());
                    return (false, Some(reason));
                }
            }
        }
        (true, None)
    }

    /// Explicit operator reset: clears the trigger and the cooldown timer.
    pub fn reset(&self) {
        let mut s = self.inner.write();
        warn!("kill switch manually reset");
        s.triggered = false;
        s.trigger_reason = None;
        s.triggered_at = None;
        s.consecutive_losses = 0;
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.read().triggered
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn state(&self) -> KillSwitchState {
        let s = self.inner.read();
        let daily_loss_pct = if s.daily_start_capital > 0.0 {
            (-s.daily_pnl).max(0.0) / s.daily_start_capital
        } else {
            0.0
        };
        let drawdown_pct = if s.peak_capital > 0.0 {
            (s.peak_capital - s.current_capital) / s.peak_capital
        } else {
            0.0
        };
        KillSwitchState {
            triggered: s.triggered,
            trigger_reason: s.trigger_reason.clone(),
            triggered_at: s.triggered_at,
            daily_pnl: s.daily_pnl,
            daily_loss_pct,
            drawdown_pct,
            consecutive_losses: s.consecutive_losses,
            trades_today: s.trades_today,
            total_trades: s.total_trades,
            current_capital: s.current_capital,
            peak_capital: s.peak_capital,
        }
    }

    /// Daily counters reset at the UTC date change; the triggered flag
    /// survives the rollover.
    fn maybe_rollover(s: &mut Inner, now: DateTime<Utc>) {
        let today = now.date_naive();
        if s.current_date == today {
            return;
        }
        info!(
            old_date = %s.current_date,
            new_date = %today,
            "date rolled — resetting daily kill-switch counters"
        );
        s.current_date = today;
        s.daily_pnl = 0.0;
        s.trades_today = 0;
        s.daily_start_capital = s.current_capital;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, day, h, 0, 0).unwrap()
    }

    fn switch() -> KillSwitch {
        KillSwitch::new_at(1_000.0, KillSwitchLimits::default(), at(1, 0))
    }

    /// Feed enough small wins to pass the minimum-trade gate.
    fn warm_up(k: &KillSwitch, n: u32) {
        for _ in 0..n {
            k.record_realized_at(0.01, at(1, 1));
        }
    }

    #[test]
    fn consecutive_losses_trigger_after_min_trades() {
        let k = switch();
        warm_up(&k, 10);

        for i in 0..5 {
            assert!(k.can_trade_at(at(1, 2)).0, "still tradable after {i} losses");
            k.record_realized_at(-1.0, at(1, 2));
        }
        let (ok, reason) = k.can_trade_at(at(1, 3));
        assert!(!ok);
        assert!(reason.unwrap().contains("consecutive"));
    }

    #[test]
    fn min_trade_gate_suppresses_early_triggers() {
        let k = switch();
        // Five straight losses, but only five trades total: under the gate.
        for _ in 0..5 {
            k.record_realized_at(-1.0, at(1, 1));
        }
        assert!(k.can_trade_at(at(1, 2)).0);
    }

    #[test]
    fn daily_loss_limit_triggers() {
        let k = switch();
        warm_up(&k, 10);
        // 20% of 1000 ≈ 200 lost in one day.
        k.record_realized_at(-100.0, at(1, 4));
        assert!(k.can_trade_at(at(1, 4)).0);
        k.record_realized_at(-110.0, at(1, 5));
        let (ok, reason) = k.can_trade_at(at(1, 5));
        assert!(!ok);
        assert!(reason.unwrap().contains("daily loss"));
    }

    #[test]
    fn cooldown_elapses_automatically() {
        let k = switch();
        warm_up(&k, 10);
        for _ in 0..5 {
            k.record_realized_at(-1.0, at(1, 2));
        }
        assert!(!k.can_trade_at(at(1, 3)).0);
        // 24 h later, the cooldown has elapsed.
        assert!(k.can_trade_at(at(2, 3)).0);
    }

    #[test]
    fn manual_reset_clears_trigger_and_cooldown() {
        let k = switch();
        warm_up(&k, 10);
        for _ in 0..5 {
            k.record_realized_at(-1.0, at(1, 2));
        }
        assert!(!k.can_trade_at(at(1, 3)).0);
        k.reset();
        assert!(k.can_trade_at(at(1, 3)).0);
        assert!(!k.is_triggered());
    }

    #[test]
    fn day_rollover_keeps_triggered_flag() {
        let k = KillSwitch::new_at(
            1_000.0,
            KillSwitchLimits {
                cooldown_hours: 48,
                ..KillSwitchLimits::default()
            },
            at(1, 0),
        );
        warm_up(&k, 10);
        for _ in 0..5 {
            k.record_realized_at(-1.0, at(1, 2));
        }
        assert!(k.is_triggered());
        // Next UTC day, before the 48 h cooldown: daily counters reset but
        // the switch stays triggered.
        assert!(!k.can_trade_at(at(2, 1)).0);
        let state = k.state();
        assert_eq!(state.trades_today, 0);
        assert!((state.daily_pnl - 0.0).abs() < 1e-12);
        assert!(state.triggered);
    }
}
