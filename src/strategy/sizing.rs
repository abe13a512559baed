// =============================================================================
// Entry optimization & sizing — dynamic Kelly with portfolio heat caps
// =============================================================================
//
// Fractional Kelly by confidence band:
//   s ≥ 2.0            half-Kelly   (0.50)
//   1.0 ≤ s < 2.0      quarter      (0.25)
//   0.5 ≤ s < 1.0      eighth       (0.125)
//   guaranteed (<1 % residual)      (0.75)
//
// An edge-decay factor exp(−ln2 · age/60 s) multiplies size; signals whose
// decay falls under 0.1 are not admitted. The heat cap scales a candidate
// down to fit total-exposure, Kelly-heat, cash-reserve, and per-city limits;
// anything under $5 after scaling is rejected.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::strategy::edge::EdgeComputation;
use crate::venue::MarketBook;

/// Sizing decay floor: below this multiplier the signal is stale.
pub const DECAY_FLOOR: f64 = 0.1;

/// Fraction of best-level depth an order may consume.
const LIQUIDITY_DEPTH_FRACTION: f64 = 0.10;

/// Spread beyond which the spread-based reduction applies.
const WIDE_SPREAD: f64 = 0.05;
const WIDE_SPREAD_FACTOR: f64 = 0.7;

/// Concentration bonus gate and multiplier.
const BONUS_MIN_EDGE: f64 = 0.10;
const BONUS_MIN_KELLY: f64 = 0.20;
const BONUS_FACTOR: f64 = 1.5;

const SCALE_IN_TRANCHES: usize = 3;
const TRANCHE_IMPROVEMENT_PCT: f64 = 0.005;
const TRANCHE_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Base (mid-band) Kelly fraction; the confidence bands scale it by
    /// 2×, 1×, ½× and the guaranteed band by 3×.
    pub kelly_fraction: f64,
    pub max_position_size: f64,
    pub max_total_exposure: f64,
    pub max_kelly_heat: f64,
    pub min_cash_reserve: f64,
    pub per_city_exposure_cap: f64,
    pub per_city_date_exposure_cap: f64,
    pub min_order_usd: f64,
    pub scale_in_threshold: f64,
    pub decay_half_life_ms: u64,
    pub max_signal_age_ms: u64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly_fraction: 0.25,
            max_position_size: 50.0,
            max_total_exposure: 0.50,
            max_kelly_heat: 0.30,
            min_cash_reserve: 0.10,
            per_city_exposure_cap: 0.25,
            per_city_date_exposure_cap: 0.15,
            min_order_usd: 5.0,
            scale_in_threshold: 100.0,
            decay_half_life_ms: 60_000,
            max_signal_age_ms: 120_000,
        }
    }
}

/// Portfolio aggregates at sizing time, all in USD except the fractions.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PortfolioView {
    pub portfolio_value: f64,
    pub cash: f64,
    pub total_exposure: f64,
    /// Sum of open-position Kelly fractions.
    pub kelly_heat: f64,
    pub city_exposure: f64,
    pub city_date_exposure: f64,
}

/// One slice of a scale-in plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tranche {
    pub size_usd: f64,
    /// Price improvement versus the first tranche's limit, as a fraction.
    pub price_improvement: f64,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SizeDecision {
    pub size_usd: f64,
    /// Kelly fraction actually committed (after scaling).
    pub kelly_fraction: f64,
    pub decay: f64,
    pub concentration_bonus: bool,
    pub tranches: Vec<Tranche>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeRejection {
    /// Decay multiplier fell under the floor.
    DecayFloor,
    /// Scaled size under the $5 minimum.
    BelowMinSize,
    /// No headroom under any cap.
    NoCapacity,
}

impl std::fmt::Display for SizeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DecayFloor => write!(f, "decay_floor"),
            Self::BelowMinSize => write!(f, "below_min_size"),
            Self::NoCapacity => write!(f, "no_capacity"),
        }
    }
}

/// Kelly band multiplier from the signal-strength sigma. With the default
/// base of 0.25 the bands are 0.75 / 0.50 / 0.25 / 0.125.
pub fn kelly_band(signal_sigma: f64, guaranteed: bool, base: f64) -> f64 {
    if guaranteed {
        base * 3.0
    } else if signal_sigma >= 2.0 {
        base * 2.0
    } else if signal_sigma >= 1.0 {
        base
    } else if signal_sigma >= 0.5 {
        base / 2.0
    } else {
        0.0
    }
}

/// Full Kelly fraction for a binary contract bought at `price` with win
/// probability `p`: f* = (p − price) / (1 − price), floored at zero.
pub fn full_kelly(p: f64, price: f64) -> f64 {
    if price >= 1.0 {
        return 0.0;
    }
    ((p - price) / (1.0 - price)).max(0.0)
}

/// Exponential edge decay with a 60 s half-life (configurable).
pub fn decay_factor(age_ms: u64, half_life_ms: u64) -> f64 {
    (-(std::f64::consts::LN_2) * age_ms as f64 / half_life_ms as f64).exp()
}

/// Size an opportunity against the portfolio. Scaling order: Kelly band →
/// decay → concentration bonus → liquidity → heat caps → minimum.
pub fn compute_size(
    edge: &EdgeComputation,
    portfolio: &PortfolioView,
    cfg: &SizingConfig,
    age_ms: u64,
    book: Option<&MarketBook>,
) -> Result<SizeDecision, SizeRejection> {
    let decay = decay_factor(age_ms, cfg.decay_half_life_ms);
    if decay < DECAY_FLOOR {
        return Err(SizeRejection::DecayFloor);
    }

    let band = kelly_band(edge.signal_sigma, edge.guaranteed, cfg.kelly_fraction);
    let mut kelly = (full_kelly(edge.forecast_prob, edge.market_price) * band).min(1.0);
    let mut size = kelly * portfolio.portfolio_value * decay;

    let concentration_bonus = edge.edge > BONUS_MIN_EDGE && kelly > BONUS_MIN_KELLY;
    if concentration_bonus {
        size *= BONUS_FACTOR;
    }
    // The configured position cap is hard; the bonus cannot break it.
    size = size.min(cfg.max_position_size);

    // Liquidity: bounded by book depth when a snapshot exists, otherwise the
    // spread-based reduction.
    match book {
        Some(b) if b.min_depth() > 0.0 => {
            size = size.min(LIQUIDITY_DEPTH_FRACTION * b.min_depth());
        }
        Some(b) if b.spread() > WIDE_SPREAD => {
            size *= WIDE_SPREAD_FACTOR;
        }
        Some(_) => {}
        None => {}
    }

    // Heat caps: scale down to the tightest headroom.
    let pv = portfolio.portfolio_value;
    let headrooms = [
        cfg.max_total_exposure * pv - portfolio.total_exposure,
        portfolio.cash - cfg.min_cash_reserve * pv,
        cfg.per_city_exposure_cap * pv - portfolio.city_exposure,
        cfg.per_city_date_exposure_cap * pv - portfolio.city_date_exposure,
    ];
    let usd_headroom = headrooms.iter().cloned().fold(f64::INFINITY, f64::min);
    if usd_headroom <= 0.0 {
        return Err(SizeRejection::NoCapacity);
    }
    if size > usd_headroom {
        size = usd_headroom;
    }

    // Kelly-heat headroom scales the committed fraction (and size with it).
    let heat_headroom = cfg.max_kelly_heat - portfolio.kelly_heat;
    if heat_headroom <= 0.0 {
        return Err(SizeRejection::NoCapacity);
    }
    if kelly > heat_headroom {
        size *= heat_headroom / kelly;
        kelly = heat_headroom;
    }

    if size < cfg.min_order_usd {
        debug!(size, min = cfg.min_order_usd, "sized below minimum — rejected");
        return Err(SizeRejection::BelowMinSize);
    }

    Ok(SizeDecision {
        size_usd: size,
        kelly_fraction: kelly,
        decay,
        concentration_bonus,
        tranches: plan_tranches(size, cfg),
    })
}

/// Split a large position into up to three tranches: the first at the limit
/// price, subsequent tranches each 0.5 % better with a 2 s delay.
fn plan_tranches(size: f64, cfg: &SizingConfig) -> Vec<Tranche> {
    if size <= cfg.scale_in_threshold {
        return vec![Tranche {
            size_usd: size,
            price_improvement: 0.0,
            delay_ms: 0,
        }];
    }
    let per = size / SCALE_IN_TRANCHES as f64;
    (0..SCALE_IN_TRANCHES)
        .map(|i| Tranche {
            size_usd: per,
            price_improvement: TRANCHE_IMPROVEMENT_PCT * i as f64,
            delay_ms: TRANCHE_DELAY_MS * i as u64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeSide;

    fn edge(signal_sigma: f64, guaranteed: bool, edge_val: f64, prob: f64, price: f64) -> EdgeComputation {
        EdgeComputation {
            forecast_value: 44.0,
            days_to_event: 1.0,
            sigma_m: 2.3,
            z: signal_sigma,
            forecast_prob: prob,
            signal_sigma,
            edge: edge_val,
            side: TradeSide::Yes,
            market_price: price,
            guaranteed,
        }
    }

    fn idle_portfolio() -> PortfolioView {
        PortfolioView {
            portfolio_value: 1_000.0,
            cash: 1_000.0,
            total_exposure: 0.0,
            kelly_heat: 0.0,
            city_exposure: 0.0,
            city_date_exposure: 0.0,
        }
    }

    #[test]
    fn bands_follow_confidence() {
        assert!((kelly_band(2.5, false, 0.25) - 0.50).abs() < 1e-12);
        assert!((kelly_band(1.5, false, 0.25) - 0.25).abs() < 1e-12);
        assert!((kelly_band(0.7, false, 0.25) - 0.125).abs() < 1e-12);
        assert!((kelly_band(0.3, false, 0.25) - 0.0).abs() < 1e-12);
        assert!((kelly_band(3.0, true, 0.25) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn decay_has_sixty_second_half_life() {
        assert!((decay_factor(0, 60_000) - 1.0).abs() < 1e-12);
        assert!((decay_factor(60_000, 60_000) - 0.5).abs() < 1e-9);
        assert!((decay_factor(120_000, 60_000) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn stale_signal_rejected_at_decay_floor() {
        let cfg = SizingConfig::default();
        // exp(−ln2·age/60s) < 0.1 at age ≈ 200 s.
        let err = compute_size(
            &edge(1.7, false, 0.5, 0.95, 0.45),
            &idle_portfolio(),
            &cfg,
            210_000,
            None,
        )
        .unwrap_err();
        assert_eq!(err, SizeRejection::DecayFloor);
    }

    #[test]
    fn admitted_size_respects_max_position() {
        let cfg = SizingConfig::default();
        let d = compute_size(
            &edge(1.7, false, 0.509, 0.959, 0.45),
            &idle_portfolio(),
            &cfg,
            0,
            None,
        )
        .unwrap();
        // Quarter-Kelly of a strong edge on $1000 far exceeds $50; capped.
        assert!((d.size_usd - cfg.max_position_size).abs() < 1e-9);
        assert!(d.decay >= DECAY_FLOOR);
        assert_eq!(d.tranches.len(), 1);
    }

    #[test]
    fn kelly_heat_cap_scales_down() {
        let cfg = SizingConfig::default();
        let mut p = idle_portfolio();
        p.kelly_heat = 0.20;
        let d = compute_size(&edge(1.7, false, 0.509, 0.959, 0.45), &p, &cfg, 0, None).unwrap();
        // Committed fraction cannot push heat past 0.30.
        assert!(p.kelly_heat + d.kelly_fraction <= cfg.max_kelly_heat + 1e-9);
        assert!(d.kelly_fraction > 0.0);
    }

    #[test]
    fn heat_scaling_below_minimum_rejects() {
        let cfg = SizingConfig::default();
        let mut p = idle_portfolio();
        p.kelly_heat = 0.28;
        // Headroom 0.02 scales a quarter-Kelly candidate under $5.
        let err =
            compute_size(&edge(1.7, false, 0.509, 0.959, 0.45), &p, &cfg, 0, None).unwrap_err();
        assert_eq!(err, SizeRejection::BelowMinSize);
    }

    #[test]
    fn full_heat_rejects() {
        let cfg = SizingConfig::default();
        let mut p = idle_portfolio();
        p.kelly_heat = 0.30;
        let err =
            compute_size(&edge(1.7, false, 0.509, 0.959, 0.45), &p, &cfg, 0, None).unwrap_err();
        assert_eq!(err, SizeRejection::NoCapacity);
    }

    #[test]
    fn cash_reserve_is_respected() {
        let cfg = SizingConfig::default();
        let mut p = idle_portfolio();
        // $1000 portfolio, only $108 cash: at most $8 before the 10 % floor.
        p.cash = 108.0;
        let d = compute_size(&edge(1.7, false, 0.509, 0.959, 0.45), &p, &cfg, 0, None).unwrap();
        assert!(d.size_usd <= 8.0 + 1e-9);
        assert!(p.cash - d.size_usd >= cfg.min_cash_reserve * p.portfolio_value - 1e-9);
    }

    #[test]
    fn tiny_headroom_rejects_below_minimum() {
        let cfg = SizingConfig::default();
        let mut p = idle_portfolio();
        p.cash = 103.0; // $3 headroom < $5 minimum
        let err =
            compute_size(&edge(1.7, false, 0.509, 0.959, 0.45), &p, &cfg, 0, None).unwrap_err();
        assert_eq!(err, SizeRejection::BelowMinSize);
    }

    #[test]
    fn depth_bounds_order_size() {
        let cfg = SizingConfig::default();
        let book = MarketBook {
            market_id: "m1".into(),
            yes_bid: 0.44,
            yes_ask: 0.46,
            bid_depth: 120.0,
            ask_depth: 90.0,
        };
        let d = compute_size(
            &edge(1.7, false, 0.509, 0.959, 0.45),
            &idle_portfolio(),
            &cfg,
            0,
            Some(&book),
        )
        .unwrap();
        // 10 % of min(120, 90) = $9.
        assert!(d.size_usd <= 9.0 + 1e-9);
    }

    #[test]
    fn wide_spread_without_depth_reduces() {
        let cfg = SizingConfig::default();
        let book = MarketBook {
            market_id: "m1".into(),
            yes_bid: 0.40,
            yes_ask: 0.48,
            bid_depth: 0.0,
            ask_depth: 0.0,
        };
        // Use a small portfolio so the ×0.7 is visible under the $50 cap.
        let mut small = idle_portfolio();
        small.portfolio_value = 150.0;
        small.cash = 150.0;
        let spread_sized =
            compute_size(&edge(0.7, false, 0.509, 0.959, 0.45), &small, &cfg, 0, Some(&book))
                .unwrap();
        let free_sized =
            compute_size(&edge(0.7, false, 0.509, 0.959, 0.45), &small, &cfg, 0, None).unwrap();
        assert!(spread_sized.size_usd < free_sized.size_usd);
        assert!((spread_sized.size_usd / free_sized.size_usd - 0.7).abs() < 1e-6);
    }

    #[test]
    fn large_positions_split_into_three_tranches() {
        let cfg = SizingConfig {
            max_position_size: 200.0,
            ..SizingConfig::default()
        };
        let mut p = idle_portfolio();
        p.portfolio_value = 10_000.0;
        p.cash = 10_000.0;
        let d = compute_size(&edge(2.5, false, 0.509, 0.959, 0.45), &p, &cfg, 0, None).unwrap();
        assert!(d.size_usd > cfg.scale_in_threshold);
        assert_eq!(d.tranches.len(), 3);
        let total: f64 = d.tranches.iter().map(|t| t.size_usd).sum();
        assert!((total - d.size_usd).abs() < 1e-6);
        assert!((d.tranches[0].price_improvement - 0.0).abs() < 1e-12);
        assert!((d.tranches[1].price_improvement - 0.005).abs() < 1e-12);
        assert!((d.tranches[2].price_improvement - 0.010).abs() < 1e-12);
        assert_eq!(d.tranches[1].delay_ms, 2_000);
        assert_eq!(d.tranches[2].delay_ms, 4_000);
    }
}
