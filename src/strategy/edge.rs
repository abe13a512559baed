// =============================================================================
// Edge & probability model — forecast vs. market threshold
// =============================================================================
//
// Per-metric uncertainty grows with days-to-event:
//
//   temperature:          σ = 1.5 + 0.8·d
//   precipitation/other:  σ = 3.0 + 1.0·d
//
// z = (F − T) / σ, P(above) = Φ(z). The signal-strength sigma
// s = |F − T| / σ gates noise below s_min.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::datastore::MarketState;
use crate::types::{Comparison, TradeSide};

/// z beyond which the residual probability is under 1 % — a "guaranteed"
/// outcome for sizing purposes.
pub const GUARANTEED_Z: f64 = 2.3263;

/// Standard normal CDF.
pub fn phi(z: f64) -> f64 {
    // Unit normal construction cannot fail.
    let n = Normal::new(0.0, 1.0).expect("unit normal");
    n.cdf(z)
}

/// Days to event, lower-bounded at zero.
pub fn days_to_event(target: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    ((target - now).num_milliseconds() as f64 / 86_400_000.0).max(0.0)
}

/// Per-metric forecast uncertainty at `d` days out, market units.
pub fn sigma_for(metric: crate::types::MetricType, d: f64) -> f64 {
    match metric {
        crate::types::MetricType::Temperature => 1.5 + 0.8 * d,
        _ => 3.0 + 1.0 * d,
    }
}

/// Probability that the outcome lands on `cmp`'s side of the threshold.
pub fn probability(forecast: f64, threshold: f64, cmp: Comparison, sigma: f64) -> f64 {
    let z = (forecast - threshold) / sigma;
    match cmp {
        Comparison::Above => phi(z),
        Comparison::Below => 1.0 - phi(z),
    }
}

/// Full edge evaluation for one market against one forecast value.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EdgeComputation {
    /// Forecast value, market units.
    pub forecast_value: f64,
    pub days_to_event: f64,
    pub sigma_m: f64,
    pub z: f64,
    /// Probability of the market's comparison resolving true.
    pub forecast_prob: f64,
    /// Signal strength |F − T| / σ.
    pub signal_sigma: f64,
    pub edge: f64,
    pub side: TradeSide,
    /// Price the edge was computed against (the side's quote).
    pub market_price: f64,
    /// Residual probability below 1 %.
    pub guaranteed: bool,
}

/// Evaluate `forecast_value` (market units) against a market's quote.
pub fn evaluate(market: &MarketState, forecast_value: f64, now: DateTime<Utc>) -> EdgeComputation {
    let d = days_to_event(market.target_date, now);
    let sigma_m = sigma_for(market.metric, d);
    let z = (forecast_value - market.threshold) / sigma_m;
    let forecast_prob = probability(forecast_value, market.threshold, market.comparison, sigma_m);

    let (market_price, side) = match market.comparison {
        Comparison::Above => (market.yes_price, TradeSide::Yes),
        Comparison::Below => (market.no_price, TradeSide::No),
    };
    let edge = forecast_prob - market_price;
    let signal_sigma = (forecast_value - market.threshold).abs() / sigma_m;

    EdgeComputation {
        forecast_value,
        days_to_event: d,
        sigma_m,
        z,
        forecast_prob,
        signal_sigma,
        edge,
        side,
        market_price,
        guaranteed: signal_sigma >= GUARANTEED_Z,
    }
}

/// Probability that the *held side* of a position resolves true — used by
/// the fair-value exit.
pub fn side_probability(
    market: &MarketState,
    forecast_value: f64,
    side: TradeSide,
    now: DateTime<Utc>,
) -> f64 {
    let p = probability(
        forecast_value,
        market.threshold,
        market.comparison,
        sigma_for(market.metric, days_to_event(market.target_date, now)),
    );
    // `p` is the probability of the comparison being true, which is what the
    // comparison-side trade pays on. The opposite side pays on 1 − p.
    let comparison_side = match market.comparison {
        Comparison::Above => TradeSide::Yes,
        Comparison::Below => TradeSide::No,
    };
    if side == comparison_side {
        p
    } else {
        1.0 - p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MarketState;
    use crate::types::MetricType;
    use chrono::Duration;
    use std::collections::VecDeque;

    fn market(threshold: f64, cmp: Comparison, yes: f64, no: f64, days: i64) -> MarketState {
        MarketState {
            market_id: "m1".into(),
            question: "test".into(),
            city_id: "nyc".into(),
            metric: MetricType::Temperature,
            threshold,
            comparison: cmp,
            yes_price: yes,
            no_price: no,
            target_date: Utc::now() + Duration::days(days),
            last_forecast: None,
            price_history: VecDeque::new(),
        }
    }

    #[test]
    fn cdf_sides_sum_to_one() {
        for (f, t, sigma) in [(44.0, 40.0, 2.3), (38.0, 40.0, 1.5), (40.0, 40.0, 3.0)] {
            let above = probability(f, t, Comparison::Above, sigma);
            let below = probability(f, t, Comparison::Below, sigma);
            assert!((above + below - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn scenario_nyc_forty_four_degrees() {
        // Forecast 44 °F against threshold 40 °F, one day out:
        // σ = 1.5 + 0.8 = 2.3, s = 4/2.3 ≈ 1.74, P ≈ 0.959, edge ≈ 0.509.
        let m = market(40.0, Comparison::Above, 0.45, 0.55, 1);
        let e = evaluate(&m, 44.0, Utc::now());

        assert!((e.sigma_m - 2.3).abs() < 0.01);
        assert!((e.signal_sigma - 1.739).abs() < 0.01);
        assert!((e.forecast_prob - 0.959).abs() < 0.005);
        assert!((e.edge - 0.509).abs() < 0.01);
        assert_eq!(e.side, TradeSide::Yes);
        assert!(!e.guaranteed);
    }

    #[test]
    fn below_market_uses_no_price() {
        let m = market(40.0, Comparison::Below, 0.45, 0.55, 1);
        let e = evaluate(&m, 36.0, Utc::now());
        assert_eq!(e.side, TradeSide::No);
        // P(below) with forecast well under the threshold is large.
        assert!(e.forecast_prob > 0.9);
        assert!((e.edge - (e.forecast_prob - 0.55)).abs() < 1e-12);
    }

    #[test]
    fn guaranteed_flag_at_extreme_signal() {
        let m = market(40.0, Comparison::Above, 0.45, 0.55, 0);
        // d = 0 → σ = 1.5; 44 − 40 = 4 → s ≈ 2.67 > 2.33.
        let e = evaluate(&m, 44.0, Utc::now());
        assert!(e.guaranteed);
    }

    #[test]
    fn days_to_event_floors_at_zero() {
        let now = Utc::now();
        assert_eq!(days_to_event(now - Duration::days(2), now), 0.0);
        let d = days_to_event(now + Duration::hours(12), now);
        assert!((d - 0.5).abs() < 1e-6);
    }

    #[test]
    fn side_probability_complements() {
        let m = market(40.0, Comparison::Above, 0.45, 0.55, 1);
        let now = Utc::now();
        let yes = side_probability(&m, 44.0, TradeSide::Yes, now);
        let no = side_probability(&m, 44.0, TradeSide::No, now);
        assert!((yes + no - 1.0).abs() < 1e-12);
    }
}
