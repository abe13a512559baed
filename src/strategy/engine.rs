// =============================================================================
// Opportunity Engine — forecast-changed to trade-intent pipeline
// =============================================================================
//
// A single consumer task serializes `forecast-changed` events, which makes
// them totally ordered per market; emitted trade intents are therefore a
// monotone subsequence of each market's forecast changes.
//
// Gate order per market: signal age → kill switch → sigma → edge → capture
// → cooldown → sizing → execution re-validation. Every discard lands in the
// opportunity log with its stage.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{Event, EventBus, EventTag};
use crate::datastore::DataStore;
use crate::execution::{ExecutionEngine, ExecutionOutcome};
use crate::kill_switch::KillSwitch;
use crate::positions::PositionManager;
use crate::strategy::capture::{CaptureDecision, CaptureRegistry};
use crate::strategy::edge;
use crate::strategy::sizing::{self, SizingConfig};
use crate::strategy::{OpportunityLog, RejectStage};
use crate::types::{ForecastSnapshot, TradeIntent};
use crate::venue::TradingVenue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySettings {
    pub min_edge_threshold: f64,
    pub min_sigma_for_arb: f64,
    pub trade_cooldown_ms: u64,
    pub sizing: SizingConfig,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            min_edge_threshold: 0.08,
            min_sigma_for_arb: 0.5,
            trade_cooldown_ms: 30_000,
            sizing: SizingConfig::default(),
        }
    }
}

pub struct OpportunityEngine {
    bus: Arc<EventBus>,
    store: Arc<DataStore>,
    positions: Arc<PositionManager>,
    kill_switch: Arc<KillSwitch>,
    capture: Arc<CaptureRegistry>,
    execution: Arc<ExecutionEngine>,
    venue: Arc<dyn TradingVenue>,
    log: Arc<OpportunityLog>,
    settings: StrategySettings,
    last_trade_at: Mutex<HashMap<String, Instant>>,
}

impl OpportunityEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<DataStore>,
        positions: Arc<PositionManager>,
        kill_switch: Arc<KillSwitch>,
        capture: Arc<CaptureRegistry>,
        execution: Arc<ExecutionEngine>,
        venue: Arc<dyn TradingVenue>,
        log: Arc<OpportunityLog>,
        settings: StrategySettings,
    ) -> Self {
        Self {
            bus,
            store,
            positions,
            kill_switch,
            capture,
            execution,
            venue,
            log,
            settings,
            last_trade_at: Mutex::new(HashMap::new()),
        }
    }

    /// Single consumer of `forecast-changed`; runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut sub = self.bus.subscribe(EventTag::ForecastChanged);
        info!(
            min_edge = self.settings.min_edge_threshold,
            min_sigma = self.settings.min_sigma_for_arb,
            "opportunity engine running"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                ev = sub.recv() => {
                    let Some(ev) = ev else { return };
                    if let Event::ForecastChanged { snapshot, .. } = ev.event {
                        self.handle_forecast(&snapshot).await;
                    }
                }
            }
        }
    }

    /// Evaluate one forecast change against every market on its
    /// (city, metric) pair.
    pub async fn handle_forecast(&self, snapshot: &ForecastSnapshot) {
        let forecast_value = snapshot.value_for_market();
        let markets = self.store.markets_for(&snapshot.city_id, snapshot.metric);
        if markets.is_empty() {
            return;
        }

        for market in markets {
            self.store
                .set_last_forecast(&market.market_id, forecast_value);
            self.evaluate_market(&market.market_id, forecast_value, snapshot)
                .await;
        }
    }

    async fn evaluate_market(
        &self,
        market_id: &str,
        forecast_value: f64,
        snapshot: &ForecastSnapshot,
    ) {
        // Work on a fresh clone so the venue stream can keep updating prices.
        let Some(market) = self.store.get(market_id) else {
            return;
        };
        let now = Utc::now();

        // ── Signal age ───────────────────────────────────────────────────
        let age_ms = (now - snapshot.produced_at).num_milliseconds().max(0) as u64;
        if age_ms > self.settings.sizing.max_signal_age_ms {
            self.log.push_rejection(
                market_id,
                RejectStage::SignalAge,
                format!("signal {age_ms}ms old"),
            );
            return;
        }

        // ── Kill switch ──────────────────────────────────────────────────
        let (can_trade, kill_reason) = self.kill_switch.can_trade();
        if !can_trade {
            self.log.push_rejection(
                market_id,
                RejectStage::KillSwitch,
                kill_reason.unwrap_or_default(),
            );
            return;
        }

        // ── Edge & sigma ─────────────────────────────────────────────────
        let signal = edge::evaluate(&market, forecast_value, now);
        if signal.signal_sigma < self.settings.min_sigma_for_arb {
            debug!(
                market = market_id,
                sigma = signal.signal_sigma,
                "signal below sigma floor — noise"
            );
            self.log.push_rejection(
                market_id,
                RejectStage::Sigma,
                format!("s={:.2}", signal.signal_sigma),
            );
            return;
        }
        if signal.edge < self.settings.min_edge_threshold {
            self.log.push_rejection(
                market_id,
                RejectStage::Edge,
                format!("edge={:.3}", signal.edge),
            );
            return;
        }

        // ── Capture guard ────────────────────────────────────────────────
        if self.capture.check(market_id, forecast_value) == CaptureDecision::Blocked {
            self.log.push_rejection(
                market_id,
                RejectStage::Capture,
                format!("capture active at {forecast_value:.1}"),
            );
            return;
        }

        // ── Per-market cooldown (independent of the capture guard) ───────
        let in_cooldown = self
            .last_trade_at
            .lock()
            .get(market_id)
            .is_some_and(|at| (at.elapsed().as_millis() as u64) < self.settings.trade_cooldown_ms);
        if in_cooldown {
            self.log
                .push_rejection(market_id, RejectStage::Cooldown, "trade cooldown active");
            return;
        }

        // ── Sizing ───────────────────────────────────────────────────────
        let book = self.venue.market_book(market_id).await.ok();
        let view = self
            .positions
            .portfolio_view(&market.city_id, market.target_date);
        let decision = match sizing::compute_size(
            &signal,
            &view,
            &self.settings.sizing,
            age_ms,
            book.as_ref(),
        ) {
            Ok(d) => d,
            Err(rej) => {
                self.log
                    .push_rejection(market_id, RejectStage::Sizing, rej.to_string());
                return;
            }
        };

        // ── Intent formation ─────────────────────────────────────────────
        let intent = TradeIntent {
            intent_id: Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            side: signal.side,
            size_usd: decision.size_usd,
            price_limit: (signal.market_price + 0.01).min(0.99),
            edge: signal.edge,
            kelly_fraction: decision.kelly_fraction,
            sigma: signal.signal_sigma,
            forecast_value,
            created_at: now,
        };
        info!(
            market = market_id,
            side = %intent.side,
            size_usd = intent.size_usd,
            edge = intent.edge,
            sigma = intent.sigma,
            kelly = intent.kelly_fraction,
            "trade intent formed"
        );
        self.log.push_intent(intent.clone());
        self.bus.publish(Event::TradeIntent(intent.clone()));

        // ── Execution re-validation & submission ─────────────────────────
        match self
            .execution
            .execute(&market, &signal, &decision, &intent)
            .await
        {
            ExecutionOutcome::Submitted { position_id, .. } => {
                self.last_trade_at
                    .lock()
                    .insert(market_id.to_string(), Instant::now());
                debug!(market = market_id, position = %position_id, "submission complete");
            }
            ExecutionOutcome::Dropped(reason) => {
                self.log
                    .push_rejection(market_id, RejectStage::Execution, reason.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MarketState;
    use crate::execution::ExecutionSettings;
    use crate::kill_switch::KillSwitchLimits;
    use crate::types::{
        Comparison, ConfirmationState, ForecastSource, MetricType, ModelKind,
    };
    use crate::venue::{MarketBook, PaperVenue};
    use chrono::Duration as ChronoDuration;
    use std::collections::VecDeque;

    struct Rig {
        engine: Arc<OpportunityEngine>,
        bus: Arc<EventBus>,
        store: Arc<DataStore>,
        venue: Arc<PaperVenue>,
        positions: Arc<PositionManager>,
        kill_switch: Arc<KillSwitch>,
        log: Arc<OpportunityLog>,
    }

    fn rig() -> Rig {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(DataStore::new());
        let positions = Arc::new(PositionManager::new(1_000.0));
        let kill_switch = Arc::new(KillSwitch::new(1_000.0, KillSwitchLimits::default()));
        let capture = Arc::new(CaptureRegistry::new());
        let venue = Arc::new(PaperVenue::new());
        let log = Arc::new(OpportunityLog::new());
        let execution = Arc::new(ExecutionEngine::new(
            venue.clone(),
            positions.clone(),
            capture.clone(),
            ExecutionSettings::default(),
        ));
        let engine = Arc::new(OpportunityEngine::new(
            bus.clone(),
            store.clone(),
            positions.clone(),
            kill_switch.clone(),
            capture,
            execution,
            venue.clone(),
            log.clone(),
            StrategySettings::default(),
        ));
        Rig {
            engine,
            bus,
            store,
            venue,
            positions,
            kill_switch,
            log,
        }
    }

    fn nyc_market(id: &str) -> MarketState {
        MarketState {
            market_id: id.into(),
            question: "NYC high >= 40F?".into(),
            city_id: "nyc".into(),
            metric: MetricType::Temperature,
            threshold: 40.0,
            comparison: Comparison::Above,
            yes_price: 0.45,
            no_price: 0.55,
            target_date: Utc::now() + ChronoDuration::days(1),
            last_forecast: None,
            price_history: VecDeque::new(),
        }
    }

    fn temp_snapshot(celsius: f64) -> ForecastSnapshot {
        ForecastSnapshot {
            city_id: "nyc".into(),
            metric: MetricType::Temperature,
            value: celsius,
            valid_time: Utc::now(),
            source: ForecastSource::File,
            confirmation: ConfirmationState::FileConfirmed,
            produced_at: Utc::now(),
            cycle_key: Some(crate::types::CycleKey::new(
                ModelKind::Hrrr,
                Utc::now().date_naive(),
                0,
            )),
        }
    }

    fn stable_book(id: &str) -> MarketBook {
        MarketBook {
            market_id: id.into(),
            yes_bid: 0.44,
            yes_ask: 0.46,
            bid_depth: 5_000.0,
            ask_depth: 5_000.0,
        }
    }

    #[tokio::test]
    async fn strong_forecast_produces_one_intent() {
        let r = rig();
        r.store.upsert_market(nyc_market("m1"));
        r.venue.set_book(stable_book("m1"));
        let mut intents = r.bus.subscribe(EventTag::TradeIntent);

        // 44 °F = 6.667 °C; s ≈ 1.74, edge ≈ 0.509.
        r.engine.handle_forecast(&temp_snapshot(6.6667)).await;

        let ev = intents.try_recv().expect("intent emitted");
        match ev.event {
            Event::TradeIntent(intent) => {
                assert_eq!(intent.market_id, "m1");
                assert!((intent.forecast_value - 44.0).abs() < 0.01);
            }
            _ => panic!("wrong payload"),
        }
        assert_eq!(r.positions.get_open_positions().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_forecast_blocked_by_capture() {
        let r = rig();
        r.store.upsert_market(nyc_market("m1"));
        r.venue.set_book(stable_book("m1"));
        let mut intents = r.bus.subscribe(EventTag::TradeIntent);

        r.engine.handle_forecast(&temp_snapshot(6.6667)).await;
        assert!(intents.try_recv().is_some());

        // Identical forecast again: no second intent.
        r.engine.handle_forecast(&temp_snapshot(6.6667)).await;
        assert!(intents.try_recv().is_none());
        assert!(r
            .log
            .recent_rejections()
            .iter()
            .any(|rej| rej.stage == RejectStage::Capture));

        // 45.2 °F = 7.333 °C: |Δ| ≥ 1 °F clears the capture. The cooldown
        // still blocks an immediate re-entry, so the rejection moves stages.
        r.engine.handle_forecast(&temp_snapshot(7.3334)).await;
        assert!(r
            .log
            .recent_rejections()
            .iter()
            .any(|rej| rej.stage == RejectStage::Cooldown));
    }

    #[tokio::test]
    async fn weak_signal_rejected_as_noise() {
        let r = rig();
        let mut m = nyc_market("m1");
        m.yes_price = 0.50;
        m.no_price = 0.50;
        r.store.upsert_market(m);
        r.venue.set_book(stable_book("m1"));
        let mut intents = r.bus.subscribe(EventTag::TradeIntent);

        // 40.5 °F: s = 0.5/2.3 ≈ 0.22 < 0.5.
        r.engine.handle_forecast(&temp_snapshot(4.7223)).await;
        assert!(intents.try_recv().is_none());
        assert!(r
            .log
            .recent_rejections()
            .iter()
            .any(|rej| rej.stage == RejectStage::Sigma));
    }

    #[tokio::test]
    async fn kill_switch_blocks_new_intents() {
        let r = rig();
        r.store.upsert_market(nyc_market("m1"));
        r.venue.set_book(stable_book("m1"));
        let mut intents = r.bus.subscribe(EventTag::TradeIntent);

        // Trip the switch: 10 warm-up trades then 5 losses.
        for _ in 0..10 {
            r.kill_switch.record_realized(0.01);
        }
        for _ in 0..5 {
            r.kill_switch.record_realized(-1.0);
        }
        assert!(r.kill_switch.is_triggered());

        r.engine.handle_forecast(&temp_snapshot(6.6667)).await;
        assert!(intents.try_recv().is_none());
        assert!(r
            .log
            .recent_rejections()
            .iter()
            .any(|rej| rej.stage == RejectStage::KillSwitch));

        // Manual reset re-enables admission; prior state preserved.
        r.kill_switch.reset();
        r.engine.handle_forecast(&temp_snapshot(6.6667)).await;
        assert!(intents.try_recv().is_some());
    }
}
