// =============================================================================
// Hybrid Mode Controller — operational-mode state machine
// =============================================================================
//
// Exactly one mode is active for the whole process at any instant; every
// transition happens under a single mutex and is published as one
// `mode-transition` event, so the transition sequence is totally ordered.
//
// Urgency windows (UTC, inclusive-exclusive):
//   HIGH   00:30–02:30, 12:30–14:30
//   MEDIUM 06:30–07:30, 18:30–19:30
//   LOW    otherwise
//
// Auto-mode re-evaluates the window every 10 s and is disabled by an
// explicit forceMode until returnToNormal. Burst is entered only from LOW
// urgency on a venue-sourced forecast change above the trigger threshold
// (or via the manual trigger), runs exactly 60 s of 1 req/s round-robin
// across the burst providers, then returns to the urgency-appropriate mode.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api_tracker::ApiCallTracker;
use crate::bus::{Event, EventBus, EventTag};
use crate::cities::CityRegistry;
use crate::providers::{gated_forecast_batch, ProviderKind, ProviderRegistry};
use crate::types::{
    ConfirmationState, Coord, EngineMode, ForecastSnapshot, ForecastSource, MetricType, Urgency,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub burst_duration_secs: u64,
    /// Venue-sourced forecast move (market units) that triggers a burst.
    pub burst_trigger_threshold: f64,
    pub urgency_check_secs: u64,
    /// When true, LOW urgency runs WEBSOCKET_REST (no polling) instead of
    /// the secondary polling mode.
    pub websocket_rest_enabled: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            burst_duration_secs: 60,
            burst_trigger_threshold: 1.0,
            urgency_check_secs: 10,
            websocket_rest_enabled: false,
        }
    }
}

/// UTC urgency window lookup.
pub fn urgency_at(t: DateTime<Utc>) -> Urgency {
    let minutes = t.hour() * 60 + t.minute();
    match minutes {
        30..=149 | 750..=869 => Urgency::High,
        390..=449 | 1110..=1169 => Urgency::Medium,
        _ => Urgency::Low,
    }
}

struct BurstState {
    started: Instant,
    city_id: String,
    rotation_idx: usize,
    calls_made: u64,
}

struct ControllerState {
    mode: EngineMode,
    auto_enabled: bool,
    burst: Option<BurstState>,
}

/// Serializable controller snapshot for the status report.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub mode: EngineMode,
    pub auto_enabled: bool,
    pub urgency: Urgency,
    pub burst_city: Option<String>,
    pub burst_calls: u64,
}

pub struct HybridController {
    state: Mutex<ControllerState>,
    bus: Arc<EventBus>,
    tracker: Arc<ApiCallTracker>,
    providers: Arc<ProviderRegistry>,
    cities: Arc<CityRegistry>,
    settings: ControllerSettings,
    last_blackout_warn: Mutex<Option<Instant>>,
}

impl HybridController {
    pub fn new(
        bus: Arc<EventBus>,
        tracker: Arc<ApiCallTracker>,
        providers: Arc<ProviderRegistry>,
        cities: Arc<CityRegistry>,
        settings: ControllerSettings,
    ) -> Self {
        let initial = Self::mode_for_urgency(urgency_at(Utc::now()), &settings);
        Self {
            state: Mutex::new(ControllerState {
                mode: initial,
                auto_enabled: true,
                burst: None,
            }),
            bus,
            tracker,
            providers,
            cities,
            settings,
            last_blackout_warn: Mutex::new(None),
        }
    }

    /// Log the all-providers-unusable condition at WARN, at most once per
    /// minute; file ingestion keeps running regardless.
    fn warn_blackout(&self) {
        let mut last = self.last_blackout_warn.lock();
        if last.is_some_and(|at| at.elapsed() < Duration::from_secs(60)) {
            return;
        }
        *last = Some(Instant::now());
        warn!("all weather providers quota-exceeded or rate-limited — relying on file ingestion only");
    }

    fn mode_for_urgency(urgency: Urgency, settings: &ControllerSettings) -> EngineMode {
        match urgency {
            Urgency::High => EngineMode::OpenMeteoPolling,
            Urgency::Medium => EngineMode::MeteosourcePolling,
            Urgency::Low => {
                if settings.websocket_rest_enabled {
                    EngineMode::WebsocketRest
                } else {
                    EngineMode::MeteosourcePolling
                }
            }
        }
    }

    pub fn current_mode(&self) -> EngineMode {
        self.state.lock().mode
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let s = self.state.lock();
        ControllerSnapshot {
            mode: s.mode,
            auto_enabled: s.auto_enabled,
            urgency: urgency_at(Utc::now()),
            burst_city: s.burst.as_ref().map(|b| b.city_id.clone()),
            burst_calls: s.burst.as_ref().map(|b| b.calls_made).unwrap_or(0),
        }
    }

    // -------------------------------------------------------------------------
    // Manual controls
    // -------------------------------------------------------------------------

    /// Force a mode, disabling auto-mode until [`return_to_normal`].
    pub fn force_mode(&self, mode: EngineMode, reason: &str) {
        let mut s = self.state.lock();
        s.auto_enabled = false;
        self.transition(&mut s, mode, &format!("forced: {reason}"));
    }

    /// Re-enable auto-mode and move to the urgency-appropriate mode.
    pub fn return_to_normal(&self) {
        let mut s = self.state.lock();
        s.auto_enabled = true;
        let target = Self::mode_for_urgency(urgency_at(Utc::now()), &self.settings);
        self.transition(&mut s, target, "return to normal");
    }

    /// Manually start a burst for a city.
    pub fn trigger_burst(&self, city_id: &str) {
        let mut s = self.state.lock();
        self.enter_burst(&mut s, city_id, f64::NAN, "manual trigger");
    }

    // -------------------------------------------------------------------------
    // Transitions (always under the state mutex)
    // -------------------------------------------------------------------------

    fn transition(&self, s: &mut ControllerState, to: EngineMode, reason: &str) {
        let from = s.mode;
        if from == to {
            return;
        }
        if from == EngineMode::RoundRobinBurst {
            let calls = s.burst.take().map(|b| b.calls_made).unwrap_or(0);
            self.tracker.exit_burst_mode();
            self.bus.publish(Event::BurstExit { calls_made: calls });
        }
        s.mode = to;
        info!(from = %from, to = %to, reason, "mode transition");
        self.bus.publish(Event::ModeTransition {
            from,
            to,
            reason: reason.to_string(),
        });
    }

    fn enter_burst(&self, s: &mut ControllerState, city_id: &str, delta: f64, reason: &str) {
        if s.mode == EngineMode::RoundRobinBurst {
            debug!("burst already active — trigger ignored");
            return;
        }
        s.burst = Some(BurstState {
            started: Instant::now(),
            city_id: city_id.to_string(),
            rotation_idx: 0,
            calls_made: 0,
        });
        self.tracker.enter_burst_mode();
        self.bus.publish(Event::BurstEnter {
            city_id: city_id.to_string(),
            trigger_delta: delta,
        });
        self.transition(s, EngineMode::RoundRobinBurst, reason);
    }

    /// Exit the burst if its 60 s budget elapsed. A late forecast change in
    /// the final second does not extend it.
    fn maybe_expire_burst(&self) {
        let mut s = self.state.lock();
        let expired = s
            .burst
            .as_ref()
            .is_some_and(|b| b.started.elapsed() >= Duration::from_secs(self.settings.burst_duration_secs));
        if expired {
            let target = Self::mode_for_urgency(urgency_at(Utc::now()), &self.settings);
            self.transition(&mut s, target, "burst complete");
        }
    }

    /// Auto-mode urgency evaluation (no-op while forced or bursting).
    fn evaluate_urgency(&self) {
        let mut s = self.state.lock();
        if !s.auto_enabled || s.burst.is_some() {
            return;
        }
        let urgency = urgency_at(Utc::now());
        let target = Self::mode_for_urgency(urgency, &self.settings);
        if s.mode != target {
            self.transition(&mut s, target, &format!("urgency {urgency}"));
        }
    }

    // -------------------------------------------------------------------------
    // Event handling
    // -------------------------------------------------------------------------

    /// Venue-sourced forecast change: burst trigger, LOW urgency only.
    fn on_forecast_changed(&self, snapshot: &ForecastSnapshot, delta: f64) {
        if snapshot.source != ForecastSource::Venue {
            return;
        }
        if urgency_at(Utc::now()) != Urgency::Low {
            return;
        }
        let market_delta = match snapshot.metric {
            MetricType::Temperature => delta * 9.0 / 5.0,
            _ => delta,
        };
        if market_delta.abs() < self.settings.burst_trigger_threshold {
            return;
        }
        let mut s = self.state.lock();
        if !s.auto_enabled {
            debug!("venue burst trigger ignored — mode is forced");
            return;
        }
        self.enter_burst(
            &mut s,
            &snapshot.city_id,
            market_delta,
            "venue forecast change in LOW urgency",
        );
    }

    // -------------------------------------------------------------------------
    // Polling
    // -------------------------------------------------------------------------

    /// One 1 Hz polling step for the current mode.
    async fn poll_step(&self) {
        let (mode, burst_city) = {
            let s = self.state.lock();
            (s.mode, s.burst.as_ref().map(|b| b.city_id.clone()))
        };

        match mode {
            EngineMode::OpenMeteoPolling => {
                self.poll_batched(ProviderKind::OpenMeteo).await;
            }
            EngineMode::MeteosourcePolling => {
                self.poll_batched(ProviderKind::Meteosource).await;
            }
            EngineMode::WebsocketRest => {
                // Venue WebSocket + file ingestion only.
            }
            EngineMode::RoundRobinBurst => {
                if let Some(city_id) = burst_city {
                    self.burst_step(&city_id).await;
                }
            }
        }
    }

    /// Batched 1 Hz poll of every tracked city through one provider.
    async fn poll_batched(&self, kind: ProviderKind) {
        let Some(provider) = self.providers.get(kind) else {
            return;
        };
        if !provider.is_configured() {
            return;
        }
        if self.tracker.is_quota_exceeded(kind) || self.tracker.is_rate_limited(kind) {
            self.warn_blackout();
            return;
        }
        let coords = self.cities.coords();
        let ids: Vec<String> = self.cities.all().iter().map(|c| c.id.clone()).collect();

        match gated_forecast_batch(&provider, &self.tracker, &self.bus, &coords).await {
            Ok(observations) => {
                self.publish_observations(&ids, &observations);
            }
            Err(e) => {
                debug!(provider = %kind, error = %e, "polling fetch failed");
            }
        }
    }

    /// One burst iteration: exactly one request, rotating across the burst
    /// providers and skipping any that are quota-exhausted or rate-limited.
    async fn burst_step(&self, city_id: &str) {
        let Some(city) = self.cities.get(city_id).cloned() else {
            warn!(city = city_id, "burst city unknown — skipping step");
            return;
        };

        let rotation = self.providers.burst_rotation();
        if rotation.is_empty() {
            return;
        }

        // Pick the next usable provider in rotation order.
        let start_idx = {
            let s = self.state.lock();
            s.burst.as_ref().map(|b| b.rotation_idx).unwrap_or(0)
        };
        let mut chosen = None;
        for offset in 0..rotation.len() {
            let idx = (start_idx + offset) % rotation.len();
            let p = &rotation[idx];
            if self.tracker.is_quota_exceeded(p.kind()) || self.tracker.is_rate_limited(p.kind()) {
                debug!(provider = %p.kind(), "burst rotation skipping excluded provider");
                continue;
            }
            chosen = Some((idx, p.clone()));
            break;
        }
        let Some((idx, provider)) = chosen else {
            self.warn_blackout();
            return;
        };

        let result = gated_forecast_batch(
            &provider,
            &self.tracker,
            &self.bus,
            std::slice::from_ref(&city.coord),
        )
        .await;

        {
            let mut s = self.state.lock();
            if let Some(burst) = s.burst.as_mut() {
                burst.rotation_idx = (idx + 1) % rotation.len();
                burst.calls_made += 1;
            }
        }

        match result {
            Ok(observations) => {
                self.publish_observations(std::slice::from_ref(&city.id), &observations);
            }
            Err(e) => {
                debug!(provider = %provider.kind(), error = %e, "burst fetch failed");
            }
        }
    }

    fn publish_observations(&self, ids: &[String], observations: &[crate::providers::ApiForecast]) {
        let produced_at = Utc::now();
        for (city_id, obs) in ids.iter().zip(observations.iter()) {
            for (metric, value) in [
                (MetricType::Temperature, obs.temp_c),
                (MetricType::WindSpeed, obs.wind_kph),
                (MetricType::Precipitation, obs.precip_mm),
            ] {
                self.bus.publish(Event::ApiData(ForecastSnapshot {
                    city_id: city_id.clone(),
                    metric,
                    value,
                    valid_time: obs.observed_at,
                    source: ForecastSource::Api,
                    confirmation: ConfirmationState::ApiUnconfirmed,
                    produced_at,
                    cycle_key: None,
                }));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut forecast_sub = self.bus.subscribe(EventTag::ForecastChanged);
        let mut poll_tick = tokio::time::interval(Duration::from_secs(1));
        let mut urgency_tick =
            tokio::time::interval(Duration::from_secs(self.settings.urgency_check_secs));
        info!(mode = %self.current_mode(), "hybrid controller running");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = poll_tick.tick() => {
                    self.maybe_expire_burst();
                    self.poll_step().await;
                }
                _ = urgency_tick.tick() => {
                    self.evaluate_urgency();
                }
                ev = forecast_sub.recv() => {
                    let Some(ev) = ev else { return };
                    if let Event::ForecastChanged { snapshot, delta, .. } = ev.event {
                        self.on_forecast_changed(&snapshot, delta);
                    }
                }
            }
        }
    }

    /// Coordinates of every tracked city (status/debug use).
    pub fn tracked_coords(&self) -> Vec<Coord> {
        self.cities.coords()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn controller() -> (Arc<HybridController>, Arc<EventBus>, Arc<ApiCallTracker>) {
        let bus = Arc::new(EventBus::new());
        let tracker = Arc::new(ApiCallTracker::new(bus.clone()));
        let providers = Arc::new(ProviderRegistry::from_env());
        let cities = Arc::new(CityRegistry::builtin());
        let c = Arc::new(HybridController::new(
            bus.clone(),
            tracker.clone(),
            providers,
            cities,
            ControllerSettings::default(),
        ));
        (c, bus, tracker)
    }

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, h, m, 0).unwrap()
    }

    #[test]
    fn urgency_windows_are_inclusive_exclusive() {
        assert_eq!(urgency_at(utc(0, 29)), Urgency::Low);
        assert_eq!(urgency_at(utc(0, 30)), Urgency::High);
        assert_eq!(urgency_at(utc(2, 29)), Urgency::High);
        assert_eq!(urgency_at(utc(2, 30)), Urgency::Low);
        assert_eq!(urgency_at(utc(12, 30)), Urgency::High);
        assert_eq!(urgency_at(utc(14, 29)), Urgency::High);
        assert_eq!(urgency_at(utc(6, 30)), Urgency::Medium);
        assert_eq!(urgency_at(utc(7, 29)), Urgency::Medium);
        assert_eq!(urgency_at(utc(7, 30)), Urgency::Low);
        assert_eq!(urgency_at(utc(18, 30)), Urgency::Medium);
        assert_eq!(urgency_at(utc(19, 30)), Urgency::Low);
        assert_eq!(urgency_at(utc(23, 59)), Urgency::Low);
    }

    #[test]
    fn force_mode_disables_auto_until_return() {
        let (c, bus, _tracker) = controller();
        let mut transitions = bus.subscribe(EventTag::ModeTransition);

        c.force_mode(EngineMode::WebsocketRest, "operator");
        assert_eq!(c.current_mode(), EngineMode::WebsocketRest);
        assert!(!c.snapshot().auto_enabled);
        assert!(transitions.try_recv().is_some());

        // Auto evaluation is a no-op while forced.
        c.evaluate_urgency();
        assert_eq!(c.current_mode(), EngineMode::WebsocketRest);

        c.return_to_normal();
        assert!(c.snapshot().auto_enabled);
        assert_ne!(c.current_mode(), EngineMode::RoundRobinBurst);
    }

    #[test]
    fn transitions_pair_burst_enter_exit() {
        let (c, bus, tracker) = controller();
        let mut enters = bus.subscribe(EventTag::BurstEnter);
        let mut exits = bus.subscribe(EventTag::BurstExit);
        let mut transitions = bus.subscribe(EventTag::ModeTransition);

        c.trigger_burst("nyc");
        assert_eq!(c.current_mode(), EngineMode::RoundRobinBurst);
        assert!(tracker.is_burst_mode());
        assert!(enters.try_recv().is_some());

        // Completing the burst returns to the urgency-appropriate mode and
        // pairs the exit event.
        {
            let mut s = c.state.lock();
            let target = HybridController::mode_for_urgency(urgency_at(Utc::now()), &c.settings);
            c.transition(&mut s, target, "burst complete");
        }
        assert!(exits.try_recv().is_some());
        assert!(!tracker.is_burst_mode());
        assert_ne!(c.current_mode(), EngineMode::RoundRobinBurst);

        // Every enter into burst has a paired exit in the transition stream.
        let mut entered = 0;
        let mut exited = 0;
        while let Some(ev) = transitions.try_recv() {
            if let Event::ModeTransition { from, to, .. } = ev.event {
                if to == EngineMode::RoundRobinBurst {
                    entered += 1;
                }
                if from == EngineMode::RoundRobinBurst {
                    exited += 1;
                }
            }
        }
        assert_eq!(entered, 1);
        assert_eq!(exited, 1);
    }

    #[test]
    fn venue_change_below_threshold_does_not_burst() {
        let (c, _bus, _tracker) = controller();
        let snapshot = ForecastSnapshot {
            city_id: "nyc".into(),
            metric: MetricType::Temperature,
            value: 2.0,
            valid_time: Utc::now(),
            source: ForecastSource::Venue,
            confirmation: ConfirmationState::Unconfirmed,
            produced_at: Utc::now(),
            cycle_key: None,
        };
        // 0.2 °C ≈ 0.36 °F < 1.0 threshold.
        c.on_forecast_changed(&snapshot, 0.2);
        assert_ne!(c.current_mode(), EngineMode::RoundRobinBurst);
    }

    #[test]
    fn api_sourced_change_never_bursts() {
        let (c, _bus, _tracker) = controller();
        let snapshot = ForecastSnapshot {
            city_id: "nyc".into(),
            metric: MetricType::Temperature,
            value: 5.0,
            valid_time: Utc::now(),
            source: ForecastSource::Api,
            confirmation: ConfirmationState::ApiUnconfirmed,
            produced_at: Utc::now(),
            cycle_key: None,
        };
        c.on_forecast_changed(&snapshot, 5.0);
        assert_ne!(c.current_mode(), EngineMode::RoundRobinBurst);
    }
}
