// =============================================================================
// API Fallback Poller — secondary path when the detection file runs late
// =============================================================================
//
// Arms itself on `detection-window-open`, sleeps until the window's
// fallback_start, then polls the designated secondary weather API at 1 Hz per
// configured city until fallback_end — or until `file-confirmed` lands for
// its CycleKey, whichever comes first. Each response is published as
// `api-data` with `source=api, confirmation=API_UNCONFIRMED`.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api_tracker::ApiCallTracker;
use crate::bus::{Event, EventBus, EventTag};
use crate::cities::CityRegistry;
use crate::providers::{gated_forecast_batch, WeatherProvider};
use crate::schedule::DetectionWindow;
use crate::types::{
    ConfirmationState, CycleKey, ForecastSnapshot, ForecastSource, MetricType,
};

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub poll_interval_ms: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
        }
    }
}

pub struct FallbackPoller {
    provider: Arc<dyn WeatherProvider>,
    tracker: Arc<ApiCallTracker>,
    cities: Arc<CityRegistry>,
    bus: Arc<EventBus>,
    settings: FallbackSettings,
    confirmed: Arc<Mutex<HashSet<CycleKey>>>,
}

impl FallbackPoller {
    pub fn new(
        provider: Arc<dyn WeatherProvider>,
        tracker: Arc<ApiCallTracker>,
        cities: Arc<CityRegistry>,
        bus: Arc<EventBus>,
        settings: FallbackSettings,
    ) -> Self {
        Self {
            provider,
            tracker,
            cities,
            bus,
            settings,
            confirmed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut window_sub = self.bus.subscribe(EventTag::DetectionWindowOpen);
        let mut confirm_sub = self.bus.subscribe(EventTag::FileConfirmed);
        let mut shutdown_rx = shutdown.clone();
        info!(provider = %self.provider.kind(), "API fallback poller armed");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
                ev = confirm_sub.recv() => {
                    let Some(ev) = ev else { return };
                    if let Event::FileConfirmed { cycle_key, .. } = ev.event {
                        // Cancels the poll task for this cycle.
                        self.confirmed.lock().insert(cycle_key);
                    }
                }
                ev = window_sub.recv() => {
                    let Some(ev) = ev else { return };
                    if let Event::DetectionWindowOpen { window, .. } = ev.event {
                        let poller = self.clone();
                        let job_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            poller.run_window(window, job_shutdown).await;
                        });
                    }
                }
            }
        }
    }

    async fn run_window(&self, window: DetectionWindow, shutdown: watch::Receiver<bool>) {
        let cycle = window.cycle_key;

        let now = Utc::now();
        if window.fallback_start > now {
            let wait = (window.fallback_start - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wait_for_shutdown(shutdown.clone()) => return,
            }
        }

        if self.confirmed.lock().remove(&cycle) {
            debug!(cycle = %cycle, "file already confirmed — fallback not started");
            return;
        }

        let targets = self.cities.cities_for_model(cycle.model);
        let coords: Vec<_> = targets.iter().map(|c| c.coord).collect();
        let ids: Vec<String> = targets.iter().map(|c| c.id.clone()).collect();
        if coords.is_empty() {
            return;
        }

        info!(
            cycle = %cycle,
            cities = coords.len(),
            until = %window.fallback_end,
            "fallback polling started"
        );
        let interval = Duration::from_millis(self.settings.poll_interval_ms);

        loop {
            if *shutdown.borrow() || Utc::now() >= window.fallback_end {
                break;
            }
            if self.confirmed.lock().remove(&cycle) {
                info!(cycle = %cycle, "fallback cancelled — file confirmed");
                return;
            }

            match gated_forecast_batch(&self.provider, &self.tracker, &self.bus, &coords).await {
                Ok(observations) => {
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
                                cycle_key: Some(cycle),
                            }));
                        }
                    }
                }
                Err(e) => {
                    warn!(cycle = %cycle, error = %e, "fallback fetch failed");
                }
            }

            tokio::time::sleep(interval).await;
        }
        debug!(cycle = %cycle, "fallback window ended");
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
