// =============================================================================
// Confirmation Manager — reconciles file and API observations per cycle
// =============================================================================
//
// Rules:
//   1. `file-confirmed` upgrades any prior API_UNCONFIRMED snapshot for the
//      affected cities in place to FILE_CONFIRMED. The file value is always
//      authoritative; a |file − api| gap beyond the per-metric tolerance is
//      logged as a discrepancy but never blocks emission. `forecast-changed`
//      fires when the confirmed value differs from the last stored value.
//   2. `api-data` arriving before any file confirmation is stored as
//      API_UNCONFIRMED; `forecast-changed` fires only when the change versus
//      the last stored value exceeds the per-metric trigger threshold.
//
// Snapshots persist for the trading day in a per-(city, metric) ring buffer.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus, EventTag};
use crate::ingest::decoder::CityWeather;
use crate::types::{
    ConfirmationState, CycleKey, ForecastSnapshot, ForecastSource, MetricType,
};

/// History retained per (city, metric).
const HISTORY_CAP: usize = 96;

/// Values closer than this are "the same" for change detection.
const VALUE_EPSILON: f64 = 1e-6;

/// Per-metric |file − api| gap beyond which a discrepancy is logged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tolerances {
    pub temperature_c: f64,
    pub wind_kph: f64,
    pub precip_mm: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            temperature_c: 0.5,
            wind_kph: 2.0,
            precip_mm: 0.1,
        }
    }
}

/// Per-metric minimum API-source change that triggers emission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChangeTriggers {
    pub temperature_c: f64,
    pub wind_kph: f64,
    pub precip_mm: f64,
}

impl Default for ChangeTriggers {
    fn default() -> Self {
        Self {
            temperature_c: 0.5,
            wind_kph: 5.0,
            precip_mm: 0.5,
        }
    }
}

fn metric_value(t: &Tolerances, metric: MetricType) -> f64 {
    match metric {
        MetricType::Temperature => t.temperature_c,
        MetricType::WindSpeed => t.wind_kph,
        MetricType::Precipitation => t.precip_mm,
    }
}

fn trigger_value(t: &ChangeTriggers, metric: MetricType) -> f64 {
    match metric {
        MetricType::Temperature => t.temperature_c,
        MetricType::WindSpeed => t.wind_kph,
        MetricType::Precipitation => t.precip_mm,
    }
}

type MetricKey = (String, MetricType);

struct Inner {
    /// Unconfirmed API observations per cycle.
    pending: HashMap<CycleKey, HashMap<MetricKey, ForecastSnapshot>>,
    /// Confirmed/stored history per (city, metric); back() is the last
    /// stored value used for change detection.
    history: HashMap<MetricKey, VecDeque<ForecastSnapshot>>,
    /// UTC date the history belongs to; snapshots persist for the trading
    /// day and roll over with the API-tracker counters.
    current_date: chrono::NaiveDate,
}

pub struct ConfirmationManager {
    tolerances: Tolerances,
    triggers: ChangeTriggers,
    bus: Arc<EventBus>,
    inner: Mutex<Inner>,
}

impl ConfirmationManager {
    pub fn new(bus: Arc<EventBus>, tolerances: Tolerances, triggers: ChangeTriggers) -> Self {
        Self {
            tolerances,
            triggers,
            bus,
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                history: HashMap::new(),
                current_date: Utc::now().date_naive(),
            }),
        }
    }

    /// Last stored value for a (city, metric) pair.
    pub fn last_value(&self, city_id: &str, metric: MetricType) -> Option<f64> {
        let inner = self.inner.lock();
        inner
            .history
            .get(&(city_id.to_string(), metric))
            .and_then(|h| h.back())
            .map(|s| s.value)
    }

    /// Full stored history for a pair, oldest first.
    pub fn history(&self, city_id: &str, metric: MetricType) -> Vec<ForecastSnapshot> {
        let inner = self.inner.lock();
        inner
            .history
            .get(&(city_id.to_string(), metric))
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Clear day-scoped state when the UTC date changes. Idempotent within
    /// a date.
    pub fn maybe_rollover(&self) {
        let today = Utc::now().date_naive();
        let mut inner = self.inner.lock();
        if inner.current_date == today {
            return;
        }
        inner.current_date = today;
        inner.pending.clear();
        inner.history.clear();
        info!(date = %today, "confirmation history rolled over");
    }

    /// Rule 2: API observation before any file confirmation.
    pub fn ingest_api(&self, snapshot: ForecastSnapshot) {
        debug_assert_eq!(snapshot.source, ForecastSource::Api);
        let key = (snapshot.city_id.clone(), snapshot.metric);
        let trigger = trigger_value(&self.triggers, snapshot.metric);

        let emit = {
            let mut inner = self.inner.lock();

            if let Some(cycle) = snapshot.cycle_key {
                inner
                    .pending
                    .entry(cycle)
                    .or_default()
                    .insert(key.clone(), snapshot.clone());
            }

            let previous = inner.history.get(&key).and_then(|h| h.back()).map(|s| s.value);
            match previous {
                Some(prev) if (snapshot.value - prev).abs() < trigger => None,
                _ => {
                    let delta = previous.map(|p| snapshot.value - p).unwrap_or(snapshot.value);
                    Self::push_history(&mut inner, key, snapshot.clone());
                    Some((previous, delta))
                }
            }
        };

        if let Some((previous, delta)) = emit {
            debug!(
                city = %snapshot.city_id,
                metric = %snapshot.metric,
                value = snapshot.value,
                delta,
                "API-source forecast change"
            );
            self.bus.publish(Event::ForecastChanged {
                snapshot,
                previous,
                delta,
            });
        }
    }

    /// Rule 1: file confirmation for a cycle's cities.
    pub fn ingest_file(&self, cycle: CycleKey, cities: &[CityWeather]) {
        let produced_at = Utc::now();

        for cw in cities {
            for (metric, value) in [
                (MetricType::Temperature, cw.temp_c),
                (MetricType::WindSpeed, cw.wind_kph),
                (MetricType::Precipitation, cw.precip_mm),
            ] {
                let key = (cw.city_id.clone(), metric);
                let tolerance = metric_value(&self.tolerances, metric);

                let emit = {
                    let mut inner = self.inner.lock();

                    // Upgrade a prior API_UNCONFIRMED snapshot in place; the
                    // file value substitutes as authoritative.
                    if let Some(pending) = inner.pending.get_mut(&cycle) {
                        if let Some(api_snap) = pending.get_mut(&key) {
                            let gap = (api_snap.value - value).abs();
                            if gap > tolerance {
                                warn!(
                                    city = %cw.city_id,
                                    metric = %metric,
                                    api = api_snap.value,
                                    file = value,
                                    gap,
                                    "file/API discrepancy beyond tolerance — file wins"
                                );
                            }
                            api_snap.confirmation = ConfirmationState::FileConfirmed;
                            api_snap.value = value;
                        }
                    }

                    let previous =
                        inner.history.get(&key).and_then(|h| h.back()).map(|s| s.value);
                    let snapshot = ForecastSnapshot {
                        city_id: cw.city_id.clone(),
                        metric,
                        value,
                        valid_time: produced_at,
                        source: ForecastSource::File,
                        confirmation: ConfirmationState::FileConfirmed,
                        produced_at,
                        cycle_key: Some(cycle),
                    };
                    let changed = previous
                        .map(|p| (value - p).abs() > VALUE_EPSILON)
                        .unwrap_or(true);
                    Self::push_history(&mut inner, key, snapshot.clone());

                    changed.then(|| {
                        let delta = previous.map(|p| value - p).unwrap_or(value);
                        (snapshot, previous, delta)
                    })
                };

                if let Some((snapshot, previous, delta)) = emit {
                    self.bus.publish(Event::ForecastChanged {
                        snapshot,
                        previous,
                        delta,
                    });
                }
            }
        }

        // Pending API observations for this cycle are resolved.
        self.inner.lock().pending.remove(&cycle);
    }

    fn push_history(inner: &mut Inner, key: MetricKey, snapshot: ForecastSnapshot) {
        let ring = inner.history.entry(key).or_default();
        ring.push_back(snapshot);
        while ring.len() > HISTORY_CAP {
            ring.pop_front();
        }
    }

    /// Consume `api-data` and `file-confirmed` from the bus until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut api_sub = self.bus.subscribe(EventTag::ApiData);
        let mut file_sub = self.bus.subscribe(EventTag::FileConfirmed);
        let mut rollover_tick = tokio::time::interval(std::time::Duration::from_secs(60));
        info!("confirmation manager running");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = rollover_tick.tick() => {
                    self.maybe_rollover();
                }
                ev = api_sub.recv() => {
                    let Some(ev) = ev else { return };
                    if let Event::ApiData(snapshot) = ev.event {
                        self.ingest_api(snapshot);
                    }
                }
                ev = file_sub.recv() => {
                    let Some(ev) = ev else { return };
                    if let Event::FileConfirmed { cycle_key, cities, .. } = ev.event {
                        self.ingest_file(cycle_key, &cities);
                    }
                }
            }
        }
    }
}
