// =============================================================================
// S3 File Detector — head-polling detection jobs with circuit breaking
// =============================================================================
//
// One detection job per ExpectedFile, spawned on `detection-window-open`.
// The job HEAD-polls at the configured interval until the object appears or
// the window closes. On 200 it emits `file-detected`, downloads the object,
// invokes the GRIB decoder, and emits `file-confirmed`. Download or parse
// failure falls through to the API fallback path — no confirmation, no
// retry.
//
// Invariants:
//   - At most one active detection per ExpectedFile.
//   - A job that confirmed never retries.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus, EventTag};
use crate::cities::CityRegistry;
use crate::error::EngineError;
use crate::ingest::decoder::GribDecoder;
use crate::ingest::object_store::{HeadResult, ObjectStore};
use crate::schedule::{DetectionWindow, ExpectedFile};

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Per-job breaker: 5 failures within 60 s opens the circuit for 60 s, then
/// half-open with 3 probe calls.
const BREAKER_FAILURE_THRESHOLD: usize = 5;
const BREAKER_WINDOW: Duration = Duration::from_secs(60);
const BREAKER_OPEN: Duration = Duration::from_secs(60);
const BREAKER_PROBES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
    probes_left: u8,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            open_until: None,
            probes_left: 0,
        }
    }

    /// Whether a call may be attempted right now.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if self.open_until.is_some_and(|until| now >= until) {
                    self.state = BreakerState::HalfOpen;
                    self.probes_left = BREAKER_PROBES;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => self.probes_left > 0,
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::HalfOpen => {
                // A failed probe re-opens immediately.
                self.trip(now);
            }
            BreakerState::Closed => {
                self.failures.push_back(now);
                while let Some(front) = self.failures.front() {
                    if now.duration_since(*front) > BREAKER_WINDOW {
                        self.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if self.failures.len() >= BREAKER_FAILURE_THRESHOLD {
                    self.trip(now);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_success(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.probes_left = self.probes_left.saturating_sub(1);
            if self.probes_left == 0 {
                self.state = BreakerState::Closed;
                self.failures.clear();
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.open_until = Some(now + BREAKER_OPEN);
        self.failures.clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub poll_interval_ms: u64,
    pub download_timeout_ms: u64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 150,
            download_timeout_ms: 5_000,
        }
    }
}

impl DetectorSettings {
    /// Clamp the poll interval into its permitted 100–250 ms range.
    pub fn normalized(mut self) -> Self {
        self.poll_interval_ms = self.poll_interval_ms.clamp(100, 250);
        self
    }
}

pub struct FileDetector {
    store: Arc<ObjectStore>,
    decoder: Arc<GribDecoder>,
    cities: Arc<CityRegistry>,
    bus: Arc<EventBus>,
    settings: DetectorSettings,
    active: Mutex<HashSet<String>>,
}

impl FileDetector {
    pub fn new(
        store: Arc<ObjectStore>,
        decoder: Arc<GribDecoder>,
        cities: Arc<CityRegistry>,
        bus: Arc<EventBus>,
        settings: DetectorSettings,
    ) -> Self {
        Self {
            store,
            decoder,
            cities,
            bus,
            settings: settings.normalized(),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Subscribe to window-open events and spawn one job per ExpectedFile.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut sub = self.bus.subscribe(EventTag::DetectionWindowOpen);
        let mut shutdown_rx = shutdown.clone();
        info!(poll_ms = self.settings.poll_interval_ms, "file detector armed");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
                ev = sub.recv() => {
                    let Some(ev) = ev else { return };
                    if let Event::DetectionWindowOpen { window, expected } = ev.event {
                        if !self.active.lock().insert(expected.object_key.clone()) {
                            debug!(key = %expected.object_key, "detection already active — skipped");
                            continue;
                        }
                        let detector = self.clone();
                        let job_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            detector.run_job(window, expected.clone(), job_shutdown).await;
                            detector.active.lock().remove(&expected.object_key);
                        });
                    }
                }
            }
        }
    }

    async fn run_job(
        &self,
        window: DetectionWindow,
        expected: ExpectedFile,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // The scheduler fires at earliest_poll, but guard against early
        // delivery.
        let now = Utc::now();
        if window.earliest_poll > now {
            let wait = (window.earliest_poll - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
        }

        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        let mut breaker = CircuitBreaker::new();
        // Publication-time proxy: the instant of the most recent 404.
        let mut last_miss: Option<Instant> = None;

        debug!(cycle = %expected.cycle_key, key = %expected.object_key, "detection polling started");

        loop {
            if *shutdown.borrow() {
                return;
            }
            if Utc::now() >= window.latest_poll {
                info!(
                    cycle = %expected.cycle_key,
                    key = %expected.object_key,
                    "detection window closed without a file"
                );
                return;
            }
            if !breaker.allow(Instant::now()) {
                tokio::select! {
                    _ = shutdown.changed() => continue,
                    _ = tokio::time::sleep(poll) => continue,
                }
            }

            match self.store.head(expected.bucket, &expected.object_key).await {
                Ok(HeadResult::Found { content_length }) => {
                    breaker.record_success();
                    let detected_at = Utc::now();
                    let latency_ms = last_miss
                        .map(|m| m.elapsed().as_millis() as u64)
                        .unwrap_or(0);
                    info!(
                        cycle = %expected.cycle_key,
                        key = %expected.object_key,
                        latency_ms,
                        ?content_length,
                        "file detected"
                    );
                    self.bus.publish(Event::FileDetected {
                        expected: expected.clone(),
                        detected_at,
                        latency_ms,
                    });
                    self.download_and_confirm(&expected, latency_ms).await;
                    // The job is done regardless of parse outcome.
                    return;
                }
                Ok(HeadResult::NotFound) => {
                    breaker.record_success();
                    last_miss = Some(Instant::now());
                }
                Err(e) => {
                    if e.is_breaker_relevant() {
                        breaker.record_failure(Instant::now());
                        if breaker.is_open() {
                            warn!(
                                cycle = %expected.cycle_key,
                                error = %e,
                                "detection circuit opened"
                            );
                        }
                    }
                    debug!(cycle = %expected.cycle_key, error = %e, "HEAD error");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Download + decode + publish confirmation. Any failure here falls
    /// through to the API fallback (no `file-confirmed`).
    async fn download_and_confirm(&self, expected: &ExpectedFile, detect_latency_ms: u64) {
        let started = Instant::now();
        let tmp = self.temp_path(expected);

        if let Err(e) = self
            .store
            .get(
                expected.bucket,
                &expected.object_key,
                &tmp,
                self.settings.download_timeout_ms,
            )
            .await
        {
            warn!(
                cycle = %expected.cycle_key,
                error = %e,
                "download failed — falling through to API fallback"
            );
            return;
        }

        let cities = self.cities.cities_for_model(expected.cycle_key.model);
        let decoded = self
            .decoder
            .decode(expected.cycle_key.model, &tmp, &cities)
            .await;

        // Temp files are unlinked after parse; losing one is not a
        // correctness issue.
        let _ = tokio::fs::remove_file(&tmp).await;

        match decoded {
            Ok(city_weather) => {
                let e2e_latency_ms = detect_latency_ms + started.elapsed().as_millis() as u64;
                info!(
                    cycle = %expected.cycle_key,
                    cities = city_weather.len(),
                    e2e_latency_ms,
                    "file confirmed"
                );
                self.bus.publish(Event::FileConfirmed {
                    cycle_key: expected.cycle_key,
                    cities: city_weather,
                    e2e_latency_ms,
                });
            }
            Err(EngineError::Parse { detail, .. }) => {
                warn!(
                    cycle = %expected.cycle_key,
                    detail = %detail,
                    "parse failed — falling through to API fallback"
                );
            }
            Err(e) => {
                warn!(
                    cycle = %expected.cycle_key,
                    error = %e,
                    "decode failed — falling through to API fallback"
                );
            }
        }
    }

    fn temp_path(&self, expected: &ExpectedFile) -> PathBuf {
        std::env::temp_dir().join("stratus-grib").join(format!(
            "{}-{}{:02}z-f{:03}.grib2",
            expected.cycle_key.model,
            expected.cycle_key.cycle_date.format("%Y%m%d"),
            expected.cycle_key.cycle_hour,
            expected.forecast_hour
        ))
    }
}

/// Best-effort sweep of leftover GRIB temporaries older than one hour.
pub async fn sweep_grib_temps() {
    let dir = std::env::temp_dir().join("stratus-grib");
    let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
        return;
    };
    let cutoff = std::time::SystemTime::now() - Duration::from_secs(3_600);
    while let Ok(Some(entry)) = entries.next_entry().await {
        let stale = entry
            .metadata()
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .is_some_and(|modified| modified < cutoff);
        if stale {
            debug!(path = %entry.path().display(), "sweeping stale GRIB temp");
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}
