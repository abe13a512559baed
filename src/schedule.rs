// =============================================================================
// Schedule Manager — cycle timing, expected filenames, detection windows
// =============================================================================
//
// Owns every CycleKey/DetectionWindow object; the single timer loop is the
// only writer. Window math:
//
//   earliest_poll  = cycle_start + first_file_delay - early_start_buffer
//   fallback_start = cycle_start + first_file_delay
//   latest_poll    = earliest_poll + max_detection_duration
//   fallback_end   = fallback_start + fallback_max_duration
//
// The detection duration is anchored at earliest_poll so the invariant
// earliest_poll < fallback_start <= latest_poll holds for every model.
// Missed ticks while the loop is stopped are not replayed.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::types::{CycleKey, ModelKind};

// ---------------------------------------------------------------------------
// Per-model specification
// ---------------------------------------------------------------------------

/// Static per-model publication behavior.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub model: ModelKind,
    /// Minutes from cycle start until the detection file typically appears.
    pub first_file_delay_min: i64,
    /// Forecast hour of the detection file.
    pub detection_forecast_hour: u16,
    pub path_template: &'static str,
}

impl ModelSpec {
    pub fn builtin(model: ModelKind) -> Self {
        match model {
            ModelKind::Hrrr => Self {
                model,
                first_file_delay_min: 50,
                detection_forecast_hour: 0,
                path_template: "hrrr.{YYYYMMDD}/conus/hrrr.t{HH}z.wrfsfcf{FF}.grib2",
            },
            ModelKind::Rap => Self {
                model,
                first_file_delay_min: 52,
                detection_forecast_hour: 0,
                path_template: "rap.{YYYYMMDD}/rap.t{HH}z.awp130f{FF}.grib2",
            },
            ModelKind::Gfs => Self {
                model,
                first_file_delay_min: 210,
                detection_forecast_hour: 3,
                path_template: "gfs.{YYYYMMDD}/{HH}/atmos/gfs.t{HH}z.pgrb2.0p25.f{FFF}",
            },
            ModelKind::Ecmwf => Self {
                model,
                first_file_delay_min: 430,
                detection_forecast_hour: 3,
                path_template: "ecmwf.{YYYYMMDD}/{HH}/ifs/ecmwf.t{HH}z.0p25.f{FFF}",
            },
        }
    }
}

/// Tunable window parameters, usually sourced from the runtime config.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub max_detection_minutes: i64,
    pub fallback_max_minutes: i64,
    /// Early-start buffer per model: how long before the typical publish
    /// instant head-polling begins.
    pub early_start_minutes: HashMap<ModelKind, i64>,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        let mut early = HashMap::new();
        early.insert(ModelKind::Hrrr, 25);
        early.insert(ModelKind::Rap, 25);
        early.insert(ModelKind::Gfs, 2);
        early.insert(ModelKind::Ecmwf, 5);
        Self {
            max_detection_minutes: 30,
            fallback_max_minutes: 5,
            early_start_minutes: early,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived objects
// ---------------------------------------------------------------------------

/// A file expected to appear in public object storage for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedFile {
    pub cycle_key: CycleKey,
    pub forecast_hour: u16,
    pub bucket: &'static str,
    pub object_key: String,
}

/// Polling window for one cycle's detection file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectionWindow {
    pub cycle_key: CycleKey,
    pub earliest_poll: DateTime<Utc>,
    pub latest_poll: DateTime<Utc>,
    pub fallback_start: DateTime<Utc>,
    pub fallback_end: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Template rendering / parsing
// ---------------------------------------------------------------------------

fn render_template(template: &str, cycle: &CycleKey, forecast_hour: u16) -> String {
    template
        .replace("{YYYYMMDD}", &cycle.cycle_date.format("%Y%m%d").to_string())
        .replace("{HH}", &format!("{:02}", cycle.cycle_hour))
        .replace("{FFF}", &format!("{forecast_hour:03}"))
        .replace("{FF}", &format!("{forecast_hour:02}"))
}

/// Invert [`render_template`]. Placeholders have fixed widths, so the key is
/// scanned literal-by-literal. Returns `None` when the key does not match.
fn parse_template(template: &str, model: ModelKind, key: &str) -> Option<(CycleKey, u16)> {
    let mut rest = key;
    let mut tmpl = template;
    let mut date_str: Option<String> = None;
    let mut hour_str: Option<String> = None;
    let mut fh_str: Option<String> = None;

    while let Some(open) = tmpl.find('{') {
        let (literal, after) = tmpl.split_at(open);
        rest = rest.strip_prefix(literal)?;
        let close = after.find('}')?;
        let name = &after[1..close];
        tmpl = &after[close + 1..];

        let width = match name {
            "YYYYMMDD" => 8,
            "HH" | "FF" => 2,
            "FFF" => 3,
            _ => return None,
        };
        if rest.len() < width {
            return None;
        }
        let (value, remainder) = rest.split_at(width);
        rest = remainder;

        match name {
            "YYYYMMDD" => date_str = Some(value.to_string()),
            // {HH} may appear more than once (directory + filename); the
            // occurrences must agree.
            "HH" => match &hour_str {
                Some(prev) if prev != value => return None,
                _ => hour_str = Some(value.to_string()),
            },
            "FF" | "FFF" => fh_str = Some(value.to_string()),
            _ => unreachable!(),
        }
    }
    if rest != tmpl {
        return None;
    }

    let date = chrono::NaiveDate::parse_from_str(&date_str?, "%Y%m%d").ok()?;
    let hour: u8 = hour_str?.parse().ok()?;
    let fh: u16 = fh_str?.parse().ok()?;
    Some((CycleKey::new(model, date, hour), fh))
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ScheduleManager {
    specs: HashMap<ModelKind, ModelSpec>,
    settings: ScheduleSettings,
    bus: Arc<EventBus>,
    shutdown_tx: watch::Sender<bool>,
}

impl ScheduleManager {
    pub fn new(bus: Arc<EventBus>, settings: ScheduleSettings) -> Self {
        let specs = ModelKind::ALL
            .iter()
            .map(|m| (*m, ModelSpec::builtin(*m)))
            .collect();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            specs,
            settings,
            bus,
            shutdown_tx,
        }
    }

    /// Deterministic template substitution for a model run's detection file.
    pub fn expected_file(&self, cycle: CycleKey) -> ExpectedFile {
        let spec = &self.specs[&cycle.model];
        ExpectedFile {
            cycle_key: cycle,
            forecast_hour: spec.detection_forecast_hour,
            bucket: cycle.model.bucket(),
            object_key: render_template(spec.path_template, &cycle, spec.detection_forecast_hour),
        }
    }

    /// Parse an object key back into (cycle, forecast hour).
    pub fn parse_object_key(&self, model: ModelKind, key: &str) -> Option<(CycleKey, u16)> {
        parse_template(self.specs[&model].path_template, model, key)
    }

    /// Compute the detection window for a cycle.
    pub fn detection_window(&self, cycle: CycleKey) -> DetectionWindow {
        let spec = &self.specs[&cycle.model];
        let early = self
            .settings
            .early_start_minutes
            .get(&cycle.model)
            .copied()
            .unwrap_or(0);
        let start = cycle.cycle_start();

        let earliest_poll = start + Duration::minutes(spec.first_file_delay_min - early);
        let fallback_start = start + Duration::minutes(spec.first_file_delay_min);
        let latest_poll = earliest_poll + Duration::minutes(self.settings.max_detection_minutes);
        let fallback_end = fallback_start + Duration::minutes(self.settings.fallback_max_minutes);

        debug_assert!(earliest_poll < fallback_start && fallback_start <= latest_poll);

        DetectionWindow {
            cycle_key: cycle,
            earliest_poll,
            latest_poll,
            fallback_start,
            fallback_end,
        }
    }

    /// The next cycle of `model` whose window has not yet opened at `now`.
    fn next_cycle(&self, model: ModelKind, now: DateTime<Utc>) -> CycleKey {
        let cadence = model.cadence_hours() as i64;
        // Start from the most recent aligned cycle hour and walk forward.
        let aligned_hour = (now.hour() as i64 / cadence) * cadence;
        let mut cycle = CycleKey::new(model, now.date_naive(), aligned_hour as u8);
        // Walk back one cadence step in case that cycle's window is still
        // ahead of us (long publish delays), then forward until it is.
        let prev_start = cycle.cycle_start() - Duration::hours(cadence);
        cycle = CycleKey::new(
            model,
            prev_start.date_naive(),
            prev_start.hour() as u8,
        );
        loop {
            if self.detection_window(cycle).earliest_poll > now {
                return cycle;
            }
            cycle = cycle.next();
        }
    }

    /// Next `n` upcoming runs across all models, ordered by window-open time
    /// with ties broken highest-resolution first.
    pub fn upcoming_runs(&self, n: usize) -> Vec<(ModelKind, CycleKey, DetectionWindow)> {
        self.upcoming_runs_at(n, Utc::now())
    }

    fn upcoming_runs_at(
        &self,
        n: usize,
        now: DateTime<Utc>,
    ) -> Vec<(ModelKind, CycleKey, DetectionWindow)> {
        let mut cursors: Vec<CycleKey> = ModelKind::ALL
            .iter()
            .map(|m| self.next_cycle(*m, now))
            .collect();
        let mut out = Vec::with_capacity(n);

        while out.len() < n {
            // Pick the cursor with the earliest window open; ties resolve by
            // position in ModelKind::ALL (tie-break order).
            let (idx, _) = cursors
                .iter()
                .enumerate()
                .map(|(i, c)| (i, self.detection_window(*c).earliest_poll))
                .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
                .expect("cursors nonempty");
            let cycle = cursors[idx];
            let window = self.detection_window(cycle);
            out.push((cycle.model, cycle, window));
            cursors[idx] = cycle.next();
        }
        out
    }

    /// Run the timer loop until [`stop`](Self::stop). Emits
    /// `detection-window-open` at each window's `earliest_poll`.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("schedule manager timer loop started");

        loop {
            let now = Utc::now();
            let upcoming = self.upcoming_runs_at(ModelKind::ALL.len(), now);
            let Some((_, _, first_window)) = upcoming.first() else {
                break;
            };
            let next_open = first_window.earliest_poll;
            let wait = (next_open - now).to_std().unwrap_or_default();
            debug!(
                next_cycle = %upcoming[0].1,
                next_open = %next_open,
                wait_secs = wait.as_secs(),
                "sleeping until next detection window"
            );

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("schedule manager stopping");
                        return;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }

            // Emit every window now due, in tie-break order (the upcoming
            // list is already ordered that way; simultaneous opens share an
            // exact minute-granular timestamp).
            let fire_at = Utc::now();
            for (_, cycle, window) in &upcoming {
                if window.earliest_poll <= fire_at {
                    let expected = self.expected_file(*cycle);
                    info!(
                        cycle = %cycle,
                        key = %expected.object_key,
                        earliest = %window.earliest_poll,
                        latest = %window.latest_poll,
                        "detection window open"
                    );
                    self.bus.publish(Event::DetectionWindowOpen {
                        window: *window,
                        expected,
                    });
                } else {
                    break;
                }
            }
        }
        warn!("schedule manager loop exited without stop signal");
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
