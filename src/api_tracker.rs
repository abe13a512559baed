// =============================================================================
// API Call Tracker — per-provider daily counters and quota gating
// =============================================================================
//
// Process-wide singleton (constructed once at startup, passed down
// explicitly). All mutations and composite predicate evaluations are
// serialized under a single mutex so first-transition detection (quota
// crossing, warning threshold) is race-free.
//
// Day rollover happens lazily at the first operation of a new UTC date:
// every counter, rate-limit flag, and quota-exceeded flag resets, and the
// previous day's totals are emitted as an archival record. Running the
// rollover twice at the same date is a no-op.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::providers::ProviderKind;

/// Default fraction of the daily limit at which the one-shot warning fires.
const DEFAULT_WARN_FRACTION: f64 = 0.8;

/// Backoff applied when a provider returns a throttle response without a
/// reset hint.
const RATE_LIMIT_BACKOFF_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Per-provider record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ProviderUsage {
    call_count: u64,
    success_count: u64,
    failure_count: u64,
    last_call_at: Option<DateTime<Utc>>,
    daily_limit: Option<u64>,
    hard_quota: Option<u64>,
    warn_fraction: f64,
    warned_today: bool,
    rate_limited: bool,
    rate_limit_reset_at: Option<DateTime<Utc>>,
    quota_exceeded: bool,
    burst_calls: u64,
}

impl ProviderUsage {
    fn for_provider(kind: ProviderKind) -> Self {
        let quota = kind.hard_quota();
        Self {
            call_count: 0,
            success_count: 0,
            failure_count: 0,
            last_call_at: None,
            daily_limit: Some(quota),
            hard_quota: Some(quota),
            warn_fraction: DEFAULT_WARN_FRACTION,
            warned_today: false,
            rate_limited: false,
            rate_limit_reset_at: None,
            quota_exceeded: false,
            burst_calls: 0,
        }
    }

    fn reset_for_new_day(&mut self) {
        self.call_count = 0;
        self.success_count = 0;
        self.failure_count = 0;
        self.warned_today = false;
        self.rate_limited = false;
        self.rate_limit_reset_at = None;
        self.quota_exceeded = false;
        self.burst_calls = 0;
    }
}

/// Serializable per-provider usage for the status report.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderUsageSnapshot {
    pub provider: ProviderKind,
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub remaining_quota: Option<u64>,
    pub usage_percent: f64,
    pub rate_limited: bool,
    pub quota_exceeded: bool,
    pub burst_calls: u64,
}

/// Previous-day totals emitted at rollover.
#[derive(Debug, Clone, Serialize)]
pub struct DayArchive {
    pub date: NaiveDate,
    pub totals: Vec<ProviderUsageSnapshot>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

struct Inner {
    providers: HashMap<ProviderKind, ProviderUsage>,
    current_date: NaiveDate,
    burst_mode: bool,
    last_archive: Option<DayArchive>,
}

pub struct ApiCallTracker {
    inner: Mutex<Inner>,
    bus: Arc<EventBus>,
}

impl ApiCallTracker {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::new_at(bus, Utc::now())
    }

    fn new_at(bus: Arc<EventBus>, now: DateTime<Utc>) -> Self {
        let providers = ProviderKind::ALL
            .iter()
            .map(|k| (*k, ProviderUsage::for_provider(*k)))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                providers,
                current_date: now.date_naive(),
                burst_mode: false,
                last_archive: None,
            }),
            bus,
        }
    }

    /// Override the warning threshold for one provider (fraction of daily
    /// limit, e.g. 0.8).
    pub fn set_warn_fraction(&self, provider: ProviderKind, fraction: f64) {
        let mut inner = self.inner.lock();
        if let Some(usage) = inner.providers.get_mut(&provider) {
            usage.warn_fraction = fraction.clamp(0.0, 1.0);
        }
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Record a completed call (successful or not) and evaluate thresholds.
    pub fn record(&self, provider: ProviderKind, success: bool) {
        self.record_at(provider, success, Utc::now());
    }

    fn record_at(&self, provider: ProviderKind, success: bool, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        Self::maybe_rollover(&mut inner, now);

        let burst_mode = inner.burst_mode;
        let usage = inner
            .providers
            .entry(provider)
            .or_insert_with(|| ProviderUsage::for_provider(provider));

        usage.call_count += 1;
        usage.last_call_at = Some(now);
        if success {
            usage.success_count += 1;
        } else {
            usage.failure_count += 1;
        }
        if burst_mode {
            usage.burst_calls += 1;
        }

        // First-transition detection for the hard quota.
        let crossed_quota = match usage.hard_quota {
            Some(q) if usage.call_count >= q && !usage.quota_exceeded => {
                usage.quota_exceeded = true;
                true
            }
            _ => false,
        };

        // One-shot soft warning.
        let crossed_warning = match usage.daily_limit {
            Some(limit) if limit > 0 => {
                let threshold = (limit as f64 * usage.warn_fraction) as u64;
                if usage.call_count >= threshold && !usage.warned_today && !usage.quota_exceeded {
                    usage.warned_today = true;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        let call_count = usage.call_count;
        drop(inner);

        if crossed_quota {
            warn!(
                provider = %provider,
                calls = call_count,
                "hard quota exhausted — provider excluded for the UTC day"
            );
            self.bus.publish(Event::QuotaExceeded {
                provider,
                calls: call_count,
            });
        }
        if crossed_warning {
            warn!(
                provider = %provider,
                calls = call_count,
                "daily usage crossed warning threshold"
            );
            self.bus.publish(Event::RateLimited {
                provider,
                warning: true,
                reset_at: None,
            });
        }
    }

    /// Mark a provider rate-limited (429 observed). Clears automatically at
    /// the reset instant.
    pub fn mark_rate_limited(&self, provider: ProviderKind) {
        self.mark_rate_limited_at(provider, Utc::now());
    }

    fn mark_rate_limited_at(&self, provider: ProviderKind, now: DateTime<Utc>) {
        let reset_at = now + Duration::seconds(RATE_LIMIT_BACKOFF_SECS);
        {
            let mut inner = self.inner.lock();
            if let Some(usage) = inner.providers.get_mut(&provider) {
                usage.rate_limited = true;
                usage.rate_limit_reset_at = Some(reset_at);
            }
        }
        warn!(provider = %provider, reset_at = %reset_at, "provider rate limited");
        self.bus.publish(Event::RateLimited {
            provider,
            warning: false,
            reset_at: Some(reset_at),
        });
    }

    // -------------------------------------------------------------------------
    // Predicates
    // -------------------------------------------------------------------------

    /// True iff the provider has a hard quota and the day's calls reached it.
    pub fn is_quota_exceeded(&self, provider: ProviderKind) -> bool {
        self.is_quota_exceeded_at(provider, Utc::now())
    }

    fn is_quota_exceeded_at(&self, provider: ProviderKind, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        Self::maybe_rollover(&mut inner, now);
        inner
            .providers
            .get(&provider)
            .map(|u| u.quota_exceeded)
            .unwrap_or(false)
    }

    /// True while a rate-limit backoff is in effect; clears automatically
    /// once `now` passes the reset instant.
    pub fn is_rate_limited(&self, provider: ProviderKind) -> bool {
        self.is_rate_limited_at(provider, Utc::now())
    }

    fn is_rate_limited_at(&self, provider: ProviderKind, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        Self::maybe_rollover(&mut inner, now);
        let Some(usage) = inner.providers.get_mut(&provider) else {
            return false;
        };
        if !usage.rate_limited {
            return false;
        }
        match usage.rate_limit_reset_at {
            Some(reset) if now >= reset => {
                usage.rate_limited = false;
                usage.rate_limit_reset_at = None;
                debug!(provider = %provider, "rate limit cleared");
                false
            }
            _ => true,
        }
    }

    /// Seconds until the rate limit clears (0 when not limited).
    pub fn rate_limit_reset_secs(&self, provider: ProviderKind) -> u64 {
        let now = Utc::now();
        let inner = self.inner.lock();
        inner
            .providers
            .get(&provider)
            .and_then(|u| u.rate_limit_reset_at)
            .map(|reset| (reset - now).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// Calls remaining before the hard quota, `None` when unlimited.
    pub fn remaining_quota(&self, provider: ProviderKind) -> Option<u64> {
        self.remaining_quota_at(provider, Utc::now())
    }

    fn remaining_quota_at(&self, provider: ProviderKind, now: DateTime<Utc>) -> Option<u64> {
        let mut inner = self.inner.lock();
        Self::maybe_rollover(&mut inner, now);
        let usage = inner.providers.get(&provider)?;
        usage.hard_quota.map(|q| q.saturating_sub(usage.call_count))
    }

    /// Daily usage as a percentage of the daily limit (0 when unlimited).
    pub fn usage_percent(&self, provider: ProviderKind) -> f64 {
        let inner = self.inner.lock();
        let Some(usage) = inner.providers.get(&provider) else {
            return 0.0;
        };
        match usage.daily_limit {
            Some(limit) if limit > 0 => (usage.call_count as f64 / limit as f64) * 100.0,
            _ => 0.0,
        }
    }

    // -------------------------------------------------------------------------
    // Burst accounting
    // -------------------------------------------------------------------------

    pub fn enter_burst_mode(&self) {
        let mut inner = self.inner.lock();
        inner.burst_mode = true;
    }

    pub fn exit_burst_mode(&self) {
        let mut inner = self.inner.lock();
        inner.burst_mode = false;
    }

    pub fn is_burst_mode(&self) -> bool {
        self.inner.lock().burst_mode
    }

    // -------------------------------------------------------------------------
    // Snapshots & rollover
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> Vec<ProviderUsageSnapshot> {
        let inner = self.inner.lock();
        ProviderKind::ALL
            .iter()
            .filter_map(|k| inner.providers.get(k).map(|u| Self::snapshot_one(*k, u)))
            .collect()
    }

    /// Previous-day archival record, if a rollover has happened.
    pub fn last_archive(&self) -> Option<DayArchive> {
        self.inner.lock().last_archive.clone()
    }

    fn snapshot_one(kind: ProviderKind, usage: &ProviderUsage) -> ProviderUsageSnapshot {
        let usage_percent = match usage.daily_limit {
            Some(limit) if limit > 0 => (usage.call_count as f64 / limit as f64) * 100.0,
            _ => 0.0,
        };
        ProviderUsageSnapshot {
            provider: kind,
            call_count: usage.call_count,
            success_count: usage.success_count,
            failure_count: usage.failure_count,
            remaining_quota: usage.hard_quota.map(|q| q.saturating_sub(usage.call_count)),
            usage_percent,
            rate_limited: usage.rate_limited,
            quota_exceeded: usage.quota_exceeded,
            burst_calls: usage.burst_calls,
        }
    }

    /// Reset all counters if the UTC date has changed. Idempotent within a
    /// single date.
    fn maybe_rollover(inner: &mut Inner, now: DateTime<Utc>) {
        let today = now.date_naive();
        if inner.current_date == today {
            return;
        }

        let totals: Vec<ProviderUsageSnapshot> = ProviderKind::ALL
            .iter()
            .filter_map(|k| inner.providers.get(k).map(|u| Self::snapshot_one(*k, u)))
            .collect();
        let archive = DayArchive {
            date: inner.current_date,
            totals,
        };
        info!(
            old_date = %archive.date,
            new_date = %today,
            total_calls = archive.totals.iter().map(|t| t.call_count).sum::<u64>(),
            "UTC date rolled — resetting provider counters"
        );
        inner.last_archive = Some(archive);
        inner.current_date = today;
        for usage in inner.providers.values_mut() {
            usage.reset_for_new_day();
        }
    }
}

impl std::fmt::Debug for ApiCallTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ApiCallTracker")
            .field("current_date", &inner.current_date)
            .field("burst_mode", &inner.burst_mode)
            .field("providers", &inner.providers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventTag;
    use chrono::TimeZone;

    fn tracker() -> (ApiCallTracker, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let t = ApiCallTracker::new_at(bus.clone(), Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());
        (t, bus)
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, h, m, 0).unwrap()
    }

    #[test]
    fn quota_flips_once_and_stays() {
        let (t, bus) = tracker();
        let mut quota_sub = bus.subscribe(EventTag::QuotaExceeded);

        for _ in 0..499 {
            t.record_at(ProviderKind::Meteosource, true, at(1, 0));
        }
        assert!(!t.is_quota_exceeded_at(ProviderKind::Meteosource, at(1, 0)));
        assert_eq!(t.remaining_quota_at(ProviderKind::Meteosource, at(1, 0)), Some(1));

        t.record_at(ProviderKind::Meteosource, true, at(1, 1));
        assert!(t.is_quota_exceeded_at(ProviderKind::Meteosource, at(1, 1)));
        assert!(quota_sub.try_recv().is_some());
        // One-shot: a further call does not re-publish.
        t.record_at(ProviderKind::Meteosource, true, at(1, 2));
        assert!(quota_sub.try_recv().is_none());
    }

    #[test]
    fn remaining_quota_is_monotone_after_exhaustion() {
        let (t, _bus) = tracker();
        for _ in 0..505 {
            t.record_at(ProviderKind::Meteosource, true, at(2, 0));
        }
        assert_eq!(t.remaining_quota_at(ProviderKind::Meteosource, at(2, 0)), Some(0));
        t.record_at(ProviderKind::Meteosource, false, at(2, 1));
        assert_eq!(t.remaining_quota_at(ProviderKind::Meteosource, at(2, 1)), Some(0));
    }

    #[test]
    fn rate_limit_clears_at_reset_instant() {
        let (t, _bus) = tracker();
        t.mark_rate_limited_at(ProviderKind::OpenWeather, at(3, 0));
        assert!(t.is_rate_limited_at(ProviderKind::OpenWeather, at(3, 0)));
        // 59 s later: still limited.
        let almost = at(3, 0) + Duration::seconds(59);
        assert!(t.is_rate_limited_at(ProviderKind::OpenWeather, almost));
        // At the reset instant: cleared.
        let reset = at(3, 0) + Duration::seconds(RATE_LIMIT_BACKOFF_SECS);
        assert!(!t.is_rate_limited_at(ProviderKind::OpenWeather, reset));
    }

    #[test]
    fn warning_threshold_fires_once() {
        let (t, bus) = tracker();
        let mut warn_sub = bus.subscribe(EventTag::RateLimited);

        // 80% of meteosource's 500/day limit = 400 calls.
        for _ in 0..400 {
            t.record_at(ProviderKind::Meteosource, true, at(4, 0));
        }
        let ev = warn_sub.try_recv().expect("warning published");
        match ev.event {
            Event::RateLimited { warning, .. } => assert!(warning),
            _ => panic!("wrong payload"),
        }
        t.record_at(ProviderKind::Meteosource, true, at(4, 1));
        assert!(warn_sub.try_recv().is_none());
    }

    #[test]
    fn day_rollover_resets_and_archives_idempotently() {
        let (t, _bus) = tracker();
        for _ in 0..510 {
            t.record_at(ProviderKind::Meteosource, true, at(5, 0));
        }
        assert!(t.is_quota_exceeded_at(ProviderKind::Meteosource, at(5, 0)));

        let next_day = Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 1).unwrap();
        // First operation of the new date triggers the rollover.
        assert!(!t.is_quota_exceeded_at(ProviderKind::Meteosource, next_day));
        assert_eq!(
            t.remaining_quota_at(ProviderKind::Meteosource, next_day),
            Some(500)
        );

        let archive = t.last_archive().expect("archive emitted");
        assert_eq!(archive.date, NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
        let ms = archive
            .totals
            .iter()
            .find(|s| s.provider == ProviderKind::Meteosource)
            .unwrap();
        assert_eq!(ms.call_count, 510);

        // Second rollover at the same date: counters unchanged.
        assert!(!t.is_quota_exceeded_at(ProviderKind::Meteosource, next_day));
        assert_eq!(
            t.remaining_quota_at(ProviderKind::Meteosource, next_day),
            Some(500)
        );
        assert_eq!(t.last_archive().unwrap().date, archive.date);
    }

    #[test]
    fn burst_mode_counts_separately() {
        let (t, _bus) = tracker();
        t.record_at(ProviderKind::OpenMeteo, true, at(6, 0));
        t.enter_burst_mode();
        t.record_at(ProviderKind::OpenMeteo, true, at(6, 1));
        t.record_at(ProviderKind::OpenMeteo, true, at(6, 2));
        t.exit_burst_mode();
        t.record_at(ProviderKind::OpenMeteo, true, at(6, 3));

        let snap = t.snapshot();
        let om = snap
            .iter()
            .find(|s| s.provider == ProviderKind::OpenMeteo)
            .unwrap();
        assert_eq!(om.call_count, 4);
        assert_eq!(om.burst_calls, 2);
    }
}
