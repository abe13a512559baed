// =============================================================================
// Event Bus — typed pub/sub with bounded per-subscriber fan-out
// =============================================================================
//
// Every event carries a process-global sequence number for debuggability.
// Delivery is best-effort in-order per tag. Slow subscribers that overrun
// their queue drop the oldest events (a warning is logged on the subscriber
// side when the gap is observed). Nothing is persisted.
//
// The tag set is closed: `EventTag` enumerates every tag at compile time and
// the per-tag channels are created once at startup, so subscribing to an
// unknown tag is unrepresentable.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::ingest::decoder::CityWeather;
use crate::providers::ProviderKind;
use crate::schedule::{DetectionWindow, ExpectedFile};
use crate::types::{CycleKey, EngineMode, ForecastSnapshot, TradeIntent};

/// Default bounded queue depth per subscriber.
const DEFAULT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Tags & events
// ---------------------------------------------------------------------------

/// Every tag the bus carries. Closed set, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventTag {
    DetectionWindowOpen,
    FileDetected,
    FileConfirmed,
    ApiData,
    ForecastChanged,
    QuotaExceeded,
    RateLimited,
    ProviderFetch,
    ModeTransition,
    BurstEnter,
    BurstExit,
    TradeIntent,
    PositionClosed,
}

impl EventTag {
    pub const ALL: [EventTag; 13] = [
        EventTag::DetectionWindowOpen,
        EventTag::FileDetected,
        EventTag::FileConfirmed,
        EventTag::ApiData,
        EventTag::ForecastChanged,
        EventTag::QuotaExceeded,
        EventTag::RateLimited,
        EventTag::ProviderFetch,
        EventTag::ModeTransition,
        EventTag::BurstEnter,
        EventTag::BurstExit,
        EventTag::TradeIntent,
        EventTag::PositionClosed,
    ];
}

impl std::fmt::Display for EventTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DetectionWindowOpen => "detection-window-open",
            Self::FileDetected => "file-detected",
            Self::FileConfirmed => "file-confirmed",
            Self::ApiData => "api-data",
            Self::ForecastChanged => "forecast-changed",
            Self::QuotaExceeded => "quota-exceeded",
            Self::RateLimited => "rate-limited",
            Self::ProviderFetch => "provider-fetch",
            Self::ModeTransition => "mode-transition",
            Self::BurstEnter => "burst-enter",
            Self::BurstExit => "burst-exit",
            Self::TradeIntent => "trade-intent",
            Self::PositionClosed => "position-closed",
        };
        write!(f, "{s}")
    }
}

/// Tagged event payloads. One variant per tag.
#[derive(Debug, Clone)]
pub enum Event {
    DetectionWindowOpen {
        window: DetectionWindow,
        expected: ExpectedFile,
    },
    FileDetected {
        expected: ExpectedFile,
        detected_at: DateTime<Utc>,
        latency_ms: u64,
    },
    FileConfirmed {
        cycle_key: CycleKey,
        cities: Vec<CityWeather>,
        e2e_latency_ms: u64,
    },
    ApiData(ForecastSnapshot),
    ForecastChanged {
        snapshot: ForecastSnapshot,
        previous: Option<f64>,
        delta: f64,
    },
    QuotaExceeded {
        provider: ProviderKind,
        calls: u64,
    },
    RateLimited {
        provider: ProviderKind,
        /// True for the soft usage-threshold warning, false for a hard 429.
        warning: bool,
        reset_at: Option<DateTime<Utc>>,
    },
    ProviderFetch {
        provider: ProviderKind,
        batch: bool,
        ok: bool,
        latency_ms: u64,
    },
    ModeTransition {
        from: EngineMode,
        to: EngineMode,
        reason: String,
    },
    BurstEnter {
        city_id: String,
        trigger_delta: f64,
    },
    BurstExit {
        calls_made: u64,
    },
    TradeIntent(TradeIntent),
    PositionClosed {
        position_id: String,
        market_id: String,
        realized_pnl: f64,
        reason: String,
    },
}

impl Event {
    pub fn tag(&self) -> EventTag {
        match self {
            Self::DetectionWindowOpen { .. } => EventTag::DetectionWindowOpen,
            Self::FileDetected { .. } => EventTag::FileDetected,
            Self::FileConfirmed { .. } => EventTag::FileConfirmed,
            Self::ApiData(_) => EventTag::ApiData,
            Self::ForecastChanged { .. } => EventTag::ForecastChanged,
            Self::QuotaExceeded { .. } => EventTag::QuotaExceeded,
            Self::RateLimited { .. } => EventTag::RateLimited,
            Self::ProviderFetch { .. } => EventTag::ProviderFetch,
            Self::ModeTransition { .. } => EventTag::ModeTransition,
            Self::BurstEnter { .. } => EventTag::BurstEnter,
            Self::BurstExit { .. } => EventTag::BurstExit,
            Self::TradeIntent(_) => EventTag::TradeIntent,
            Self::PositionClosed { .. } => EventTag::PositionClosed,
        }
    }
}

/// An event as delivered to subscribers, with its global sequence number.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub seq: u64,
    pub event: Event,
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Typed publisher with bounded per-subscriber queues. Concurrency-safe;
/// handlers must not block for long (schedule long work on a worker task).
pub struct EventBus {
    channels: HashMap<EventTag, broadcast::Sender<BusEvent>>,
    seq: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut channels = HashMap::with_capacity(EventTag::ALL.len());
        for tag in EventTag::ALL {
            let (tx, _) = broadcast::channel(capacity);
            channels.insert(tag, tx);
        }
        Self {
            channels,
            seq: AtomicU64::new(0),
        }
    }

    /// Publish an event to all current subscribers of its tag. Returns the
    /// assigned sequence number.
    pub fn publish(&self, event: Event) -> u64 {
        let tag = event.tag();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let tx = self
            .channels
            .get(&tag)
            .expect("channel exists for every tag");
        let receivers = tx.receiver_count();
        if receivers == 0 {
            debug!(tag = %tag, seq, "event published with no subscribers");
        }
        // A send error only means there are no receivers; never fatal.
        let _ = tx.send(BusEvent { seq, event });
        seq
    }

    /// Subscribe to a tag. Dropping the returned subscription unsubscribes.
    pub fn subscribe(&self, tag: EventTag) -> BusSubscription {
        let rx = self
            .channels
            .get(&tag)
            .expect("channel exists for every tag")
            .subscribe();
        BusSubscription { tag, rx }
    }

    /// Current number of subscribers on a tag (test/status use).
    pub fn subscriber_count(&self, tag: EventTag) -> usize {
        self.channels
            .get(&tag)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Sequence number that will be assigned to the next published event.
    pub fn next_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a subscription on a single tag.
pub struct BusSubscription {
    tag: EventTag,
    rx: broadcast::Receiver<BusEvent>,
}

impl BusSubscription {
    /// Await the next event on this tag.
    ///
    /// If the subscriber fell behind and the bounded queue overflowed, the
    /// oldest events are dropped; a warning is logged with the gap size and
    /// the next retained event is returned. Returns `None` once the bus has
    /// been dropped.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        tag = %self.tag,
                        skipped,
                        "slow subscriber overran its queue — oldest events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(tag = %self.tag, skipped, "subscriber lagged — events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn tag(&self) -> EventTag {
        self.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    fn quota_event(calls: u64) -> Event {
        Event::QuotaExceeded {
            provider: ProviderKind::OpenMeteo,
            calls,
        }
    }

    #[tokio::test]
    async fn publish_reaches_tag_subscribers_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventTag::QuotaExceeded);

        bus.publish(quota_event(1));
        bus.publish(quota_event(2));

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert!(first.seq < second.seq);
        match (first.event, second.event) {
            (Event::QuotaExceeded { calls: a, .. }, Event::QuotaExceeded { calls: b, .. }) => {
                assert_eq!((a, b), (1, 2));
            }
            _ => panic!("wrong payloads"),
        }
    }

    #[tokio::test]
    async fn events_do_not_cross_tags() {
        let bus = EventBus::new();
        let mut other = bus.subscribe(EventTag::BurstExit);
        bus.publish(quota_event(1));
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe(EventTag::QuotaExceeded);

        for i in 0..5 {
            bus.publish(quota_event(i));
        }

        // Capacity 2: only the newest two events survive.
        let ev = sub.recv().await.unwrap();
        match ev.event {
            Event::QuotaExceeded { calls, .. } => assert_eq!(calls, 3),
            _ => panic!("wrong payload"),
        }
        let ev = sub.recv().await.unwrap();
        match ev.event {
            Event::QuotaExceeded { calls, .. } => assert_eq!(calls, 4),
            _ => panic!("wrong payload"),
        }
    }

    #[tokio::test]
    async fn sequence_numbers_are_global_and_monotone() {
        let bus = EventBus::new();
        let mut q = bus.subscribe(EventTag::QuotaExceeded);
        let mut b = bus.subscribe(EventTag::BurstExit);

        bus.publish(quota_event(0));
        bus.publish(Event::BurstExit { calls_made: 60 });

        let s1 = q.recv().await.unwrap().seq;
        let s2 = b.recv().await.unwrap().seq;
        assert_eq!(s1, 0);
        assert_eq!(s2, 1);
    }
}
