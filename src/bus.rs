//! In-process notification bus: post-commit persistence events fan out to
//! live subscriber sessions.
//!
//! The subscription index is the only globally shared mutable structure in
//! the process. Writers (subscribe/unsubscribe) serialize on one lock and
//! install a fresh snapshot; `publish` reads the current snapshot lock-free,
//! so publication never contends with other publishes or with slow sessions.
//!
//! Delivery is at-most-once. A full session queue drops the event for that
//! session only and schedules a coalesced `lag_warning`; the publisher is
//! never blocked, which preserves the persistence layer's commit rate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::MarketCatalog;
use crate::error::KirbyError;
use crate::models::{Candle, FundingRate, MarketId, OpenInterest};
use crate::wire::ServerFrame;

/// A row the persistence layer just committed.
#[derive(Debug, Clone)]
pub enum CommitEvent {
    Candle(Candle),
    Funding(FundingRate),
    OpenInterest(OpenInterest),
}

impl CommitEvent {
    pub fn market_id(&self) -> MarketId {
        match self {
            CommitEvent::Candle(c) => c.market_id,
            CommitEvent::Funding(f) => f.market_id,
            CommitEvent::OpenInterest(o) => o.market_id,
        }
    }
}

/// Outbound unit sitting in a session queue. Live frames are serialized once
/// per publish and shared across sessions; critical frames (acks, history,
/// heartbeats) are per-session and never dropped.
#[derive(Debug, Clone)]
pub enum Delivery {
    Live(Arc<str>),
    Critical(Arc<str>),
}

impl Delivery {
    pub fn text(&self) -> &str {
        match self {
            Delivery::Live(s) | Delivery::Critical(s) => s,
        }
    }
}

/// Lag-warning coalescing window.
const LAG_WARN_INTERVAL_MS: i64 = 1000;

/// Bus-facing half of a subscriber session: the bounded outbound queue plus
/// the bookkeeping for overflow handling.
pub struct SessionHandle {
    pub id: Uuid,
    queue: ArrayQueue<Delivery>,
    notify: Notify,
    dropped_total: AtomicU64,
    dropped_since_warn: AtomicU64,
    last_lag_warn_ms: AtomicI64,
    killed: AtomicBool,
}

impl SessionHandle {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            dropped_total: AtomicU64::new(0),
            dropped_since_warn: AtomicU64::new(0),
            last_lag_warn_ms: AtomicI64::new(i64::MIN),
            killed: AtomicBool::new(false),
        })
    }

    /// Enqueue a live frame. On overflow the frame is dropped for this
    /// session only and a lag warning is scheduled.
    pub fn push_live(&self, frame: Arc<str>) {
        if self.killed.load(Ordering::Acquire) {
            return;
        }
        if self.queue.push(Delivery::Live(frame)).is_err() {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            self.dropped_since_warn.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    /// Enqueue a frame that must not be dropped. Overflow marks the session
    /// for closure instead.
    pub fn push_critical(&self, frame: Arc<str>) -> Result<(), KirbyError> {
        if self.killed.load(Ordering::Acquire) {
            return Err(KirbyError::SlowConsumer);
        }
        if self.queue.push(Delivery::Critical(frame)).is_err() {
            self.killed.store(true, Ordering::Release);
            self.notify.notify_one();
            return Err(KirbyError::SlowConsumer);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<Delivery> {
        self.queue.pop()
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Take the pending lag warning if the coalescing window allows one.
    /// Returns the number of frames dropped since the last warning.
    pub fn take_lag_warning(&self, now_ms: i64) -> Option<u64> {
        if self.dropped_since_warn.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let last = self.last_lag_warn_ms.load(Ordering::Relaxed);
        if last != i64::MIN && now_ms - last < LAG_WARN_INTERVAL_MS {
            return None;
        }
        if self
            .last_lag_warn_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        Some(self.dropped_since_warn.swap(0, Ordering::Relaxed))
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// True once a non-droppable frame overflowed; the session loop closes
    /// with `slow_consumer`.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }
}

/// Fan-out counters, logged on shutdown.
#[derive(Debug, Default)]
pub struct BusMetrics {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub no_listeners: AtomicU64,
}

impl BusMetrics {
    pub fn summary(&self) -> String {
        format!(
            "published={} delivered={} no_listeners={}",
            self.published.load(Ordering::Relaxed),
            self.delivered.load(Ordering::Relaxed),
            self.no_listeners.load(Ordering::Relaxed),
        )
    }
}

type SubscriberIndex = HashMap<MarketId, Vec<(Uuid, Weak<SessionHandle>)>>;

/// The bus itself. Holds sessions weakly so a client that disconnects
/// mid-publish cannot leak.
pub struct NotificationBus {
    catalog: Arc<MarketCatalog>,
    index: ArcSwap<SubscriberIndex>,
    write_lock: Mutex<()>,
    pub metrics: BusMetrics,
}

impl NotificationBus {
    pub fn new(catalog: Arc<MarketCatalog>) -> Self {
        Self {
            catalog,
            index: ArcSwap::from_pointee(SubscriberIndex::new()),
            write_lock: Mutex::new(()),
            metrics: BusMetrics::default(),
        }
    }

    /// Register `session` for each market id. Idempotent.
    pub fn subscribe(&self, market_ids: &[MarketId], session: &Arc<SessionHandle>) {
        let _guard = self.write_lock.lock();
        let mut map = (**self.index.load()).clone();
        for &id in market_ids {
            let entry = map.entry(id).or_default();
            entry.retain(|(_, weak)| weak.strong_count() > 0);
            if !entry.iter().any(|(sid, _)| *sid == session.id) {
                entry.push((session.id, Arc::downgrade(session)));
            }
        }
        self.index.store(Arc::new(map));
    }

    /// Remove `session` from each market id. Unknown ids are ignored.
    pub fn unsubscribe(&self, market_ids: &[MarketId], session_id: Uuid) {
        let _guard = self.write_lock.lock();
        let mut map = (**self.index.load()).clone();
        for id in market_ids {
            if let Some(entry) = map.get_mut(id) {
                entry.retain(|(sid, weak)| *sid != session_id && weak.strong_count() > 0);
                if entry.is_empty() {
                    map.remove(id);
                }
            }
        }
        self.index.store(Arc::new(map));
    }

    /// Drop every subscription a closing session still holds.
    pub fn remove_session(&self, session_id: Uuid) {
        let _guard = self.write_lock.lock();
        let mut map = (**self.index.load()).clone();
        map.retain(|_, entry| {
            entry.retain(|(sid, weak)| *sid != session_id && weak.strong_count() > 0);
            !entry.is_empty()
        });
        self.index.store(Arc::new(map));
        debug!(session = %session_id, "session removed from bus");
    }

    /// Fan a freshly-committed row out to its subscribers. Called by the
    /// persistence writer in commit order; never blocks.
    pub fn publish(&self, event: &CommitEvent) {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.index.load();
        let Some(subscribers) = snapshot.get(&event.market_id()) else {
            self.metrics.no_listeners.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let Some(info) = self.catalog.lookup(event.market_id()) else {
            // Collectors only persist catalog markets, so this is a logic
            // error rather than a runtime condition.
            warn!(market_id = event.market_id(), "commit event for unknown market");
            return;
        };

        let frame = match event {
            CommitEvent::Candle(c) => ServerFrame::candle(info, c),
            CommitEvent::Funding(f) => ServerFrame::funding(info, f),
            CommitEvent::OpenInterest(o) => ServerFrame::open_interest(info, o),
        };
        let text: Arc<str> = Arc::from(frame.to_json());

        for (_, weak) in subscribers {
            if let Some(session) = weak.upgrade() {
                session.push_live(text.clone());
                self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Subscriber count for a market (test and introspection helper).
    pub fn subscriber_count(&self, market_id: MarketId) -> usize {
        self.index
            .load()
            .get(&market_id)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|(_, weak)| weak.strong_count() > 0)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, MarketCatalog};
    use crate::storage::Db;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn test_catalog() -> Arc<MarketCatalog> {
        let db = Db::open_in_memory().unwrap();
        db.with_writer(|conn| catalog::seed_default(conn)).unwrap();
        Arc::new(
            db.with_reader(|conn| Ok(MarketCatalog::load(conn)))
                .unwrap()
                .unwrap(),
        )
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn candle_event(market_id: i64, time: i64, close: &str) -> CommitEvent {
        CommitEvent::Candle(Candle {
            market_id,
            time,
            open: dec("100"),
            high: dec("115"),
            low: dec("95"),
            close: dec(close),
            volume: dec("1"),
            num_trades: None,
        })
    }

    #[test]
    fn test_publish_reaches_subscriber_in_order() {
        let bus = NotificationBus::new(test_catalog());
        let session = SessionHandle::new(16);
        bus.subscribe(&[1], &session);

        bus.publish(&candle_event(1, 60, "101"));
        bus.publish(&candle_event(1, 120, "102"));

        let first = session.pop().unwrap();
        let second = session.pop().unwrap();
        assert!(first.text().contains("\"close\":\"101\""));
        assert!(second.text().contains("\"close\":\"102\""));
        assert!(session.pop().is_none());
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let bus = NotificationBus::new(test_catalog());
        let session = SessionHandle::new(16);
        bus.subscribe(&[1], &session);
        bus.subscribe(&[1], &session);
        assert_eq!(bus.subscriber_count(1), 1);

        bus.publish(&candle_event(1, 60, "101"));
        assert!(session.pop().is_some());
        assert!(session.pop().is_none(), "no duplicate delivery");
    }

    #[test]
    fn test_unsubscribe_unknown_ids_ignored() {
        let bus = NotificationBus::new(test_catalog());
        let session = SessionHandle::new(16);
        bus.subscribe(&[1], &session);
        bus.unsubscribe(&[1, 999], session.id);
        assert_eq!(bus.subscriber_count(1), 0);
    }

    #[test]
    fn test_events_without_listeners_are_discarded() {
        let bus = NotificationBus::new(test_catalog());
        bus.publish(&candle_event(2, 60, "101"));
        assert_eq!(bus.metrics.no_listeners.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dropped_session_is_pruned_on_publish() {
        let bus = NotificationBus::new(test_catalog());
        let session = SessionHandle::new(16);
        bus.subscribe(&[1], &session);
        drop(session);

        // Upgrade fails; nothing delivered, nothing panics.
        bus.publish(&candle_event(1, 60, "101"));
        assert_eq!(bus.metrics.delivered.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_slow_consumer_drops_live_frames_only_for_that_session() {
        let bus = NotificationBus::new(test_catalog());
        let slow = SessionHandle::new(4);
        let fast = SessionHandle::new(64);
        bus.subscribe(&[1], &slow);
        bus.subscribe(&[1], &fast);

        for i in 0..10 {
            bus.publish(&candle_event(1, 60 * (i + 1), "101"));
        }

        // Slow session kept at most 4, dropped the rest, and stays open.
        let mut kept = 0;
        while slow.pop().is_some() {
            kept += 1;
        }
        assert_eq!(kept, 4);
        assert_eq!(slow.dropped_total(), 6);
        assert!(!slow.is_killed());

        // Fast session saw everything.
        let mut all = 0;
        while fast.pop().is_some() {
            all += 1;
        }
        assert_eq!(all, 10);
    }

    #[test]
    fn test_lag_warning_coalesced_to_one_per_second() {
        let session = SessionHandle::new(2);
        for _ in 0..8 {
            session.push_live(Arc::from("{}"));
        }

        // First warning fires immediately with the drop count.
        assert_eq!(session.take_lag_warning(10_000), Some(6));
        // More drops inside the same second stay coalesced.
        session.push_live(Arc::from("{}"));
        assert_eq!(session.take_lag_warning(10_500), None);
        // Next second they surface.
        assert_eq!(session.take_lag_warning(11_000), Some(1));
        assert_eq!(session.take_lag_warning(11_100), None);
    }

    #[test]
    fn test_critical_overflow_kills_session() {
        let session = SessionHandle::new(2);
        assert!(session.push_critical(Arc::from("a")).is_ok());
        assert!(session.push_critical(Arc::from("b")).is_ok());
        assert!(matches!(
            session.push_critical(Arc::from("c")),
            Err(KirbyError::SlowConsumer)
        ));
        assert!(session.is_killed());
    }
}
