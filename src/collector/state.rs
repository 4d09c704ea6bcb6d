//! Collector state machine and liveness bookkeeping.
//!
//! One logical collector exists per market; collectors sharing a transport
//! run inside one worker task, which owns a single instance of this state.
//! The supervisor polls `CollectorStatus` snapshots to spot workers stuck in
//! `Connecting`/`Subscribing` past their timeouts or parked in `Backoff` far
//! beyond their last delay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::info;

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    /// Created, not yet started.
    Idle,
    /// TCP + TLS + WebSocket upgrade in progress.
    Connecting,
    /// Connected, waiting for subscription acks.
    Subscribing,
    /// Receiving market data.
    Live,
    /// Waiting out a reconnect delay.
    Backoff,
    /// Terminal; entered only on supervisor stop.
    Stopped,
}

impl std::fmt::Display for CollectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Subscribing => write!(f, "SUBSCRIBING"),
            Self::Live => write!(f, "LIVE"),
            Self::Backoff => write!(f, "BACKOFF"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Why a transition happened (for logging and supervisor decisions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    ConnectOk,
    SubscribeOk,
    ConnectTimeout,
    SubscribeTimeout,
    IdleStream,
    ServerClose,
    NetworkError,
    BackoffElapsed,
    ShutdownRequested,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::ConnectOk => write!(f, "connect_ok"),
            Self::SubscribeOk => write!(f, "subscribe_ok"),
            Self::ConnectTimeout => write!(f, "connect_timeout"),
            Self::SubscribeTimeout => write!(f, "subscribe_timeout"),
            Self::IdleStream => write!(f, "idle_stream"),
            Self::ServerClose => write!(f, "server_close"),
            Self::NetworkError => write!(f, "network_error"),
            Self::BackoffElapsed => write!(f, "backoff_elapsed"),
            Self::ShutdownRequested => write!(f, "shutdown"),
        }
    }
}

// =============================================================================
// SHARED STATUS
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    pub state: CollectorState,
    pub in_state_for: Duration,
    pub last_backoff: Duration,
}

#[derive(Debug)]
struct StatusInner {
    state: CollectorState,
    since: Instant,
    last_backoff: Duration,
}

/// Shared view of one worker's state machine. The worker writes transitions;
/// the supervisor reads snapshots on its probe cadence.
#[derive(Debug)]
pub struct CollectorStatus {
    label: String,
    inner: RwLock<StatusInner>,
    pub metrics: CollectorMetrics,
}

impl CollectorStatus {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            inner: RwLock::new(StatusInner {
                state: CollectorState::Idle,
                since: Instant::now(),
                last_backoff: Duration::ZERO,
            }),
            metrics: CollectorMetrics::default(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> CollectorState {
        self.inner.read().state
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.read();
        StatusSnapshot {
            state: inner.state,
            in_state_for: inner.since.elapsed(),
            last_backoff: inner.last_backoff,
        }
    }

    /// Move to `new_state`, recording metrics for connect attempts and
    /// reconnects. Cold path; fine to log.
    pub fn transition(&self, new_state: CollectorState, reason: TransitionReason) {
        let old_state = {
            let mut inner = self.inner.write();
            let old = inner.state;
            inner.state = new_state;
            inner.since = Instant::now();
            old
        };

        match new_state {
            CollectorState::Connecting => {
                self.metrics.connects_attempted.fetch_add(1, Ordering::Relaxed);
            }
            CollectorState::Live => {
                self.metrics.connects_ok.fetch_add(1, Ordering::Relaxed);
            }
            CollectorState::Backoff => {
                self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        info!(
            collector = %self.label,
            from = %old_state,
            to = %new_state,
            reason = %reason,
            "collector_transition"
        );
    }

    /// Record the delay chosen for the current `Backoff` stay.
    pub fn set_backoff_delay(&self, delay: Duration) {
        self.inner.write().last_backoff = delay;
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// Per-worker counters, logged as a summary on stop.
#[derive(Debug, Default)]
pub struct CollectorMetrics {
    pub connects_attempted: AtomicU64,
    pub connects_ok: AtomicU64,
    pub reconnects: AtomicU64,
    pub payloads_ok: AtomicU64,
    pub payloads_skipped: AtomicU64,
    pub corrections: AtomicU64,
}

impl CollectorMetrics {
    #[inline]
    pub fn record_payload(&self) {
        self.payloads_ok.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_skip(&self) {
        self.payloads_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_correction(&self) {
        self.corrections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} reconnects={} payloads={} skipped={} corrections={}",
            self.connects_ok.load(Ordering::Relaxed),
            self.connects_attempted.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
            self.payloads_ok.load(Ordering::Relaxed),
            self.payloads_skipped.load(Ordering::Relaxed),
            self.corrections.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let status = CollectorStatus::new("hyperliquid:candles");
        assert_eq!(status.state(), CollectorState::Idle);

        status.transition(CollectorState::Connecting, TransitionReason::Started);
        assert_eq!(status.state(), CollectorState::Connecting);

        status.transition(CollectorState::Subscribing, TransitionReason::ConnectOk);
        status.transition(CollectorState::Live, TransitionReason::SubscribeOk);
        assert_eq!(status.state(), CollectorState::Live);

        assert_eq!(status.metrics.connects_attempted.load(Ordering::Relaxed), 1);
        assert_eq!(status.metrics.connects_ok.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_backoff_accounting() {
        let status = CollectorStatus::new("t");
        status.transition(CollectorState::Connecting, TransitionReason::Started);
        status.transition(CollectorState::Backoff, TransitionReason::NetworkError);
        status.set_backoff_delay(Duration::from_millis(1500));

        let snap = status.snapshot();
        assert_eq!(snap.state, CollectorState::Backoff);
        assert_eq!(snap.last_backoff, Duration::from_millis(1500));
        assert_eq!(status.metrics.reconnects.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_snapshot_tracks_time_in_state() {
        let status = CollectorStatus::new("t");
        status.transition(CollectorState::Connecting, TransitionReason::Started);
        std::thread::sleep(Duration::from_millis(10));
        assert!(status.snapshot().in_state_for >= Duration::from_millis(10));
    }
}
