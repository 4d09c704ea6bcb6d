//! Runtime configuration, loaded from the environment with sane defaults.
//!
//! Catalog contents are not configuration: the external loader writes them to
//! the database before start and the core treats them as read-only. A config
//! change requires a supervisor restart; there is no live reload.

use std::env;
use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

/// Persistence layer knobs.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Read connections kept open alongside the single writer.
    pub pool_size: usize,
    /// Rows accumulated before a forced flush.
    pub batch_size: usize,
    /// Flush deadline when the batch stays under `batch_size`.
    pub flush_interval: Duration,
    /// Bounded queue depth per entity type. A full queue blocks the
    /// producer; rows are never dropped.
    pub queue_depth: usize,
    /// Retry schedule for transient storage errors.
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub retry_attempts: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            batch_size: 500,
            flush_interval: Duration::from_millis(200),
            queue_depth: 2048,
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(5),
            retry_attempts: 6,
        }
    }
}

/// Minute buffer knobs.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Sweep cadence for flushing dirty slots of already-closed minutes.
    pub minute_flush_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            minute_flush_interval: Duration::from_millis(1000),
        }
    }
}

/// Collector connection and backoff knobs.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    /// No stream data for this long while `Live` forces a reconnect.
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(60_000),
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Subscriber session knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub outbound_queue_size: usize,
    /// Market ids accepted in a single subscribe frame, and the cap on a
    /// session's total subscription set.
    pub max_subscriptions: usize,
    pub max_sessions: usize,
    pub heartbeat: Duration,
    pub max_frame_bytes: usize,
    pub send_timeout: Duration,
    /// Invalid inbound frames per second before the session is closed.
    pub invalid_frame_rate_limit: u32,
    pub max_history: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_size: 1024,
            max_subscriptions: 100,
            max_sessions: 100,
            heartbeat: Duration::from_secs(30),
            max_frame_bytes: 1024 * 1024,
            send_timeout: Duration::from_secs(2),
            invalid_frame_rate_limit: 10,
            max_history: 1000,
        }
    }
}

/// Supervisor knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub probe_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default)]
pub struct KirbyConfig {
    pub storage: StorageConfig,
    pub buffer: BufferConfig,
    pub collector: CollectorConfig,
    pub session: SessionConfig,
    pub supervisor: SupervisorConfig,
}

impl KirbyConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.storage.pool_size = env_usize("KIRBY_STORAGE_POOL_SIZE", cfg.storage.pool_size);
        cfg.storage.batch_size = env_usize("KIRBY_STORAGE_BATCH_SIZE", cfg.storage.batch_size);
        cfg.storage.flush_interval = Duration::from_millis(env_u64(
            "KIRBY_STORAGE_FLUSH_INTERVAL_MS",
            cfg.storage.flush_interval.as_millis() as u64,
        ));
        cfg.storage.queue_depth = env_usize("KIRBY_STORAGE_QUEUE_DEPTH", cfg.storage.queue_depth);

        cfg.buffer.minute_flush_interval = Duration::from_millis(env_u64(
            "KIRBY_BUFFER_MINUTE_FLUSH_INTERVAL_MS",
            cfg.buffer.minute_flush_interval.as_millis() as u64,
        ));

        cfg.collector.backoff_base = Duration::from_millis(env_u64(
            "KIRBY_COLLECTOR_BACKOFF_BASE_MS",
            cfg.collector.backoff_base.as_millis() as u64,
        ));
        cfg.collector.backoff_cap = Duration::from_millis(env_u64(
            "KIRBY_COLLECTOR_BACKOFF_CAP_MS",
            cfg.collector.backoff_cap.as_millis() as u64,
        ));
        cfg.collector.idle_timeout = Duration::from_secs(env_u64(
            "KIRBY_COLLECTOR_IDLE_TIMEOUT_S",
            cfg.collector.idle_timeout.as_secs(),
        ));

        cfg.session.outbound_queue_size =
            env_usize("KIRBY_SESSION_OUTBOUND_QUEUE_SIZE", cfg.session.outbound_queue_size);
        cfg.session.max_subscriptions =
            env_usize("KIRBY_SESSION_MAX_SUBSCRIPTIONS", cfg.session.max_subscriptions);
        cfg.session.max_sessions = env_usize("KIRBY_SESSION_MAX_SESSIONS", cfg.session.max_sessions);
        cfg.session.heartbeat = Duration::from_secs(env_u64(
            "KIRBY_SESSION_HEARTBEAT_S",
            cfg.session.heartbeat.as_secs(),
        ));

        cfg.supervisor.shutdown_grace = Duration::from_secs(env_u64(
            "KIRBY_SUPERVISOR_SHUTDOWN_GRACE_S",
            cfg.supervisor.shutdown_grace.as_secs(),
        ));

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_recognized_options() {
        let cfg = KirbyConfig::default();
        assert_eq!(cfg.storage.pool_size, 10);
        assert_eq!(cfg.storage.batch_size, 500);
        assert_eq!(cfg.storage.flush_interval, Duration::from_millis(200));
        assert_eq!(cfg.buffer.minute_flush_interval, Duration::from_millis(1000));
        assert_eq!(cfg.collector.backoff_base, Duration::from_millis(1000));
        assert_eq!(cfg.collector.backoff_cap, Duration::from_millis(60_000));
        assert_eq!(cfg.collector.idle_timeout, Duration::from_secs(60));
        assert_eq!(cfg.session.outbound_queue_size, 1024);
        assert_eq!(cfg.session.max_subscriptions, 100);
        assert_eq!(cfg.session.heartbeat, Duration::from_secs(30));
        assert_eq!(cfg.supervisor.shutdown_grace, Duration::from_secs(30));
    }
}
