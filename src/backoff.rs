//! Exponential backoff with full jitter.
//!
//! Shared by the collectors (reconnect pacing) and the persistence layer
//! (transient storage retries). Jitter keeps a fleet of collectors from
//! thundering back onto an exchange in lockstep after an outage.

use std::time::Duration;

/// Backoff timer. Delays are drawn uniformly from
/// `[0, min(cap, base * 2^attempt)]` (full jitter), never below 1 ms.
#[derive(Debug)]
pub struct BackoffTimer {
    base: Duration,
    cap: Duration,
    attempt: u32,
    rng_state: u64,
}

impl BackoffTimer {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E3779B97F4A7C15),
        }
    }

    /// Fast PRNG for jitter (xorshift64)
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    /// Next delay, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = (self.base.as_millis() as f64) * 2f64.powi(self.attempt.min(20) as i32);
        let ceiling = exp.min(self.cap.as_millis() as f64);
        let jittered = self.next_random() * ceiling;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis((jittered as u64).max(1))
    }

    /// Reset after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
