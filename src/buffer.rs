//! Minute buffer: collapse bursty funding/OI updates to one row per minute
//! per market.
//!
//! The latest observation within a minute is the canonical value (funding and
//! open interest are cumulative states, not events), so a slot only ever
//! keeps the newest tuple. Minute `m` is always flushed before `m+1` for the
//! same market; cross-market ordering is not preserved and not needed.

use std::collections::HashMap;

use tracing::warn;

use crate::models::{FundingRate, MarketId, OpenInterest};
use crate::timegrid::{self, MINUTE_SECS};

/// Rows the buffer can hold: stamped with the owning minute on flush.
pub trait MinuteStamped {
    fn stamp_minute(&mut self, minute: i64);
}

impl MinuteStamped for FundingRate {
    fn stamp_minute(&mut self, minute: i64) {
        self.time = minute;
    }
}

impl MinuteStamped for OpenInterest {
    fn stamp_minute(&mut self, minute: i64) {
        self.time = minute;
    }
}

struct Slot<T> {
    minute: i64,
    latest: T,
    dirty: bool,
}

/// One slot per market for a single stream (funding or OI; never both in one
/// buffer).
pub struct MinuteBuffer<T> {
    stream: &'static str,
    slots: HashMap<MarketId, Slot<T>>,
    out_of_order_drops: u64,
}

impl<T: MinuteStamped + Clone> MinuteBuffer<T> {
    pub fn new(stream: &'static str) -> Self {
        Self {
            stream,
            slots: HashMap::new(),
            out_of_order_drops: 0,
        }
    }

    /// Record an observation made at `obs_time`. Returns the previous
    /// minute's row when this observation advances the slot to a new minute.
    pub fn observe(&mut self, market_id: MarketId, obs_time: i64, tuple: T) -> Option<T> {
        let minute = timegrid::floor_to(obs_time, MINUTE_SECS);

        let Some(slot) = self.slots.get_mut(&market_id) else {
            self.slots.insert(
                market_id,
                Slot {
                    minute,
                    latest: tuple,
                    dirty: true,
                },
            );
            return None;
        };

        if minute == slot.minute {
            slot.latest = tuple;
            slot.dirty = true;
            return None;
        }

        if minute < slot.minute {
            self.out_of_order_drops += 1;
            warn!(
                stream = self.stream,
                market_id,
                observed_minute = minute,
                slot_minute = slot.minute,
                "out-of-order observation dropped"
            );
            return None;
        }

        // Minute advanced: flush what we were holding, then start the new one.
        let flushed = slot.dirty.then(|| {
            let mut row = slot.latest.clone();
            row.stamp_minute(slot.minute);
            row
        });
        slot.minute = minute;
        slot.latest = tuple;
        slot.dirty = true;
        flushed
    }

    /// Flush every dirty slot whose minute has already closed. Driven by the
    /// once-per-second tick so the last observation of a minute is persisted
    /// even when the stream idles.
    pub fn sweep(&mut self, now: i64) -> Vec<T> {
        let current = timegrid::floor_to(now, MINUTE_SECS);
        let mut out = Vec::new();
        for (_, slot) in self.slots.iter_mut() {
            if slot.dirty && slot.minute < current {
                let mut row = slot.latest.clone();
                row.stamp_minute(slot.minute);
                slot.dirty = false;
                out.push(row);
            }
        }
        out
    }

    /// Flush everything still dirty regardless of minute. Shutdown path.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (_, slot) in self.slots.iter_mut() {
            if slot.dirty {
                let mut row = slot.latest.clone();
                row.stamp_minute(slot.minute);
                slot.dirty = false;
                out.push(row);
            }
        }
        out
    }

    pub fn out_of_order_drops(&self) -> u64 {
        self.out_of_order_drops
    }
}
