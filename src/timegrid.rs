//! Interval arithmetic over UTC Unix epoch seconds.
//!
//! Every persisted `time` value must equal `floor_to(time, interval_seconds)`.
//! Producers that present unfloored times are malformed input and get rejected
//! before they reach storage.

pub const MINUTE_SECS: i64 = 60;

/// Floor `t` to the nearest interval boundary at or below it.
#[inline]
pub fn floor_to(t: i64, interval_secs: i64) -> i64 {
    debug_assert!(interval_secs > 0);
    t - t.rem_euclid(interval_secs)
}

/// First boundary strictly after `t`.
#[inline]
pub fn next_after(t: i64, interval_secs: i64) -> i64 {
    floor_to(t, interval_secs) + interval_secs
}

/// True when `t` sits exactly on an interval boundary.
#[inline]
pub fn is_aligned(t: i64, interval_secs: i64) -> bool {
    t.rem_euclid(interval_secs) == 0
}

/// Enumerate boundaries in `[from, to)`, both floored to the grid.
pub fn boundaries(from: i64, to: i64, interval_secs: i64) -> impl Iterator<Item = i64> {
    let start = if is_aligned(from, interval_secs) {
        from
    } else {
        next_after(from, interval_secs)
    };
    (0..)
        .map(move |k| start + k * interval_secs)
        .take_while(move |t| *t < to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_on_boundary_is_identity() {
        // An observation exactly at t = k*60 belongs to minute k, not k-1.
        assert_eq!(floor_to(1_700_000_040, 60), 1_700_000_040);
        assert_eq!(floor_to(0, 60), 0);
    }

    #[test]
    fn test_floor_mid_interval() {
        assert_eq!(floor_to(1_700_000_059, 60), 1_700_000_040);
        assert_eq!(floor_to(1_700_000_041, 60), 1_700_000_040);
    }

    #[test]
    fn test_next_after() {
        assert_eq!(next_after(1_700_000_040, 60), 1_700_000_100);
        assert_eq!(next_after(1_700_000_041, 60), 1_700_000_100);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(1_700_000_040, 60));
        assert!(!is_aligned(1_700_000_041, 60));
        assert!(is_aligned(1_700_003_600, 3600));
    }

    #[test]
    fn test_boundaries_enumeration() {
        let got: Vec<i64> = boundaries(130, 310, 60).collect();
        assert_eq!(got, vec![180, 240, 300]);

        // Aligned start is included, end is exclusive.
        let got: Vec<i64> = boundaries(120, 240, 60).collect();
        assert_eq!(got, vec![120, 180]);
    }

    #[test]
    fn test_floor_idempotent() {
        for t in [0, 59, 60, 61, 1_700_000_000, i64::MAX / 2] {
            let f = floor_to(t, 60);
            assert_eq!(floor_to(f, 60), f);
        }
    }
}
