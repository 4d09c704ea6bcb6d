//! Core data model: catalog entities and time-series records.
//!
//! Prices and sizes are `rust_decimal::Decimal` end to end. They enter the
//! system as vendor decimal strings, never pass through floats, and leave the
//! system as decimal strings on the live wire.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::KirbyError;
use crate::timegrid;

pub type MarketId = i64;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Venue the stream comes from (e.g. `hyperliquid`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub id: i64,
    pub name: String,
}

/// Base asset (e.g. `BTC`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coin {
    pub id: i64,
    pub symbol: String,
}

/// Quote asset (e.g. `USD`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub id: i64,
    pub symbol: String,
}

/// Market class (e.g. `perps`, `spot`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketType {
    pub id: i64,
    pub name: String,
}

/// Candle interval with its duration on the time grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interval {
    pub id: i64,
    pub name: String,
    pub seconds: i64,
}

/// The unique tuple `(exchange, coin, quote, market_type, interval)`.
/// External docs call this a "starlisting".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub exchange_id: i64,
    pub coin_id: i64,
    pub quote_id: i64,
    pub market_type_id: i64,
    pub interval_id: i64,
    pub active: bool,
    pub display_name: String,
}

// ---------------------------------------------------------------------------
// Time-series records
// ---------------------------------------------------------------------------

/// One OHLCV bar. `time` is the interval-floored open time in epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub market_id: MarketId,
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// `None` means the source does not expose a trade count. Distinct from
    /// an observed zero.
    pub num_trades: Option<u32>,
}

impl Candle {
    /// Enforce the persisted-row invariants before the bar is allowed near
    /// storage: OHLC ordering, non-negative volume, grid-aligned time.
    pub fn validate(&self, interval_secs: i64) -> Result<(), KirbyError> {
        if !timegrid::is_aligned(self.time, interval_secs) {
            return Err(KirbyError::MalformedPayload(format!(
                "candle time {} not aligned to {}s grid",
                self.time, interval_secs
            )));
        }
        let body_high = self.open.max(self.close);
        let body_low = self.open.min(self.close);
        if self.high < body_high || body_low < self.low {
            return Err(KirbyError::MalformedPayload(format!(
                "candle ohlc out of order: o={} h={} l={} c={}",
                self.open, self.high, self.low, self.close
            )));
        }
        if self.volume < Decimal::ZERO {
            return Err(KirbyError::MalformedPayload(format!(
                "negative volume {}",
                self.volume
            )));
        }
        Ok(())
    }
}

/// One funding observation, floored to a minute boundary. Only the rate
/// itself is mandatory; venues routinely omit the price fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingRate {
    pub market_id: MarketId,
    pub time: i64,
    pub funding_rate: Decimal,
    pub premium: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
    pub oracle_price: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub next_funding_time: Option<i64>,
}

/// One open-interest observation, floored to a minute boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub market_id: MarketId,
    pub time: i64,
    pub open_interest: Decimal,
    pub notional_value: Option<Decimal>,
    pub day_base_volume: Option<Decimal>,
    pub day_notional_volume: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn bar() -> Candle {
        Candle {
            market_id: 1,
            time: 1_700_000_040,
            open: dec("100"),
            high: dec("110"),
            low: dec("95"),
            close: dec("105"),
            volume: dec("10"),
            num_trades: Some(50),
        }
    }

    #[test]
    fn test_valid_candle_passes() {
        assert!(bar().validate(60).is_ok());
    }

    #[test]
    fn test_unaligned_time_rejected() {
        let mut c = bar();
        c.time += 1;
        assert!(matches!(
            c.validate(60),
            Err(KirbyError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_high_below_body_rejected() {
        let mut c = bar();
        c.high = dec("104");
        assert!(c.validate(60).is_err());
    }

    #[test]
    fn test_low_above_body_rejected() {
        let mut c = bar();
        c.low = dec("101");
        assert!(c.validate(60).is_err());
    }

    #[test]
    fn test_negative_volume_rejected() {
        let mut c = bar();
        c.volume = dec("-1");
        assert!(c.validate(60).is_err());
    }

    #[test]
    fn test_doji_bar_is_valid() {
        // open == high == low == close, zero volume
        let c = Candle {
            market_id: 1,
            time: 0,
            open: dec("100"),
            high: dec("100"),
            low: dec("100"),
            close: dec("100"),
            volume: Decimal::ZERO,
            num_trades: Some(0),
        };
        assert!(c.validate(60).is_ok());
    }
}
