//! Vendor payload normalization.
//!
//! Numeric fields are parsed as decimals from their string forms, never via
//! float. The one exception to "strings only" is the ccxt shape, which
//! carries bare JSON numbers; those are lifted from the raw token text
//! (serde_json keeps it intact), so no f64 ever enters the pipeline.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use crate::catalog::MarketInfo;
use crate::error::KirbyError;
use crate::models::{Candle, FundingRate, MarketId, OpenInterest};
use crate::timegrid::{self, MINUTE_SECS};

/// Where a raw candle payload came from. Determines the expected shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Hyperliquid WebSocket `candle` channel object.
    HlWs,
    /// Binance REST/WS kline positional array (12 elements).
    BinanceRaw,
    /// ccxt-style OHLCV positional array (6 elements).
    Ccxt,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::HlWs => "hl_ws",
            Source::BinanceRaw => "binance_raw",
            Source::Ccxt => "ccxt",
        }
    }
}

impl FromStr for Source {
    type Err = KirbyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hl_ws" => Ok(Source::HlWs),
            "binance_raw" => Ok(Source::BinanceRaw),
            "ccxt" => Ok(Source::Ccxt),
            other => Err(KirbyError::MalformedPayload(format!(
                "unknown candle source '{other}'"
            ))),
        }
    }
}

fn malformed(msg: impl Into<String>) -> KirbyError {
    KirbyError::MalformedPayload(msg.into())
}

fn parse_decimal(s: &str, field: &str) -> Result<Decimal, KirbyError> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|_| malformed(format!("field '{field}' is not a decimal: '{s}'")))
}

/// Decimal from a JSON string. Bare numbers are rejected; vendors that mean
/// precision send strings.
fn dec_str(v: &Value, field: &str) -> Result<Decimal, KirbyError> {
    match v.as_str() {
        Some(s) => parse_decimal(s, field),
        None => Err(malformed(format!(
            "field '{field}' must be a decimal string, got {v}"
        ))),
    }
}

fn opt_dec_str(v: Option<&Value>, field: &str) -> Result<Option<Decimal>, KirbyError> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(v) => dec_str(v, field).map(Some),
    }
}

/// Decimal from a JSON string or a bare number token.
fn dec_lenient(v: &Value, field: &str) -> Result<Decimal, KirbyError> {
    match v {
        Value::String(s) => parse_decimal(s, field),
        // Number::to_string returns the raw JSON token, not an f64 rendering.
        Value::Number(n) => parse_decimal(&n.to_string(), field),
        other => Err(malformed(format!(
            "field '{field}' must be numeric, got {other}"
        ))),
    }
}

fn int_field(v: &Value, field: &str) -> Result<i64, KirbyError> {
    v.as_i64()
        .ok_or_else(|| malformed(format!("field '{field}' must be an integer, got {v}")))
}

fn millis_to_secs(ms: i64, field: &str) -> Result<i64, KirbyError> {
    if ms < 0 {
        return Err(malformed(format!("field '{field}' is negative: {ms}")));
    }
    Ok(ms / 1000)
}

/// Parse a vendor candle payload into the canonical record.
///
/// The open time is converted to epoch seconds UTC and floored to the
/// market's interval; `num_trades` stays `None` when the source does not
/// expose a count.
pub fn normalize_candle(
    source: Source,
    market: &MarketInfo,
    raw: &Value,
) -> Result<Candle, KirbyError> {
    match source {
        Source::HlWs => normalize_hl_candle(market, raw),
        Source::BinanceRaw => normalize_binance_kline(market, raw),
        Source::Ccxt => normalize_ccxt_ohlcv(market, raw),
    }
}

/// Hyperliquid `candle` channel object:
/// `{"t": openMs, "T": closeMs, "s": "BTC", "i": "1m",
///   "o": "...", "c": "...", "h": "...", "l": "...", "v": "...", "n": 189}`
fn normalize_hl_candle(market: &MarketInfo, raw: &Value) -> Result<Candle, KirbyError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| malformed("hl_ws candle payload is not an object"))?;

    let open_ms = int_field(obj.get("t").ok_or_else(|| malformed("missing 't'"))?, "t")?;
    let time = timegrid::floor_to(millis_to_secs(open_ms, "t")?, market.interval_secs);

    let num_trades = match obj.get("n") {
        None | Some(Value::Null) => None,
        Some(v) => {
            let n = int_field(v, "n")?;
            if n < 0 {
                return Err(malformed(format!("negative trade count {n}")));
            }
            Some(n as u32)
        }
    };

    Ok(Candle {
        market_id: market.id(),
        time,
        open: dec_str(obj.get("o").ok_or_else(|| malformed("missing 'o'"))?, "o")?,
        high: dec_str(obj.get("h").ok_or_else(|| malformed("missing 'h'"))?, "h")?,
        low: dec_str(obj.get("l").ok_or_else(|| malformed("missing 'l'"))?, "l")?,
        close: dec_str(obj.get("c").ok_or_else(|| malformed("missing 'c'"))?, "c")?,
        volume: dec_str(obj.get("v").ok_or_else(|| malformed("missing 'v'"))?, "v")?,
        num_trades,
    })
}

/// Binance kline positional array. Arity is validated before any field is
/// touched; a short or padded array is rejected outright.
const BINANCE_KLINE_ARITY: usize = 12;

fn normalize_binance_kline(market: &MarketInfo, raw: &Value) -> Result<Candle, KirbyError> {
    let arr = raw
        .as_array()
        .ok_or_else(|| malformed("binance_raw payload is not an array"))?;
    if arr.len() != BINANCE_KLINE_ARITY {
        return Err(malformed(format!(
            "binance_raw kline arity {} (expected {})",
            arr.len(),
            BINANCE_KLINE_ARITY
        )));
    }

    let open_ms = int_field(&arr[0], "open_time")?;
    let time = timegrid::floor_to(millis_to_secs(open_ms, "open_time")?, market.interval_secs);

    let n = int_field(&arr[8], "num_trades")?;
    if n < 0 {
        return Err(malformed(format!("negative trade count {n}")));
    }

    Ok(Candle {
        market_id: market.id(),
        time,
        open: dec_str(&arr[1], "open")?,
        high: dec_str(&arr[2], "high")?,
        low: dec_str(&arr[3], "low")?,
        close: dec_str(&arr[4], "close")?,
        volume: dec_str(&arr[5], "volume")?,
        num_trades: Some(n as u32),
    })
}

/// ccxt OHLCV positional array `[tsMs, o, h, l, c, v]`. No trade count in
/// this shape, so `num_trades` is `None` rather than zero.
const CCXT_OHLCV_ARITY: usize = 6;

fn normalize_ccxt_ohlcv(market: &MarketInfo, raw: &Value) -> Result<Candle, KirbyError> {
    let arr = raw
        .as_array()
        .ok_or_else(|| malformed("ccxt payload is not an array"))?;
    if arr.len() != CCXT_OHLCV_ARITY {
        return Err(malformed(format!(
            "ccxt ohlcv arity {} (expected {})",
            arr.len(),
            CCXT_OHLCV_ARITY
        )));
    }

    let ts_ms = int_field(&arr[0], "timestamp")?;
    let time = timegrid::floor_to(millis_to_secs(ts_ms, "timestamp")?, market.interval_secs);

    Ok(Candle {
        market_id: market.id(),
        time,
        open: dec_lenient(&arr[1], "open")?,
        high: dec_lenient(&arr[2], "high")?,
        low: dec_lenient(&arr[3], "low")?,
        close: dec_lenient(&arr[4], "close")?,
        volume: dec_lenient(&arr[5], "volume")?,
        num_trades: None,
    })
}

/// Split a Hyperliquid `activeAssetCtx` payload into its funding and
/// open-interest halves. `obs_time` is the local observation time in epoch
/// seconds; both records are stamped with its minute floor (the minute
/// buffer re-stamps on flush).
///
/// Shape: `{"coin": "BTC", "ctx": {"funding": "...", "openInterest": "...",
///          "markPx": "...", "oraclePx": "...", "midPx": "...",
///          "premium": "...", "dayNtlVlm": "...", "dayBaseVlm": "..."}}`
pub fn normalize_asset_ctx(
    market_id: MarketId,
    obs_time: i64,
    raw: &Value,
) -> Result<(FundingRate, OpenInterest), KirbyError> {
    let ctx = raw
        .get("ctx")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("activeAssetCtx payload missing 'ctx' object"))?;

    let minute = timegrid::floor_to(obs_time, MINUTE_SECS);

    let funding_rate = dec_str(
        ctx.get("funding")
            .ok_or_else(|| malformed("missing 'funding'"))?,
        "funding",
    )?;
    let open_interest = dec_str(
        ctx.get("openInterest")
            .ok_or_else(|| malformed("missing 'openInterest'"))?,
        "openInterest",
    )?;

    let mark_price = opt_dec_str(ctx.get("markPx"), "markPx")?;
    let oracle_price = opt_dec_str(ctx.get("oraclePx"), "oraclePx")?;
    let mid_price = opt_dec_str(ctx.get("midPx"), "midPx")?;
    let premium = opt_dec_str(ctx.get("premium"), "premium")?;
    let day_ntl = opt_dec_str(ctx.get("dayNtlVlm"), "dayNtlVlm")?;
    let day_base = opt_dec_str(ctx.get("dayBaseVlm"), "dayBaseVlm")?;

    let next_funding_time = match ctx.get("nextFundingTime") {
        None | Some(Value::Null) => None,
        Some(v) => Some(millis_to_secs(int_field(v, "nextFundingTime")?, "nextFundingTime")?),
    };

    let funding = FundingRate {
        market_id,
        time: minute,
        funding_rate,
        premium,
        mark_price,
        index_price: None,
        oracle_price,
        mid_price,
        next_funding_time,
    };

    let oi = OpenInterest {
        market_id,
        time: minute,
        notional_value: mark_price.map(|mark| open_interest * mark),
        open_interest,
        day_base_volume: day_base,
        day_notional_volume: day_ntl,
    };

    Ok((funding, oi))
}
