//! Framed JSON protocol for the live push wire.
//!
//! One JSON object per WebSocket text frame. Prices and sizes are decimal
//! strings (never floats on the wire); timestamps are RFC-3339 UTC.

use chrono::{DateTime, SecondsFormat};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::MarketInfo;
use crate::models::{Candle, FundingRate, MarketId, OpenInterest};

/// Epoch seconds → `2025-11-17T22:29:00Z`.
pub fn rfc3339(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| secs.to_string())
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        market_ids: Vec<MarketId>,
        #[serde(default)]
        history: u32,
    },
    Unsubscribe {
        market_ids: Vec<MarketId>,
    },
    Ping,
}

impl ClientFrame {
    /// Parse an inbound text frame, mapping failures onto wire error codes:
    /// not JSON at all → `invalid_json`; JSON without a known `action` →
    /// `unknown_action`; a known action with a bad payload →
    /// `validation_error`.
    pub fn parse(text: &str) -> Result<Self, (ErrorCode, String)> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| (ErrorCode::InvalidJson, format!("invalid json: {e}")))?;

        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| (ErrorCode::UnknownAction, "missing 'action'".to_string()))?;

        if !matches!(action, "subscribe" | "unsubscribe" | "ping") {
            return Err((
                ErrorCode::UnknownAction,
                format!("unknown action '{action}'"),
            ));
        }

        serde_json::from_value(value)
            .map_err(|e| (ErrorCode::ValidationError, format!("bad payload: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownAction,
    InvalidJson,
    ValidationError,
    InvalidStarlisting,
    InternalError,
    SlowConsumer,
}

/// Names identifying a market on every data frame.
#[derive(Debug, Clone, Serialize)]
pub struct MarketDescriptor {
    pub starlisting_id: MarketId,
    pub exchange: String,
    pub coin: String,
    pub quote: String,
    pub market_type: String,
    pub interval: String,
}

impl MarketDescriptor {
    pub fn from_info(info: &MarketInfo) -> Self {
        Self {
            starlisting_id: info.id(),
            exchange: info.exchange.clone(),
            coin: info.coin.clone(),
            quote: info.quote.clone(),
            market_type: info.market_type.clone(),
            interval: info.interval.clone(),
        }
    }
}

/// Candle payload as it appears on the wire. Decimal fields serialize as
/// strings via rust_decimal's string representation.
#[derive(Debug, Clone, Serialize)]
pub struct CandleBody {
    pub time: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub num_trades: Option<u32>,
}

impl CandleBody {
    pub fn from_candle(c: &Candle) -> Self {
        Self {
            time: rfc3339(c.time),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            num_trades: c.num_trades,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FundingBody {
    pub time: String,
    pub funding_rate: Decimal,
    pub premium: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
    pub oracle_price: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub next_funding_time: Option<String>,
}

impl FundingBody {
    pub fn from_funding(f: &FundingRate) -> Self {
        Self {
            time: rfc3339(f.time),
            funding_rate: f.funding_rate,
            premium: f.premium,
            mark_price: f.mark_price,
            index_price: f.index_price,
            oracle_price: f.oracle_price,
            mid_price: f.mid_price,
            next_funding_time: f.next_funding_time.map(rfc3339),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenInterestBody {
    pub time: String,
    pub open_interest: Decimal,
    pub notional_value: Option<Decimal>,
    pub day_base_volume: Option<Decimal>,
    pub day_notional_volume: Option<Decimal>,
}

impl OpenInterestBody {
    pub fn from_oi(o: &OpenInterest) -> Self {
        Self {
            time: rfc3339(o.time),
            open_interest: o.open_interest,
            notional_value: o.notional_value,
            day_base_volume: o.day_base_volume,
            day_notional_volume: o.day_notional_volume,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Success {
        message: String,
        starlisting_ids: Vec<MarketId>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Ping {
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
    Historical {
        #[serde(flatten)]
        market: MarketDescriptor,
        count: usize,
        data: Vec<CandleBody>,
    },
    Candle {
        #[serde(flatten)]
        market: MarketDescriptor,
        data: CandleBody,
    },
    Funding {
        #[serde(flatten)]
        market: MarketDescriptor,
        data: FundingBody,
    },
    OpenInterest {
        #[serde(flatten)]
        market: MarketDescriptor,
        data: OpenInterestBody,
    },
    /// Live frames were dropped for this session since the last warning.
    LagWarning {
        dropped: u64,
    },
}

impl ServerFrame {
    pub fn success(message: impl Into<String>, starlisting_ids: Vec<MarketId>) -> Self {
        Self::Success {
            message: message.into(),
            starlisting_ids,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code,
        }
    }

    pub fn candle(info: &MarketInfo, c: &Candle) -> Self {
        Self::Candle {
            market: MarketDescriptor::from_info(info),
            data: CandleBody::from_candle(c),
        }
    }

    pub fn funding(info: &MarketInfo, f: &FundingRate) -> Self {
        Self::Funding {
            market: MarketDescriptor::from_info(info),
            data: FundingBody::from_funding(f),
        }
    }

    pub fn open_interest(info: &MarketInfo, o: &OpenInterest) -> Self {
        Self::OpenInterest {
            market: MarketDescriptor::from_info(info),
            data: OpenInterestBody::from_oi(o),
        }
    }

    /// Most-recent-first candles delivered before any live frame.
    pub fn historical(info: &MarketInfo, candles: &[Candle]) -> Self {
        Self::Historical {
            market: MarketDescriptor::from_info(info),
            count: candles.len(),
            data: candles.iter().map(CandleBody::from_candle).collect(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Market;
    use std::str::FromStr;

    fn info() -> MarketInfo {
        MarketInfo {
            market: Market {
                id: 1,
                exchange_id: 1,
                coin_id: 1,
                quote_id: 1,
                market_type_id: 1,
                interval_id: 1,
                active: true,
                display_name: "BTC-USD-perps-1m".into(),
            },
            exchange: "hyperliquid".into(),
            coin: "BTC".into(),
            quote: "USD".into(),
            market_type: "perps".into(),
            interval: "1m".into(),
            interval_secs: 60,
        }
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_rfc3339_formatting() {
        assert_eq!(rfc3339(1_763_418_540), "2025-11-17T22:29:00Z");
    }

    #[test]
    fn test_parse_subscribe() {
        let frame =
            ClientFrame::parse(r#"{"action":"subscribe","market_ids":[1,2],"history":3}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                market_ids: vec![1, 2],
                history: 3
            }
        );
    }

    #[test]
    fn test_parse_subscribe_history_defaults_to_zero() {
        let frame = ClientFrame::parse(r#"{"action":"subscribe","market_ids":[7]}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                market_ids: vec![7],
                history: 0
            }
        );
    }

    #[test]
    fn test_parse_error_codes() {
        assert_eq!(
            ClientFrame::parse("not json").unwrap_err().0,
            ErrorCode::InvalidJson
        );
        assert_eq!(
            ClientFrame::parse(r#"{"foo":1}"#).unwrap_err().0,
            ErrorCode::UnknownAction
        );
        assert_eq!(
            ClientFrame::parse(r#"{"action":"dance"}"#).unwrap_err().0,
            ErrorCode::UnknownAction
        );
        assert_eq!(
            ClientFrame::parse(r#"{"action":"subscribe","market_ids":"nope"}"#)
                .unwrap_err()
                .0,
            ErrorCode::ValidationError
        );
    }

    #[test]
    fn test_candle_frame_shape() {
        let c = Candle {
            market_id: 1,
            time: 1_763_418_540,
            open: dec("100"),
            high: dec("115"),
            low: dec("95"),
            close: dec("112"),
            volume: dec("14"),
            num_trades: Some(80),
        };
        let v: Value = serde_json::from_str(&ServerFrame::candle(&info(), &c).to_json()).unwrap();

        assert_eq!(v["type"], "candle");
        assert_eq!(v["starlisting_id"], 1);
        assert_eq!(v["exchange"], "hyperliquid");
        assert_eq!(v["coin"], "BTC");
        assert_eq!(v["interval"], "1m");
        assert_eq!(v["data"]["time"], "2025-11-17T22:29:00Z");
        // Prices travel as decimal strings.
        assert_eq!(v["data"]["open"], "100");
        assert_eq!(v["data"]["close"], "112");
        assert_eq!(v["data"]["num_trades"], 80);
    }

    #[test]
    fn test_funding_frame_nulls() {
        let f = FundingRate {
            market_id: 1,
            time: 1_763_418_540,
            funding_rate: dec("0.0000125"),
            premium: None,
            mark_price: None,
            index_price: None,
            oracle_price: None,
            mid_price: None,
            next_funding_time: None,
        };
        let v: Value = serde_json::from_str(&ServerFrame::funding(&info(), &f).to_json()).unwrap();
        assert_eq!(v["type"], "funding");
        assert_eq!(v["data"]["funding_rate"], "0.0000125");
        assert!(v["data"]["mark_price"].is_null());
    }

    #[test]
    fn test_historical_frame_count_matches() {
        let c = Candle {
            market_id: 1,
            time: 1_763_418_540,
            open: dec("1"),
            high: dec("1"),
            low: dec("1"),
            close: dec("1"),
            volume: dec("0"),
            num_trades: None,
        };
        let frame = ServerFrame::historical(&info(), &[c.clone(), c]);
        let v: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v["type"], "historical");
        assert_eq!(v["count"], 2);
        assert_eq!(v["data"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_error_frame_code_spelling() {
        let v: Value = serde_json::from_str(
            &ServerFrame::error(ErrorCode::InvalidStarlisting, "unknown market").to_json(),
        )
        .unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["code"], "invalid_starlisting");
    }
}
