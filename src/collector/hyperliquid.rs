//! Hyperliquid stream handlers.
//!
//! Two channels cover the whole ingest surface: `candle` for OHLCV bars and
//! `activeAssetCtx` for the combined funding/open-interest context. One
//! WebSocket connection multiplexes every market of the group, so the
//! supervisor spawns one worker per (exchange, channel kind).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::buffer::MinuteBuffer;
use crate::catalog::MarketInfo;
use crate::collector::state::CollectorStatus;
use crate::collector::worker::{Inbound, StreamHandler};
use crate::error::KirbyError;
use crate::models::{Candle, MarketId};
use crate::normalize::{self, Source};
use crate::storage::WriterHandles;

pub const HYPERLIQUID_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

fn malformed(msg: impl Into<String>) -> KirbyError {
    KirbyError::MalformedPayload(msg.into())
}

fn parse_frame(text: &str) -> Result<Value, KirbyError> {
    serde_json::from_str(text).map_err(|e| malformed(format!("invalid stream json: {e}")))
}

fn channel_of(v: &Value) -> Option<&str> {
    v.get("channel").and_then(Value::as_str)
}

// =============================================================================
// CANDLE CHANNEL
// =============================================================================

/// Handler for the `candle` channel. Routes each bar to its market by
/// `(coin, interval)`, normalizes, validates, and pushes into the upsert
/// queue (awaiting the queue is the back-pressure path).
pub struct CandleChannel {
    endpoint: String,
    routes: HashMap<(String, String), Arc<MarketInfo>>,
    sink: mpsc::Sender<Candle>,
    status: Arc<CollectorStatus>,
    last_times: HashMap<MarketId, i64>,
}

impl CandleChannel {
    pub fn new(
        endpoint: impl Into<String>,
        markets: Vec<Arc<MarketInfo>>,
        sink: mpsc::Sender<Candle>,
        status: Arc<CollectorStatus>,
    ) -> Self {
        let routes = markets
            .into_iter()
            .map(|m| ((m.coin.clone(), m.interval.clone()), m))
            .collect();
        Self {
            endpoint: endpoint.into(),
            routes,
            sink,
            status,
            last_times: HashMap::new(),
        }
    }

    async fn on_candle(&mut self, data: &Value) -> Result<(), KirbyError> {
        let coin = data
            .get("s")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("candle missing 's'"))?;
        let interval = data
            .get("i")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("candle missing 'i'"))?;

        let market = self
            .routes
            .get(&(coin.to_string(), interval.to_string()))
            .cloned()
            .ok_or_else(|| malformed(format!("no market for {coin}/{interval}")))?;

        let candle = normalize::normalize_candle(Source::HlWs, &market, data)?;
        candle.validate(market.interval_secs)?;

        // Same-or-later open times are the normal live flow; an earlier time
        // is a correction. Accept it, but leave a trace.
        match self.last_times.get(&candle.market_id) {
            Some(&last) if candle.time < last => {
                self.status.metrics.record_correction();
                info!(
                    collector = self.status.label(),
                    market_id = candle.market_id,
                    time = candle.time,
                    last,
                    "late candle correction"
                );
            }
            _ => {
                self.last_times.insert(candle.market_id, candle.time);
            }
        }

        self.sink
            .send(candle)
            .await
            .map_err(|_| KirbyError::StorageUnavailable("candle queue closed".into()))
    }
}

#[async_trait]
impl StreamHandler for CandleChannel {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn subscribe_frames(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.routes.keys().cloned().collect();
        keys.sort();
        keys.into_iter()
            .map(|(coin, interval)| {
                json!({
                    "method": "subscribe",
                    "subscription": {"type": "candle", "coin": coin, "interval": interval}
                })
                .to_string()
            })
            .collect()
    }

    fn ping_frame(&self) -> Option<String> {
        Some(json!({"method": "ping"}).to_string())
    }

    async fn handle(&mut self, text: &str) -> Result<Inbound, KirbyError> {
        let v = parse_frame(text)?;
        match channel_of(&v) {
            Some("subscriptionResponse") => Ok(Inbound::SubscriptionAck),
            Some("pong") => Ok(Inbound::Pong),
            Some("error") => Err(KirbyError::Stream(format!(
                "venue error: {}",
                v.get("data").unwrap_or(&Value::Null)
            ))),
            Some("candle") => {
                let data = v.get("data").ok_or_else(|| malformed("candle missing 'data'"))?;
                self.on_candle(data).await?;
                Ok(Inbound::Data)
            }
            _ => Ok(Inbound::Ignore),
        }
    }
}

// =============================================================================
// ASSET CONTEXT CHANNEL (funding + open interest)
// =============================================================================

/// Handler for `activeAssetCtx`. The venue combines funding and open
/// interest into one payload; each half goes to its own minute buffer, and
/// buffer flushes feed the writer queues.
pub struct ContextChannel {
    endpoint: String,
    routes: HashMap<String, Arc<MarketInfo>>,
    writer: WriterHandles,
    funding_buf: MinuteBuffer<crate::models::FundingRate>,
    oi_buf: MinuteBuffer<crate::models::OpenInterest>,
}

impl ContextChannel {
    pub fn new(
        endpoint: impl Into<String>,
        markets: Vec<Arc<MarketInfo>>,
        writer: WriterHandles,
    ) -> Self {
        let routes = markets
            .into_iter()
            .map(|m| (m.coin.clone(), m))
            .collect();
        Self {
            endpoint: endpoint.into(),
            routes,
            writer,
            funding_buf: MinuteBuffer::new("funding"),
            oi_buf: MinuteBuffer::new("open_interest"),
        }
    }

    /// Route one context payload observed at `obs_time` into the buffers,
    /// forwarding whatever minute rows the observation closed.
    pub(crate) async fn apply(&mut self, data: &Value, obs_time: i64) -> Result<(), KirbyError> {
        let coin = data
            .get("coin")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("assetCtx missing 'coin'"))?;
        let market = self
            .routes
            .get(coin)
            .cloned()
            .ok_or_else(|| malformed(format!("no market for coin {coin}")))?;

        let (funding, oi) = normalize::normalize_asset_ctx(market.id(), obs_time, data)?;

        if let Some(row) = self.funding_buf.observe(market.id(), obs_time, funding) {
            self.writer
                .funding
                .send(row)
                .await
                .map_err(|_| KirbyError::StorageUnavailable("funding queue closed".into()))?;
        }
        if let Some(row) = self.oi_buf.observe(market.id(), obs_time, oi) {
            self.writer
                .open_interest
                .send(row)
                .await
                .map_err(|_| KirbyError::StorageUnavailable("oi queue closed".into()))?;
        }
        Ok(())
    }

    async fn flush_closed(&mut self, now: i64) -> Result<(), KirbyError> {
        for row in self.funding_buf.sweep(now) {
            self.writer
                .funding
                .send(row)
                .await
                .map_err(|_| KirbyError::StorageUnavailable("funding queue closed".into()))?;
        }
        for row in self.oi_buf.sweep(now) {
            self.writer
                .open_interest
                .send(row)
                .await
                .map_err(|_| KirbyError::StorageUnavailable("oi queue closed".into()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StreamHandler for ContextChannel {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn subscribe_frames(&self) -> Vec<String> {
        let mut coins: Vec<_> = self.routes.keys().cloned().collect();
        coins.sort();
        coins
            .into_iter()
            .map(|coin| {
                json!({
                    "method": "subscribe",
                    "subscription": {"type": "activeAssetCtx", "coin": coin}
                })
                .to_string()
            })
            .collect()
    }

    fn ping_frame(&self) -> Option<String> {
        Some(json!({"method": "ping"}).to_string())
    }

    async fn handle(&mut self, text: &str) -> Result<Inbound, KirbyError> {
        let v = parse_frame(text)?;
        match channel_of(&v) {
            Some("subscriptionResponse") => Ok(Inbound::SubscriptionAck),
            Some("pong") => Ok(Inbound::Pong),
            Some("error") => Err(KirbyError::Stream(format!(
                "venue error: {}",
                v.get("data").unwrap_or(&Value::Null)
            ))),
            Some("activeAssetCtx") => {
                let data = v
                    .get("data")
                    .ok_or_else(|| malformed("assetCtx missing 'data'"))?;
                self.apply(data, Utc::now().timestamp()).await?;
                Ok(Inbound::Data)
            }
            _ => Ok(Inbound::Ignore),
        }
    }

    async fn tick(&mut self) -> Result<(), KirbyError> {
        self.flush_closed(Utc::now().timestamp()).await
    }

    async fn drain(&mut self) -> Result<(), KirbyError> {
        let funding = self.funding_buf.drain();
        let oi = self.oi_buf.drain();
        if !funding.is_empty() || !oi.is_empty() {
            warn!(
                funding = funding.len(),
                open_interest = oi.len(),
                "draining open minute buffers on stop"
            );
        }
        for row in funding {
            let _ = self.writer.funding.send(row).await;
        }
        for row in oi {
            let _ = self.writer.open_interest.send(row).await;
        }
        Ok(())
    }
}
