//! Generic exchange-stream worker.
//!
//! Collectors differ only in payload type, so the connect/subscribe/read
//! machinery lives here once, parameterized by a `StreamHandler` that knows
//! how to build subscription frames and where normalized records go (the
//! upsert queue for candles, the minute buffer for funding/OI).
//!
//! Back-pressure discipline: `StreamHandler::handle` awaits the downstream
//! sink, so a stalled writer stalls the WebSocket read loop instead of
//! dropping rows.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::backoff::BackoffTimer;
use crate::collector::state::{CollectorState, CollectorStatus, TransitionReason};
use crate::config::CollectorConfig;
use crate::error::KirbyError;

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    SubscriptionAck,
    Data,
    Pong,
    Ignore,
}

/// Stream-specific half of a collector.
#[async_trait]
pub trait StreamHandler: Send {
    fn endpoint(&self) -> String;

    /// Subscription frames sent after connect. One ack is expected per frame.
    fn subscribe_frames(&self) -> Vec<String>;

    /// Application-level keepalive frame, if the venue wants one.
    fn ping_frame(&self) -> Option<String>;

    /// Consume one inbound text frame. Blocking on the sink here is the
    /// back-pressure path.
    async fn handle(&mut self, text: &str) -> Result<Inbound, KirbyError>;

    /// Once-per-second housekeeping (minute-buffer sweeps). Runs in `Live`
    /// and while waiting out `Backoff`, so idle streams still flush.
    async fn tick(&mut self) -> Result<(), KirbyError> {
        Ok(())
    }

    /// Flush anything still held before a clean stop.
    async fn drain(&mut self) -> Result<(), KirbyError> {
        Ok(())
    }
}

/// Fatal errors tear the worker down for the supervisor to observe;
/// everything else becomes a reconnect. Shutdown travels as an error too,
/// but unwinds into a clean stop before this classification matters.
fn is_fatal(err: &KirbyError) -> bool {
    matches!(
        err,
        KirbyError::StorageUnavailable(_) | KirbyError::ShutdownRequested
    )
}

pub struct StreamWorker<H: StreamHandler> {
    handler: H,
    status: Arc<CollectorStatus>,
    cfg: CollectorConfig,
    shutdown: watch::Receiver<bool>,
}

impl<H: StreamHandler> StreamWorker<H> {
    pub fn new(
        handler: H,
        status: Arc<CollectorStatus>,
        cfg: CollectorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            handler,
            status,
            cfg,
            shutdown,
        }
    }

    /// Drive the state machine until shutdown or a fatal error.
    pub async fn run(mut self) -> Result<(), KirbyError> {
        let mut backoff = BackoffTimer::new(self.cfg.backoff_base, self.cfg.backoff_cap);

        loop {
            if *self.shutdown.borrow() {
                return self.stop().await;
            }

            self.status
                .transition(CollectorState::Connecting, TransitionReason::Started);

            let reason = match self.connect_and_stream(&mut backoff).await {
                Ok(reason) => reason,
                Err(KirbyError::ShutdownRequested) => return self.stop().await,
                Err(e) if is_fatal(&e) => {
                    warn!(collector = self.status.label(), error = %e, "collector fatal error");
                    return Err(e);
                }
                Err(e) => {
                    debug!(collector = self.status.label(), error = %e, "stream attempt failed");
                    TransitionReason::NetworkError
                }
            };

            let delay = backoff.next_delay();
            self.status.set_backoff_delay(delay);
            self.status.transition(CollectorState::Backoff, reason);
            match self.wait_backoff(delay).await {
                Ok(()) => {}
                Err(KirbyError::ShutdownRequested) => return self.stop().await,
                Err(e) => return Err(e),
            }
        }
    }

    async fn stop(&mut self) -> Result<(), KirbyError> {
        self.handler.drain().await?;
        self.status
            .transition(CollectorState::Stopped, TransitionReason::ShutdownRequested);
        info!(
            collector = self.status.label(),
            metrics = %self.status.metrics.summary(),
            "collector stopped"
        );
        Ok(())
    }

    /// Sleep out a backoff delay while still ticking the handler so buffered
    /// minutes flush even while the transport is down.
    async fn wait_backoff(&mut self, delay: Duration) -> Result<(), KirbyError> {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(()),
                _ = self.shutdown.changed() => return Err(KirbyError::ShutdownRequested),
                _ = tick.tick() => self.handler.tick().await?,
            }
        }
    }

    /// One connection attempt through `Subscribing` and `Live`. Returns the
    /// reconnect reason when the stream ends, or `ShutdownRequested` when
    /// cancellation arrived mid-stream.
    async fn connect_and_stream(
        &mut self,
        backoff: &mut BackoffTimer,
    ) -> Result<TransitionReason, KirbyError> {
        let endpoint = self.handler.endpoint();

        let ws = match timeout(self.cfg.connect_timeout, connect_async(endpoint.as_str())).await {
            Err(_) => return Ok(TransitionReason::ConnectTimeout),
            Ok(Err(e)) => {
                debug!(collector = self.status.label(), error = %e, "connect failed");
                return Ok(TransitionReason::NetworkError);
            }
            Ok(Ok((ws, _response))) => ws,
        };

        let (mut write, mut read) = ws.split();

        // Subscribe phase: push all subscription frames, then wait for the
        // matching acks. Data frames arriving early are consumed as usual.
        self.status
            .transition(CollectorState::Subscribing, TransitionReason::ConnectOk);

        let frames = self.handler.subscribe_frames();
        let expected_acks = frames.len();
        for frame in frames {
            write
                .send(Message::Text(frame))
                .await
                .map_err(|e| KirbyError::Stream(format!("subscribe send: {e}")))?;
        }

        let mut acks = 0usize;
        let subscribe_deadline = Instant::now() + self.cfg.subscribe_timeout;
        while acks < expected_acks {
            let remaining = subscribe_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(TransitionReason::SubscribeTimeout);
            }
            match timeout(remaining, read.next()).await {
                Err(_) => return Ok(TransitionReason::SubscribeTimeout),
                Ok(None) => return Ok(TransitionReason::ServerClose),
                Ok(Some(Err(e))) => {
                    debug!(collector = self.status.label(), error = %e, "subscribe read failed");
                    return Ok(TransitionReason::NetworkError);
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    if self.consume(&text).await? == Inbound::SubscriptionAck {
                        acks += 1;
                    }
                }
                Ok(Some(Ok(Message::Ping(payload)))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Ok(Some(Ok(Message::Close(_)))) => {
                    return Ok(TransitionReason::ServerClose);
                }
                Ok(Some(Ok(_))) => {}
            }
        }

        self.status
            .transition(CollectorState::Live, TransitionReason::SubscribeOk);
        backoff.reset();

        // Live phase.
        let mut last_data = Instant::now();
        let mut housekeeping = interval(Duration::from_secs(1));
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ping = interval(self.cfg.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.reset();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Err(KirbyError::ShutdownRequested);
                }
                msg = read.next() => match msg {
                    None => return Ok(TransitionReason::ServerClose),
                    Some(Err(e)) => {
                        debug!(collector = self.status.label(), error = %e, "stream read failed");
                        return Ok(TransitionReason::NetworkError);
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_data = Instant::now();
                        self.consume(&text).await?;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Ok(TransitionReason::ServerClose);
                    }
                    Some(Ok(_)) => {}
                },
                _ = housekeeping.tick() => {
                    self.handler.tick().await?;
                    if last_data.elapsed() > self.cfg.idle_timeout {
                        return Ok(TransitionReason::IdleStream);
                    }
                }
                _ = ping.tick() => {
                    if let Some(frame) = self.handler.ping_frame() {
                        if write.send(Message::Text(frame)).await.is_err() {
                            return Ok(TransitionReason::NetworkError);
                        }
                    }
                }
            }
        }
    }

    /// Route one text frame through the handler, absorbing recoverable
    /// failures so a single bad payload never tears the stream down.
    async fn consume(&mut self, text: &str) -> Result<Inbound, KirbyError> {
        match self.handler.handle(text).await {
            Ok(kind) => {
                if kind == Inbound::Data {
                    self.status.metrics.record_payload();
                }
                Ok(kind)
            }
            Err(e) if e.is_recoverable() => {
                self.status.metrics.record_skip();
                warn!(collector = self.status.label(), error = %e, "payload skipped");
                Ok(Inbound::Ignore)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(is_fatal(&KirbyError::StorageUnavailable("x".into())));
        assert!(is_fatal(&KirbyError::ShutdownRequested));
        assert!(!is_fatal(&KirbyError::Stream("reset".into())));
        assert!(!is_fatal(&KirbyError::MalformedPayload("bad".into())));
    }
}
