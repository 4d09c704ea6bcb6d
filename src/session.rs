//! Subscriber sessions over the live push wire.
//!
//! One task per client connection. The select loop services three things:
//! the outbound queue (filled by the bus and by our own acks), inbound
//! client frames, and the server heartbeat. All ordered traffic flows
//! through the queue; only heartbeat pings and final error frames are sent
//! directly, since they carry no ordering guarantee.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::{NotificationBus, SessionHandle};
use crate::catalog::MarketCatalog;
use crate::config::SessionConfig;
use crate::error::KirbyError;
use crate::storage::Db;
use crate::wire::{ClientFrame, ErrorCode, ServerFrame};

/// Everything a session task needs, assembled once at startup.
pub struct SessionContext {
    pub catalog: Arc<MarketCatalog>,
    pub db: Arc<Db>,
    pub bus: Arc<NotificationBus>,
    pub cfg: SessionConfig,
    pub registry: Arc<SessionRegistry>,
}

/// Caps concurrent sessions per process.
pub struct SessionRegistry {
    active: AtomicUsize,
    max: usize,
}

impl SessionRegistry {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max,
        })
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<SessionPermit> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.max {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(SessionPermit {
                        registry: self.clone(),
                    })
                }
                Err(now) => current = now,
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

pub struct SessionPermit {
    registry: Arc<SessionRegistry>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.registry.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Why a session ended; logged on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientGone,
    HeartbeatTimeout,
    SlowConsumer,
    RateKilled,
    SendFailed,
}

/// Sliding one-second window over invalid inbound frames.
struct InvalidFrameWindow {
    limit: u32,
    window_start: Instant,
    count: u32,
}

impl InvalidFrameWindow {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Record one invalid frame; true once the client crossed the limit.
    fn record(&mut self) -> bool {
        if self.window_start.elapsed().as_secs() >= 1 {
            self.window_start = Instant::now();
            self.count = 0;
        }
        self.count += 1;
        self.count > self.limit
    }
}

/// Entry point: one connection, one task.
pub async fn run_session(mut socket: WebSocket, ctx: Arc<SessionContext>) {
    let Some(_permit) = ctx.registry.try_acquire() else {
        let frame = ServerFrame::error(ErrorCode::InternalError, "session limit reached");
        let _ = socket.send(Message::Text(frame.to_json())).await;
        return;
    };

    let handle = SessionHandle::new(ctx.cfg.outbound_queue_size);
    info!(session = %handle.id, active = ctx.registry.active(), "session opened");

    let reason = session_loop(&mut socket, &ctx, &handle).await;

    ctx.bus.remove_session(handle.id);
    info!(
        session = %handle.id,
        reason = ?reason,
        dropped_frames = handle.dropped_total(),
        "session closed"
    );
}

async fn session_loop(
    socket: &mut WebSocket,
    ctx: &SessionContext,
    handle: &Arc<SessionHandle>,
) -> CloseReason {
    let mut state = SessionState::new(ctx.cfg.invalid_frame_rate_limit);
    let mut heartbeat = interval(ctx.cfg.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.reset();
    let mut last_traffic = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = handle.notified() => {
                if let Err(reason) = drain_outbound(socket, ctx, handle).await {
                    return reason;
                }
                if handle.is_killed() {
                    let frame = ServerFrame::error(ErrorCode::SlowConsumer, "outbound queue overflowed");
                    let _ = socket.send(Message::Text(frame.to_json())).await;
                    return CloseReason::SlowConsumer;
                }
            }

            msg = socket.recv() => match msg {
                None => return CloseReason::ClientGone,
                Some(Err(e)) => {
                    debug!(session = %handle.id, error = %e, "socket read failed");
                    return CloseReason::ClientGone;
                }
                Some(Ok(Message::Text(text))) => {
                    last_traffic = Instant::now();
                    if let Err(reason) = state.process_frame(&text, ctx, handle) {
                        let (code, msg) = match reason {
                            CloseReason::RateKilled => {
                                (ErrorCode::SlowConsumer, "too many invalid frames")
                            }
                            _ => (ErrorCode::SlowConsumer, "outbound queue overflowed"),
                        };
                        let _ = socket
                            .send(Message::Text(ServerFrame::error(code, msg).to_json()))
                            .await;
                        return reason;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    last_traffic = Instant::now();
                    let _ = socket.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    last_traffic = Instant::now();
                }
                Some(Ok(Message::Close(_))) => return CloseReason::ClientGone,
                Some(Ok(_)) => {}
            },

            _ = heartbeat.tick() => {
                if last_traffic.elapsed() > ctx.cfg.heartbeat * 2 {
                    return CloseReason::HeartbeatTimeout;
                }
                let ping = ServerFrame::Ping {
                    timestamp: crate::wire::rfc3339(Utc::now().timestamp()),
                };
                match timeout(ctx.cfg.send_timeout, socket.send(Message::Text(ping.to_json()))).await {
                    Ok(Ok(())) => {}
                    _ => return CloseReason::SendFailed,
                }
            }
        }
    }
}

/// Flush the outbound queue to the wire, then surface any pending lag
/// warning the drops accumulated.
async fn drain_outbound(
    socket: &mut WebSocket,
    ctx: &SessionContext,
    handle: &Arc<SessionHandle>,
) -> Result<(), CloseReason> {
    while let Some(delivery) = handle.pop() {
        let send = socket.send(Message::Text(delivery.text().to_string()));
        match timeout(ctx.cfg.send_timeout, send).await {
            Ok(Ok(())) => {}
            _ => return Err(CloseReason::SendFailed),
        }
    }

    if let Some(dropped) = handle.take_lag_warning(Utc::now().timestamp_millis()) {
        warn!(session = %handle.id, dropped, "subscriber lagging");
        let frame = ServerFrame::LagWarning { dropped };
        match timeout(ctx.cfg.send_timeout, socket.send(Message::Text(frame.to_json()))).await {
            Ok(Ok(())) => {}
            _ => return Err(CloseReason::SendFailed),
        }
    }

    Ok(())
}

/// Per-session inbound state: what we are subscribed to plus the invalid
/// frame accounting. Frame processing is synchronous; everything it emits
/// goes through the session queue to keep ordering with live traffic.
struct SessionState {
    subscriptions: HashSet<i64>,
    invalid: InvalidFrameWindow,
}

impl SessionState {
    fn new(invalid_limit: u32) -> Self {
        Self {
            subscriptions: HashSet::new(),
            invalid: InvalidFrameWindow::new(invalid_limit),
        }
    }

    fn process_frame(
        &mut self,
        text: &str,
        ctx: &SessionContext,
        handle: &Arc<SessionHandle>,
    ) -> Result<(), CloseReason> {
        if text.len() > ctx.cfg.max_frame_bytes {
            return self.reject(ctx, handle, ErrorCode::ValidationError, "frame too large");
        }

        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err((code, msg)) => return self.reject(ctx, handle, code, &msg),
        };

        match frame {
            ClientFrame::Ping => {
                let pong = ServerFrame::Pong {
                    timestamp: crate::wire::rfc3339(Utc::now().timestamp()),
                };
                push_critical(handle, &pong)
            }
            ClientFrame::Unsubscribe { market_ids } => {
                ctx.bus.unsubscribe(&market_ids, handle.id);
                for id in &market_ids {
                    self.subscriptions.remove(id);
                }
                push_critical(
                    handle,
                    &ServerFrame::success("unsubscribed", market_ids),
                )
            }
            ClientFrame::Subscribe {
                market_ids,
                history,
            } => self.subscribe(ctx, handle, market_ids, history),
        }
    }

    fn subscribe(
        &mut self,
        ctx: &SessionContext,
        handle: &Arc<SessionHandle>,
        market_ids: Vec<i64>,
        history: u32,
    ) -> Result<(), CloseReason> {
        if market_ids.is_empty() || market_ids.len() > ctx.cfg.max_subscriptions {
            let e = KirbyError::InvalidRequest(format!(
                "subscribe accepts 1..={} market ids",
                ctx.cfg.max_subscriptions
            ));
            return self.reject(ctx, handle, ErrorCode::ValidationError, &e.to_string());
        }
        let added = market_ids
            .iter()
            .filter(|id| !self.subscriptions.contains(id))
            .count();
        if self.subscriptions.len() + added > ctx.cfg.max_subscriptions {
            let e = KirbyError::InvalidRequest(format!(
                "session subscription limit is {}",
                ctx.cfg.max_subscriptions
            ));
            return self.reject(ctx, handle, ErrorCode::ValidationError, &e.to_string());
        }
        if history > ctx.cfg.max_history {
            let e = KirbyError::InvalidRequest(format!(
                "history must be 0..={}",
                ctx.cfg.max_history
            ));
            return self.reject(ctx, handle, ErrorCode::ValidationError, &e.to_string());
        }

        // Every id must name an existing, active market or the whole frame
        // is refused.
        let mut infos = Vec::with_capacity(market_ids.len());
        for &id in &market_ids {
            match ctx.catalog.lookup(id) {
                Some(info) if info.is_active() => infos.push(info.clone()),
                _ => {
                    let e = KirbyError::InvalidMarket(id);
                    return self.reject(ctx, handle, ErrorCode::InvalidStarlisting, &e.to_string());
                }
            }
        }

        // Snapshot history before registering for live frames so the
        // historical batch always lands first.
        let mut historical = Vec::new();
        if history > 0 {
            for info in &infos {
                match ctx.db.latest_candles(info.id(), history) {
                    Ok(candles) => historical.push(ServerFrame::historical(info, &candles)),
                    Err(e) => {
                        warn!(session = %handle.id, market_id = info.id(), error = %e, "history read failed");
                        return self.reject(
                            ctx,
                            handle,
                            ErrorCode::InternalError,
                            "history unavailable",
                        );
                    }
                }
            }
        }

        push_critical(handle, &ServerFrame::success("subscribed", market_ids.clone()))?;
        for frame in &historical {
            push_critical(handle, frame)?;
        }

        ctx.bus.subscribe(&market_ids, handle);
        self.subscriptions.extend(market_ids);
        Ok(())
    }

    /// Report a bad frame and keep the session open, unless the client is
    /// spraying them faster than the rate limit.
    fn reject(
        &mut self,
        _ctx: &SessionContext,
        handle: &Arc<SessionHandle>,
        code: ErrorCode,
        msg: &str,
    ) -> Result<(), CloseReason> {
        if self.invalid.record() {
            return Err(CloseReason::RateKilled);
        }
        push_critical(handle, &ServerFrame::error(code, msg))
    }
}

fn push_critical(handle: &Arc<SessionHandle>, frame: &ServerFrame) -> Result<(), CloseReason> {
    match handle.push_critical(Arc::from(frame.to_json())) {
        Ok(()) => Ok(()),
        Err(_) => Err(CloseReason::SlowConsumer),
    }
}
