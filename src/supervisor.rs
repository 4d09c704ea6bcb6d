//! Supervisor: owns the writer task and the collector fleet.
//!
//! Markets are grouped by transport (one venue connection carries every
//! subscription of its group), one worker task per (exchange, channel kind).
//! Each market still has exactly one writing task, which is what keeps
//! upsert-by-natural-key safe without version columns.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::bus::NotificationBus;
use crate::catalog::{MarketCatalog, MarketInfo};
use crate::collector::hyperliquid::{CandleChannel, ContextChannel, HYPERLIQUID_WS_URL};
use crate::collector::state::{CollectorState, CollectorStatus, StatusSnapshot};
use crate::collector::worker::StreamWorker;
use crate::config::KirbyConfig;
use crate::error::KirbyError;
use crate::storage::{Db, StorageWriter, WriterHandles};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Candles,
    Context,
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Candles => write!(f, "candles"),
            Self::Context => write!(f, "context"),
        }
    }
}

/// One transport group: every market here shares a single connection.
#[derive(Clone)]
pub struct GroupSpec {
    pub label: String,
    pub exchange: String,
    pub kind: GroupKind,
    pub markets: Vec<Arc<MarketInfo>>,
}

/// Group active markets by (exchange, channel kind). The context group keeps
/// one market per coin - the one with the finest interval - because funding
/// and open interest are per-coin states, not per-interval.
pub fn build_groups(catalog: &MarketCatalog) -> Vec<GroupSpec> {
    use std::collections::BTreeMap;

    let mut by_exchange: BTreeMap<String, Vec<Arc<MarketInfo>>> = BTreeMap::new();
    for market in catalog.active_markets() {
        by_exchange
            .entry(market.exchange.clone())
            .or_default()
            .push(market);
    }

    let mut groups = Vec::new();
    for (exchange, markets) in by_exchange {
        groups.push(GroupSpec {
            label: format!("{exchange}:candles"),
            exchange: exchange.clone(),
            kind: GroupKind::Candles,
            markets: markets.clone(),
        });

        let mut per_coin: BTreeMap<String, Arc<MarketInfo>> = BTreeMap::new();
        for market in markets {
            per_coin
                .entry(market.coin.clone())
                .and_modify(|held| {
                    if market.interval_secs < held.interval_secs {
                        *held = market.clone();
                    }
                })
                .or_insert(market);
        }
        groups.push(GroupSpec {
            label: format!("{exchange}:context"),
            exchange,
            kind: GroupKind::Context,
            markets: per_coin.into_values().collect(),
        });
    }
    groups
}

fn endpoint_for(exchange: &str) -> Result<&'static str> {
    match exchange {
        "hyperliquid" => Ok(HYPERLIQUID_WS_URL),
        other => bail!("no transport configured for exchange '{other}'"),
    }
}

/// True when a worker needs to be cancelled and restarted: parked in
/// `Connecting`/`Subscribing` past its timeouts, or sitting in `Backoff`
/// far longer than the delay it announced.
pub fn is_stuck(snap: &StatusSnapshot, cfg: &KirbyConfig) -> bool {
    match snap.state {
        CollectorState::Connecting | CollectorState::Subscribing => {
            snap.in_state_for > cfg.collector.connect_timeout + cfg.collector.subscribe_timeout
        }
        CollectorState::Backoff => {
            let announced = snap.last_backoff.max(cfg.collector.backoff_base);
            snap.in_state_for > announced * 10
        }
        _ => false,
    }
}

struct CollectorEntry {
    spec: GroupSpec,
    status: Arc<CollectorStatus>,
    handle: JoinHandle<Result<(), KirbyError>>,
    restarts: u32,
}

pub struct Supervisor {
    db: Arc<Db>,
    bus: Arc<NotificationBus>,
    catalog: Arc<MarketCatalog>,
    cfg: Arc<KirbyConfig>,
    shutdown_tx: watch::Sender<bool>,
    writer: Option<(WriterHandles, JoinHandle<Result<(), KirbyError>>)>,
    collectors: Vec<CollectorEntry>,
}

impl Supervisor {
    pub fn new(
        db: Arc<Db>,
        bus: Arc<NotificationBus>,
        catalog: Arc<MarketCatalog>,
        cfg: Arc<KirbyConfig>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            db,
            bus,
            catalog,
            cfg,
            shutdown_tx,
            writer: None,
            collectors: Vec::new(),
        }
    }

    /// Start the writer and one worker per transport group, then babysit
    /// them until `stop` fires.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        self.start()?;

        let mut probe = interval(self.cfg.supervisor.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The immediate first tick would probe freshly-spawned workers.
        probe.reset();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = probe.tick() => self.probe().await,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let (handles, writer_handle) =
            StorageWriter::spawn(self.db.clone(), self.bus.clone(), self.cfg.storage.clone());
        self.writer = Some((handles, writer_handle));

        let groups = build_groups(&self.catalog);
        if groups.is_empty() {
            bail!("no active markets to collect");
        }

        for spec in groups {
            // Unknown exchanges are a configuration bug; fail the boot
            // instead of retrying forever.
            endpoint_for(&spec.exchange)?;
            let entry = self.spawn_group(spec)?;
            self.collectors.push(entry);
        }

        info!(collectors = self.collectors.len(), "supervisor started");
        Ok(())
    }

    fn spawn_group(&self, spec: GroupSpec) -> Result<CollectorEntry> {
        let endpoint = endpoint_for(&spec.exchange)?;
        let handles = self
            .writer
            .as_ref()
            .map(|(h, _)| h.clone())
            .expect("writer spawned before collectors");
        let status = Arc::new(CollectorStatus::new(spec.label.clone()));
        let shutdown_rx = self.shutdown_tx.subscribe();
        let cfg = self.cfg.collector.clone();

        let handle = match spec.kind {
            GroupKind::Candles => {
                let handler = CandleChannel::new(
                    endpoint,
                    spec.markets.clone(),
                    handles.candles.clone(),
                    status.clone(),
                );
                tokio::spawn(StreamWorker::new(handler, status.clone(), cfg, shutdown_rx).run())
            }
            GroupKind::Context => {
                let handler = ContextChannel::new(endpoint, spec.markets.clone(), handles);
                tokio::spawn(StreamWorker::new(handler, status.clone(), cfg, shutdown_rx).run())
            }
        };

        info!(
            collector = %spec.label,
            markets = spec.markets.len(),
            "collector spawned"
        );

        Ok(CollectorEntry {
            spec,
            status,
            handle,
            restarts: 0,
        })
    }

    /// One liveness pass over the writer and every collector.
    async fn probe(&mut self) {
        // Writer death invalidates every producer handle, so the whole
        // pipeline restarts together.
        let writer_dead = self
            .writer
            .as_ref()
            .map(|(_, h)| h.is_finished())
            .unwrap_or(true);
        if writer_dead {
            error!("storage writer died; restarting pipeline");
            self.restart_pipeline().await;
            return;
        }

        for i in 0..self.collectors.len() {
            let finished = self.collectors[i].handle.is_finished();
            let snap = self.collectors[i].status.snapshot();

            if finished {
                let entry = &mut self.collectors[i];
                match (&mut entry.handle).await {
                    Ok(Ok(())) => {
                        // Clean exit outside shutdown means the task was
                        // cancelled externally; bring it back.
                        warn!(collector = %entry.spec.label, "collector exited; restarting");
                    }
                    Ok(Err(e)) => {
                        warn!(collector = %entry.spec.label, error = %e, "collector failed; restarting");
                    }
                    Err(e) => {
                        warn!(collector = %entry.spec.label, error = %e, "collector panicked; restarting");
                    }
                }
                self.respawn(i);
            } else if is_stuck(&snap, &self.cfg) {
                warn!(
                    collector = %self.collectors[i].spec.label,
                    state = %snap.state,
                    in_state_ms = snap.in_state_for.as_millis() as u64,
                    "collector stuck; restarting"
                );
                self.collectors[i].handle.abort();
                self.respawn(i);
            }
        }
    }

    fn respawn(&mut self, i: usize) {
        let spec = self.collectors[i].spec.clone();
        let restarts = self.collectors[i].restarts + 1;
        match self.spawn_group(spec) {
            Ok(mut entry) => {
                entry.restarts = restarts;
                self.collectors[i] = entry;
            }
            Err(e) => error!(error = %e, "failed to respawn collector"),
        }
    }

    async fn restart_pipeline(&mut self) {
        for entry in self.collectors.drain(..) {
            entry.handle.abort();
        }
        if let Some((_, handle)) = self.writer.take() {
            handle.abort();
        }
        if let Err(e) = self.start() {
            error!(error = %e, "pipeline restart failed");
        }
    }

    /// Cooperative stop: signal everyone, then wait out the grace period.
    async fn shutdown(&mut self) {
        info!("supervisor stopping");
        let _ = self.shutdown_tx.send(true);

        let grace = self.cfg.supervisor.shutdown_grace;
        for entry in self.collectors.drain(..) {
            match timeout(grace, entry.handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    warn!(collector = %entry.spec.label, error = %e, "collector stop error")
                }
                Ok(Err(e)) => warn!(collector = %entry.spec.label, error = %e, "collector join error"),
                Err(_) => {
                    warn!(collector = %entry.spec.label, "collector missed shutdown grace; aborting")
                }
            }
        }

        if let Some((handles, handle)) = self.writer.take() {
            // Collectors have dropped their sender clones by now; dropping
            // ours closes the queues and lets the writer drain out.
            drop(handles);
            match timeout(grace, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(error = %e, "writer stop error"),
                Ok(Err(e)) => warn!(error = %e, "writer join error"),
                Err(_) => warn!("writer missed shutdown grace; aborting"),
            }
        }

        info!(bus = %self.bus.metrics.summary(), "supervisor stopped");
    }
}
