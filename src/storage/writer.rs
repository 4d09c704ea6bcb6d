//! Batching writer task in front of the store.
//!
//! Rows accumulate per entity type up to `batch_size` or `flush_interval`,
//! whichever comes first, then land in a single transaction. The inbound
//! queues are bounded: a full queue blocks the producing collector (that is
//! the back-pressure contract — rows are never dropped on this path).
//! Immediately after each commit the batch is published to the notification
//! bus in row order, so subscribers observe events in commit order.
//!
//! Lifecycle is channel-driven: the task drains and exits once every
//! producer handle is gone, which sequences the final flush after the
//! collectors' own shutdown drains. The supervisor bounds the whole thing
//! with its shutdown grace.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffTimer;
use crate::bus::{CommitEvent, NotificationBus};
use crate::config::StorageConfig;
use crate::error::KirbyError;
use crate::models::{Candle, FundingRate, OpenInterest};
use crate::storage::db::{is_transient, Db};

/// Producer-side handles. Cloned into each collector; `send().await` blocks
/// when the writer falls behind.
#[derive(Clone)]
pub struct WriterHandles {
    pub candles: mpsc::Sender<Candle>,
    pub funding: mpsc::Sender<FundingRate>,
    pub open_interest: mpsc::Sender<OpenInterest>,
}

pub struct StorageWriter;

impl StorageWriter {
    /// Spawn the writer task. It exits cleanly after draining once all
    /// `WriterHandles` clones are dropped, or with `StorageUnavailable`
    /// when retries are exhausted (the supervisor restarts the pipeline in
    /// that case).
    pub fn spawn(
        db: Arc<Db>,
        bus: Arc<NotificationBus>,
        cfg: StorageConfig,
    ) -> (WriterHandles, JoinHandle<Result<(), KirbyError>>) {
        let (candle_tx, candle_rx) = mpsc::channel(cfg.queue_depth);
        let (funding_tx, funding_rx) = mpsc::channel(cfg.queue_depth);
        let (oi_tx, oi_rx) = mpsc::channel(cfg.queue_depth);

        let handles = WriterHandles {
            candles: candle_tx,
            funding: funding_tx,
            open_interest: oi_tx,
        };

        let handle = tokio::spawn(run_writer(db, bus, cfg, candle_rx, funding_rx, oi_rx));

        (handles, handle)
    }
}

async fn run_writer(
    db: Arc<Db>,
    bus: Arc<NotificationBus>,
    cfg: StorageConfig,
    mut candle_rx: mpsc::Receiver<Candle>,
    mut funding_rx: mpsc::Receiver<FundingRate>,
    mut oi_rx: mpsc::Receiver<OpenInterest>,
) -> Result<(), KirbyError> {
    let mut candles: Vec<Candle> = Vec::with_capacity(cfg.batch_size);
    let mut funding: Vec<FundingRate> = Vec::with_capacity(cfg.batch_size);
    let mut oi: Vec<OpenInterest> = Vec::with_capacity(cfg.batch_size);

    let mut candles_open = true;
    let mut funding_open = true;
    let mut oi_open = true;

    let mut flush_tick = interval(cfg.flush_interval);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        batch_size = cfg.batch_size,
        flush_interval_ms = cfg.flush_interval.as_millis() as u64,
        "storage writer started"
    );

    loop {
        tokio::select! {
            c = candle_rx.recv(), if candles_open => match c {
                Some(c) => {
                    candles.push(c);
                    if candles.len() >= cfg.batch_size {
                        flush_candles(&db, &bus, &cfg, &mut candles).await?;
                    }
                }
                None => candles_open = false,
            },
            f = funding_rx.recv(), if funding_open => match f {
                Some(f) => {
                    funding.push(f);
                    if funding.len() >= cfg.batch_size {
                        flush_funding(&db, &bus, &cfg, &mut funding).await?;
                    }
                }
                None => funding_open = false,
            },
            o = oi_rx.recv(), if oi_open => match o {
                Some(o) => {
                    oi.push(o);
                    if oi.len() >= cfg.batch_size {
                        flush_oi(&db, &bus, &cfg, &mut oi).await?;
                    }
                }
                None => oi_open = false,
            },
            _ = flush_tick.tick() => {
                flush_all(&db, &bus, &cfg, &mut candles, &mut funding, &mut oi).await?;
            }
        }

        if !candles_open && !funding_open && !oi_open {
            flush_all(&db, &bus, &cfg, &mut candles, &mut funding, &mut oi).await?;
            info!("storage writer drained and stopped");
            return Ok(());
        }
    }
}

async fn flush_all(
    db: &Db,
    bus: &NotificationBus,
    cfg: &StorageConfig,
    candles: &mut Vec<Candle>,
    funding: &mut Vec<FundingRate>,
    oi: &mut Vec<OpenInterest>,
) -> Result<(), KirbyError> {
    flush_candles(db, bus, cfg, candles).await?;
    flush_funding(db, bus, cfg, funding).await?;
    flush_oi(db, bus, cfg, oi).await
}

async fn flush_candles(
    db: &Db,
    bus: &NotificationBus,
    cfg: &StorageConfig,
    batch: &mut Vec<Candle>,
) -> Result<(), KirbyError> {
    if batch.is_empty() {
        return Ok(());
    }
    commit_with_retry(cfg, "candles", batch.len(), || db.upsert_candles(batch)).await?;
    for row in batch.drain(..) {
        bus.publish(&CommitEvent::Candle(row));
    }
    Ok(())
}

async fn flush_funding(
    db: &Db,
    bus: &NotificationBus,
    cfg: &StorageConfig,
    batch: &mut Vec<FundingRate>,
) -> Result<(), KirbyError> {
    if batch.is_empty() {
        return Ok(());
    }
    commit_with_retry(cfg, "funding_rates", batch.len(), || db.upsert_funding(batch)).await?;
    for row in batch.drain(..) {
        bus.publish(&CommitEvent::Funding(row));
    }
    Ok(())
}

async fn flush_oi(
    db: &Db,
    bus: &NotificationBus,
    cfg: &StorageConfig,
    batch: &mut Vec<OpenInterest>,
) -> Result<(), KirbyError> {
    if batch.is_empty() {
        return Ok(());
    }
    commit_with_retry(cfg, "open_interest", batch.len(), || {
        db.upsert_open_interest(batch)
    })
    .await?;
    for row in batch.drain(..) {
        bus.publish(&CommitEvent::OpenInterest(row));
    }
    Ok(())
}

/// Run one upsert, retrying transient failures on the configured schedule.
/// Anything non-transient is surfaced immediately; the upsert contract makes
/// key-constraint violations impossible, so those are logic errors, not
/// retry candidates.
async fn commit_with_retry(
    cfg: &StorageConfig,
    table: &str,
    rows: usize,
    mut op: impl FnMut() -> rusqlite::Result<()>,
) -> Result<(), KirbyError> {
    let mut backoff = BackoffTimer::new(cfg.retry_base, cfg.retry_cap);

    loop {
        match op() {
            Ok(()) => {
                debug!(table, rows, "batch committed");
                return Ok(());
            }
            Err(e) if is_transient(&e) && backoff.attempt() < cfg.retry_attempts => {
                let delay = backoff.next_delay();
                warn!(
                    table,
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient storage error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(table, rows, error = %e, "storage write failed");
                return Err(KirbyError::StorageUnavailable(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, MarketCatalog};
    use crate::config::StorageConfig;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::time::Duration;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn candle(time: i64, close: &str, volume: &str) -> Candle {
        Candle {
            market_id: 1,
            time,
            open: dec("100"),
            high: dec("115"),
            low: dec("95"),
            close: dec(close),
            volume: dec(volume),
            num_trades: Some(50),
        }
    }

    fn setup() -> (Arc<Db>, Arc<NotificationBus>) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.with_writer(|conn| catalog::seed_default(conn)).unwrap();
        let cat = Arc::new(
            db.with_reader(|conn| Ok(MarketCatalog::load(conn)))
                .unwrap()
                .unwrap(),
        );
        let bus = Arc::new(NotificationBus::new(cat));
        (db, bus)
    }

    fn fast_cfg() -> StorageConfig {
        StorageConfig {
            flush_interval: Duration::from_millis(20),
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_live_update_persists_latest_and_notifies_in_order() {
        let (db, bus) = setup();
        let session = crate::bus::SessionHandle::new(16);
        bus.subscribe(&[1], &session);

        let (handles, task) = StorageWriter::spawn(db.clone(), bus.clone(), fast_cfg());

        let t = 1_763_418_540; // 2025-11-17T22:29:00Z
        handles.candles.send(candle(t, "105", "10")).await.unwrap();
        handles.candles.send(candle(t, "112", "14")).await.unwrap();

        drop(handles);
        task.await.unwrap().unwrap();

        // Exactly one stored row holding the second payload.
        let rows = db.latest_candles(1, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, dec("112"));
        assert_eq!(rows[0].volume, dec("14"));

        // The subscriber saw both frames, in commit order.
        let first = session.pop().unwrap();
        let second = session.pop().unwrap();
        assert!(first.text().contains("\"close\":\"105\""));
        assert!(second.text().contains("\"close\":\"112\""));
    }

    #[tokio::test]
    async fn test_batch_threshold_triggers_flush() {
        let (db, bus) = setup();
        let cfg = StorageConfig {
            batch_size: 5,
            // Long deadline so only the size threshold can flush.
            flush_interval: Duration::from_secs(60),
            ..StorageConfig::default()
        };

        let (handles, task) = StorageWriter::spawn(db.clone(), bus, cfg);

        for i in 0..5 {
            handles
                .candles
                .send(candle(60 * (i + 1), "100", "1"))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(db.latest_candles(1, 10).unwrap().len(), 5);

        drop(handles);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_drain_flushes_partial_batches_on_close() {
        let (db, bus) = setup();
        let cfg = StorageConfig {
            flush_interval: Duration::from_secs(60),
            ..StorageConfig::default()
        };

        let (handles, task) = StorageWriter::spawn(db.clone(), bus, cfg);

        handles.candles.send(candle(60, "100", "1")).await.unwrap();
        handles
            .funding
            .send(FundingRate {
                market_id: 1,
                time: 60,
                funding_rate: dec("0.00001"),
                premium: None,
                mark_price: None,
                index_price: None,
                oracle_price: None,
                mid_price: None,
                next_funding_time: None,
            })
            .await
            .unwrap();

        drop(handles);
        task.await.unwrap().unwrap();

        assert_eq!(db.latest_candles(1, 10).unwrap().len(), 1);
        assert_eq!(db.latest_funding(1, 10).unwrap().len(), 1);
    }
}
