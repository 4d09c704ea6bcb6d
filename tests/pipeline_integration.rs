//! End-to-end pipeline tests over a real on-disk database: rows flow
//! through the batching writer, land deduplicated in SQLite, and fan out to
//! subscriber queues in commit order.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tempfile::TempDir;

use kirby::buffer::MinuteBuffer;
use kirby::bus::{NotificationBus, SessionHandle};
use kirby::catalog::{self, MarketCatalog};
use kirby::config::StorageConfig;
use kirby::models::{Candle, FundingRate};
use kirby::storage::{Db, StorageWriter};

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn candle(time: i64, high: &str, close: &str, volume: &str, trades: u32) -> Candle {
    Candle {
        market_id: 1,
        time,
        open: dec("100"),
        high: dec(high),
        low: dec("95"),
        close: dec(close),
        volume: dec(volume),
        num_trades: Some(trades),
    }
}

fn funding(rate: &str) -> FundingRate {
    FundingRate {
        market_id: 1,
        time: 0,
        funding_rate: dec(rate),
        premium: None,
        mark_price: None,
        index_price: None,
        oracle_price: None,
        mid_price: None,
        next_funding_time: None,
    }
}

struct Pipeline {
    _dir: TempDir,
    db: Arc<Db>,
    bus: Arc<NotificationBus>,
}

fn open_pipeline() -> Pipeline {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Db::open(dir.path().join("kirby.db"), 2).unwrap());
    db.with_writer(|conn| catalog::seed_default(conn)).unwrap();
    let catalog = Arc::new(
        db.with_reader(|conn| Ok(MarketCatalog::load(conn)))
            .unwrap()
            .unwrap(),
    );
    let bus = Arc::new(NotificationBus::new(catalog));
    Pipeline { _dir: dir, db, bus }
}

fn fast_storage() -> StorageConfig {
    StorageConfig {
        flush_interval: Duration::from_millis(20),
        ..StorageConfig::default()
    }
}

// 2025-11-17T22:29:00Z
const T2229: i64 = 1_763_418_540;
// 2025-11-17T22:00:00Z
const T2200: i64 = 1_763_416_800;

#[tokio::test]
async fn test_candle_live_update_end_to_end() {
    let p = open_pipeline();
    let session = SessionHandle::new(16);
    p.bus.subscribe(&[1], &session);

    let (handles, task) = StorageWriter::spawn(p.db.clone(), p.bus.clone(), fast_storage());

    // Same open minute twice: the live bar, then its update.
    handles
        .candles
        .send(candle(T2229, "110", "105", "10", 50))
        .await
        .unwrap();
    handles
        .candles
        .send(candle(T2229, "115", "112", "14", 80))
        .await
        .unwrap();

    drop(handles);
    task.await.unwrap().unwrap();

    // Exactly one stored row carrying the second payload.
    let rows = p.db.latest_candles(1, 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].close, dec("112"));
    assert_eq!(rows[0].volume, dec("14"));
    assert_eq!(rows[0].num_trades, Some(80));

    // The subscriber saw both frames, in commit order.
    let first = session.pop().unwrap();
    let second = session.pop().unwrap();
    assert!(first.text().contains("\"close\":\"105\""));
    assert!(second.text().contains("\"close\":\"112\""));
    assert!(session.pop().is_none());
}

#[tokio::test]
async fn test_funding_minute_coalescing_end_to_end() {
    let p = open_pipeline();
    let (handles, task) = StorageWriter::spawn(p.db.clone(), p.bus.clone(), fast_storage());

    // Bursty updates within 22:00, one more at 22:01, then the sweep.
    let mut buf = MinuteBuffer::new("funding");
    let mut forward = Vec::new();
    forward.extend(buf.observe(1, T2200 + 5, funding("0.00001")));
    forward.extend(buf.observe(1, T2200 + 20, funding("0.00002")));
    forward.extend(buf.observe(1, T2200 + 55, funding("0.00003")));
    forward.extend(buf.observe(1, T2200 + 63, funding("0.00004")));
    forward.extend(buf.sweep(T2200 + 121));

    for row in forward {
        handles.funding.send(row).await.unwrap();
    }

    drop(handles);
    task.await.unwrap().unwrap();

    let rows = p.db.funding_in_range(1, 0, i64::MAX, 100).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].time, T2200);
    assert_eq!(rows[0].funding_rate, dec("0.00003"));
    assert_eq!(rows[1].time, T2200 + 60);
    assert_eq!(rows[1].funding_rate, dec("0.00004"));
}

#[tokio::test]
async fn test_persisted_times_stay_minute_aligned() {
    let p = open_pipeline();
    let (handles, task) = StorageWriter::spawn(p.db.clone(), p.bus.clone(), fast_storage());

    for i in 0..5 {
        handles
            .candles
            .send(candle(T2200 + i * 60, "110", "101", "1", 1))
            .await
            .unwrap();
    }
    drop(handles);
    task.await.unwrap().unwrap();

    let rows = p.db.candles_in_range(1, 0, i64::MAX, 100).unwrap();
    assert_eq!(rows.len(), 5);
    for row in rows {
        assert_eq!(row.time % 60, 0);
    }
}

#[tokio::test]
async fn test_restart_resumes_cleanly_without_duplicates() {
    let p = open_pipeline();

    // First writer incarnation.
    let (handles, task) = StorageWriter::spawn(p.db.clone(), p.bus.clone(), fast_storage());
    handles
        .candles
        .send(candle(T2229, "110", "105", "10", 50))
        .await
        .unwrap();
    drop(handles);
    task.await.unwrap().unwrap();

    // Second incarnation replays the same bar (exchange replay on
    // reconnect) plus the next one.
    let (handles, task) = StorageWriter::spawn(p.db.clone(), p.bus.clone(), fast_storage());
    handles
        .candles
        .send(candle(T2229, "110", "105", "10", 50))
        .await
        .unwrap();
    handles
        .candles
        .send(candle(T2229 + 60, "111", "106", "2", 7))
        .await
        .unwrap();
    drop(handles);
    task.await.unwrap().unwrap();

    let rows = p.db.candles_in_range(1, 0, i64::MAX, 100).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].time, T2229);
    assert_eq!(rows[1].time, T2229 + 60);
}
