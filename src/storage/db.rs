//! SQLite store for candles, funding rates and open interest.
//!
//! Key choices:
//! - WAL mode so readers never block the single writer
//! - One writer connection behind a mutex, a small round-robin read pool
//! - Upsert by natural key `(market_id, time)`; corrections overwrite
//! - Decimals stored as TEXT so precision survives the round trip

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use tracing::debug;

use crate::models::{Candle, FundingRate, Market, MarketId, OpenInterest};

/// Schema with the write-heavy pragmas applied per connection.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS exchanges (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS coins (
    id INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS quotes (
    id INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS market_types (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS intervals (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    seconds INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS markets (
    id INTEGER PRIMARY KEY,
    exchange_id INTEGER NOT NULL REFERENCES exchanges(id),
    coin_id INTEGER NOT NULL REFERENCES coins(id),
    quote_id INTEGER NOT NULL REFERENCES quotes(id),
    market_type_id INTEGER NOT NULL REFERENCES market_types(id),
    interval_id INTEGER NOT NULL REFERENCES intervals(id),
    active INTEGER NOT NULL DEFAULT 1,
    display_name TEXT NOT NULL,
    UNIQUE(exchange_id, coin_id, quote_id, market_type_id, interval_id)
);

CREATE TABLE IF NOT EXISTS candles (
    market_id INTEGER NOT NULL REFERENCES markets(id),
    time INTEGER NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume TEXT NOT NULL,
    num_trades INTEGER,
    PRIMARY KEY (market_id, time)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS funding_rates (
    market_id INTEGER NOT NULL REFERENCES markets(id),
    time INTEGER NOT NULL,
    funding_rate TEXT NOT NULL,
    premium TEXT,
    mark_price TEXT,
    index_price TEXT,
    oracle_price TEXT,
    mid_price TEXT,
    next_funding_time INTEGER,
    PRIMARY KEY (market_id, time)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS open_interest (
    market_id INTEGER NOT NULL REFERENCES markets(id),
    time INTEGER NOT NULL,
    open_interest TEXT NOT NULL,
    notional_value TEXT,
    day_base_volume TEXT,
    day_notional_volume TEXT,
    PRIMARY KEY (market_id, time)
) WITHOUT ROWID;
"#;

fn dec_to_sql(d: &Decimal) -> String {
    d.to_string()
}

fn opt_dec_to_sql(d: &Option<Decimal>) -> Option<String> {
    d.as_ref().map(Decimal::to_string)
}

fn dec_from_sql(idx: usize, s: String) -> rusqlite::Result<Decimal> {
    Decimal::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_dec_from_sql(idx: usize, s: Option<String>) -> rusqlite::Result<Option<Decimal>> {
    s.map(|s| dec_from_sql(idx, s)).transpose()
}

/// True for storage errors worth retrying (lock contention, busy database).
pub fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Connection handle pair: one writer, `pool_size` readers.
pub struct Db {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl Db {
    /// Open (creating if needed) and apply schema + pragmas.
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let writer = Connection::open(path)?;
        writer.execute_batch(SCHEMA_SQL)?;

        let mut readers = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = Connection::open(path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            readers.push(Mutex::new(conn));
        }

        debug!(path = %path.display(), pool_size, "database opened");

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    /// In-memory database for tests. No read pool; everything shares the
    /// writer connection.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let writer = Connection::open_in_memory()?;
        writer.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            writer: Mutex::new(writer),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
        })
    }

    pub fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let mut conn = self.writer.lock();
        f(&mut conn)
    }

    pub fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        if self.readers.is_empty() {
            let conn = self.writer.lock();
            return f(&conn);
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx].lock();
        f(&conn)
    }

    // -- upserts ------------------------------------------------------------

    /// Insert-or-overwrite a batch of candles in one transaction.
    pub fn upsert_candles(&self, rows: &[Candle]) -> rusqlite::Result<()> {
        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO candles
                         (market_id, time, open, high, low, close, volume, num_trades)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(market_id, time) DO UPDATE SET
                         open = excluded.open,
                         high = excluded.high,
                         low = excluded.low,
                         close = excluded.close,
                         volume = excluded.volume,
                         num_trades = excluded.num_trades",
                )?;
                for c in rows {
                    stmt.execute(params![
                        c.market_id,
                        c.time,
                        dec_to_sql(&c.open),
                        dec_to_sql(&c.high),
                        dec_to_sql(&c.low),
                        dec_to_sql(&c.close),
                        dec_to_sql(&c.volume),
                        c.num_trades,
                    ])?;
                }
            }
            tx.commit()
        })
    }

    /// Insert-or-overwrite a batch of funding rows in one transaction.
    pub fn upsert_funding(&self, rows: &[FundingRate]) -> rusqlite::Result<()> {
        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO funding_rates
                         (market_id, time, funding_rate, premium, mark_price,
                          index_price, oracle_price, mid_price, next_funding_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(market_id, time) DO UPDATE SET
                         funding_rate = excluded.funding_rate,
                         premium = excluded.premium,
                         mark_price = excluded.mark_price,
                         index_price = excluded.index_price,
                         oracle_price = excluded.oracle_price,
                         mid_price = excluded.mid_price,
                         next_funding_time = excluded.next_funding_time",
                )?;
                for r in rows {
                    stmt.execute(params![
                        r.market_id,
                        r.time,
                        dec_to_sql(&r.funding_rate),
                        opt_dec_to_sql(&r.premium),
                        opt_dec_to_sql(&r.mark_price),
                        opt_dec_to_sql(&r.index_price),
                        opt_dec_to_sql(&r.oracle_price),
                        opt_dec_to_sql(&r.mid_price),
                        r.next_funding_time,
                    ])?;
                }
            }
            tx.commit()
        })
    }

    /// Insert-or-overwrite a batch of open-interest rows in one transaction.
    pub fn upsert_open_interest(&self, rows: &[OpenInterest]) -> rusqlite::Result<()> {
        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO open_interest
                         (market_id, time, open_interest, notional_value,
                          day_base_volume, day_notional_volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(market_id, time) DO UPDATE SET
                         open_interest = excluded.open_interest,
                         notional_value = excluded.notional_value,
                         day_base_volume = excluded.day_base_volume,
                         day_notional_volume = excluded.day_notional_volume",
                )?;
                for r in rows {
                    stmt.execute(params![
                        r.market_id,
                        r.time,
                        dec_to_sql(&r.open_interest),
                        opt_dec_to_sql(&r.notional_value),
                        opt_dec_to_sql(&r.day_base_volume),
                        opt_dec_to_sql(&r.day_notional_volume),
                    ])?;
                }
            }
            tx.commit()
        })
    }

    // -- queries ------------------------------------------------------------

    fn candle_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candle> {
        Ok(Candle {
            market_id: row.get(0)?,
            time: row.get(1)?,
            open: dec_from_sql(2, row.get(2)?)?,
            high: dec_from_sql(3, row.get(3)?)?,
            low: dec_from_sql(4, row.get(4)?)?,
            close: dec_from_sql(5, row.get(5)?)?,
            volume: dec_from_sql(6, row.get(6)?)?,
            num_trades: row.get(7)?,
        })
    }

    fn funding_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FundingRate> {
        Ok(FundingRate {
            market_id: row.get(0)?,
            time: row.get(1)?,
            funding_rate: dec_from_sql(2, row.get(2)?)?,
            premium: opt_dec_from_sql(3, row.get(3)?)?,
            mark_price: opt_dec_from_sql(4, row.get(4)?)?,
            index_price: opt_dec_from_sql(5, row.get(5)?)?,
            oracle_price: opt_dec_from_sql(6, row.get(6)?)?,
            mid_price: opt_dec_from_sql(7, row.get(7)?)?,
            next_funding_time: row.get(8)?,
        })
    }

    fn oi_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OpenInterest> {
        Ok(OpenInterest {
            market_id: row.get(0)?,
            time: row.get(1)?,
            open_interest: dec_from_sql(2, row.get(2)?)?,
            notional_value: opt_dec_from_sql(3, row.get(3)?)?,
            day_base_volume: opt_dec_from_sql(4, row.get(4)?)?,
            day_notional_volume: opt_dec_from_sql(5, row.get(5)?)?,
        })
    }

    /// Most recent candles, time-descending.
    pub fn latest_candles(&self, market_id: MarketId, limit: u32) -> rusqlite::Result<Vec<Candle>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT market_id, time, open, high, low, close, volume, num_trades
                 FROM candles WHERE market_id = ?1
                 ORDER BY time DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![market_id, limit], Self::candle_from_row)?;
            rows.collect()
        })
    }

    /// Candles in `[from, to)`, time-ascending.
    pub fn candles_in_range(
        &self,
        market_id: MarketId,
        from: i64,
        to: i64,
        limit: u32,
    ) -> rusqlite::Result<Vec<Candle>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT market_id, time, open, high, low, close, volume, num_trades
                 FROM candles WHERE market_id = ?1 AND time >= ?2 AND time < ?3
                 ORDER BY time ASC LIMIT ?4",
            )?;
            let rows = stmt.query_map(params![market_id, from, to, limit], Self::candle_from_row)?;
            rows.collect()
        })
    }

    /// Most recent funding rows, time-descending.
    pub fn latest_funding(
        &self,
        market_id: MarketId,
        limit: u32,
    ) -> rusqlite::Result<Vec<FundingRate>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT market_id, time, funding_rate, premium, mark_price,
                        index_price, oracle_price, mid_price, next_funding_time
                 FROM funding_rates WHERE market_id = ?1
                 ORDER BY time DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![market_id, limit], Self::funding_from_row)?;
            rows.collect()
        })
    }

    /// Funding rows in `[from, to)`, time-ascending.
    pub fn funding_in_range(
        &self,
        market_id: MarketId,
        from: i64,
        to: i64,
        limit: u32,
    ) -> rusqlite::Result<Vec<FundingRate>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT market_id, time, funding_rate, premium, mark_price,
                        index_price, oracle_price, mid_price, next_funding_time
                 FROM funding_rates WHERE market_id = ?1 AND time >= ?2 AND time < ?3
                 ORDER BY time ASC LIMIT ?4",
            )?;
            let rows =
                stmt.query_map(params![market_id, from, to, limit], Self::funding_from_row)?;
            rows.collect()
        })
    }

    /// Most recent open-interest rows, time-descending.
    pub fn latest_open_interest(
        &self,
        market_id: MarketId,
        limit: u32,
    ) -> rusqlite::Result<Vec<OpenInterest>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT market_id, time, open_interest, notional_value,
                        day_base_volume, day_notional_volume
                 FROM open_interest WHERE market_id = ?1
                 ORDER BY time DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![market_id, limit], Self::oi_from_row)?;
            rows.collect()
        })
    }

    /// Open-interest rows in `[from, to)`, time-ascending.
    pub fn open_interest_in_range(
        &self,
        market_id: MarketId,
        from: i64,
        to: i64,
        limit: u32,
    ) -> rusqlite::Result<Vec<OpenInterest>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT market_id, time, open_interest, notional_value,
                        day_base_volume, day_notional_volume
                 FROM open_interest WHERE market_id = ?1 AND time >= ?2 AND time < ?3
                 ORDER BY time ASC LIMIT ?4",
            )?;
            let rows = stmt.query_map(params![market_id, from, to, limit], Self::oi_from_row)?;
            rows.collect()
        })
    }

    /// Catalog market rows, optionally restricted to active ones.
    pub fn markets(&self, active_only: bool) -> rusqlite::Result<Vec<Market>> {
        self.with_reader(|conn| {
            let sql = if active_only {
                "SELECT id, exchange_id, coin_id, quote_id, market_type_id, interval_id,
                        active, display_name
                 FROM markets WHERE active = 1 ORDER BY id"
            } else {
                "SELECT id, exchange_id, coin_id, quote_id, market_type_id, interval_id,
                        active, display_name
                 FROM markets ORDER BY id"
            };
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map([], |row| {
                Ok(Market {
                    id: row.get(0)?,
                    exchange_id: row.get(1)?,
                    coin_id: row.get(2)?,
                    quote_id: row.get(3)?,
                    market_type_id: row.get(4)?,
                    interval_id: row.get(5)?,
                    active: row.get::<_, i64>(6)? != 0,
                    display_name: row.get(7)?,
                })
            })?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn test_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.with_writer(|conn| catalog::seed_default(conn)).unwrap();
        db
    }

    fn candle(market_id: i64, time: i64, close: &str, volume: &str) -> Candle {
        Candle {
            market_id,
            time,
            open: dec("100"),
            high: dec("115"),
            low: dec("95"),
            close: dec(close),
            volume: dec(volume),
            num_trades: Some(50),
        }
    }

    #[test]
    fn test_upsert_overwrites_by_natural_key() {
        let db = test_db();
        let t = 1_763_418_540; // 2025-11-17T22:29:00Z

        db.upsert_candles(&[candle(1, t, "105", "10")]).unwrap();
        db.upsert_candles(&[candle(1, t, "112", "14")]).unwrap();

        let rows = db.latest_candles(1, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, dec("112"));
        assert_eq!(rows[0].volume, dec("14"));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let db = test_db();
        let row = candle(1, 1_700_000_040, "105", "10");

        db.upsert_candles(&[row.clone()]).unwrap();
        db.upsert_candles(&[row.clone()]).unwrap();

        let rows = db.latest_candles(1, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], row);
    }

    #[test]
    fn test_latest_candles_descending() {
        let db = test_db();
        for (i, t) in [60, 120, 180].iter().enumerate() {
            db.upsert_candles(&[candle(1, *t, &format!("10{i}"), "1")])
                .unwrap();
        }

        let rows = db.latest_candles(1, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].time, 180);
        assert_eq!(rows[1].time, 120);
    }

    #[test]
    fn test_candles_in_range_ascending_half_open() {
        let db = test_db();
        for t in [60, 120, 180, 240] {
            db.upsert_candles(&[candle(1, t, "100", "1")]).unwrap();
        }

        let rows = db.candles_in_range(1, 120, 240, 100).unwrap();
        assert_eq!(rows.iter().map(|c| c.time).collect::<Vec<_>>(), vec![120, 180]);
    }

    #[test]
    fn test_decimal_precision_survives_round_trip() {
        let db = test_db();
        let mut c = candle(1, 60, "0.000000000000000001", "1");
        c.open = dec("123456789012.0000000000000001");
        c.high = c.open;
        c.low = dec("0.000000000000000001");
        db.upsert_candles(&[c.clone()]).unwrap();

        let rows = db.latest_candles(1, 1).unwrap();
        assert_eq!(rows[0].open, c.open);
        assert_eq!(rows[0].close, dec("0.000000000000000001"));
    }

    #[test]
    fn test_num_trades_null_round_trip() {
        let db = test_db();
        let mut c = candle(1, 60, "100", "1");
        c.num_trades = None;
        db.upsert_candles(&[c]).unwrap();
        assert_eq!(db.latest_candles(1, 1).unwrap()[0].num_trades, None);
    }

    #[test]
    fn test_funding_round_trip_with_nulls() {
        let db = test_db();
        let row = FundingRate {
            market_id: 1,
            time: 1_700_000_040,
            funding_rate: dec("0.0000125"),
            premium: Some(dec("0.00031774")),
            mark_price: None,
            index_price: None,
            oracle_price: None,
            mid_price: None,
            next_funding_time: None,
        };
        db.upsert_funding(&[row.clone()]).unwrap();

        let rows = db.latest_funding(1, 1).unwrap();
        assert_eq!(rows[0], row);
    }

    #[test]
    fn test_one_funding_row_per_minute() {
        let db = test_db();
        let mut row = FundingRate {
            market_id: 1,
            time: 1_700_000_040,
            funding_rate: dec("0.00001"),
            premium: None,
            mark_price: None,
            index_price: None,
            oracle_price: None,
            mid_price: None,
            next_funding_time: None,
        };
        db.upsert_funding(&[row.clone()]).unwrap();
        row.funding_rate = dec("0.00003");
        db.upsert_funding(&[row.clone()]).unwrap();

        let rows = db.funding_in_range(1, 0, i64::MAX, 100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].funding_rate, dec("0.00003"));
    }

    #[test]
    fn test_open_interest_round_trip() {
        let db = test_db();
        let row = OpenInterest {
            market_id: 1,
            time: 1_700_000_100,
            open_interest: dec("688.11"),
            notional_value: Some(dec("20561498.47")),
            day_base_volume: None,
            day_notional_volume: Some(dec("1169046.29406")),
        };
        db.upsert_open_interest(&[row.clone()]).unwrap();
        assert_eq!(db.latest_open_interest(1, 1).unwrap()[0], row);
    }

    #[test]
    fn test_markets_filter() {
        let db = test_db();
        let all = db.markets(false).unwrap();
        let active = db.markets(true).unwrap();
        assert!(!all.is_empty());
        assert!(active.iter().all(|m| m.active));
        assert!(active.len() <= all.len());
    }
}
