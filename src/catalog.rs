//! Immutable in-memory market catalog.
//!
//! Catalog rows are written at boot by the external config loader and loaded
//! here exactly once. Failure to resolve a configured market afterwards is a
//! programming error, not a runtime condition to retry.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};
use tracing::info;

use crate::models::{Market, MarketId};

/// A market joined with the names the wire and the collectors need.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub market: Market,
    pub exchange: String,
    pub coin: String,
    pub quote: String,
    pub market_type: String,
    pub interval: String,
    pub interval_secs: i64,
}

impl MarketInfo {
    pub fn id(&self) -> MarketId {
        self.market.id
    }

    pub fn is_active(&self) -> bool {
        self.market.active
    }
}

type TupleKey = (i64, i64, i64, i64, i64);

/// Read-once cache over the catalog tables.
pub struct MarketCatalog {
    by_id: HashMap<MarketId, Arc<MarketInfo>>,
    by_tuple: HashMap<TupleKey, MarketId>,
}

impl MarketCatalog {
    /// Load every market with its joined names. Call once at supervisor
    /// start; the result is immutable for the process lifetime.
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut stmt = conn
            .prepare(
                "SELECT m.id, m.exchange_id, m.coin_id, m.quote_id, m.market_type_id,
                        m.interval_id, m.active, m.display_name,
                        e.name, c.symbol, q.symbol, t.name, i.name, i.seconds
                 FROM markets m
                 JOIN exchanges e ON e.id = m.exchange_id
                 JOIN coins c ON c.id = m.coin_id
                 JOIN quotes q ON q.id = m.quote_id
                 JOIN market_types t ON t.id = m.market_type_id
                 JOIN intervals i ON i.id = m.interval_id
                 ORDER BY m.id",
            )
            .context("preparing catalog query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(MarketInfo {
                    market: Market {
                        id: row.get(0)?,
                        exchange_id: row.get(1)?,
                        coin_id: row.get(2)?,
                        quote_id: row.get(3)?,
                        market_type_id: row.get(4)?,
                        interval_id: row.get(5)?,
                        active: row.get::<_, i64>(6)? != 0,
                        display_name: row.get(7)?,
                    },
                    exchange: row.get(8)?,
                    coin: row.get(9)?,
                    quote: row.get(10)?,
                    market_type: row.get(11)?,
                    interval: row.get(12)?,
                    interval_secs: row.get(13)?,
                })
            })
            .context("reading catalog rows")?;

        let mut by_id = HashMap::new();
        let mut by_tuple = HashMap::new();
        for info in rows {
            let info = info?;
            let m = &info.market;
            let key = (
                m.exchange_id,
                m.coin_id,
                m.quote_id,
                m.market_type_id,
                m.interval_id,
            );
            if by_tuple.insert(key, m.id).is_some() {
                bail!("duplicate market tuple for id {}", m.id);
            }
            by_id.insert(m.id, Arc::new(info));
        }

        info!(
            markets = by_id.len(),
            active = by_id.values().filter(|m| m.is_active()).count(),
            "market catalog loaded"
        );

        Ok(Self { by_id, by_tuple })
    }

    pub fn lookup(&self, id: MarketId) -> Option<&Arc<MarketInfo>> {
        self.by_id.get(&id)
    }

    pub fn lookup_tuple(
        &self,
        exchange_id: i64,
        coin_id: i64,
        quote_id: i64,
        market_type_id: i64,
        interval_id: i64,
    ) -> Option<&Arc<MarketInfo>> {
        let id = self
            .by_tuple
            .get(&(exchange_id, coin_id, quote_id, market_type_id, interval_id))?;
        self.by_id.get(id)
    }

    /// Markets the supervisor schedules, ordered by id.
    pub fn active_markets(&self) -> Vec<Arc<MarketInfo>> {
        let mut out: Vec<_> = self
            .by_id
            .values()
            .filter(|m| m.is_active())
            .cloned()
            .collect();
        out.sort_by_key(|m| m.id());
        out
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Dev bootstrap: populate the catalog with the default Hyperliquid perp set
/// when the external loader has not run. Idempotent.
pub fn seed_default(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO exchanges (id, name) VALUES (1, 'hyperliquid')",
        [],
    )?;
    for (id, symbol) in [(1, "BTC"), (2, "ETH"), (3, "SOL")] {
        conn.execute(
            "INSERT OR IGNORE INTO coins (id, symbol) VALUES (?1, ?2)",
            params![id, symbol],
        )?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO quotes (id, symbol) VALUES (1, 'USD')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO market_types (id, name) VALUES (1, 'perps')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO intervals (id, name, seconds) VALUES (1, '1m', 60)",
        [],
    )?;

    for (id, coin_id, name) in [
        (1, 1, "BTC-USD-perps-1m"),
        (2, 2, "ETH-USD-perps-1m"),
        (3, 3, "SOL-USD-perps-1m"),
    ] {
        conn.execute(
            "INSERT OR IGNORE INTO markets
                 (id, exchange_id, coin_id, quote_id, market_type_id, interval_id,
                  active, display_name)
             VALUES (?1, 1, ?2, 1, 1, 1, 1, ?3)",
            params![id, coin_id, name],
        )?;
    }

    Ok(())
}
