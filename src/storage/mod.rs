//! Persistence layer: deduplicating upserts into time-partitioned SQLite
//! tables plus the batching writer task that feeds them.

pub mod db;
pub mod writer;

pub use db::Db;
pub use writer::{StorageWriter, WriterHandles};
