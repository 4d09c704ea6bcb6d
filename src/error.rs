//! Error taxonomy for the ingest-and-broadcast core.
//!
//! Recovery happens at the smallest scope that has context: normalizer errors
//! inside the collector, stream errors inside the supervisor, storage errors
//! inside the persistence layer. Only `ShutdownRequested` propagates all the
//! way up, so every task unwinds through the same path.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KirbyError {
    /// Vendor data the normalizer refuses. Log and skip; never tears down the
    /// stream.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Transport or subscription failure. The collector moves to `Backoff`.
    #[error("stream error: {0}")]
    Stream(String),

    /// Persistence exhausted its retries. Fatal to the writing task; the
    /// supervisor observes and restarts with fresh backoff.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Bad client frame. Reported to the session; the session stays open
    /// unless the client keeps sending them.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Client referenced an unknown or inactive market id.
    #[error("invalid market id {0}")]
    InvalidMarket(i64),

    /// A non-droppable frame would have overflowed the session queue.
    #[error("slow consumer")]
    SlowConsumer,

    /// Cooperative cancellation. Not an error, but carried as one so tasks
    /// unwind uniformly.
    #[error("shutdown requested")]
    ShutdownRequested,
}

impl KirbyError {
    /// True for conditions a collector survives without leaving `Live`.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, KirbyError::MalformedPayload(_) | KirbyError::InvalidRequest(_))
    }
}

pub type Result<T> = std::result::Result<T, KirbyError>;
