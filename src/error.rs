//! Unified error type for the River pipeline.
//!
//! Every task converts whatever it catches into one of these kinds and
//! routes it through a single `close(err)` path (spec.md §7).

use thiserror::Error;

/// The five error kinds named in spec.md §7, plus the I/O and
/// serialization failures the ambient stack (checkpoint file, event wire
/// format) can raise.
#[derive(Debug, Error)]
pub enum RiverError {
    /// Invalid or inconsistent static configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Replication client/network failure. Closes the engine.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A Sink rejected an event after its own retries. Closes the engine.
    #[error("sink error: {0}")]
    Sink(String),

    /// The position could not be persisted. Closes the engine — a stale
    /// checkpoint would violate the at-least-once contract.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A bulk-index rule produced an unusable document id. Fails the
    /// individual item only; never stops the engine.
    #[error("mapping error: {0}")]
    Mapping(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RiverError>;

impl RiverError {
    /// Whether this error should terminate the engine. Only `Mapping`
    /// errors are recoverable per-item (spec.md §7).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RiverError::Mapping(_))
    }
}
