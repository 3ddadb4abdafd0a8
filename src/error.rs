use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by the operation processor and its collaborators.
///
/// The enum is `Clone` because a single frame-write failure fans out to every
/// operation future that was pending behind that frame.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Logical rejection of a single operation (e.g. append to a sealed
    /// segment). The processor keeps running.
    #[error("bad operation: {0}")]
    BadOperation(String),
    /// The frame builder latched an earlier write failure; a fresh builder is
    /// required before any further appends.
    #[error("frame builder closed")]
    BuilderClosed {
        /// The write failure that closed the builder, when known.
        cause: Option<Arc<StoreError>>,
    },
    /// Transient durable-log failure. Pending operations fail, the processor
    /// rebuilds its frame builder and keeps running.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    /// Another writer owns the durable log. Fatal.
    #[error("log ownership lost: {0}")]
    NotPrimary(String),
    /// In-memory or on-disk invariants violated. Fatal; the processor stops
    /// to preserve evidence.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// The component was asked to do work after shutdown began.
    #[error("{0} is closed")]
    Closed(&'static str),
    /// The bounded intake queue rejected an enqueue.
    #[error("intake queue is full")]
    QueueFull,
    /// An operation could not be serialized into a frame record.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(Arc::new(err))
    }
}

impl StoreError {
    /// Whether this error must stop the processor.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Corruption(_) | StoreError::NotPrimary(_))
    }

    /// Unwraps a `BuilderClosed` down to the write failure that latched it.
    /// All other errors are their own cause.
    pub fn real_cause(&self) -> StoreError {
        match self {
            StoreError::BuilderClosed { cause: Some(inner) } => inner.as_ref().clone(),
            other => other.clone(),
        }
    }
}
