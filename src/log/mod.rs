//! The append-only durable log the processor writes frames to.
//!
//! The processor only depends on the [`DurableLog`] trait; the two
//! implementations here cover tests and single-node deployments. Replicated
//! logs plug in behind the same trait.

mod file;
mod mem;

pub use file::FileLog;
pub use mem::InMemoryLog;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::error::Result;

/// Identifies one durable frame write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogAddress {
    /// Monotonically increasing write sequence assigned by the log.
    pub sequence: u64,
    /// Opaque physical location (byte offset for the file log).
    pub offset: u64,
}

/// Future returned by [`DurableLog::append`].
pub type AppendFuture = Pin<Box<dyn Future<Output = Result<LogAddress>> + Send>>;

/// An append-only medium with monotonic addresses.
///
/// `append` may complete on any task or thread; completions may arrive out of
/// order relative to the append calls. Implementations fail with
/// [`StoreError::NotPrimary`](crate::StoreError::NotPrimary) once another
/// writer has taken over, and with `Io` for transient faults.
pub trait DurableLog: Send + Sync + 'static {
    /// Durably appends `payload`, resolving to its assigned address.
    fn append(&self, payload: Bytes) -> AppendFuture;

    /// Flushes and rejects all further appends.
    fn close(&self) -> Result<()>;
}
