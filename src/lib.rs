//! # Seglog - Segment Store Commit Engine
//!
//! Seglog is the durable-write commit engine of a log-structured segment
//! store: it admits segment operations, assigns them monotonically increasing
//! sequence numbers, packs them into fixed-capacity data frames appended to a
//! durable log, and commits metadata and in-memory state as frames are
//! acknowledged - completing the callers' futures in order.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use seglog::{
//!     ContainerMetadata, InMemoryLog, NoCheckpointPolicy, NullStateUpdater, Operation,
//!     OperationProcessor, ProcessorConfig,
//! };
//!
//! # async fn demo() -> seglog::Result<()> {
//! let processor = OperationProcessor::spawn(
//!     ProcessorConfig::default(),
//!     ContainerMetadata::new(),
//!     Arc::new(InMemoryLog::new()),
//!     Box::new(NullStateUpdater),
//!     Arc::new(NoCheckpointPolicy),
//! );
//!
//! processor.process(Operation::map(1, "events", 0, false)).await?;
//! let seq = processor
//!     .process(Operation::append(1, Bytes::from_static(b"payload")))
//!     .await?;
//! assert!(seq > 0);
//!
//! processor.stop();
//! processor.await_terminated().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - **Total order**: every committed operation carries a unique, strictly
//!   increasing sequence number; futures complete in that order.
//! - **Atomicity**: an operation's metadata effect and its durable frame
//!   entry take effect together or not at all.
//! - **Pipelined durability**: up to `max_concurrent_writes` frame writes are
//!   in flight; acknowledgments are re-sequenced so commits apply in order.
//! - **Fail-fast on fatal errors**: data corruption or loss of log ownership
//!   stops the processor and fails everything in flight.
//!
//! ## Architecture
//!
//! - **Intake queue**: bounded, closable producer queue ([`queue`]).
//! - **Metadata updater**: layered update transactions over the segment
//!   catalog ([`metadata`]).
//! - **Frame builder**: serialization and pipelined log writes ([`builder`]).
//! - **Commit tracker**: correlates acknowledgments with transactions and
//!   completes futures ([`processor`]).
//! - **Durable log**: the append-only medium behind it all ([`log`]).

pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod frame;
pub mod log;
pub mod logging;
pub mod metadata;
mod metrics;
pub mod ops;
pub mod processor;
pub mod queue;
pub mod state;
mod tracker;

// Re-export the main public API
pub use crate::builder::{FrameBuilder, FrameSink};
pub use crate::checkpoint::{ByteThresholdPolicy, CheckpointPolicy, NoCheckpointPolicy};
pub use crate::config::ProcessorConfig;
pub use crate::error::{Result, StoreError};
pub use crate::frame::{read_chunks, FrameArgs, FrameChunk};
pub use crate::log::{DurableLog, FileLog, InMemoryLog, LogAddress};
pub use crate::metadata::{ContainerMetadata, MetadataUpdater, SegmentMetadata, TxnId};
pub use crate::metrics::ProcessorMetrics;
pub use crate::ops::{
    AttributeUpdate, AttributeUpdateKind, AttributeUpdates, Operation, OperationBody, NO_SEQUENCE,
};
pub use crate::processor::{CommitFuture, OperationProcessor, ProcessorStatus};
pub use crate::state::{MemoryStateUpdater, NullStateUpdater, ReadCache, ReadCacheUpdater};
