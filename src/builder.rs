//! Serializes operations into data frames and pipelines frame writes against
//! the durable log.
//!
//! Writes are bounded by a semaphore sized to `max_concurrent_writes`. The
//! durable log may acknowledge out of order; a pending-map re-sequencer
//! delivers `frame_committed` callbacks in frame order regardless. The first
//! write failure latches: every later `append`/`flush` fails with
//! `BuilderClosed` and the processor constructs a fresh builder to resume.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::frame::{DataFrame, FrameArgs, MIN_FRAME_CAPACITY};
use crate::log::{DurableLog, LogAddress};
use crate::ops::Operation;

/// Receiver of the frame lifecycle callbacks.
///
/// `frame_sealed` runs synchronously on the appending task, before the write
/// is handed to the durable log. `frame_committed` and `frame_failed` run on
/// the log's completion context. Callbacks must not re-enter the builder.
pub trait FrameSink: Send + Sync + 'static {
    /// The frame is sealed and about to be written. No address yet.
    fn frame_sealed(&self, frame: &FrameArgs);

    /// The durable log acknowledged the frame; its address is populated.
    /// Delivered in strictly increasing frame order.
    fn frame_committed(&self, frame: FrameArgs);

    /// The write for `frame` failed; `None` when the failure was not tied to
    /// a specific frame.
    fn frame_failed(&self, err: &StoreError, frame: Option<&FrameArgs>);
}

struct Reorder {
    next_deliver: u64,
    completed: BTreeMap<u64, (FrameArgs, Result<LogAddress>)>,
}

struct WriteState {
    permits: Arc<Semaphore>,
    reorder: Mutex<Reorder>,
    inflight: AtomicUsize,
    drained: Notify,
    failure: Mutex<Option<StoreError>>,
}

/// See the [module docs](self).
pub struct FrameBuilder {
    log: Arc<dyn DurableLog>,
    sink: Arc<dyn FrameSink>,
    frame_capacity: usize,
    frame: DataFrame,
    next_frame_id: u64,
    writes: Arc<WriteState>,
}

impl FrameBuilder {
    /// New builder writing `frame_capacity`-byte frames to `log`, with at
    /// most `max_concurrent_writes` writes in flight.
    pub fn new(
        log: Arc<dyn DurableLog>,
        sink: Arc<dyn FrameSink>,
        frame_capacity: usize,
        max_concurrent_writes: usize,
    ) -> Self {
        let frame_capacity = frame_capacity.max(MIN_FRAME_CAPACITY);
        Self {
            log,
            sink,
            frame_capacity,
            frame: DataFrame::new(0, frame_capacity),
            next_frame_id: 0,
            writes: Arc::new(WriteState {
                permits: Arc::new(Semaphore::new(max_concurrent_writes.max(1))),
                reorder: Mutex::new(Reorder {
                    next_deliver: 0,
                    completed: BTreeMap::new(),
                }),
                inflight: AtomicUsize::new(0),
                drained: Notify::new(),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Serializes `op` into the current frame, sealing and dispatching frames
    /// as they fill. One operation may span several frames.
    ///
    /// Suspends when `max_concurrent_writes` frame writes are already in
    /// flight.
    pub async fn append(&mut self, op: &Operation) -> Result<()> {
        self.ensure_open()?;
        let record = op.encode()?;
        let sequence = op.sequence();
        let mut offset = 0usize;
        let mut first = true;
        while offset < record.len() {
            let wrote = self.frame.append_chunk(sequence, &record[offset..], first);
            if wrote == 0 {
                self.seal_and_dispatch().await?;
                continue;
            }
            offset += wrote;
            first = false;
            if offset < record.len() {
                // Filled mid-record; the rest continues in the next frame.
                self.seal_and_dispatch().await?;
            }
        }
        Ok(())
    }

    /// Seals and dispatches the in-progress frame, if it has any content.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.frame.is_empty() {
            self.seal_and_dispatch().await?;
        }
        Ok(())
    }

    /// Flushes, then awaits durable completion of every in-flight write.
    pub async fn close(mut self) -> Result<()> {
        let flushed = if self.failure_cause().is_none() && !self.frame.is_empty() {
            self.seal_and_dispatch().await
        } else {
            Ok(())
        };
        loop {
            let notified = self.writes.drained.notified();
            if self.writes.inflight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        flushed
    }

    /// The write failure that closed this builder, if any.
    pub fn failure_cause(&self) -> Option<StoreError> {
        self.writes.failure.lock().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.failure_cause() {
            Some(cause) => Err(StoreError::BuilderClosed {
                cause: Some(Arc::new(cause)),
            }),
            None => Ok(()),
        }
    }

    async fn seal_and_dispatch(&mut self) -> Result<()> {
        self.next_frame_id += 1;
        let full = std::mem::replace(
            &mut self.frame,
            DataFrame::new(self.next_frame_id, self.frame_capacity),
        );
        let (args, payload) = full.seal();
        debug!(
            frame_id = args.frame_id,
            length = args.length,
            last_started = args.last_started_sequence,
            last_fully_serialized = args.last_fully_serialized_sequence,
            "frame.seal"
        );
        self.sink.frame_sealed(&args);

        let permit = self
            .writes
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed("frame builder"))?;
        // A concurrent write may have failed while we waited for a slot.
        self.ensure_open()?;
        self.writes.inflight.fetch_add(1, Ordering::SeqCst);
        let write = self.log.append(payload);
        let writes = Arc::clone(&self.writes);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            let result = write.await;
            deliver(&writes, sink.as_ref(), args, result);
            drop(permit);
            if writes.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
                // notify_one stores a permit for a closer that has not yet
                // registered its wait.
                writes.drained.notify_one();
            }
        });
        Ok(())
    }
}

/// Inserts one completion and drains the in-order prefix to the sink.
fn deliver(
    writes: &WriteState,
    sink: &dyn FrameSink,
    args: FrameArgs,
    result: Result<LogAddress>,
) {
    let mut reorder = writes.reorder.lock();
    reorder.completed.insert(args.frame_id, (args, result));
    while let Some(entry) = {
        let next = reorder.next_deliver;
        reorder.completed.remove(&next)
    } {
        reorder.next_deliver += 1;
        let (mut args, result) = entry;
        match result {
            Ok(address) => {
                debug!(
                    frame_id = args.frame_id,
                    log_sequence = address.sequence,
                    "frame.write.commit"
                );
                args.address = Some(address);
                sink.frame_committed(args);
            }
            Err(err) => {
                warn!(frame_id = args.frame_id, error = %err, "frame.write.fail");
                writes.failure.lock().get_or_insert_with(|| err.clone());
                sink.frame_failed(&err, Some(&args));
            }
        }
    }
}
