//! Correlates durable frame acknowledgments with staged metadata
//! transactions and completes operation futures in sequence order.
//!
//! One lock covers the metadata updater and the tracker's own queues: frame
//! sealing must atomically seal the updater transaction and record the
//! frame-to-transaction mapping, and the commit path walks both together.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::builder::FrameSink;
use crate::checkpoint::CheckpointPolicy;
use crate::error::{Result, StoreError};
use crate::frame::FrameArgs;
use crate::metadata::{ContainerMetadata, MetadataUpdater, TxnId};
use crate::metrics::MetricsInner;
use crate::ops::Operation;
use crate::state::MemoryStateUpdater;

/// An admitted operation paired with its single-shot result slot.
pub(crate) struct PendingOperation {
    op: Operation,
    done: Option<oneshot::Sender<Result<u64>>>,
}

impl PendingOperation {
    pub(crate) fn new(op: Operation) -> (Self, oneshot::Receiver<Result<u64>>) {
        let (tx, rx) = oneshot::channel();
        (Self { op, done: Some(tx) }, rx)
    }

    pub(crate) fn op(&self) -> &Operation {
        &self.op
    }

    pub(crate) fn op_mut(&mut self) -> &mut Operation {
        &mut self.op
    }

    /// Resolves the future with the operation's sequence number.
    pub(crate) fn complete(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Ok(self.op.sequence()));
        }
    }

    /// Resolves the future with `err`.
    pub(crate) fn fail(mut self, err: StoreError) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Err(err));
        }
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        // An operation must never linger unresolved.
        if let Some(done) = self.done.take() {
            let _ = done.send(Err(StoreError::Closed("operation processor")));
        }
    }
}

struct CoreState {
    updater: MetadataUpdater,
    pending: VecDeque<PendingOperation>,
    txn_by_frame: BTreeMap<u64, TxnId>,
    highest_committed_frame_sequence: i64,
    // Highest operation sequence number covered by a committed frame. A
    // frame acknowledgment can race ahead of the loop registering the
    // operation as pending; the watermark lets registration catch up.
    highest_fully_committed_sequence: u64,
    memory_state: Box<dyn MemoryStateUpdater>,
}

/// See the [module docs](self).
pub(crate) struct CommitTracker {
    state: Mutex<CoreState>,
    policy: Arc<dyn CheckpointPolicy>,
    metrics: Arc<MetricsInner>,
    fatal_fired: AtomicBool,
    fatal_handler: Box<dyn Fn(StoreError) + Send + Sync>,
}

impl CommitTracker {
    pub(crate) fn new(
        metadata: ContainerMetadata,
        memory_state: Box<dyn MemoryStateUpdater>,
        policy: Arc<dyn CheckpointPolicy>,
        metrics: Arc<MetricsInner>,
        fatal_handler: Box<dyn Fn(StoreError) + Send + Sync>,
    ) -> Self {
        Self {
            state: Mutex::new(CoreState {
                updater: MetadataUpdater::new(metadata, 1),
                pending: VecDeque::new(),
                txn_by_frame: BTreeMap::new(),
                highest_committed_frame_sequence: -1,
                highest_fully_committed_sequence: 0,
                memory_state,
            }),
            policy,
            metrics,
            fatal_fired: AtomicBool::new(false),
            fatal_handler,
        }
    }

    /// Validates `op` and assigns its sequence number, atomically.
    pub(crate) fn admit(&self, op: &mut Operation) -> Result<()> {
        let mut state = self.state.lock();
        state.updater.pre_process(op)?;
        let sequence = state.updater.next_operation_sequence_number();
        op.set_sequence(sequence);
        Ok(())
    }

    /// Applies `op`'s mutation to the open metadata transaction. Called after
    /// the operation has been handed to the frame builder.
    pub(crate) fn accept(&self, op: &Operation) -> Result<()> {
        self.state.lock().updater.accept(op)
    }

    /// Queues an operation whose frame entry (if any) is in flight. If the
    /// owning frame was already acknowledged (the write raced ahead of
    /// registration), the operation completes immediately.
    pub(crate) fn add_pending(&self, pending: PendingOperation) {
        let fatal = {
            let mut state = self.state.lock();
            state.pending.push_back(pending);
            match self.catch_up_locked(&mut state) {
                Some(err) => self.fail_locked(&mut state, &err, None),
                None => None,
            }
        };
        if let Some(err) = fatal {
            (self.fatal_handler)(err);
        }
    }

    /// Fails everything in flight, rolling back staged metadata.
    ///
    /// `frame: None` rolls back every open and sealed transaction; otherwise
    /// the rollback starts at the transaction recorded for that frame.
    pub(crate) fn fail(&self, err: &StoreError, frame: Option<&FrameArgs>) {
        let fatal = {
            let mut state = self.state.lock();
            self.fail_locked(&mut state, err, frame)
        };
        if let Some(err) = fatal {
            (self.fatal_handler)(err);
        }
        self.auto_complete_prefix();
    }

    /// Fails any remaining pending operations and discards staged state.
    /// Called once the processor is past the point of accepting work.
    pub(crate) fn drain_for_shutdown(&self, err: &StoreError) {
        let mut state = self.state.lock();
        while let Some(pending) = state.pending.pop_front() {
            pending.fail(err.clone());
            self.metrics.operations_failed.fetch_add(1, Ordering::Relaxed);
        }
        state.txn_by_frame.clear();
        state.updater.rollback(0);
    }

    /// Clone of the committed base metadata.
    pub(crate) fn metadata(&self) -> ContainerMetadata {
        self.state.lock().updater.base().clone()
    }

    /// Completes whatever prefix of the pending queue is already covered:
    /// non-serializable operations (they carry no frame entry, so no
    /// acknowledgment will ever arrive for them) and serializable operations
    /// at or below the fully-committed watermark.
    fn auto_complete_prefix(&self) {
        let fatal = {
            let mut state = self.state.lock();
            match self.catch_up_locked(&mut state) {
                Some(err) => self.fail_locked(&mut state, &err, None),
                None => None,
            }
        };
        if let Some(err) = fatal {
            (self.fatal_handler)(err);
        }
    }

    /// Pops and resolves the completable prefix of `pending`. Returns the
    /// memory-state failure, if one interrupted the walk; the offending
    /// operation is already failed when it does.
    fn catch_up_locked(&self, state: &mut MutexGuard<'_, CoreState>) -> Option<StoreError> {
        let mut applied = false;
        let outcome = loop {
            let (serializable, sequence) = match state.pending.front() {
                Some(pending) => (pending.op().can_serialize(), pending.op().sequence()),
                None => break None,
            };
            if !serializable {
                let pending = state.pending.pop_front().expect("checked front");
                pending.complete();
                self.metrics
                    .operations_completed
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if sequence > state.highest_fully_committed_sequence {
                break None;
            }
            let pending = state.pending.pop_front().expect("checked front");
            match state.memory_state.apply(pending.op()) {
                Ok(()) => {
                    applied = true;
                    pending.complete();
                    self.metrics
                        .operations_completed
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    pending.fail(err.clone());
                    self.metrics.operations_failed.fetch_add(1, Ordering::Relaxed);
                    break Some(err);
                }
            }
        };
        if applied && outcome.is_none() {
            state.memory_state.flush();
        }
        outcome
    }

    fn fail_locked(
        &self,
        state: &mut MutexGuard<'_, CoreState>,
        err: &StoreError,
        frame: Option<&FrameArgs>,
    ) -> Option<StoreError> {
        let from = frame
            .and_then(|f| state.txn_by_frame.remove(&f.frame_id))
            .unwrap_or(0);
        state.txn_by_frame.retain(|_, txn| *txn < from);
        state.updater.rollback(from);
        warn!(
            from_txn_id = from,
            pending = state.pending.len(),
            error = %err,
            "tracker.fail"
        );
        while let Some(pending) = state.pending.pop_back() {
            pending.fail(err.clone());
            self.metrics.operations_failed.fetch_add(1, Ordering::Relaxed);
        }
        if err.is_fatal() && !self.fatal_fired.swap(true, Ordering::SeqCst) {
            Some(err.clone())
        } else {
            None
        }
    }
}

impl FrameSink for CommitTracker {
    fn frame_sealed(&self, frame: &FrameArgs) {
        let mut state = self.state.lock();
        let txn = state.updater.seal_transaction();
        state.txn_by_frame.insert(frame.frame_id, txn);
        debug!(frame_id = frame.frame_id, txn_id = txn, "tracker.frame.sealed");
    }

    fn frame_committed(&self, frame: FrameArgs) {
        let address = match frame.address {
            Some(address) => address,
            None => {
                self.fail(
                    &StoreError::Corruption("frame committed without an address".into()),
                    Some(&frame),
                );
                return;
            }
        };

        let fatal = {
            let mut state = self.state.lock();
            state
                .updater
                .record_truncation_marker(frame.last_started_sequence, address);

            if (address.sequence as i64) <= state.highest_committed_frame_sequence {
                // Late or duplicate acknowledgment: account for the bytes but
                // change nothing else.
                debug!(
                    log_sequence = address.sequence,
                    highest = state.highest_committed_frame_sequence,
                    "tracker.frame.stale_ack"
                );
                drop(state);
                self.policy.record_commit(frame.length as u64);
                return;
            }

            if let Some(txn) = state.txn_by_frame.remove(&frame.frame_id) {
                state.txn_by_frame.retain(|_, id| *id > txn);
                state.updater.commit(txn);
            }

            state.highest_fully_committed_sequence = state
                .highest_fully_committed_sequence
                .max(frame.last_fully_serialized_sequence);

            match self.catch_up_locked(&mut state) {
                Some(err) => self.fail_locked(&mut state, &err, Some(&frame)),
                None => {
                    state.memory_state.flush();
                    state.highest_committed_frame_sequence = address.sequence as i64;
                    self.metrics.frames_committed.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .bytes_written
                        .fetch_add(frame.length as u64, Ordering::Relaxed);
                    drop(state);
                    self.policy.record_commit(frame.length as u64);
                    return;
                }
            }
        };
        if let Some(err) = fatal {
            (self.fatal_handler)(err);
        }
        self.auto_complete_prefix();
    }

    fn frame_failed(&self, err: &StoreError, frame: Option<&FrameArgs>) {
        self.fail(err, frame);
    }
}
