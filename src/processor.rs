//! The single-consumer loop orchestrating intake, frame building, and commit
//! tracking, plus the public handle producers use.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::builder::{FrameBuilder, FrameSink};
use crate::checkpoint::CheckpointPolicy;
use crate::config::ProcessorConfig;
use crate::error::{Result, StoreError};
use crate::log::DurableLog;
use crate::metadata::ContainerMetadata;
use crate::metrics::{MetricsInner, ProcessorMetrics};
use crate::ops::Operation;
use crate::queue::IntakeQueue;
use crate::state::MemoryStateUpdater;
use crate::tracker::{CommitTracker, PendingOperation};

/// Lifecycle state of a processor.
#[derive(Debug, Clone)]
pub enum ProcessorStatus {
    /// Accepting and committing operations.
    Running,
    /// Shutdown requested; draining in-flight work.
    Stopping,
    /// Shut down cleanly.
    Stopped,
    /// Stopped by a fatal error.
    Failed(StoreError),
}

/// Resolves to the operation's assigned sequence number once its effects are
/// durable and applied, or to the error that failed it.
///
/// Dropping the future does not cancel the operation.
pub struct CommitFuture {
    rx: oneshot::Receiver<Result<u64>>,
}

impl CommitFuture {
    /// Blocks the current thread until the operation resolves. Must not be
    /// called from an async context.
    pub fn wait(self) -> Result<u64> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(StoreError::Closed("operation processor")))
    }
}

impl Future for CommitFuture {
    type Output = Result<u64>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|res| match res {
            Ok(result) => result,
            Err(_) => Err(StoreError::Closed("operation processor")),
        })
    }
}

struct Inner {
    config: ProcessorConfig,
    queue: Arc<IntakeQueue<PendingOperation>>,
    tracker: Arc<CommitTracker>,
    log: Arc<dyn DurableLog>,
    status: watch::Sender<ProcessorStatus>,
    metrics: Arc<MetricsInner>,
    fatal: Arc<Mutex<Option<StoreError>>>,
}

/// The durable-write commit engine of one segment container.
///
/// Producers call [`process`](Self::process) concurrently; a single loop
/// drains the intake queue, serializes operations into frames, and commits
/// metadata as frames become durable. See the crate docs for the full
/// lifecycle.
#[derive(Clone)]
pub struct OperationProcessor {
    inner: Arc<Inner>,
}

impl OperationProcessor {
    /// Starts a processor over `metadata`, writing frames to `log`. Must be
    /// called from within a tokio runtime.
    pub fn spawn(
        config: ProcessorConfig,
        metadata: ContainerMetadata,
        log: Arc<dyn DurableLog>,
        memory_state: Box<dyn MemoryStateUpdater>,
        policy: Arc<dyn CheckpointPolicy>,
    ) -> Self {
        let metrics = Arc::new(MetricsInner::default());
        let queue = Arc::new(IntakeQueue::<PendingOperation>::new(config.intake_capacity));
        let fatal = Arc::new(Mutex::new(None));

        let fatal_handler: Box<dyn Fn(StoreError) + Send + Sync> = {
            let queue = Arc::clone(&queue);
            let fatal = Arc::clone(&fatal);
            let metrics = Arc::clone(&metrics);
            Box::new(move |err: StoreError| {
                warn!(error = %err, "processor.fatal");
                fatal.lock().get_or_insert_with(|| err.clone());
                for pending in queue.close() {
                    pending.fail(StoreError::Closed("operation processor"));
                    metrics
                        .operations_failed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            })
        };

        let tracker = Arc::new(CommitTracker::new(
            metadata,
            memory_state,
            policy,
            Arc::clone(&metrics),
            fatal_handler,
        ));
        let (status, _) = watch::channel(ProcessorStatus::Running);
        let inner = Arc::new(Inner {
            config,
            queue,
            tracker,
            log,
            status,
            metrics,
            fatal,
        });
        tokio::spawn(run(Arc::clone(&inner)));
        Self { inner }
    }

    /// Admits `op` for processing. The returned future resolves once the
    /// operation is durable and applied. Non-serializable operations resolve
    /// with [`NO_SEQUENCE`](crate::ops::NO_SEQUENCE) once every earlier
    /// serializable operation is durable.
    pub fn process(&self, op: Operation) -> CommitFuture {
        let (pending, rx) = PendingOperation::new(op);
        if let Err((pending, err)) = self.inner.queue.add(pending) {
            pending.fail(err);
            self.inner
                .metrics
                .operations_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        CommitFuture { rx }
    }

    /// Requests shutdown: the intake queue closes, queued operations fail
    /// with `Closed`, in-flight frame writes drain. Idempotent.
    pub fn stop(&self) {
        let transitioned = self.inner.status.send_if_modified(|status| {
            if matches!(status, ProcessorStatus::Running) {
                *status = ProcessorStatus::Stopping;
                true
            } else {
                false
            }
        });
        if transitioned {
            info!("processor.stop.requested");
        }
        for pending in self.inner.queue.close() {
            pending.fail(StoreError::Closed("operation processor"));
            self.inner
                .metrics
                .operations_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Waits until the loop has fully terminated. Returns the fatal error if
    /// the processor failed.
    pub async fn await_terminated(&self) -> Result<()> {
        let mut rx = self.inner.status.subscribe();
        loop {
            {
                let status = rx.borrow_and_update();
                match &*status {
                    ProcessorStatus::Stopped => return Ok(()),
                    ProcessorStatus::Failed(err) => return Err(err.clone()),
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(StoreError::Closed("operation processor"));
            }
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ProcessorStatus {
        self.inner.status.borrow().clone()
    }

    /// Snapshot of the committed base metadata.
    pub fn metadata(&self) -> ContainerMetadata {
        self.inner.tracker.metadata()
    }

    /// Point-in-time counters.
    pub fn metrics(&self) -> ProcessorMetrics {
        self.inner.metrics.snapshot()
    }
}

async fn run(inner: Arc<Inner>) {
    debug!("processor.loop.start");
    let mut builder: Option<FrameBuilder> = None;
    let exit_err = loop {
        let batch = match inner.queue.take(inner.config.max_read_at_once).await {
            Ok(batch) => batch,
            // Queue closed: clean stop or the fatal handler got here first.
            Err(_) => break None,
        };
        debug!(batch = batch.len(), "processor.batch.drain");
        if let Err(err) = inner.process_batch(batch, &mut builder).await {
            break Some(err);
        }
    };
    inner.finish(builder, exit_err).await;
}

impl Inner {
    async fn process_batch(
        &self,
        mut batch: VecDeque<PendingOperation>,
        slot: &mut Option<FrameBuilder>,
    ) -> Result<()> {
        while !batch.is_empty() {
            match self.drain_batch(&mut batch, slot).await {
                Ok(next) => batch = next,
                Err(err) => {
                    let cause = err.real_cause();
                    self.tracker.fail(&cause, None);
                    if cause.is_fatal() {
                        self.cancel_incomplete(batch, &cause);
                        return Err(cause);
                    }
                    // Transient: the remaining operations retry against a
                    // fresh builder on the next pass.
                }
            }
        }
        Ok(())
    }

    /// Feeds the current batch through the builder, then opportunistically
    /// polls for more without suspending. Flushes once the intake is dry.
    async fn drain_batch(
        &self,
        batch: &mut VecDeque<PendingOperation>,
        slot: &mut Option<FrameBuilder>,
    ) -> Result<VecDeque<PendingOperation>> {
        let builder = self.ensure_builder(slot);
        while let Some(pending) = batch.pop_front() {
            if let Some(pending) = self.process_one(pending, builder).await? {
                self.tracker.add_pending(pending);
            }
        }
        let next = self.queue.poll(self.config.max_read_at_once);
        if next.is_empty() {
            builder.flush().await?;
        }
        Ok(next)
    }

    async fn process_one(
        &self,
        mut pending: PendingOperation,
        builder: &mut FrameBuilder,
    ) -> Result<Option<PendingOperation>> {
        if !pending.op().can_serialize() {
            // No frame entry; completes through the tracker's
            // auto-completion once everything before it is durable.
            return Ok(Some(pending));
        }
        if let Err(err) = self.tracker.admit(pending.op_mut()) {
            return self.fail_one(pending, err, false);
        }
        if let Err(err) = builder.append(pending.op()).await {
            // A closed builder propagates so the loop rebuilds it; the
            // operations already staged behind it fail through the tracker.
            let propagate = matches!(err, StoreError::BuilderClosed { .. });
            return self.fail_one(pending, err, propagate);
        }
        if let Err(err) = self.tracker.accept(pending.op()) {
            return self.fail_one(pending, err, false);
        }
        Ok(Some(pending))
    }

    /// Fails a single operation. Escalates when the error is fatal or the
    /// caller asked for propagation.
    fn fail_one(
        &self,
        pending: PendingOperation,
        err: StoreError,
        propagate: bool,
    ) -> Result<Option<PendingOperation>> {
        let escalate = propagate || err.real_cause().is_fatal();
        debug!(error = %err, escalate, "processor.operation.rejected");
        pending.fail(err.clone());
        self.metrics
            .operations_failed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if escalate {
            Err(err)
        } else {
            Ok(None)
        }
    }

    fn ensure_builder<'a>(&self, slot: &'a mut Option<FrameBuilder>) -> &'a mut FrameBuilder {
        let rebuild = match slot {
            Some(builder) => builder.failure_cause().is_some(),
            None => true,
        };
        if rebuild {
            if slot.is_some() {
                debug!("processor.builder.rebuild");
                self.metrics
                    .builder_rebuilds
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            let sink: Arc<dyn FrameSink> = Arc::clone(&self.tracker) as Arc<dyn FrameSink>;
            *slot = Some(FrameBuilder::new(
                Arc::clone(&self.log),
                sink,
                self.config.frame_capacity,
                self.config.max_concurrent_writes,
            ));
        }
        slot.as_mut().expect("builder just ensured")
    }

    fn cancel_incomplete(&self, batch: VecDeque<PendingOperation>, err: &StoreError) {
        for pending in batch {
            pending.fail(err.clone());
            self.metrics
                .operations_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    async fn finish(&self, builder: Option<FrameBuilder>, loop_err: Option<StoreError>) {
        if let Some(err) = loop_err {
            self.fatal.lock().get_or_insert(err);
        }
        // Idempotent: fails whatever raced into the queue after the loop
        // decided to exit.
        for pending in self.queue.close() {
            pending.fail(StoreError::Closed("operation processor"));
            self.metrics
                .operations_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        if let Some(builder) = builder {
            match tokio::time::timeout(self.config.shutdown_timeout, builder.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "processor.shutdown.flush_failed"),
                Err(_) => warn!(
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "processor.shutdown.builder_close_timed_out"
                ),
            }
        }
        self.tracker
            .drain_for_shutdown(&StoreError::Closed("operation processor"));
        let status = match self.fatal.lock().clone() {
            Some(err) => ProcessorStatus::Failed(err),
            None => ProcessorStatus::Stopped,
        };
        info!(?status, "processor.loop.stopped");
        self.status.send_replace(status);
    }
}
