#![allow(missing_docs)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use seglog::{
    ContainerMetadata, InMemoryLog, MemoryStateUpdater, NoCheckpointPolicy, NullStateUpdater,
    Operation, OperationProcessor, ProcessorConfig, ProcessorStatus, Result, StoreError,
};

fn io_error() -> StoreError {
    StoreError::from(io::Error::new(io::ErrorKind::Other, "injected disk fault"))
}

fn spawn_default(log: Arc<InMemoryLog>) -> OperationProcessor {
    OperationProcessor::spawn(
        ProcessorConfig::default(),
        ContainerMetadata::new(),
        log,
        Box::new(NullStateUpdater),
        Arc::new(NoCheckpointPolicy),
    )
}

#[tokio::test]
async fn io_failure_rolls_back_and_processor_recovers() {
    let log = Arc::new(InMemoryLog::new());
    let processor = spawn_default(log.clone());

    let map_seq = processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");

    // The next frame write fails. All three appends sit in that frame: they
    // are enqueued back-to-back, so the loop drains them as one batch.
    log.fail_next(io_error());
    let futures: Vec<_> = (0..3)
        .map(|_| processor.process(Operation::append(1, Bytes::from_static(b"aaaa"))))
        .collect();
    for future in futures {
        assert!(matches!(future.await, Err(StoreError::Io(_))));
    }

    // Metadata was rolled back and the processor is still running.
    assert_eq!(processor.metadata().segment(1).expect("segment").length, 0);
    assert!(matches!(processor.status(), ProcessorStatus::Running));

    // Sequence numbers are never reused: map took map_seq, the failed appends
    // burned the next three.
    let retry_seq = processor
        .process(Operation::append(1, Bytes::from_static(b"bbbb")))
        .await
        .expect("retried append commits");
    assert_eq!(retry_seq, map_seq + 4);
    assert_eq!(processor.metadata().segment(1).expect("segment").length, 4);
    assert!(
        processor.metrics().builder_rebuilds >= 1,
        "the frame builder must be rebuilt after a latched write failure"
    );

    processor.stop();
    processor.await_terminated().await.expect("clean stop");
}

/// Fails the n-th applied operation with `Corruption`.
struct FailNthApply {
    applied: AtomicUsize,
    fail_at: usize,
}

impl FailNthApply {
    fn new(fail_at: usize) -> Self {
        Self {
            applied: AtomicUsize::new(0),
            fail_at,
        }
    }
}

impl MemoryStateUpdater for FailNthApply {
    fn apply(&mut self, _op: &Operation) -> Result<()> {
        let nth = self.applied.fetch_add(1, Ordering::SeqCst) + 1;
        if nth == self.fail_at {
            Err(StoreError::Corruption("in-memory index diverged".into()))
        } else {
            Ok(())
        }
    }

    fn flush(&mut self) {}
}

#[tokio::test]
async fn corruption_mid_commit_is_fatal() {
    let log = Arc::new(InMemoryLog::new());
    // Applies: map (1st), append a (2nd), append b (3rd, fails), append c.
    let processor = OperationProcessor::spawn(
        ProcessorConfig::default(),
        ContainerMetadata::new(),
        log,
        Box::new(FailNthApply::new(3)),
        Arc::new(NoCheckpointPolicy),
    );

    let map = processor.process(Operation::map(1, "s", 0, false));
    let a = processor.process(Operation::append(1, Bytes::from_static(b"a")));
    let b = processor.process(Operation::append(1, Bytes::from_static(b"b")));
    let c = processor.process(Operation::append(1, Bytes::from_static(b"c")));

    map.await.expect("map applied before the corruption");
    a.await.expect("first append applied before the corruption");
    assert!(matches!(b.await, Err(StoreError::Corruption(_))));
    assert!(
        matches!(c.await, Err(StoreError::Corruption(_))),
        "operations behind the corrupted one fail with the same cause"
    );

    assert!(matches!(
        processor.await_terminated().await,
        Err(StoreError::Corruption(_))
    ));
    assert!(matches!(processor.status(), ProcessorStatus::Failed(_)));

    // The processor no longer accepts work.
    let rejected = processor.process(Operation::append(1, Bytes::from_static(b"z")));
    assert!(matches!(rejected.await, Err(StoreError::Closed(_))));
}

#[tokio::test]
async fn losing_log_ownership_is_fatal() {
    let log = Arc::new(InMemoryLog::new());
    let processor = spawn_default(log.clone());

    processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");

    log.fence();
    let append = processor.process(Operation::append(1, Bytes::from_static(b"x")));
    assert!(matches!(append.await, Err(StoreError::NotPrimary(_))));
    assert!(matches!(
        processor.await_terminated().await,
        Err(StoreError::NotPrimary(_))
    ));
}

#[tokio::test]
async fn bad_operations_do_not_disturb_neighbors() {
    let log = Arc::new(InMemoryLog::new());
    let processor = spawn_default(log);

    processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");
    processor
        .process(Operation::seal(1))
        .await
        .expect("seal committed");

    // Append to the sealed segment fails alone; a map beside it commits.
    let rejected = processor.process(Operation::append(1, Bytes::from_static(b"x")));
    let mapped = processor.process(Operation::map(2, "other", 0, false));
    assert!(matches!(rejected.await, Err(StoreError::BadOperation(_))));
    mapped.await.expect("unrelated map still commits");

    assert!(matches!(processor.status(), ProcessorStatus::Running));
    processor.stop();
    processor.await_terminated().await.expect("clean stop");
}
