#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use seglog::{
    ContainerMetadata, InMemoryLog, NoCheckpointPolicy, NullStateUpdater, Operation,
    OperationProcessor, ProcessorConfig, ProcessorStatus, StoreError,
};

#[tokio::test]
async fn stop_mid_flight_commits_the_pipeline_and_fails_the_queue() {
    let log = Arc::new(InMemoryLog::new());
    let config = ProcessorConfig {
        max_concurrent_writes: 1,
        max_read_at_once: 4,
        frame_capacity: 64,
        ..ProcessorConfig::default()
    };
    let processor = OperationProcessor::spawn(
        config,
        ContainerMetadata::new(),
        log.clone(),
        Box::new(NullStateUpdater),
        Arc::new(NoCheckpointPolicy),
    );

    processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");

    // Stall the pipeline: small frames, one write slot, no acknowledgments.
    log.hold();
    let futures: Vec<_> = (0..100)
        .map(|_| processor.process(Operation::append(1, Bytes::from(vec![7u8; 10]))))
        .collect();

    // Let the loop pull its first small batch and block on the write slot.
    tokio::time::sleep(Duration::from_millis(20)).await;
    processor.stop();
    log.release_all();
    processor.await_terminated().await.expect("clean stop");

    let mut committed = 0u64;
    let mut closed = 0u64;
    for future in futures {
        match future.await {
            Ok(_) => committed += 1,
            Err(StoreError::Closed(_)) => closed += 1,
            Err(other) => panic!("unexpected failure: {other}"),
        }
    }
    assert_eq!(committed + closed, 100);
    assert!(closed > 0, "operations still queued at stop must fail");

    // Exactly the committed appends are reflected in metadata: no partial
    // commits, no dangling transaction.
    let metadata = processor.metadata();
    assert_eq!(
        metadata.segment(1).expect("segment").length,
        committed * 10,
        "metadata reflects exactly the committed operations"
    );
}

#[tokio::test]
async fn stop_is_idempotent() {
    let log = Arc::new(InMemoryLog::new());
    let processor = OperationProcessor::spawn(
        ProcessorConfig::default(),
        ContainerMetadata::new(),
        log,
        Box::new(NullStateUpdater),
        Arc::new(NoCheckpointPolicy),
    );
    processor.stop();
    processor.stop();
    processor.await_terminated().await.expect("clean stop");
    processor.stop();
    assert!(matches!(processor.status(), ProcessorStatus::Stopped));
}

#[tokio::test]
async fn shutdown_timeout_fails_stuck_operations() {
    let log = Arc::new(InMemoryLog::new());
    let config = ProcessorConfig {
        shutdown_timeout: Duration::from_millis(100),
        ..ProcessorConfig::default()
    };
    let processor = OperationProcessor::spawn(
        config,
        ContainerMetadata::new(),
        log.clone(),
        Box::new(NullStateUpdater),
        Arc::new(NoCheckpointPolicy),
    );

    processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");

    // This append's frame write never acknowledges.
    log.hold();
    let stuck = processor.process(Operation::append(1, Bytes::from_static(b"x")));
    tokio::time::sleep(Duration::from_millis(20)).await;

    processor.stop();
    processor.await_terminated().await.expect("stop despite stuck write");
    assert!(matches!(stuck.await, Err(StoreError::Closed(_))));
    assert!(matches!(processor.status(), ProcessorStatus::Stopped));
}

#[tokio::test]
async fn queue_capacity_rejects_overflow_without_stopping() {
    let log = Arc::new(InMemoryLog::new());
    let config = ProcessorConfig {
        intake_capacity: Some(2),
        ..ProcessorConfig::default()
    };
    let processor = OperationProcessor::spawn(
        config,
        ContainerMetadata::new(),
        log,
        Box::new(NullStateUpdater),
        Arc::new(NoCheckpointPolicy),
    );

    processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");

    // Enqueue three appends without yielding: the single-threaded test
    // runtime cannot run the drain loop in between, so the third add sees a
    // full queue.
    let a = processor.process(Operation::append(1, Bytes::from_static(b"a")));
    let b = processor.process(Operation::append(1, Bytes::from_static(b"b")));
    let overflow = processor.process(Operation::append(1, Bytes::from_static(b"c")));

    assert!(matches!(overflow.await, Err(StoreError::QueueFull)));
    a.await.expect("admitted append commits");
    b.await.expect("admitted append commits");
    assert!(matches!(processor.status(), ProcessorStatus::Running));

    processor.stop();
    processor.await_terminated().await.expect("clean stop");
}
