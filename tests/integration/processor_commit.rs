#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use seglog::{
    read_chunks, AttributeUpdate, AttributeUpdateKind, ByteThresholdPolicy, ContainerMetadata,
    InMemoryLog, NoCheckpointPolicy, NullStateUpdater, Operation, OperationBody,
    OperationProcessor, ProcessorConfig, ReadCacheUpdater,
};

fn spawn_default(log: Arc<InMemoryLog>) -> OperationProcessor {
    OperationProcessor::spawn(
        ProcessorConfig::default(),
        ContainerMetadata::new(),
        log,
        Box::new(NullStateUpdater),
        Arc::new(NoCheckpointPolicy),
    )
}

/// Decodes every operation record the log received, reassembling records that
/// span frames.
fn decode_log(log: &InMemoryLog) -> Vec<Operation> {
    let mut records: Vec<Vec<u8>> = Vec::new();
    let mut partial: Option<Vec<u8>> = None;
    for (_, frame) in log.contents() {
        for chunk in read_chunks(&frame).expect("parse frame") {
            let buf = if chunk.first {
                partial = Some(Vec::new());
                partial.as_mut().expect("just set")
            } else {
                partial.as_mut().expect("continuation without start")
            };
            buf.extend_from_slice(&chunk.payload);
            if chunk.last {
                records.push(partial.take().expect("record in progress"));
            }
        }
    }
    records
        .iter()
        .map(|record| Operation::decode(record).expect("decode operation"))
        .collect()
}

#[tokio::test]
async fn five_appends_commit_with_consecutive_sequences() {
    let log = Arc::new(InMemoryLog::new());
    let processor = spawn_default(log.clone());

    processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");

    let mut futures = Vec::new();
    for len in [10usize, 20, 30, 40, 50] {
        futures.push(processor.process(Operation::append(1, Bytes::from(vec![0xab; len]))));
    }
    let mut sequences = Vec::new();
    for future in futures {
        sequences.push(future.await.expect("append committed"));
    }

    let k = sequences[0];
    assert_eq!(
        sequences,
        vec![k, k + 1, k + 2, k + 3, k + 4],
        "sequence numbers are consecutive in admission order"
    );

    let metadata = processor.metadata();
    assert_eq!(metadata.segment(1).expect("segment").length, 150);
    let last_marker = metadata
        .truncation_markers()
        .map(|(seq, _)| seq)
        .max()
        .expect("marker recorded");
    assert_eq!(last_marker, k + 4);

    // Everything that reached the durable log decodes back to our appends.
    let decoded = decode_log(&log);
    let appended: u64 = decoded
        .iter()
        .filter_map(|op| match op.body() {
            OperationBody::SegmentAppend { data, .. } => Some(data.len() as u64),
            _ => None,
        })
        .sum();
    assert_eq!(appended, 150);

    processor.stop();
    processor.await_terminated().await.expect("clean stop");
}

#[tokio::test]
async fn probe_completes_after_earlier_appends_only() {
    let log = Arc::new(InMemoryLog::new());
    let processor = spawn_default(log.clone());
    processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");

    log.hold();
    let first = processor.process(Operation::append(1, Bytes::from_static(b"aaaa")));
    let mut probe = processor.process(Operation::probe());
    let second = processor.process(Operation::append(1, Bytes::from_static(b"bb")));

    assert!(
        tokio::time::timeout(Duration::from_millis(50), &mut probe)
            .await
            .is_err(),
        "probe must not complete while the preceding append is not durable"
    );

    log.release_all();
    let first_seq = first.await.expect("first append committed");
    let probe_seq = probe.await.expect("probe completed");
    let second_seq = second.await.expect("second append committed");
    assert_eq!(probe_seq, 0, "probes carry no sequence number");
    assert!(first_seq < second_seq);
    assert_eq!(processor.metadata().segment(1).expect("segment").length, 6);

    processor.stop();
    processor.await_terminated().await.expect("clean stop");
}

#[tokio::test]
async fn byte_threshold_policy_injects_checkpoint_operations() {
    let log = Arc::new(InMemoryLog::new());
    let (trigger_tx, mut trigger_rx) = tokio::sync::mpsc::unbounded_channel();
    let policy = Arc::new(ByteThresholdPolicy::new(64, move || {
        let _ = trigger_tx.send(());
    }));
    let processor = OperationProcessor::spawn(
        ProcessorConfig::default(),
        ContainerMetadata::new(),
        log.clone(),
        Box::new(NullStateUpdater),
        policy,
    );
    // Forward policy triggers back into the processor as checkpoint
    // operations, the way a container host wires the policy up.
    {
        let processor = processor.clone();
        tokio::spawn(async move {
            while trigger_rx.recv().await.is_some() {
                let _ = processor.process(Operation::checkpoint());
            }
        });
    }

    processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");
    for _ in 0..4 {
        processor
            .process(Operation::append(1, Bytes::from(vec![1u8; 100])))
            .await
            .expect("append committed");
    }

    // The synthesized checkpoint arrives asynchronously.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let has_checkpoint = decode_log(&log)
                .iter()
                .any(|op| matches!(op.body(), OperationBody::MetadataCheckpoint));
            if has_checkpoint {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("checkpoint operation reached the log");

    processor.stop();
    processor.await_terminated().await.expect("clean stop");
}

#[tokio::test]
async fn attribute_updates_commit_with_their_append() {
    let log = Arc::new(InMemoryLog::new());
    let processor = spawn_default(log);
    processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");

    let attrs = |value| {
        let mut updates = seglog::AttributeUpdates::new();
        updates.push(AttributeUpdate {
            id: 9,
            kind: AttributeUpdateKind::Accumulate,
            value,
        });
        updates
    };
    processor
        .process(Operation::append_with_attributes(
            1,
            Bytes::from_static(b"x"),
            attrs(10),
        ))
        .await
        .expect("first attributed append");
    processor
        .process(Operation::append_with_attributes(
            1,
            Bytes::from_static(b"y"),
            attrs(5),
        ))
        .await
        .expect("second attributed append");

    let metadata = processor.metadata();
    let segment = metadata.segment(1).expect("segment");
    assert_eq!(segment.attributes.get(&9), Some(&15));

    processor.stop();
    processor.await_terminated().await.expect("clean stop");
}

#[tokio::test]
async fn read_cache_sees_committed_bytes_after_flush() {
    let log = Arc::new(InMemoryLog::new());
    let updater = ReadCacheUpdater::new();
    let cache = updater.cache();
    let processor = OperationProcessor::spawn(
        ProcessorConfig::default(),
        ContainerMetadata::new(),
        log,
        Box::new(updater),
        Arc::new(NoCheckpointPolicy),
    );

    processor
        .process(Operation::map(1, "events", 0, false))
        .await
        .expect("map committed");
    processor
        .process(Operation::append(1, Bytes::from_static(b"hello ")))
        .await
        .expect("append committed");
    processor
        .process(Operation::append(1, Bytes::from_static(b"world")))
        .await
        .expect("append committed");

    {
        let cache = cache.lock();
        assert_eq!(cache.length(1), Some(11));
        assert_eq!(cache.tail_bytes(1), Some(b"hello world".as_slice()));
        assert_eq!(cache.name(1), Some("events"));
    }

    processor.stop();
    processor.await_terminated().await.expect("clean stop");
}

#[tokio::test]
async fn merge_pipeline_commits_end_to_end() {
    let log = Arc::new(InMemoryLog::new());
    let processor = spawn_default(log);

    processor
        .process(Operation::map(1, "target", 0, false))
        .await
        .expect("map target");
    processor
        .process(Operation::map(2, "source", 0, false))
        .await
        .expect("map source");
    processor
        .process(Operation::append(1, Bytes::from_static(b"12345")))
        .await
        .expect("append target");
    processor
        .process(Operation::append(2, Bytes::from_static(b"678")))
        .await
        .expect("append source");
    processor
        .process(Operation::seal(2))
        .await
        .expect("seal source");
    processor
        .process(Operation::merge(1, 2))
        .await
        .expect("merge");

    let metadata = processor.metadata();
    assert_eq!(metadata.segment(1).expect("target").length, 8);
    assert!(metadata.segment(2).expect("source").merged);
    assert!(metadata.segment(2).expect("source").sealed);

    processor.stop();
    processor.await_terminated().await.expect("clean stop");
}
