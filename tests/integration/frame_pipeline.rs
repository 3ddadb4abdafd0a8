#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use seglog::{
    read_chunks, ContainerMetadata, FileLog, InMemoryLog, NoCheckpointPolicy, NullStateUpdater,
    Operation, OperationBody, OperationProcessor, ProcessorConfig,
};

fn small_frame_config(max_concurrent_writes: usize) -> ProcessorConfig {
    ProcessorConfig {
        max_concurrent_writes,
        frame_capacity: 64,
        ..ProcessorConfig::default()
    }
}

#[tokio::test]
async fn operation_spanning_two_frames_completes_on_the_second_commit() {
    let log = Arc::new(InMemoryLog::new());
    let processor = OperationProcessor::spawn(
        small_frame_config(2),
        ContainerMetadata::new(),
        log.clone(),
        Box::new(NullStateUpdater),
        Arc::new(NoCheckpointPolicy),
    );

    let map_seq = processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");

    log.hold();
    // 100 payload bytes cannot fit one 64-byte frame.
    let mut append = processor.process(Operation::append(1, Bytes::from(vec![9u8; 100])));
    tokio::time::timeout(Duration::from_secs(5), async {
        while log.held_count() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("both frames dispatched");

    // First frame durable: the record is not complete, the future waits.
    assert!(log.release_next());
    assert!(
        tokio::time::timeout(Duration::from_millis(50), &mut append)
            .await
            .is_err(),
        "operation must stay pending until its last frame is durable"
    );

    // Remaining frames durable: the future resolves.
    log.release_all();
    let append_seq = append.await.expect("append committed");
    assert_eq!(append_seq, map_seq + 1);
    assert_eq!(processor.metadata().segment(1).expect("segment").length, 100);

    // Every frame carrying part of the record anchors the same operation.
    let marker_seqs: Vec<u64> = processor
        .metadata()
        .truncation_markers()
        .map(|(seq, _)| seq)
        .collect();
    assert!(marker_seqs.contains(&append_seq));

    // The record reassembles across the frame boundary.
    let mut record = Vec::new();
    let mut seen_last = false;
    for (_, frame) in log.contents().iter().skip(1) {
        for chunk in read_chunks(frame).expect("parse frame") {
            assert_eq!(chunk.sequence, append_seq);
            record.extend_from_slice(&chunk.payload);
            seen_last = chunk.last;
        }
    }
    assert!(seen_last, "final chunk must be flagged");
    let decoded = Operation::decode(&record).expect("reassembled record decodes");
    match decoded.body() {
        OperationBody::SegmentAppend { data, .. } => assert_eq!(data.len(), 100),
        other => panic!("unexpected body {other:?}"),
    }

    processor.stop();
    processor.await_terminated().await.expect("clean stop");
}

#[tokio::test]
async fn reverse_order_acknowledgments_still_commit_in_sequence_order() {
    let log = Arc::new(InMemoryLog::new());
    let processor = OperationProcessor::spawn(
        small_frame_config(4),
        ContainerMetadata::new(),
        log.clone(),
        Box::new(NullStateUpdater),
        Arc::new(NoCheckpointPolicy),
    );

    processor
        .process(Operation::map(1, "s", 0, false))
        .await
        .expect("map committed");

    log.hold();
    let futures: Vec<_> = (0..3)
        .map(|_| processor.process(Operation::append(1, Bytes::from(vec![3u8; 10]))))
        .collect();
    tokio::time::timeout(Duration::from_secs(5), async {
        while log.held_count() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("three frames in flight");

    // Acknowledge newest-first; the builder re-sequences before the tracker
    // sees anything.
    assert!(log.release_nth(2));
    assert!(log.release_nth(1));
    assert!(log.release_nth(0));

    let mut sequences = Vec::new();
    for future in futures {
        sequences.push(future.await.expect("append committed"));
    }
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    assert_eq!(sequences, sorted, "completions follow sequence order");
    assert_eq!(processor.metadata().segment(1).expect("segment").length, 30);

    processor.stop();
    processor.await_terminated().await.expect("clean stop");
}

#[tokio::test]
async fn file_log_round_trips_committed_operations() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("container-0.log");

    let appended: &[&[u8]] = &[b"alpha", b"beta", b"gamma"];
    {
        let log = Arc::new(FileLog::open(&path, true).expect("open log"));
        let processor = OperationProcessor::spawn(
            ProcessorConfig::default(),
            ContainerMetadata::new(),
            log,
            Box::new(NullStateUpdater),
            Arc::new(NoCheckpointPolicy),
        );
        processor
            .process(Operation::map(1, "s", 0, false))
            .await
            .expect("map committed");
        for payload in appended {
            processor
                .process(Operation::append(1, Bytes::from_static(payload)))
                .await
                .expect("append committed");
        }
        assert_eq!(processor.metadata().segment(1).expect("segment").length, 14);
        processor.stop();
        processor.await_terminated().await.expect("clean stop");
    }

    // A fresh reader sees every record the processor wrote.
    let reader = FileLog::open(&path, true).expect("reopen log");
    let mut decoded = Vec::new();
    let mut partial: Vec<u8> = Vec::new();
    for (_, frame) in reader.records().expect("read records") {
        for chunk in read_chunks(&frame).expect("parse frame") {
            if chunk.first {
                partial.clear();
            }
            partial.extend_from_slice(&chunk.payload);
            if chunk.last {
                decoded.push(Operation::decode(&partial).expect("decode"));
            }
        }
    }
    let payloads: Vec<Vec<u8>> = decoded
        .iter()
        .filter_map(|op| match op.body() {
            OperationBody::SegmentAppend { data, .. } => Some(data.to_vec()),
            _ => None,
        })
        .collect();
    assert_eq!(
        payloads,
        appended.iter().map(|p| p.to_vec()).collect::<Vec<_>>()
    );
}
