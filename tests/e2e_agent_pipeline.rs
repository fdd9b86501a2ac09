//! Drives a frame through every stage the real agent's consumer task would: a capture
//! source fills a camera's ring buffer, the scheduler hands a due frame to the
//! inference engine, detections are aggregated into a windowed metric, and both the
//! metric and the underlying detection land in the local store ready for replication.
//! No ffmpeg process is involved — frames are injected directly, standing in for a
//! capture worker the way a fake capture source would in a unit test.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use visionops::aggregator::{AggregatorConfig, CameraAggregator};
use visionops::config::AgentConfig;
use visionops::core::buffer_pool::BufferPool;
use visionops::core::ring_buffer::RingBuffer;
use visionops::governor::Governor;
use visionops::inference::reference::{ReferenceCaptioner, ReferenceDetector};
use visionops::inference::InferenceEngine;
use visionops::model::{Frame, FRAME_HEIGHT, FRAME_WIDTH};
use visionops::scheduler::Scheduler;

/// A fake capture source: pushes a fixed number of frames into a camera's ring buffer
/// on a timer, the way a `CaptureWorker` reading ffmpeg's stdout would, without
/// spawning a real decoder process.
async fn fake_capture_source(ring: Arc<RingBuffer>, camera_id: &str, frame_count: u64) {
    for seq in 0..frame_count {
        let pixel = (seq % 256) as u8;
        let bytes = vec![pixel; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize];
        ring.push(Frame::new(camera_id, seq, seq, bytes));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn a_captured_frame_flows_through_inference_and_lands_in_the_local_store() {
    let (_dir, store) = common::temp_store();
    let store = Arc::new(store);
    store.enqueue_camera_spec(&common::sample_camera("cam-1")).unwrap();

    let ring = Arc::new(RingBuffer::new(30, Duration::from_secs(30)));
    let mut rings = HashMap::new();
    rings.insert("cam-1".to_string(), ring.clone());

    let (due_tx, mut due_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (governor, _state_rx) = Governor::new(AgentConfig::default(), Arc::new(BufferPool::new(64 * 1024 * 1024)));
    let governor = Arc::new(governor);

    let scheduler = Scheduler::new(
        rings,
        vec!["cam-1".to_string()],
        Duration::from_millis(5),
        Duration::from_secs(60),
        governor.clone(),
        due_tx,
        shutdown_rx,
    );
    let scheduler_handle = tokio::spawn(scheduler.run());
    let capture_handle = tokio::spawn(fake_capture_source(ring, "cam-1", 5));

    let engine = InferenceEngine::new(
        Box::new(ReferenceDetector::with_fixed_labels()),
        Box::new(ReferenceCaptioner::with_fixed_vocab()),
    )
    .unwrap();

    let mut aggregator = CameraAggregator::new("cam-1", AggregatorConfig { window_seconds: 60, grace_seconds: 60 });
    let mut detections_seen = 0usize;

    for _ in 0..5 {
        let due = tokio::time::timeout(Duration::from_secs(2), due_rx.recv())
            .await
            .expect("a due frame should arrive for every captured frame")
            .expect("channel should stay open");

        let detection_set = engine.detect(&due.frame).unwrap();
        for d in &detection_set.detections {
            store.insert_detection(d, detection_set.sequence).unwrap();
            for metric in aggregator.absorb(d, detection_set.captured_at) {
                store.insert_windowed_metric(&metric).unwrap();
            }
            detections_seen += 1;
        }
    }

    assert!(detections_seen > 0, "the reference detector should produce at least one detection per frame");

    shutdown_tx.send(true).unwrap();
    scheduler_handle.await.unwrap();
    capture_handle.await.unwrap();

    let leased = store
        .lease_batch(visionops::model::EntityKind::Detection, 100, 300)
        .unwrap();
    assert_eq!(leased.len(), detections_seen, "every inserted detection must be queued for replication");
}

#[tokio::test]
async fn keyframe_caption_stays_within_the_hard_byte_ceiling_across_several_frames() {
    let engine = InferenceEngine::new(
        Box::new(ReferenceDetector::with_fixed_labels()),
        Box::new(ReferenceCaptioner::with_fixed_vocab()),
    )
    .unwrap();
    let camera = common::sample_camera("cam-1");

    for seq in 0..3u64 {
        let bytes = vec![(seq * 40) as u8; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize];
        let frame = Frame::new("cam-1", seq, seq, bytes);
        let detection_set = engine.detect(&frame).unwrap();
        let key_frame = engine.caption(&camera, &frame, &detection_set.detections).unwrap();
        assert!(key_frame.image_bytes.len() <= visionops::model::KEYFRAME_HARD_CEILING_BYTES);
    }
}
