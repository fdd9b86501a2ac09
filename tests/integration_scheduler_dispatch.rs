//! Runs the scheduler's real dispatch loop (`Scheduler::run`, not the private `tick`)
//! against live ring buffers to confirm frames actually flow end to end: capture fills
//! a ring, the scheduler drains it on its own timer, and shutdown is observed promptly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use visionops::config::AgentConfig;
use visionops::core::buffer_pool::BufferPool;
use visionops::core::ring_buffer::RingBuffer;
use visionops::governor::Governor;
use visionops::model::Frame;
use visionops::scheduler::Scheduler;

#[tokio::test]
async fn scheduler_dispatches_queued_frames_for_every_registered_camera() {
    let ring_a = Arc::new(RingBuffer::new(30, Duration::from_secs(10)));
    let ring_b = Arc::new(RingBuffer::new(30, Duration::from_secs(10)));
    ring_a.push(Frame::new("cam-a", 1, 1, vec![0u8; 16]));
    ring_b.push(Frame::new("cam-b", 1, 2, vec![0u8; 16]));

    let mut rings = HashMap::new();
    rings.insert("cam-a".to_string(), ring_a);
    rings.insert("cam-b".to_string(), ring_b);

    let (out_tx, mut out_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (governor, _state_rx) = Governor::new(AgentConfig::default(), Arc::new(BufferPool::new(1024)));

    let scheduler = Scheduler::new(
        rings,
        vec!["cam-a".to_string(), "cam-b".to_string()],
        Duration::from_millis(5),
        Duration::from_secs(60),
        Arc::new(governor),
        out_tx,
        shutdown_rx,
    );
    let handle = tokio::spawn(scheduler.run());

    let first = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
        .await
        .expect("scheduler should dispatch within the timeout")
        .expect("channel should stay open while the scheduler runs");
    assert!(first.is_keyframe_tick, "a camera's very first dispatch is always a keyframe tick");

    let second = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
        .await
        .expect("scheduler should dispatch the second camera too")
        .expect("channel should stay open while the scheduler runs");
    assert_ne!(first.camera_id, second.camera_id, "both registered cameras should get a turn");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("scheduler should exit promptly once shutdown is signalled")
        .unwrap();
}

#[tokio::test]
async fn stale_frames_are_purged_before_a_late_scheduler_would_dispatch_them() {
    let ring = Arc::new(RingBuffer::new(30, Duration::from_millis(20)));
    ring.push(Frame::new("cam-a", 1, 1, vec![0u8; 16]));

    // The frame is already older than `stale_after` by the time the scheduler takes
    // its first tick, so purging must win the race against dispatch every time,
    // not just when the executor happens to schedule the spawned task slowly.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut rings = HashMap::new();
    rings.insert("cam-a".to_string(), ring.clone());

    let (out_tx, mut out_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (governor, _state_rx) = Governor::new(AgentConfig::default(), Arc::new(BufferPool::new(1024)));

    let scheduler = Scheduler::new(
        rings,
        vec!["cam-a".to_string()],
        Duration::from_millis(5),
        Duration::from_secs(60),
        Arc::new(governor),
        out_tx,
        shutdown_rx,
    );
    let handle = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    assert!(out_rx.try_recv().is_err(), "a frame older than stale_after must never reach dispatch");
}
