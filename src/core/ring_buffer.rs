//! # Ring Buffer
//!
//! A bounded per-camera FIFO of decoded [`Frame`](crate::model::Frame)s sitting between
//! a capture worker and the scheduler that dispatches frames to inference. Capacity
//! defaults to 30 live frames, matching the live-frame ceiling named in the data model.
//!
//! Two independent eviction paths keep the buffer bounded even if a camera captures
//! faster than the scheduler drains it, or slower than real time:
//!
//! - **Overflow eviction**: pushing past capacity drops the oldest frame.
//! - **Age eviction**: `purge_stale` drops frames older than the configured staleness
//!   threshold regardless of capacity, so a scheduler outage doesn't let frames sit
//!   indefinitely waiting to be dispatched to an inference engine already running behind.
//!
//! Both paths return the evicted frames rather than dropping them silently in place, so
//! the caller can return their buffers to the [`BufferPool`](super::buffer_pool::BufferPool).

use crate::model::Frame;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct RingBuffer {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    stale_after: Duration,
    drop_count: AtomicU64,
}

impl RingBuffer {
    pub fn new(capacity: usize, stale_after: Duration) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            stale_after,
            drop_count: AtomicU64::new(0),
        }
    }

    /// Pushes a newly captured frame, evicting the oldest frame if the buffer is full.
    pub fn push(&self, frame: Frame) -> Option<Frame> {
        let mut frames = self.frames.lock().unwrap();
        let evicted = if frames.len() >= self.capacity {
            let evicted = frames.pop_front();
            self.drop_count.fetch_add(1, Ordering::Relaxed);
            evicted
        } else {
            None
        };
        frames.push_back(frame);
        evicted
    }

    /// Pops the oldest frame for dispatch to inference.
    pub fn pop_front(&self) -> Option<Frame> {
        self.frames.lock().unwrap().pop_front()
    }

    /// Removes every frame older than the staleness threshold, oldest first, and returns
    /// them for buffer reclamation. Called by the scheduler immediately before dispatch
    /// so age-dropped frames never reach the inference engine.
    pub fn purge_stale(&self) -> Vec<Frame> {
        let mut frames = self.frames.lock().unwrap();
        let mut evicted = Vec::new();
        while let Some(front) = frames.front() {
            if front.age() > self.stale_after {
                evicted.push(frames.pop_front().unwrap());
            } else {
                break;
            }
        }
        self.drop_count.fetch_add(evicted.len() as u64, Ordering::Relaxed);
        evicted
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drop_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }
}
