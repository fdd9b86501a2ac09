//! # Buffer Pool
//!
//! A capacity-bounded pool of reusable byte buffers shared by capture workers and the
//! inference engine. Buffers are rented and returned explicitly rather than wrapped in
//! a `Drop` guard: the ownership hand-off between a capture worker and the inference
//! engine already has a clear single point where a frame's buffer becomes unreachable,
//! and an explicit `return_buffer` keeps that point visible in the code that does it.
//!
//! ## Budget enforcement
//!
//! The pool tracks total bytes currently rented out, not just buffers sitting idle in
//! the free list. `rent` fails with [`VisionOpsError::Exhaustion`] rather than blocking
//! or allocating past `cap_bytes` — callers are expected to treat that as backpressure
//! (drop the oldest frame, skip this capture tick) rather than retry in a loop.
//!
//! ## Leak detection
//!
//! Every successful rent is stamped with the time it was handed out. `check_leaks`
//! (polled by the governor on its sampling interval) counts buffers that have been
//! outstanding for over an hour; more than ten such buffers is reported as a suspected
//! leak so an operator can correlate it with a capture worker stuck mid-restart.

use crate::error::VisionOpsError;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const LEAK_AGE_THRESHOLD: Duration = Duration::from_secs(60 * 60);
const LEAK_COUNT_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolStats {
    pub free_buffers: usize,
    pub outstanding_buffers: usize,
    pub outstanding_bytes: usize,
    pub cap_bytes: usize,
}

#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<VecDeque<Vec<u8>>>,
    rented: Mutex<HashMap<u64, Instant>>,
    outstanding_bytes: AtomicUsize,
    outstanding_buffers: AtomicUsize,
    next_id: AtomicU64,
    cap_bytes: usize,
}

impl BufferPool {
    pub fn new(cap_bytes: usize) -> Self {
        Self {
            free: Mutex::new(VecDeque::new()),
            rented: Mutex::new(HashMap::new()),
            outstanding_bytes: AtomicUsize::new(0),
            outstanding_buffers: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            cap_bytes,
        }
    }

    /// Rents a zeroed buffer of exactly `size` bytes, reusing a free buffer with enough
    /// capacity when one is available. Returns an opaque id that must accompany the
    /// later `return_buffer` call.
    pub fn rent(&self, size: usize) -> Result<(u64, Vec<u8>), VisionOpsError> {
        let projected = self.outstanding_bytes.load(Ordering::Relaxed) + size;
        if projected > self.cap_bytes {
            return Err(VisionOpsError::exhaustion(
                "buffer_pool",
                format!("rent({size}) would exceed cap of {} bytes", self.cap_bytes),
            ));
        }

        let mut buffer = {
            let mut free = self.free.lock().unwrap();
            match free.iter().position(|b| b.capacity() >= size) {
                Some(idx) => free.remove(idx).unwrap(),
                None => Vec::with_capacity(size),
            }
        };
        buffer.clear();
        buffer.resize(size, 0);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.rented.lock().unwrap().insert(id, Instant::now());
        self.outstanding_bytes.fetch_add(size, Ordering::Relaxed);
        self.outstanding_buffers.fetch_add(1, Ordering::Relaxed);
        Ok((id, buffer))
    }

    /// Returns a previously rented buffer. Unknown ids are ignored rather than panicking:
    /// a double-return after a force_compact should not take down the caller.
    pub fn return_buffer(&self, id: u64, mut buffer: Vec<u8>) {
        let Some(_) = self.rented.lock().unwrap().remove(&id) else {
            return;
        };
        self.outstanding_bytes.fetch_sub(buffer.len(), Ordering::Relaxed);
        self.outstanding_buffers.fetch_sub(1, Ordering::Relaxed);

        buffer.fill(0);
        self.free.lock().unwrap().push_back(buffer);
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            free_buffers: self.free.lock().unwrap().len(),
            outstanding_buffers: self.outstanding_buffers.load(Ordering::Relaxed),
            outstanding_bytes: self.outstanding_bytes.load(Ordering::Relaxed),
            cap_bytes: self.cap_bytes,
        }
    }

    /// Drops every idle buffer, freeing their memory immediately. Called by the governor
    /// when it enters the `Hot` throttle level.
    pub fn force_compact(&self) {
        self.free.lock().unwrap().clear();
    }

    /// Counts buffers outstanding for more than an hour. `Some(count)` past the
    /// threshold signals a suspected leak; `None` otherwise.
    pub fn check_leaks(&self) -> Option<usize> {
        let now = Instant::now();
        let count = self
            .rented
            .lock()
            .unwrap()
            .values()
            .filter(|&&rented_at| now.duration_since(rented_at) > LEAK_AGE_THRESHOLD)
            .count();
        (count > LEAK_COUNT_THRESHOLD).then_some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_and_return_round_trip() {
        let pool = BufferPool::new(4096);
        let (id, buf) = pool.rent(1024).unwrap();
        assert_eq!(buf.len(), 1024);
        let stats = pool.stats();
        assert_eq!(stats.outstanding_buffers, 1);
        assert_eq!(stats.outstanding_bytes, 1024);

        pool.return_buffer(id, buf);
        let stats = pool.stats();
        assert_eq!(stats.outstanding_buffers, 0);
        assert_eq!(stats.free_buffers, 1);
    }

    #[test]
    fn rent_past_cap_is_exhaustion() {
        let pool = BufferPool::new(1024);
        let _first = pool.rent(1024).unwrap();
        let second = pool.rent(1);
        assert!(second.is_err());
    }

    #[test]
    fn force_compact_drops_idle_buffers() {
        let pool = BufferPool::new(4096);
        let (id, buf) = pool.rent(512).unwrap();
        pool.return_buffer(id, buf);
        assert_eq!(pool.stats().free_buffers, 1);
        pool.force_compact();
        assert_eq!(pool.stats().free_buffers, 0);
    }

    #[test]
    fn no_leak_reported_for_fresh_rentals() {
        let pool = BufferPool::new(4096);
        let _held = pool.rent(128).unwrap();
        assert_eq!(pool.check_leaks(), None);
    }
}
