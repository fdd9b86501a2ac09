//! # Scheduler
//!
//! A single cooperative round-robin loop over enabled cameras. Each camera has a nominal
//! capture interval (scaled by the governor's current throttle level) and a longer
//! keyframe cadence; the scheduler tracks per-camera next-due times and, each tick,
//! dispatches whichever cameras are due — capture dispatch is a cheap ring-buffer pop,
//! so one loop iteration handling several due cameras back-to-back does not starve
//! later cameras the way a blocking per-camera thread would.
//!
//! Frames are purged for staleness immediately before dispatch rather than on a separate
//! timer, so "dispatch a fresh frame" and "drop a stale one" can never race each other.

use crate::core::ring_buffer::RingBuffer;
use crate::governor::Governor;
use crate::model::Frame;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

pub struct DueFrame {
    pub camera_id: String,
    pub frame: Frame,
    pub is_keyframe_tick: bool,
}

struct CameraCursor {
    ring: Arc<RingBuffer>,
    next_capture_due: Instant,
    next_keyframe_due: Instant,
}

pub struct Scheduler {
    cameras: HashMap<String, CameraCursor>,
    /// Registration order, highest-priority first. The last entry is dropped under
    /// `Hot` ("reduce active camera count by one, lowest-priority first").
    camera_priority: Vec<String>,
    nominal_interval: Duration,
    keyframe_interval: Duration,
    governor: Arc<Governor>,
    out: mpsc::Sender<DueFrame>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        rings: HashMap<String, Arc<RingBuffer>>,
        camera_priority: Vec<String>,
        nominal_interval: Duration,
        keyframe_interval: Duration,
        governor: Arc<Governor>,
        out: mpsc::Sender<DueFrame>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let now = Instant::now();
        let cameras = rings
            .into_iter()
            .map(|(id, ring)| {
                (
                    id,
                    CameraCursor {
                        ring,
                        next_capture_due: now,
                        next_keyframe_due: now,
                    },
                )
            })
            .collect();

        Self {
            cameras,
            camera_priority,
            nominal_interval,
            keyframe_interval,
            governor,
            out,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                return;
            }

            self.tick();

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One dispatch pass: purge stale frames, then dispatch every camera whose
    /// capture interval has elapsed. At `Critical` no camera is dispatched at all
    /// ("stop accepting new frames"); at `Hot` the lowest-priority enabled camera is
    /// skipped ("reduce active camera count by one").
    fn tick(&mut self) {
        let now = Instant::now();

        for cursor in self.cameras.values_mut() {
            cursor.ring.purge_stale();
        }

        if !self.governor.accepting_new_frames() {
            return;
        }

        let multiplier = self.governor.interval_multiplier();
        let effective_interval = self.nominal_interval.mul_f64(multiplier);

        let mut ids: Vec<String> = self
            .camera_priority
            .iter()
            .filter(|id| self.cameras.contains_key(*id))
            .cloned()
            .collect();
        for id in self.cameras.keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }

        if self.governor.should_drop_lowest_priority_camera() {
            ids.pop();
        }

        for id in ids {
            let cursor = self.cameras.get_mut(&id).expect("id from own keys");

            if now < cursor.next_capture_due {
                continue;
            }
            cursor.next_capture_due = now + effective_interval;

            let Some(frame) = cursor.ring.pop_front() else {
                continue;
            };

            let is_keyframe_tick = now >= cursor.next_keyframe_due;
            if is_keyframe_tick {
                cursor.next_keyframe_due = now + self.keyframe_interval;
            }

            let due = DueFrame {
                camera_id: id.clone(),
                frame,
                is_keyframe_tick,
            };
            if self.out.try_send(due).is_err() {
                log::warn!("camera {id}: inference dispatch queue full, dropping this tick's frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::core::buffer_pool::BufferPool;
    use crate::model::ThrottleLevel;

    fn governor() -> Arc<Governor> {
        let (g, _rx) = Governor::new(AgentConfig::default(), Arc::new(BufferPool::new(1024)));
        Arc::new(g)
    }

    #[tokio::test]
    async fn tick_dispatches_due_camera_with_pending_frame() {
        let ring = Arc::new(RingBuffer::new(30, Duration::from_secs(10)));
        ring.push(Frame::new("cam-1", 1, 1, vec![0u8; 16]));

        let mut rings = HashMap::new();
        rings.insert("cam-1".to_string(), ring);

        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut scheduler = Scheduler::new(
            rings,
            vec!["cam-1".to_string()],
            Duration::from_millis(1),
            Duration::from_secs(10),
            governor(),
            tx,
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        scheduler.tick();

        let due = rx.try_recv().expect("a due frame should have been dispatched");
        assert_eq!(due.camera_id, "cam-1");
        assert!(due.is_keyframe_tick, "first tick should also be a keyframe tick");
    }

    #[tokio::test]
    async fn hot_level_skips_lowest_priority_camera() {
        let ring_a = Arc::new(RingBuffer::new(30, Duration::from_secs(10)));
        let ring_b = Arc::new(RingBuffer::new(30, Duration::from_secs(10)));
        ring_a.push(Frame::new("cam-a", 1, 1, vec![0u8; 16]));
        ring_b.push(Frame::new("cam-b", 1, 2, vec![0u8; 16]));

        let mut rings = HashMap::new();
        rings.insert("cam-a".to_string(), ring_a);
        rings.insert("cam-b".to_string(), ring_b);

        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let governor = governor();
        governor.set_level_for_test(ThrottleLevel::Hot);

        let mut scheduler = Scheduler::new(
            rings,
            vec!["cam-a".to_string(), "cam-b".to_string()],
            Duration::from_millis(1),
            Duration::from_secs(10),
            governor,
            tx,
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        scheduler.tick();

        let due = rx.try_recv().expect("the higher-priority camera should still dispatch");
        assert_eq!(due.camera_id, "cam-a");
        assert!(rx.try_recv().is_err(), "the lowest-priority camera should have been skipped");
    }

    #[tokio::test]
    async fn critical_level_dispatches_nothing() {
        let ring = Arc::new(RingBuffer::new(30, Duration::from_secs(10)));
        ring.push(Frame::new("cam-1", 1, 1, vec![0u8; 16]));

        let mut rings = HashMap::new();
        rings.insert("cam-1".to_string(), ring);

        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let governor = governor();
        governor.set_level_for_test(ThrottleLevel::Critical);

        let mut scheduler = Scheduler::new(
            rings,
            vec!["cam-1".to_string()],
            Duration::from_millis(1),
            Duration::from_secs(10),
            governor,
            tx,
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        scheduler.tick();

        assert!(rx.try_recv().is_err(), "critical level must not dispatch any camera");
    }
}
