//! # Capture Worker
//!
//! Drives one camera's external decoder process (expected to write raw, fixed-size BGR
//! frames to stdout — an `ffmpeg -f rawvideo` style pipeline) and feeds decoded frames
//! into that camera's ring buffer. The worker is a small state machine:
//!
//! ```text
//! Idle -> Starting -> Streaming -> Stalled -> Restarting -> Starting ...
//!                                                        -> Failed (terminal)
//! ```
//!
//! `Stalled` covers both a dead stdout pipe (EOF before shutdown was requested) and a
//! decoder process whose memory has grown past the kill threshold. Both are treated the
//! same way: the child is killed, the worker waits out a backoff, and restarts. After
//! [`MAX_CONSECUTIVE_FAILURES`] restarts in a row without a single successful frame, the
//! worker gives up and reports `Failed` — the Lifecycle Supervisor decides what to do
//! with a permanently failed camera, the worker does not retry forever on its own.

use crate::core::buffer_pool::BufferPool;
use crate::core::ring_buffer::RingBuffer;
use crate::error::VisionOpsError;
use crate::model::{CameraSpec, Frame, FRAME_BYTES, FRAME_HEIGHT, FRAME_WIDTH};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;

const RSS_KILL_THRESHOLD_MB: u64 = 500;
const RSS_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    Idle = 0,
    Starting = 1,
    Streaming = 2,
    Stalled = 3,
    Restarting = 4,
    Failed = 5,
}

impl CaptureState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Streaming,
            3 => Self::Stalled,
            4 => Self::Restarting,
            _ => Self::Failed,
        }
    }
}

pub struct CaptureWorker {
    camera: CameraSpec,
    ring: Arc<RingBuffer>,
    pool: Arc<BufferPool>,
    state: Arc<AtomicU8>,
    sequence: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl CaptureWorker {
    pub fn new(camera: CameraSpec, ring: Arc<RingBuffer>, pool: Arc<BufferPool>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            camera,
            ring,
            pool,
            state: Arc::new(AtomicU8::new(CaptureState::Idle as u8)),
            sequence: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, s: CaptureState) {
        self.state.store(s as u8, Ordering::Relaxed);
    }

    /// Runs until shutdown is signalled or the worker gives up after repeated failures.
    pub async fn run(mut self) {
        let mut consecutive_failures: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                self.set_state(CaptureState::Idle);
                return;
            }

            self.set_state(CaptureState::Starting);
            match self.spawn_decoder() {
                Ok(mut child) => {
                    self.set_state(CaptureState::Streaming);
                    let outcome = self.stream_until_stalled(&mut child).await;
                    let _ = Self::terminate_gracefully(&mut child).await;
                    match outcome {
                        StreamOutcome::Shutdown => {
                            self.set_state(CaptureState::Idle);
                            return;
                        }
                        StreamOutcome::FramesDelivered => {
                            consecutive_failures = 0;
                        }
                        StreamOutcome::Stalled(reason) => {
                            log::warn!("camera {}: stream stalled: {reason}", self.camera.id);
                            consecutive_failures += 1;
                        }
                    }
                }
                Err(e) => {
                    log::error!("camera {}: failed to start decoder: {e}", self.camera.id);
                    consecutive_failures += 1;
                }
            }

            if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                self.set_state(CaptureState::Failed);
                log::error!(
                    "camera {}: giving up after {consecutive_failures} consecutive failures",
                    self.camera.id
                );
                return;
            }

            self.set_state(CaptureState::Restarting);
            let backoff = (BACKOFF_BASE * 2u32.saturating_pow(consecutive_failures.min(8))).min(BACKOFF_CAP);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        self.set_state(CaptureState::Idle);
                        return;
                    }
                }
            }
        }
    }

    fn spawn_decoder(&self) -> Result<Child, VisionOpsError> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-loglevel", "warning",
                "-rtsp_transport", "tcp",
                "-i", &self.camera.url,
                "-r", "1/3",
                "-f", "rawvideo",
                "-pix_fmt", "bgr24",
                "-s", &format!("{FRAME_WIDTH}x{FRAME_HEIGHT}"),
                "-threads", "1",
                "-",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VisionOpsError::transient_io("capture_spawn", e.to_string()))?;

        // Lower scheduling priority so a decoder hogging CPU can't starve the rest of
        // the agent; CPU-affinity pinning is left to the host's process manager since
        // it would otherwise have to track core topology per device.
        if let Some(pid) = child.id() {
            // SAFETY: pid is the freshly-spawned child's own pid, valid for this call.
            unsafe {
                libc::setpriority(libc::PRIO_PROCESS, pid, 10);
            }
        }

        Ok(child)
    }

    async fn stream_until_stalled(&mut self, child: &mut Child) -> StreamOutcome {
        let mut stdout = match child.stdout.take() {
            Some(s) => s,
            None => return StreamOutcome::Stalled("decoder has no stdout pipe".into()),
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(self.camera.id.clone(), stderr));
        }

        let pid = child.id();
        let mut last_rss_check = tokio::time::Instant::now();
        let mut delivered_any = false;

        loop {
            if *self.shutdown.borrow() {
                return StreamOutcome::Shutdown;
            }

            if last_rss_check.elapsed() >= RSS_SAMPLE_INTERVAL {
                last_rss_check = tokio::time::Instant::now();
                if let Some(pid) = pid {
                    if let Some(rss_mb) = read_rss_mb(pid) {
                        if rss_mb > RSS_KILL_THRESHOLD_MB {
                            return StreamOutcome::Stalled(format!(
                                "decoder RSS {rss_mb}MB exceeds {RSS_KILL_THRESHOLD_MB}MB"
                            ));
                        }
                    }
                }
            }

            let (id, mut buffer) = match self.pool.rent(FRAME_BYTES) {
                Ok(v) => v,
                Err(e) => return StreamOutcome::Stalled(format!("buffer pool: {e}")),
            };

            let read = tokio::select! {
                r = stdout.read_exact(&mut buffer) => r,
                _ = tokio::time::sleep(STALL_TIMEOUT) => {
                    self.pool.return_buffer(id, buffer);
                    return StreamOutcome::Stalled("no frame within 30s".into());
                }
                _ = self.shutdown.changed() => {
                    self.pool.return_buffer(id, buffer);
                    return StreamOutcome::Shutdown;
                }
            };

            match read {
                Ok(_) => {
                    delivered_any = true;
                    let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                    let frame = Frame::new(self.camera.id.clone(), sequence, id, buffer);
                    if let Some(mut evicted) = self.ring.push(frame) {
                        let evicted_id = evicted.buffer_id();
                        if let Some(bytes) = evicted.take_buffer() {
                            self.pool.return_buffer(evicted_id, bytes);
                        }
                    }
                }
                Err(e) => {
                    self.pool.return_buffer(id, buffer);
                    return if delivered_any {
                        StreamOutcome::FramesDelivered
                    } else {
                        StreamOutcome::Stalled(format!("read_exact failed: {e}"))
                    };
                }
            }
        }
    }

    async fn terminate_gracefully(child: &mut Child) -> std::io::Result<()> {
        if let Some(pid) = child.id() {
            // SAFETY: pid is a valid process id owned by this tokio::process::Child.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        tokio::select! {
            status = child.wait() => { status.map(|_| ()) }
            _ = tokio::time::sleep(STOP_GRACE_PERIOD) => {
                child.start_kill()?;
                child.wait().await.map(|_| ())
            }
        }
    }
}

enum StreamOutcome {
    Shutdown,
    FramesDelivered,
    Stalled(String),
}

async fn drain_stderr(camera_id: String, stderr: impl tokio::io::AsyncRead + Unpin) {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.to_lowercase().contains("error") {
            log::warn!("camera {camera_id} decoder: {line}");
        } else {
            log::debug!("camera {camera_id} decoder: {line}");
        }
    }
}

/// Reads VmRSS from /proc/<pid>/status. Returns None off Linux or if the process has exited.
fn read_rss_mb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for s in [
            CaptureState::Idle,
            CaptureState::Starting,
            CaptureState::Streaming,
            CaptureState::Stalled,
            CaptureState::Restarting,
            CaptureState::Failed,
        ] {
            assert_eq!(CaptureState::from_u8(s as u8), s);
        }
    }

    #[test]
    fn read_rss_mb_returns_none_for_nonexistent_pid() {
        assert_eq!(read_rss_mb(u32::MAX), None);
    }
}
