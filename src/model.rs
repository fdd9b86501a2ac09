//! Core entities shared across components, per the data model.
//!
//! Types here are plain data; ownership rules (who may mutate or drop a `Frame`'s buffer,
//! how `QueueItem` leases work) live in the components that hold them, not in the types
//! themselves.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A registered camera. Immutable after registration except via explicit reconfigure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSpec {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub credential_ref: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub zones: Vec<ZonePolygon>,
}

fn default_true() -> bool {
    true
}

/// A named polygon used to assign detections to a zone label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZonePolygon {
    pub label: String,
    /// (x, y) vertices in frame coordinates (0..640, 0..480).
    pub vertices: Vec<(i32, i32)>,
}

impl ZonePolygon {
    /// Point-in-polygon test (ray casting) used to assign a detection centroid to a zone.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        let verts = &self.vertices;
        if verts.len() < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = verts.len() - 1;
        for i in 0..verts.len() {
            let (xi, yi) = verts[i];
            let (xj, yj) = verts[j];
            if (yi > y) != (yj > y) {
                let x_at_y = xi as f64 + (xj - xi) as f64 * (y - yi) as f64 / (yj - yi) as f64;
                if (x as f64) < x_at_y {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

/// Fixed pixel format after decode normalisation: 640x480 BGR, 3 bytes/pixel.
pub const FRAME_WIDTH: u32 = 640;
pub const FRAME_HEIGHT: u32 = 480;
pub const FRAME_BYTES: usize = (FRAME_WIDTH as usize) * (FRAME_HEIGHT as usize) * 3;

/// Maximum simultaneous live Frames for a single camera across the whole process.
pub const MAX_LIVE_FRAMES_PER_CAMERA: usize = 30;

/// Ephemeral decoded image unit. Owns exactly one pooled byte buffer (see `core::buffer_pool`).
///
/// `buffer` is `Some` from capture until the Inference Engine releases it back to the pool;
/// taking it (`Frame::take_buffer`) enforces the "exactly one live holder" invariant by
/// leaving `None` behind.
#[derive(Debug)]
pub struct Frame {
    pub camera_id: String,
    pub sequence: u64,
    pub captured_at_monotonic: Instant,
    pub captured_at_wall: chrono::DateTime<chrono::Utc>,
    pub width: u32,
    pub height: u32,
    buffer_id: u64,
    buffer: Option<Vec<u8>>,
}

impl Frame {
    /// `buffer_id` is the Buffer Pool's rental id for `buffer`, carried alongside it so
    /// whichever component eventually releases the frame can return the right rental
    /// record rather than guessing at one.
    pub fn new(camera_id: impl Into<String>, sequence: u64, buffer_id: u64, buffer: Vec<u8>) -> Self {
        Self {
            camera_id: camera_id.into(),
            sequence,
            captured_at_monotonic: Instant::now(),
            captured_at_wall: chrono::Utc::now(),
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            buffer_id,
            buffer: Some(buffer),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }

    pub fn buffer_id(&self) -> u64 {
        self.buffer_id
    }

    pub fn age(&self) -> std::time::Duration {
        self.captured_at_monotonic.elapsed()
    }

    /// Move the underlying buffer out, leaving the Frame emptied. The caller is now the
    /// sole owner and must return it to the Buffer Pool (using `buffer_id()`) when done.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.buffer.take()
    }
}

/// A single object detection, in fixed frame coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub camera_id: String,
    pub class_label: String,
    pub confidence: f32,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub zone_label: Option<String>,
    pub captured_at: chrono::DateTime<chrono::Utc>,
    pub processing_latency_ms: u32,
}

/// One detection set returned by `Inference Engine::detect`, preserving input order.
#[derive(Debug, Clone)]
pub struct DetectionSet {
    pub camera_id: String,
    pub sequence: u64,
    pub captured_at: chrono::DateTime<chrono::Utc>,
    pub detections: Vec<Detection>,
}

/// A rate-limited compressed-image + caption record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFrame {
    pub camera_id: String,
    pub captured_at: chrono::DateTime<chrono::Utc>,
    pub image_bytes: Vec<u8>,
    pub caption: String,
    pub class_counts: std::collections::BTreeMap<String, u32>,
    pub sequence: u64,
}

pub const KEYFRAME_TARGET_BYTES: usize = 4 * 1024;
pub const KEYFRAME_HARD_CEILING_BYTES: usize = 8 * 1024;
pub const CAPTION_MAX_CHARS: usize = 256;

/// Fixed-duration aggregate of per-frame detections for one (camera, window_start).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowedMetric {
    pub camera_id: String,
    pub window_start: chrono::DateTime<chrono::Utc>,
    pub window_seconds: u32,
    /// class -> (avg, max) count across samples in the window.
    pub class_counts_avg: std::collections::BTreeMap<String, f64>,
    pub class_counts_max: std::collections::BTreeMap<String, u32>,
    pub average_confidence: f32,
    pub sample_count: u32,
    pub zone_counts: std::collections::BTreeMap<String, u32>,
    pub latency_p50_ms: u32,
    pub latency_p95_ms: u32,
}

/// Kind of payload carried by a `QueueItem`. FIFO ordering is scoped to (kind, camera_id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Detection,
    KeyFrame,
    WindowedMetric,
    CameraSpec,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::KeyFrame => "key_frame",
            Self::WindowedMetric => "metric",
            Self::CameraSpec => "camera",
        }
    }

    /// The remote replication endpoint path for this kind, per the external interfaces.
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            Self::Detection => "/detections",
            Self::KeyFrame => "/key_frames",
            Self::WindowedMetric => "/metrics",
            Self::CameraSpec => "/cameras",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    InFlight,
    Acked,
    DeadLetter,
}

/// A persisted, retryable unit of outbound work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub kind: EntityKind,
    pub camera_id: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub enqueue_time: chrono::DateTime<chrono::Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: QueueStatus,
    pub lease_expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub const QUEUE_BATCH_SIZE: usize = 100;
pub const QUEUE_MAX_ATTEMPTS: u32 = 20;
pub const QUEUE_LEASE_SECONDS: i64 = 5 * 60;

/// Computes the stable idempotency key described in the Replicator component design:
/// derived from (kind, camera_id, natural_timestamp, sequence) so replays are safe.
pub fn idempotency_key(
    kind: EntityKind,
    camera_id: &str,
    natural_timestamp: chrono::DateTime<chrono::Utc>,
    sequence: u64,
) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(camera_id.as_bytes());
    hasher.update(b"|");
    hasher.update(natural_timestamp.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    hasher.update(b"|");
    hasher.update(sequence.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Thermal/memory throttle level, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThrottleLevel {
    Normal,
    Warm,
    Hot,
    Critical,
}

/// Snapshot of governor-observed signals, updated at least every 10s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorState {
    pub cpu_temp_celsius: f32,
    pub cpu_utilisation_pct: f32,
    pub working_set_mb: f64,
    pub growth_mb_per_hour: f64,
    pub level: ThrottleLevel,
}

impl Default for GovernorState {
    fn default() -> Self {
        Self {
            cpu_temp_celsius: 60.0,
            cpu_utilisation_pct: 0.0,
            working_set_mb: 0.0,
            growth_mb_per_hour: 0.0,
            level: ThrottleLevel::Normal,
        }
    }
}
