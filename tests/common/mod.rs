//! Shared fixtures for the integration/e2e suite: a disposable on-disk store and a
//! couple of sample entities. Kept in one place so each scenario file stays focused on
//! the behaviour it's actually exercising rather than re-deriving test data.

use std::path::PathBuf;
use visionops::model::{CameraSpec, Detection};

/// Opens a `LocalStore` backed by a fresh file inside a `tempfile` directory. The
/// directory is returned alongside the store so it isn't dropped (and deleted) out
/// from under the open sqlite connection while the test is still running.
pub fn temp_store() -> (tempfile::TempDir, visionops::store::LocalStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path: PathBuf = dir.path().join("agent.db");
    let store = visionops::store::LocalStore::open(&path).expect("open store");
    (dir, store)
}

pub fn sample_camera(id: &str) -> CameraSpec {
    CameraSpec {
        id: id.to_string(),
        url: format!("rtsp://127.0.0.1/{id}"),
        credential_ref: None,
        enabled: true,
        zones: Vec::new(),
    }
}

pub fn sample_detection(camera_id: &str) -> Detection {
    Detection {
        camera_id: camera_id.to_string(),
        class_label: "person".into(),
        confidence: 0.87,
        x: 10,
        y: 10,
        w: 20,
        h: 40,
        zone_label: None,
        captured_at: chrono::Utc::now(),
        processing_latency_ms: 12,
    }
}
