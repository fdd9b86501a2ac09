//! Exercises the local store and replicator together against a real on-disk sqlite
//! file (no in-memory shortcut) and a fake transport standing in for the remote
//! datastore, the way a live deployment's drain loop would run end to end.

mod common;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use visionops::error::VisionOpsError;
use visionops::model::EntityKind;
use visionops::replicator::{Replicator, Transport};

struct RecordingTransport {
    received: Mutex<Vec<(EntityKind, serde_json::Value)>>,
}

impl RecordingTransport {
    fn new() -> Self {
        Self { received: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, kind: EntityKind, payload: &serde_json::Value) -> Result<(), VisionOpsError> {
        self.received.lock().unwrap().push((kind, payload.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn camera_registration_and_detection_both_drain_to_their_endpoints() {
    let (_dir, store) = common::temp_store();
    let store = Arc::new(store);

    store.enqueue_camera_spec(&common::sample_camera("cam-1")).unwrap();
    store.insert_detection(&common::sample_detection("cam-1"), 1).unwrap();

    let transport = Arc::new(RecordingTransport::new());
    let replicator = Replicator::new(store.clone(), Box::new(DelegatingTransport(transport.clone())), 10, 300, 5);

    let acked = replicator.drain_once().await.unwrap();
    assert_eq!(acked, 2, "both the camera registration and the detection should have been sent");

    let received = transport.received.lock().unwrap();
    assert!(received.iter().any(|(kind, _)| *kind == EntityKind::CameraSpec));
    assert!(received.iter().any(|(kind, _)| *kind == EntityKind::Detection));
    assert_eq!(store.dead_letter_count().unwrap(), 0);
}

#[tokio::test]
async fn reregistering_the_same_camera_does_not_produce_duplicate_replication_rows() {
    let (_dir, store) = common::temp_store();
    let camera = common::sample_camera("cam-1");
    store.enqueue_camera_spec(&camera).unwrap();
    store.enqueue_camera_spec(&camera).unwrap();
    store.enqueue_camera_spec(&camera).unwrap();

    let batch = store.lease_batch(EntityKind::CameraSpec, 10, 300).unwrap();
    assert_eq!(batch.len(), 1, "repeated startup registration must collapse to one queued row");
}

#[tokio::test]
async fn failed_delivery_is_retried_then_dead_lettered_past_max_attempts() {
    let (_dir, store) = common::temp_store();
    let store = Arc::new(store);
    store.insert_detection(&common::sample_detection("cam-1"), 1).unwrap();

    struct AlwaysFail;
    #[async_trait]
    impl Transport for AlwaysFail {
        async fn send(&self, _kind: EntityKind, _payload: &serde_json::Value) -> Result<(), VisionOpsError> {
            Err(VisionOpsError::transient_io("test", "simulated endpoint outage"))
        }
    }

    let replicator = Replicator::new(store.clone(), Box::new(AlwaysFail), 10, 0, 1);
    let acked = replicator.drain_once().await.unwrap();
    assert_eq!(acked, 0);
    assert_eq!(store.dead_letter_count().unwrap(), 1, "a single allowed attempt should exhaust max_attempts immediately");
}

/// `Arc<dyn Transport>` doesn't itself implement `Transport`, so `Replicator::new`
/// (which takes ownership of a `Box<dyn Transport>`) gets this thin forwarding wrapper
/// instead of the shared `Arc` the test also wants to inspect afterwards.
struct DelegatingTransport(Arc<RecordingTransport>);

#[async_trait]
impl Transport for DelegatingTransport {
    async fn send(&self, kind: EntityKind, payload: &serde_json::Value) -> Result<(), VisionOpsError> {
        self.0.send(kind, payload).await
    }
}
