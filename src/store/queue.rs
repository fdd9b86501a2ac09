//! Typed read/write operations on the local store: inserting captured entities, and the
//! lease-based queue API the Replicator drains from.

use super::LocalStore;
use crate::error::VisionOpsError;
use crate::model::{
    idempotency_key, CameraSpec, Detection, EntityKind, KeyFrame, QueueItem, QueueStatus, WindowedMetric,
};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl LocalStore {
    /// Inserts a detection and enqueues it for replication in one transaction — a crash
    /// between the two writes would otherwise let a detection go unreplicated forever.
    pub fn insert_detection(&self, d: &Detection, sequence: u64) -> Result<(), VisionOpsError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO detections (camera_id, class_label, confidence, x, y, w, h, zone_label, captured_at, processing_latency_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    d.camera_id, d.class_label, d.confidence, d.x, d.y, d.w, d.h,
                    d.zone_label, d.captured_at.to_rfc3339(), d.processing_latency_ms,
                ],
            )?;
            enqueue(&tx, EntityKind::Detection, &d.camera_id, serde_json::to_value(d).unwrap_or_default(), d.captured_at, sequence)?;
            tx.commit()
        })
    }

    pub fn insert_key_frame(&self, k: &KeyFrame) -> Result<(), VisionOpsError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let class_counts_json = serde_json::to_string(&k.class_counts).unwrap_or_default();
            tx.execute(
                "INSERT INTO key_frames (camera_id, captured_at, image_bytes, caption, class_counts, sequence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![k.camera_id, k.captured_at.to_rfc3339(), k.image_bytes, k.caption, class_counts_json, k.sequence],
            )?;
            enqueue(&tx, EntityKind::KeyFrame, &k.camera_id, serde_json::json!({
                "camera_id": k.camera_id, "captured_at": k.captured_at, "caption": k.caption,
                "class_counts": k.class_counts, "image_base64": base64_encode(&k.image_bytes),
            }), k.captured_at, k.sequence)?;
            tx.commit()
        })
    }

    pub fn insert_windowed_metric(&self, m: &WindowedMetric) -> Result<(), VisionOpsError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO windowed_metrics
                 (camera_id, window_start, window_seconds, class_counts_avg, class_counts_max, average_confidence, sample_count, zone_counts, latency_p50_ms, latency_p95_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    m.camera_id, m.window_start.to_rfc3339(), m.window_seconds,
                    serde_json::to_string(&m.class_counts_avg).unwrap_or_default(),
                    serde_json::to_string(&m.class_counts_max).unwrap_or_default(),
                    m.average_confidence, m.sample_count,
                    serde_json::to_string(&m.zone_counts).unwrap_or_default(),
                    m.latency_p50_ms, m.latency_p95_ms,
                ],
            )?;
            let window_start_nanos = m.window_start.timestamp_nanos_opt().unwrap_or(0) as u64;
            enqueue(&tx, EntityKind::WindowedMetric, &m.camera_id, serde_json::to_value(m).unwrap_or_default(), m.window_start, window_start_nanos)?;
            tx.commit()
        })
    }

    /// Leases up to `batch_size` pending items of the given kind, oldest first, marking
    /// them `InFlight` with a lease that expires in `lease_seconds`. Items whose lease
    /// has already expired (a prior replicator crashed mid-send) are eligible again.
    pub fn lease_batch(&self, kind: EntityKind, batch_size: usize, lease_seconds: i64) -> Result<Vec<QueueItem>, VisionOpsError> {
        self.with_conn(|conn| {
            let now = Utc::now();
            let lease_until = now + chrono::Duration::seconds(lease_seconds);
            let tx = conn.unchecked_transaction()?;

            let ids: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM queue_items
                     WHERE kind = ?1
                       AND (status = 'pending' OR (status = 'in_flight' AND lease_expires_at < ?2))
                     ORDER BY id ASC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![kind.as_str(), now.to_rfc3339(), batch_size as i64], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let mut items = Vec::with_capacity(ids.len());
            for id in ids {
                tx.execute(
                    "UPDATE queue_items SET status = 'in_flight', lease_expires_at = ?1 WHERE id = ?2",
                    params![lease_until.to_rfc3339(), id],
                )?;
                items.push(fetch_item(&tx, id)?);
            }
            tx.commit()?;
            Ok(items)
        })
    }

    pub fn ack(&self, id: i64) -> Result<(), VisionOpsError> {
        self.with_conn(|conn| {
            conn.execute("UPDATE queue_items SET status = 'acked', lease_expires_at = NULL WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    /// Records a failed delivery attempt. Past `max_attempts` the item moves to
    /// `DeadLetter` instead of being retried again.
    pub fn nack(&self, id: i64, error: &str, max_attempts: u32) -> Result<(), VisionOpsError> {
        self.with_conn(|conn| {
            let attempts: u32 = conn.query_row("SELECT attempts FROM queue_items WHERE id = ?1", params![id], |row| row.get(0))?;
            let new_attempts = attempts + 1;
            let status = if new_attempts >= max_attempts { "dead_letter" } else { "pending" };
            conn.execute(
                "UPDATE queue_items SET attempts = ?1, last_error = ?2, status = ?3, lease_expires_at = NULL WHERE id = ?4",
                params![new_attempts, error, status, id],
            )?;
            Ok(())
        })
    }

    pub fn dead_letter_count(&self) -> Result<i64, VisionOpsError> {
        self.with_conn(|conn| conn.query_row("SELECT count(*) FROM queue_items WHERE status = 'dead_letter'", [], |row| row.get(0)))
    }

    /// Enqueues a camera's registration for replication to `/cameras`. There is no
    /// local `cameras` table — a `CameraSpec` has no time-series history of its own,
    /// it is just a fact to mirror upstream — so this only touches `queue_items`.
    /// The idempotency key is pinned to the epoch so re-registering the same camera
    /// on every startup or reconfigure collapses to the same row instead of piling
    /// up duplicates.
    pub fn enqueue_camera_spec(&self, camera: &CameraSpec) -> Result<(), VisionOpsError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            enqueue(&tx, EntityKind::CameraSpec, &camera.id, serde_json::to_value(camera).unwrap_or_default(), DateTime::<Utc>::UNIX_EPOCH, 0)?;
            tx.commit()
        })
    }
}

fn enqueue(tx: &rusqlite::Transaction, kind: EntityKind, camera_id: &str, payload: serde_json::Value, natural_timestamp: DateTime<Utc>, sequence: u64) -> rusqlite::Result<()> {
    let key = idempotency_key(kind, camera_id, natural_timestamp, sequence);
    tx.execute(
        "INSERT OR IGNORE INTO queue_items (kind, camera_id, payload, idempotency_key, enqueue_time, status)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
        params![kind.as_str(), camera_id, payload.to_string(), key, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn fetch_item(tx: &rusqlite::Transaction, id: i64) -> rusqlite::Result<QueueItem> {
    tx.query_row(
        "SELECT id, kind, camera_id, payload, idempotency_key, enqueue_time, attempts, last_error, status, lease_expires_at
         FROM queue_items WHERE id = ?1",
        params![id],
        |row| {
            let kind_str: String = row.get(1)?;
            let status_str: String = row.get(8)?;
            let payload_str: String = row.get(3)?;
            let enqueue_str: String = row.get(5)?;
            let lease_str: Option<String> = row.get(9)?;
            Ok(QueueItem {
                id: row.get(0)?,
                kind: parse_kind(&kind_str),
                camera_id: row.get(2)?,
                payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
                idempotency_key: row.get(4)?,
                enqueue_time: DateTime::parse_from_rfc3339(&enqueue_str).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
                attempts: row.get(6)?,
                last_error: row.get(7)?,
                status: parse_status(&status_str),
                lease_expires_at: lease_str.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
            })
        },
    )
}

fn parse_kind(s: &str) -> EntityKind {
    match s {
        "detection" => EntityKind::Detection,
        "key_frame" => EntityKind::KeyFrame,
        "metric" => EntityKind::WindowedMetric,
        _ => EntityKind::CameraSpec,
    }
}

fn parse_status(s: &str) -> QueueStatus {
    match s {
        "pending" => QueueStatus::Pending,
        "in_flight" => QueueStatus::InFlight,
        "acked" => QueueStatus::Acked,
        _ => QueueStatus::DeadLetter,
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;

    fn sample_detection() -> Detection {
        Detection {
            camera_id: "cam-1".into(),
            class_label: "person".into(),
            confidence: 0.9,
            x: 1, y: 2, w: 3, h: 4,
            zone_label: None,
            captured_at: Utc::now(),
            processing_latency_ms: 10,
        }
    }

    #[test]
    fn insert_detection_enqueues_exactly_one_item() {
        let store = LocalStore::open_in_memory().unwrap();
        store.insert_detection(&sample_detection(), 1).unwrap();
        let batch = store.lease_batch(EntityKind::Detection, 10, 300).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn leased_item_is_not_leased_again_until_expiry() {
        let store = LocalStore::open_in_memory().unwrap();
        store.insert_detection(&sample_detection(), 1).unwrap();
        let first = store.lease_batch(EntityKind::Detection, 10, 300).unwrap();
        assert_eq!(first.len(), 1);
        let second = store.lease_batch(EntityKind::Detection, 10, 300).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn nack_past_max_attempts_moves_to_dead_letter() {
        let store = LocalStore::open_in_memory().unwrap();
        store.insert_detection(&sample_detection(), 1).unwrap();
        let batch = store.lease_batch(EntityKind::Detection, 10, 300).unwrap();
        let id = batch[0].id;
        store.nack(id, "boom", 1).unwrap();
        assert_eq!(store.dead_letter_count().unwrap(), 1);
    }

    #[test]
    fn enqueue_camera_spec_is_idempotent_across_reregistration() {
        let store = LocalStore::open_in_memory().unwrap();
        let camera = CameraSpec {
            id: "cam-1".into(),
            url: "rtsp://127.0.0.1/stream".into(),
            credential_ref: None,
            enabled: true,
            zones: Vec::new(),
        };
        store.enqueue_camera_spec(&camera).unwrap();
        store.enqueue_camera_spec(&camera).unwrap();
        let batch = store.lease_batch(EntityKind::CameraSpec, 10, 300).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn ack_removes_item_from_future_batches() {
        let store = LocalStore::open_in_memory().unwrap();
        store.insert_detection(&sample_detection(), 1).unwrap();
        let batch = store.lease_batch(EntityKind::Detection, 10, 300).unwrap();
        store.ack(batch[0].id).unwrap();
        let leftover = store.lease_batch(EntityKind::Detection, 10, 0).unwrap();
        assert!(leftover.is_empty());
    }
}
