//! Retention maintenance: deletes rows the data model no longer requires once they've
//! aged past their retention window. `DeadLetter` queue items are never touched here —
//! an operator clears those explicitly once the underlying delivery problem is fixed.

use super::LocalStore;
use crate::error::VisionOpsError;
use chrono::{Duration, Utc};

const DETECTION_RETENTION_HOURS: i64 = 24;
const KEYFRAME_METRIC_RETENTION_DAYS: i64 = 7;
const ACKED_QUEUE_COOLDOWN_HOURS: i64 = 1;

impl LocalStore {
    /// Deletes detections older than 24h. Intended to run hourly.
    pub fn run_hourly_retention(&self) -> Result<usize, VisionOpsError> {
        let cutoff = (Utc::now() - Duration::hours(DETECTION_RETENTION_HOURS)).to_rfc3339();
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM detections WHERE captured_at < ?1", [cutoff])?;
            Ok(deleted)
        })
    }

    /// Deletes key frames and windowed metrics older than 7 days, and acked queue items
    /// older than the 1h cooldown. Intended to run once per day, inside the configured
    /// maintenance window.
    pub fn run_daily_retention(&self) -> Result<DailyRetentionReport, VisionOpsError> {
        let entity_cutoff = (Utc::now() - Duration::days(KEYFRAME_METRIC_RETENTION_DAYS)).to_rfc3339();
        let queue_cutoff = (Utc::now() - Duration::hours(ACKED_QUEUE_COOLDOWN_HOURS)).to_rfc3339();

        self.with_conn(|conn| {
            let key_frames_deleted = conn.execute("DELETE FROM key_frames WHERE captured_at < ?1", [&entity_cutoff])?;
            let metrics_deleted = conn.execute("DELETE FROM windowed_metrics WHERE window_start < ?1", [&entity_cutoff])?;
            let acked_deleted = conn.execute(
                "DELETE FROM queue_items WHERE status = 'acked' AND enqueue_time < ?1",
                [&queue_cutoff],
            )?;
            Ok(DailyRetentionReport {
                key_frames_deleted,
                metrics_deleted,
                acked_queue_items_deleted: acked_deleted,
            })
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DailyRetentionReport {
    pub key_frames_deleted: usize,
    pub metrics_deleted: usize,
    pub acked_queue_items_deleted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Detection, EntityKind};
    use rusqlite::params;

    #[test]
    fn hourly_retention_drops_only_stale_detections() {
        let store = LocalStore::open_in_memory().unwrap();
        let old_time = (Utc::now() - Duration::hours(48)).to_rfc3339();
        let fresh_time = Utc::now().to_rfc3339();

        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO detections (camera_id, class_label, confidence, x, y, w, h, zone_label, captured_at, processing_latency_ms)
                     VALUES ('cam-1','person',0.9,0,0,1,1,NULL,?1,1)",
                    params![old_time],
                )?;
                conn.execute(
                    "INSERT INTO detections (camera_id, class_label, confidence, x, y, w, h, zone_label, captured_at, processing_latency_ms)
                     VALUES ('cam-1','person',0.9,0,0,1,1,NULL,?1,1)",
                    params![fresh_time],
                )?;
                Ok(())
            })
            .unwrap();

        let deleted = store.run_hourly_retention().unwrap();
        assert_eq!(deleted, 1);

        let remaining: i64 = store.with_conn(|conn| conn.query_row("SELECT count(*) FROM detections", [], |row| row.get(0))).unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn daily_retention_never_touches_dead_letter_items() {
        let store = LocalStore::open_in_memory().unwrap();
        let detection = Detection {
            camera_id: "cam-1".into(), class_label: "person".into(), confidence: 0.9,
            x: 0, y: 0, w: 1, h: 1, zone_label: None, captured_at: Utc::now(), processing_latency_ms: 1,
        };
        store.insert_detection(&detection, 1).unwrap();
        let batch = store.lease_batch(EntityKind::Detection, 10, 300).unwrap();
        store.nack(batch[0].id, "boom", 1).unwrap();
        assert_eq!(store.dead_letter_count().unwrap(), 1);

        store.run_daily_retention().unwrap();
        assert_eq!(store.dead_letter_count().unwrap(), 1);
    }
}
