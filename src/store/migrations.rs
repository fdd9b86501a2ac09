//! Versioned schema migrations, applied in order inside one transaction at startup.
//! `schema_version` holds exactly one row tracking the highest migration applied.

use rusqlite::{Connection, Transaction};

type Migration = fn(&Transaction) -> rusqlite::Result<()>;

const MIGRATIONS: &[Migration] = &[migration_0001_initial_schema];

pub fn apply_all(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
         INSERT INTO schema_version (version)
         SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version);",
    )?;

    let current: i64 = conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))?;

    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        migration(&tx)?;
        tx.execute("UPDATE schema_version SET version = ?1", [version])?;
        tx.commit()?;
    }

    Ok(())
}

fn migration_0001_initial_schema(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS detections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            camera_id TEXT NOT NULL,
            class_label TEXT NOT NULL,
            confidence REAL NOT NULL,
            x INTEGER NOT NULL,
            y INTEGER NOT NULL,
            w INTEGER NOT NULL,
            h INTEGER NOT NULL,
            zone_label TEXT,
            captured_at TEXT NOT NULL,
            processing_latency_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_detections_camera_time ON detections (camera_id, captured_at);

        CREATE TABLE IF NOT EXISTS key_frames (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            camera_id TEXT NOT NULL,
            captured_at TEXT NOT NULL,
            image_bytes BLOB NOT NULL,
            caption TEXT NOT NULL,
            class_counts TEXT NOT NULL,
            sequence INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_key_frames_camera_time ON key_frames (camera_id, captured_at);

        CREATE TABLE IF NOT EXISTS windowed_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            camera_id TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_seconds INTEGER NOT NULL,
            class_counts_avg TEXT NOT NULL,
            class_counts_max TEXT NOT NULL,
            average_confidence REAL NOT NULL,
            sample_count INTEGER NOT NULL,
            zone_counts TEXT NOT NULL,
            latency_p50_ms INTEGER NOT NULL,
            latency_p95_ms INTEGER NOT NULL,
            UNIQUE(camera_id, window_start)
        );
        CREATE INDEX IF NOT EXISTS idx_metrics_camera_time ON windowed_metrics (camera_id, window_start);

        CREATE TABLE IF NOT EXISTS queue_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            camera_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            enqueue_time TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            lease_expires_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_queue_status ON queue_items (status, kind, camera_id, id);
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_all_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_all(&conn).unwrap();
        apply_all(&conn).unwrap();
        let version: i64 = conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0)).unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }
}
