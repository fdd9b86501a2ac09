//! # Local Store
//!
//! An embedded `rusqlite` database (WAL mode) holding every entity in the data model
//! until the Replicator has confirmed it was accepted remotely. Schema is created by a
//! small versioned migration list applied at startup; every subsequent release only
//! appends a migration, never edits one already shipped.
//!
//! Retention is enforced by a maintenance pass rather than per-row TTLs: hourly it
//! deletes `Detection` rows older than 24h, and once a day (during the configured
//! maintenance window) it deletes `KeyFrame`/`WindowedMetric` rows older than 7 days and
//! `Acked` queue items older than 1 hour. `DeadLetter` rows are never deleted by
//! retention — an operator has to clear those deliberately.

pub mod migrations;
pub mod queue;
pub mod retention;

use crate::error::VisionOpsError;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VisionOpsError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VisionOpsError::fatal_with_source(format!("cannot create {}", parent.display()), e)
            })?;
        }
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::apply_all(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests: same schema, no file, no WAL.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, VisionOpsError> {
        let conn = Connection::open_in_memory()?;
        migrations::apply_all(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T, VisionOpsError> {
        let conn = self.conn.lock().map_err(|_| VisionOpsError::fatal("local store mutex poisoned"))?;
        f(&conn).map_err(VisionOpsError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_applies_schema() {
        let store = LocalStore::open_in_memory().unwrap();
        let table_count: i64 = store
            .with_conn(|c| {
                c.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='queue_items'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(table_count, 1);
    }
}
