//! SQLite-backed reading history.
//!
//! # Example
//!
//! ```rust,ignore
//! use phsense_native::history::{HistoryStore, SqliteHistory, TimeWindow};
//!
//! let db = SqliteHistory::open("ph_history.db")?;
//! db.insert(&sample)?;
//! let today = db.query(TimeWindow::day())?;
//! ```

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::{debug, info};

use phsense_core::types::{DeviceId, Sample};

use super::{HistoryError, HistoryResult, HistoryStore, TimeWindow};

/// Current schema version.
const SCHEMA_VERSION: i32 = 1;

/// SQLite history store.
pub struct SqliteHistory {
    conn: Mutex<Connection>,
}

impl SqliteHistory {
    /// Open or create a database file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or migrated.
    pub fn open<P: AsRef<Path>>(path: P) -> HistoryResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        info!("Opened history database {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    /// Create a throwaway in-memory database.
    ///
    /// # Errors
    ///
    /// Returns error if the schema cannot be created.
    pub fn open_in_memory() -> HistoryResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> HistoryResult<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    fn initialize_schema(&self) -> HistoryResult<()> {
        let conn = self.conn.lock().map_err(|_| HistoryError::Locked)?;

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            debug!("Migrating history schema from version {version}");
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS ph_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    device_id TEXT NOT NULL,
                    value REAL NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_ph_history_created ON ph_history(created_at);
                ",
            )?;
            conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])?;
        }

        Ok(())
    }

    /// Number of stored samples.
    ///
    /// # Errors
    ///
    /// Returns error on query failure.
    pub fn count(&self) -> HistoryResult<usize> {
        let conn = self.conn.lock().map_err(|_| HistoryError::Locked)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ph_history", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

impl HistoryStore for SqliteHistory {
    fn insert(&self, sample: &Sample) -> HistoryResult<()> {
        let created_at = to_column(sample.timestamp_ms)?;
        let conn = self.conn.lock().map_err(|_| HistoryError::Locked)?;
        conn.execute(
            "INSERT INTO ph_history (device_id, value, created_at) VALUES (?1, ?2, ?3)",
            params![sample.device_id.as_str(), f64::from(sample.value), created_at],
        )?;
        Ok(())
    }

    fn query(&self, window: TimeWindow) -> HistoryResult<Vec<Sample>> {
        let start = to_column(window.start_ms)?;
        let end = to_column(window.end_ms)?;
        let conn = self.conn.lock().map_err(|_| HistoryError::Locked)?;

        let mut stmt = conn.prepare(
            "SELECT device_id, value, created_at FROM ph_history
             WHERE created_at BETWEEN ?1 AND ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            let device_id: String = row.get(0)?;
            let value: f64 = row.get(1)?;
            let created_at: i64 = row.get(2)?;
            Ok((device_id, value, created_at))
        })?;

        let mut samples = Vec::new();
        for row in rows {
            let (device_id, value, created_at) = row?;
            #[allow(clippy::cast_possible_truncation)]
            let value = value as f32;
            samples.push(Sample::new(
                DeviceId::new(device_id),
                value,
                u64::try_from(created_at).unwrap_or(0),
            ));
        }
        Ok(samples)
    }
}

fn to_column(timestamp_ms: u64) -> HistoryResult<i64> {
    i64::try_from(timestamp_ms).map_err(|_| HistoryError::InvalidTimestamp(timestamp_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device: &str, value: f32, timestamp_ms: u64) -> Sample {
        Sample::new(DeviceId::new(device), value, timestamp_ms)
    }

    #[test]
    fn test_open_and_insert() {
        let db = SqliteHistory::open_in_memory().unwrap();
        db.insert(&sample("p1", 7.0, 1_000)).unwrap();
        db.insert(&sample("p1", 7.1, 2_000)).unwrap();
        assert_eq!(db.count().unwrap(), 2);
    }

    #[test]
    fn test_query_window_ascending() {
        let db = SqliteHistory::open_in_memory().unwrap();
        db.insert(&sample("p1", 6.5, 3_000)).unwrap();
        db.insert(&sample("p2", 6.0, 1_000)).unwrap();
        db.insert(&sample("p1", 8.0, 9_000)).unwrap();

        let found = db.query(TimeWindow::new(1_000, 3_000)).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], sample("p2", 6.0, 1_000));
        assert_eq!(found[1], sample("p1", 6.5, 3_000));
    }

    #[test]
    fn test_timestamp_out_of_range() {
        let db = SqliteHistory::open_in_memory().unwrap();
        let err = db.insert(&sample("p1", 7.0, u64::MAX)).unwrap_err();
        assert!(matches!(err, HistoryError::InvalidTimestamp(_)));
    }

    #[test]
    fn test_schema_is_reentrant() {
        let db = SqliteHistory::open_in_memory().unwrap();
        db.initialize_schema().unwrap();
        assert_eq!(db.count().unwrap(), 0);
    }
}
