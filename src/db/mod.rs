mod schema;
pub mod assets;
pub mod embeddings;
pub mod faces;
pub mod tasks;
pub mod video;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub use assets::{Asset, MediaType, NewAsset};
pub use embeddings::EmbeddingRecord;
pub use faces::{BoundingBox, DetectedFace, Face, Person};
pub use schema::SCHEMA;
pub use tasks::{StateCounts, TaskFilter};
pub use video::VideoSegmentRecord;

/// How long a statement waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Relational store: the source of truth for tasks, assets, embeddings and faces.
///
/// One handle wraps one SQLite connection. Several handles (threads or
/// processes) may open the same file; task ownership between them is decided
/// only by conditional `UPDATE`s on the task row.
pub struct Database {
    conn: Mutex<Connection>,
    /// Held for the whole of a clustering pass through this handle.
    clustering: Mutex<()>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(path = %path.display(), mode = %mode, "WAL journal mode unavailable");
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            clustering: Mutex::new(()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            clustering: Mutex::new(()),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    /// Serializes clustering passes that share this handle. A pass that
    /// panicked leaves nothing half-applied beyond single-face transactions,
    /// so a poisoned lock is taken over.
    pub(crate) fn clustering_lock(&self) -> MutexGuard<'_, ()> {
        self.clustering
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Timestamps are stored as fixed-width RFC 3339 UTC strings so that text
/// comparison in SQL orders them chronologically.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now() -> String {
    timestamp(Utc::now())
}

pub(crate) fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Convert f32 slice to bytes for storage
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &val in vector {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
