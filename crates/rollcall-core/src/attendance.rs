//! Attendance event sinks.
//!
//! The recognition session emits [`AttendanceEvent`]s through an
//! [`AttendanceSink`]. Persistence is a SQLite table; a tracing-only sink is
//! available for dry runs.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS attendance_log (
    id          TEXT PRIMARY KEY,
    identity    TEXT NOT NULL,
    confidence  REAL NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS attendance_log_recorded_at ON attendance_log (recorded_at);
";

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("attendance log lock poisoned")]
    Poisoned,
    #[error("invalid row in attendance log: {0}")]
    InvalidRow(String),
}

/// One accepted recognition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: Uuid,
    pub identity: String,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl AttendanceEvent {
    pub fn new(identity: impl Into<String>, confidence: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.into(),
            confidence,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for attendance events. Called from the session worker thread.
pub trait AttendanceSink: Send + Sync {
    fn log_event(&self, event: &AttendanceEvent) -> Result<(), AttendanceError>;
}

/// Emits events as structured log lines only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AttendanceSink for TracingSink {
    fn log_event(&self, event: &AttendanceEvent) -> Result<(), AttendanceError> {
        tracing::info!(
            id = %event.id,
            identity = %event.identity,
            confidence = event.confidence,
            at = %event.timestamp.to_rfc3339(),
            "attendance"
        );
        Ok(())
    }
}

/// SQLite-backed attendance log.
pub struct SqliteAttendanceLog {
    conn: Mutex<Connection>,
}

impl SqliteAttendanceLog {
    /// Open or create the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AttendanceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, AttendanceError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AttendanceError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, AttendanceError>,
    ) -> Result<T, AttendanceError> {
        let conn = self.conn.lock().map_err(|_| AttendanceError::Poisoned)?;
        f(&conn)
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AttendanceEvent>, AttendanceError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, identity, confidence, recorded_at FROM attendance_log
                 ORDER BY recorded_at DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (id, identity, confidence, recorded_at) = row?;
                events.push(decode_event(&id, identity, confidence, &recorded_at)?);
            }
            Ok(events)
        })
    }

    pub fn count(&self) -> Result<usize, AttendanceError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM attendance_log", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }
}

impl AttendanceSink for SqliteAttendanceLog {
    fn log_event(&self, event: &AttendanceEvent) -> Result<(), AttendanceError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO attendance_log (id, identity, confidence, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.id.to_string(),
                    event.identity,
                    event.confidence as f64,
                    event.timestamp.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        tracing::info!(identity = %event.identity, confidence = event.confidence, "attendance recorded");
        Ok(())
    }
}

fn decode_event(
    id: &str,
    identity: String,
    confidence: f64,
    recorded_at: &str,
) -> Result<AttendanceEvent, AttendanceError> {
    let id = Uuid::parse_str(id).map_err(|e| AttendanceError::InvalidRow(format!("id {id:?}: {e}")))?;
    let timestamp = DateTime::parse_from_rfc3339(recorded_at)
        .map_err(|e| AttendanceError::InvalidRow(format!("timestamp {recorded_at:?}: {e}")))?
        .with_timezone(&Utc);
    Ok(AttendanceEvent {
        id,
        identity,
        confidence: confidence as f32,
        timestamp,
    })
}
