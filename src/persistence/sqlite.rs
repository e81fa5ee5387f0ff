//! SQLite persistence sink
//!
//! Append-only tables written through rusqlite and tokio-rusqlite. Use
//! `:memory:` for an in-memory database or a file path for persistent
//! storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use super::PersistenceSink;
use crate::error::PersistenceError;
use crate::models::{HealthSnapshot, SendRecord, SyncLogRecord};

/// SQL statement creating the sink schema
pub const CREATE_SCHEMA: &str = r#"
-- Sync run log
CREATE TABLE IF NOT EXISTS sync_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    sync_trigger TEXT NOT NULL,
    started_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    success INTEGER NOT NULL,
    outcome TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_log_started ON sync_log(started_at);

-- Message send attempts
CREATE TABLE IF NOT EXISTS send_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL,
    target TEXT NOT NULL,
    priority TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_send_history_message ON send_history(message_id);

-- Connection health snapshots
CREATE TABLE IF NOT EXISTS health_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at TEXT NOT NULL,
    snapshot TEXT NOT NULL
);
"#;

/// SQLite sink implementation
pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    /// Open (and migrate) the database at `path`
    pub async fn new(path: &str) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path).await?;

        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            Ok::<_, rusqlite::Error>(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create an in-memory sink (useful for testing)
    pub async fn in_memory() -> Result<Self, PersistenceError> {
        Self::new(":memory:").await
    }

    /// Most recent sync runs, newest first
    pub async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLogRecord>, PersistenceError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT kind, sync_trigger, started_at, duration_ms, success, outcome, error
                    FROM sync_log
                    ORDER BY id DESC
                    LIMIT ?1
                    "#,
                )?;

                let rows = stmt
                    .query_map([limit as i64], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, bool>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<String>>(6)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok::<_, rusqlite::Error>(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(kind, trigger, started_at, duration_ms, success, outcome, error)| {
                Ok::<_, PersistenceError>(SyncLogRecord {
                    kind: from_label(&kind)?,
                    trigger: from_label(&trigger)?,
                    started_at: parse_datetime(&started_at),
                    duration_ms: duration_ms.max(0) as u64,
                    success,
                    outcome: outcome.map(|o| serde_json::from_str(&o)).transpose()?,
                    error,
                })
            })
            .collect()
    }

    /// Send attempts of one message, oldest first
    pub async fn send_history(&self, message_id: &str) -> Result<Vec<SendRecord>, PersistenceError> {
        let message_id = message_id.to_string();

        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT message_id, target, priority, attempt, status, error, timestamp
                    FROM send_history
                    WHERE message_id = ?1
                    ORDER BY id
                    "#,
                )?;

                let rows = stmt
                    .query_map([&message_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok::<_, rusqlite::Error>(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(message_id, target, priority, attempt, status, error, timestamp)| {
                Ok::<_, PersistenceError>(SendRecord {
                    message_id,
                    target,
                    priority: from_label(&priority)?,
                    attempt: attempt.max(0) as u32,
                    status: from_label(&status)?,
                    error,
                    timestamp: parse_datetime(&timestamp),
                })
            })
            .collect()
    }
}

#[async_trait]
impl PersistenceSink for SqliteSink {
    async fn append_sync_log(&self, record: &SyncLogRecord) -> Result<(), PersistenceError> {
        let kind = to_label(&record.kind)?;
        let trigger = to_label(&record.trigger)?;
        let started_at = record.started_at.to_rfc3339();
        let duration_ms = record.duration_ms as i64;
        let success = record.success;
        let outcome = record
            .outcome
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let error = record.error.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO sync_log
                    (kind, sync_trigger, started_at, duration_ms, success, outcome, error)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    rusqlite::params![kind, trigger, started_at, duration_ms, success, outcome, error],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;

        Ok(())
    }

    async fn append_send_record(&self, record: &SendRecord) -> Result<(), PersistenceError> {
        let message_id = record.message_id.clone();
        let target = record.target.clone();
        let priority = to_label(&record.priority)?;
        let attempt = record.attempt as i64;
        let status = to_label(&record.status)?;
        let error = record.error.clone();
        let timestamp = record.timestamp.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO send_history
                    (message_id, target, priority, attempt, status, error, timestamp)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    rusqlite::params![message_id, target, priority, attempt, status, error, timestamp],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;

        Ok(())
    }

    async fn save_health_snapshot(&self, snapshot: &HealthSnapshot) -> Result<(), PersistenceError> {
        let recorded_at = snapshot.recorded_at.to_rfc3339();
        let body = serde_json::to_string(snapshot)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO health_snapshots (recorded_at, snapshot) VALUES (?1, ?2)",
                    rusqlite::params![recorded_at, body],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;

        Ok(())
    }

    async fn load_health_snapshot(&self) -> Result<Option<HealthSnapshot>, PersistenceError> {
        let body = self
            .conn
            .call(|conn| {
                conn.query_row(
                    "SELECT snapshot FROM health_snapshots ORDER BY id DESC LIMIT 1",
                    [],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;

        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(Into::into)
    }
}

/// Serialize a unit enum to its snake_case label
fn to_label<T: serde::Serialize>(value: &T) -> Result<String, PersistenceError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn from_label<T: serde::de::DeserializeOwned>(label: &str) -> Result<T, PersistenceError> {
    Ok(serde_json::from_value(serde_json::Value::String(label.to_string()))?)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
