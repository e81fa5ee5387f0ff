//! In-memory persistence sink
//!
//! Keeps the most recent records of each kind in [`BoundedLog`]s. Used for
//! tests and for hosts that only need recent history.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::PersistenceSink;
use crate::error::PersistenceError;
use crate::history::BoundedLog;
use crate::models::{HealthSnapshot, SendRecord, SyncLogRecord};

#[derive(Debug)]
struct Tables {
    sync_logs: BoundedLog<SyncLogRecord>,
    send_records: BoundedLog<SendRecord>,
    health: Option<HealthSnapshot>,
}

/// Bounded in-memory sink
#[derive(Debug)]
pub struct MemorySink {
    tables: Mutex<Tables>,
}

impl MemorySink {
    /// Create a sink keeping at most `capacity` records per table
    pub fn new(capacity: usize) -> Self {
        Self {
            tables: Mutex::new(Tables {
                sync_logs: BoundedLog::new(capacity),
                send_records: BoundedLog::new(capacity),
                health: None,
            }),
        }
    }

    /// Stored sync runs, oldest first
    pub fn sync_logs(&self) -> Vec<SyncLogRecord> {
        self.lock().sync_logs.iter().cloned().collect()
    }

    /// Stored send attempts, oldest first
    pub fn send_records(&self) -> Vec<SendRecord> {
        self.lock().send_records.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn append_sync_log(&self, record: &SyncLogRecord) -> Result<(), PersistenceError> {
        self.lock().sync_logs.push(record.clone());
        Ok(())
    }

    async fn append_send_record(&self, record: &SendRecord) -> Result<(), PersistenceError> {
        self.lock().send_records.push(record.clone());
        Ok(())
    }

    async fn save_health_snapshot(&self, snapshot: &HealthSnapshot) -> Result<(), PersistenceError> {
        self.lock().health = Some(snapshot.clone());
        Ok(())
    }

    async fn load_health_snapshot(&self) -> Result<Option<HealthSnapshot>, PersistenceError> {
        Ok(self.lock().health.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptStatus, ConnectionHealth, MessagePriority};
    use chrono::Utc;

    fn send_record(id: &str) -> SendRecord {
        SendRecord {
            message_id: id.to_string(),
            target: "alice".to_string(),
            priority: MessagePriority::Normal,
            attempt: 1,
            status: AttemptStatus::Success,
            error: None,
            timestamp: Utc::now(),
        }
    }

    // Test 1: Records are bounded per table
    #[tokio::test]
    async fn test_send_records_bounded() {
        let sink = MemorySink::new(2);
        for id in ["a", "b", "c"] {
            sink.append_send_record(&send_record(id)).await.unwrap();
        }

        let ids: Vec<_> = sink
            .send_records()
            .into_iter()
            .map(|r| r.message_id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    // Test 2: Latest health snapshot wins
    #[tokio::test]
    async fn test_health_snapshot_overwrites() {
        let sink = MemorySink::default();
        assert!(sink.load_health_snapshot().await.unwrap().is_none());

        let mut health = ConnectionHealth::default();
        health.reconnect_count = 1;
        sink.save_health_snapshot(&HealthSnapshot::new(health.clone()))
            .await
            .unwrap();
        health.reconnect_count = 4;
        sink.save_health_snapshot(&HealthSnapshot::new(health))
            .await
            .unwrap();

        let loaded = sink.load_health_snapshot().await.unwrap().unwrap();
        assert_eq!(loaded.health.reconnect_count, 4);
    }
}
