//! Persistence sink for operational records
//!
//! Components write sync runs, send attempts and connection health through
//! the [`PersistenceSink`] trait. Callers treat the sink as write-through
//! logging: a failed write is logged at warn and never fails the operation.
//! Components hold the sink as a [`BoundedSink`], so a stalled backend costs
//! at most one timeout per call.

pub mod memory;
pub mod sqlite;

pub use memory::MemorySink;
pub use sqlite::SqliteSink;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::PersistenceConfig;
use crate::error::PersistenceError;
use crate::models::{HealthSnapshot, SendRecord, SyncLogRecord};

/// Persistence sink trait
///
/// It uses `async_trait` for async methods and `mockall::automock` for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Append a completed sync run
    async fn append_sync_log(&self, record: &SyncLogRecord) -> Result<(), PersistenceError>;

    /// Append a message send attempt
    async fn append_send_record(&self, record: &SendRecord) -> Result<(), PersistenceError>;

    /// Store the latest connection health
    async fn save_health_snapshot(&self, snapshot: &HealthSnapshot) -> Result<(), PersistenceError>;

    /// Load the last stored connection health
    async fn load_health_snapshot(&self) -> Result<Option<HealthSnapshot>, PersistenceError>;
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl PersistenceSink for NullSink {
    async fn append_sync_log(&self, _record: &SyncLogRecord) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn append_send_record(&self, _record: &SendRecord) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn save_health_snapshot(
        &self,
        _snapshot: &HealthSnapshot,
    ) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn load_health_snapshot(&self) -> Result<Option<HealthSnapshot>, PersistenceError> {
        Ok(None)
    }
}

/// Build the sink selected by `config.backend`
pub async fn open_sink(
    config: &PersistenceConfig,
) -> Result<Arc<dyn PersistenceSink>, PersistenceError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemorySink::new(config.memory_capacity))),
        "sqlite" => Ok(Arc::new(SqliteSink::new(&config.path).await?)),
        "none" => Ok(Arc::new(NullSink)),
        other => Err(PersistenceError::Unavailable(format!(
            "unknown backend: {}",
            other
        ))),
    }
}

/// Sink handle that bounds every call with a timeout
///
/// Failures and timeouts are logged at warn and swallowed.
#[derive(Clone)]
pub struct BoundedSink {
    inner: Arc<dyn PersistenceSink>,
    timeout: Duration,
    component: &'static str,
}

impl BoundedSink {
    pub fn new(component: &'static str, inner: Arc<dyn PersistenceSink>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            component,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn append_sync_log(&self, record: &SyncLogRecord) {
        self.bounded("append_sync_log", self.inner.append_sync_log(record))
            .await;
    }

    pub async fn append_send_record(&self, record: &SendRecord) {
        self.bounded("append_send_record", self.inner.append_send_record(record))
            .await;
    }

    pub async fn save_health_snapshot(&self, snapshot: &HealthSnapshot) {
        self.bounded("save_health_snapshot", self.inner.save_health_snapshot(snapshot))
            .await;
    }

    pub async fn load_health_snapshot(&self) -> Option<HealthSnapshot> {
        self.bounded("load_health_snapshot", self.inner.load_health_snapshot())
            .await
            .flatten()
    }

    async fn bounded<T, F>(&self, action: &'static str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T, PersistenceError>>,
    {
        let err = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => e,
            Err(_) => PersistenceError::Timeout(self.timeout),
        };
        warn!(
            component = self.component,
            action,
            error = %err,
            "Persistence call failed"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionHealth, SyncKind, SyncTrigger};
    use chrono::Utc;

    /// Sink whose calls never complete
    struct StalledSink;

    #[async_trait]
    impl PersistenceSink for StalledSink {
        async fn append_sync_log(&self, _record: &SyncLogRecord) -> Result<(), PersistenceError> {
            std::future::pending().await
        }

        async fn append_send_record(&self, _record: &SendRecord) -> Result<(), PersistenceError> {
            std::future::pending().await
        }

        async fn save_health_snapshot(
            &self,
            _snapshot: &HealthSnapshot,
        ) -> Result<(), PersistenceError> {
            std::future::pending().await
        }

        async fn load_health_snapshot(&self) -> Result<Option<HealthSnapshot>, PersistenceError> {
            std::future::pending().await
        }
    }

    fn sync_log() -> SyncLogRecord {
        SyncLogRecord {
            kind: SyncKind::Full,
            trigger: SyncTrigger::Manual,
            started_at: Utc::now(),
            duration_ms: 12,
            success: true,
            outcome: None,
            error: None,
        }
    }

    // Test 1: open_sink selects the configured backend
    #[tokio::test]
    async fn test_open_sink_backends() {
        let memory = PersistenceConfig::default();
        let sink = open_sink(&memory).await.unwrap();
        assert!(sink.load_health_snapshot().await.unwrap().is_none());

        let none = PersistenceConfig {
            backend: "none".to_string(),
            ..Default::default()
        };
        assert!(open_sink(&none).await.is_ok());

        let sqlite = PersistenceConfig {
            backend: "sqlite".to_string(),
            path: ":memory:".to_string(),
            ..Default::default()
        };
        assert!(open_sink(&sqlite).await.is_ok());
    }

    // Test 2: Unknown backend is rejected
    #[tokio::test]
    async fn test_open_sink_unknown_backend() {
        let config = PersistenceConfig {
            backend: "postgres".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            open_sink(&config).await,
            Err(PersistenceError::Unavailable(_))
        ));
    }

    // Test 3: A stalled sink gives up after the timeout
    #[tokio::test]
    async fn test_bounded_sink_times_out() {
        tokio::time::pause();
        let sink = BoundedSink::new("test", Arc::new(StalledSink), Duration::from_secs(5));

        let start = tokio::time::Instant::now();
        sink.append_sync_log(&sync_log()).await;
        sink.save_health_snapshot(&HealthSnapshot::new(ConnectionHealth::default()))
            .await;
        assert!(sink.load_health_snapshot().await.is_none());
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    // Test 4: Writes through a healthy sink land and read back
    #[tokio::test]
    async fn test_bounded_sink_passes_through() {
        let memory = Arc::new(MemorySink::default());
        let sink = BoundedSink::new("test", memory.clone(), Duration::from_secs(5));

        sink.append_sync_log(&sync_log()).await;
        sink.save_health_snapshot(&HealthSnapshot::new(ConnectionHealth::default()))
            .await;

        assert_eq!(memory.sync_logs().len(), 1);
        assert!(sink.load_health_snapshot().await.is_some());
        assert_eq!(sink.timeout(), Duration::from_secs(5));
    }
}
