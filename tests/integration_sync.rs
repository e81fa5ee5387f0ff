//! Sync functionality integration tests
//!
//! Tests the synchronization system including:
//! - Throttling of back-to-back triggers
//! - Persisted sync logs
//! - Failure alerts raised by the monitor
//! - Connection loss cancelling scheduled work

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{drain, settle, test_config, FakeWorker};
use session_steward::config::SyncConfig;
use session_steward::error::{NotifyError, SyncError};
use session_steward::events::SchedulerEvent;
use session_steward::models::{Alert, AlertType, HealthStatus, SyncKind, SyncTrigger};
use session_steward::monitor::{NotificationChannel, SyncMonitor};
use session_steward::persistence::{MemorySink, PersistenceSink, SqliteSink};
use session_steward::sync::{SyncDispatch, SyncScheduler};

/// Records delivered alerts
#[derive(Default)]
struct RecordingChannel {
    alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

fn failure() -> Result<session_steward::models::SyncOutcome, SyncError> {
    Err(SyncError::Worker("store unavailable".to_string()))
}

fn connected(config: SyncConfig, worker: Arc<FakeWorker>, sink: Arc<dyn PersistenceSink>) -> SyncScheduler {
    let scheduler = SyncScheduler::new(config, sink);
    scheduler.initialize(worker);
    scheduler.on_connection_established();
    scheduler
}

/// Test 1: Runs at t=0, throttled at t=30s, runs again at t=61s
#[tokio::test]
async fn test_min_sync_interval() {
    tokio::time::pause();
    let worker = FakeWorker::new();
    let scheduler = connected(
        SyncConfig {
            min_sync_interval_ms: 60_000,
            ..test_config().sync
        },
        worker.clone(),
        Arc::new(MemorySink::default()),
    );
    let mut rx = scheduler.subscribe();

    let first = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
    assert!(matches!(first, Ok(SyncDispatch::Completed(_))));

    tokio::time::advance(Duration::from_secs(30)).await;
    let second = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
    assert!(matches!(second, Ok(SyncDispatch::Throttled { .. })));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, SchedulerEvent::SyncThrottled { .. })));

    tokio::time::advance(Duration::from_secs(31)).await;
    let third = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
    assert!(matches!(third, Ok(SyncDispatch::Completed(_))));

    assert_eq!(worker.calls().len(), 2);
    let status = scheduler.get_sync_status();
    assert_eq!(status.successful_syncs, 2);
    assert!(status.last_sync_at.is_some());
    scheduler.stop();
}

/// Test 2: Every run is appended to the SQLite sync log
#[tokio::test]
async fn test_sync_runs_logged_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let sink = Arc::new(SqliteSink::new(path.to_str().unwrap()).await.unwrap());

    let worker = FakeWorker::scripted(vec![Ok(Default::default()), failure()]);
    let scheduler = connected(test_config().sync, worker, sink.clone());

    scheduler.trigger_manual_sync(SyncKind::Full).await.unwrap();
    assert!(scheduler.trigger_manual_sync(SyncKind::Incremental).await.is_err());
    scheduler.stop();

    let logs = sink.recent_sync_logs(10).await.unwrap();
    assert_eq!(logs.len(), 2);

    // Newest first
    assert_eq!(logs[0].kind, SyncKind::Incremental);
    assert!(!logs[0].success);
    assert_eq!(logs[0].error.as_deref(), Some("Sync worker failed: store unavailable"));
    assert_eq!(logs[1].kind, SyncKind::Full);
    assert_eq!(logs[1].trigger, SyncTrigger::Manual);
    assert!(logs[1].success);
    assert!(scheduler.get_sync_status().last_full_sync_at.is_some());
}

/// Test 3: Consecutive failures across retries raise one alert
#[tokio::test]
async fn test_consecutive_failures_alert() {
    tokio::time::pause();
    let worker = FakeWorker::scripted(vec![failure(), failure(), failure()]);
    let scheduler = connected(test_config().sync, worker.clone(), Arc::new(MemorySink::default()));

    let channel = Arc::new(RecordingChannel::default());
    let monitor = SyncMonitor::with_channels(
        test_config().monitor,
        vec![channel.clone() as Arc<dyn NotificationChannel>],
    );
    monitor.initialize(&scheduler);

    assert!(scheduler.trigger_manual_sync(SyncKind::Incremental).await.is_err());
    // Retries after 1s and a further 2s
    tokio::time::sleep(Duration::from_millis(1_001)).await;
    tokio::time::sleep(Duration::from_millis(2_001)).await;
    settle().await;

    assert_eq!(worker.calls().len(), 3);
    let delivered = channel.alerts.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].alert_type, AlertType::ConsecutiveFailures);

    let metrics = monitor.get_metrics();
    assert_eq!(metrics.failed_runs, 3);
    assert_eq!(metrics.consecutive_failures, 3);
    assert_ne!(metrics.health, HealthStatus::Healthy);

    // Retries are exhausted; only a new trigger runs again
    assert!(scheduler.get_sync_status().is_blocked);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(worker.calls().len(), 3);

    let recovered = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
    assert!(matches!(recovered, Ok(SyncDispatch::Completed(_))));
    settle().await;
    assert_eq!(worker.calls().len(), 4);
    assert_eq!(monitor.get_metrics().consecutive_failures, 0);

    // Acknowledging clears the open alert
    assert!(monitor.acknowledge_alert(&delivered[0].id));
    assert!(monitor.get_alerts(false).is_empty());
    assert_eq!(monitor.get_alerts(true).len(), 1);

    monitor.stop();
    scheduler.stop();
}

/// Test 4: Losing the connection cancels a scheduled retry
#[tokio::test]
async fn test_connection_lost_cancels_retry() {
    tokio::time::pause();
    let worker = FakeWorker::scripted(vec![failure()]);
    let scheduler = connected(test_config().sync, worker.clone(), Arc::new(MemorySink::default()));

    assert!(scheduler.trigger_manual_sync(SyncKind::Incremental).await.is_err());
    scheduler.on_connection_lost();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(worker.calls().len(), 1);
    assert_eq!(
        scheduler.trigger_manual_sync(SyncKind::Incremental).await,
        Err(SyncError::NotConnected)
    );
    scheduler.stop();
}
