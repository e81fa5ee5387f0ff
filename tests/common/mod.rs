//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use session_steward::config::{Config, ReconnectionStrategy, RetryPolicy};
use session_steward::connection::ConnectionInfo;
use session_steward::error::{PersistenceError, SyncError, TransportError};
use session_steward::models::{HealthSnapshot, SendRecord, SyncKind, SyncLogRecord, SyncOutcome};
use session_steward::persistence::PersistenceSink;
use session_steward::sync::SyncWorker;
use session_steward::transport::{SendReceipt, Transport, TransportEvent};
use tokio::sync::{broadcast, mpsc};

/// Transport double recording every send
///
/// `connect` succeeds while the allowance lasts and then reports `Open`
/// on the attached event channel, if any. Sends fail with the scripted
/// errors first, then succeed.
#[derive(Default)]
pub struct FakeTransport {
    events: Option<mpsc::Sender<TransportEvent>>,
    connects: AtomicU32,
    connects_allowed: Option<u32>,
    send_failures: Mutex<VecDeque<TransportError>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport that opens the session on each successful connect
    pub fn with_events(events: mpsc::Sender<TransportEvent>, connects_allowed: u32) -> Arc<Self> {
        Arc::new(Self {
            events: Some(events),
            connects_allowed: Some(connects_allowed),
            ..Default::default()
        })
    }

    /// Transport whose first sends fail with `errors`
    pub fn failing(errors: Vec<TransportError>) -> Arc<Self> {
        Arc::new(Self {
            send_failures: Mutex::new(errors.into()),
            ..Default::default()
        })
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Targets in send order, failed attempts included
    pub fn targets(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(target, _)| target.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(allowed) = self.connects_allowed {
            if n > allowed {
                return Err(TransportError::Closed("connection refused".to_string()));
            }
        }
        if let Some(events) = &self.events {
            let _ = events.send(TransportEvent::Open).await;
        }
        Ok(())
    }

    async fn send(&self, target: &str, payload: &str) -> Result<SendReceipt, TransportError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((target.to_string(), payload.to_string()));
        if let Some(err) = self.send_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(SendReceipt::new(format!("wire-{}", sent.len())))
    }
}

/// Sync worker replaying scripted results, then succeeding
#[derive(Default)]
pub struct FakeWorker {
    results: Mutex<VecDeque<Result<SyncOutcome, SyncError>>>,
    calls: Mutex<Vec<SyncKind>>,
}

impl FakeWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(results: Vec<Result<SyncOutcome, SyncError>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<SyncKind> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, kind: SyncKind) -> Result<SyncOutcome, SyncError> {
        self.calls.lock().unwrap().push(kind);
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SyncOutcome::default().with_count("messages", 10)))
    }
}

#[async_trait]
impl SyncWorker for FakeWorker {
    async fn perform_full_sync(&self) -> Result<SyncOutcome, SyncError> {
        self.next(SyncKind::Full)
    }

    async fn perform_incremental_sync(&self) -> Result<SyncOutcome, SyncError> {
        self.next(SyncKind::Incremental)
    }
}

/// Connection that is always open
pub struct AlwaysConnected;

impl ConnectionInfo for AlwaysConnected {
    fn is_connected(&self) -> bool {
        true
    }

    fn uptime(&self) -> Option<Duration> {
        Some(Duration::from_secs(3_600))
    }
}

/// Persistence backend whose calls never complete
pub struct StalledSink;

#[async_trait]
impl PersistenceSink for StalledSink {
    async fn append_sync_log(&self, _record: &SyncLogRecord) -> Result<(), PersistenceError> {
        std::future::pending().await
    }

    async fn append_send_record(&self, _record: &SendRecord) -> Result<(), PersistenceError> {
        std::future::pending().await
    }

    async fn save_health_snapshot(&self, _snapshot: &HealthSnapshot) -> Result<(), PersistenceError> {
        std::future::pending().await
    }

    async fn load_health_snapshot(&self) -> Result<Option<HealthSnapshot>, PersistenceError> {
        std::future::pending().await
    }
}

/// Deterministic configuration with long-running timers pushed out of the way
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.connection.reconnect = ReconnectionStrategy {
        max_attempts: 3,
        base_delay_ms: 1_000,
        max_delay_ms: 60_000,
        backoff_multiplier: 2.0,
        jitter: false,
    };

    config.compliance.min_send_gap_ms = 0;
    config.compliance.send_jitter_ms = 0;

    config.delivery.tick_interval_ms = 100;
    config.delivery.policies.critical = RetryPolicy::new(3, 1_000, 4_000).with_jitter(false);
    config.delivery.policies.high = RetryPolicy::new(3, 1_000, 4_000).with_jitter(false);
    config.delivery.policies.normal = RetryPolicy::new(2, 1_000, 1_000).with_jitter(false);
    config.delivery.policies.low = RetryPolicy::new(2, 1_000, 1_000).with_jitter(false);

    config.sync.initial_delay_ms = 864_000_000;
    config.sync.periodic_interval_ms = 864_000_000;
    config.sync.health_check_interval_ms = 864_000_000;
    config.sync.min_sync_interval_ms = 0;
    config.sync.retry_base_delay_ms = 1_000;
    config.sync.retry_max_delay_ms = 60_000;
    config
}

/// Let spawned tasks run without advancing the clock
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Collect every event currently buffered on `rx`
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
