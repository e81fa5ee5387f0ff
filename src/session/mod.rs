//! Session supervision
//!
//! [`SessionSupervisor`] owns one instance of every component, routes
//! transport lifecycle events to them and performs the reconnects the
//! stabilizer asks for.
//!
//! # Example
//!
//! ```ignore
//! use session_steward::session::SessionSupervisor;
//!
//! let supervisor = SessionSupervisor::new(config, transport, worker, sink);
//! let (tx, rx) = tokio::sync::mpsc::channel(64);
//! // hand `tx` to the transport implementation
//! supervisor.run(rx, shutdown_signal()).await;
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::compliance::{ComplianceGuard, RateLimitStatus};
use crate::config::Config;
use crate::connection::ConnectionStabilizer;
use crate::delivery::MessageReliabilityQueue;
use crate::error::{AppError, DeliveryError, NotifyError};
use crate::events::StabilizerEvent;
use crate::models::{
    Alert, ConnectionHealth, DeliveryConfirmation, DisconnectReason, OutboundMessage, QueueStats,
    SyncKind, SyncStatus,
};
use crate::monitor::{NotificationChannel, SyncMetrics, SyncMonitor};
use crate::otel::Metrics;
use crate::persistence::PersistenceSink;
use crate::sync::{SyncDispatch, SyncScheduler, SyncWorker};
use crate::transport::{Transport, TransportEvent};

/// Point-in-time view over every component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub connection: ConnectionHealth,
    pub rate_limits: RateLimitStatus,
    pub queue: QueueStats,
    pub sync: SyncStatus,
    pub monitor: SyncMetrics,
}

/// Counts raised alerts in the OpenTelemetry metrics
struct AlertMetricsChannel {
    metrics: Arc<Metrics>,
}

#[async_trait]
impl NotificationChannel for AlertMetricsChannel {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.metrics.record_alert(alert);
        Ok(())
    }
}

/// Wires the transport, the components and telemetry together
pub struct SessionSupervisor {
    config: Config,
    transport: Arc<dyn Transport>,
    stabilizer: ConnectionStabilizer,
    guard: ComplianceGuard,
    queue: MessageReliabilityQueue,
    scheduler: SyncScheduler,
    monitor: SyncMonitor,
    metrics: Option<Arc<Metrics>>,
}

impl SessionSupervisor {
    /// Construct every component; nothing runs until [`Self::run`]
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        worker: Arc<dyn SyncWorker>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let stabilizer = ConnectionStabilizer::new(
            config.connection.clone(),
            Arc::clone(&transport),
            Arc::clone(&sink),
        );
        let guard = ComplianceGuard::new(config.compliance.clone(), Arc::new(stabilizer.clone()));
        let queue = MessageReliabilityQueue::new(
            config.delivery.clone(),
            Arc::clone(&transport),
            guard.clone(),
            Arc::clone(&sink),
        );
        // No sends until the transport reports an open session
        queue.pause();

        let scheduler = SyncScheduler::new(config.sync.clone(), sink);
        scheduler.initialize(worker);
        let monitor = SyncMonitor::new(config.monitor.clone());

        Self {
            config,
            transport,
            stabilizer,
            guard,
            queue,
            scheduler,
            monitor,
            metrics: None,
        }
    }

    /// Notify `channel` of raised alerts in addition to the configured ones
    pub fn with_channel(self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.monitor.add_channel(channel);
        self
    }

    /// Record component events and alerts in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.monitor.add_channel(Arc::new(AlertMetricsChannel {
            metrics: Arc::clone(&metrics),
        }));
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stabilizer(&self) -> &ConnectionStabilizer {
        &self.stabilizer
    }

    pub fn guard(&self) -> &ComplianceGuard {
        &self.guard
    }

    pub fn queue(&self) -> &MessageReliabilityQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &SyncMonitor {
        &self.monitor
    }

    /// Queue `message` for reliable delivery; returns its queue id
    pub fn send_message(&self, message: OutboundMessage) -> Result<String, DeliveryError> {
        self.queue.enqueue(message)
    }

    /// Apply a delivery confirmation; false if no message matched
    pub fn confirm(&self, ack: &DeliveryConfirmation) -> bool {
        self.queue.confirm(ack)
    }

    /// Run a manual sync; failures are logged with their error class
    pub async fn trigger_sync(&self, kind: SyncKind) -> Result<SyncDispatch, AppError> {
        self.scheduler.trigger_manual_sync(kind).await.map_err(|e| {
            let err = AppError::from(e);
            warn!(
                component = "session",
                action = "sync",
                kind = %kind,
                class = ?err.class(),
                error = %err,
                "Manual sync failed"
            );
            err
        })
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            connection: self.stabilizer.get_health(),
            rate_limits: self.guard.get_rate_limit_status(),
            queue: self.queue.get_stats(),
            sync: self.scheduler.get_sync_status(),
            monitor: self.monitor.get_metrics(),
        }
    }

    /// Run until `shutdown` resolves or the transport event channel closes
    ///
    /// Starts the background workers, asks the transport to connect and
    /// then pumps transport and component events. Every timer and task is
    /// cancelled before returning.
    pub async fn run(
        &self,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        shutdown: impl Future<Output = ()> + Send,
    ) {
        let mut stabilizer_rx = self.stabilizer.subscribe();
        let mut queue_rx = self.queue.subscribe();
        let mut scheduler_rx = self.scheduler.subscribe();

        self.stabilizer.restore().await;
        self.stabilizer.start_health_checks();
        self.guard.start_periodic_checks();
        self.queue.start();
        self.monitor.initialize(&self.scheduler);
        self.monitor.observe_queue(&self.queue);

        info!(component = "session", "Session supervisor started");
        self.spawn_connect(0);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(component = "session", "Shutdown requested");
                    break;
                }
                event = transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        warn!(component = "session", "Transport event channel closed");
                        break;
                    }
                },
                event = stabilizer_rx.recv() => {
                    if let Some(event) = received(event, "stabilizer") {
                        self.handle_stabilizer_event(&event);
                    }
                }
                event = queue_rx.recv() => {
                    if let (Some(event), Some(metrics)) = (received(event, "delivery"), &self.metrics) {
                        metrics.record_queue_event(&event);
                    }
                }
                event = scheduler_rx.recv() => {
                    if let (Some(event), Some(metrics)) = (received(event, "sync"), &self.metrics) {
                        metrics.record_scheduler_event(&event);
                    }
                }
            }
        }

        self.stop();
    }

    /// Stop every component
    pub fn stop(&self) {
        self.queue.stop();
        self.scheduler.stop();
        self.monitor.stop();
        self.guard.stop();
        self.stabilizer.stop();
        info!(component = "session", "Session supervisor stopped");
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                self.stabilizer.on_open();
                self.queue.resume();
                self.scheduler.on_connection_established();
            }
            TransportEvent::Close(reason) => {
                self.queue.pause();
                self.scheduler.on_connection_lost();
                self.stabilizer.on_close(reason).await;
            }
            TransportEvent::MessageAck(ack) => {
                if !self.queue.confirm(&ack) {
                    debug!(
                        component = "session",
                        message_id = %ack.message_id,
                        "Acknowledgement for unknown message"
                    );
                }
            }
        }
    }

    fn handle_stabilizer_event(&self, event: &StabilizerEvent) {
        if let Some(metrics) = &self.metrics {
            metrics.record_stabilizer_event(event);
        }
        if let StabilizerEvent::ReconnectAttempt { attempt, .. } = event {
            self.spawn_connect(*attempt);
        }
    }

    /// Ask the transport to connect; a failure is fed back as a transient
    /// close so the backoff continues
    fn spawn_connect(&self, attempt: u32) {
        let transport = Arc::clone(&self.transport);
        let stabilizer = self.stabilizer.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.connect().await {
                warn!(
                    component = "session",
                    action = "connect",
                    attempt,
                    error = %e,
                    "Connect failed"
                );
                stabilizer.record_error();
                stabilizer
                    .on_close(DisconnectReason::Other(format!("connect failed: {}", e)))
                    .await;
            }
        });
    }
}

fn received<T>(result: Result<T, broadcast::error::RecvError>, source: &'static str) -> Option<T> {
    match result {
        Ok(event) => Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(component = "session", source, skipped, "Event pump lagged");
            None
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectionStrategy;
    use crate::error::TransportError;
    use crate::models::{AckStatus, ConnectionState, MessageStatus, SyncOutcome};
    use crate::persistence::MemorySink;
    use crate::sync::MockSyncWorker;
    use crate::transport::SendReceipt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Opens the session on connect while `connects_allowed` lasts
    struct LoopbackTransport {
        events: mpsc::Sender<TransportEvent>,
        connects: AtomicU32,
        connects_allowed: u32,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl LoopbackTransport {
        fn new(events: mpsc::Sender<TransportEvent>, connects_allowed: u32) -> Arc<Self> {
            Arc::new(Self {
                events,
                connects: AtomicU32::new(0),
                connects_allowed,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.connects_allowed {
                return Err(TransportError::Rejected("refused".to_string()));
            }
            let _ = self.events.send(TransportEvent::Open).await;
            Ok(())
        }

        async fn send(&self, target: &str, payload: &str) -> Result<SendReceipt, TransportError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((target.to_string(), payload.to_string()));
            Ok(SendReceipt::new(format!("wire-{}", sent.len())))
        }
    }

    fn config() -> Config {
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
        config.sync.initial_delay_ms = 864_000_000;
        config.sync.periodic_interval_ms = 864_000_000;
        config.sync.health_check_interval_ms = 864_000_000;
        config
    }

    fn worker() -> Arc<MockSyncWorker> {
        let mut worker = MockSyncWorker::new();
        worker
            .expect_perform_full_sync()
            .returning(|| Ok(SyncOutcome::default()));
        worker
            .expect_perform_incremental_sync()
            .returning(|| Ok(SyncOutcome::default()));
        Arc::new(worker)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn start(
        connects_allowed: u32,
    ) -> (
        Arc<SessionSupervisor>,
        Arc<LoopbackTransport>,
        mpsc::Sender<TransportEvent>,
        tokio::sync::oneshot::Sender<()>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let transport = LoopbackTransport::new(tx.clone(), connects_allowed);
        let supervisor = Arc::new(SessionSupervisor::new(
            config(),
            transport.clone(),
            worker(),
            Arc::new(MemorySink::default()),
        ));
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let runner = Arc::clone(&supervisor);
        let handle = tokio::spawn(async move {
            runner
                .run(rx, async {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        (supervisor, transport, tx, shutdown_tx, handle)
    }

    // Test 1: Queue stays paused until the transport opens
    #[tokio::test]
    async fn test_queue_paused_until_open() {
        let (tx, _rx) = mpsc::channel(8);
        let supervisor = SessionSupervisor::new(
            config(),
            LoopbackTransport::new(tx, 1),
            worker(),
            Arc::new(MemorySink::default()),
        );
        assert!(supervisor.queue().is_paused());
        assert_eq!(supervisor.stabilizer().state(), ConnectionState::Disconnected);
    }

    // Test 2: Open resumes the queue and pending messages are sent
    #[tokio::test]
    async fn test_open_resumes_queue_and_sends() {
        tokio::time::pause();
        let (supervisor, transport, _tx, shutdown, handle) = start(1);
        let id = supervisor
            .send_message(OutboundMessage::new("alice", "hello"))
            .unwrap();

        settle().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        settle().await;

        assert_eq!(supervisor.stabilizer().state(), ConnectionState::Connected);
        assert!(!supervisor.queue().is_paused());
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert_eq!(supervisor.queue().get(&id).unwrap().status, MessageStatus::Sent);

        let _ = shutdown.send(());
        handle.await.unwrap();
    }

    // Test 3: Close pauses the queue and the reconnect reopens the session
    #[tokio::test]
    async fn test_close_triggers_reconnect() {
        tokio::time::pause();
        let (supervisor, transport, tx, shutdown, handle) = start(2);
        settle().await;
        assert_eq!(supervisor.stabilizer().state(), ConnectionState::Connected);

        tx.send(TransportEvent::Close(DisconnectReason::ConnectionLost))
            .await
            .unwrap();
        settle().await;
        assert!(supervisor.queue().is_paused());
        assert_eq!(supervisor.stabilizer().state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        settle().await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.stabilizer().state(), ConnectionState::Connected);
        assert!(!supervisor.queue().is_paused());

        let _ = shutdown.send(());
        handle.await.unwrap();
    }

    // Test 4: Failed connects back off and end in abandonment
    #[tokio::test]
    async fn test_failed_connects_abandon_session() {
        tokio::time::pause();
        let (supervisor, transport, _tx, shutdown, handle) = start(0);
        settle().await;

        // Initial connect fails, then reconnects at 1s, 2s and 4s
        for delay in [1_000, 2_000, 4_000] {
            tokio::time::sleep(Duration::from_millis(delay + 1)).await;
            settle().await;
        }

        assert_eq!(transport.connects.load(Ordering::SeqCst), 4);
        assert_eq!(supervisor.stabilizer().state(), ConnectionState::Abandoned);

        let _ = shutdown.send(());
        handle.await.unwrap();
    }

    // Test 5: Transport acknowledgements reach the queue
    #[tokio::test]
    async fn test_message_ack_confirms_delivery() {
        tokio::time::pause();
        let (supervisor, _transport, tx, shutdown, handle) = start(1);
        let id = supervisor
            .send_message(OutboundMessage::new("bob", "ping"))
            .unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        settle().await;

        tx.send(TransportEvent::MessageAck(DeliveryConfirmation::new(
            id.clone(),
            AckStatus::Delivered,
        )))
        .await
        .unwrap();
        settle().await;

        assert_eq!(supervisor.queue().get(&id).unwrap().status, MessageStatus::Delivered);
        assert_eq!(supervisor.status().queue.delivered, 1);

        let _ = shutdown.send(());
        handle.await.unwrap();
    }

    // Test 6: Shutdown stops the scheduler
    #[tokio::test]
    async fn test_shutdown_stops_components() {
        tokio::time::pause();
        let (supervisor, _transport, _tx, shutdown, handle) = start(1);
        settle().await;

        let _ = shutdown.send(());
        handle.await.unwrap();

        let result = supervisor
            .scheduler()
            .trigger_manual_sync(SyncKind::Incremental)
            .await;
        assert!(matches!(result, Err(crate::error::SyncError::Stopped)));
    }

    // Test 7: Manual syncs surface classified errors until the session opens
    #[tokio::test]
    async fn test_trigger_sync_classifies_errors() {
        tokio::time::pause();
        let (supervisor, _transport, tx, shutdown, handle) = start(0);
        settle().await;

        match supervisor.trigger_sync(SyncKind::Incremental).await {
            Err(err) => assert_eq!(err.class(), crate::error::ErrorClass::Transport),
            Ok(dispatch) => panic!("expected failure, got {:?}", dispatch),
        }

        tx.send(TransportEvent::Open).await.unwrap();
        settle().await;
        assert!(matches!(
            supervisor.trigger_sync(SyncKind::Incremental).await,
            Ok(SyncDispatch::Completed(_))
        ));

        let _ = shutdown.send(());
        handle.await.unwrap();
    }
}
