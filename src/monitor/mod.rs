//! Sync monitoring and alerting
//!
//! [`SyncMonitor`] follows scheduler and queue events, keeps a bounded
//! activity log, derives health from it and raises alerts. At most one
//! unacknowledged alert of each type exists at a time; acknowledging it lets
//! the next violation of that type raise a fresh alert.

pub mod notifier;

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::delivery::MessageReliabilityQueue;
use crate::error::DeliveryError;
use crate::events::{QueueEvent, SchedulerEvent};
use crate::history::BoundedLog;
use crate::models::{
    Alert, AlertSeverity, AlertType, HealthMetrics, HealthStatus, SyncKind, SyncTrigger,
};
use crate::sync::SyncScheduler;
use crate::timer::TimerService;

pub use notifier::{dispatch, LogChannel, NotificationChannel, WebhookChannel};

/// One completed sync run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEntry {
    pub kind: SyncKind,
    pub trigger: SyncTrigger,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated view over the activity log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncMetrics {
    pub health: HealthStatus,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    /// Success ratio over the activity log
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub consecutive_failures: u32,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub active_alerts: usize,
    pub exhausted_deliveries: u64,
    pub scheduler_health: Option<HealthMetrics>,
    pub recent_activity: Vec<ActivityEntry>,
}

struct MonitorState {
    activity: BoundedLog<ActivityEntry>,
    total_runs: u64,
    successful_runs: u64,
    consecutive_failures: u32,
    average_response_ms: Option<f64>,
    last_sync_at: Option<DateTime<Utc>>,
    exhausted_deliveries: u64,
    scheduler_health: Option<HealthMetrics>,
    alerts: Vec<Alert>,
}

impl MonitorState {
    fn failure_rate(&self) -> f64 {
        if self.activity.is_empty() {
            return 0.0;
        }
        let failures = self.activity.iter().filter(|e| !e.success).count();
        failures as f64 / self.activity.len() as f64
    }

    fn has_open_alert(&self, alert_type: AlertType) -> bool {
        self.alerts
            .iter()
            .any(|a| a.alert_type == alert_type && !a.acknowledged)
    }

    /// Raise an alert unless one of the same type is still unacknowledged
    fn raise(
        &mut self,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: String,
        details: serde_json::Value,
    ) -> Option<Alert> {
        if self.has_open_alert(alert_type) {
            debug!(component = "monitor", alert_type = %alert_type, "Alert suppressed, already open");
            return None;
        }
        let alert = Alert::new(alert_type, severity, message, details);
        self.alerts.push(alert.clone());
        Some(alert)
    }
}

struct Inner {
    config: MonitorConfig,
    channels: RwLock<Vec<Arc<dyn NotificationChannel>>>,
    state: Mutex<MonitorState>,
    timers: TimerService,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Observes sync and delivery activity and manages alerts
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncMonitor {
    inner: Arc<Inner>,
}

impl SyncMonitor {
    /// Create a monitor notifying through the log, plus the configured
    /// webhook if any
    pub fn new(config: MonitorConfig) -> Self {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = vec![Arc::new(LogChannel)];
        if let Some(url) = &config.webhook_url {
            match WebhookChannel::new(url.clone(), config.notify_timeout()) {
                Ok(webhook) => channels.push(Arc::new(webhook)),
                Err(e) => warn!(
                    component = "monitor",
                    url = %url,
                    error = %e,
                    "Webhook channel unavailable"
                ),
            }
        }
        Self::with_channels(config, channels)
    }

    /// Create a monitor notifying exactly `channels`
    pub fn with_channels(config: MonitorConfig, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        let activity = BoundedLog::new(config.activity_log_size);
        Self {
            inner: Arc::new(Inner {
                channels: RwLock::new(channels),
                state: Mutex::new(MonitorState {
                    activity,
                    total_runs: 0,
                    successful_runs: 0,
                    consecutive_failures: 0,
                    average_response_ms: None,
                    last_sync_at: None,
                    exhausted_deliveries: 0,
                    scheduler_health: None,
                    alerts: Vec::new(),
                }),
                timers: TimerService::new(),
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    /// Register an additional notification channel
    pub fn add_channel(&self, channel: Arc<dyn NotificationChannel>) {
        debug!(component = "monitor", channel = channel.name(), "Notification channel added");
        self.inner
            .channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(channel);
    }

    /// Follow `scheduler` events and start the alert cleanup sweep
    pub fn initialize(&self, scheduler: &SyncScheduler) {
        let rx = scheduler.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(follow(rx, weak, |inner, event| {
            Box::pin(async move { inner.process_scheduler_event(&event).await })
        }));
        self.inner.tasks().push(task);

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .timers
            .schedule_repeating(self.inner.config.cleanup_interval(), move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.cleanup_alerts();
                    }
                }
            });
        info!(
            component = "monitor",
            channels = self.inner.channels().len(),
            "Sync monitor initialized"
        );
    }

    /// Follow `queue` events for exhausted deliveries
    pub fn observe_queue(&self, queue: &MessageReliabilityQueue) {
        let rx = queue.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(follow(rx, weak, |inner, event| {
            Box::pin(async move { inner.process_queue_event(&event).await })
        }));
        self.inner.tasks().push(task);
    }

    /// Apply one scheduler event
    pub async fn process_scheduler_event(&self, event: &SchedulerEvent) {
        self.inner.process_scheduler_event(event).await;
    }

    /// Apply one queue event
    pub async fn process_queue_event(&self, event: &QueueEvent) {
        self.inner.process_queue_event(event).await;
    }

    pub fn get_metrics(&self) -> SyncMetrics {
        self.inner.metrics()
    }

    /// Alerts, newest first
    pub fn get_alerts(&self, include_acknowledged: bool) -> Vec<Alert> {
        let st = self.inner.lock();
        st.alerts
            .iter()
            .rev()
            .filter(|a| include_acknowledged || !a.acknowledged)
            .cloned()
            .collect()
    }

    /// Mark an alert acknowledged; false if unknown or already acknowledged
    pub fn acknowledge_alert(&self, id: &str) -> bool {
        let mut st = self.inner.lock();
        match st.alerts.iter_mut().find(|a| a.id == id && !a.acknowledged) {
            Some(alert) => {
                alert.acknowledged = true;
                alert.acknowledged_at = Some(Utc::now());
                info!(component = "monitor", alert_id = id, "Alert acknowledged");
                true
            }
            None => false,
        }
    }

    /// Remove alerts older than the retention window
    pub fn cleanup_alerts(&self) -> usize {
        self.inner.cleanup_alerts()
    }

    /// Stop following events and cancel the cleanup sweep
    pub fn stop(&self) {
        for task in self.inner.tasks().drain(..) {
            task.abort();
        }
        self.inner.timers.cancel_all();
        info!(component = "monitor", "Sync monitor stopped");
    }
}

type EventFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Feed every event from `rx` to `handle` until the channel closes or the
/// monitor is dropped
async fn follow<E, F>(mut rx: broadcast::Receiver<E>, weak: std::sync::Weak<Inner>, handle: F)
where
    E: Clone + Send + 'static,
    F: Fn(Arc<Inner>, E) -> EventFuture + Send + 'static,
{
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                handle(inner, event).await;
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(component = "monitor", missed, "Monitor lagged behind events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn process_scheduler_event(&self, event: &SchedulerEvent) {
        let raised = {
            let mut st = self.lock();
            match event {
                SchedulerEvent::SyncCompleted {
                    kind,
                    trigger,
                    duration,
                    ..
                } => {
                    st.consecutive_failures = 0;
                    st.successful_runs += 1;
                    st.last_sync_at = Some(Utc::now());
                    self.record_run(&mut st, *kind, *trigger, *duration, None);
                    self.evaluate_rules(&mut st)
                }
                SchedulerEvent::SyncFailed {
                    kind,
                    trigger,
                    duration,
                    error,
                    ..
                } => {
                    st.consecutive_failures += 1;
                    self.record_run(&mut st, *kind, *trigger, *duration, Some(error.clone()));
                    self.evaluate_rules(&mut st)
                }
                SchedulerEvent::HealthCheck { metrics } => {
                    st.scheduler_health = Some(metrics.clone());
                    Vec::new()
                }
                SchedulerEvent::HealthCritical { recent_failures } => st
                    .raise(
                        AlertType::CriticalHealth,
                        AlertSeverity::Critical,
                        format!(
                            "Sync health critical: {} failures within the failure window",
                            recent_failures
                        ),
                        json!({ "recent_failures": recent_failures }),
                    )
                    .into_iter()
                    .collect(),
                SchedulerEvent::SyncSystemFailure { error } => st
                    .raise(
                        AlertType::SystemFailure,
                        AlertSeverity::Critical,
                        format!("Sync recovery failed: {}", error),
                        json!({ "error": error }),
                    )
                    .into_iter()
                    .collect(),
                SchedulerEvent::RecoverySucceeded => {
                    info!(component = "monitor", "Sync recovered");
                    Vec::new()
                }
                _ => Vec::new(),
            }
        };

        self.notify(raised).await;
    }

    async fn process_queue_event(&self, event: &QueueEvent) {
        let raised = match event {
            QueueEvent::Failed {
                id,
                error: DeliveryError::ExhaustedRetries {
                    attempts,
                    last_error,
                },
            } => {
                let mut st = self.lock();
                st.exhausted_deliveries += 1;
                st.raise(
                    AlertType::DeliveryExhausted,
                    AlertSeverity::Warning,
                    format!("Message {} failed after {} attempts", id, attempts),
                    json!({ "message_id": id, "attempts": attempts, "last_error": last_error }),
                )
            }
            _ => None,
        };

        self.notify(raised.into_iter().collect()).await;
    }

    fn record_run(
        &self,
        st: &mut MonitorState,
        kind: SyncKind,
        trigger: SyncTrigger,
        duration: std::time::Duration,
        error: Option<String>,
    ) {
        let duration_ms = duration.as_millis() as u64;
        let alpha = self.config.ema_alpha;
        st.average_response_ms = Some(match st.average_response_ms {
            Some(avg) => alpha * duration_ms as f64 + (1.0 - alpha) * avg,
            None => duration_ms as f64,
        });
        st.total_runs += 1;
        st.activity.push(ActivityEntry {
            kind,
            trigger,
            success: error.is_none(),
            duration_ms,
            error,
            timestamp: Utc::now(),
        });
    }

    fn evaluate_rules(&self, st: &mut MonitorState) -> Vec<Alert> {
        let config = &self.config;
        let mut raised = Vec::new();

        let consecutive = st.consecutive_failures;
        if consecutive >= config.consecutive_failure_threshold {
            let severity = if consecutive >= config.consecutive_failure_threshold * 2 {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            raised.extend(st.raise(
                AlertType::ConsecutiveFailures,
                severity,
                format!("{} consecutive sync failures", consecutive),
                json!({ "consecutive_failures": consecutive }),
            ));
        }

        let samples = st.activity.len();
        let error_rate = st.failure_rate();
        if samples >= config.min_samples && error_rate > config.error_rate_threshold {
            raised.extend(st.raise(
                AlertType::HighErrorRate,
                AlertSeverity::Warning,
                format!("Sync error rate {:.0}% over {} runs", error_rate * 100.0, samples),
                json!({ "error_rate": error_rate, "samples": samples }),
            ));
        }

        if let Some(avg) = st.average_response_ms {
            if avg > config.slow_response_threshold_ms as f64 {
                raised.extend(st.raise(
                    AlertType::SlowResponse,
                    AlertSeverity::Warning,
                    format!("Average sync duration {:.0}ms", avg),
                    json!({
                        "average_response_time_ms": avg,
                        "threshold_ms": config.slow_response_threshold_ms
                    }),
                ));
            }
        }

        raised
    }

    fn health(&self, st: &MonitorState) -> HealthStatus {
        let critical_open = st.alerts.iter().any(|a| {
            !a.acknowledged
                && matches!(
                    a.alert_type,
                    AlertType::CriticalHealth | AlertType::SystemFailure
                )
        });
        if critical_open {
            return HealthStatus::Critical;
        }
        if st.activity.is_empty() {
            return HealthStatus::Healthy;
        }

        let success_rate = 1.0 - st.failure_rate();
        if success_rate < self.config.critical_success_rate {
            HealthStatus::Critical
        } else if success_rate < self.config.degraded_success_rate
            || st.consecutive_failures >= self.config.consecutive_failure_threshold
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn metrics(&self) -> SyncMetrics {
        let st = self.lock();
        SyncMetrics {
            health: self.health(&st),
            total_runs: st.total_runs,
            successful_runs: st.successful_runs,
            failed_runs: st.total_runs - st.successful_runs,
            success_rate: if st.activity.is_empty() {
                1.0
            } else {
                1.0 - st.failure_rate()
            },
            average_response_time_ms: st.average_response_ms.unwrap_or(0.0),
            consecutive_failures: st.consecutive_failures,
            last_sync_at: st.last_sync_at,
            active_alerts: st.alerts.iter().filter(|a| !a.acknowledged).count(),
            exhausted_deliveries: st.exhausted_deliveries,
            scheduler_health: st.scheduler_health.clone(),
            recent_activity: st.activity.iter().cloned().collect(),
        }
    }

    fn cleanup_alerts(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.alert_retention())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = Utc::now() - retention;

        let mut st = self.lock();
        let before = st.alerts.len();
        st.alerts.retain(|a| a.timestamp > cutoff);
        let removed = before - st.alerts.len();
        if removed > 0 {
            debug!(component = "monitor", removed, "Expired alerts removed");
        }
        removed
    }

    fn channels(&self) -> Vec<Arc<dyn NotificationChannel>> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn notify(&self, alerts: Vec<Alert>) {
        if alerts.is_empty() {
            return;
        }
        let channels = self.channels();
        for alert in alerts {
            dispatch(&channels, &alert, self.config.notify_timeout()).await;
        }
    }
}
