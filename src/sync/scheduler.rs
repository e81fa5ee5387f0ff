//! Sync scheduler
//!
//! Orchestrates full and incremental synchronization runs against a
//! [`SyncWorker`]. Runs are throttled by a minimum interval, bounded by a
//! counting semaphore, retried with exponential backoff and escalated into a
//! single auto-recovery attempt when failures pile up within the failure
//! window.
//!
//! Every connection change bumps an epoch. A run that started under an older
//! epoch still records its outcome but no longer schedules retries or drains
//! the queue.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::SyncWorker;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{SchedulerEvent, EVENT_CHANNEL_CAPACITY};
use crate::history::BoundedLog;
use crate::models::{
    HealthMetrics, HealthStatus, SyncJob, SyncKind, SyncLogRecord, SyncOutcome, SyncPhase,
    SyncStatus, SyncTrigger,
};
use crate::persistence::{BoundedSink, PersistenceSink};
use crate::timer::{TimerId, TimerService};

/// How a sync request was handled
#[derive(Debug, Clone, PartialEq)]
pub enum SyncDispatch {
    /// The run finished successfully
    Completed(SyncOutcome),
    /// Too soon after the previous run; nothing was executed
    Throttled { wait: Duration },
    /// Every slot is busy; the job waits in the queue
    Queued { job_id: String, queue_len: usize },
}

struct SchedulerState {
    worker: Option<Arc<dyn SyncWorker>>,
    connected: bool,
    stopped: bool,
    epoch: u64,
    phase: SyncPhase,
    blocked: bool,
    /// Recent failures that started the running auto-recovery
    recovery: Option<usize>,
    /// Start of the most recent run, for throttling
    last_run_at: Option<Instant>,
    consecutive_failures: u32,
    recent_failures: BoundedLog<Instant>,
    /// Pending jobs, highest priority first, at most one per kind
    queue: Vec<SyncJob>,
    retry_timer: Option<TimerId>,
    status: SyncStatus,
}

/// Work left to do once a run's bookkeeping is done
#[derive(Default)]
struct FollowUp {
    consecutive_failures: u32,
    retry: Option<(u32, Duration)>,
    exhausted: Option<u32>,
    critical: Option<usize>,
    drain: Option<SyncJob>,
}

struct Inner {
    config: SyncConfig,
    sink: BoundedSink,
    semaphore: Arc<Semaphore>,
    state: Mutex<SchedulerState>,
    timers: TimerService,
    events: broadcast::Sender<SchedulerEvent>,
}

/// Throttled, concurrency-bounded sync orchestration
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

impl SyncScheduler {
    pub fn new(config: SyncConfig, sink: Arc<dyn PersistenceSink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let permits = config.max_concurrent_syncs.max(1);
        let failure_capacity = config.max_failed_syncs.max(100);
        let sink = BoundedSink::new("sync", sink, config.persistence_timeout());

        Self {
            inner: Arc::new(Inner {
                sink,
                semaphore: Arc::new(Semaphore::new(permits)),
                state: Mutex::new(SchedulerState {
                    worker: None,
                    connected: false,
                    stopped: false,
                    epoch: 0,
                    phase: SyncPhase::Idle,
                    blocked: false,
                    recovery: None,
                    last_run_at: None,
                    consecutive_failures: 0,
                    recent_failures: BoundedLog::new(failure_capacity),
                    queue: Vec::new(),
                    retry_timer: None,
                    status: SyncStatus::default(),
                }),
                timers: TimerService::new(),
                events,
                config,
            }),
        }
    }

    /// Install the worker that performs the actual synchronization
    pub fn initialize(&self, worker: Arc<dyn SyncWorker>) {
        let mut st = self.inner.lock();
        st.worker = Some(worker);
        st.stopped = false;
        info!(
            component = "sync",
            max_concurrent = self.inner.config.max_concurrent_syncs,
            min_interval_ms = self.inner.config.min_sync_interval_ms,
            "Sync scheduler initialized"
        );
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Run a sync on demand, subject to throttling and the concurrency limit
    pub async fn trigger_manual_sync(&self, kind: SyncKind) -> Result<SyncDispatch, SyncError> {
        info!(component = "sync", kind = %kind, "Manual sync requested");
        self.inner.execute(kind, SyncTrigger::Manual, false).await
    }

    /// Run a sync with an explicit trigger, subject to throttling
    pub async fn execute_sync_with_throttling(
        &self,
        kind: SyncKind,
        trigger: SyncTrigger,
    ) -> Result<SyncDispatch, SyncError> {
        self.inner.execute(kind, trigger, false).await
    }

    /// Remove a queued job before it starts
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let job = {
            let mut st = self.inner.lock();
            let position = st.queue.iter().position(|job| job.id == job_id);
            position.map(|i| st.queue.remove(i))
        };

        match job {
            Some(job) => {
                info!(component = "sync", kind = %job.kind, job_id, "Queued sync cancelled");
                self.inner.emit(SchedulerEvent::SyncCancelled {
                    kind: job.kind,
                    job_id: job.id,
                });
                true
            }
            None => false,
        }
    }

    /// Jobs waiting for a slot, in the order they will run
    pub fn queued_jobs(&self) -> Vec<SyncJob> {
        self.inner.lock().queue.clone()
    }

    pub fn get_sync_status(&self) -> SyncStatus {
        let inner = &self.inner;
        let active = inner.active_jobs();
        let st = inner.lock();

        let mut status = st.status.clone();
        status.is_running = active > 0;
        status.phase = if active > 0 { SyncPhase::Running } else { st.phase };
        status.is_blocked = st.blocked;
        status.failed_attempts = st.consecutive_failures;
        status.queued_jobs = st.queue.len();
        status
    }

    pub fn get_health_metrics(&self) -> HealthMetrics {
        self.inner.health_metrics()
    }

    /// Compute health, emit it and start auto-recovery if critical
    pub fn run_health_check(&self) -> HealthMetrics {
        self.inner.run_health_check()
    }

    /// Start the initial, periodic and health-check timers
    pub fn on_connection_established(&self) {
        self.inner.on_connection_established();
    }

    /// Cancel every timer and drop queued jobs
    pub fn on_connection_lost(&self) {
        self.inner.on_connection_lost();
    }

    /// Cancel all scheduled work; later requests fail with `Stopped`
    pub fn stop(&self) {
        {
            let mut st = self.inner.lock();
            st.stopped = true;
            st.epoch += 1;
            st.queue.clear();
            st.retry_timer = None;
            st.recovery = None;
        }
        self.inner.timers.cancel_all();
        info!(component = "sync", "Sync scheduler stopped");
        self.inner.emit(SchedulerEvent::Stopped);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    fn active_jobs(&self) -> usize {
        self.config
            .max_concurrent_syncs
            .max(1)
            .saturating_sub(self.semaphore.available_permits())
    }

    fn recent_failure_count(&self, st: &mut SchedulerState, now: Instant) -> usize {
        let window = self.config.failure_window();
        st.recent_failures
            .prune_front(|at| now.saturating_duration_since(*at) >= window);
        st.recent_failures.len()
    }

    async fn execute(
        self: &Arc<Self>,
        kind: SyncKind,
        trigger: SyncTrigger,
        bypass_throttle: bool,
    ) -> Result<SyncDispatch, SyncError> {
        let (worker, epoch, permit) = {
            let mut st = self.lock();
            if st.stopped {
                return Err(SyncError::Stopped);
            }
            let worker = st.worker.clone().ok_or(SyncError::NotInitialized)?;
            if !st.connected {
                return Err(SyncError::NotConnected);
            }
            if let Some(recent_failures) = st.recovery {
                debug!(component = "sync", kind = %kind, trigger = %trigger, "Sync refused during auto-recovery");
                return Err(SyncError::CriticalHealth(recent_failures));
            }

            if !bypass_throttle {
                let min_interval = self.config.min_sync_interval();
                if let Some(last) = st.last_run_at {
                    let elapsed = Instant::now().saturating_duration_since(last);
                    if elapsed < min_interval {
                        let wait = min_interval - elapsed;
                        drop(st);
                        debug!(
                            component = "sync",
                            kind = %kind,
                            trigger = %trigger,
                            wait_ms = wait.as_millis() as u64,
                            "Sync throttled"
                        );
                        self.emit(SchedulerEvent::SyncThrottled { kind, wait });
                        return Ok(SyncDispatch::Throttled { wait });
                    }
                }
            }

            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => (worker, st.epoch, permit),
                Err(_) => {
                    let job_id = match st.queue.iter().find(|job| job.kind == kind) {
                        Some(queued) => queued.id.clone(),
                        None => {
                            let job = SyncJob::new(kind, trigger);
                            let job_id = job.id.clone();
                            let position = st
                                .queue
                                .iter()
                                .position(|queued| queued.priority < job.priority)
                                .unwrap_or(st.queue.len());
                            st.queue.insert(position, job);
                            job_id
                        }
                    };
                    let queue_len = st.queue.len();
                    drop(st);
                    debug!(component = "sync", kind = %kind, job_id = %job_id, queue_len, "Sync queued");
                    self.emit(SchedulerEvent::SyncQueued { kind, queue_len });
                    return Ok(SyncDispatch::Queued { job_id, queue_len });
                }
            }
        };

        self.run_job(worker, kind, trigger, epoch, permit).await
    }

    /// Run `execute` on its own task, detached from the caller
    fn spawn_job(self: &Arc<Self>, kind: SyncKind, trigger: SyncTrigger, bypass_throttle: bool) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.execute(kind, trigger, bypass_throttle).await {
                debug!(
                    component = "sync",
                    kind = %kind,
                    trigger = %trigger,
                    error = %e,
                    "Background sync did not complete"
                );
            }
        });
    }

    async fn run_job(
        self: &Arc<Self>,
        worker: Arc<dyn SyncWorker>,
        kind: SyncKind,
        trigger: SyncTrigger,
        epoch: u64,
        permit: OwnedSemaphorePermit,
    ) -> Result<SyncDispatch, SyncError> {
        {
            let mut st = self.lock();
            st.phase = SyncPhase::Running;
            st.last_run_at = Some(Instant::now());
            // Any trigger other than a retry starts a fresh retry sequence
            if trigger != SyncTrigger::Retry && st.blocked {
                st.blocked = false;
                st.consecutive_failures = 0;
            }
        }
        info!(component = "sync", action = "run", kind = %kind, trigger = %trigger, "Sync started");
        self.emit(SchedulerEvent::SyncStarted { kind, trigger });

        let started_at = Utc::now();
        let start = Instant::now();
        let timeout = self.config.sync_timeout();
        let run = async {
            match kind {
                SyncKind::Full => worker.perform_full_sync().await,
                SyncKind::Incremental => worker.perform_incremental_sync().await,
            }
        };
        let result = match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(timeout)),
        };
        let duration = start.elapsed();
        drop(permit);

        let follow_up = self.finish_job(kind, epoch, trigger, duration, &result);

        let record = SyncLogRecord {
            kind,
            trigger,
            started_at,
            duration_ms: duration.as_millis() as u64,
            success: result.is_ok(),
            outcome: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        self.sink.append_sync_log(&record).await;

        match &result {
            Ok(outcome) => {
                info!(
                    component = "sync",
                    action = "run",
                    kind = %kind,
                    trigger = %trigger,
                    duration_ms = duration.as_millis() as u64,
                    records = outcome.total(),
                    errors = outcome.errors.len(),
                    "{} sync completed",
                    kind
                );
                self.emit(SchedulerEvent::SyncCompleted {
                    kind,
                    trigger,
                    duration,
                    outcome: outcome.clone(),
                });
            }
            Err(e) => {
                warn!(
                    component = "sync",
                    action = "run",
                    kind = %kind,
                    trigger = %trigger,
                    attempt = follow_up.consecutive_failures,
                    error = %e,
                    "{} sync failed",
                    kind
                );
                self.emit(SchedulerEvent::SyncFailed {
                    kind,
                    trigger,
                    duration,
                    error: e.to_string(),
                    consecutive_failures: follow_up.consecutive_failures,
                });
            }
        }

        if let Some(attempts) = follow_up.exhausted {
            error!(
                component = "sync",
                attempt = attempts,
                "Sync retries exhausted, waiting for a new trigger"
            );
            self.emit(SchedulerEvent::SyncRetryExhausted { attempts });
        }
        if let Some((attempt, delay)) = follow_up.retry {
            self.schedule_retry(kind, attempt, delay);
        }
        if let Some(recent_failures) = follow_up.critical {
            self.start_recovery(recent_failures);
        }
        if let Some(job) = follow_up.drain {
            debug!(component = "sync", kind = %job.kind, job_id = %job.id, "Draining queued sync");
            self.spawn_job(job.kind, job.reason, true);
        }

        if let Some(recent_failures) = follow_up.critical {
            return Err(SyncError::CriticalHealth(recent_failures));
        }
        if let Some(attempts) = follow_up.exhausted {
            return Err(SyncError::ExhaustedRetries(attempts));
        }
        result.map(SyncDispatch::Completed)
    }

    /// Update counters and decide what happens next
    fn finish_job(
        &self,
        kind: SyncKind,
        epoch: u64,
        trigger: SyncTrigger,
        duration: Duration,
        result: &Result<SyncOutcome, SyncError>,
    ) -> FollowUp {
        let now = Instant::now();
        let mut st = self.lock();

        let duration_ms = duration.as_millis() as f64;
        let alpha = self.config.ema_alpha;
        st.status.average_sync_duration_ms = if st.status.total_syncs == 0 {
            duration_ms
        } else {
            alpha * duration_ms + (1.0 - alpha) * st.status.average_sync_duration_ms
        };
        st.status.total_syncs += 1;
        st.phase = SyncPhase::Idle;

        match result {
            Ok(_) => {
                st.status.successful_syncs += 1;
                st.consecutive_failures = 0;
                st.blocked = false;
                st.status.last_sync_at = Some(Utc::now());
                if kind == SyncKind::Full {
                    st.status.last_full_sync_at = st.status.last_sync_at;
                }
                st.status.last_error = None;
            }
            Err(e) => {
                st.status.failed_syncs += 1;
                st.consecutive_failures += 1;
                st.recent_failures.push(now);
                st.status.last_error = Some(e.to_string());
            }
        }

        let mut follow_up = FollowUp {
            consecutive_failures: st.consecutive_failures,
            ..FollowUp::default()
        };
        if st.epoch != epoch || st.stopped {
            return follow_up;
        }

        if result.is_err() && trigger != SyncTrigger::Recovery {
            let recent = self.recent_failure_count(&mut st, now);
            if recent >= self.config.max_failed_syncs && st.recovery.is_none() {
                follow_up.critical = Some(recent);
            } else if st.consecutive_failures >= self.config.max_retries {
                st.blocked = true;
                st.phase = SyncPhase::Blocked;
                follow_up.exhausted = Some(st.consecutive_failures);
            } else {
                // n = failures before this one
                let delay = self
                    .config
                    .retry_policy()
                    .delay_for_attempt(st.consecutive_failures - 1);
                st.phase = SyncPhase::RetryScheduled;
                follow_up.retry = Some((st.consecutive_failures, delay));
            }
        }

        if follow_up.critical.is_none() && !st.queue.is_empty() {
            follow_up.drain = Some(st.queue.remove(0));
        }
        if follow_up.retry.is_none() {
            st.status.next_scheduled_sync = Some(after(self.config.periodic_interval()));
        }
        follow_up
    }

    fn schedule_retry(self: &Arc<Self>, kind: SyncKind, attempt: u32, delay: Duration) {
        let weak = Arc::downgrade(self);
        let timer = self.timers.schedule_once(delay, move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.lock().retry_timer = None;
                inner.spawn_job(kind, SyncTrigger::Retry, true);
            }
        });

        let previous = {
            let mut st = self.lock();
            st.status.next_scheduled_sync = Some(after(delay));
            st.retry_timer.replace(timer)
        };
        if let Some(previous) = previous {
            self.timers.cancel(previous);
        }

        info!(
            component = "sync",
            action = "retry",
            kind = %kind,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Sync retry scheduled"
        );
        self.emit(SchedulerEvent::RetryScheduled {
            kind,
            attempt,
            delay,
        });
    }

    /// Reset error state, wait for the connection to settle and try one
    /// incremental sync
    fn start_recovery(self: &Arc<Self>, recent_failures: usize) {
        let retry_timer = {
            let mut st = self.lock();
            if st.recovery.is_some() || st.stopped {
                return;
            }
            st.recovery = Some(recent_failures);
            st.queue.clear();
            st.consecutive_failures = 0;
            st.recent_failures.clear();
            st.blocked = false;
            st.phase = SyncPhase::Scheduled;
            st.status.next_scheduled_sync = Some(after(self.config.recovery_delay()));
            st.retry_timer.take()
        };
        if let Some(timer) = retry_timer {
            self.timers.cancel(timer);
        }

        error!(
            component = "sync",
            action = "recovery",
            recent_failures,
            delay_ms = self.config.recovery_delay_ms,
            "Sync health critical, starting auto-recovery"
        );
        self.emit(SchedulerEvent::HealthCritical { recent_failures });
        self.emit(SchedulerEvent::RecoveryStarted);

        let weak = Arc::downgrade(self);
        self.timers
            .schedule_once(self.config.recovery_delay(), move || async move {
                if let Some(inner) = weak.upgrade() {
                    let task = Arc::clone(&inner);
                    tokio::spawn(async move { task.run_recovery().await });
                }
            });
    }

    async fn run_recovery(self: &Arc<Self>) {
        let (worker, epoch) = {
            let mut st = self.lock();
            match st.worker.clone() {
                Some(worker) if st.connected && !st.stopped => (worker, st.epoch),
                _ => {
                    st.recovery = None;
                    return;
                }
            }
        };

        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.lock().recovery = None;
                return;
            }
        };

        let result = self
            .run_job(worker, SyncKind::Incremental, SyncTrigger::Recovery, epoch, permit)
            .await;
        self.lock().recovery = None;

        match result {
            Ok(_) => {
                info!(component = "sync", action = "recovery", "Sync recovery succeeded");
                self.emit(SchedulerEvent::RecoverySucceeded);
            }
            Err(e) => {
                error!(
                    component = "sync",
                    action = "recovery",
                    error = %e,
                    "Sync recovery failed, external intervention required"
                );
                self.emit(SchedulerEvent::SyncSystemFailure {
                    error: e.to_string(),
                });
            }
        }
    }

    fn health_metrics(&self) -> HealthMetrics {
        let now = Instant::now();
        let active_jobs = self.active_jobs();
        let mut st = self.lock();
        let recent_failures = self.recent_failure_count(&mut st, now);

        let total = st.status.total_syncs;
        let success_rate = if total == 0 {
            1.0
        } else {
            st.status.successful_syncs as f64 / total as f64
        };

        let status = if recent_failures >= self.config.max_failed_syncs {
            HealthStatus::Critical
        } else if st.consecutive_failures > 0 || !st.connected {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthMetrics {
            status,
            recent_failures,
            consecutive_failures: st.consecutive_failures,
            success_rate,
            average_sync_duration_ms: st.status.average_sync_duration_ms,
            active_jobs,
            queued_jobs: st.queue.len(),
            is_connected: st.connected,
            last_check: Utc::now(),
        }
    }

    fn run_health_check(self: &Arc<Self>) -> HealthMetrics {
        let metrics = self.health_metrics();
        debug!(
            component = "sync",
            action = "health_check",
            status = %metrics.status,
            recent_failures = metrics.recent_failures,
            "Sync health checked"
        );
        self.emit(SchedulerEvent::HealthCheck {
            metrics: metrics.clone(),
        });

        let recovering = self.lock().recovery.is_some();
        if metrics.status == HealthStatus::Critical && !recovering {
            self.start_recovery(metrics.recent_failures);
        }
        metrics
    }

    fn on_connection_established(self: &Arc<Self>) {
        let kind = {
            let mut st = self.lock();
            if st.stopped {
                return;
            }
            st.connected = true;
            st.epoch += 1;
            // The reconnect cancels any pending recovery timer below
            st.recovery = None;
            st.phase = SyncPhase::Scheduled;
            st.status.next_scheduled_sync = Some(after(self.config.initial_delay()));
            if st.status.last_full_sync_at.is_none() {
                SyncKind::Full
            } else {
                SyncKind::Incremental
            }
        };
        self.timers.cancel_all();

        info!(
            component = "sync",
            initial_kind = %kind,
            initial_delay_ms = self.config.initial_delay_ms,
            "Connection established, scheduling syncs"
        );
        self.emit(SchedulerEvent::ConnectionEstablished);

        let weak = Arc::downgrade(self);
        self.timers
            .schedule_once(self.config.initial_delay(), move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.spawn_job(kind, SyncTrigger::Initial, false);
                }
            });

        let weak = Arc::downgrade(self);
        self.timers
            .schedule_repeating(self.config.periodic_interval(), move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.spawn_job(SyncKind::Incremental, SyncTrigger::Periodic, false);
                    }
                }
            });

        let weak = Arc::downgrade(self);
        self.timers
            .schedule_repeating(self.config.health_check_interval(), move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.run_health_check();
                    }
                }
            });
    }

    fn on_connection_lost(&self) {
        let dropped = {
            let mut st = self.lock();
            st.connected = false;
            st.epoch += 1;
            st.retry_timer = None;
            st.recovery = None;
            st.status.next_scheduled_sync = None;
            if st.phase != SyncPhase::Running {
                st.phase = SyncPhase::Idle;
            }
            std::mem::take(&mut st.queue).len()
        };
        self.timers.cancel_all();

        info!(
            component = "sync",
            dropped_jobs = dropped,
            "Connection lost, sync timers cancelled"
        );
        self.emit(SchedulerEvent::ConnectionLost);
    }
}

/// Wall-clock time `delay` from now
fn after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::persistence::MemorySink;
    use crate::sync::MockSyncWorker;

    #[derive(Default)]
    struct ScriptedWorker {
        results: Mutex<VecDeque<Result<SyncOutcome, SyncError>>>,
        calls: Mutex<Vec<SyncKind>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        gate: Option<Arc<Notify>>,
        hang: bool,
    }

    impl ScriptedWorker {
        fn scripted(results: Vec<Result<SyncOutcome, SyncError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                ..Default::default()
            }
        }

        fn gated(gate: Arc<Notify>, results: Vec<Result<SyncOutcome, SyncError>>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::scripted(results)
            }
        }

        fn calls(&self) -> Vec<SyncKind> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, kind: SyncKind) -> usize {
            self.calls().iter().filter(|k| **k == kind).count()
        }

        async fn run(&self, kind: SyncKind) -> Result<SyncOutcome, SyncError> {
            self.calls.lock().unwrap().push(kind);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.hang {
                std::future::pending::<()>().await;
            }

            self.running.fetch_sub(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(SyncOutcome::default()))
        }
    }

    #[async_trait]
    impl SyncWorker for ScriptedWorker {
        async fn perform_full_sync(&self) -> Result<SyncOutcome, SyncError> {
            self.run(SyncKind::Full).await
        }

        async fn perform_incremental_sync(&self) -> Result<SyncOutcome, SyncError> {
            self.run(SyncKind::Incremental).await
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            initial_delay_ms: 864_000_000,
            periodic_interval_ms: 864_000_000,
            health_check_interval_ms: 864_000_000,
            min_sync_interval_ms: 0,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            ..Default::default()
        }
    }

    fn connected(config: SyncConfig, worker: Arc<dyn SyncWorker>) -> (SyncScheduler, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let scheduler = SyncScheduler::new(config, sink.clone());
        scheduler.initialize(worker);
        scheduler.on_connection_established();
        (scheduler, sink)
    }

    fn failure() -> Result<SyncOutcome, SyncError> {
        Err(SyncError::Worker("db locked".to_string()))
    }

    fn drain(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    // Test 1: A second trigger within the minimum interval is throttled
    #[tokio::test]
    async fn test_throttle_within_min_interval() {
        tokio::time::pause();
        let worker = Arc::new(ScriptedWorker::default());
        let (scheduler, _) = connected(
            SyncConfig {
                min_sync_interval_ms: 60_000,
                ..config()
            },
            worker.clone(),
        );
        let mut rx = scheduler.subscribe();

        let first = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        assert!(matches!(first, Ok(SyncDispatch::Completed(_))));

        tokio::time::advance(Duration::from_secs(30)).await;
        match scheduler.trigger_manual_sync(SyncKind::Incremental).await {
            Ok(SyncDispatch::Throttled { wait }) => {
                assert!(wait <= Duration::from_secs(30));
                assert!(wait > Duration::from_secs(29));
            }
            other => panic!("expected throttled, got {:?}", other),
        }
        assert_eq!(worker.count(SyncKind::Incremental), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let third = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        assert!(matches!(third, Ok(SyncDispatch::Completed(_))));
        assert_eq!(worker.count(SyncKind::Incremental), 2);

        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SchedulerEvent::SyncThrottled { kind: SyncKind::Incremental, .. })));
    }

    // Test 2: Failures are retried with doubling backoff
    #[tokio::test]
    async fn test_retry_backoff_doubles() {
        tokio::time::pause();
        let worker = Arc::new(ScriptedWorker::scripted(vec![failure(), failure()]));
        let (scheduler, sink) = connected(config(), worker.clone());
        let mut rx = scheduler.subscribe();

        let result = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        assert_eq!(result, Err(SyncError::Worker("db locked".to_string())));
        assert_eq!(scheduler.get_sync_status().phase, SyncPhase::RetryScheduled);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert_eq!(worker.calls().len(), 2);

        tokio::time::sleep(Duration::from_millis(2_001)).await;
        assert_eq!(worker.calls().len(), 3);

        let retries: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SchedulerEvent::RetryScheduled { attempt, delay, .. } => Some((attempt, delay)),
                _ => None,
            })
            .collect();
        assert_eq!(
            retries,
            vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
        );

        let status = scheduler.get_sync_status();
        assert_eq!(status.successful_syncs, 1);
        assert_eq!(status.failed_syncs, 2);
        assert_eq!(status.failed_attempts, 0);
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(sink.sync_logs().len(), 3);
    }

    // Test 3: Retries stop after max_retries until a new trigger
    #[tokio::test]
    async fn test_retry_exhausted_blocks() {
        tokio::time::pause();
        let worker = Arc::new(ScriptedWorker::scripted(vec![failure(); 4]));
        let (scheduler, _) = connected(
            SyncConfig {
                max_retries: 2,
                ..config()
            },
            worker.clone(),
        );
        let mut rx = scheduler.subscribe();

        let _ = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert_eq!(worker.calls().len(), 2);

        let events = drain(&mut rx);
        assert!(events.contains(&SchedulerEvent::SyncRetryExhausted { attempts: 2 }));
        let status = scheduler.get_sync_status();
        assert!(status.is_blocked);
        assert_eq!(status.phase, SyncPhase::Blocked);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(worker.calls().len(), 2);

        // A new trigger starts a fresh retry sequence
        let _ = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        assert_eq!(worker.calls().len(), 3);
        assert!(drain(&mut rx).contains(&SchedulerEvent::RetryScheduled {
            kind: SyncKind::Incremental,
            attempt: 1,
            delay: Duration::from_secs(1),
        }));
    }

    // Test 4: Jobs beyond the concurrency limit are queued by priority, one per kind
    #[tokio::test]
    async fn test_queue_when_slots_busy() {
        let gate = Arc::new(Notify::new());
        let worker = Arc::new(ScriptedWorker::gated(gate.clone(), vec![]));
        let (scheduler, _) = connected(config(), worker.clone());

        let background = scheduler.clone();
        let first = tokio::spawn(async move {
            background.trigger_manual_sync(SyncKind::Incremental).await
        });
        wait_until(|| worker.running.load(Ordering::SeqCst) == 1).await;

        assert!(matches!(
            scheduler.trigger_manual_sync(SyncKind::Incremental).await,
            Ok(SyncDispatch::Queued { queue_len: 1, .. })
        ));
        let full = match scheduler.trigger_manual_sync(SyncKind::Full).await {
            Ok(SyncDispatch::Queued { job_id, queue_len: 2 }) => job_id,
            other => panic!("expected queued, got {:?}", other),
        };
        // One queued job per kind
        assert_eq!(
            scheduler.trigger_manual_sync(SyncKind::Full).await,
            Ok(SyncDispatch::Queued {
                job_id: full.clone(),
                queue_len: 2
            })
        );
        assert_eq!(scheduler.get_sync_status().queued_jobs, 2);
        assert_eq!(scheduler.queued_jobs()[0].id, full);
        assert!(scheduler.get_sync_status().is_running);

        gate.notify_one();
        assert!(matches!(first.await.unwrap(), Ok(SyncDispatch::Completed(_))));

        wait_until(|| worker.calls().len() == 2 && worker.running.load(Ordering::SeqCst) == 1)
            .await;
        gate.notify_one();
        wait_until(|| worker.calls().len() == 3 && worker.running.load(Ordering::SeqCst) == 1)
            .await;
        gate.notify_one();
        wait_until(|| worker.running.load(Ordering::SeqCst) == 0).await;

        // Full outranks the earlier-queued incremental
        assert_eq!(
            worker.calls(),
            vec![SyncKind::Incremental, SyncKind::Full, SyncKind::Incremental]
        );
        assert_eq!(worker.max_running.load(Ordering::SeqCst), 1);
    }

    // Test 5: A run outliving its connection does not schedule retries
    #[tokio::test]
    async fn test_connection_lost_discards_follow_up() {
        let gate = Arc::new(Notify::new());
        let worker = Arc::new(ScriptedWorker::gated(gate.clone(), vec![failure()]));
        let (scheduler, _) = connected(config(), worker.clone());
        let mut rx = scheduler.subscribe();

        let background = scheduler.clone();
        let run = tokio::spawn(async move {
            background.trigger_manual_sync(SyncKind::Incremental).await
        });
        wait_until(|| worker.running.load(Ordering::SeqCst) == 1).await;

        scheduler.on_connection_lost();
        gate.notify_one();
        assert!(run.await.unwrap().is_err());

        let events = drain(&mut rx);
        assert!(events.contains(&SchedulerEvent::ConnectionLost));
        assert!(events
            .iter()
            .all(|e| !matches!(e, SchedulerEvent::RetryScheduled { .. })));
        assert_eq!(scheduler.get_sync_status().failed_syncs, 1);

        assert_eq!(
            scheduler.trigger_manual_sync(SyncKind::Incremental).await,
            Err(SyncError::NotConnected)
        );
    }

    // Test 6: Connecting schedules a full initial sync, then periodic incrementals
    #[tokio::test]
    async fn test_initial_and_periodic_syncs() {
        tokio::time::pause();
        let worker = Arc::new(ScriptedWorker::default());
        let (scheduler, _) = connected(
            SyncConfig {
                initial_delay_ms: 10_000,
                periodic_interval_ms: 60_000,
                ..config()
            },
            worker.clone(),
        );

        tokio::time::sleep(Duration::from_millis(10_001)).await;
        assert_eq!(worker.calls(), vec![SyncKind::Full]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(worker.calls(), vec![SyncKind::Full, SyncKind::Incremental]);

        // Already fully synced: a reconnect only catches up incrementally
        scheduler.on_connection_lost();
        scheduler.on_connection_established();
        tokio::time::sleep(Duration::from_millis(10_001)).await;
        assert_eq!(worker.count(SyncKind::Full), 1);
        assert_eq!(worker.count(SyncKind::Incremental), 2);
        assert!(scheduler.get_sync_status().last_full_sync_at.is_some());
    }

    // Test 7: Critical failure count triggers a successful recovery
    #[tokio::test]
    async fn test_auto_recovery_succeeds() {
        tokio::time::pause();
        let worker = Arc::new(ScriptedWorker::scripted(vec![failure(), failure()]));
        let (scheduler, _) = connected(
            SyncConfig {
                max_failed_syncs: 2,
                max_retries: 10,
                retry_base_delay_ms: 3_600_000,
                retry_max_delay_ms: 3_600_000,
                recovery_delay_ms: 30_000,
                ..config()
            },
            worker.clone(),
        );
        let mut rx = scheduler.subscribe();

        let _ = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        let _ = scheduler.trigger_manual_sync(SyncKind::Incremental).await;

        let events = drain(&mut rx);
        assert!(events.contains(&SchedulerEvent::HealthCritical { recent_failures: 2 }));
        assert!(events.contains(&SchedulerEvent::RecoveryStarted));
        assert_eq!(scheduler.get_health_metrics().recent_failures, 0);

        tokio::time::sleep(Duration::from_millis(30_001)).await;
        assert_eq!(worker.calls().len(), 3);
        assert!(drain(&mut rx).contains(&SchedulerEvent::RecoverySucceeded));

        // The pending retry was cancelled by the recovery
        tokio::time::sleep(Duration::from_secs(7_200)).await;
        assert_eq!(worker.calls().len(), 3);
        assert_eq!(scheduler.get_health_metrics().status, HealthStatus::Healthy);
    }

    // Test 8: A failed recovery is escalated as a system failure
    #[tokio::test]
    async fn test_auto_recovery_fails() {
        tokio::time::pause();
        let worker = Arc::new(ScriptedWorker::scripted(vec![failure(); 3]));
        let (scheduler, _) = connected(
            SyncConfig {
                max_failed_syncs: 2,
                max_retries: 10,
                retry_base_delay_ms: 3_600_000,
                recovery_delay_ms: 30_000,
                ..config()
            },
            worker.clone(),
        );
        let mut rx = scheduler.subscribe();

        let _ = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        let _ = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        tokio::time::sleep(Duration::from_millis(30_001)).await;

        let events = drain(&mut rx);
        assert!(events.contains(&SchedulerEvent::SyncSystemFailure {
            error: "Sync worker failed: db locked".to_string(),
        }));
        assert!(!events.contains(&SchedulerEvent::RecoverySucceeded));
    }

    // Test 9: Requests fail before initialization and after stop
    #[tokio::test]
    async fn test_not_initialized_and_stopped() {
        let scheduler = SyncScheduler::new(config(), Arc::new(MemorySink::default()));
        scheduler.on_connection_established();
        assert_eq!(
            scheduler.trigger_manual_sync(SyncKind::Full).await,
            Err(SyncError::NotInitialized)
        );

        let mut rx = scheduler.subscribe();
        scheduler.initialize(Arc::new(ScriptedWorker::default()));
        scheduler.stop();
        assert_eq!(
            scheduler.trigger_manual_sync(SyncKind::Full).await,
            Err(SyncError::Stopped)
        );
        assert!(drain(&mut rx).contains(&SchedulerEvent::Stopped));
    }

    // Test 10: Outcomes are returned and logged to the sink
    #[tokio::test]
    async fn test_outcome_logged() {
        let mut worker = MockSyncWorker::new();
        worker
            .expect_perform_full_sync()
            .times(1)
            .returning(|| Ok(SyncOutcome::default().with_count("contacts", 3)));
        let (scheduler, sink) = connected(config(), Arc::new(worker));

        match scheduler.trigger_manual_sync(SyncKind::Full).await {
            Ok(SyncDispatch::Completed(outcome)) => assert_eq!(outcome.total(), 3),
            other => panic!("expected completion, got {:?}", other),
        }

        let logs = sink.sync_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
        assert_eq!(logs[0].kind, SyncKind::Full);
        assert_eq!(logs[0].trigger, SyncTrigger::Manual);
    }

    // Test 11: A hung worker times out and counts as a failure
    #[tokio::test]
    async fn test_sync_timeout() {
        tokio::time::pause();
        let worker = Arc::new(ScriptedWorker {
            hang: true,
            ..Default::default()
        });
        let (scheduler, _) = connected(
            SyncConfig {
                sync_timeout_ms: 5_000,
                ..config()
            },
            worker,
        );

        assert_eq!(
            scheduler.trigger_manual_sync(SyncKind::Incremental).await,
            Err(SyncError::Timeout(Duration::from_secs(5)))
        );
        assert_eq!(scheduler.get_sync_status().failed_syncs, 1);
    }

    // Test 12: Health metrics reflect the success rate and failures
    #[tokio::test]
    async fn test_health_metrics() {
        tokio::time::pause();
        let worker = Arc::new(ScriptedWorker::scripted(vec![Ok(SyncOutcome::default()), failure()]));
        let (scheduler, _) = connected(config(), worker);
        let mut rx = scheduler.subscribe();

        let metrics = scheduler.get_health_metrics();
        assert_eq!(metrics.status, HealthStatus::Healthy);
        assert_eq!(metrics.success_rate, 1.0);

        let _ = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        let _ = scheduler.trigger_manual_sync(SyncKind::Incremental).await;

        let metrics = scheduler.run_health_check();
        assert_eq!(metrics.status, HealthStatus::Degraded);
        assert_eq!(metrics.success_rate, 0.5);
        assert_eq!(metrics.consecutive_failures, 1);
        assert_eq!(metrics.recent_failures, 1);
        assert!(metrics.is_connected);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SchedulerEvent::HealthCheck { .. })));
    }

    // Test 13: With two slots, two jobs run at once and the rest wait by priority
    #[tokio::test]
    async fn test_concurrency_bound_of_two() {
        let gate = Arc::new(Notify::new());
        let worker = Arc::new(ScriptedWorker::gated(gate.clone(), vec![]));
        let (scheduler, _) = connected(
            SyncConfig {
                max_concurrent_syncs: 2,
                ..config()
            },
            worker.clone(),
        );

        let mut runs = Vec::new();
        for kind in [SyncKind::Incremental, SyncKind::Full] {
            let background = scheduler.clone();
            runs.push(tokio::spawn(async move {
                background.trigger_manual_sync(kind).await
            }));
            wait_until(|| worker.calls().contains(&kind)).await;
        }
        assert_eq!(worker.running.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.get_health_metrics().active_jobs, 2);

        assert!(matches!(
            scheduler.trigger_manual_sync(SyncKind::Incremental).await,
            Ok(SyncDispatch::Queued { queue_len: 1, .. })
        ));
        assert!(matches!(
            scheduler.trigger_manual_sync(SyncKind::Full).await,
            Ok(SyncDispatch::Queued { queue_len: 2, .. })
        ));

        // Each finished run frees a slot for the best queued job
        gate.notify_one();
        wait_until(|| worker.calls().len() == 3 && worker.running.load(Ordering::SeqCst) == 2)
            .await;
        gate.notify_one();
        wait_until(|| worker.calls().len() == 4 && worker.running.load(Ordering::SeqCst) == 2)
            .await;
        assert_eq!(scheduler.get_sync_status().queued_jobs, 0);

        gate.notify_one();
        gate.notify_one();
        wait_until(|| worker.running.load(Ordering::SeqCst) == 0).await;
        for run in runs {
            assert!(matches!(run.await.unwrap(), Ok(SyncDispatch::Completed(_))));
        }

        assert_eq!(
            worker.calls(),
            vec![
                SyncKind::Incremental,
                SyncKind::Full,
                SyncKind::Full,
                SyncKind::Incremental
            ]
        );
        assert_eq!(worker.max_running.load(Ordering::SeqCst), 2);
    }

    // Test 14: A queued job can be cancelled by id before it starts
    #[tokio::test]
    async fn test_cancel_queued_job() {
        let gate = Arc::new(Notify::new());
        let worker = Arc::new(ScriptedWorker::gated(gate.clone(), vec![]));
        let (scheduler, _) = connected(config(), worker.clone());
        let mut rx = scheduler.subscribe();

        let background = scheduler.clone();
        let first = tokio::spawn(async move {
            background.trigger_manual_sync(SyncKind::Incremental).await
        });
        wait_until(|| worker.running.load(Ordering::SeqCst) == 1).await;

        let job_id = match scheduler.trigger_manual_sync(SyncKind::Full).await {
            Ok(SyncDispatch::Queued { job_id, .. }) => job_id,
            other => panic!("expected queued, got {:?}", other),
        };
        assert!(scheduler.cancel_job(&job_id));
        assert!(!scheduler.cancel_job(&job_id));
        assert!(scheduler.queued_jobs().is_empty());
        assert!(drain(&mut rx).contains(&SchedulerEvent::SyncCancelled {
            kind: SyncKind::Full,
            job_id,
        }));

        gate.notify_one();
        assert!(matches!(first.await.unwrap(), Ok(SyncDispatch::Completed(_))));
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert_eq!(worker.calls(), vec![SyncKind::Incremental]);
    }

    // Test 15: The failure that exhausts retries reaches the caller as such
    #[tokio::test]
    async fn test_exhausted_retries_returned() {
        tokio::time::pause();
        let worker = Arc::new(ScriptedWorker::scripted(vec![failure(), failure()]));
        let (scheduler, sink) = connected(
            SyncConfig {
                max_retries: 1,
                ..config()
            },
            worker.clone(),
        );

        assert_eq!(
            scheduler.trigger_manual_sync(SyncKind::Incremental).await,
            Err(SyncError::ExhaustedRetries(1))
        );
        assert!(scheduler.get_sync_status().is_blocked);
        // The log keeps the underlying failure
        assert_eq!(
            sink.sync_logs()[0].error.as_deref(),
            Some("Sync worker failed: db locked")
        );

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(worker.calls().len(), 1);
    }

    // Test 16: Syncs are refused while auto-recovery is pending
    #[tokio::test]
    async fn test_refused_during_recovery() {
        tokio::time::pause();
        let worker = Arc::new(ScriptedWorker::scripted(vec![failure(), failure()]));
        let (scheduler, _) = connected(
            SyncConfig {
                max_failed_syncs: 2,
                max_retries: 10,
                retry_base_delay_ms: 3_600_000,
                recovery_delay_ms: 30_000,
                ..config()
            },
            worker.clone(),
        );

        assert_eq!(
            scheduler.trigger_manual_sync(SyncKind::Incremental).await,
            Err(SyncError::Worker("db locked".to_string()))
        );
        assert_eq!(
            scheduler.trigger_manual_sync(SyncKind::Incremental).await,
            Err(SyncError::CriticalHealth(2))
        );
        assert_eq!(
            scheduler.trigger_manual_sync(SyncKind::Full).await,
            Err(SyncError::CriticalHealth(2))
        );
        assert_eq!(worker.calls().len(), 2);

        tokio::time::sleep(Duration::from_millis(30_001)).await;
        assert_eq!(worker.calls().len(), 3);
        assert!(matches!(
            scheduler.trigger_manual_sync(SyncKind::Full).await,
            Ok(SyncDispatch::Completed(_))
        ));
    }

    // Test 17: A reconnect clears a pending recovery so a later one can start
    #[tokio::test]
    async fn test_reconnect_clears_recovery() {
        tokio::time::pause();
        let worker = Arc::new(ScriptedWorker::scripted(vec![failure(); 4]));
        let (scheduler, _) = connected(
            SyncConfig {
                max_failed_syncs: 2,
                max_retries: 10,
                retry_base_delay_ms: 3_600_000,
                recovery_delay_ms: 30_000,
                ..config()
            },
            worker.clone(),
        );
        let mut rx = scheduler.subscribe();

        let _ = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        let _ = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        assert!(drain(&mut rx).contains(&SchedulerEvent::RecoveryStarted));

        // Reconnecting before the recovery run drops it
        scheduler.on_connection_established();
        tokio::time::sleep(Duration::from_millis(30_001)).await;
        assert_eq!(worker.calls().len(), 2);

        let _ = scheduler.trigger_manual_sync(SyncKind::Incremental).await;
        assert_eq!(
            scheduler.trigger_manual_sync(SyncKind::Incremental).await,
            Err(SyncError::CriticalHealth(2))
        );
        assert!(drain(&mut rx).contains(&SchedulerEvent::RecoveryStarted));
    }
}
