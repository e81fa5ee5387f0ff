//! Connection stabilizer
//!
//! Tracks the health of the transport session and drives reconnection with
//! exponential backoff. The stabilizer never reconnects by itself: once a
//! backoff delay elapses it emits [`StabilizerEvent::ReconnectAttempt`] and
//! the owner performs the actual reconnect.
//!
//! State machine: `disconnected -> connecting -> connected -> disconnected`,
//! with the terminal `abandoned` state reachable only from `disconnected`.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ratelimit::ActionRateLimiter;
use super::ConnectionInfo;
use crate::config::{ConnectionConfig, ReconnectionStrategy};
use crate::error::TransportError;
use crate::events::{StabilizerEvent, EVENT_CHANNEL_CAPACITY};
use crate::history::BoundedLog;
use crate::models::{ConnectionHealth, ConnectionState, DisconnectReason, HealthSnapshot, HealthStatus};
use crate::persistence::{BoundedSink, PersistenceSink};
use crate::timer::{TimerId, TimerService};
use crate::transport::Transport;

/// Window over which the error rate is measured
const ERROR_WINDOW: Duration = Duration::from_secs(60);

/// Error timestamps retained for the error rate
const MAX_TRACKED_ERRORS: usize = 1_000;

/// Compute the backoff before reconnect attempt `attempt` (1-based)
///
/// `min(max_delay, base_delay * multiplier^(attempt - 1))`, with optional
/// ±25% jitter floored at the base delay and capped at the max delay.
pub fn reconnect_delay(strategy: &ReconnectionStrategy, attempt: u32) -> Duration {
    let base = strategy.base_delay_ms as f64;
    let max = strategy.max_delay_ms as f64;
    let exponent = attempt.saturating_sub(1).min(30) as i32;
    let capped = (base * strategy.backoff_multiplier.powi(exponent)).min(max);

    let delay = if strategy.jitter {
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        (capped * factor).clamp(base.min(max), max)
    } else {
        capped
    };

    Duration::from_millis(delay.round() as u64)
}

struct State {
    connection: ConnectionState,
    strategy: ReconnectionStrategy,
    health: ConnectionHealth,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
    errors: BoundedLog<Instant>,
    reconnect_timer: Option<TimerId>,
    probe_timer: Option<TimerId>,
    health_timer: Option<TimerId>,
}

struct Inner {
    config: ConnectionConfig,
    state: Mutex<State>,
    timers: TimerService,
    events: broadcast::Sender<StabilizerEvent>,
    limiter: ActionRateLimiter,
    transport: Arc<dyn Transport>,
    sink: BoundedSink,
}

/// Tracks transport health and schedules reconnects
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionStabilizer {
    inner: Arc<Inner>,
}

impl ConnectionStabilizer {
    /// Create a stabilizer in the `disconnected` state
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let sink = BoundedSink::new("connection", sink, config.persistence_timeout());
        let state = State {
            connection: ConnectionState::Disconnected,
            strategy: config.reconnect.clone(),
            health: ConnectionHealth::default(),
            reconnect_attempts: 0,
            connected_since: None,
            errors: BoundedLog::new(MAX_TRACKED_ERRORS),
            reconnect_timer: None,
            probe_timer: None,
            health_timer: None,
        };

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                timers: TimerService::new(),
                events,
                limiter: ActionRateLimiter::default(),
                transport,
                sink,
            }),
        }
    }

    /// Subscribe to stabilizer events
    pub fn subscribe(&self) -> broadcast::Receiver<StabilizerEvent> {
        self.inner.events.subscribe()
    }

    /// Restore counters from the sink's last-known snapshot
    ///
    /// Returns whether a snapshot was found.
    pub async fn restore(&self) -> bool {
        match self.inner.sink.load_health_snapshot().await {
            Some(snapshot) => {
                let mut st = self.inner.lock();
                st.health.reconnect_count = snapshot.health.reconnect_count;
                st.health.last_disconnect_reason = snapshot.health.last_disconnect_reason;
                st.health.latency_ms = snapshot.health.latency_ms;
                info!(
                    component = "connection",
                    reconnect_count = st.health.reconnect_count,
                    recorded_at = %snapshot.recorded_at,
                    "Restored connection health snapshot"
                );
                true
            }
            None => false,
        }
    }

    /// The transport session opened
    pub fn on_open(&self) {
        let inner = &self.inner;
        let (previous, current) = {
            let mut st = inner.lock();
            if let Some(timer) = st.reconnect_timer.take() {
                inner.timers.cancel(timer);
            }
            st.connection = ConnectionState::Connected;
            st.reconnect_attempts = 0;
            st.connected_since = Some(Instant::now());
            let previous = st.health.status;
            let current = inner.refresh_health(&mut st);
            (previous, current)
        };

        self.start_latency_probe();
        info!(component = "connection", "Connection established");
        inner.emit(StabilizerEvent::Connected);
        if previous != current {
            inner.emit(StabilizerEvent::HealthChanged { previous, current });
        }
    }

    /// The transport session closed
    pub async fn on_close(&self, reason: DisconnectReason) {
        let inner = &self.inner;
        let (uptime, was_abandoned, health_change) = {
            let mut st = inner.lock();
            let uptime = st
                .connected_since
                .take()
                .map(|since| since.elapsed())
                .unwrap_or_default();
            if let Some(timer) = st.probe_timer.take() {
                inner.timers.cancel(timer);
            }

            let was_abandoned = st.connection == ConnectionState::Abandoned;
            if !was_abandoned {
                st.connection = ConnectionState::Disconnected;
            }
            st.health.uptime_ms = uptime.as_millis() as u64;
            st.health.last_disconnect_reason = Some(reason.clone());
            let previous = st.health.status;
            let current = inner.refresh_health(&mut st);
            (uptime, was_abandoned, (previous != current).then_some((previous, current)))
        };

        info!(
            component = "connection",
            reason = %reason,
            uptime_ms = uptime.as_millis() as u64,
            "Connection closed"
        );
        inner.emit(StabilizerEvent::Disconnected {
            reason: reason.clone(),
            uptime,
        });
        if let Some((previous, current)) = health_change {
            inner.emit(StabilizerEvent::HealthChanged { previous, current });
        }

        if was_abandoned {
            debug!(component = "connection", "Close ignored, session already abandoned");
        } else if reason.is_terminal() {
            self.abandon(reason);
        } else {
            self.schedule_reconnect();
        }

        self.persist_snapshot().await;
    }

    /// Schedule the next reconnect attempt with backoff
    ///
    /// Returns the delay, or `None` if attempts are exhausted and the session
    /// was abandoned.
    pub fn schedule_reconnect(&self) -> Option<Duration> {
        let inner = &self.inner;
        let mut st = inner.lock();
        if st.connection == ConnectionState::Abandoned {
            return None;
        }

        st.reconnect_attempts += 1;
        let attempt = st.reconnect_attempts;
        let max_attempts = st.strategy.max_attempts;

        if attempt > max_attempts {
            if let Some(timer) = st.reconnect_timer.take() {
                inner.timers.cancel(timer);
            }
            st.connection = ConnectionState::Abandoned;
            st.health.status = HealthStatus::Critical;
            drop(st);

            warn!(
                component = "connection",
                action = "reconnect",
                attempt = max_attempts,
                "Maximum reconnect attempts reached, abandoning session"
            );
            inner.emit(StabilizerEvent::MaxReconnectAttemptsReached {
                attempts: max_attempts,
            });
            return None;
        }

        let delay = reconnect_delay(&st.strategy, attempt);
        st.health.reconnect_count += 1;
        if let Some(timer) = st.reconnect_timer.take() {
            inner.timers.cancel(timer);
        }

        let weak = Arc::downgrade(inner);
        let timer = inner.timers.schedule_once(delay, move || async move {
            if let Some(inner) = weak.upgrade() {
                {
                    let mut st = inner.lock();
                    st.reconnect_timer = None;
                    st.connection = ConnectionState::Connecting;
                }
                info!(
                    component = "connection",
                    action = "reconnect",
                    attempt,
                    max_attempts,
                    "Reconnect attempt"
                );
                inner.emit(StabilizerEvent::ReconnectAttempt {
                    attempt,
                    max_attempts,
                });
            }
        });
        st.reconnect_timer = Some(timer);
        drop(st);

        info!(
            component = "connection",
            action = "reconnect",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        inner.emit(StabilizerEvent::ReconnectScheduled { attempt, delay });
        Some(delay)
    }

    /// Check `action` against a per-minute limit, recording it when admitted
    pub fn is_rate_limited(&self, action: &str, max_per_minute: usize) -> bool {
        let limited = self.inner.limiter.is_rate_limited(action, max_per_minute);
        if limited {
            debug!(component = "connection", action, "Action rate limited");
        }
        limited
    }

    /// Current health, with a live uptime
    pub fn get_health(&self) -> ConnectionHealth {
        let st = self.inner.lock();
        let mut health = st.health.clone();
        if let Some(since) = st.connected_since {
            health.uptime_ms = since.elapsed().as_millis() as u64;
        }
        health
    }

    /// Recompute health now, emitting `HealthChanged` on a status change
    pub fn check_health(&self) -> ConnectionHealth {
        self.inner.check_health()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().connection
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().reconnect_attempts
    }

    /// Replace the reconnection strategy; applies from the next attempt
    pub fn set_strategy(&self, strategy: ReconnectionStrategy) {
        self.inner.lock().strategy = strategy;
    }

    /// Record a transport error for the error rate
    pub fn record_error(&self) {
        self.inner.record_error();
    }

    /// Record a measured round-trip latency
    pub fn record_latency(&self, latency: Duration) {
        self.inner.lock().health.latency_ms = Some(latency.as_millis() as u64);
    }

    /// Clear counters and leave the abandoned state
    pub fn reset(&self) {
        let inner = &self.inner;
        let mut st = inner.lock();
        if let Some(timer) = st.reconnect_timer.take() {
            inner.timers.cancel(timer);
        }
        if st.connection == ConnectionState::Abandoned {
            st.connection = ConnectionState::Disconnected;
        }
        st.reconnect_attempts = 0;
        st.errors.clear();
        st.health = ConnectionHealth::default();
        inner.refresh_health(&mut st);
        info!(component = "connection", "Connection stabilizer reset");
    }

    /// Start the periodic health tick
    pub fn start_health_checks(&self) {
        let inner = &self.inner;
        let weak = Arc::downgrade(inner);
        let timer = inner
            .timers
            .schedule_repeating(inner.config.health_check_interval(), move || {
                let weak = Weak::clone(&weak);
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.check_health();
                    }
                }
            });

        if let Some(old) = inner.lock().health_timer.replace(timer) {
            inner.timers.cancel(old);
        }
    }

    /// Cancel every timer
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.timers.cancel_all();
        let mut st = inner.lock();
        st.reconnect_timer = None;
        st.probe_timer = None;
        st.health_timer = None;
    }

    fn abandon(&self, reason: DisconnectReason) {
        let inner = &self.inner;
        {
            let mut st = inner.lock();
            if let Some(timer) = st.reconnect_timer.take() {
                inner.timers.cancel(timer);
            }
            st.connection = ConnectionState::Abandoned;
            st.health.status = HealthStatus::Critical;
        }
        warn!(
            component = "connection",
            reason = %reason,
            "Terminal disconnect, reconnection aborted"
        );
        inner.emit(StabilizerEvent::ConnectionAbandoned { reason });
    }

    fn start_latency_probe(&self) {
        let inner = &self.inner;
        let weak = Arc::downgrade(inner);
        let timer = inner
            .timers
            .schedule_repeating(inner.config.latency_probe_interval(), move || {
                let weak = Weak::clone(&weak);
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    match inner.transport.ping().await {
                        Ok(latency) => {
                            inner.lock().health.latency_ms = Some(latency.as_millis() as u64);
                        }
                        Err(TransportError::Unsupported(_)) => {
                            debug!(component = "connection", "Transport does not support ping");
                        }
                        Err(e) => {
                            debug!(component = "connection", error = %e, "Latency probe failed");
                            inner.record_error();
                        }
                    }
                }
            });

        if let Some(old) = inner.lock().probe_timer.replace(timer) {
            inner.timers.cancel(old);
        }
    }

    async fn persist_snapshot(&self) {
        let snapshot = HealthSnapshot::new(self.get_health());
        self.inner.sink.save_health_snapshot(&snapshot).await;
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: StabilizerEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn record_error(&self) {
        let now = Instant::now();
        let mut st = self.lock();
        st.errors.push(now);
    }

    /// Errors per minute over the error window
    fn error_rate(&self, st: &mut State) -> f64 {
        let now = Instant::now();
        st.errors
            .prune_front(|ts| now.saturating_duration_since(*ts) >= ERROR_WINDOW);
        st.errors.len() as f64 * 60.0 / ERROR_WINDOW.as_secs_f64()
    }

    fn refresh_health(&self, st: &mut State) -> HealthStatus {
        let error_rate = self.error_rate(st);
        let max_latency = self.config.max_latency_ms as f64;
        let latency_high = st
            .health
            .latency_ms
            .is_some_and(|l| l as f64 > max_latency / 2.0);

        let status = if st.connection != ConnectionState::Connected {
            HealthStatus::Critical
        } else if error_rate > self.config.max_error_rate_per_min / 2.0 || latency_high {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        st.health.status = status;
        st.health.error_rate = error_rate;
        st.health.last_check = Utc::now();
        if let Some(since) = st.connected_since {
            st.health.uptime_ms = since.elapsed().as_millis() as u64;
        }
        status
    }

    fn check_health(&self) -> ConnectionHealth {
        let (previous, current, health) = {
            let mut st = self.lock();
            let previous = st.health.status;
            let current = self.refresh_health(&mut st);
            (previous, current, st.health.clone())
        };

        if previous != current {
            info!(
                component = "connection",
                previous = %previous,
                current = %current,
                error_rate = health.error_rate,
                "Connection health changed"
            );
            self.emit(StabilizerEvent::HealthChanged { previous, current });
        }
        health
    }
}

impl ConnectionInfo for ConnectionStabilizer {
    fn is_connected(&self) -> bool {
        self.inner.lock().connection == ConnectionState::Connected
    }

    fn uptime(&self) -> Option<Duration> {
        self.inner.lock().connected_since.map(|since| since.elapsed())
    }
}
