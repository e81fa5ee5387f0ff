//! Compliance guard
//!
//! Admission control for outbound sends. Three independent sliding windows
//! (minute, hour, day) cap the send rate; a declarative rule set is
//! evaluated periodically to flag risky behavior before the remote side
//! enforces its own limits.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::rules::{default_rules, ComplianceReport, ComplianceRule, Horizon, HorizonCount, RuleContext};
use super::window::RateWindow;
use crate::config::ComplianceConfig;
use crate::connection::ConnectionInfo;
use crate::error::ThrottledError;
use crate::history::BoundedLog;
use crate::timer::TimerService;

/// Answer of [`ComplianceGuard::can_send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Time until the violated window admits again
    pub wait_time: Option<Duration>,
}

impl SendDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            wait_time: None,
        }
    }

    fn deny(reason: String, wait_time: Duration) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            wait_time: Some(wait_time),
        }
    }

    /// Convert a refusal into a [`ThrottledError`]
    pub fn into_result(self) -> Result<(), ThrottledError> {
        if self.allowed {
            Ok(())
        } else {
            Err(ThrottledError {
                reason: self.reason.unwrap_or_default(),
                wait: self.wait_time.unwrap_or_default(),
            })
        }
    }
}

/// Usage of one horizon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HorizonStatus {
    pub horizon: Horizon,
    pub count: usize,
    pub limit: usize,
    pub remaining: usize,
    /// Milliseconds until the oldest send in the window expires
    pub reset_in_ms: Option<u64>,
}

/// Usage of every horizon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub minute: HorizonStatus,
    pub hour: HorizonStatus,
    pub day: HorizonStatus,
}

struct GuardState {
    minute: RateWindow,
    hour: RateWindow,
    day: RateWindow,
    intervals: BoundedLog<Duration>,
    last_send: Option<Instant>,
    last_report: Option<ComplianceReport>,
}

impl GuardState {
    fn window_mut(&mut self, horizon: Horizon) -> &mut RateWindow {
        match horizon {
            Horizon::Minute => &mut self.minute,
            Horizon::Hour => &mut self.hour,
            Horizon::Day => &mut self.day,
        }
    }
}

struct Inner {
    config: ComplianceConfig,
    rules: Vec<ComplianceRule>,
    connection: Arc<dyn ConnectionInfo>,
    state: Mutex<GuardState>,
    timers: TimerService,
}

/// Sliding-window admission control plus periodic compliance checks
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ComplianceGuard {
    inner: Arc<Inner>,
}

impl ComplianceGuard {
    /// Create a guard with the default rule set
    pub fn new(config: ComplianceConfig, connection: Arc<dyn ConnectionInfo>) -> Self {
        let rules = default_rules(&config);
        Self::with_rules(config, connection, rules)
    }

    /// Create a guard evaluating `rules`
    pub fn with_rules(
        config: ComplianceConfig,
        connection: Arc<dyn ConnectionInfo>,
        rules: Vec<ComplianceRule>,
    ) -> Self {
        let state = GuardState {
            minute: RateWindow::new(Horizon::Minute.duration(), config.minute_limit),
            hour: RateWindow::new(Horizon::Hour.duration(), config.hour_limit),
            day: RateWindow::new(Horizon::Day.duration(), config.day_limit),
            intervals: BoundedLog::new(config.interval_sample_size),
            last_send: None,
            last_report: None,
        };

        Self {
            inner: Arc::new(Inner {
                config,
                rules,
                connection,
                state: Mutex::new(state),
                timers: TimerService::new(),
            }),
        }
    }

    /// Check the minute, hour and day windows in that order
    pub fn can_send(&self) -> SendDecision {
        let now = Instant::now();
        let mut st = self.inner.lock();

        for horizon in Horizon::ALL {
            let window = st.window_mut(horizon);
            if window.is_full(now) {
                let wait = window.wait_time(now);
                let reason = format!(
                    "{} limit of {} sends reached",
                    horizon,
                    window.limit()
                );
                debug!(
                    component = "compliance",
                    horizon = %horizon,
                    wait_ms = wait.as_millis() as u64,
                    "Send refused"
                );
                return SendDecision::deny(reason, wait);
            }
        }

        SendDecision::allow()
    }

    /// Record a completed send in every window
    pub fn record_send(&self) {
        let now = Instant::now();
        let mut st = self.inner.lock();

        st.minute.record(now);
        st.hour.record(now);
        st.day.record(now);
        if let Some(last) = st.last_send.replace(now) {
            st.intervals.push(now.saturating_duration_since(last));
        }
    }

    /// Minimum gap plus uniform jitter to wait between consecutive sends
    pub fn inter_send_delay(&self) -> Duration {
        let config = &self.inner.config;
        let jitter = if config.send_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=config.send_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(config.min_send_gap_ms + jitter)
    }

    /// Current usage of every window
    pub fn get_rate_limit_status(&self) -> RateLimitStatus {
        let now = Instant::now();
        let mut st = self.inner.lock();

        let mut status = |horizon: Horizon| {
            let window = st.window_mut(horizon);
            HorizonStatus {
                horizon,
                count: window.count(now),
                limit: window.limit(),
                remaining: window.remaining(now),
                reset_in_ms: window.reset_in(now).map(|d| d.as_millis() as u64),
            }
        };

        RateLimitStatus {
            minute: status(Horizon::Minute),
            hour: status(Horizon::Hour),
            day: status(Horizon::Day),
        }
    }

    /// Evaluate every rule and store the report
    pub fn run_compliance_check(&self) -> ComplianceReport {
        self.inner.run_compliance_check()
    }

    /// Report of the most recent check
    pub fn last_report(&self) -> Option<ComplianceReport> {
        self.inner.lock().last_report.clone()
    }

    /// Run the compliance check every `check_interval`
    pub fn start_periodic_checks(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .timers
            .schedule_repeating(self.inner.config.check_interval(), move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.run_compliance_check();
                    }
                }
            });
        info!(
            component = "compliance",
            interval_ms = self.inner.config.check_interval_ms,
            "Periodic compliance checks started"
        );
    }

    pub fn stop(&self) {
        self.inner.timers.cancel_all();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_compliance_check(&self) -> ComplianceReport {
        let now = Instant::now();
        let ctx = {
            let mut st = self.lock();
            let counts = Horizon::ALL
                .into_iter()
                .map(|horizon| HorizonCount {
                    horizon,
                    count: st.window_mut(horizon).count(now),
                })
                .collect();
            RuleContext {
                counts,
                connected: self.connection.is_connected(),
                uptime: self.connection.uptime(),
                intervals: st.intervals.iter().copied().collect(),
            }
        };

        let results = self.rules.iter().map(|rule| rule.evaluate(&ctx)).collect();
        let report = ComplianceReport::from_results(results);

        if !report.is_compliant() {
            let failed: Vec<&str> = report.failed().map(|r| r.rule_id.as_str()).collect();
            warn!(
                component = "compliance",
                status = ?report.status,
                failed_rules = ?failed,
                recommendations = ?report.recommendations,
                "Compliance check failed"
            );
        } else {
            debug!(component = "compliance", "Compliance check passed");
        }

        self.lock().last_report = Some(report.clone());
        report
    }
}
