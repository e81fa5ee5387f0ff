//! Per-action rate limiter
//!
//! Tracks how often an arbitrary action (keyed by name) happened over a
//! sliding window and refuses it once a per-call limit is reached.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::compliance::window::RateWindow;

/// Default sliding window of the limiter
pub const DEFAULT_ACTION_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window rate limiter keyed by action name
///
/// Thread-safe; an admitted action is recorded immediately.
#[derive(Debug)]
pub struct ActionRateLimiter {
    window: Duration,
    actions: RwLock<HashMap<String, RateWindow>>,
}

impl Default for ActionRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_ACTION_WINDOW)
    }
}

impl ActionRateLimiter {
    /// Create a limiter over the given window
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Check `action` against `max_per_window`
    ///
    /// Returns `true` if the action is refused. Admitted actions are recorded.
    pub fn is_rate_limited(&self, action: &str, max_per_window: usize) -> bool {
        let now = Instant::now();
        let mut actions = self.write();
        let window = actions
            .entry(action.to_string())
            .or_insert_with(|| RateWindow::new(self.window, max_per_window));
        window.set_limit(max_per_window);

        if window.is_full(now) {
            return true;
        }
        window.record(now);
        false
    }

    /// Recorded occurrences of `action` within the window
    pub fn count(&self, action: &str) -> usize {
        let now = Instant::now();
        self.write()
            .get_mut(action)
            .map(|window| window.count(now))
            .unwrap_or(0)
    }

    /// Time until `action` is admitted again; `None` if it is not limited
    pub fn retry_after(&self, action: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut actions = self.write();
        let window = actions.get_mut(action)?;
        let wait = window.wait_time(now);
        (!wait.is_zero()).then_some(wait)
    }

    /// Forget `action`
    pub fn reset(&self, action: &str) {
        self.write().remove(action);
    }

    /// Drop actions without occurrences in the window
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.write().retain(|_, window| window.count(now) > 0);
    }

    /// Number of tracked actions
    pub fn tracked_actions_count(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RateWindow>> {
        self.actions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RateWindow>> {
        self.actions.write().unwrap_or_else(|e| e.into_inner())
    }
}
