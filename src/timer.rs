//! Cancellable timer service
//!
//! Every recurring or delayed piece of work (periodic syncs, health ticks,
//! retry backoff, reconnect delays, confirmation timeouts, cleanup sweeps)
//! is registered here under a [`TimerId`] so it can be cancelled
//! individually or all at once on teardown.
//!
//! Timers run on tokio tasks and use tokio's clock, so tests can drive them
//! with `tokio::time::pause()` and `tokio::time::advance()`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

/// Handle identifying a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

type TimerMap = Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>;

/// Registry of cancellable timers
#[derive(Debug, Default)]
pub struct TimerService {
    next_id: AtomicU64,
    timers: TimerMap,
}

impl TimerService {
    /// Create an empty timer service
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once after `delay`
    pub fn schedule_once<F, Fut>(&self, delay: Duration, task: F) -> TimerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.allocate();
        let timers = Arc::clone(&self.timers);

        // The map lock is held while spawning so the task cannot deregister
        // itself before it has been registered.
        let mut map = lock(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&timers).remove(&id);
            task().await;
        });
        map.insert(id, handle);
        trace!(timer = %id, delay_ms = delay.as_millis() as u64, "Scheduled one-shot timer");
        id
    }

    /// Run `task` every `period`, first after one full period
    pub fn schedule_repeating<F, Fut>(&self, period: Duration, task: F) -> TimerId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.allocate();
        let period = period.max(Duration::from_millis(1));

        let mut map = lock(&self.timers);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task().await;
            }
        });
        map.insert(id, handle);
        trace!(timer = %id, period_ms = period.as_millis() as u64, "Scheduled repeating timer");
        id
    }

    /// Cancel a timer, returning whether it was still pending
    pub fn cancel(&self, id: TimerId) -> bool {
        match lock(&self.timers).remove(&id) {
            Some(handle) => {
                handle.abort();
                trace!(timer = %id, "Cancelled timer");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer
    pub fn cancel_all(&self) {
        let drained: Vec<_> = lock(&self.timers).drain().collect();
        for (_, handle) in drained {
            handle.abort();
        }
    }

    /// Whether a timer is still pending
    pub fn is_active(&self, id: TimerId) -> bool {
        lock(&self.timers).contains_key(&id)
    }

    /// Number of pending timers
    pub fn active_count(&self) -> usize {
        lock(&self.timers).len()
    }

    fn allocate(&self) -> TimerId {
        TimerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn lock(timers: &TimerMap) -> MutexGuard<'_, HashMap<TimerId, JoinHandle<()>>> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
