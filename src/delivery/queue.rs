//! Message reliability queue
//!
//! Outbound messages are validated, deduplicated by fingerprint and queued by
//! priority. A processing pass sends them one at a time through the
//! transport, gated by the compliance guard, and retries failures with a
//! per-priority exponential backoff. Sent messages are tracked until the
//! transport confirms delivery, or are assumed delivered once the
//! confirmation timeout elapses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::compliance::ComplianceGuard;
use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, RetryableError, ValidationError};
use crate::events::{QueueEvent, EVENT_CHANNEL_CAPACITY};
use crate::history::BoundedLog;
use crate::models::{
    AckStatus, AttemptStatus, DeliveryConfirmation, MessageAttempt, MessageStatus,
    OutboundMessage, QueueStats, ReliableMessage, SendRecord,
};
use crate::persistence::{BoundedSink, PersistenceSink};
use crate::timer::{TimerId, TimerService};
use crate::transport::{SendReceipt, Transport};

/// Deduplication key: `sha256(target || 0x00 || sha256(content))`, hex encoded
pub fn fingerprint(target: &str, content: &str) -> String {
    let content_hash = Sha256::digest(content.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    hasher.update([0u8]);
    hasher.update(content_hash);
    hex::encode(hasher.finalize())
}

struct Entry {
    message: ReliableMessage,
    /// Enqueue order, for FIFO within a priority
    seq: u64,
    /// Backoff gate after a failed attempt
    retry_at: Option<Instant>,
    confirmation_timer: Option<TimerId>,
}

#[derive(Default)]
struct Counters {
    delivered: u64,
    read: u64,
    failed: u64,
    cancelled: u64,
    total_enqueued: u64,
    total_attempts: u64,
}

struct QueueState {
    /// Queued, sending and sent messages
    active: HashMap<String, Entry>,
    /// Fingerprint -> id of the active message
    fingerprints: HashMap<String, String>,
    history: BoundedLog<ReliableMessage>,
    next_seq: u64,
    counters: Counters,
}

impl QueueState {
    fn insert(&mut self, message: ReliableMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.fingerprints
            .insert(message.fingerprint.clone(), message.id.clone());
        self.active.insert(
            message.id.clone(),
            Entry {
                message,
                seq,
                retry_at: None,
                confirmation_timer: None,
            },
        );
    }

    /// Move an active message into history with a terminal status
    fn archive(&mut self, id: &str, status: MessageStatus) -> Option<(ReliableMessage, Option<TimerId>)> {
        let mut entry = self.active.remove(id)?;
        self.fingerprints.remove(&entry.message.fingerprint);

        entry.message.status = status;
        entry.message.completed_at = Some(Utc::now());
        match status {
            MessageStatus::Delivered => self.counters.delivered += 1,
            MessageStatus::Read => self.counters.read += 1,
            MessageStatus::Failed => self.counters.failed += 1,
            MessageStatus::Cancelled => self.counters.cancelled += 1,
            _ => {}
        }

        self.history.push(entry.message.clone());
        Some((entry.message, entry.confirmation_timer))
    }

    fn ready(&self, now: Instant) -> impl Iterator<Item = &Entry> {
        self.active.values().filter(move |e| {
            e.message.status == MessageStatus::Queued && e.retry_at.map_or(true, |at| at <= now)
        })
    }

    fn find_active(&self, id: &str) -> Option<String> {
        if self.active.contains_key(id) {
            return Some(id.to_string());
        }
        self.active
            .values()
            .find(|e| e.message.matches_id(id))
            .map(|e| e.message.id.clone())
    }
}

/// A send taken off the queue
struct SendJob {
    id: String,
    target: String,
    content: String,
    attempt: u32,
}

enum AttemptOutcome {
    Discarded,
    Sent(String),
    Retry { attempt: u32, delay: Duration, error: String },
    Failed(DeliveryError),
}

struct Inner {
    config: DeliveryConfig,
    transport: Arc<dyn Transport>,
    guard: ComplianceGuard,
    sink: BoundedSink,
    state: Mutex<QueueState>,
    timers: TimerService,
    events: broadcast::Sender<QueueEvent>,
    processing: AtomicBool,
    paused: AtomicBool,
    trigger: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Resets the processing flag when a pass ends, including on abort
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Marks one message as on the wire; a send dropped before it completes
/// (worker aborted by `stop`) puts the message back in the queue
struct InFlight<'a> {
    inner: &'a Inner,
    id: Option<String>,
}

impl InFlight<'_> {
    /// The send finished and its result will be applied
    fn complete(mut self) {
        self.id = None;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let archived = {
            let mut st = self.inner.lock();
            match st.active.get(&id).map(|e| e.message.status) {
                Some(MessageStatus::Sending) => {
                    if let Some(entry) = st.active.get_mut(&id) {
                        entry.message.status = MessageStatus::Queued;
                    }
                    None
                }
                Some(MessageStatus::Cancelled) => st.archive(&id, MessageStatus::Cancelled),
                _ => None,
            }
        };
        if let Some((_, Some(timer))) = archived {
            self.inner.timers.cancel(timer);
        }
        debug!(component = "delivery", id = %id, "Interrupted send returned to the queue");
    }
}

/// Priority retry queue for outbound messages
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessageReliabilityQueue {
    inner: Arc<Inner>,
}

impl MessageReliabilityQueue {
    pub fn new(
        config: DeliveryConfig,
        transport: Arc<dyn Transport>,
        guard: ComplianceGuard,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let history = BoundedLog::new(config.history_limit);
        let sink = BoundedSink::new("delivery", sink, config.persistence_timeout());

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                guard,
                sink,
                state: Mutex::new(QueueState {
                    active: HashMap::new(),
                    fingerprints: HashMap::new(),
                    history,
                    next_seq: 0,
                    counters: Counters::default(),
                }),
                timers: TimerService::new(),
                events,
                processing: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                trigger: Arc::new(Notify::new()),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Validate and queue a message, returning its id
    pub fn enqueue(&self, message: OutboundMessage) -> Result<String, DeliveryError> {
        let inner = &self.inner;
        inner.validate(&message)?;

        let fingerprint = fingerprint(&message.target, &message.content);
        let policy = inner.config.policies.for_priority(message.priority);
        let reliable = ReliableMessage {
            id: uuid::Uuid::new_v4().to_string(),
            target: message.target,
            content: message.content,
            priority: message.priority,
            max_retries: policy.max_retries,
            attempts: Vec::new(),
            status: MessageStatus::Queued,
            fingerprint,
            transport_id: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let id = reliable.id.clone();
        let priority = reliable.priority;

        {
            let mut st = inner.lock();
            if let Some(existing_id) = st.fingerprints.get(&reliable.fingerprint) {
                debug!(
                    component = "delivery",
                    existing_id = %existing_id,
                    "Duplicate message rejected"
                );
                return Err(DeliveryError::Duplicate {
                    existing_id: existing_id.clone(),
                });
            }
            st.insert(reliable);
            st.counters.total_enqueued += 1;
        }

        debug!(component = "delivery", id = %id, priority = %priority, "Message enqueued");
        inner.emit(QueueEvent::Enqueued {
            id: id.clone(),
            priority,
        });
        inner.trigger.notify_one();
        Ok(id)
    }

    /// Cancel a queued or in-flight message
    ///
    /// A queued message is removed immediately; an in-flight send cannot be
    /// preempted, so its result is discarded when it completes.
    pub fn cancel(&self, id: &str) -> bool {
        let inner = &self.inner;
        let cancelled = {
            let mut st = inner.lock();
            match st.active.get(id).map(|e| e.message.status) {
                Some(MessageStatus::Queued) => st.archive(id, MessageStatus::Cancelled).is_some(),
                Some(MessageStatus::Sending) => {
                    if let Some(entry) = st.active.get_mut(id) {
                        entry.message.status = MessageStatus::Cancelled;
                    }
                    true
                }
                _ => false,
            }
        };

        if cancelled {
            info!(component = "delivery", id, "Message cancelled");
            inner.emit(QueueEvent::Cancelled { id: id.to_string() });
        }
        cancelled
    }

    /// Re-queue a failed message with fresh attempts, or lift the backoff
    /// gate of a queued one
    pub fn retry(&self, id: &str) -> bool {
        let inner = &self.inner;
        let requeued = {
            let mut st = inner.lock();
            if let Some(entry) = st.active.get_mut(id) {
                if entry.message.status == MessageStatus::Queued && entry.retry_at.is_some() {
                    entry.retry_at = None;
                    drop(st);
                    inner.trigger.notify_one();
                    return true;
                }
                return false;
            }

            let fingerprint = st
                .history
                .iter()
                .find(|m| m.id == id && m.status == MessageStatus::Failed)
                .map(|m| m.fingerprint.clone());
            match fingerprint {
                Some(fp) if !st.fingerprints.contains_key(&fp) => {
                    match st.history.take_first(|m| m.id == id) {
                        Some(mut message) => {
                            message.attempts.clear();
                            message.status = MessageStatus::Queued;
                            message.completed_at = None;
                            message.transport_id = None;
                            let priority = message.priority;
                            st.insert(message);
                            Some(priority)
                        }
                        None => None,
                    }
                }
                _ => None,
            }
        };

        match requeued {
            Some(priority) => {
                info!(component = "delivery", id, "Failed message re-queued");
                inner.emit(QueueEvent::Enqueued {
                    id: id.to_string(),
                    priority,
                });
                inner.trigger.notify_one();
                true
            }
            None => false,
        }
    }

    /// Apply a delivery confirmation from the transport
    pub fn confirm(&self, ack: &DeliveryConfirmation) -> bool {
        self.inner.apply_confirmation(ack)
    }

    /// Run one processing pass; returns the number of send attempts made
    pub async fn process_queue(&self) -> usize {
        self.inner.process_queue().await
    }

    /// Look up a message in the active set or history
    pub fn get(&self, id: &str) -> Option<ReliableMessage> {
        let st = self.inner.lock();
        st.active
            .get(id)
            .map(|e| e.message.clone())
            .or_else(|| st.history.iter().rev().find(|m| m.id == id).cloned())
    }

    pub fn get_stats(&self) -> QueueStats {
        let st = self.inner.lock();
        let count = |status: MessageStatus| {
            st.active
                .values()
                .filter(|e| e.message.status == status)
                .count()
        };

        QueueStats {
            queued: count(MessageStatus::Queued),
            sending: count(MessageStatus::Sending),
            awaiting_confirmation: count(MessageStatus::Sent),
            delivered: st.counters.delivered,
            read: st.counters.read,
            failed: st.counters.failed,
            cancelled: st.counters.cancelled,
            total_enqueued: st.counters.total_enqueued,
            total_attempts: st.counters.total_attempts,
            history_len: st.history.len(),
            paused: self.is_paused(),
        }
    }

    /// Stop sending; queued messages are kept
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!(component = "delivery", "Message processing paused");
        }
    }

    /// Resume sending and trigger a pass
    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!(component = "delivery", "Message processing resumed");
        }
        self.inner.trigger.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Start the background worker: a pass every tick and on every trigger
    pub fn start(&self) {
        let mut worker = self.inner.worker_slot();
        if worker.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let trigger = Arc::clone(&self.inner.trigger);
        let tick = self.inner.config.tick_interval();

        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = trigger.notified() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.process_queue().await;
            }
        }));
        info!(
            component = "delivery",
            tick_ms = tick.as_millis() as u64,
            "Message queue worker started"
        );
    }

    /// Stop the worker and cancel confirmation timers
    ///
    /// A send interrupted by the stop leaves its message queued.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.worker_slot().take() {
            handle.abort();
        }
        self.inner.timers.cancel_all();
        info!(component = "delivery", "Message queue worker stopped");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn validate(&self, message: &OutboundMessage) -> Result<(), ValidationError> {
        if message.target.trim().is_empty() {
            return Err(ValidationError::MissingField("target"));
        }
        if message.content.is_empty() {
            return Err(ValidationError::MissingField("content"));
        }
        let size = message.content.len();
        if size > self.config.max_content_bytes {
            return Err(ValidationError::ContentTooLarge {
                size,
                max: self.config.max_content_bytes,
            });
        }
        Ok(())
    }

    fn has_ready(&self) -> bool {
        self.lock().ready(Instant::now()).next().is_some()
    }

    /// Pick the highest-priority, oldest ready message and mark it sending
    fn take_next_ready(&self) -> Option<SendJob> {
        let mut st = self.lock();
        let id = st
            .ready(Instant::now())
            .min_by_key(|e| (e.message.priority.rank(), e.seq))
            .map(|e| e.message.id.clone())?;

        let entry = st.active.get_mut(&id)?;
        entry.message.status = MessageStatus::Sending;
        Some(SendJob {
            id,
            target: entry.message.target.clone(),
            content: entry.message.content.clone(),
            attempt: entry.message.attempts.len() as u32 + 1,
        })
    }

    async fn process_queue(self: &Arc<Self>) -> usize {
        if self.paused.load(Ordering::SeqCst) {
            return 0;
        }
        if self.processing.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let _processing = ProcessingGuard(&self.processing);

        let mut attempted = 0;
        loop {
            if self.paused.load(Ordering::SeqCst) || !self.has_ready() {
                break;
            }
            if attempted > 0 {
                tokio::time::sleep(self.guard.inter_send_delay()).await;
                if self.paused.load(Ordering::SeqCst) {
                    break;
                }
            }

            if let Err(throttled) = self.guard.can_send().into_result() {
                debug!(
                    component = "delivery",
                    reason = %throttled.reason,
                    wait_ms = throttled.wait.as_millis() as u64,
                    "Processing deferred by compliance guard"
                );
                self.emit(QueueEvent::Throttled {
                    reason: throttled.reason,
                    wait: throttled.wait,
                });
                break;
            }

            let Some(job) = self.take_next_ready() else {
                break;
            };

            let in_flight = InFlight {
                inner: &**self,
                id: Some(job.id.clone()),
            };
            let timeout = self.config.send_timeout();
            let result = match tokio::time::timeout(
                timeout,
                self.transport.send(&job.target, &job.content),
            )
            .await
            {
                Ok(Ok(receipt)) => Ok(receipt),
                Ok(Err(e)) => Err(DeliveryError::Transport(e)),
                Err(_) => Err(DeliveryError::Timeout(timeout)),
            };
            in_flight.complete();

            self.complete_attempt(job, result).await;
            attempted += 1;
        }

        attempted
    }

    async fn complete_attempt(
        self: &Arc<Self>,
        job: SendJob,
        result: Result<SendReceipt, DeliveryError>,
    ) {
        let (outcome, record, archived) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            st.counters.total_attempts += 1;

            let Some(entry) = st.active.get_mut(&job.id) else {
                return;
            };

            let retry_count = entry.message.failed_attempts();
            let (status, error) = match &result {
                Ok(_) => (AttemptStatus::Success, None),
                Err(e) => (AttemptStatus::Failed, Some(e.to_string())),
            };
            entry.message.attempts.push(MessageAttempt {
                id: job.attempt,
                timestamp: Utc::now(),
                status,
                error: error.clone(),
                retry_count,
            });

            let record = SendRecord {
                message_id: job.id.clone(),
                target: job.target.clone(),
                priority: entry.message.priority,
                attempt: job.attempt,
                status,
                error,
                timestamp: Utc::now(),
            };

            let outcome = if entry.message.status == MessageStatus::Cancelled {
                AttemptOutcome::Discarded
            } else {
                match result {
                    Ok(receipt) => {
                        entry.message.status = MessageStatus::Sent;
                        entry.message.transport_id = Some(receipt.message_id.clone());
                        AttemptOutcome::Sent(receipt.message_id)
                    }
                    Err(err) => {
                        let failed = entry.message.failed_attempts();
                        if !err.is_retryable() {
                            AttemptOutcome::Failed(err)
                        } else if failed >= entry.message.max_retries {
                            AttemptOutcome::Failed(DeliveryError::ExhaustedRetries {
                                attempts: failed,
                                last_error: err.to_string(),
                            })
                        } else {
                            let policy = self.config.policies.for_priority(entry.message.priority);
                            let delay = policy.delay_for_attempt(failed.saturating_sub(1));
                            entry.message.status = MessageStatus::Queued;
                            entry.retry_at = Some(Instant::now() + delay);
                            AttemptOutcome::Retry {
                                attempt: job.attempt,
                                delay,
                                error: err.to_string(),
                            }
                        }
                    }
                }
            };

            let archived = match &outcome {
                AttemptOutcome::Discarded => st.archive(&job.id, MessageStatus::Cancelled),
                AttemptOutcome::Failed(_) => st.archive(&job.id, MessageStatus::Failed),
                _ => None,
            };
            (outcome, record, archived)
        };

        if let Some((_, Some(timer))) = archived {
            self.timers.cancel(timer);
        }

        match outcome {
            AttemptOutcome::Discarded => {
                debug!(component = "delivery", id = %job.id, "Send result discarded for cancelled message");
            }
            AttemptOutcome::Sent(transport_id) => {
                self.guard.record_send();
                self.track_confirmation(&job.id);
                debug!(
                    component = "delivery",
                    action = "send",
                    id = %job.id,
                    transport_id = %transport_id,
                    attempt = job.attempt,
                    "Message sent"
                );
                self.emit(QueueEvent::Sent {
                    id: job.id.clone(),
                    attempt: job.attempt,
                });
            }
            AttemptOutcome::Retry {
                attempt,
                delay,
                error,
            } => {
                warn!(
                    component = "delivery",
                    action = "send",
                    id = %job.id,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Send failed, will retry"
                );
                self.emit(QueueEvent::RetryScheduled {
                    id: job.id.clone(),
                    attempt,
                    error,
                });
            }
            AttemptOutcome::Failed(error) => {
                warn!(
                    component = "delivery",
                    action = "send",
                    id = %job.id,
                    attempt = job.attempt,
                    error = %error,
                    "Message failed permanently"
                );
                self.emit(QueueEvent::Failed {
                    id: job.id.clone(),
                    error,
                });
            }
        }

        self.sink.append_send_record(&record).await;
    }

    /// Assume delivery if no confirmation arrives before the timeout
    fn track_confirmation(self: &Arc<Self>, id: &str) {
        let weak = Arc::downgrade(self);
        let message_id = id.to_string();
        let timer = self
            .timers
            .schedule_once(self.config.confirmation_timeout(), move || async move {
                if let Some(inner) = weak.upgrade() {
                    debug!(
                        component = "delivery",
                        id = %message_id,
                        "No confirmation received, assuming delivered"
                    );
                    inner.apply_confirmation(&DeliveryConfirmation {
                        message_id,
                        status: AckStatus::Delivered,
                        timestamp: Utc::now(),
                        synthesized: true,
                    });
                }
            });

        let mut st = self.lock();
        match st.active.get_mut(id) {
            Some(entry) if entry.message.status == MessageStatus::Sent => {
                entry.confirmation_timer = Some(timer);
            }
            _ => {
                drop(st);
                self.timers.cancel(timer);
            }
        }
    }

    fn apply_confirmation(&self, ack: &DeliveryConfirmation) -> bool {
        let (event, timer) = {
            let mut st = self.lock();
            match st.find_active(&ack.message_id) {
                Some(id) => {
                    let status = st.active.get(&id).map(|e| e.message.status);
                    if status != Some(MessageStatus::Sent) {
                        return false;
                    }
                    let (new_status, event) = match ack.status {
                        AckStatus::Sent => return true,
                        AckStatus::Delivered => (
                            MessageStatus::Delivered,
                            QueueEvent::Delivered {
                                id: id.clone(),
                                synthesized: ack.synthesized,
                            },
                        ),
                        AckStatus::Read => (MessageStatus::Read, QueueEvent::Read { id: id.clone() }),
                    };
                    let timer = st.archive(&id, new_status).and_then(|(_, timer)| timer);
                    (event, timer)
                }
                None => {
                    // A read receipt may follow a delivery that was already archived
                    if ack.status != AckStatus::Read {
                        return false;
                    }
                    let promoted = st
                        .history
                        .iter_mut()
                        .rev()
                        .find(|m| m.matches_id(&ack.message_id))
                        .filter(|m| m.status == MessageStatus::Delivered)
                        .map(|m| {
                            m.status = MessageStatus::Read;
                            m.id.clone()
                        });
                    match promoted {
                        Some(id) => {
                            st.counters.read += 1;
                            (QueueEvent::Read { id }, None)
                        }
                        None => return false,
                    }
                }
            }
        };

        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }
        debug!(
            component = "delivery",
            message_id = %ack.message_id,
            status = ?ack.status,
            synthesized = ack.synthesized,
            "Delivery confirmed"
        );
        self.emit(event);
        true
    }
}
