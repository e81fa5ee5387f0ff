//! Application error types for session-steward
//!
//! This module defines the error taxonomy shared by every component.
//! All error types use `thiserror` for ergonomic error handling.

use std::time::Duration;

use thiserror::Error;

/// Connection-level errors reported by the transport session
///
/// These drive the connection stabilizer. Callers never retry them directly:
/// reconnection is the retry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// The session is not connected
    #[error("Transport not connected")]
    NotConnected,

    /// The transport did not answer in time
    #[error("Transport timeout after {0:?}")]
    Timeout(Duration),

    /// The remote side closed the session
    #[error("Connection closed: {0}")]
    Closed(String),

    /// The transport rejected the request
    #[error("Transport rejected request: {0}")]
    Rejected(String),

    /// The transport does not support the operation
    #[error("Operation not supported by transport: {0}")]
    Unsupported(String),

    /// Generic transport failure
    #[error("Transport error: {0}")]
    Other(String),
}

/// An operation was deferred rather than failed
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Throttled: {reason} (retry in {wait:?})")]
pub struct ThrottledError {
    /// Why the operation was deferred
    pub reason: String,

    /// How long until the operation may be attempted again
    pub wait: Duration,
}

/// Malformed input, rejected immediately without retry
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// A required field is empty
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Message content exceeds the configured maximum
    #[error("Content too large: {size} bytes (max {max})")]
    ContentTooLarge {
        /// Actual size in bytes
        size: usize,
        /// Allowed maximum in bytes
        max: usize,
    },

    /// A value is outside its accepted range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// Explanation
        reason: String,
    },
}

/// Outbound message delivery errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryError {
    /// An identical message is already in flight
    #[error("Duplicate message, already in flight as {existing_id}")]
    Duplicate {
        /// Identifier of the in-flight message
        existing_id: String,
    },

    /// Input validation failed
    #[error("Invalid message: {0}")]
    Invalid(#[from] ValidationError),

    /// The send did not complete before the timeout
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    /// The transport failed the send
    #[error("Send failed: {0}")]
    Transport(#[from] TransportError),

    /// The message exhausted its retry budget
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        /// Number of attempts made
        attempts: u32,
        /// Error of the final attempt
        last_error: String,
    },

    /// Message identifier is unknown
    #[error("Message not found: {0}")]
    NotFound(String),
}

/// Synchronization errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// The worker failed
    #[error("Sync worker failed: {0}")]
    Worker(String),

    /// The worker did not finish before the timeout
    #[error("Sync timed out after {0:?}")]
    Timeout(Duration),

    /// No transport session is connected
    #[error("Not connected")]
    NotConnected,

    /// The scheduler has not been initialized with a worker
    #[error("Scheduler not initialized")]
    NotInitialized,

    /// The scheduler has been stopped
    #[error("Scheduler stopped")]
    Stopped,

    /// Consecutive failures reached the retry limit
    #[error("Sync retries exhausted after {0} attempts")]
    ExhaustedRetries(u32),

    /// Recent failures reached the critical health threshold
    #[error("Sync health critical: {0} recent failures")]
    CriticalHealth(usize),

    /// Transport failure during sync
    #[error("Transport error during sync: {0}")]
    Transport(#[from] TransportError),
}

/// Persistence sink errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Record (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sink is unavailable
    #[error("Persistence unavailable: {0}")]
    Unavailable(String),

    /// The write did not finish in time
    #[error("Persistence write timed out after {0:?}")]
    Timeout(Duration),
}

/// Alert notification errors
#[derive(Debug, Error)]
pub enum NotifyError {
    /// HTTP delivery failed
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status
    #[error("Webhook returned HTTP {0}")]
    Status(u16),

    /// The channel did not answer in time
    #[error("Notification channel timed out after {0:?}")]
    Timeout(Duration),

    /// Generic channel failure
    #[error("Notification failed: {0}")]
    Channel(String),
}

/// Coarse classification of failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection-level failure, handled by reconnection
    Transport,
    /// Deferred, not a failure
    Throttled,
    /// Rejected input
    Validation,
    /// Retryable delivery failure
    Delivery,
    /// Terminal after retries
    ExhaustedRetries,
    /// Escalated to auto-recovery or external intervention
    CriticalHealth,
    /// Anything else
    Internal,
}

/// Application-level error type
///
/// Aggregates all component error types.
#[derive(Debug, Error)]
pub enum AppError {
    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Throttled operation
    #[error("{0}")]
    Throttled(#[from] ThrottledError),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Delivery error
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Persistence error
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Classify this error within the failure taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Transport(_) => ErrorClass::Transport,
            AppError::Throttled(_) => ErrorClass::Throttled,
            AppError::Validation(_) => ErrorClass::Validation,
            AppError::Delivery(DeliveryError::Invalid(_)) => ErrorClass::Validation,
            AppError::Delivery(DeliveryError::ExhaustedRetries { .. }) => {
                ErrorClass::ExhaustedRetries
            }
            AppError::Delivery(_) => ErrorClass::Delivery,
            AppError::Sync(SyncError::ExhaustedRetries(_)) => ErrorClass::ExhaustedRetries,
            AppError::Sync(SyncError::CriticalHealth(_)) => ErrorClass::CriticalHealth,
            AppError::Sync(SyncError::Transport(_) | SyncError::NotConnected) => {
                ErrorClass::Transport
            }
            AppError::Sync(_) => ErrorClass::Delivery,
            AppError::Persistence(_) | AppError::Config(_) | AppError::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;
}

impl RetryableError for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            TransportError::NotConnected => true,
            TransportError::Timeout(_) => true,
            TransportError::Closed(_) => true,
            TransportError::Other(_) => true,

            TransportError::Rejected(_) => false,
            TransportError::Unsupported(_) => false,
        }
    }
}

impl RetryableError for DeliveryError {
    fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Timeout(_) => true,
            DeliveryError::Transport(err) => err.is_retryable(),

            DeliveryError::Duplicate { .. } => false,
            DeliveryError::Invalid(_) => false,
            DeliveryError::ExhaustedRetries { .. } => false,
            DeliveryError::NotFound(_) => false,
        }
    }
}

impl RetryableError for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            SyncError::Worker(_) => true,
            SyncError::Timeout(_) => true,
            SyncError::Transport(err) => err.is_retryable(),

            SyncError::NotConnected => false,
            SyncError::NotInitialized => false,
            SyncError::Stopped => false,
            SyncError::ExhaustedRetries(_) => false,
            SyncError::CriticalHealth(_) => false,
        }
    }
}
