//! Background synchronization
//!
//! The [`SyncScheduler`] decides when to synchronize; a [`SyncWorker`]
//! supplied by the embedding application does the actual data extraction.
//!
//! # Example
//!
//! ```ignore
//! use session_steward::sync::{SyncScheduler, SyncWorker};
//! use session_steward::models::SyncKind;
//!
//! let scheduler = SyncScheduler::new(config.sync.clone(), sink);
//! scheduler.initialize(worker);
//! scheduler.on_connection_established();
//!
//! let dispatch = scheduler.trigger_manual_sync(SyncKind::Incremental).await?;
//! ```

pub mod scheduler;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::models::SyncOutcome;

pub use scheduler::{SyncDispatch, SyncScheduler};

/// External collaborator performing the actual synchronization
///
/// Uses `async_trait` for async methods and `mockall::automock` for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncWorker: Send + Sync {
    /// Synchronize everything
    async fn perform_full_sync(&self) -> Result<SyncOutcome, SyncError>;

    /// Synchronize changes since the previous run
    async fn perform_incremental_sync(&self) -> Result<SyncOutcome, SyncError>;
}
