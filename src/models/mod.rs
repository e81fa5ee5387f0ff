//! Domain models for session-steward
//!
//! This module contains the data structures shared between components and
//! written to the persistence sink or notification channels.

pub mod alert;
pub mod connection;
pub mod message;
pub mod record;
pub mod sync;

pub use alert::*;
pub use connection::*;
pub use message::*;
pub use record::*;
pub use sync::*;
