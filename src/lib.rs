//! session-steward - Reliability layer for a persistent messaging session
//!
//! This crate keeps a long-lived transport session healthy: it reconnects
//! with backoff, paces outbound messages under rate limits, retries and
//! confirms deliveries, schedules background synchronization and raises
//! alerts when synchronization degrades.

pub mod compliance;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod events;
pub mod history;
pub mod models;
pub mod monitor;
pub mod otel;
pub mod persistence;
pub mod retry;
pub mod session;
pub mod sync;
pub mod timer;
pub mod transport;
