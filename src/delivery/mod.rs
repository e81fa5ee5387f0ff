//! Reliable outbound delivery

pub mod queue;

pub use queue::{fingerprint, MessageReliabilityQueue};
