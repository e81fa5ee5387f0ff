//! Transport session interface
//!
//! The wire protocol (handshake, encryption, pairing) lives outside this
//! crate. Components talk to it through the [`Transport`] trait and learn
//! about its lifecycle through [`TransportEvent`]s delivered over an mpsc
//! channel.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::models::{DeliveryConfirmation, DisconnectReason};

/// Acknowledgement of a send accepted by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Identifier assigned by the transport; later acks refer to it
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

impl SendReceipt {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle notification from the transport session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Close(DisconnectReason),
    MessageAck(DeliveryConfirmation),
}

/// Transport session
///
/// Uses `async_trait` for async methods and `mockall::automock` for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// (Re)establish the session; completion is signalled by `TransportEvent::Open`
    async fn connect(&self) -> Result<(), TransportError>;

    /// Send `payload` to `target`
    async fn send(&self, target: &str, payload: &str) -> Result<SendReceipt, TransportError>;

    /// Measure round-trip latency
    async fn ping(&self) -> Result<Duration, TransportError> {
        Err(TransportError::Unsupported("ping".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SilentTransport;

    #[async_trait]
    impl Transport for SilentTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&self, _target: &str, _payload: &str) -> Result<SendReceipt, TransportError> {
            Ok(SendReceipt::new("wire-1"))
        }
    }

    // Test 1: ping is unsupported unless implemented
    #[tokio::test]
    async fn test_default_ping_unsupported() {
        let transport = SilentTransport;
        assert!(matches!(
            transport.ping().await,
            Err(TransportError::Unsupported(_))
        ));
    }

    // Test 2: Mocked transport returns the configured receipt
    #[tokio::test]
    async fn test_mock_transport_send() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|target, payload| target == "alice" && payload == "hi")
            .times(1)
            .returning(|_, _| Ok(SendReceipt::new("wire-7")));

        let receipt = transport.send("alice", "hi").await.unwrap();
        assert_eq!(receipt.message_id, "wire-7");
    }
}
