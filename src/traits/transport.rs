//! Publish/subscribe transport abstraction.
//!
//! The gateway protocol only needs three operations from a broker client:
//! publish a payload, subscribe a topic filter with a handler, and drop a
//! subscription again when a gateway is destroyed.
//!
//! ```text
//! Parking/+/Mezzi/+            backend subscribes to all status telemetry
//! Parking/+/RisposteComandi/+  backend subscribes to all command responses
//! Parking/7/Comandi/+          gateway of parking 7 subscribes to its commands
//! ```
//!
//! # Implementations
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`MqttTransport`] | rumqttc client with auto-reconnect and resubscribe |
//! | [`MemoryBroker`] | in-process broker for tests and local runs |
//!
//! Delivery is at-least-once. Handlers must tolerate duplicates and must not
//! assume ordering across a reconnect.
//!
//! [`MqttTransport`]: crate::backends::mqtt::MqttTransport
//! [`MemoryBroker`]: crate::backends::memory::MemoryBroker

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;

/// A message received from a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttMessage {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload as raw bytes.
    pub payload: Vec<u8>,
}

impl MqttMessage {
    /// Create a new message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Returns the payload as a UTF-8 string, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Receives raw messages for a subscribed topic filter.
///
/// Typed per-kind handling lives in [`MessageRouter`](crate::router::MessageRouter),
/// which implements this trait.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound message. Errors are the handler's to log.
    async fn handle(&self, message: MqttMessage);
}

/// Pub/sub client used by gateways and the backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload to a concrete topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Register `handler` for every message matching `filter`.
    ///
    /// Filters support `+` and `#` wildcards. Registered filters survive
    /// reconnects.
    async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError>;

    /// Remove every handler registered for `filter`.
    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_payload_str() {
        let msg = MqttMessage::new("Parking/1/Mezzi/2", b"{}".to_vec());
        assert_eq!(msg.payload_str(), Some("{}"));

        let binary = MqttMessage::new("Parking/1/Mezzi/2", vec![0xff, 0xfe]);
        assert_eq!(binary.payload_str(), None);
    }
}
