//! Typed dispatch of inbound gateway-protocol messages.
//!
//! A transport hands raw [`MqttMessage`]s to a [`MessageHandler`]. The
//! [`MessageRouter`] is that handler: it parses the topic, decodes the payload
//! for the topic kind and calls the typed handler registered for that kind.
//! Malformed topics and payloads are logged and dropped.
//!
//! ```ignore
//! let router = MessageRouter::new()
//!     .on_status(telemetry.clone())
//!     .on_response(tracker.clone());
//! transport.subscribe(&topics::filter_all(), Arc::new(router)).await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::messages::{self, Command, CommandResponse, StatusMessage};
use crate::topics::{self, TopicKind};
use crate::traits::{MessageHandler, MqttMessage};

/// Receives commands addressed to a parking.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// `vehicle_id` comes from the topic, not the payload.
    async fn on_command(&self, parking_id: i64, vehicle_id: i64, command: Command);
}

/// Receives vehicle status telemetry.
#[async_trait]
pub trait StatusHandler: Send + Sync {
    /// Handle one status message.
    async fn on_status(&self, parking_id: i64, vehicle_id: i64, status: StatusMessage);
}

/// Receives command responses.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    /// Handle one response.
    async fn on_response(&self, parking_id: i64, vehicle_id: i64, response: CommandResponse);
}

/// Routes raw messages to typed handlers by topic kind.
///
/// Kinds without a registered handler are ignored.
#[derive(Clone, Default)]
pub struct MessageRouter {
    commands: Option<Arc<dyn CommandHandler>>,
    statuses: Option<Arc<dyn StatusHandler>>,
    responses: Option<Arc<dyn ResponseHandler>>,
}

impl MessageRouter {
    /// Router with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route commands to `handler`.
    pub fn on_command(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.commands = Some(handler);
        self
    }

    /// Route status telemetry to `handler`.
    pub fn on_status(mut self, handler: Arc<dyn StatusHandler>) -> Self {
        self.statuses = Some(handler);
        self
    }

    /// Route responses to `handler`.
    pub fn on_response(mut self, handler: Arc<dyn ResponseHandler>) -> Self {
        self.responses = Some(handler);
        self
    }

    /// Decode and deliver one message.
    ///
    /// Returns `Ok(false)` when no handler is registered for the kind.
    pub async fn route(&self, message: &MqttMessage) -> Result<bool, ProtocolError> {
        let (kind, parking_id, vehicle_id) = topics::parse(&message.topic)?;
        match kind {
            TopicKind::Command => {
                let Some(handler) = &self.commands else {
                    return Ok(false);
                };
                let command: Command = messages::decode(&message.payload)?;
                handler.on_command(parking_id, vehicle_id, command).await;
            }
            TopicKind::Status => {
                let Some(handler) = &self.statuses else {
                    return Ok(false);
                };
                let status: StatusMessage = messages::decode(&message.payload)?;
                handler.on_status(parking_id, vehicle_id, status).await;
            }
            TopicKind::Response => {
                let Some(handler) = &self.responses else {
                    return Ok(false);
                };
                let response: CommandResponse = messages::decode(&message.payload)?;
                handler.on_response(parking_id, vehicle_id, response).await;
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl MessageHandler for MessageRouter {
    async fn handle(&self, message: MqttMessage) {
        match self.route(&message).await {
            Ok(true) => {}
            Ok(false) => debug!(topic = %message.topic, "no handler for topic kind"),
            Err(e) => warn!(topic = %message.topic, error = %e, "dropping message"),
        }
    }
}
