//! Backend-side command publishing.
//!
//! The [`CommandDispatcher`] builds commands with a fresh id, publishes them
//! to the vehicle's command topic with bounded retry, and can optionally wait
//! for the correlated response through its [`ResponseTracker`].
//!
//! ```ignore
//! let dispatcher = CommandDispatcher::new(transport, clock, RetryPolicy::default());
//! dispatcher.subscribe_responses().await?;
//!
//! // Fire and forget
//! dispatcher.unlock(parking_id, vehicle_id).await?;
//!
//! // Request/response
//! let cmd = dispatcher.command(vehicle_id, CommandType::RequestBattery);
//! let response = dispatcher.dispatch_and_wait(parking_id, cmd, Duration::from_secs(5)).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DispatchError, TransportError};
use crate::messages::{self, Command, CommandResponse, CommandType, IndicatorColor};
use crate::retry::RetryPolicy;
use crate::router::{MessageRouter, ResponseHandler};
use crate::topics::{self, TopicKind};
use crate::traits::{Clock, Transport};

/// Default `senderId` of backend commands.
pub const BACKEND_SENDER_ID: &str = "backend";

// ============================================================================
// Response tracking
// ============================================================================

/// Correlates command responses with waiting callers by command id.
#[derive(Default)]
pub struct ResponseTracker {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<CommandResponse>>>,
}

impl ResponseTracker {
    /// Tracker with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for the response to `command_id`.
    pub fn register(&self, command_id: Uuid) -> oneshot::Receiver<CommandResponse> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(command_id, tx);
        rx
    }

    /// Stop waiting for `command_id`.
    pub fn forget(&self, command_id: &Uuid) {
        self.lock().remove(command_id);
    }

    /// Number of commands still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<CommandResponse>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ResponseHandler for ResponseTracker {
    async fn on_response(&self, parking_id: i64, vehicle_id: i64, response: CommandResponse) {
        if !response.success {
            warn!(
                parking_id,
                vehicle_id,
                command_id = %response.command_id,
                command = ?response.original_command_type,
                reason = response.error_description.as_deref().unwrap_or_default(),
                "command failed on device"
            );
        }
        let waiter = self.lock().remove(&response.command_id);
        match waiter {
            Some(tx) => {
                // Receiver gone means the caller timed out.
                let _ = tx.send(response);
            }
            None => debug!(command_id = %response.command_id, "uncorrelated response"),
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Publishes commands to gateways.
pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    sender_id: String,
    tracker: Arc<ResponseTracker>,
}

impl CommandDispatcher {
    /// Dispatcher sending as [`BACKEND_SENDER_ID`].
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            clock,
            policy,
            sender_id: BACKEND_SENDER_ID.to_string(),
            tracker: Arc::new(ResponseTracker::new()),
        }
    }

    /// Override the `senderId` stamped on commands.
    pub fn with_sender_id(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    /// Tracker correlating responses to this dispatcher's commands.
    pub fn response_tracker(&self) -> Arc<ResponseTracker> {
        Arc::clone(&self.tracker)
    }

    /// Subscribe the response tracker to every parking's responses.
    pub async fn subscribe_responses(&self) -> Result<(), TransportError> {
        let router = MessageRouter::new().on_response(self.response_tracker());
        self.transport
            .subscribe(&topics::filter(TopicKind::Response, None), Arc::new(router))
            .await
    }

    /// New command with a fresh id, stamped now.
    pub fn command(&self, vehicle_id: i64, command_type: CommandType) -> Command {
        Command::new(vehicle_id, command_type, self.sender_id.clone(), self.clock.now())
    }

    /// Publish a command to `Parking/{parking_id}/Comandi/{vehicle_id}`.
    ///
    /// Only the publish is retried. Returns the command id.
    pub async fn dispatch(&self, parking_id: i64, command: Command) -> Result<Uuid, DispatchError> {
        let topic = topics::build(TopicKind::Command, parking_id, command.vehicle_id);
        let payload = messages::encode(&command)?;
        let command_id = command.command_id;

        self.policy
            .retry(&topic, || self.transport.publish(&topic, payload.clone()))
            .await
            .map_err(|source| DispatchError::Exhausted {
                command_id,
                attempts: self.policy.attempts,
                source,
            })?;

        info!(
            parking_id,
            vehicle_id = command.vehicle_id,
            %command_id,
            command = ?command.command_type,
            "command dispatched"
        );
        Ok(command_id)
    }

    /// Publish a command and wait for its response.
    pub async fn dispatch_and_wait(
        &self,
        parking_id: i64,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandResponse, DispatchError> {
        let command_id = command.command_id;
        let rx = self.tracker.register(command_id);

        if let Err(e) = self.dispatch(parking_id, command).await {
            self.tracker.forget(&command_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.tracker.forget(&command_id);
                Err(DispatchError::Timeout(command_id))
            }
        }
    }

    /// Release a vehicle's lock.
    pub async fn unlock(&self, parking_id: i64, vehicle_id: i64) -> Result<Uuid, DispatchError> {
        self.dispatch(parking_id, self.command(vehicle_id, CommandType::Unlock))
            .await
    }

    /// Engage a vehicle's lock.
    pub async fn lock(&self, parking_id: i64, vehicle_id: i64) -> Result<Uuid, DispatchError> {
        self.dispatch(parking_id, self.command(vehicle_id, CommandType::Lock))
            .await
    }

    /// Ask for the battery level.
    pub async fn request_battery(
        &self,
        parking_id: i64,
        vehicle_id: i64,
    ) -> Result<Uuid, DispatchError> {
        self.dispatch(parking_id, self.command(vehicle_id, CommandType::RequestBattery))
            .await
    }

    /// Ask for a fresh status message.
    pub async fn request_status(
        &self,
        parking_id: i64,
        vehicle_id: i64,
    ) -> Result<Uuid, DispatchError> {
        self.dispatch(parking_id, self.command(vehicle_id, CommandType::RequestStatus))
            .await
    }

    /// Force the status light to `color`.
    pub async fn set_indicator(
        &self,
        parking_id: i64,
        vehicle_id: i64,
        color: IndicatorColor,
    ) -> Result<Uuid, DispatchError> {
        let color = serde_json::to_value(color).map_err(crate::error::ProtocolError::from)?;
        let command = self
            .command(vehicle_id, CommandType::SetIndicatorColor)
            .with_parameter("color", color);
        self.dispatch(parking_id, command).await
    }
}
