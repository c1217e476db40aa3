//! Per-parking gateway emulation.
//!
//! A [`Gateway`] owns the device emulators of one parking and answers the
//! commands published on `Parking/{id}/Comandi/+`. The [`GatewayFleet`] keeps
//! one gateway per active parking and aligns their rosters with the store;
//! the [`BatterySimulator`] drives battery levels over time.
//!
//! # Concurrency
//!
//! The roster is a `RwLock<HashMap>` of per-device `Mutex`es. Commands for
//! the same vehicle serialize on the device mutex, commands for different
//! vehicles proceed in parallel, and roster edits never block on a device.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use ride_fleet::backends::memory::MemoryBroker;
//! use ride_fleet::gateway::Gateway;
//! use ride_fleet::messages::{Command, CommandType, VehicleClass, VehicleStatus};
//! use ride_fleet::models::VehicleRecord;
//! use ride_fleet::retry::RetryPolicy;
//! use ride_fleet::traits::SystemClock;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = Arc::new(MemoryBroker::new());
//! let gateway = Gateway::new(1, broker.clone(), Arc::new(SystemClock), RetryPolicy::once(), 64);
//! gateway.add_device(&VehicleRecord {
//!     id: 7,
//!     matricola: "EB-007".into(),
//!     class: VehicleClass::EBike,
//!     status: VehicleStatus::Available,
//!     battery: Some(90),
//!     parking_id: 1,
//! }).await;
//!
//! let unlock = Command::new(7, CommandType::Unlock, "backend", Utc::now());
//! let response = gateway.handle_command(7, unlock).await;
//! assert!(response.success);
//! assert_eq!(broker.published_to("Parking/1/RisposteComandi/7").len(), 1);
//! # }
//! ```

pub mod battery;
pub mod fleet;

pub use battery::BatterySimulator;
pub use fleet::{GatewayFleet, ReconcileReport, ResyncReport};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::device::{DeviceEmulator, DeviceSnapshot};
use crate::error::{DeviceError, TransportError};
use crate::messages::{self, Command, CommandResponse, StatusMessage};
use crate::models::VehicleRecord;
use crate::retry::RetryPolicy;
use crate::router::{CommandHandler, MessageRouter};
use crate::topics::{self, TopicKind};
use crate::traits::{Clock, Transport};

type DeviceHandle = Arc<Mutex<DeviceEmulator>>;

// ============================================================================
// Replay cache
// ============================================================================

/// Bounded memory of answered command ids, oldest evicted first.
#[derive(Debug)]
struct ProcessedCommands {
    capacity: usize,
    order: VecDeque<Uuid>,
    responses: HashMap<Uuid, CommandResponse>,
}

impl ProcessedCommands {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            responses: HashMap::new(),
        }
    }

    fn get(&self, id: &Uuid) -> Option<CommandResponse> {
        self.responses.get(id).cloned()
    }

    fn insert(&mut self, response: CommandResponse) {
        if self.responses.contains_key(&response.command_id) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.responses.remove(&oldest);
            }
        }
        self.order.push_back(response.command_id);
        self.responses.insert(response.command_id, response);
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Snapshot of a gateway for listings.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfo {
    /// Parking served.
    pub parking_id: i64,
    /// Whether the command subscription is active.
    pub running: bool,
    /// Devices, ordered by vehicle id.
    pub devices: Vec<DeviceSnapshot>,
}

/// Gateway of one parking.
pub struct Gateway {
    parking_id: i64,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    devices: RwLock<HashMap<i64, DeviceHandle>>,
    processed: StdMutex<ProcessedCommands>,
    running: AtomicBool,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("parking_id", &self.parking_id)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Create a gateway with an empty roster.
    ///
    /// `dedupe_capacity` bounds the number of command ids remembered for
    /// replay detection.
    pub fn new(
        parking_id: i64,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        dedupe_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            parking_id,
            transport,
            clock,
            retry,
            devices: RwLock::new(HashMap::new()),
            processed: StdMutex::new(ProcessedCommands::new(dedupe_capacity)),
            running: AtomicBool::new(false),
        })
    }

    /// Parking served by this gateway.
    pub fn parking_id(&self) -> i64 {
        self.parking_id
    }

    /// Filter this gateway listens on.
    pub fn command_filter(&self) -> String {
        topics::filter(TopicKind::Command, Some(self.parking_id))
    }

    /// Whether the command subscription is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to this parking's command topics.
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let router = MessageRouter::new().on_command(Arc::clone(self) as Arc<dyn CommandHandler>);
        if let Err(e) = self
            .transport
            .subscribe(&self.command_filter(), Arc::new(router))
            .await
        {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!(parking_id = self.parking_id, "gateway started");
        Ok(())
    }

    /// Drop the command subscription.
    pub async fn stop(&self) -> Result<(), TransportError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.unsubscribe(&self.command_filter()).await?;
        info!(parking_id = self.parking_id, "gateway stopped");
        Ok(())
    }

    // ========================================================================
    // Roster
    // ========================================================================

    /// Add an emulator mirroring `record`. Returns `false` if already present.
    pub async fn add_device(&self, record: &VehicleRecord) -> bool {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&record.id) {
            return false;
        }
        devices.insert(
            record.id,
            Arc::new(Mutex::new(DeviceEmulator::from_record(record))),
        );
        debug!(parking_id = self.parking_id, vehicle_id = record.id, "device added");
        true
    }

    /// Add the device, or reload an existing one from `record`.
    pub async fn sync_device(&self, record: &VehicleRecord) {
        let existing = self.devices.read().await.get(&record.id).cloned();
        match existing {
            Some(device) => device.lock().await.sync_from(record),
            None => {
                self.add_device(record).await;
            }
        }
    }

    /// Remove an emulator. Returns `false` if it was not present.
    pub async fn remove_device(&self, vehicle_id: i64) -> bool {
        let removed = self.devices.write().await.remove(&vehicle_id).is_some();
        if removed {
            debug!(parking_id = self.parking_id, vehicle_id, "device removed");
        }
        removed
    }

    /// Whether the roster holds `vehicle_id`.
    pub async fn contains(&self, vehicle_id: i64) -> bool {
        self.devices.read().await.contains_key(&vehicle_id)
    }

    /// Vehicle ids in the roster, ascending.
    pub async fn vehicle_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.devices.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of one device.
    pub async fn device(&self, vehicle_id: i64) -> Option<DeviceSnapshot> {
        let device = self.handle(vehicle_id).await?;
        let snapshot = device.lock().await.snapshot();
        Some(snapshot)
    }

    /// Snapshots of every device, ordered by vehicle id.
    pub async fn list_devices(&self) -> Vec<DeviceSnapshot> {
        let handles: Vec<DeviceHandle> = self.devices.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for device in handles {
            snapshots.push(device.lock().await.snapshot());
        }
        snapshots.sort_by_key(|s| s.vehicle_id);
        snapshots
    }

    /// Gateway listing.
    pub async fn info(&self) -> GatewayInfo {
        GatewayInfo {
            parking_id: self.parking_id,
            running: self.is_running(),
            devices: self.list_devices().await,
        }
    }

    async fn handle(&self, vehicle_id: i64) -> Option<DeviceHandle> {
        self.devices.read().await.get(&vehicle_id).cloned()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Execute a command for `vehicle_id` (taken from the topic) and publish
    /// the response and any status change.
    ///
    /// A command id seen before is not executed again: its cached response is
    /// republished.
    pub async fn handle_command(&self, vehicle_id: i64, command: Command) -> CommandResponse {
        if command.vehicle_id != vehicle_id {
            warn!(
                parking_id = self.parking_id,
                vehicle_id,
                payload_vehicle_id = command.vehicle_id,
                "topic and payload disagree on vehicle, using topic"
            );
        }

        let Some(device) = self.handle(vehicle_id).await else {
            let mut response =
                CommandResponse::failed(&command, DeviceError::NotFound(vehicle_id).to_string());
            response.vehicle_id = vehicle_id;
            warn!(parking_id = self.parking_id, vehicle_id, command_id = %command.command_id, "command for unknown vehicle");
            self.publish_response(vehicle_id, &response).await;
            return response;
        };

        let (response, status) = {
            let mut device = device.lock().await;
            if let Some(cached) = self.cached(&command.command_id) {
                debug!(
                    parking_id = self.parking_id,
                    vehicle_id,
                    command_id = %command.command_id,
                    "replayed command, republishing cached response"
                );
                (cached, None)
            } else {
                let mut outcome = device.execute(&command, self.clock.now());
                outcome.response.vehicle_id = vehicle_id;
                self.remember(outcome.response.clone());
                (outcome.response, outcome.status)
            }
        };

        if response.success {
            info!(
                parking_id = self.parking_id,
                vehicle_id,
                command_id = %command.command_id,
                command = ?command.command_type,
                "command executed"
            );
        } else {
            warn!(
                parking_id = self.parking_id,
                vehicle_id,
                command_id = %command.command_id,
                reason = response.error_description.as_deref().unwrap_or_default(),
                "command refused"
            );
        }

        self.publish_response(vehicle_id, &response).await;
        if let Some(status) = status {
            self.publish_status_message(&status).await;
        }
        response
    }

    fn cached(&self, command_id: &Uuid) -> Option<CommandResponse> {
        self.processed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(command_id)
    }

    fn remember(&self, response: CommandResponse) {
        self.processed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(response);
    }

    // ========================================================================
    // Battery and telemetry
    // ========================================================================

    /// Apply a battery level to a device and publish the resulting status.
    pub async fn set_battery(
        &self,
        vehicle_id: i64,
        level: i32,
    ) -> Result<Option<StatusMessage>, DeviceError> {
        let device = self
            .handle(vehicle_id)
            .await
            .ok_or(DeviceError::NotFound(vehicle_id))?;
        let status = device.lock().await.set_battery(level, self.clock.now());
        if let Some(status) = &status {
            self.publish_status_message(status).await;
        }
        Ok(status)
    }

    /// Publish a status heartbeat for one device.
    pub async fn publish_status(&self, vehicle_id: i64) -> Result<(), DeviceError> {
        let device = self
            .handle(vehicle_id)
            .await
            .ok_or(DeviceError::NotFound(vehicle_id))?;
        let status = device
            .lock()
            .await
            .status_message(self.clock.now(), Some("heartbeat"));
        self.publish_status_message(&status).await;
        Ok(())
    }

    async fn publish_response(&self, vehicle_id: i64, response: &CommandResponse) {
        let topic = topics::build(TopicKind::Response, self.parking_id, vehicle_id);
        match messages::encode(response) {
            Ok(payload) => self.publish(topic, payload).await,
            Err(e) => error!(%topic, error = %e, "failed to encode response"),
        }
    }

    async fn publish_status_message(&self, status: &StatusMessage) {
        let topic = topics::build(TopicKind::Status, self.parking_id, status.vehicle_id);
        match messages::encode(status) {
            Ok(payload) => self.publish(topic, payload).await,
            Err(e) => error!(%topic, error = %e, "failed to encode status"),
        }
    }

    // Local transitions stand even when the publish is lost.
    async fn publish(&self, topic: String, payload: Vec<u8>) {
        let result = self
            .retry
            .retry(&topic, || self.transport.publish(&topic, payload.clone()))
            .await;
        if let Err(e) = result {
            error!(parking_id = self.parking_id, %topic, error = %e, "publish failed");
        }
    }
}

#[async_trait]
impl CommandHandler for Gateway {
    async fn on_command(&self, parking_id: i64, vehicle_id: i64, command: Command) {
        if parking_id != self.parking_id {
            warn!(
                parking_id = self.parking_id,
                topic_parking_id = parking_id,
                "command for another parking, ignoring"
            );
            return;
        }
        self.handle_command(vehicle_id, command).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBroker;
    use crate::messages::{CommandType, VehicleClass, VehicleStatus};
    use crate::traits::SystemClock;
    use chrono::Utc;

    fn record(id: i64, status: VehicleStatus, battery: Option<u8>) -> VehicleRecord {
        VehicleRecord {
            id,
            matricola: format!("EB-{:03}", id),
            class: VehicleClass::EBike,
            status,
            battery,
            parking_id: 1,
        }
    }

    fn gateway(broker: &Arc<MemoryBroker>, capacity: usize) -> Arc<Gateway> {
        Gateway::new(
            1,
            broker.clone(),
            Arc::new(SystemClock),
            RetryPolicy::once(),
            capacity,
        )
    }

    fn cmd(vehicle_id: i64, command_type: CommandType) -> Command {
        Command::new(vehicle_id, command_type, "backend", Utc::now())
    }

    // ========================================================================
    // Replay cache
    // ========================================================================

    #[test]
    fn processed_commands_evicts_oldest() {
        let mut cache = ProcessedCommands::new(2);
        let a = CommandResponse::ok(&cmd(1, CommandType::Lock), None);
        let b = CommandResponse::ok(&cmd(1, CommandType::Lock), None);
        let c = CommandResponse::ok(&cmd(1, CommandType::Lock), None);

        cache.insert(a.clone());
        cache.insert(b.clone());
        cache.insert(c.clone());

        assert!(cache.get(&a.command_id).is_none());
        assert_eq!(cache.get(&b.command_id), Some(b));
        assert_eq!(cache.get(&c.command_id), Some(c));
    }

    // ========================================================================
    // Roster
    // ========================================================================

    #[tokio::test]
    async fn roster_add_remove() {
        let broker = Arc::new(MemoryBroker::new());
        let gw = gateway(&broker, 16);

        assert!(gw.add_device(&record(2, VehicleStatus::Available, Some(80))).await);
        assert!(!gw.add_device(&record(2, VehicleStatus::Available, Some(80))).await);
        assert!(gw.add_device(&record(1, VehicleStatus::Maintenance, Some(80))).await);
        assert_eq!(gw.vehicle_ids().await, vec![1, 2]);

        assert!(gw.remove_device(2).await);
        assert!(!gw.remove_device(2).await);
        assert_eq!(gw.list_devices().await.len(), 1);
    }

    #[tokio::test]
    async fn sync_device_reloads_state() {
        let broker = Arc::new(MemoryBroker::new());
        let gw = gateway(&broker, 16);
        gw.add_device(&record(3, VehicleStatus::Available, Some(80))).await;

        gw.sync_device(&record(3, VehicleStatus::Maintenance, Some(60))).await;

        let device = gw.device(3).await.unwrap();
        assert_eq!(device.status, VehicleStatus::Maintenance);
        assert_eq!(device.battery, Some(60));
    }

    // ========================================================================
    // Commands
    // ========================================================================

    #[tokio::test]
    async fn unknown_vehicle_gets_failed_response() {
        let broker = Arc::new(MemoryBroker::new());
        let gw = gateway(&broker, 16);

        let response = gw.handle_command(42, cmd(42, CommandType::Unlock)).await;

        assert!(!response.success);
        assert_eq!(
            response.error_description.as_deref(),
            Some("vehicle 42 not found in emulation")
        );
        assert_eq!(broker.published_to("Parking/1/RisposteComandi/42").len(), 1);
    }

    #[tokio::test]
    async fn topic_vehicle_id_wins() {
        let broker = Arc::new(MemoryBroker::new());
        let gw = gateway(&broker, 16);
        gw.add_device(&record(5, VehicleStatus::Available, Some(80))).await;

        let response = gw.handle_command(5, cmd(99, CommandType::Unlock)).await;

        assert!(response.success);
        assert_eq!(response.vehicle_id, 5);
        assert_eq!(gw.device(5).await.unwrap().status, VehicleStatus::InUse);
    }

    #[tokio::test]
    async fn replay_republishes_without_reexecuting() {
        let broker = Arc::new(MemoryBroker::new());
        let gw = gateway(&broker, 16);
        gw.add_device(&record(5, VehicleStatus::Available, Some(80))).await;

        let unlock = cmd(5, CommandType::Unlock);
        let first = gw.handle_command(5, unlock.clone()).await;
        let replay = gw.handle_command(5, unlock).await;

        assert!(first.success);
        assert_eq!(replay, first);
        assert_eq!(broker.published_to("Parking/1/RisposteComandi/5").len(), 2);
        // Only the first execution changed state
        assert_eq!(broker.published_to("Parking/1/Mezzi/5").len(), 1);
    }

    #[tokio::test]
    async fn publish_failure_keeps_transition() {
        let broker = Arc::new(MemoryBroker::new());
        let gw = gateway(&broker, 16);
        gw.add_device(&record(5, VehicleStatus::Available, Some(80))).await;
        broker.fail_next_publishes(2);

        let response = gw.handle_command(5, cmd(5, CommandType::Unlock)).await;

        assert!(response.success);
        assert_eq!(gw.device(5).await.unwrap().status, VehicleStatus::InUse);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn start_subscribes_and_routes() {
        let broker = Arc::new(MemoryBroker::new());
        let gw = gateway(&broker, 16);
        gw.add_device(&record(5, VehicleStatus::Available, Some(80))).await;
        gw.start().await.unwrap();
        assert!(broker.is_subscribed("Parking/1/Comandi/+"));

        let unlock = cmd(5, CommandType::Unlock);
        broker
            .publish("Parking/1/Comandi/5", messages::encode(&unlock).unwrap())
            .await
            .unwrap();
        assert_eq!(gw.device(5).await.unwrap().status, VehicleStatus::InUse);

        gw.stop().await.unwrap();
        assert!(!broker.is_subscribed("Parking/1/Comandi/+"));
        assert!(!gw.is_running());
    }

    // ========================================================================
    // Battery
    // ========================================================================

    #[tokio::test]
    async fn set_battery_publishes_status() {
        let broker = Arc::new(MemoryBroker::new());
        let gw = gateway(&broker, 16);
        gw.add_device(&record(5, VehicleStatus::Available, Some(30))).await;

        let status = gw.set_battery(5, 10).await.unwrap().unwrap();
        assert_eq!(status.status, VehicleStatus::NotWithdrawable);
        assert_eq!(broker.published_to("Parking/1/Mezzi/5").len(), 1);

        assert_eq!(gw.set_battery(77, 10).await, Err(DeviceError::NotFound(77)));
    }
}
