//! # ride-fleet
//!
//! Control plane for a shared-vehicle fleet (muscular bikes, e-bikes,
//! e-scooters) parked at stations and driven over MQTT.
//!
//! ## Features
//!
//! - **Gateway emulation**: one gateway per active parking hosts an emulated
//!   device per vehicle, executes commands and publishes status telemetry
//! - **Roster reconciliation**: gateway rosters follow the store, including
//!   vehicles moving between parkings
//! - **Command dispatch**: backend commands with fresh ids, bounded retry and
//!   optional response correlation
//! - **Ride billing**: start/stop with optimistic pre-checks and row-locked
//!   transactions, per-class tariff, forced termination on exhausted balance
//! - **Parking administration**: deactivation with redistribution to the
//!   least-loaded parking
//!
//! ## Architecture
//!
//! - `messages`, `topics`, `router` - wire protocol
//! - `device`, `gateway` - device plane
//! - `dispatch`, `telemetry` - backend side of the protocol
//! - `rides`, `parking` - business logic over the store
//! - `traits` - collaborator boundaries (transport, store, notifier, clock)
//! - `backends` - in-memory and MQTT implementations
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ride_fleet::backends::memory::MemoryBroker;
//! use ride_fleet::gateway::Gateway;
//! use ride_fleet::messages::{CommandType, VehicleClass, VehicleStatus};
//! use ride_fleet::models::VehicleRecord;
//! use ride_fleet::traits::SystemClock;
//! use ride_fleet::{CommandDispatcher, RetryPolicy};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = Arc::new(MemoryBroker::new());
//! let gateway = Gateway::new(1, broker.clone(), Arc::new(SystemClock), RetryPolicy::once(), 64);
//! gateway.start().await.unwrap();
//! gateway
//!     .add_device(&VehicleRecord {
//!         id: 7,
//!         matricola: "EB-007".into(),
//!         class: VehicleClass::EBike,
//!         status: VehicleStatus::Available,
//!         battery: Some(80),
//!         parking_id: 1,
//!     })
//!     .await;
//!
//! let dispatcher = CommandDispatcher::new(broker.clone(), Arc::new(SystemClock), RetryPolicy::once());
//! dispatcher.unlock(1, 7).await.unwrap();
//!
//! assert_eq!(gateway.device(7).await.unwrap().status, VehicleStatus::InUse);
//! # }
//! ```

#![warn(missing_docs)]

/// In-memory and MQTT implementations of the collaborator traits.
pub mod backends;
/// Environment-driven configuration.
pub mod config;
/// Emulated vehicle state machine.
pub mod device;
/// Backend command publishing and response correlation.
pub mod dispatch;
/// Error types.
pub mod error;
/// Per-parking gateways and the fleet manager.
pub mod gateway;
/// Wire payloads.
pub mod messages;
/// Store records.
pub mod models;
/// Parking activation and redistribution.
pub mod parking;
/// Bounded publish retry.
pub mod retry;
/// Ride lifecycle and billing.
pub mod rides;
/// Typed dispatch of inbound messages.
pub mod router;
/// Backend telemetry consumer.
pub mod telemetry;
/// Topic construction and parsing.
pub mod topics;
/// Collaborator traits.
pub mod traits;

pub use config::{
    Config, ConfigError, FleetConfig, MonitorConfig, MqttConfig, RetryConfig, TariffConfig,
};
pub use device::{DeviceEmulator, DeviceOutcome, DeviceSnapshot};
pub use dispatch::{CommandDispatcher, ResponseTracker};
pub use error::{
    DeviceError, DispatchError, FleetError, ProtocolError, RideError, StoreError, TransportError,
};
pub use gateway::{Gateway, GatewayFleet};
pub use messages::{
    Command, CommandResponse, CommandType, IndicatorColor, StatusMessage, VehicleClass,
    VehicleStatus,
};
pub use parking::{ParkingService, RedistributionReport};
pub use retry::RetryPolicy;
pub use rides::{RideEngine, RideMonitor, Tariff};
pub use router::MessageRouter;
pub use telemetry::TelemetryListener;
pub use topics::TopicKind;
