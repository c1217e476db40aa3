//! Wire envelopes exchanged between the backend and parking gateways.
//!
//! All three message kinds are flat JSON objects with camelCase field names.
//! Unknown fields are ignored on decode so either side can add fields without
//! breaking the other.
//!
//! | Envelope | Direction | Topic kind |
//! |----------|-----------|------------|
//! | [`Command`] | backend → gateway | `Comandi` |
//! | [`CommandResponse`] | gateway → backend | `RisposteComandi` |
//! | [`StatusMessage`] | gateway → backend | `Mezzi` |
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use ride_fleet::messages::{Command, CommandType};
//!
//! let cmd = Command::new(12, CommandType::Unlock, "backend", Utc::now());
//! let bytes = ride_fleet::messages::encode(&cmd).unwrap();
//! let decoded: Command = ride_fleet::messages::decode(&bytes).unwrap();
//! assert_eq!(decoded.command_id, cmd.command_id);
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Battery level below which electric vehicles cannot be rented.
pub const LOW_BATTERY_THRESHOLD: u8 = 20;

// ============================================================================
// Shared enums
// ============================================================================

/// Vehicle class, which drives both tariff and battery behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VehicleClass {
    /// Pedal bike without a battery.
    MuscularBike,
    /// Pedal-assisted electric bike.
    EBike,
    /// Electric kick scooter.
    EScooter,
}

impl VehicleClass {
    /// Whether the vehicle carries a traction battery.
    pub fn is_battery_powered(self) -> bool {
        !matches!(self, VehicleClass::MuscularBike)
    }
}

/// Operational status of a vehicle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VehicleStatus {
    /// Parked and rentable.
    Available,
    /// Currently in a ride.
    InUse,
    /// Parked but not rentable (low battery, reported problem).
    NotWithdrawable,
    /// Withdrawn for maintenance.
    Maintenance,
}

impl VehicleStatus {
    /// Lowercase name used in logs and notifications.
    pub fn as_str(self) -> &'static str {
        match self {
            VehicleStatus::Available => "available",
            VehicleStatus::InUse => "inUse",
            VehicleStatus::NotWithdrawable => "notWithdrawable",
            VehicleStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Color of the per-vehicle status light ("spia").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndicatorColor {
    /// In use or low battery.
    Red,
    /// Available.
    Green,
    /// Operator-selected highlight.
    Blue,
    /// Maintenance.
    Yellow,
    /// Light switched off.
    Off,
}

impl FromStr for IndicatorColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "red" | "rosso" => Ok(IndicatorColor::Red),
            "green" | "verde" => Ok(IndicatorColor::Green),
            "blue" | "blu" => Ok(IndicatorColor::Blue),
            "yellow" | "giallo" => Ok(IndicatorColor::Yellow),
            "off" | "spento" => Ok(IndicatorColor::Off),
            other => Err(format!("unknown color '{}'", other)),
        }
    }
}

/// Kind of command a gateway can execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandType {
    /// Release the lock at the start of a ride.
    Unlock,
    /// Engage the lock at the end of a ride.
    Lock,
    /// Force the indicator to `parameters.color`.
    SetIndicatorColor,
    /// Report the current battery level in the response.
    RequestBattery,
    /// Emit a fresh status telemetry message.
    RequestStatus,
    /// Restore the status implied by the battery level.
    Reset,
}

// ============================================================================
// Envelopes
// ============================================================================

/// A command addressed to a single vehicle.
///
/// `command_id` is the idempotency key: gateways execute a given id at most
/// once and answer replays with the cached response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Unique command id, echoed in the response.
    pub command_id: Uuid,
    /// Target vehicle.
    pub vehicle_id: i64,
    /// What to do.
    pub command_type: CommandType,
    /// Command-specific parameters (e.g. `{"color": "blue"}`).
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// When the backend issued the command.
    pub issued_at: DateTime<Utc>,
    /// Identifier of the issuing component.
    pub sender_id: String,
}

impl Command {
    /// Create a command with a fresh id and no parameters.
    pub fn new(
        vehicle_id: i64,
        command_type: CommandType,
        sender_id: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            vehicle_id,
            command_type,
            parameters: Map::new(),
            issued_at,
            sender_id: sender_id.into(),
        }
    }

    /// Add a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// String parameter lookup.
    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// A gateway's answer to exactly one [`Command`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    /// Id of the command being answered.
    pub command_id: Uuid,
    /// Vehicle the command addressed.
    pub vehicle_id: i64,
    /// Type of the command being answered.
    pub original_command_type: CommandType,
    /// Whether the command took effect.
    pub success: bool,
    /// Human-readable reason when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    /// Command-specific result data (e.g. battery level).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<Value>,
}

impl CommandResponse {
    /// Successful response.
    pub fn ok(cmd: &Command, extra_data: Option<Value>) -> Self {
        Self {
            command_id: cmd.command_id,
            vehicle_id: cmd.vehicle_id,
            original_command_type: cmd.command_type,
            success: true,
            error_description: None,
            extra_data,
        }
    }

    /// Failed response carrying a reason.
    pub fn failed(cmd: &Command, reason: impl Into<String>) -> Self {
        Self {
            command_id: cmd.command_id,
            vehicle_id: cmd.vehicle_id,
            original_command_type: cmd.command_type,
            success: false,
            error_description: Some(reason.into()),
            extra_data: None,
        }
    }
}

/// Fire-and-forget telemetry describing one vehicle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    /// Vehicle id.
    pub vehicle_id: i64,
    /// Vehicle serial.
    pub matricola: String,
    /// Battery percentage, absent for non-electric vehicles.
    #[serde(default)]
    pub battery_level: Option<u8>,
    /// Current status.
    pub status: VehicleStatus,
    /// Vehicle class.
    pub vehicle_class: VehicleClass,
    /// When the gateway produced the message.
    pub timestamp: DateTime<Utc>,
    /// Free-form context (what caused the message).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

// ============================================================================
// Codec
// ============================================================================

/// Encode an envelope as a JSON payload.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a JSON payload into an envelope, ignoring unknown fields.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}
