//! Per-vehicle device emulator.
//!
//! A [`DeviceEmulator`] stands in for the lock and status light of one
//! vehicle. It is a plain state machine: [`DeviceEmulator::execute`] applies a
//! [`Command`] and returns the response plus the status telemetry to publish,
//! and [`DeviceEmulator::set_battery`] applies the battery rule.
//!
//! # States
//!
//! | Status | Indicator |
//! |--------|-----------|
//! | `Available` | green |
//! | `InUse` | red |
//! | `NotWithdrawable` | red when caused by a low battery, off otherwise |
//! | `Maintenance` | yellow |
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use ride_fleet::device::DeviceEmulator;
//! use ride_fleet::messages::{Command, CommandType, VehicleClass, VehicleStatus};
//!
//! let mut device = DeviceEmulator::new(7, "EB-007", VehicleClass::EBike, 1, VehicleStatus::Available, Some(80));
//!
//! let unlock = Command::new(7, CommandType::Unlock, "backend", Utc::now());
//! let outcome = device.execute(&unlock, Utc::now());
//! assert!(outcome.response.success);
//! assert_eq!(device.status(), VehicleStatus::InUse);
//!
//! // A second unlock fails and leaves the device alone
//! let again = Command::new(7, CommandType::Unlock, "backend", Utc::now());
//! assert!(!device.execute(&again, Utc::now()).response.success);
//! assert_eq!(device.status(), VehicleStatus::InUse);
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::error::DeviceError;
use crate::messages::{
    Command, CommandResponse, CommandType, IndicatorColor, StatusMessage, VehicleClass,
    VehicleStatus, LOW_BATTERY_THRESHOLD,
};
use crate::models::VehicleRecord;

/// Result of executing one command.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceOutcome {
    /// Response to publish on `RisposteComandi`.
    pub response: CommandResponse,
    /// Status telemetry to publish on `Mezzi`, when the command produced one.
    pub status: Option<StatusMessage>,
}

/// Point-in-time view of an emulator, for listings.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    /// Vehicle id.
    pub vehicle_id: i64,
    /// Vehicle serial.
    pub matricola: String,
    /// Vehicle class.
    pub class: VehicleClass,
    /// Current status.
    pub status: VehicleStatus,
    /// Current indicator color.
    pub indicator: IndicatorColor,
    /// Battery level, `None` for non-electric vehicles.
    pub battery: Option<u8>,
}

/// Emulated lock, status light and battery of one vehicle.
#[derive(Clone, Debug)]
pub struct DeviceEmulator {
    vehicle_id: i64,
    matricola: String,
    class: VehicleClass,
    parking_id: i64,
    status: VehicleStatus,
    indicator: IndicatorColor,
    battery: Option<u8>,
    // NotWithdrawable was entered because of the battery, not a reported problem
    battery_lock: bool,
}

impl DeviceEmulator {
    /// Create an emulator in the given state.
    ///
    /// Electric vehicles without a stored level start full.
    pub fn new(
        vehicle_id: i64,
        matricola: impl Into<String>,
        class: VehicleClass,
        parking_id: i64,
        status: VehicleStatus,
        battery: Option<u8>,
    ) -> Self {
        let battery = class
            .is_battery_powered()
            .then(|| battery.unwrap_or(100).min(100));
        let low = battery.is_some_and(|level| level < LOW_BATTERY_THRESHOLD);
        let mut device = Self {
            vehicle_id,
            matricola: matricola.into(),
            class,
            parking_id,
            status,
            indicator: IndicatorColor::Off,
            battery,
            battery_lock: status == VehicleStatus::NotWithdrawable && low,
        };
        device.indicator = device.indicator_for_status();
        device
    }

    /// Create an emulator mirroring a store record.
    pub fn from_record(record: &VehicleRecord) -> Self {
        Self::new(
            record.id,
            record.matricola.clone(),
            record.class,
            record.parking_id,
            record.status,
            record.battery,
        )
    }

    /// Vehicle id.
    pub fn vehicle_id(&self) -> i64 {
        self.vehicle_id
    }

    /// Vehicle serial.
    pub fn matricola(&self) -> &str {
        &self.matricola
    }

    /// Vehicle class.
    pub fn class(&self) -> VehicleClass {
        self.class
    }

    /// Parking the emulator was loaded for.
    pub fn parking_id(&self) -> i64 {
        self.parking_id
    }

    /// Current status.
    pub fn status(&self) -> VehicleStatus {
        self.status
    }

    /// Current indicator color.
    pub fn indicator(&self) -> IndicatorColor {
        self.indicator
    }

    /// Current battery level.
    pub fn battery(&self) -> Option<u8> {
        self.battery
    }

    /// Snapshot for listings.
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            vehicle_id: self.vehicle_id,
            matricola: self.matricola.clone(),
            class: self.class,
            status: self.status,
            indicator: self.indicator,
            battery: self.battery,
        }
    }

    /// Overwrite state from a store record (roster reload).
    ///
    /// The store is authoritative for status and battery; the vehicle id and
    /// serial never change.
    pub fn sync_from(&mut self, record: &VehicleRecord) {
        *self = Self::from_record(record);
    }

    /// Status telemetry describing the current state.
    pub fn status_message(&self, now: DateTime<Utc>, note: Option<&str>) -> StatusMessage {
        StatusMessage {
            vehicle_id: self.vehicle_id,
            matricola: self.matricola.clone(),
            battery_level: self.battery,
            status: self.status,
            vehicle_class: self.class,
            timestamp: now,
            note: note.map(str::to_string),
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Apply a command.
    ///
    /// Always produces exactly one response carrying the command's id. Refused
    /// commands leave the state untouched.
    pub fn execute(&mut self, cmd: &Command, now: DateTime<Utc>) -> DeviceOutcome {
        match self.apply(cmd, now) {
            Ok((extra, status)) => DeviceOutcome {
                response: CommandResponse::ok(cmd, extra),
                status,
            },
            Err(e) => DeviceOutcome {
                response: CommandResponse::failed(cmd, e.to_string()),
                status: None,
            },
        }
    }

    fn apply(
        &mut self,
        cmd: &Command,
        now: DateTime<Utc>,
    ) -> Result<(Option<serde_json::Value>, Option<StatusMessage>), DeviceError> {
        match cmd.command_type {
            CommandType::Unlock => {
                if self.status != VehicleStatus::Available {
                    return Err(DeviceError::InvalidTransition(format!(
                        "cannot unlock vehicle {} in state {}",
                        self.vehicle_id, self.status
                    )));
                }
                self.transition(VehicleStatus::InUse, false);
                Ok((None, Some(self.status_message(now, Some("unlocked")))))
            }

            CommandType::Lock => {
                if self.status != VehicleStatus::InUse {
                    return Err(DeviceError::InvalidTransition(format!(
                        "cannot lock vehicle {} in state {}",
                        self.vehicle_id, self.status
                    )));
                }
                self.settle_parked();
                Ok((None, Some(self.status_message(now, Some("locked")))))
            }

            CommandType::SetIndicatorColor => {
                let raw = cmd
                    .parameter_str("color")
                    .ok_or_else(|| DeviceError::InvalidParameter("missing color".to_string()))?;
                self.indicator = raw
                    .parse::<IndicatorColor>()
                    .map_err(DeviceError::InvalidParameter)?;
                Ok((None, None))
            }

            CommandType::RequestBattery => {
                Ok((Some(json!({ "batteryLevel": self.battery })), None))
            }

            CommandType::RequestStatus => {
                Ok((None, Some(self.status_message(now, Some("requested")))))
            }

            CommandType::Reset => {
                if self.status == VehicleStatus::InUse {
                    return Err(DeviceError::InvalidTransition(format!(
                        "cannot reset vehicle {} while in use",
                        self.vehicle_id
                    )));
                }
                self.settle_parked();
                Ok((None, Some(self.status_message(now, Some("reset")))))
            }
        }
    }

    // ========================================================================
    // Battery
    // ========================================================================

    /// Apply a new battery level.
    ///
    /// The level is clamped to 0..=100; non-electric vehicles ignore it.
    /// Returns the telemetry to publish when the level or the status changed.
    pub fn set_battery(&mut self, level: i32, now: DateTime<Utc>) -> Option<StatusMessage> {
        if !self.class.is_battery_powered() {
            return None;
        }
        let level = level.clamp(0, 100) as u8;
        let before = (self.battery, self.status);
        self.battery = Some(level);

        match self.status {
            VehicleStatus::Available | VehicleStatus::Maintenance
                if level < LOW_BATTERY_THRESHOLD =>
            {
                self.transition(VehicleStatus::NotWithdrawable, true);
            }
            VehicleStatus::NotWithdrawable if self.battery_lock && level >= LOW_BATTERY_THRESHOLD => {
                self.transition(VehicleStatus::Available, false);
            }
            VehicleStatus::NotWithdrawable => {
                // Problem lock: status stays, indicator follows the level.
                self.indicator = self.indicator_for_status();
            }
            _ => {}
        }

        if (self.battery, self.status) == before {
            return None;
        }
        Some(self.status_message(now, Some("battery")))
    }

    fn is_low(&self) -> bool {
        self.battery.is_some_and(|level| level < LOW_BATTERY_THRESHOLD)
    }

    /// Parked status implied by the battery rule.
    fn settle_parked(&mut self) {
        if self.is_low() {
            self.transition(VehicleStatus::NotWithdrawable, true);
        } else {
            self.transition(VehicleStatus::Available, false);
        }
    }

    fn transition(&mut self, status: VehicleStatus, battery_lock: bool) {
        self.status = status;
        self.battery_lock = battery_lock;
        self.indicator = self.indicator_for_status();
    }

    fn indicator_for_status(&self) -> IndicatorColor {
        match self.status {
            VehicleStatus::Available => IndicatorColor::Green,
            VehicleStatus::InUse => IndicatorColor::Red,
            VehicleStatus::Maintenance => IndicatorColor::Yellow,
            VehicleStatus::NotWithdrawable if self.battery_lock || self.is_low() => {
                IndicatorColor::Red
            }
            VehicleStatus::NotWithdrawable => IndicatorColor::Off,
        }
    }
}
