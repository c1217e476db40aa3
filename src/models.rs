//! Records owned by the system of record.
//!
//! The store is an external collaborator; these structs are the shapes it
//! exchanges through [`FleetStore`](crate::traits::FleetStore). Money is
//! `Decimal` euros, timestamps are UTC.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::messages::{VehicleClass, VehicleStatus, LOW_BATTERY_THRESHOLD};

/// A rentable vehicle as stored by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    /// Vehicle id, used in topics.
    pub id: i64,
    /// Unique serial, the natural key across subsystems.
    pub matricola: String,
    /// Vehicle class.
    pub class: VehicleClass,
    /// Operational status.
    pub status: VehicleStatus,
    /// Battery percentage; `None` for non-electric vehicles.
    pub battery: Option<u8>,
    /// Parking the vehicle belongs to.
    pub parking_id: i64,
}

impl VehicleRecord {
    /// Whether this is a battery-powered vehicle below the rental threshold.
    pub fn is_low_battery(&self) -> bool {
        self.class.is_battery_powered()
            && self.battery.is_some_and(|level| level < LOW_BATTERY_THRESHOLD)
    }
}

/// A parking station.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parking {
    /// Parking id, used in topics.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Maximum number of vehicles the station holds.
    pub capacity: u32,
    /// Inactive parkings have no gateway and accept no returns.
    pub active: bool,
}

/// A rental. Open while `end_time` is `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ride {
    /// Ride id.
    pub id: i64,
    /// Renting user.
    pub user_id: i64,
    /// Rented vehicle.
    pub vehicle_matricola: String,
    /// Where the ride started.
    pub pickup_parking_id: i64,
    /// When the ride started.
    pub start_time: DateTime<Utc>,
    /// Where the vehicle was returned (absent for forced terminations).
    pub dropoff_parking_id: Option<i64>,
    /// When the ride ended.
    pub end_time: Option<DateTime<Utc>>,
    /// Amount charged.
    pub final_cost: Option<Decimal>,
    /// Whether the user reported a problem with the vehicle.
    pub problem_reported: bool,
}

impl Ride {
    /// Whether the ride has not been terminated yet.
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Fields of a ride row to insert.
#[derive(Clone, Debug, PartialEq)]
pub struct NewRide {
    /// Renting user.
    pub user_id: i64,
    /// Rented vehicle.
    pub vehicle_matricola: String,
    /// Where the ride starts.
    pub pickup_parking_id: i64,
    /// When the ride starts.
    pub start_time: DateTime<Utc>,
}

/// Billing state of a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    /// User id.
    pub user_id: i64,
    /// Prepaid balance; negative after an overrun.
    pub balance: Decimal,
    /// Suspended accounts cannot start rides.
    pub suspended: bool,
    /// Shortfall left by forced terminations.
    pub debt: Decimal,
}

/// Why money moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaymentKind {
    /// Charge for a ride stopped by the user.
    RideCharge,
    /// Remaining balance taken by a forced termination.
    ForcedSettlement,
    /// Credit added by the user.
    TopUp,
}

/// A ledger row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    /// Ledger id.
    pub id: i64,
    /// Account the payment belongs to.
    pub user_id: i64,
    /// Ride that caused it, if any.
    pub ride_id: Option<i64>,
    /// Amount moved (always non-negative; direction follows `kind`).
    pub amount: Decimal,
    /// Payment kind.
    pub kind: PaymentKind,
    /// When it was recorded.
    pub created_at: DateTime<Utc>,
}

/// Fields of a ledger row to insert.
#[derive(Clone, Debug, PartialEq)]
pub struct NewPayment {
    /// Account.
    pub user_id: i64,
    /// Ride, if any.
    pub ride_id: Option<i64>,
    /// Amount moved.
    pub amount: Decimal,
    /// Payment kind.
    pub kind: PaymentKind,
    /// When it happened.
    pub created_at: DateTime<Utc>,
}
