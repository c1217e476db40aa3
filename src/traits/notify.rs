//! Notification boundary.
//!
//! The push fan-out is external. The control plane produces named events
//! with free-form key/value context to either one user's channel or the
//! admin broadcast channel.

use std::fmt;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::messages::VehicleStatus;
use crate::models::PaymentKind;

/// Where an event goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    /// A single user's private channel.
    User(i64),
    /// Broadcast to every operator.
    Admin,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::User(id) => write!(f, "user:{}", id),
            Channel::Admin => f.write_str("admin"),
        }
    }
}

/// A named event with enough context to render a message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NotificationEvent {
    /// Event name (`balance_changed`, `battery_low`, ...).
    pub name: &'static str,
    /// Context fields.
    pub data: Map<String, Value>,
}

impl NotificationEvent {
    /// Event with no fields.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            data: Map::new(),
        }
    }

    /// Add a context field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Field lookup, mostly for tests and log rendering.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Balance moved by `delta` (negative for charges).
    pub fn balance_changed(user_id: i64, balance: Decimal, delta: Decimal) -> Self {
        Self::new("balance_changed")
            .with("userId", user_id)
            .with("balance", balance.to_string())
            .with("amount", delta.to_string())
    }

    /// A ledger row was recorded.
    pub fn transaction_recorded(
        user_id: i64,
        ride_id: Option<i64>,
        amount: Decimal,
        kind: PaymentKind,
    ) -> Self {
        Self::new("transaction_recorded")
            .with("userId", user_id)
            .with("rideId", ride_id)
            .with("amount", amount.to_string())
            .with("kind", serde_json::to_value(kind).unwrap_or(Value::Null))
    }

    /// The account was suspended.
    pub fn account_suspended(user_id: i64, balance: Decimal, debt: Decimal) -> Self {
        Self::new("account_suspended")
            .with("userId", user_id)
            .with("balance", balance.to_string())
            .with("debt", debt.to_string())
    }

    /// The monitor closed a ride because the balance ran out.
    pub fn ride_force_terminated(
        user_id: i64,
        ride_id: i64,
        matricola: &str,
        charged: Decimal,
        debt_added: Decimal,
    ) -> Self {
        Self::new("ride_force_terminated")
            .with("userId", user_id)
            .with("rideId", ride_id)
            .with("vehicleId", matricola)
            .with("amount", charged.to_string())
            .with("debtAdded", debt_added.to_string())
    }

    /// A battery-powered vehicle dropped below the rental threshold.
    pub fn battery_low(
        vehicle_id: i64,
        matricola: &str,
        parking_id: i64,
        level: u8,
        status: VehicleStatus,
    ) -> Self {
        Self::new("battery_low")
            .with("vehicleId", vehicle_id)
            .with("matricola", matricola)
            .with("parkingId", parking_id)
            .with("batteryLevel", level)
            .with("newStatus", status.as_str())
    }

    /// The unlock command for a started ride could not be delivered.
    pub fn unlock_failed(ride_id: i64, matricola: &str, reason: &str) -> Self {
        Self::new("unlock_failed")
            .with("rideId", ride_id)
            .with("vehicleId", matricola)
            .with("reason", reason)
    }
}

/// Sink for notification events.
///
/// Delivery failures are the implementation's concern; the control plane
/// never fails an operation because a notification could not be sent.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Emit `event` on `channel`.
    async fn notify(&self, channel: Channel, event: NotificationEvent);
}
