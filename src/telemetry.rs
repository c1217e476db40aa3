//! Backend consumer of vehicle status telemetry.
//!
//! Mirrors reported battery levels into the store and raises a `battery_low`
//! admin broadcast when an electric vehicle drops below the rental
//! threshold. Battery-driven status changes reported by the device
//! (`Available` <-> `NotWithdrawable`) are written back too, so the store
//! keeps deciding rentability from the same state the vehicle shows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{StoreResult, TransportError};
use crate::messages::{StatusMessage, VehicleStatus, LOW_BATTERY_THRESHOLD};
use crate::models::VehicleRecord;
use crate::router::{MessageRouter, StatusHandler};
use crate::topics::{self, TopicKind};
use crate::traits::{Channel, FleetStore, NotificationEvent, Notifier, Transport};

/// Status handler for `Parking/+/Mezzi/+`.
pub struct TelemetryListener {
    store: Arc<dyn FleetStore>,
    notifier: Arc<dyn Notifier>,
    last_levels: Mutex<HashMap<i64, u8>>,
}

impl TelemetryListener {
    /// Listener writing to `store` and alerting through `notifier`.
    pub fn new(store: Arc<dyn FleetStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            last_levels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to status telemetry of every parking.
    pub async fn subscribe(self: &Arc<Self>, transport: &dyn Transport) -> Result<(), TransportError> {
        let router = MessageRouter::new().on_status(Arc::clone(self) as Arc<dyn StatusHandler>);
        transport
            .subscribe(&topics::filter(TopicKind::Status, None), Arc::new(router))
            .await
    }

    /// Write the level, plus the status when the report carries a
    /// battery-driven transition.
    async fn record_level(
        &self,
        parking_id: i64,
        status: &StatusMessage,
        level: u8,
    ) -> StoreResult<()> {
        let Some(stored) = self.store.find_vehicle_by_matricola(&status.matricola).await? else {
            debug!(parking_id, matricola = %status.matricola, "telemetry for unknown vehicle");
            return Ok(());
        };
        if battery_transition(&stored, parking_id, status.status, level).is_none() {
            return self.store.update_battery(&status.matricola, level).await;
        }

        // Re-check under the row lock; a ride may have started meanwhile
        let mut tx = self.store.begin().await?;
        let Some(mut vehicle) = tx.lock_vehicle(&status.matricola).await? else {
            return Ok(());
        };
        let next = battery_transition(&vehicle, parking_id, status.status, level);
        vehicle.battery = Some(level);
        if let Some(next) = next {
            vehicle.status = next;
        }
        tx.update_vehicle(&vehicle).await?;
        tx.commit().await?;

        if let Some(next) = next {
            info!(
                parking_id,
                vehicle_id = vehicle.id,
                matricola = %vehicle.matricola,
                level,
                status = %next,
                "battery status mirrored"
            );
        }
        Ok(())
    }

    /// Remember `level` and report whether it crossed below the threshold.
    fn crossed_low(&self, vehicle_id: i64, level: u8) -> bool {
        let previous = self
            .last_levels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(vehicle_id, level);
        level < LOW_BATTERY_THRESHOLD && previous.map_or(true, |p| p >= LOW_BATTERY_THRESHOLD)
    }
}

/// Store status implied by a device report, if it is a battery-driven change
/// the store should follow.
///
/// Only reports from the vehicle's own parking count. `InUse` rows belong to
/// the ride engine, and a `NotWithdrawable` row is released only when the
/// store itself attributes it to a low battery; a reported problem stays.
fn battery_transition(
    stored: &VehicleRecord,
    parking_id: i64,
    reported: VehicleStatus,
    level: u8,
) -> Option<VehicleStatus> {
    if stored.parking_id != parking_id || !stored.class.is_battery_powered() {
        return None;
    }
    match (stored.status, reported) {
        (VehicleStatus::NotWithdrawable, VehicleStatus::Available)
            if level >= LOW_BATTERY_THRESHOLD && stored.is_low_battery() =>
        {
            Some(VehicleStatus::Available)
        }
        (
            VehicleStatus::Available | VehicleStatus::Maintenance,
            VehicleStatus::NotWithdrawable,
        ) if level < LOW_BATTERY_THRESHOLD => Some(VehicleStatus::NotWithdrawable),
        _ => None,
    }
}

#[async_trait]
impl StatusHandler for TelemetryListener {
    async fn on_status(&self, parking_id: i64, vehicle_id: i64, status: StatusMessage) {
        debug!(parking_id, vehicle_id, status = %status.status, battery = ?status.battery_level, "status received");
        if !status.vehicle_class.is_battery_powered() {
            return;
        }
        let Some(level) = status.battery_level else {
            return;
        };

        if let Err(e) = self.record_level(parking_id, &status, level).await {
            warn!(parking_id, vehicle_id, matricola = %status.matricola, error = %e, "failed to store battery level");
        }

        if self.crossed_low(vehicle_id, level) {
            info!(parking_id, vehicle_id, level, "battery low");
            let event = NotificationEvent::battery_low(
                vehicle_id,
                &status.matricola,
                parking_id,
                level,
                status.status,
            );
            self.notifier.notify(Channel::Admin, event).await;
        }
    }
}
