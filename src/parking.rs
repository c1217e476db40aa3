//! Parking activation and vehicle redistribution.
//!
//! Deactivating a parking moves every parked vehicle to the least-loaded
//! active parking with room left. Vehicles that fit nowhere stay put in
//! `Maintenance`. Vehicles out on a ride are left alone; they are returned
//! elsewhere because the parking no longer accepts dropoffs.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FleetError;
use crate::gateway::GatewayFleet;
use crate::messages::VehicleStatus;
use crate::models::Parking;
use crate::traits::FleetStore;

/// What a deactivation did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedistributionReport {
    /// `(matricola, destination parking)` for every moved vehicle.
    pub moved: Vec<(String, i64)>,
    /// Vehicles set to maintenance for lack of room.
    pub maintenance: Vec<String>,
    /// Vehicles in use, left untouched.
    pub in_transit: Vec<String>,
    /// Whether the parking's gateway was stopped.
    pub gateway_stopped: bool,
}

/// Parking administration.
pub struct ParkingService {
    store: Arc<dyn FleetStore>,
    fleet: Option<Arc<GatewayFleet>>,
}

impl ParkingService {
    /// Service working on the store only.
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store, fleet: None }
    }

    /// Keep the gateway fleet aligned after each change.
    pub fn with_fleet(mut self, fleet: Arc<GatewayFleet>) -> Self {
        self.fleet = Some(fleet);
        self
    }

    /// Deactivate a parking and redistribute its vehicles.
    pub async fn deactivate(&self, parking_id: i64) -> Result<RedistributionReport, FleetError> {
        let mut report = RedistributionReport::default();

        let mut tx = self.store.begin().await?;
        tx.lock_parking(parking_id)
            .await?
            .ok_or(FleetError::ParkingNotFound(parking_id))?;
        tx.set_parking_active(parking_id, false).await?;

        let mut targets: Vec<(Parking, usize)> = Vec::new();
        for parking in tx.active_parkings().await? {
            if parking.id == parking_id {
                continue;
            }
            let load = tx.vehicles_in_parking(parking.id).await?.len();
            targets.push((parking, load));
        }

        for mut vehicle in tx.vehicles_in_parking(parking_id).await? {
            if vehicle.status == VehicleStatus::InUse {
                report.in_transit.push(vehicle.matricola);
                continue;
            }
            match least_loaded(&mut targets) {
                Some(target) => {
                    target.1 += 1;
                    vehicle.parking_id = target.0.id;
                    report.moved.push((vehicle.matricola.clone(), target.0.id));
                }
                None => {
                    vehicle.status = VehicleStatus::Maintenance;
                    report.maintenance.push(vehicle.matricola.clone());
                }
            }
            tx.update_vehicle(&vehicle).await?;
        }
        tx.commit().await?;
        info!(
            parking_id,
            moved = report.moved.len(),
            maintenance = report.maintenance.len(),
            in_transit = report.in_transit.len(),
            "parking deactivated"
        );

        let Some(fleet) = &self.fleet else {
            return Ok(report);
        };
        let touched = report
            .moved
            .iter()
            .map(|(matricola, _)| matricola)
            .chain(report.maintenance.iter());
        for matricola in touched {
            if let Err(e) = fleet.resync_one(matricola).await {
                warn!(%matricola, error = %e, "failed to resync redistributed vehicle");
            }
        }
        if report.in_transit.is_empty() {
            report.gateway_stopped = fleet.stop_gateway(parking_id).await?;
        } else {
            debug!(parking_id, "gateway kept until rides in transit end");
        }
        Ok(report)
    }

    /// Activate a parking and start its gateway.
    pub async fn activate(&self, parking_id: i64) -> Result<(), FleetError> {
        let mut tx = self.store.begin().await?;
        tx.lock_parking(parking_id)
            .await?
            .ok_or(FleetError::ParkingNotFound(parking_id))?;
        tx.set_parking_active(parking_id, true).await?;
        tx.commit().await?;
        info!(parking_id, "parking activated");

        if let Some(fleet) = &self.fleet {
            if fleet.gateway(parking_id).await.is_none() {
                fleet.start_gateway(parking_id).await?;
            }
        }
        Ok(())
    }
}

/// Active parking with room and the lowest load; ties go to the lowest id.
fn least_loaded(targets: &mut [(Parking, usize)]) -> Option<&mut (Parking, usize)> {
    targets
        .iter_mut()
        .filter(|(parking, load)| *load < parking.capacity as usize)
        .min_by_key(|(parking, load)| (*load, parking.id))
}
