//! One gateway per active parking, kept in line with the store.
//!
//! The store is authoritative. [`GatewayFleet::reconcile`] runs on a fixed
//! interval and repairs drift between emulated rosters and stored rosters;
//! [`GatewayFleet::resync_one`] repairs a single vehicle right after the ride
//! engine or the parking service moved it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::messages::VehicleStatus;
use crate::retry::RetryPolicy;
use crate::traits::{Clock, FleetStore, RosterSync, Transport};

use super::Gateway;

/// What one reconciliation pass changed.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Matricole added to a gateway.
    pub added: Vec<String>,
    /// Matricole removed from a gateway.
    pub removed: Vec<String>,
    /// Vehicles or parkings that could not be processed.
    pub failed: usize,
    /// In-use vehicles that no gateway held.
    pub violations: Vec<String>,
    /// Parkings whose gateway was started.
    pub gateways_started: Vec<i64>,
    /// Parkings whose gateway was stopped.
    pub gateways_stopped: Vec<i64>,
}

impl ReconcileReport {
    /// Whether the pass found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.failed == 0
            && self.violations.is_empty()
            && self.gateways_started.is_empty()
            && self.gateways_stopped.is_empty()
    }
}

/// Outcome of resyncing one vehicle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncReport {
    /// Vehicle serial.
    pub matricola: String,
    /// Parkings whose gateway dropped the vehicle.
    pub removed_from: Vec<i64>,
    /// Parking whose gateway now holds it, if that parking has a gateway.
    pub hosted_by: Option<i64>,
}

/// Manager of every running gateway.
pub struct GatewayFleet {
    store: Arc<dyn FleetStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: FleetConfig,
    retry: RetryPolicy,
    gateways: RwLock<BTreeMap<i64, Arc<Gateway>>>,
}

impl GatewayFleet {
    /// Create a fleet with no gateways.
    pub fn new(
        store: Arc<dyn FleetStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: FleetConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            config,
            retry,
            gateways: RwLock::new(BTreeMap::new()),
        }
    }

    /// Gateway of a parking.
    pub async fn gateway(&self, parking_id: i64) -> Option<Arc<Gateway>> {
        self.gateways.read().await.get(&parking_id).cloned()
    }

    /// Every gateway, ordered by parking id.
    pub async fn gateways(&self) -> Vec<Arc<Gateway>> {
        self.gateways.read().await.values().cloned().collect()
    }

    /// Parkings that currently have a gateway.
    pub async fn parking_ids(&self) -> Vec<i64> {
        self.gateways.read().await.keys().copied().collect()
    }

    /// Parkings whose gateway holds `vehicle_id`.
    pub async fn hosts_of(&self, vehicle_id: i64) -> Vec<i64> {
        let mut hosts = Vec::new();
        for gateway in self.gateways().await {
            if gateway.contains(vehicle_id).await {
                hosts.push(gateway.parking_id());
            }
        }
        hosts
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a gateway for every active parking.
    ///
    /// A parking that fails to start is logged and skipped. Returns the
    /// number of running gateways.
    pub async fn start_all(&self) -> Result<usize, FleetError> {
        let parkings = self.store.find_active_parkings().await?;
        for parking in parkings {
            if let Err(e) = self.start_gateway(parking.id).await {
                error!(parking_id = parking.id, error = %e, "failed to start gateway");
            }
        }
        let running = self.gateways.read().await.len();
        info!(gateways = running, "gateway fleet started");
        Ok(running)
    }

    /// Start the gateway of one parking, loading its roster from the store.
    ///
    /// Returns the existing gateway if one is already running.
    pub async fn start_gateway(&self, parking_id: i64) -> Result<Arc<Gateway>, FleetError> {
        if let Some(gateway) = self.gateway(parking_id).await {
            return Ok(gateway);
        }
        self.store
            .find_parking(parking_id)
            .await?
            .ok_or(FleetError::ParkingNotFound(parking_id))?;

        let gateway = Gateway::new(
            parking_id,
            Arc::clone(&self.transport),
            Arc::clone(&self.clock),
            self.retry,
            self.config.dedupe_capacity,
        );
        let vehicles = self.store.find_vehicles_by_parking(parking_id).await?;
        for vehicle in &vehicles {
            gateway.add_device(vehicle).await;
        }
        gateway.start().await?;

        let mut gateways = self.gateways.write().await;
        // Lost a race with a concurrent start: keep the first one.
        if let Some(existing) = gateways.get(&parking_id) {
            let existing = Arc::clone(existing);
            drop(gateways);
            gateway.stop().await?;
            return Ok(existing);
        }
        gateways.insert(parking_id, Arc::clone(&gateway));
        info!(parking_id, vehicles = vehicles.len(), "gateway loaded");
        Ok(gateway)
    }

    /// Stop and drop the gateway of one parking. Returns `false` if none ran.
    pub async fn stop_gateway(&self, parking_id: i64) -> Result<bool, FleetError> {
        let removed = self.gateways.write().await.remove(&parking_id);
        match removed {
            Some(gateway) => {
                gateway.stop().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop every gateway.
    pub async fn stop_all(&self) {
        let gateways: Vec<Arc<Gateway>> = {
            let mut map = self.gateways.write().await;
            std::mem::take(&mut *map).into_values().collect()
        };
        for gateway in gateways {
            if let Err(e) = gateway.stop().await {
                warn!(parking_id = gateway.parking_id(), error = %e, "failed to stop gateway");
            }
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Align every gateway roster with the store.
    ///
    /// - gateways are started for active parkings that have none
    /// - store-only vehicles are added to their parking's gateway
    /// - emulator-only vehicles are removed unless in use in the store
    /// - gateways of inactive parkings stop once they hold no in-use vehicle
    ///
    /// Per-item failures are counted and logged; only the initial parking
    /// query can fail the whole pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport, FleetError> {
        let mut report = ReconcileReport::default();
        let active: BTreeSet<i64> = self
            .store
            .find_active_parkings()
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        for &parking_id in &active {
            if self.gateway(parking_id).await.is_some() {
                continue;
            }
            match self.start_gateway(parking_id).await {
                Ok(_) => report.gateways_started.push(parking_id),
                Err(e) => {
                    warn!(parking_id, error = %e, "failed to start gateway");
                    report.failed += 1;
                }
            }
        }

        for gateway in self.gateways().await {
            self.reconcile_gateway(&gateway, &mut report).await;
        }

        for gateway in self.gateways().await {
            let parking_id = gateway.parking_id();
            if active.contains(&parking_id) {
                continue;
            }
            let riding = gateway
                .list_devices()
                .await
                .iter()
                .any(|d| d.status == VehicleStatus::InUse);
            if riding {
                debug!(parking_id, "inactive parking still has vehicles in use");
                continue;
            }
            match self.stop_gateway(parking_id).await {
                Ok(_) => report.gateways_stopped.push(parking_id),
                Err(e) => {
                    warn!(parking_id, error = %e, "failed to stop gateway");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn reconcile_gateway(&self, gateway: &Gateway, report: &mut ReconcileReport) {
        let parking_id = gateway.parking_id();
        let records = match self.store.find_vehicles_by_parking(parking_id).await {
            Ok(records) => records,
            Err(e) => {
                warn!(parking_id, error = %e, "failed to load roster");
                report.failed += 1;
                return;
            }
        };

        let stored: HashSet<i64> = records.iter().map(|r| r.id).collect();
        for record in &records {
            if gateway.contains(record.id).await {
                continue;
            }
            if record.status == VehicleStatus::InUse {
                // The gateway holding it still owes the end-of-ride lock.
                if !self.hosts_of(record.id).await.is_empty() {
                    continue;
                }
                warn!(
                    parking_id,
                    vehicle_id = record.id,
                    matricola = %record.matricola,
                    "in-use vehicle missing from every gateway"
                );
                report.violations.push(record.matricola.clone());
            }
            gateway.add_device(record).await;
            report.added.push(record.matricola.clone());
        }

        for device in gateway.list_devices().await {
            if stored.contains(&device.vehicle_id) {
                continue;
            }
            match self.store.find_vehicle_by_matricola(&device.matricola).await {
                Ok(Some(record)) if record.status == VehicleStatus::InUse => {
                    debug!(parking_id, vehicle_id = device.vehicle_id, "keeping in-use vehicle");
                }
                Ok(_) => {
                    if gateway.remove_device(device.vehicle_id).await {
                        report.removed.push(device.matricola.clone());
                    }
                }
                Err(e) => {
                    warn!(parking_id, vehicle_id = device.vehicle_id, error = %e, "failed to check vehicle");
                    report.failed += 1;
                }
            }
        }
    }

    /// Move one vehicle's emulator to the gateway of its stored parking.
    ///
    /// The vehicle is dropped from every other gateway and loaded (or
    /// reloaded) from its store record in the right one.
    pub async fn resync_one(&self, matricola: &str) -> Result<ResyncReport, FleetError> {
        let record = self
            .store
            .find_vehicle_by_matricola(matricola)
            .await?
            .ok_or_else(|| FleetError::VehicleNotFound(matricola.to_string()))?;

        let mut report = ResyncReport {
            matricola: matricola.to_string(),
            removed_from: Vec::new(),
            hosted_by: None,
        };
        for gateway in self.gateways().await {
            if gateway.parking_id() != record.parking_id && gateway.remove_device(record.id).await {
                report.removed_from.push(gateway.parking_id());
            }
        }
        match self.gateway(record.parking_id).await {
            Some(gateway) => {
                gateway.sync_device(&record).await;
                report.hosted_by = Some(record.parking_id);
            }
            None => debug!(
                parking_id = record.parking_id,
                %matricola,
                "no gateway for vehicle's parking"
            ),
        }
        debug!(%matricola, ?report, "vehicle resynced");
        Ok(report)
    }

    /// Reconcile every `reconcile_interval` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately; start_all already covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => match self.reconcile().await {
                    Ok(report) if report.is_empty() => debug!("rosters in sync"),
                    Ok(report) => info!(
                        added = report.added.len(),
                        removed = report.removed.len(),
                        failed = report.failed,
                        violations = report.violations.len(),
                        "roster reconciled"
                    ),
                    Err(e) => error!(error = %e, "reconciliation failed"),
                },
            }
        }
        info!("reconcile loop stopped");
    }
}

#[async_trait]
impl RosterSync for GatewayFleet {
    async fn resync_vehicle(&self, matricola: &str) {
        if let Err(e) = self.resync_one(matricola).await {
            warn!(%matricola, error = %e, "vehicle resync failed");
        }
    }
}
