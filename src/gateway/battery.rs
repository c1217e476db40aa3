//! Battery simulation for emulated electric vehicles.
//!
//! Every tick drains vehicles in use and recharges parked ones. Level changes
//! go through [`Gateway::set_battery`](super::Gateway::set_battery), so the
//! battery rule and status telemetry apply exactly as for any other change.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::messages::VehicleStatus;

use super::GatewayFleet;

/// Periodic battery drain/charge over every gateway.
pub struct BatterySimulator {
    fleet: Arc<GatewayFleet>,
    interval: Duration,
    drain: u8,
    charge: u8,
}

impl BatterySimulator {
    /// Simulator with the rates and period of `config`.
    pub fn new(fleet: Arc<GatewayFleet>, config: &FleetConfig) -> Self {
        Self {
            fleet,
            interval: config.battery_tick(),
            drain: config.battery_drain_per_tick,
            charge: config.battery_charge_per_tick,
        }
    }

    /// Apply one step to every electric device. Returns how many changed.
    pub async fn tick(&self) -> usize {
        let mut changed = 0;
        for gateway in self.fleet.gateways().await {
            for device in gateway.list_devices().await {
                let Some(level) = device.battery else {
                    continue;
                };
                let level = i32::from(level);
                let next = match device.status {
                    VehicleStatus::InUse => level - i32::from(self.drain),
                    _ if level < 100 => level + i32::from(self.charge),
                    _ => continue,
                };
                match gateway.set_battery(device.vehicle_id, next).await {
                    Ok(Some(_)) => changed += 1,
                    Ok(None) => {}
                    // Removed by a concurrent roster change
                    Err(e) => debug!(vehicle_id = device.vehicle_id, error = %e, "skipping battery update"),
                }
            }
        }
        changed
    }

    /// Tick every interval until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if self.interval.is_zero() {
            warn!("battery simulation disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let changed = self.tick().await;
                    debug!(changed, "battery tick");
                }
            }
        }
        info!("battery simulation stopped");
    }
}
