//! Hook from billing to the device plane.

use async_trait::async_trait;

/// Re-aligns the emulated device view of one vehicle with the store.
///
/// Implemented by [`GatewayFleet`](crate::gateway::GatewayFleet). The ride
/// engine calls it after a ride closes so the vehicle's emulator follows it
/// to the dropoff parking.
#[async_trait]
pub trait RosterSync: Send + Sync {
    /// Resync one vehicle. Failures are logged by the implementation.
    async fn resync_vehicle(&self, matricola: &str);
}
