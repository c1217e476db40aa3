//! Data-access boundary.
//!
//! Persistence is an external collaborator. The control plane reads through
//! [`FleetStore`] and mutates only inside a [`StoreTx`], the transaction handle
//! returned by [`FleetStore::begin`]. `lock_*` calls take row-level write locks
//! (`SELECT ... FOR UPDATE` on a SQL backend) that are held until the
//! transaction commits or is dropped. Dropping a transaction without calling
//! [`StoreTx::commit`] rolls it back.
//!
//! ```ignore
//! let mut tx = store.begin().await?;
//! let mut ride = tx.lock_ride(ride_id).await?.ok_or(RideError::RideNotFound(ride_id))?;
//! if !ride.is_open() {
//!     return Err(RideError::AlreadyTerminated(ride_id)); // tx dropped: rollback
//! }
//! ride.end_time = Some(now);
//! tx.update_ride(&ride).await?;
//! tx.commit().await?;
//! ```

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::StoreResult;
use crate::models::{
    NewPayment, NewRide, Parking, Payment, Ride, UserAccount, VehicleRecord,
};

/// Read access plus transaction entry point.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Vehicle by serial.
    async fn find_vehicle_by_matricola(&self, matricola: &str)
        -> StoreResult<Option<VehicleRecord>>;

    /// Every vehicle whose parking is `parking_id`, ordered by id.
    async fn find_vehicles_by_parking(&self, parking_id: i64) -> StoreResult<Vec<VehicleRecord>>;

    /// Every active parking, ordered by id.
    async fn find_active_parkings(&self) -> StoreResult<Vec<Parking>>;

    /// Parking by id, active or not.
    async fn find_parking(&self, parking_id: i64) -> StoreResult<Option<Parking>>;

    /// Every ride without an end time.
    async fn find_open_rides(&self) -> StoreResult<Vec<Ride>>;

    /// Ride by id.
    async fn find_ride(&self, ride_id: i64) -> StoreResult<Option<Ride>>;

    /// Account by user id.
    async fn find_account(&self, user_id: i64) -> StoreResult<Option<UserAccount>>;

    /// Mirror a telemetry battery reading. Single-row write outside any
    /// transaction.
    async fn update_battery(&self, matricola: &str, level: u8) -> StoreResult<()>;

    /// Open a transaction.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;
}

/// An open transaction.
#[async_trait]
pub trait StoreTx: Send {
    /// Lock and read a vehicle row.
    async fn lock_vehicle(&mut self, matricola: &str) -> StoreResult<Option<VehicleRecord>>;

    /// Lock and read a ride row.
    async fn lock_ride(&mut self, ride_id: i64) -> StoreResult<Option<Ride>>;

    /// Lock and read an account row.
    async fn lock_account(&mut self, user_id: i64) -> StoreResult<Option<UserAccount>>;

    /// Lock and read a parking row.
    async fn lock_parking(&mut self, parking_id: i64) -> StoreResult<Option<Parking>>;

    /// Vehicles of a parking as seen by this transaction.
    async fn vehicles_in_parking(&mut self, parking_id: i64) -> StoreResult<Vec<VehicleRecord>>;

    /// Active parkings as seen by this transaction.
    async fn active_parkings(&mut self) -> StoreResult<Vec<Parking>>;

    /// The user's open ride, if any.
    async fn open_ride_for_user(&mut self, user_id: i64) -> StoreResult<Option<Ride>>;

    /// Overwrite a vehicle row.
    async fn update_vehicle(&mut self, vehicle: &VehicleRecord) -> StoreResult<()>;

    /// Insert a ride and return it with its id.
    async fn insert_ride(&mut self, ride: NewRide) -> StoreResult<Ride>;

    /// Overwrite a ride row.
    async fn update_ride(&mut self, ride: &Ride) -> StoreResult<()>;

    /// Subtract `amount` from the balance; returns the new balance.
    async fn debit_account(&mut self, user_id: i64, amount: Decimal) -> StoreResult<Decimal>;

    /// Add `amount` to the balance; returns the new balance.
    async fn credit_account(&mut self, user_id: i64, amount: Decimal) -> StoreResult<Decimal>;

    /// Set or clear the suspended flag.
    async fn set_suspended(&mut self, user_id: i64, suspended: bool) -> StoreResult<()>;

    /// Increase the residual debt; returns the new debt.
    async fn add_debt(&mut self, user_id: i64, amount: Decimal) -> StoreResult<Decimal>;

    /// Decrease the residual debt; returns the new debt.
    async fn settle_debt(&mut self, user_id: i64, amount: Decimal) -> StoreResult<Decimal>;

    /// Append a ledger row.
    async fn record_payment(&mut self, payment: NewPayment) -> StoreResult<Payment>;

    /// Activate or deactivate a parking.
    async fn set_parking_active(&mut self, parking_id: i64, active: bool) -> StoreResult<()>;

    /// Make every change visible and release the locks.
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
