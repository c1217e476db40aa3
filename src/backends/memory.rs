//! In-process implementations for tests and local runs.
//!
//! | Type | Trait | Purpose |
//! |------|-------|---------|
//! | [`MemoryBroker`] | [`Transport`] | Topic-filter pub/sub with publish capture |
//! | [`MemoryStore`] | [`FleetStore`] | Tables behind one async mutex, transactional |
//! | [`RecordingNotifier`] | [`Notifier`] | Captures emitted events |
//! | [`LogNotifier`] | [`Notifier`] | Writes events to the log |
//! | [`ManualClock`] | [`Clock`] | Controllable time source |
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ride_fleet::backends::memory::MemoryBroker;
//! use ride_fleet::traits::Transport;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = MemoryBroker::new();
//! broker.publish("Parking/1/Mezzi/2", b"{}".to_vec()).await.unwrap();
//! assert_eq!(broker.published_to("Parking/1/Mezzi/2").len(), 1);
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::info;

use crate::error::{StoreError, StoreResult, TransportError};
use crate::models::{
    NewPayment, NewRide, Parking, Payment, Ride, UserAccount, VehicleRecord,
};
use crate::topics;
use crate::traits::{
    Channel, Clock, FleetStore, MessageHandler, MqttMessage, NotificationEvent, Notifier,
    StoreTx, Transport,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Broker
// ============================================================================

/// In-process broker.
///
/// Publishing delivers synchronously to every matching subscription before
/// returning, so a test observes all downstream effects of a publish once it
/// has been awaited. Every publish is recorded, including ones nobody
/// receives.
#[derive(Default)]
pub struct MemoryBroker {
    subscriptions: RwLock<Vec<(String, Arc<dyn MessageHandler>)>>,
    published: Mutex<Vec<MqttMessage>>,
    fail_publishes: AtomicU32,
}

impl MemoryBroker {
    /// Empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.fail_publishes.store(count, Ordering::SeqCst);
    }

    /// Every successful publish so far, oldest first.
    pub fn published(&self) -> Vec<MqttMessage> {
        lock(&self.published).clone()
    }

    /// Successful publishes to a concrete topic.
    pub fn published_to(&self, topic: &str) -> Vec<MqttMessage> {
        lock(&self.published)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Successful publishes matching a filter.
    pub fn published_matching(&self, filter: &str) -> Vec<MqttMessage> {
        lock(&self.published)
            .iter()
            .filter(|m| topics::matches(filter, &m.topic))
            .cloned()
            .collect()
    }

    /// Forget the publish log.
    pub fn clear_published(&self) {
        lock(&self.published).clear();
    }

    /// Whether any handler is registered for exactly `filter`.
    pub fn is_subscribed(&self, filter: &str) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|(f, _)| f == filter)
    }

    /// Deliver a message to subscribers without recording it, as if it
    /// arrived from another client.
    pub async fn inject(&self, message: MqttMessage) {
        self.deliver(message).await;
    }

    async fn deliver(&self, message: MqttMessage) {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .subscriptions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(filter, _)| topics::matches(filter, &message.topic))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler.handle(message.clone()).await;
        }
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let injected = self
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Publish("broker unavailable".to_string()));
        }

        let message = MqttMessage::new(topic, payload);
        lock(&self.published).push(message.clone());
        self.deliver(message).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        self.subscriptions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((filter.to_string(), handler));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.subscriptions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|(f, _)| f != filter);
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Clone, Debug, Default)]
struct Tables {
    parkings: BTreeMap<i64, Parking>,
    vehicles: BTreeMap<String, VehicleRecord>,
    rides: BTreeMap<i64, Ride>,
    accounts: BTreeMap<i64, UserAccount>,
    payments: Vec<Payment>,
    next_ride_id: i64,
    next_payment_id: i64,
}

impl Tables {
    fn vehicles_in_parking(&self, parking_id: i64) -> Vec<VehicleRecord> {
        let mut vehicles: Vec<VehicleRecord> = self
            .vehicles
            .values()
            .filter(|v| v.parking_id == parking_id)
            .cloned()
            .collect();
        vehicles.sort_by_key(|v| v.id);
        vehicles
    }

    fn active_parkings(&self) -> Vec<Parking> {
        self.parkings.values().filter(|p| p.active).cloned().collect()
    }

    fn account_mut(&mut self, user_id: i64) -> StoreResult<&mut UserAccount> {
        self.accounts
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", user_id)))
    }
}

/// In-memory system of record.
///
/// A transaction holds the table lock from [`FleetStore::begin`] until commit
/// or drop and works on a private copy, so transactions are serializable and
/// a dropped one leaves no trace. Reads through [`FleetStore`] wait for any
/// open transaction.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<AsyncMutex<Tables>>,
    fail_commit: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail (the transaction is rolled back).
    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    /// Insert or replace a parking.
    pub async fn insert_parking(&self, parking: Parking) {
        self.tables.lock().await.parkings.insert(parking.id, parking);
    }

    /// Insert or replace a vehicle (keyed by matricola).
    pub async fn insert_vehicle(&self, vehicle: VehicleRecord) {
        self.tables
            .lock()
            .await
            .vehicles
            .insert(vehicle.matricola.clone(), vehicle);
    }

    /// Insert or replace an account.
    pub async fn insert_account(&self, account: UserAccount) {
        self.tables
            .lock()
            .await
            .accounts
            .insert(account.user_id, account);
    }

    /// Insert or replace a ride, keeping its id.
    pub async fn insert_ride(&self, ride: Ride) {
        let mut tables = self.tables.lock().await;
        tables.next_ride_id = tables.next_ride_id.max(ride.id);
        tables.rides.insert(ride.id, ride);
    }

    /// Remove a vehicle row.
    pub async fn remove_vehicle(&self, matricola: &str) -> Option<VehicleRecord> {
        self.tables.lock().await.vehicles.remove(matricola)
    }

    /// Current row of a vehicle.
    pub async fn vehicle(&self, matricola: &str) -> Option<VehicleRecord> {
        self.tables.lock().await.vehicles.get(matricola).cloned()
    }

    /// Current row of an account.
    pub async fn account(&self, user_id: i64) -> Option<UserAccount> {
        self.tables.lock().await.accounts.get(&user_id).cloned()
    }

    /// Current row of a ride.
    pub async fn ride(&self, ride_id: i64) -> Option<Ride> {
        self.tables.lock().await.rides.get(&ride_id).cloned()
    }

    /// Current row of a parking.
    pub async fn parking(&self, parking_id: i64) -> Option<Parking> {
        self.tables.lock().await.parkings.get(&parking_id).cloned()
    }

    /// Every ledger row, oldest first.
    pub async fn payments(&self) -> Vec<Payment> {
        self.tables.lock().await.payments.clone()
    }

    /// Ledger rows of one user.
    pub async fn payments_for(&self, user_id: i64) -> Vec<Payment> {
        self.tables
            .lock()
            .await
            .payments
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn find_vehicle_by_matricola(
        &self,
        matricola: &str,
    ) -> StoreResult<Option<VehicleRecord>> {
        Ok(self.tables.lock().await.vehicles.get(matricola).cloned())
    }

    async fn find_vehicles_by_parking(&self, parking_id: i64) -> StoreResult<Vec<VehicleRecord>> {
        Ok(self.tables.lock().await.vehicles_in_parking(parking_id))
    }

    async fn find_active_parkings(&self) -> StoreResult<Vec<Parking>> {
        Ok(self.tables.lock().await.active_parkings())
    }

    async fn find_parking(&self, parking_id: i64) -> StoreResult<Option<Parking>> {
        Ok(self.tables.lock().await.parkings.get(&parking_id).cloned())
    }

    async fn find_open_rides(&self) -> StoreResult<Vec<Ride>> {
        Ok(self
            .tables
            .lock()
            .await
            .rides
            .values()
            .filter(|r| r.is_open())
            .cloned()
            .collect())
    }

    async fn find_ride(&self, ride_id: i64) -> StoreResult<Option<Ride>> {
        Ok(self.tables.lock().await.rides.get(&ride_id).cloned())
    }

    async fn find_account(&self, user_id: i64) -> StoreResult<Option<UserAccount>> {
        Ok(self.tables.lock().await.accounts.get(&user_id).cloned())
    }

    async fn update_battery(&self, matricola: &str, level: u8) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let vehicle = tables
            .vehicles
            .get_mut(matricola)
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {}", matricola)))?;
        vehicle.battery = Some(level);
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            fail_commit: Arc::clone(&self.fail_commit),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    fail_commit: Arc<AtomicBool>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_vehicle(&mut self, matricola: &str) -> StoreResult<Option<VehicleRecord>> {
        Ok(self.working.vehicles.get(matricola).cloned())
    }

    async fn lock_ride(&mut self, ride_id: i64) -> StoreResult<Option<Ride>> {
        Ok(self.working.rides.get(&ride_id).cloned())
    }

    async fn lock_account(&mut self, user_id: i64) -> StoreResult<Option<UserAccount>> {
        Ok(self.working.accounts.get(&user_id).cloned())
    }

    async fn lock_parking(&mut self, parking_id: i64) -> StoreResult<Option<Parking>> {
        Ok(self.working.parkings.get(&parking_id).cloned())
    }

    async fn vehicles_in_parking(&mut self, parking_id: i64) -> StoreResult<Vec<VehicleRecord>> {
        Ok(self.working.vehicles_in_parking(parking_id))
    }

    async fn active_parkings(&mut self) -> StoreResult<Vec<Parking>> {
        Ok(self.working.active_parkings())
    }

    async fn open_ride_for_user(&mut self, user_id: i64) -> StoreResult<Option<Ride>> {
        Ok(self
            .working
            .rides
            .values()
            .find(|r| r.user_id == user_id && r.is_open())
            .cloned())
    }

    async fn update_vehicle(&mut self, vehicle: &VehicleRecord) -> StoreResult<()> {
        let row = self
            .working
            .vehicles
            .get_mut(&vehicle.matricola)
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {}", vehicle.matricola)))?;
        *row = vehicle.clone();
        Ok(())
    }

    async fn insert_ride(&mut self, ride: NewRide) -> StoreResult<Ride> {
        let busy = self
            .working
            .rides
            .values()
            .filter(|r| r.is_open())
            .any(|r| r.user_id == ride.user_id || r.vehicle_matricola == ride.vehicle_matricola);
        if busy {
            return Err(StoreError::Constraint(format!(
                "open ride exists for user {} or vehicle {}",
                ride.user_id, ride.vehicle_matricola
            )));
        }

        self.working.next_ride_id += 1;
        let ride = Ride {
            id: self.working.next_ride_id,
            user_id: ride.user_id,
            vehicle_matricola: ride.vehicle_matricola,
            pickup_parking_id: ride.pickup_parking_id,
            start_time: ride.start_time,
            dropoff_parking_id: None,
            end_time: None,
            final_cost: None,
            problem_reported: false,
        };
        self.working.rides.insert(ride.id, ride.clone());
        Ok(ride)
    }

    async fn update_ride(&mut self, ride: &Ride) -> StoreResult<()> {
        let row = self
            .working
            .rides
            .get_mut(&ride.id)
            .ok_or_else(|| StoreError::NotFound(format!("ride {}", ride.id)))?;
        *row = ride.clone();
        Ok(())
    }

    async fn debit_account(&mut self, user_id: i64, amount: Decimal) -> StoreResult<Decimal> {
        let account = self.working.account_mut(user_id)?;
        account.balance -= amount;
        Ok(account.balance)
    }

    async fn credit_account(&mut self, user_id: i64, amount: Decimal) -> StoreResult<Decimal> {
        let account = self.working.account_mut(user_id)?;
        account.balance += amount;
        Ok(account.balance)
    }

    async fn set_suspended(&mut self, user_id: i64, suspended: bool) -> StoreResult<()> {
        self.working.account_mut(user_id)?.suspended = suspended;
        Ok(())
    }

    async fn add_debt(&mut self, user_id: i64, amount: Decimal) -> StoreResult<Decimal> {
        let account = self.working.account_mut(user_id)?;
        account.debt += amount;
        Ok(account.debt)
    }

    async fn settle_debt(&mut self, user_id: i64, amount: Decimal) -> StoreResult<Decimal> {
        let account = self.working.account_mut(user_id)?;
        account.debt = (account.debt - amount).max(Decimal::ZERO);
        Ok(account.debt)
    }

    async fn record_payment(&mut self, payment: NewPayment) -> StoreResult<Payment> {
        self.working.next_payment_id += 1;
        let payment = Payment {
            id: self.working.next_payment_id,
            user_id: payment.user_id,
            ride_id: payment.ride_id,
            amount: payment.amount,
            kind: payment.kind,
            created_at: payment.created_at,
        };
        self.working.payments.push(payment.clone());
        Ok(payment)
    }

    async fn set_parking_active(&mut self, parking_id: i64, active: bool) -> StoreResult<()> {
        let parking = self
            .working
            .parkings
            .get_mut(&parking_id)
            .ok_or_else(|| StoreError::NotFound(format!("parking {}", parking_id)))?;
        parking.active = active;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx {
            mut guard,
            working,
            fail_commit,
        } = *self;
        if fail_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("commit failed".to_string()));
        }
        *guard = working;
        Ok(())
    }
}

// ============================================================================
// Notifiers
// ============================================================================

/// Notifier that keeps every event for inspection.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(Channel, NotificationEvent)>>,
}

impl RecordingNotifier {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far, oldest first.
    pub fn events(&self) -> Vec<(Channel, NotificationEvent)> {
        lock(&self.events).clone()
    }

    /// Events with the given name.
    pub fn named(&self, name: &str) -> Vec<(Channel, NotificationEvent)> {
        lock(&self.events)
            .iter()
            .filter(|(_, e)| e.name == name)
            .cloned()
            .collect()
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: Channel, event: NotificationEvent) {
        lock(&self.events).push((channel, event));
    }
}

/// Notifier that logs every event at `info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: Channel, event: NotificationEvent) {
        let data = Value::Object(event.data);
        info!(%channel, event = event.name, %data, "notification");
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, at: DateTime<Utc>) {
        *lock(&self.now) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}
