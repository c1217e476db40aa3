//! Ride start, stop, forced termination and top-up.
//!
//! Every mutation follows the same shape: an optimistic pre-check without
//! locks to fail fast, then a transaction that locks the rows, re-checks
//! the same conditions and applies the change. Commands to devices and
//! notifications go out only after the commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::dispatch::CommandDispatcher;
use crate::error::RideError;
use crate::messages::VehicleStatus;
use crate::models::{NewPayment, NewRide, PaymentKind, Ride, UserAccount, VehicleRecord};
use crate::traits::{Channel, Clock, FleetStore, NotificationEvent, Notifier, RosterSync};

use super::Tariff;

/// Parameters of a user-initiated stop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopRequest {
    /// Caller; must own the ride.
    pub user_id: i64,
    /// Where the vehicle is returned.
    pub dropoff_parking_id: i64,
    /// Whether the user reported a problem with the vehicle.
    pub problem_reported: bool,
}

/// Result of a completed stop.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideReceipt {
    /// The closed ride.
    pub ride: Ride,
    /// Billed minutes.
    pub minutes: i64,
    /// Amount charged.
    pub cost: Decimal,
    /// Balance after the charge.
    pub balance: Decimal,
    /// Whether the charge suspended the account.
    pub suspended: bool,
    /// Status the vehicle was parked in.
    pub vehicle_status: VehicleStatus,
}

/// Result of a forced termination.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForcedTermination {
    /// The closed ride.
    pub ride: Ride,
    /// Remaining balance taken.
    pub charged: Decimal,
    /// Shortfall added to the account's debt.
    pub debt_added: Decimal,
}

/// Ride lifecycle engine.
pub struct RideEngine {
    store: Arc<dyn FleetStore>,
    dispatcher: Arc<CommandDispatcher>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    tariff: Tariff,
    roster_sync: Option<Arc<dyn RosterSync>>,
}

impl RideEngine {
    /// Engine without a roster hook.
    pub fn new(
        store: Arc<dyn FleetStore>,
        dispatcher: Arc<CommandDispatcher>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        tariff: Tariff,
    ) -> Self {
        Self {
            store,
            dispatcher,
            notifier,
            clock,
            tariff,
            roster_sync: None,
        }
    }

    /// Resync vehicles through `sync` after every ride end.
    pub fn with_roster_sync(mut self, sync: Arc<dyn RosterSync>) -> Self {
        self.roster_sync = Some(sync);
        self
    }

    /// Pricing in effect.
    pub fn tariff(&self) -> &Tariff {
        &self.tariff
    }

    /// Every open ride.
    pub async fn open_rides(&self) -> Result<Vec<Ride>, RideError> {
        Ok(self.store.find_open_rides().await?)
    }

    fn check_account(&self, account: &UserAccount) -> Result<(), RideError> {
        if account.suspended {
            return Err(RideError::AccountSuspended(account.user_id));
        }
        if account.balance < self.tariff.base_fare() {
            return Err(RideError::InsufficientBalance {
                required: self.tariff.base_fare(),
                available: account.balance,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Rent `matricola` for `user_id`.
    ///
    /// The ride exists once the transaction commits. A failed unlock after
    /// that does not undo it; an `unlock_failed` event goes to the admin
    /// channel and the user instead.
    pub async fn start_ride(&self, user_id: i64, matricola: &str) -> Result<Ride, RideError> {
        let account = self
            .store
            .find_account(user_id)
            .await?
            .ok_or(RideError::AccountNotFound(user_id))?;
        self.check_account(&account)?;
        let vehicle = self
            .store
            .find_vehicle_by_matricola(matricola)
            .await?
            .ok_or_else(|| RideError::VehicleNotFound(matricola.to_string()))?;
        if vehicle.status != VehicleStatus::Available {
            return Err(RideError::VehicleUnavailable(matricola.to_string()));
        }

        let mut tx = self.store.begin().await?;
        let account = tx
            .lock_account(user_id)
            .await?
            .ok_or(RideError::AccountNotFound(user_id))?;
        self.check_account(&account)?;
        if tx.open_ride_for_user(user_id).await?.is_some() {
            return Err(RideError::RideInProgress(user_id));
        }
        let mut vehicle = tx
            .lock_vehicle(matricola)
            .await?
            .ok_or_else(|| RideError::VehicleNotFound(matricola.to_string()))?;
        if vehicle.status != VehicleStatus::Available {
            return Err(RideError::VehicleUnavailable(matricola.to_string()));
        }

        vehicle.status = VehicleStatus::InUse;
        tx.update_vehicle(&vehicle).await?;
        let ride = tx
            .insert_ride(NewRide {
                user_id,
                vehicle_matricola: vehicle.matricola.clone(),
                pickup_parking_id: vehicle.parking_id,
                start_time: self.clock.now(),
            })
            .await?;
        tx.commit().await?;
        info!(ride_id = ride.id, user_id, %matricola, parking_id = vehicle.parking_id, "ride started");

        if let Err(e) = self.dispatcher.unlock(vehicle.parking_id, vehicle.id).await {
            error!(ride_id = ride.id, %matricola, error = %e, "unlock not delivered");
            let event = NotificationEvent::unlock_failed(ride.id, matricola, &e.to_string());
            self.notifier.notify(Channel::Admin, event.clone()).await;
            self.notifier.notify(Channel::User(user_id), event).await;
        }
        Ok(ride)
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// Close a ride at the user's request and charge it.
    pub async fn stop_ride(
        &self,
        ride_id: i64,
        request: StopRequest,
    ) -> Result<RideReceipt, RideError> {
        let StopRequest {
            user_id,
            dropoff_parking_id,
            problem_reported,
        } = request;

        let ride = self
            .store
            .find_ride(ride_id)
            .await?
            .ok_or(RideError::RideNotFound(ride_id))?;
        check_owner(&ride, user_id)?;
        if !ride.is_open() {
            return Err(RideError::AlreadyTerminated(ride_id));
        }
        let dropoff_active = self
            .store
            .find_parking(dropoff_parking_id)
            .await?
            .is_some_and(|p| p.active);
        if !dropoff_active {
            return Err(RideError::InvalidParking(dropoff_parking_id));
        }

        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let mut ride = tx
            .lock_ride(ride_id)
            .await?
            .ok_or(RideError::RideNotFound(ride_id))?;
        if !ride.is_open() {
            return Err(RideError::AlreadyTerminated(ride_id));
        }
        check_owner(&ride, user_id)?;
        let dropoff_active = tx
            .lock_parking(dropoff_parking_id)
            .await?
            .is_some_and(|p| p.active);
        if !dropoff_active {
            return Err(RideError::InvalidParking(dropoff_parking_id));
        }
        let mut vehicle = tx
            .lock_vehicle(&ride.vehicle_matricola)
            .await?
            .ok_or_else(|| RideError::VehicleNotFound(ride.vehicle_matricola.clone()))?;
        let account = tx
            .lock_account(user_id)
            .await?
            .ok_or(RideError::AccountNotFound(user_id))?;

        let minutes = self.tariff.billable_minutes(ride.start_time, now);
        let cost = self.tariff.cost(vehicle.class, minutes);
        let balance = tx.debit_account(user_id, cost).await?;
        tx.record_payment(NewPayment {
            user_id,
            ride_id: Some(ride_id),
            amount: cost,
            kind: PaymentKind::RideCharge,
            created_at: now,
        })
        .await?;
        let suspended = balance < Decimal::ZERO;
        if suspended {
            tx.set_suspended(user_id, true).await?;
        }

        let pickup_parking_id = vehicle.parking_id;
        vehicle.status = parked_status(&vehicle, problem_reported);
        vehicle.parking_id = dropoff_parking_id;
        tx.update_vehicle(&vehicle).await?;

        ride.end_time = Some(now);
        ride.dropoff_parking_id = Some(dropoff_parking_id);
        ride.final_cost = Some(cost);
        ride.problem_reported = problem_reported;
        tx.update_ride(&ride).await?;
        tx.commit().await?;
        info!(ride_id, user_id, minutes, %cost, %balance, "ride stopped");

        self.release_vehicle(pickup_parking_id, &vehicle).await;

        self.notifier
            .notify(
                Channel::User(user_id),
                NotificationEvent::balance_changed(user_id, balance, -cost),
            )
            .await;
        self.notifier
            .notify(
                Channel::User(user_id),
                NotificationEvent::transaction_recorded(
                    user_id,
                    Some(ride_id),
                    cost,
                    PaymentKind::RideCharge,
                ),
            )
            .await;
        if suspended {
            warn!(user_id, %balance, "account suspended after ride charge");
            self.notifier
                .notify(
                    Channel::User(user_id),
                    NotificationEvent::account_suspended(user_id, balance, account.debt),
                )
                .await;
        }

        Ok(RideReceipt {
            ride,
            minutes,
            cost,
            balance,
            suspended: suspended || account.suspended,
            vehicle_status: vehicle.status,
        })
    }

    // ========================================================================
    // Forced termination
    // ========================================================================

    /// Cost of `ride` if it ended at `now`.
    pub async fn cost_so_far(&self, ride: &Ride, now: DateTime<Utc>) -> Result<Decimal, RideError> {
        let vehicle = self
            .store
            .find_vehicle_by_matricola(&ride.vehicle_matricola)
            .await?
            .ok_or_else(|| RideError::VehicleNotFound(ride.vehicle_matricola.clone()))?;
        Ok(self.tariff.cost_between(vehicle.class, ride.start_time, now))
    }

    /// Close `ride` if its running cost reached the user's balance.
    ///
    /// The user is charged whatever balance is left and the shortfall becomes
    /// debt. The balance ends at zero, even when it was already negative, and
    /// the account is suspended. Returns `None` when the ride can
    /// continue or was already closed by another path.
    pub async fn enforce_balance(
        &self,
        ride: &Ride,
    ) -> Result<Option<ForcedTermination>, RideError> {
        let now = self.clock.now();
        let account = self
            .store
            .find_account(ride.user_id)
            .await?
            .ok_or(RideError::AccountNotFound(ride.user_id))?;
        if self.cost_so_far(ride, now).await? < account.balance {
            return Ok(None);
        }

        let mut tx = self.store.begin().await?;
        let Some(mut ride) = tx.lock_ride(ride.id).await? else {
            return Err(RideError::RideNotFound(ride.id));
        };
        if !ride.is_open() {
            debug!(ride_id = ride.id, "ride closed concurrently, skipping");
            return Ok(None);
        }
        let account = tx
            .lock_account(ride.user_id)
            .await?
            .ok_or(RideError::AccountNotFound(ride.user_id))?;
        let mut vehicle = tx
            .lock_vehicle(&ride.vehicle_matricola)
            .await?
            .ok_or_else(|| RideError::VehicleNotFound(ride.vehicle_matricola.clone()))?;
        let cost = self.tariff.cost_between(vehicle.class, ride.start_time, now);
        if cost < account.balance {
            return Ok(None);
        }

        let user_id = ride.user_id;
        let charged = account.balance.max(Decimal::ZERO);
        // A balance already below zero is moved into the debt as well
        let deficit = (-account.balance).max(Decimal::ZERO);
        let debt_added = cost - charged + deficit;
        let mut balance = tx.debit_account(user_id, charged).await?;
        if deficit > Decimal::ZERO {
            balance = tx.credit_account(user_id, deficit).await?;
        }
        tx.record_payment(NewPayment {
            user_id,
            ride_id: Some(ride.id),
            amount: charged,
            kind: PaymentKind::ForcedSettlement,
            created_at: now,
        })
        .await?;
        let debt = tx.add_debt(user_id, debt_added).await?;
        tx.set_suspended(user_id, true).await?;

        vehicle.status = parked_status(&vehicle, false);
        tx.update_vehicle(&vehicle).await?;

        ride.end_time = Some(now);
        ride.final_cost = Some(charged);
        tx.update_ride(&ride).await?;
        tx.commit().await?;
        warn!(ride_id = ride.id, user_id, %charged, %debt_added, "ride force-terminated");

        self.release_vehicle(vehicle.parking_id, &vehicle).await;

        let terminated = NotificationEvent::ride_force_terminated(
            user_id,
            ride.id,
            &ride.vehicle_matricola,
            charged,
            debt_added,
        );
        self.notifier
            .notify(Channel::User(user_id), terminated.clone())
            .await;
        self.notifier.notify(Channel::Admin, terminated).await;
        self.notifier
            .notify(
                Channel::User(user_id),
                NotificationEvent::balance_changed(user_id, balance, deficit - charged),
            )
            .await;
        self.notifier
            .notify(
                Channel::User(user_id),
                NotificationEvent::transaction_recorded(
                    user_id,
                    Some(ride.id),
                    charged,
                    PaymentKind::ForcedSettlement,
                ),
            )
            .await;
        self.notifier
            .notify(
                Channel::User(user_id),
                NotificationEvent::account_suspended(user_id, balance, debt),
            )
            .await;

        Ok(Some(ForcedTermination {
            ride,
            charged,
            debt_added,
        }))
    }

    // ========================================================================
    // Top-up
    // ========================================================================

    /// Add credit. Outstanding debt is settled from it first; the account is
    /// reactivated once the balance is non-negative and no debt remains.
    pub async fn top_up(&self, user_id: i64, amount: Decimal) -> Result<UserAccount, RideError> {
        if amount <= Decimal::ZERO {
            return Err(RideError::InvalidAmount(amount));
        }
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let account = tx
            .lock_account(user_id)
            .await?
            .ok_or(RideError::AccountNotFound(user_id))?;

        let settled = amount.min(account.debt);
        let debt = if settled > Decimal::ZERO {
            tx.settle_debt(user_id, settled).await?
        } else {
            account.debt
        };
        let credit = amount - settled;
        let balance = tx.credit_account(user_id, credit).await?;
        let suspended = account.suspended && !(balance >= Decimal::ZERO && debt.is_zero());
        if account.suspended && !suspended {
            tx.set_suspended(user_id, false).await?;
        }
        tx.record_payment(NewPayment {
            user_id,
            ride_id: None,
            amount,
            kind: PaymentKind::TopUp,
            created_at: now,
        })
        .await?;
        tx.commit().await?;
        info!(user_id, %amount, %settled, %balance, suspended, "account topped up");

        self.notifier
            .notify(
                Channel::User(user_id),
                NotificationEvent::balance_changed(user_id, balance, credit),
            )
            .await;
        self.notifier
            .notify(
                Channel::User(user_id),
                NotificationEvent::transaction_recorded(user_id, None, amount, PaymentKind::TopUp),
            )
            .await;

        Ok(UserAccount {
            user_id,
            balance,
            suspended,
            debt,
        })
    }

    // Lock goes to the gateway still holding the device, then the roster
    // follows the store.
    async fn release_vehicle(&self, holding_parking_id: i64, vehicle: &VehicleRecord) {
        if let Err(e) = self.dispatcher.lock(holding_parking_id, vehicle.id).await {
            error!(matricola = %vehicle.matricola, error = %e, "lock not delivered");
        }
        if let Some(sync) = &self.roster_sync {
            sync.resync_vehicle(&vehicle.matricola).await;
        }
    }
}

fn check_owner(ride: &Ride, user_id: i64) -> Result<(), RideError> {
    if ride.user_id != user_id {
        return Err(RideError::NotRideOwner {
            ride_id: ride.id,
            user_id,
        });
    }
    Ok(())
}

/// Status of a vehicle coming back from a ride.
fn parked_status(vehicle: &VehicleRecord, problem_reported: bool) -> VehicleStatus {
    if problem_reported || vehicle.is_low_battery() {
        VehicleStatus::NotWithdrawable
    } else {
        VehicleStatus::Available
    }
}
