//! Integration tests for the ride lifecycle: start, stop, forced
//! termination and top-up over the in-memory backends.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;

use ride_fleet::backends::memory::{ManualClock, MemoryBroker, MemoryStore, RecordingNotifier};
use ride_fleet::config::{FleetConfig, MonitorConfig};
use ride_fleet::models::{Parking, PaymentKind, Ride, UserAccount, VehicleRecord};
use ride_fleet::rides::{RideEngine, RideMonitor, StopRequest, SweepOutcome, Tariff};
use ride_fleet::traits::{Channel, Clock, FleetStore};
use ride_fleet::{
    CommandDispatcher, GatewayFleet, RetryPolicy, RideError, TelemetryListener, VehicleClass,
    VehicleStatus,
};

fn euros(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

struct Harness {
    store: MemoryStore,
    broker: Arc<MemoryBroker>,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
    fleet: Arc<GatewayFleet>,
    engine: Arc<RideEngine>,
}

impl Harness {
    async fn new() -> Self {
        let store = MemoryStore::new();
        for (id, capacity) in [(1, 10), (2, 10)] {
            store
                .insert_parking(Parking {
                    id,
                    name: format!("Parking {}", id),
                    capacity,
                    active: true,
                })
                .await;
        }
        store
            .insert_parking(Parking {
                id: 3,
                name: "Closed".into(),
                capacity: 10,
                active: false,
            })
            .await;
        for (id, matricola, class, battery, status) in [
            (1, "MB-001", VehicleClass::MuscularBike, None, VehicleStatus::Available),
            (2, "EB-002", VehicleClass::EBike, Some(80), VehicleStatus::Available),
            (3, "ES-003", VehicleClass::EScooter, Some(25), VehicleStatus::Available),
            (4, "ES-004", VehicleClass::EScooter, Some(10), VehicleStatus::NotWithdrawable),
        ] {
            store
                .insert_vehicle(VehicleRecord {
                    id,
                    matricola: matricola.into(),
                    class,
                    status,
                    battery,
                    parking_id: 1,
                })
                .await;
        }
        store.insert_account(account(1, euros(1000))).await;
        store.insert_account(account(2, euros(1000))).await;

        let broker = Arc::new(MemoryBroker::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ));
        let notifier = Arc::new(RecordingNotifier::new());
        let shared: Arc<dyn FleetStore> = Arc::new(store.clone());

        let fleet = Arc::new(GatewayFleet::new(
            Arc::clone(&shared),
            broker.clone(),
            clock.clone(),
            FleetConfig::default(),
            RetryPolicy::once(),
        ));
        fleet.start_all().await.unwrap();

        let dispatcher = Arc::new(CommandDispatcher::new(
            broker.clone(),
            clock.clone(),
            RetryPolicy::once(),
        ));
        let engine = Arc::new(
            RideEngine::new(
                shared,
                dispatcher,
                notifier.clone(),
                clock.clone(),
                Tariff::default(),
            )
            .with_roster_sync(fleet.clone()),
        );

        Self {
            store,
            broker,
            clock,
            notifier,
            fleet,
            engine,
        }
    }

    async fn device_status(&self, parking_id: i64, vehicle_id: i64) -> Option<VehicleStatus> {
        let gateway = self.fleet.gateway(parking_id).await?;
        gateway.device(vehicle_id).await.map(|d| d.status)
    }

    async fn listen_telemetry(&self) {
        let listener = Arc::new(TelemetryListener::new(
            Arc::new(self.store.clone()),
            self.notifier.clone(),
        ));
        listener.subscribe(self.broker.as_ref()).await.unwrap();
    }

    fn stop(&self, user_id: i64, dropoff: i64) -> StopRequest {
        StopRequest {
            user_id,
            dropoff_parking_id: dropoff,
            problem_reported: false,
        }
    }
}

fn account(user_id: i64, balance: Decimal) -> UserAccount {
    UserAccount {
        user_id,
        balance,
        suspended: false,
        debt: Decimal::ZERO,
    }
}

// ============================================================================
// Start
// ============================================================================

#[tokio::test]
async fn start_ride_unlocks_vehicle() {
    let h = Harness::new().await;

    let ride = h.engine.start_ride(1, "EB-002").await.unwrap();

    assert!(ride.is_open());
    assert_eq!(ride.pickup_parking_id, 1);
    assert_eq!(h.store.vehicle("EB-002").await.unwrap().status, VehicleStatus::InUse);
    assert_eq!(h.device_status(1, 2).await, Some(VehicleStatus::InUse));
    assert_eq!(h.broker.published_to("Parking/1/Comandi/2").len(), 1);
}

#[tokio::test]
async fn start_ride_refusals() {
    let h = Harness::new().await;

    let err = h.engine.start_ride(1, "ES-004").await.unwrap_err();
    assert!(matches!(err, RideError::VehicleUnavailable(_)));
    assert!(err.is_conflict());

    let err = h.engine.start_ride(1, "XX-999").await.unwrap_err();
    assert!(matches!(err, RideError::VehicleNotFound(_)));

    let err = h.engine.start_ride(42, "MB-001").await.unwrap_err();
    assert!(matches!(err, RideError::AccountNotFound(42)));

    h.engine.start_ride(1, "MB-001").await.unwrap();
    let err = h.engine.start_ride(1, "EB-002").await.unwrap_err();
    assert!(matches!(err, RideError::RideInProgress(1)));

    let err = h.engine.start_ride(2, "MB-001").await.unwrap_err();
    assert!(matches!(err, RideError::VehicleUnavailable(_)));
}

#[tokio::test]
async fn recharged_vehicle_becomes_rentable() {
    let h = Harness::new().await;
    h.listen_telemetry().await;
    let gateway = h.fleet.gateway(1).await.unwrap();

    gateway.set_battery(4, 80).await.unwrap();

    let stored = h.store.vehicle("ES-004").await.unwrap();
    assert_eq!(stored.status, VehicleStatus::Available);
    assert_eq!(stored.battery, Some(80));

    // Reconcile must not push the old state back
    h.fleet.reconcile().await.unwrap();
    h.fleet.resync_one("ES-004").await.unwrap();
    assert_eq!(h.device_status(1, 4).await, Some(VehicleStatus::Available));

    let ride = h.engine.start_ride(1, "ES-004").await.unwrap();
    assert!(ride.is_open());
    assert_eq!(h.device_status(1, 4).await, Some(VehicleStatus::InUse));
}

#[tokio::test]
async fn drained_vehicle_stops_being_rentable() {
    let h = Harness::new().await;
    h.listen_telemetry().await;

    h.fleet.gateway(1).await.unwrap().set_battery(3, 15).await.unwrap();

    assert_eq!(
        h.store.vehicle("ES-003").await.unwrap().status,
        VehicleStatus::NotWithdrawable
    );
    let err = h.engine.start_ride(1, "ES-003").await.unwrap_err();
    assert!(matches!(err, RideError::VehicleUnavailable(_)));
}

#[tokio::test]
async fn start_ride_requires_base_fare_and_active_account() {
    let h = Harness::new().await;
    h.store.insert_account(account(3, euros(49))).await;
    h.store
        .insert_account(UserAccount {
            suspended: true,
            ..account(4, euros(1000))
        })
        .await;

    let err = h.engine.start_ride(3, "MB-001").await.unwrap_err();
    assert!(matches!(err, RideError::InsufficientBalance { .. }));

    let err = h.engine.start_ride(4, "MB-001").await.unwrap_err();
    assert!(matches!(err, RideError::AccountSuspended(4)));
}

#[tokio::test]
async fn commit_failure_sends_no_command() {
    let h = Harness::new().await;
    h.store.fail_next_commit();

    let err = h.engine.start_ride(1, "EB-002").await.unwrap_err();

    assert!(matches!(err, RideError::Store(_)));
    assert!(h.broker.published_matching("Parking/+/Comandi/+").is_empty());
    assert_eq!(
        h.store.vehicle("EB-002").await.unwrap().status,
        VehicleStatus::Available
    );
    assert!(h.engine.open_rides().await.unwrap().is_empty());
}

#[tokio::test]
async fn unlock_failure_keeps_ride_and_notifies() {
    let h = Harness::new().await;
    h.broker.fail_next_publishes(1);

    let ride = h.engine.start_ride(1, "EB-002").await.unwrap();

    assert!(h.store.ride(ride.id).await.unwrap().is_open());
    assert_eq!(h.store.vehicle("EB-002").await.unwrap().status, VehicleStatus::InUse);
    assert_eq!(h.device_status(1, 2).await, Some(VehicleStatus::Available));

    let events = h.notifier.named("unlock_failed");
    let channels: Vec<Channel> = events.iter().map(|(c, _)| *c).collect();
    assert_eq!(channels, vec![Channel::Admin, Channel::User(1)]);
    assert_eq!(events[0].1.field("rideId"), Some(&ride.id.into()));
}

// ============================================================================
// Stop
// ============================================================================

#[tokio::test]
async fn thirty_minutes_cost_base_fare() {
    let h = Harness::new().await;
    let ride = h.engine.start_ride(1, "MB-001").await.unwrap();
    h.clock.advance(Duration::minutes(30));

    let receipt = h.engine.stop_ride(ride.id, h.stop(1, 1)).await.unwrap();

    assert_eq!(receipt.minutes, 30);
    assert_eq!(receipt.cost, euros(50));
    assert_eq!(receipt.balance, euros(950));
}

#[tokio::test]
async fn forty_minutes_on_bike_cost() {
    let h = Harness::new().await;
    let ride = h.engine.start_ride(1, "MB-001").await.unwrap();
    h.clock.advance(Duration::minutes(40));

    let receipt = h.engine.stop_ride(ride.id, h.stop(1, 1)).await.unwrap();

    assert_eq!(receipt.cost, euros(150));
    assert_eq!(h.store.account(1).await.unwrap().balance, euros(850));
    let payments = h.store.payments_for(1).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].kind, PaymentKind::RideCharge);
    assert_eq!(payments[0].amount, euros(150));
}

#[tokio::test]
async fn stop_moves_vehicle_to_dropoff_gateway() {
    let h = Harness::new().await;
    let ride = h.engine.start_ride(1, "EB-002").await.unwrap();
    h.clock.advance(Duration::minutes(12));

    let receipt = h.engine.stop_ride(ride.id, h.stop(1, 2)).await.unwrap();

    assert_eq!(receipt.vehicle_status, VehicleStatus::Available);
    assert_eq!(receipt.ride.dropoff_parking_id, Some(2));
    let vehicle = h.store.vehicle("EB-002").await.unwrap();
    assert_eq!(vehicle.parking_id, 2);
    assert_eq!(vehicle.status, VehicleStatus::Available);

    // Lock went to the gateway holding the device at the time
    assert_eq!(h.broker.published_to("Parking/1/Comandi/2").len(), 2);
    assert_eq!(h.fleet.hosts_of(2).await, vec![2]);
    assert_eq!(h.device_status(2, 2).await, Some(VehicleStatus::Available));

    assert_eq!(h.notifier.named("balance_changed").len(), 1);
    assert_eq!(h.notifier.named("transaction_recorded").len(), 1);
    assert!(h.notifier.named("account_suspended").is_empty());
}

#[tokio::test]
async fn reported_problem_parks_not_withdrawable() {
    let h = Harness::new().await;
    h.listen_telemetry().await;
    let ride = h.engine.start_ride(1, "EB-002").await.unwrap();
    h.clock.advance(Duration::minutes(5));

    let request = StopRequest {
        problem_reported: true,
        ..h.stop(1, 1)
    };
    let receipt = h.engine.stop_ride(ride.id, request).await.unwrap();

    assert_eq!(receipt.vehicle_status, VehicleStatus::NotWithdrawable);
    assert!(receipt.ride.problem_reported);
    assert_eq!(
        h.store.vehicle("EB-002").await.unwrap().status,
        VehicleStatus::NotWithdrawable
    );

    // Neither the lock telemetry nor a recharge clears the report
    h.fleet.gateway(1).await.unwrap().set_battery(2, 95).await.unwrap();
    assert_eq!(h.device_status(1, 2).await, Some(VehicleStatus::NotWithdrawable));
    assert_eq!(
        h.store.vehicle("EB-002").await.unwrap().status,
        VehicleStatus::NotWithdrawable
    );
}

#[tokio::test]
async fn low_battery_return_parks_not_withdrawable() {
    let h = Harness::new().await;
    let ride = h.engine.start_ride(1, "ES-003").await.unwrap();
    h.store.update_battery("ES-003", 12).await.unwrap();
    h.clock.advance(Duration::minutes(5));

    let receipt = h.engine.stop_ride(ride.id, h.stop(1, 1)).await.unwrap();

    assert_eq!(receipt.vehicle_status, VehicleStatus::NotWithdrawable);
}

#[tokio::test]
async fn overrun_suspends_account() {
    let h = Harness::new().await;
    h.store.insert_account(account(5, euros(60))).await;
    let ride = h.engine.start_ride(5, "MB-001").await.unwrap();
    h.clock.advance(Duration::minutes(40));

    let receipt = h.engine.stop_ride(ride.id, h.stop(5, 1)).await.unwrap();

    assert_eq!(receipt.balance, euros(-90));
    assert!(receipt.suspended);
    assert!(h.store.account(5).await.unwrap().suspended);
    assert_eq!(h.notifier.named("account_suspended").len(), 1);
}

#[tokio::test]
async fn stop_refusals() {
    let h = Harness::new().await;
    let ride = h.engine.start_ride(1, "MB-001").await.unwrap();

    let err = h.engine.stop_ride(ride.id, h.stop(2, 1)).await.unwrap_err();
    assert!(matches!(err, RideError::NotRideOwner { user_id: 2, .. }));

    let err = h.engine.stop_ride(ride.id, h.stop(1, 3)).await.unwrap_err();
    assert!(matches!(err, RideError::InvalidParking(3)));

    let err = h.engine.stop_ride(ride.id, h.stop(1, 99)).await.unwrap_err();
    assert!(matches!(err, RideError::InvalidParking(99)));

    let err = h.engine.stop_ride(999, h.stop(1, 1)).await.unwrap_err();
    assert!(matches!(err, RideError::RideNotFound(999)));

    h.engine.stop_ride(ride.id, h.stop(1, 1)).await.unwrap();
    let err = h.engine.stop_ride(ride.id, h.stop(1, 1)).await.unwrap_err();
    assert!(matches!(err, RideError::AlreadyTerminated(_)));
}

#[tokio::test]
async fn concurrent_stops_close_once() {
    let h = Harness::new().await;
    let ride = h.engine.start_ride(1, "EB-002").await.unwrap();
    h.clock.advance(Duration::minutes(10));

    let a = {
        let engine = Arc::clone(&h.engine);
        let request = h.stop(1, 1);
        tokio::spawn(async move { engine.stop_ride(ride.id, request).await })
    };
    let b = {
        let engine = Arc::clone(&h.engine);
        let request = h.stop(1, 2);
        tokio::spawn(async move { engine.stop_ride(ride.id, request).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    let failure = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(failure, RideError::AlreadyTerminated(_)));

    let charges: Vec<_> = h
        .store
        .payments_for(1)
        .await
        .into_iter()
        .filter(|p| p.kind == PaymentKind::RideCharge)
        .collect();
    assert_eq!(charges.len(), 1);
    assert_eq!(h.store.account(1).await.unwrap().balance, euros(950));
}

// ============================================================================
// Forced termination
// ============================================================================

async fn ride_with_balance(h: &Harness, balance: Decimal) -> Ride {
    h.store.insert_account(account(7, balance)).await;
    let mut vehicle = h.store.vehicle("EB-002").await.unwrap();
    vehicle.status = VehicleStatus::InUse;
    h.store.insert_vehicle(vehicle).await;
    let ride = Ride {
        id: 100,
        user_id: 7,
        vehicle_matricola: "EB-002".into(),
        pickup_parking_id: 1,
        start_time: h.clock.now(),
        dropoff_parking_id: None,
        end_time: None,
        final_cost: None,
        problem_reported: false,
    };
    h.store.insert_ride(ride.clone()).await;
    ride
}

#[tokio::test]
async fn sweep_force_terminates_exhausted_balance() {
    let h = Harness::new().await;
    let ride = ride_with_balance(&h, euros(40)).await;
    h.clock.advance(Duration::minutes(1));
    let monitor = RideMonitor::new(Arc::clone(&h.engine), &MonitorConfig::default());

    let outcome = monitor.sweep().await;

    let SweepOutcome::Completed(report) = outcome else {
        panic!("sweep skipped");
    };
    assert_eq!(report.scanned, 1);
    assert_eq!(report.terminated, vec![ride.id]);

    let closed = h.store.ride(ride.id).await.unwrap();
    assert!(!closed.is_open());
    assert_eq!(closed.final_cost, Some(euros(40)));
    assert_eq!(closed.dropoff_parking_id, None);

    let account = h.store.account(7).await.unwrap();
    assert_eq!(account.balance, Decimal::ZERO);
    assert_eq!(account.debt, euros(10));
    assert!(account.suspended);

    let vehicle = h.store.vehicle("EB-002").await.unwrap();
    assert_eq!(vehicle.status, VehicleStatus::Available);
    assert_eq!(vehicle.parking_id, 1);

    let payments = h.store.payments_for(7).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].kind, PaymentKind::ForcedSettlement);

    let terminated = h.notifier.named("ride_force_terminated");
    let channels: Vec<Channel> = terminated.iter().map(|(c, _)| *c).collect();
    assert_eq!(channels, vec![Channel::User(7), Channel::Admin]);
    assert_eq!(h.notifier.named("account_suspended").len(), 1);
}

#[tokio::test]
async fn forced_termination_zeroes_negative_balance() {
    let h = Harness::new().await;
    let ride = ride_with_balance(&h, euros(-30)).await;
    h.clock.advance(Duration::minutes(1));

    let terminated = h.engine.enforce_balance(&ride).await.unwrap().unwrap();

    assert_eq!(terminated.charged, Decimal::ZERO);
    assert_eq!(terminated.debt_added, euros(80));
    let account = h.store.account(7).await.unwrap();
    assert_eq!(account.balance, Decimal::ZERO);
    assert_eq!(account.debt, euros(80));
    assert!(account.suspended);
}

#[tokio::test]
async fn sweep_leaves_funded_rides_alone() {
    let h = Harness::new().await;
    let ride = h.engine.start_ride(1, "MB-001").await.unwrap();
    h.clock.advance(Duration::minutes(45));
    let monitor = RideMonitor::new(Arc::clone(&h.engine), &MonitorConfig::default());

    let outcome = monitor.sweep().await;

    assert_eq!(
        outcome,
        SweepOutcome::Completed(ride_fleet::rides::SweepReport {
            scanned: 1,
            terminated: vec![],
            failed: 0,
        })
    );
    assert!(h.store.ride(ride.id).await.unwrap().is_open());
}

#[tokio::test]
async fn enforce_skips_closed_ride() {
    let h = Harness::new().await;
    let ride = ride_with_balance(&h, euros(40)).await;
    h.clock.advance(Duration::minutes(1));
    h.engine.stop_ride(ride.id, h.stop(7, 1)).await.unwrap();

    assert!(h.engine.enforce_balance(&ride).await.unwrap().is_none());
    assert_eq!(h.store.payments_for(7).await.len(), 1);
}

#[tokio::test]
async fn second_sweep_skipped_while_running() {
    let h = Harness::new().await;
    ride_with_balance(&h, euros(40)).await;
    let monitor = Arc::new(RideMonitor::new(
        Arc::clone(&h.engine),
        &MonitorConfig::default(),
    ));

    // Block the store so the first sweep stalls on its first read.
    let tx = h.store.begin().await.unwrap();
    let first = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move { monitor.sweep().await })
    };
    while !monitor.is_sweeping() {
        tokio::task::yield_now().await;
    }

    assert_eq!(monitor.sweep().await, SweepOutcome::Skipped);

    drop(tx);
    assert!(matches!(first.await.unwrap(), SweepOutcome::Completed(_)));
    assert!(!monitor.is_sweeping());
}

// ============================================================================
// Monitor loop
// ============================================================================

fn every_30s() -> MonitorConfig {
    MonitorConfig::default().with_sweep_interval_secs(30)
}

#[tokio::test(start_paused = true)]
async fn monitor_loop_sweeps_on_interval() {
    let h = Harness::new().await;
    let ride = ride_with_balance(&h, euros(40)).await;
    h.clock.advance(Duration::minutes(1));
    let monitor = Arc::new(RideMonitor::new(Arc::clone(&h.engine), &every_30s()));
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&monitor).run(rx));

    // Nothing happens before the first period elapses
    tokio::time::sleep(StdDuration::from_secs(29)).await;
    assert!(h.store.ride(ride.id).await.unwrap().is_open());

    tokio::time::sleep(StdDuration::from_secs(2)).await;
    assert!(!h.store.ride(ride.id).await.unwrap().is_open());

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn monitor_drains_in_flight_sweep_on_shutdown() {
    let h = Harness::new().await;
    let ride = ride_with_balance(&h, euros(40)).await;
    h.clock.advance(Duration::minutes(1));
    let monitor = Arc::new(RideMonitor::new(Arc::clone(&h.engine), &every_30s()));
    let (shutdown, rx) = watch::channel(false);

    // Hold the store so the first sweep stalls mid-flight
    let tx = h.store.begin().await.unwrap();
    let task = tokio::spawn(Arc::clone(&monitor).run(rx));
    tokio::time::sleep(StdDuration::from_secs(31)).await;
    assert!(monitor.is_sweeping());

    shutdown.send(true).unwrap();
    tokio::time::sleep(StdDuration::from_secs(60)).await;
    assert!(!task.is_finished());

    drop(tx);
    task.await.unwrap();

    assert!(!monitor.is_sweeping());
    let closed = h.store.ride(ride.id).await.unwrap();
    assert!(!closed.is_open());
    assert_eq!(h.store.payments_for(7).await.len(), 1);
}

// ============================================================================
// Top-up
// ============================================================================

#[tokio::test]
async fn top_up_settles_debt_then_reactivates() {
    let h = Harness::new().await;
    h.store
        .insert_account(UserAccount {
            user_id: 8,
            balance: Decimal::ZERO,
            suspended: true,
            debt: euros(10),
        })
        .await;

    let account = h.engine.top_up(8, euros(500)).await.unwrap();

    assert_eq!(account.debt, Decimal::ZERO);
    assert_eq!(account.balance, euros(490));
    assert!(!account.suspended);
    assert_eq!(h.store.account(8).await.unwrap(), account);

    let payments = h.store.payments_for(8).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].kind, PaymentKind::TopUp);
    assert_eq!(payments[0].amount, euros(500));
}

#[tokio::test]
async fn partial_top_up_keeps_suspension() {
    let h = Harness::new().await;
    h.store
        .insert_account(UserAccount {
            user_id: 8,
            balance: Decimal::ZERO,
            suspended: true,
            debt: euros(300),
        })
        .await;

    let account = h.engine.top_up(8, euros(100)).await.unwrap();

    assert_eq!(account.debt, euros(200));
    assert_eq!(account.balance, Decimal::ZERO);
    assert!(account.suspended);
}

#[tokio::test]
async fn top_up_rejects_non_positive_amounts() {
    let h = Harness::new().await;
    for amount in [Decimal::ZERO, euros(-100)] {
        let err = h.engine.top_up(1, amount).await.unwrap_err();
        assert!(matches!(err, RideError::InvalidAmount(_)));
    }
    assert!(h.store.payments_for(1).await.is_empty());
}
