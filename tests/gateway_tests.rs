//! Integration tests for the device plane over the in-memory broker:
//! command round trips, replays, telemetry and response correlation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use ride_fleet::backends::memory::{MemoryBroker, MemoryStore, RecordingNotifier};
use ride_fleet::messages::{self, Command, CommandResponse, CommandType, StatusMessage};
use ride_fleet::models::VehicleRecord;
use ride_fleet::traits::{Channel, MqttMessage, SystemClock, Transport};
use ride_fleet::{
    CommandDispatcher, Gateway, IndicatorColor, RetryPolicy, TelemetryListener, VehicleClass,
    VehicleStatus,
};

fn record(id: i64, class: VehicleClass, battery: Option<u8>) -> VehicleRecord {
    VehicleRecord {
        id,
        matricola: format!("V-{:03}", id),
        class,
        status: VehicleStatus::Available,
        battery,
        parking_id: 1,
    }
}

async fn gateway_with(broker: &Arc<MemoryBroker>, records: &[VehicleRecord]) -> Arc<Gateway> {
    let gateway = Gateway::new(
        1,
        broker.clone(),
        Arc::new(SystemClock),
        RetryPolicy::once(),
        16,
    );
    gateway.start().await.unwrap();
    for r in records {
        gateway.add_device(r).await;
    }
    gateway
}

fn responses(broker: &MemoryBroker, vehicle_id: i64) -> Vec<CommandResponse> {
    broker
        .published_to(&format!("Parking/1/RisposteComandi/{}", vehicle_id))
        .iter()
        .map(|m| messages::decode(&m.payload).unwrap())
        .collect()
}

fn statuses(broker: &MemoryBroker, vehicle_id: i64) -> Vec<StatusMessage> {
    broker
        .published_to(&format!("Parking/1/Mezzi/{}", vehicle_id))
        .iter()
        .map(|m| messages::decode(&m.payload).unwrap())
        .collect()
}

async fn send(broker: &MemoryBroker, parking_id: i64, command: &Command) {
    let topic = format!("Parking/{}/Comandi/{}", parking_id, command.vehicle_id);
    broker
        .publish(&topic, messages::encode(command).unwrap())
        .await
        .unwrap();
}

// ============================================================================
// Command round trips
// ============================================================================

#[tokio::test]
async fn unlock_twice_second_fails() {
    let broker = Arc::new(MemoryBroker::new());
    let gateway = gateway_with(&broker, &[record(5, VehicleClass::EBike, Some(90))]).await;

    send(&broker, 1, &Command::new(5, CommandType::Unlock, "backend", Utc::now())).await;
    send(&broker, 1, &Command::new(5, CommandType::Unlock, "backend", Utc::now())).await;

    let responses = responses(&broker, 5);
    assert_eq!(responses.len(), 2);
    assert!(responses[0].success);
    assert!(!responses[1].success);
    assert_eq!(
        responses[1].error_description.as_deref(),
        Some("cannot unlock vehicle 5 in state inUse")
    );
    assert_eq!(gateway.device(5).await.unwrap().status, VehicleStatus::InUse);

    // Only the successful unlock produced telemetry
    assert_eq!(statuses(&broker, 5).len(), 1);
}

#[tokio::test]
async fn replayed_command_not_reexecuted() {
    let broker = Arc::new(MemoryBroker::new());
    let gateway = gateway_with(&broker, &[record(5, VehicleClass::EBike, Some(90))]).await;

    let unlock = Command::new(5, CommandType::Unlock, "backend", Utc::now());
    let lock = Command::new(5, CommandType::Lock, "backend", Utc::now());
    send(&broker, 1, &unlock).await;
    send(&broker, 1, &lock).await;
    send(&broker, 1, &unlock).await;

    let responses = responses(&broker, 5);
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[2], responses[0]);
    assert_eq!(gateway.device(5).await.unwrap().status, VehicleStatus::Available);
    assert_eq!(statuses(&broker, 5).len(), 2);
}

#[tokio::test]
async fn unknown_vehicle_gets_failed_response() {
    let broker = Arc::new(MemoryBroker::new());
    let _gateway = gateway_with(&broker, &[]).await;

    let cmd = Command::new(77, CommandType::Unlock, "backend", Utc::now());
    send(&broker, 1, &cmd).await;

    let responses = responses(&broker, 77);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].command_id, cmd.command_id);
    assert_eq!(
        responses[0].error_description.as_deref(),
        Some("vehicle 77 not found in emulation")
    );
}

#[tokio::test]
async fn malformed_payload_dropped() {
    let broker = Arc::new(MemoryBroker::new());
    let gateway = gateway_with(&broker, &[record(5, VehicleClass::EBike, Some(90))]).await;

    broker
        .inject(MqttMessage::new("Parking/1/Comandi/5", b"not json".to_vec()))
        .await;
    broker
        .inject(MqttMessage::new("Parking/1/Comandi/abc", b"{}".to_vec()))
        .await;

    assert!(broker.published().is_empty());
    assert_eq!(gateway.device(5).await.unwrap().status, VehicleStatus::Available);
}

#[tokio::test]
async fn other_parking_commands_not_received() {
    let broker = Arc::new(MemoryBroker::new());
    let gateway = gateway_with(&broker, &[record(5, VehicleClass::EBike, Some(90))]).await;

    send(&broker, 2, &Command::new(5, CommandType::Unlock, "backend", Utc::now())).await;

    assert!(responses(&broker, 5).is_empty());
    assert_eq!(gateway.device(5).await.unwrap().status, VehicleStatus::Available);
}

#[tokio::test]
async fn stopped_gateway_ignores_commands() {
    let broker = Arc::new(MemoryBroker::new());
    let gateway = gateway_with(&broker, &[record(5, VehicleClass::EBike, Some(90))]).await;
    gateway.stop().await.unwrap();

    send(&broker, 1, &Command::new(5, CommandType::Unlock, "backend", Utc::now())).await;

    assert!(!gateway.is_running());
    assert!(responses(&broker, 5).is_empty());
}

// ============================================================================
// Battery rule through the gateway
// ============================================================================

#[tokio::test]
async fn battery_drop_and_recharge() {
    let broker = Arc::new(MemoryBroker::new());
    let gateway = gateway_with(&broker, &[record(6, VehicleClass::EScooter, Some(25))]).await;

    let status = gateway.set_battery(6, 19).await.unwrap().unwrap();
    assert_eq!(status.status, VehicleStatus::NotWithdrawable);
    let device = gateway.device(6).await.unwrap();
    assert_eq!(device.indicator, IndicatorColor::Red);

    let status = gateway.set_battery(6, 20).await.unwrap().unwrap();
    assert_eq!(status.status, VehicleStatus::Available);
    assert_eq!(statuses(&broker, 6).len(), 2);
}

#[tokio::test]
async fn in_use_vehicle_keeps_status_on_low_battery() {
    let broker = Arc::new(MemoryBroker::new());
    let gateway = gateway_with(&broker, &[record(6, VehicleClass::EScooter, Some(25))]).await;
    gateway
        .handle_command(6, Command::new(6, CommandType::Unlock, "backend", Utc::now()))
        .await;

    gateway.set_battery(6, 5).await.unwrap();
    assert_eq!(gateway.device(6).await.unwrap().status, VehicleStatus::InUse);

    let response = gateway
        .handle_command(6, Command::new(6, CommandType::Lock, "backend", Utc::now()))
        .await;
    assert!(response.success);
    assert_eq!(
        gateway.device(6).await.unwrap().status,
        VehicleStatus::NotWithdrawable
    );
}

// ============================================================================
// Backend side
// ============================================================================

#[tokio::test]
async fn dispatch_and_wait_correlates_response() {
    let broker = Arc::new(MemoryBroker::new());
    let _gateway = gateway_with(&broker, &[record(5, VehicleClass::EBike, Some(64))]).await;
    let dispatcher =
        CommandDispatcher::new(broker.clone(), Arc::new(SystemClock), RetryPolicy::once());
    dispatcher.subscribe_responses().await.unwrap();

    let cmd = dispatcher.command(5, CommandType::RequestBattery);
    let id = cmd.command_id;
    let response = dispatcher
        .dispatch_and_wait(1, cmd, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(response.command_id, id);
    assert!(response.success);
    let extra = response.extra_data.unwrap();
    assert_eq!(extra["batteryLevel"], 64);
    assert_eq!(dispatcher.response_tracker().pending_count(), 0);
}

#[tokio::test]
async fn telemetry_reaches_store_and_admin() {
    let broker = Arc::new(MemoryBroker::new());
    let store = MemoryStore::new();
    let vehicle = record(6, VehicleClass::EScooter, Some(25));
    store.insert_vehicle(vehicle.clone()).await;
    let notifier = Arc::new(RecordingNotifier::new());
    let listener = Arc::new(TelemetryListener::new(
        Arc::new(store.clone()),
        notifier.clone(),
    ));
    listener.subscribe(broker.as_ref()).await.unwrap();
    let gateway = gateway_with(&broker, &[vehicle]).await;

    gateway.set_battery(6, 22).await.unwrap();
    gateway.set_battery(6, 18).await.unwrap();

    assert_eq!(store.vehicle("V-006").await.unwrap().battery, Some(18));
    let alerts = notifier.named("battery_low");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, Channel::Admin);
    assert_eq!(alerts[0].1.field("newStatus"), Some(&"notWithdrawable".into()));
}
