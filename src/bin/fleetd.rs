//! Fleet control daemon.
//!
//! Connects to the MQTT broker, seeds a demo fleet into an in-memory store,
//! and runs every gateway and background loop until Ctrl-C.
//!
//! # Usage
//!
//! ```sh
//! FLEET_MQTT_HOST=broker.local RUST_LOG_LEVEL=debug cargo run --bin fleetd
//! ```
//!
//! Settings are read from `FLEET_*` variables, optionally from a `.env` file.

use std::sync::Arc;

use anyhow::Context;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{info, Level};

use ride_fleet::backends::{LogNotifier, MemoryStore, MqttTransport};
use ride_fleet::gateway::{BatterySimulator, GatewayFleet};
use ride_fleet::messages::{VehicleClass, VehicleStatus};
use ride_fleet::models::{Parking, UserAccount, VehicleRecord};
use ride_fleet::rides::{RideEngine, RideMonitor, Tariff};
use ride_fleet::traits::{Clock, FleetStore, Notifier, SystemClock, Transport};
use ride_fleet::{CommandDispatcher, Config, RetryPolicy, TelemetryListener};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let level = std::env::var("RUST_LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = Config::from_env().context("invalid configuration")?;
    info!(host = %config.mqtt.host, port = config.mqtt.port, "ride-fleet starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (mqtt, mqtt_task) = MqttTransport::start(&config.mqtt, shutdown_rx.clone());
    let transport: Arc<dyn Transport> = mqtt;

    let store = MemoryStore::new();
    seed_demo(&store).await;
    let store: Arc<dyn FleetStore> = Arc::new(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let retry = RetryPolicy::from(&config.retry);

    let fleet = Arc::new(GatewayFleet::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&clock),
        config.fleet.clone(),
        retry,
    ));
    let running = fleet.start_all().await.context("failed to start gateways")?;
    info!(gateways = running, "gateways running");

    let dispatcher = Arc::new(CommandDispatcher::new(
        Arc::clone(&transport),
        Arc::clone(&clock),
        retry,
    ));
    dispatcher
        .subscribe_responses()
        .await
        .context("failed to subscribe to command responses")?;

    let telemetry = Arc::new(TelemetryListener::new(Arc::clone(&store), Arc::clone(&notifier)));
    telemetry
        .subscribe(transport.as_ref())
        .await
        .context("failed to subscribe to telemetry")?;

    let engine = Arc::new(
        RideEngine::new(
            Arc::clone(&store),
            dispatcher,
            notifier,
            clock,
            Tariff::from(config.tariff.clone()),
        )
        .with_roster_sync(Arc::clone(&fleet) as _),
    );
    let monitor = Arc::new(RideMonitor::new(engine, &config.monitor));
    let battery = BatterySimulator::new(Arc::clone(&fleet), &config.fleet);

    let tasks = vec![
        tokio::spawn(Arc::clone(&fleet).run(shutdown_rx.clone())),
        tokio::spawn(monitor.run(shutdown_rx.clone())),
        tokio::spawn(battery.run(shutdown_rx)),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    shutdown_tx.send(true).ok();

    for task in tasks {
        task.await.context("background task panicked")?;
    }
    fleet.stop_all().await;
    mqtt_task.await.context("MQTT task panicked")?;
    info!("ride-fleet stopped");
    Ok(())
}

/// Two parkings with a few vehicles and one funded account.
async fn seed_demo(store: &MemoryStore) {
    for (id, name, capacity) in [(1, "Stazione Centrale", 10), (2, "Piazza Duomo", 6)] {
        store
            .insert_parking(Parking {
                id,
                name: name.to_string(),
                capacity,
                active: true,
            })
            .await;
    }

    let vehicles = [
        (1, "MB-001", VehicleClass::MuscularBike, None, 1),
        (2, "EB-002", VehicleClass::EBike, Some(85), 1),
        (3, "ES-003", VehicleClass::EScooter, Some(15), 1),
        (4, "EB-004", VehicleClass::EBike, Some(60), 2),
        (5, "ES-005", VehicleClass::EScooter, Some(95), 2),
    ];
    for (id, matricola, class, battery, parking_id) in vehicles {
        let record = VehicleRecord {
            id,
            matricola: matricola.to_string(),
            class,
            status: VehicleStatus::Available,
            battery,
            parking_id,
        };
        let status = if record.is_low_battery() {
            VehicleStatus::NotWithdrawable
        } else {
            VehicleStatus::Available
        };
        store.insert_vehicle(VehicleRecord { status, ..record }).await;
    }

    store
        .insert_account(UserAccount {
            user_id: 1,
            balance: Decimal::new(1000, 2),
            suspended: false,
            debt: Decimal::ZERO,
        })
        .await;
    info!("demo fleet seeded");
}
