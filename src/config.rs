//! Configuration for every component of the control plane.
//!
//! Each component receives its own section at construction time; nothing
//! reads configuration from globals.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use ride_fleet::config::{Config, FleetConfig, MqttConfig};
//!
//! // Use defaults
//! let config = Config::default();
//! assert_eq!(config.fleet.reconcile_interval(), Duration::from_secs(20));
//!
//! // Or customize
//! let config = Config::default()
//!     .with_mqtt(MqttConfig::default().with_host("192.168.1.100"))
//!     .with_fleet(FleetConfig::default().with_reconcile_interval_secs(5));
//! ```
//!
//! The `fleetd` binary builds its configuration with [`Config::from_env`],
//! which reads `FLEET_*` variables and falls back to the defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::VehicleClass;

/// A configuration variable could not be parsed.
#[derive(Debug, Error)]
#[error("invalid value '{value}' for {key}")]
pub struct ConfigError {
    /// Variable name.
    pub key: String,
    /// Raw value.
    pub value: String,
}

// ============================================================================
// Main Config
// ============================================================================

/// Complete application configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection
    pub mqtt: MqttConfig,
    /// Publish retry policy
    pub retry: RetryConfig,
    /// Gateway fleet behaviour
    pub fleet: FleetConfig,
    /// Ride pricing
    pub tariff: TariffConfig,
    /// Ride monitor sweep
    pub monitor: MonitorConfig,
}

impl Config {
    /// Set MQTT configuration
    pub fn with_mqtt(mut self, mqtt: MqttConfig) -> Self {
        self.mqtt = mqtt;
        self
    }

    /// Set retry configuration
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set fleet configuration
    pub fn with_fleet(mut self, fleet: FleetConfig) -> Self {
        self.fleet = fleet;
        self
    }

    /// Set tariff configuration
    pub fn with_tariff(mut self, tariff: TariffConfig) -> Self {
        self.tariff = tariff;
        self
    }

    /// Set monitor configuration
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Build a configuration from `FLEET_*` environment variables.
    ///
    /// Unset variables keep their default; set but unparsable ones are an
    /// error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(host) = lookup("FLEET_MQTT_HOST") {
            config.mqtt.host = host;
        }
        config.mqtt.port = parse_or(&lookup, "FLEET_MQTT_PORT", config.mqtt.port)?;
        if let Some(id) = lookup("FLEET_MQTT_CLIENT_ID") {
            config.mqtt.client_id = id;
        }
        if let Some(username) = lookup("FLEET_MQTT_USERNAME") {
            config.mqtt.username = Some(username);
            config.mqtt.password = lookup("FLEET_MQTT_PASSWORD");
        }
        config.mqtt.keep_alive_secs =
            parse_or(&lookup, "FLEET_MQTT_KEEP_ALIVE_SECS", config.mqtt.keep_alive_secs)?;

        config.retry.attempts = parse_or(&lookup, "FLEET_RETRY_ATTEMPTS", config.retry.attempts)?;
        config.retry.delay_ms = parse_or(&lookup, "FLEET_RETRY_DELAY_MS", config.retry.delay_ms)?;

        config.fleet.reconcile_interval_secs = parse_or(
            &lookup,
            "FLEET_RECONCILE_SECS",
            config.fleet.reconcile_interval_secs,
        )?;
        config.fleet.battery_tick_secs =
            parse_or(&lookup, "FLEET_BATTERY_TICK_SECS", config.fleet.battery_tick_secs)?;

        config.tariff.base_fare = parse_or(&lookup, "FLEET_BASE_FARE", config.tariff.base_fare)?;
        config.tariff.included_minutes = parse_or(
            &lookup,
            "FLEET_INCLUDED_MINUTES",
            config.tariff.included_minutes,
        )?;

        config.monitor.sweep_interval_secs =
            parse_or(&lookup, "FLEET_SWEEP_SECS", config.monitor.sweep_interval_secs)?;

        Ok(config)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError {
            key: key.to_string(),
            value: raw,
        }),
    }
}

// ============================================================================
// MQTT Config
// ============================================================================

/// MQTT client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname or IP
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client ID (must be unique per connection)
    pub client_id: String,
    /// Username for authentication
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u16,
    /// First reconnect delay in milliseconds
    pub reconnect_min_ms: u64,
    /// Reconnect delay cap in milliseconds
    pub reconnect_max_ms: u64,
    /// Request channel capacity of the client
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "ride-fleet".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            reconnect_min_ms: 500,
            reconnect_max_ms: 30_000,
            channel_capacity: 64,
        }
    }
}

impl MqttConfig {
    /// Set the broker host
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Set the broker port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the client ID
    pub fn with_client_id(mut self, id: &str) -> Self {
        self.client_id = id.to_string();
        self
    }

    /// Set authentication credentials
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Set reconnect backoff bounds
    pub fn with_reconnect_backoff_ms(mut self, min: u64, max: u64) -> Self {
        self.reconnect_min_ms = min;
        self.reconnect_max_ms = max.max(min);
        self
    }

    /// Check if authentication is configured
    pub fn has_auth(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }
}

// ============================================================================
// Retry Config
// ============================================================================

/// Bounded retry with fixed backoff, applied around publishes
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay between attempts in milliseconds
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Set the number of attempts (at least one)
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the delay between attempts
    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }
}

// ============================================================================
// Fleet Config
// ============================================================================

/// Gateway fleet configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Roster reconciliation period in seconds
    pub reconcile_interval_secs: u64,
    /// Processed command ids remembered per gateway for replay detection
    pub dedupe_capacity: usize,
    /// Battery simulation period in seconds
    pub battery_tick_secs: u64,
    /// Battery percent lost per tick while in use
    pub battery_drain_per_tick: u8,
    /// Battery percent gained per tick while parked
    pub battery_charge_per_tick: u8,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 20,
            dedupe_capacity: 256,
            battery_tick_secs: 30,
            battery_drain_per_tick: 1,
            battery_charge_per_tick: 2,
        }
    }
}

impl FleetConfig {
    /// Set the reconciliation period
    pub fn with_reconcile_interval_secs(mut self, secs: u64) -> Self {
        self.reconcile_interval_secs = secs.max(1);
        self
    }

    /// Set the replay cache size
    pub fn with_dedupe_capacity(mut self, capacity: usize) -> Self {
        self.dedupe_capacity = capacity.max(1);
        self
    }

    /// Set the battery simulation rates
    pub fn with_battery_rates(mut self, drain: u8, charge: u8) -> Self {
        self.battery_drain_per_tick = drain;
        self.battery_charge_per_tick = charge;
        self
    }

    /// Reconciliation period
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Battery simulation period
    pub fn battery_tick(&self) -> Duration {
        Duration::from_secs(self.battery_tick_secs)
    }
}

// ============================================================================
// Tariff Config
// ============================================================================

/// Ride pricing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TariffConfig {
    /// Flat fare covering the included minutes; also the minimum balance to start
    pub base_fare: Decimal,
    /// Minutes covered by the base fare
    pub included_minutes: i64,
    /// Per extra minute, muscular bike
    pub muscular_bike_rate: Decimal,
    /// Per extra minute, e-bike
    pub e_bike_rate: Decimal,
    /// Per extra minute, e-scooter
    pub e_scooter_rate: Decimal,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            base_fare: Decimal::new(50, 2),
            included_minutes: 30,
            muscular_bike_rate: Decimal::new(10, 2),
            e_bike_rate: Decimal::new(20, 2),
            e_scooter_rate: Decimal::new(25, 2),
        }
    }
}

impl TariffConfig {
    /// Set the base fare
    pub fn with_base_fare(mut self, fare: Decimal) -> Self {
        self.base_fare = fare;
        self
    }

    /// Set the minutes covered by the base fare
    pub fn with_included_minutes(mut self, minutes: i64) -> Self {
        self.included_minutes = minutes.max(0);
        self
    }

    /// Set the per-minute rate of one class
    pub fn with_rate(mut self, class: VehicleClass, rate: Decimal) -> Self {
        match class {
            VehicleClass::MuscularBike => self.muscular_bike_rate = rate,
            VehicleClass::EBike => self.e_bike_rate = rate,
            VehicleClass::EScooter => self.e_scooter_rate = rate,
        }
        self
    }

    /// Per extra minute rate of a class
    pub fn rate_for(&self, class: VehicleClass) -> Decimal {
        match class {
            VehicleClass::MuscularBike => self.muscular_bike_rate,
            VehicleClass::EBike => self.e_bike_rate,
            VehicleClass::EScooter => self.e_scooter_rate,
        }
    }
}

// ============================================================================
// Monitor Config
// ============================================================================

/// Ride monitor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Sweep period in seconds
    pub sweep_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
        }
    }
}

impl MonitorConfig {
    /// Set the sweep period
    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs.max(1);
        self
    }

    /// Sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // =========================================================================
    // Defaults
    // =========================================================================

    #[test]
    fn config_default_sections() {
        let config = Config::default();
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.delay_ms, 1000);
        assert_eq!(config.fleet.reconcile_interval_secs, 20);
        assert_eq!(config.tariff.base_fare, Decimal::new(50, 2));
        assert_eq!(config.tariff.included_minutes, 30);
    }

    #[test]
    fn tariff_rates_are_distinct_per_class() {
        let tariff = TariffConfig::default();
        let bike = tariff.rate_for(VehicleClass::MuscularBike);
        let ebike = tariff.rate_for(VehicleClass::EBike);
        let scooter = tariff.rate_for(VehicleClass::EScooter);
        assert_eq!(bike, Decimal::new(10, 2));
        assert!(bike != ebike && ebike != scooter && bike != scooter);
    }

    // =========================================================================
    // Builders
    // =========================================================================

    #[test]
    fn mqtt_config_full_builder() {
        let mqtt = MqttConfig::default()
            .with_host("broker.example.com")
            .with_port(8883)
            .with_client_id("backend-1")
            .with_auth("user", "pass")
            .with_reconnect_backoff_ms(1000, 500);

        assert_eq!(mqtt.host, "broker.example.com");
        assert_eq!(mqtt.port, 8883);
        assert_eq!(mqtt.client_id, "backend-1");
        assert!(mqtt.has_auth());
        assert_eq!(mqtt.reconnect_min_ms, 1000);
        assert_eq!(mqtt.reconnect_max_ms, 1000);
    }

    #[test]
    fn retry_config_never_zero_attempts() {
        let retry = RetryConfig::default().with_attempts(0).with_delay_ms(0);
        assert_eq!(retry.attempts, 1);
        assert_eq!(retry.delay_ms, 0);
    }

    #[test]
    fn tariff_builder_sets_class_rate() {
        let tariff = TariffConfig::default().with_rate(VehicleClass::EScooter, Decimal::new(30, 2));
        assert_eq!(tariff.rate_for(VehicleClass::EScooter), Decimal::new(30, 2));
    }

    // =========================================================================
    // Environment
    // =========================================================================

    #[test]
    fn from_lookup_overrides_defaults() {
        let lookup = lookup_from(&[
            ("FLEET_MQTT_HOST", "mqtt.fleet.local"),
            ("FLEET_MQTT_PORT", "8883"),
            ("FLEET_MQTT_USERNAME", "gateway"),
            ("FLEET_MQTT_PASSWORD", "secret"),
            ("FLEET_RECONCILE_SECS", "5"),
            ("FLEET_BASE_FARE", "1.00"),
            ("FLEET_SWEEP_SECS", "15"),
        ]);
        let config = Config::from_lookup(lookup).unwrap();

        assert_eq!(config.mqtt.host, "mqtt.fleet.local");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("gateway"));
        assert_eq!(config.mqtt.password.as_deref(), Some("secret"));
        assert_eq!(config.fleet.reconcile_interval_secs, 5);
        assert_eq!(config.tariff.base_fare, Decimal::new(100, 2));
        assert_eq!(config.monitor.sweep_interval_secs, 15);
        assert_eq!(config.retry.attempts, 3);
    }

    #[test]
    fn from_lookup_rejects_bad_numbers() {
        let lookup = lookup_from(&[("FLEET_MQTT_PORT", "not-a-port")]);
        let error = Config::from_lookup(lookup).unwrap_err();
        assert_eq!(error.key, "FLEET_MQTT_PORT");
        assert_eq!(error.value, "not-a-port");
    }
}
