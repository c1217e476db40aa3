//! Ride pricing.
//!
//! A ride costs the base fare for the included minutes plus a per-minute
//! class rate for every minute beyond them. Partial minutes round up.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::TariffConfig;
use crate::messages::VehicleClass;

/// Pricing rules.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tariff {
    config: TariffConfig,
}

impl From<TariffConfig> for Tariff {
    fn from(config: TariffConfig) -> Self {
        Self { config }
    }
}

impl Tariff {
    /// Minimum balance to start a ride.
    pub fn base_fare(&self) -> Decimal {
        self.config.base_fare
    }

    /// Whole minutes billed between two instants, rounding up.
    ///
    /// An end before the start bills zero minutes.
    pub fn billable_minutes(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        let seconds = (end - start).num_seconds().max(0);
        (seconds + 59) / 60
    }

    /// Cost of a ride lasting `minutes`.
    pub fn cost(&self, class: VehicleClass, minutes: i64) -> Decimal {
        let extra = (minutes - self.config.included_minutes).max(0);
        self.config.base_fare + self.config.rate_for(class) * Decimal::from(extra)
    }

    /// Cost of a ride between two instants.
    pub fn cost_between(
        &self,
        class: VehicleClass,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Decimal {
        self.cost(class, self.billable_minutes(start, end))
    }
}
