//! Time source.
//!
//! Billing and telemetry timestamps come from an injected [`Clock`] so tests
//! can move time forward deterministically with
//! [`ManualClock`](crate::backends::memory::ManualClock).
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, TimeZone, Utc};
//! use ride_fleet::traits::Clock;
//! use ride_fleet::backends::memory::ManualClock;
//!
//! let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
//! clock.advance(Duration::minutes(30));
//! assert_eq!(clock.now(), Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap());
//! ```

use chrono::{DateTime, Utc};

/// Wall-clock time source.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
