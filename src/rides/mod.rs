//! Ride lifecycle and billing.
//!
//! - [`RideEngine`]: start, stop and forced termination of rides, top-ups
//! - [`RideMonitor`]: periodic sweep closing rides whose cost reached the
//!   balance
//! - [`Tariff`]: pricing
//!
//! Stops and forced terminations both re-check the ride inside a
//! transaction holding the ride row, so each ride closes exactly once.

pub mod engine;
pub mod monitor;
pub mod tariff;

pub use engine::{ForcedTermination, RideEngine, RideReceipt, StopRequest};
pub use monitor::{RideMonitor, SweepOutcome, SweepReport};
pub use tariff::Tariff;
