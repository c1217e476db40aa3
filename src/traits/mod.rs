//! Collaborator traits at the edges of the control plane.
//!
//! # Submodules
//!
//! - `transport`: pub/sub client used by gateways and the backend
//! - `store`: data-access boundary (system of record)
//! - `notify`: notification boundary (per-user and admin channels)
//! - `clock`: injectable time source
//! - `roster`: hook from ride billing to gateway rosters
//!
//! Concrete implementations live in [`crate::backends`].

pub mod clock;
pub mod notify;
pub mod roster;
pub mod store;
pub mod transport;

pub use clock::*;
pub use notify::*;
pub use roster::*;
pub use store::*;
pub use transport::*;
