//! Concrete implementations of the collaborator traits.
//!
//! # Available Backends
//!
//! | Module | Feature | Provides |
//! |--------|---------|----------|
//! | [`memory`] | always | broker, store, notifiers and clock for tests and demos |
//! | `mqtt` | `mqtt` | rumqttc-backed [`Transport`](crate::traits::Transport) |

pub mod memory;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use memory::{LogNotifier, ManualClock, MemoryBroker, MemoryStore, RecordingNotifier};

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
