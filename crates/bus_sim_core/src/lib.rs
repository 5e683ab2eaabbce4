//! Bus network simulation core.
//!
//! Pure, synchronous building blocks for the feeders: the immutable
//! route/stop catalog, per-bus and per-stop state, and the movement,
//! passenger-flow, demand and sensor models. No I/O happens in this crate.

pub mod catalog;
pub mod context;
pub mod demand;
pub mod error;
pub mod geo;
pub mod movement;
pub mod passenger_flow;
pub mod patterns;
pub mod sensors;
pub mod settings;
pub mod speed;
pub mod state;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
