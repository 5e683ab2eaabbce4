//! Streaming runtime for the bus simulation.
//!
//! This crate owns the collaborator seams (time-series store, event bus,
//! connection registry, websocket transport), the feeder orchestrator that
//! drives the simulation on a fixed interval, and the broadcast gateway.
//! AWS-backed adapters live next to the binaries that use them.

pub mod adapters;
pub mod feeder;
pub mod gateway;
pub mod logging;
