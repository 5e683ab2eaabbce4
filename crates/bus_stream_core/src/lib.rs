//! Shared bus streaming contracts.
//!
//! This crate owns the wire shapes exchanged between the feeders, the
//! time-series store, the event bus and the broadcast gateway. It excludes
//! AWS SDK and Lambda runtime concerns.

pub mod contract;
pub mod gateway;
pub mod naming;
