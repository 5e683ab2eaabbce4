//! Passenger flow at a stop arrival: who gets off, who gets on.
//!
//! Pure with respect to its inputs so the capacity and terminal rules can be
//! exercised without a simulation context.

use crate::error::FlowError;
use crate::settings::FlowPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowOutcome {
    pub alighting: u32,
    pub boarding: u32,
    /// Bus load after alighting and boarding.
    pub passenger_count: u32,
    /// People left waiting at the stop.
    pub waiting_count: u32,
}

/// Terminals empty the bus; elsewhere a fixed share of the load leaves.
pub fn alighting_for(passenger_count: u32, is_terminal: bool, policy: &FlowPolicy) -> u32 {
    if is_terminal {
        return passenger_count;
    }
    let fraction = policy.alighting_fraction.clamp(0.0, 1.0);
    let alighting = (f64::from(passenger_count) * fraction).round() as u32;
    alighting.min(passenger_count)
}

pub fn apply_arrival(
    passenger_count: u32,
    capacity: u32,
    waiting_count: u32,
    is_terminal: bool,
    policy: &FlowPolicy,
) -> Result<FlowOutcome, FlowError> {
    if capacity == 0 {
        return Err(FlowError::ZeroCapacity);
    }
    if passenger_count > capacity {
        return Err(FlowError::OverCapacity {
            passenger_count,
            capacity,
        });
    }

    let alighting = alighting_for(passenger_count, is_terminal, policy);
    if alighting > passenger_count {
        return Err(FlowError::AlightingExceedsLoad {
            alighting,
            passenger_count,
        });
    }

    let remaining = passenger_count - alighting;
    let available_capacity = capacity - remaining;
    let boarding = waiting_count.min(available_capacity);
    let new_count = remaining + boarding;

    if new_count > capacity {
        return Err(FlowError::OverCapacity {
            passenger_count: new_count,
            capacity,
        });
    }

    Ok(FlowOutcome {
        alighting,
        boarding,
        passenger_count: new_count,
        waiting_count: waiting_count.saturating_sub(boarding),
    })
}
