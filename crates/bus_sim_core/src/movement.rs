//! Movement simulator: advances a bus along its line and reports every stop
//! boundary crossed during the elapsed time.
//!
//! A single tick may cross several stops when the elapsed time is large
//! relative to the stop spacing. Reaching the last stop in the current
//! direction flips the direction and the bus continues from that terminal;
//! routes are never "finished". Passenger counts are not touched here.

use crate::catalog::Route;
use crate::error::SimulationError;
use crate::geo::interpolate;
use crate::state::BusState;

#[derive(Debug, Clone, PartialEq)]
pub struct StopCrossing {
    pub stop_index: usize,
    pub stop_id: String,
    pub is_terminal: bool,
    /// The bus turned around at this stop.
    pub reversed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    pub state: BusState,
    pub crossed: Vec<StopCrossing>,
    pub distance_km: f64,
}

pub fn advance(
    bus: &BusState,
    route: &Route,
    speed_kmh: f64,
    elapsed_secs: f64,
) -> Result<Advance, SimulationError> {
    if bus.line_id != route.line_id {
        return Err(SimulationError::MalformedState {
            bus_id: bus.bus_id.clone(),
            reason: format!(
                "bus runs on '{}' but was advanced on '{}'",
                bus.line_id, route.line_id
            ),
        });
    }
    bus.check(route)?;
    if route.length_km() <= 0.0 {
        return Err(SimulationError::DegenerateRoute(route.line_id.clone()));
    }

    let distance_km = (speed_kmh.max(0.0) * elapsed_secs.max(0.0)) / 3_600.0;
    let last = route.last_index();
    let mut state = bus.clone();
    state.speed_kmh = speed_kmh.max(0.0);
    let mut remaining = distance_km;
    let mut crossed = Vec::new();

    loop {
        let segment = segment_km(&state, route)?;
        let to_go = (segment - state.progress_km).max(0.0);
        if remaining < to_go {
            state.progress_km += remaining;
            break;
        }
        remaining -= to_go;

        let arrived = state.next_stop_index;
        let stop = &route.stops[arrived];
        state.previous_stop_index = arrived;
        state.progress_km = 0.0;
        let reversed = match state.direction.step(arrived, last) {
            Some(next) => {
                state.next_stop_index = next;
                false
            }
            None => {
                state.direction = state.direction.reversed();
                state.next_stop_index = state.direction.step(arrived, last).ok_or_else(|| {
                    SimulationError::MalformedState {
                        bus_id: bus.bus_id.clone(),
                        reason: "cannot turn around on a single-stop line".to_string(),
                    }
                })?;
                true
            }
        };
        crossed.push(StopCrossing {
            stop_index: arrived,
            stop_id: stop.stop_id.clone(),
            is_terminal: stop.is_terminal,
            reversed,
        });

        if remaining <= 0.0 {
            break;
        }
    }

    let segment = segment_km(&state, route)?;
    let fraction = if segment > 0.0 {
        state.progress_km / segment
    } else {
        0.0
    };
    state.position = interpolate(
        route.stops[state.previous_stop_index].location(),
        route.stops[state.next_stop_index].location(),
        fraction,
    );

    Ok(Advance {
        state,
        crossed,
        distance_km,
    })
}

fn segment_km(state: &BusState, route: &Route) -> Result<f64, SimulationError> {
    route
        .segment_km(state.previous_stop_index, state.next_stop_index)
        .ok_or_else(|| SimulationError::MalformedState {
            bus_id: state.bus_id.clone(),
            reason: format!(
                "no segment between stops {} and {}",
                state.previous_stop_index, state.next_stop_index
            ),
        })
}
