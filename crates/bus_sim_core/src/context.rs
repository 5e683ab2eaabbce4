//! Explicit, owned simulation context.
//!
//! All mutable simulation state lives here and is passed to every step; there
//! is no module-level state, so several contexts can coexist in one process.
//! Steps return one [`EntityResult`] per bus or stop instead of aborting on
//! the first failure; the orchestrator decides what to log and persist.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::catalog::Catalog;
use crate::demand::{DemandGenerator, DemandUpdate, WaitingLedger};
use crate::error::SimulationError;
use crate::movement::advance;
use crate::passenger_flow::apply_arrival;
use crate::sensors::{BusSensorReading, SensorGenerator, StopSensorReading};
use crate::settings::SimulationSettings;
use crate::speed::{SpeedFactors, SpeedModel};
use crate::state::{ArrivalEvent, BusState};

/// Context shared by the feeders of one process. Lock only around the
/// synchronous simulate step.
pub type SharedContext = Arc<Mutex<SimulationContext>>;

#[derive(Debug, Clone, PartialEq)]
pub struct EntityResult<T> {
    pub entity_id: String,
    pub outcome: Result<T, SimulationError>,
}

impl<T> EntityResult<T> {
    fn new(entity_id: impl Into<String>, outcome: Result<T, SimulationError>) -> Self {
        Self {
            entity_id: entity_id.into(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusTick {
    pub state: BusState,
    pub arrivals: Vec<ArrivalEvent>,
    pub distance_km: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopTick {
    pub stop_id: String,
    pub line_ids: Vec<String>,
    pub previous_count: u32,
    pub update: DemandUpdate,
}

#[derive(Debug)]
pub struct SimulationContext {
    catalog: Arc<Catalog>,
    buses: BTreeMap<String, BusState>,
    ledger: WaitingLedger,
    settings: SimulationSettings,
    speed: SpeedModel,
    demand: DemandGenerator,
    sensors: SensorGenerator,
    rng: StdRng,
}

impl SimulationContext {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        let seed = catalog.settings().seed;
        Self::build(catalog, seed)
    }

    /// Overrides the catalog seed; used by tests and replays.
    pub fn with_seed(catalog: Arc<Catalog>, seed: u64) -> Self {
        Self::build(catalog, Some(seed))
    }

    fn build(catalog: Arc<Catalog>, seed: Option<u64>) -> Self {
        let settings = catalog.settings().clone();
        let buses = catalog
            .buses()
            .iter()
            .filter_map(|definition| {
                catalog
                    .route(&definition.line_id)
                    .map(|route| (definition.bus_id.clone(), BusState::from_definition(definition, route)))
            })
            .collect();
        let ledger = WaitingLedger::seeded(&catalog, &settings.demand);
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            speed: SpeedModel::new(&settings.speed),
            demand: DemandGenerator::new(settings.demand.clone()),
            sensors: SensorGenerator::new(settings.sensors),
            catalog,
            buses,
            ledger,
            settings,
            rng,
        }
    }

    pub fn into_shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    pub fn buses(&self) -> impl Iterator<Item = &BusState> {
        self.buses.values()
    }

    pub fn bus(&self, bus_id: &str) -> Option<&BusState> {
        self.buses.get(bus_id)
    }

    pub fn bus_mut(&mut self, bus_id: &str) -> Option<&mut BusState> {
        self.buses.get_mut(bus_id)
    }

    pub fn ledger(&self) -> &WaitingLedger {
        &self.ledger
    }

    pub fn waiting(&self, stop_id: &str) -> Option<u32> {
        self.ledger.waiting(stop_id)
    }

    /// Overwrites a stop's waiting count, e.g. from the last persisted people-count row.
    pub fn restore_waiting(&mut self, stop_id: &str, count: u32) -> Result<(), SimulationError> {
        self.ledger.restore(stop_id, count)
    }

    pub fn local_hour(&self, at: DateTime<Utc>) -> u32 {
        self.settings.demand.local_hour(at)
    }

    /// Moves one bus and applies passenger flow at every stop it reached.
    /// State is committed only if the whole step succeeds.
    pub fn advance_bus(
        &mut self,
        bus_id: &str,
        at: DateTime<Utc>,
        elapsed_secs: f64,
    ) -> Result<BusTick, SimulationError> {
        let bus = self
            .buses
            .get(bus_id)
            .cloned()
            .ok_or_else(|| SimulationError::MalformedState {
                bus_id: bus_id.to_string(),
                reason: "bus is not part of this context".to_string(),
            })?;
        let catalog = Arc::clone(&self.catalog);
        let route = catalog
            .route(&bus.line_id)
            .ok_or_else(|| SimulationError::UnknownLine {
                bus_id: bus.bus_id.clone(),
                line_id: bus.line_id.clone(),
            })?;

        let speed_kmh = self.speed.sample_kmh(&mut self.rng, SpeedFactors::default());
        let movement = advance(&bus, route, speed_kmh, elapsed_secs)?;

        let mut state = movement.state;
        let mut boarded_here: HashMap<&str, u32> = HashMap::new();
        let mut arrivals = Vec::with_capacity(movement.crossed.len());
        for crossing in &movement.crossed {
            let recorded = self
                .ledger
                .waiting(&crossing.stop_id)
                .ok_or_else(|| SimulationError::UnknownStop(crossing.stop_id.clone()))?;
            let already = boarded_here.get(crossing.stop_id.as_str()).copied().unwrap_or(0);
            let waiting = recorded.saturating_sub(already);

            let flow = apply_arrival(
                state.passenger_count,
                state.capacity,
                waiting,
                crossing.is_terminal,
                &self.settings.flow,
            )?;
            state.passenger_count = flow.passenger_count;
            *boarded_here.entry(crossing.stop_id.as_str()).or_insert(0) += flow.boarding;

            arrivals.push(ArrivalEvent {
                bus_id: state.bus_id.clone(),
                line_id: state.line_id.clone(),
                stop_id: crossing.stop_id.clone(),
                timestamp: at,
                boarding_count: flow.boarding,
                alighting_count: flow.alighting,
                bus_passenger_count: flow.passenger_count,
                stop_waiting_count: flow.waiting_count,
            });
        }
        debug_assert!(state.passenger_count <= state.capacity);

        state.at_stop = arrivals.last().map(|event| event.stop_id.clone());
        state.last_updated = Some(at);

        for event in &arrivals {
            self.ledger.record_arrival(event)?;
        }
        self.buses.insert(state.bus_id.clone(), state.clone());

        Ok(BusTick {
            state,
            arrivals,
            distance_km: movement.distance_km,
        })
    }

    pub fn advance_buses(
        &mut self,
        at: DateTime<Utc>,
        elapsed_secs: f64,
    ) -> Vec<EntityResult<BusTick>> {
        let ids: Vec<String> = self.buses.keys().cloned().collect();
        ids.into_iter()
            .map(|bus_id| {
                let outcome = self.advance_bus(&bus_id, at, elapsed_secs);
                EntityResult::new(bus_id, outcome)
            })
            .collect()
    }

    /// Applies the demand model to one stop, folding in boardings recorded since the last call.
    pub fn update_stop_demand(
        &mut self,
        stop_id: &str,
        at: DateTime<Utc>,
        elapsed_minutes: f64,
    ) -> Result<StopTick, SimulationError> {
        let catalog = Arc::clone(&self.catalog);
        let stop = catalog
            .stop(stop_id)
            .ok_or_else(|| SimulationError::UnknownStop(stop_id.to_string()))?;
        let previous_count = self
            .ledger
            .baseline(stop_id)
            .ok_or_else(|| SimulationError::UnknownStop(stop_id.to_string()))?;
        let boarded = self.ledger.drain_boarded(stop_id)?;
        let update = self.demand.update(
            stop,
            at,
            previous_count,
            boarded,
            elapsed_minutes,
            &mut self.rng,
        );
        self.ledger.set_baseline(stop_id, update.waiting_count)?;

        Ok(StopTick {
            stop_id: stop_id.to_string(),
            line_ids: catalog
                .lines_serving(stop_id)
                .into_iter()
                .map(str::to_string)
                .collect(),
            previous_count,
            update,
        })
    }

    pub fn update_demand(
        &mut self,
        at: DateTime<Utc>,
        elapsed_minutes: f64,
    ) -> Vec<EntityResult<StopTick>> {
        let ids: Vec<String> = self.ledger.stop_ids().map(str::to_string).collect();
        ids.into_iter()
            .map(|stop_id| {
                let outcome = self.update_stop_demand(&stop_id, at, elapsed_minutes);
                EntityResult::new(stop_id, outcome)
            })
            .collect()
    }

    pub fn bus_sensor_readings(&mut self, at: DateTime<Utc>) -> Vec<EntityResult<BusSensorReading>> {
        let hour = self.local_hour(at);
        let mut results = Vec::with_capacity(self.buses.len());
        for bus in self.buses.values() {
            let outcome = if bus.passenger_count > bus.capacity {
                Err(SimulationError::MalformedState {
                    bus_id: bus.bus_id.clone(),
                    reason: "passenger_count exceeds capacity".to_string(),
                })
            } else {
                Ok(self.sensors.bus_reading(bus, hour, &mut self.rng))
            };
            results.push(EntityResult::new(bus.bus_id.clone(), outcome));
        }
        results
    }

    pub fn stop_sensor_readings(
        &mut self,
        at: DateTime<Utc>,
    ) -> Vec<EntityResult<StopSensorReading>> {
        let hour = self.local_hour(at);
        let catalog = Arc::clone(&self.catalog);
        catalog
            .stops()
            .map(|stop| {
                let outcome = self
                    .ledger
                    .waiting(&stop.stop_id)
                    .ok_or_else(|| SimulationError::UnknownStop(stop.stop_id.clone()))
                    .map(|waiting| self.sensors.stop_reading(stop, waiting, hour, &mut self.rng));
                EntityResult::new(stop.stop_id.clone(), outcome)
            })
            .collect()
    }
}
