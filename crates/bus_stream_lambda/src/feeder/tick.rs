//! The three tick shapes. Each turns one locked pass over the simulation
//! context into rows for its table and events for its topic.

use std::sync::Arc;
use std::time::Duration;

use bus_sim_core::context::{EntityResult, SimulationContext};
use bus_sim_core::error::SimulationError;
use bus_stream_core::contract::{StreamEvent, TimeSeriesRecord};
use chrono::{DateTime, Utc};

use super::records;
use super::FeederKind;

#[derive(Debug, Clone, PartialEq)]
pub struct EntityFailure {
    pub entity_id: String,
    pub error: SimulationError,
}

#[derive(Debug, Clone, Default)]
pub struct TickOutput {
    pub records: Vec<TimeSeriesRecord>,
    pub events: Vec<StreamEvent>,
    pub entities_ok: usize,
    pub failures: Vec<EntityFailure>,
}

impl TickOutput {
    /// Splits per-entity results, keeping successes for `on_ok`.
    fn collect<T>(&mut self, results: Vec<EntityResult<T>>, mut on_ok: impl FnMut(&mut Self, T)) {
        for result in results {
            match result.outcome {
                Ok(value) => {
                    self.entities_ok += 1;
                    on_ok(self, value);
                }
                Err(error) => self.failures.push(EntityFailure {
                    entity_id: result.entity_id,
                    error,
                }),
            }
        }
    }
}

/// Synchronous simulate step of one feeder. Runs while the shared context is locked.
pub trait TickSimulator: Send {
    fn kind(&self) -> FeederKind;

    fn simulate(
        &mut self,
        context: &mut SimulationContext,
        at: DateTime<Utc>,
        elapsed: Duration,
    ) -> TickOutput;
}

pub fn simulator_for(kind: FeederKind) -> Box<dyn TickSimulator> {
    match kind {
        FeederKind::Position => Box::new(PositionTick),
        FeederKind::PeopleCount => Box::new(PeopleCountTick),
        FeederKind::Sensor => Box::new(SensorTick),
    }
}

/// Movement plus passenger flow; emits a position event per bus and one per arrival.
#[derive(Debug, Default, Clone, Copy)]
pub struct PositionTick;

impl TickSimulator for PositionTick {
    fn kind(&self) -> FeederKind {
        FeederKind::Position
    }

    fn simulate(
        &mut self,
        context: &mut SimulationContext,
        at: DateTime<Utc>,
        elapsed: Duration,
    ) -> TickOutput {
        let catalog = Arc::clone(context.catalog());
        let results = context.advance_buses(at, elapsed.as_secs_f64());

        let mut output = TickOutput::default();
        output.collect(results, |output, tick| {
            output
                .records
                .push(records::bus_position_record(&catalog, &tick, at));
            output
                .events
                .push(records::bus_position_event(&catalog, &tick.state, at));
            for (ordinal, arrival) in tick.arrivals.iter().enumerate() {
                output.records.push(records::arrival_record(arrival, ordinal));
                output.events.push(records::arrival_event(arrival, ordinal));
            }
        });
        output
    }
}

/// Demand model over every stop; publishes only counts that changed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeopleCountTick;

impl TickSimulator for PeopleCountTick {
    fn kind(&self) -> FeederKind {
        FeederKind::PeopleCount
    }

    fn simulate(
        &mut self,
        context: &mut SimulationContext,
        at: DateTime<Utc>,
        elapsed: Duration,
    ) -> TickOutput {
        let results = context.update_demand(at, elapsed.as_secs_f64() / 60.0);

        let mut output = TickOutput::default();
        output.collect(results, |output, tick| {
            output
                .records
                .push(records::stop_people_count_record(&tick, at));
            if tick.update.waiting_count != tick.previous_count {
                output
                    .events
                    .extend(records::stop_people_count_events(&tick, at));
            }
        });
        output
    }
}

/// Ambient readings for every bus and stop. Bus readings are also published.
#[derive(Debug, Default, Clone, Copy)]
pub struct SensorTick;

impl TickSimulator for SensorTick {
    fn kind(&self) -> FeederKind {
        FeederKind::Sensor
    }

    fn simulate(
        &mut self,
        context: &mut SimulationContext,
        at: DateTime<Utc>,
        _elapsed: Duration,
    ) -> TickOutput {
        let bus_readings = context.bus_sensor_readings(at);
        let stop_readings = context.stop_sensor_readings(at);

        let mut output = TickOutput::default();
        output.collect(bus_readings, |output, reading| {
            output.records.push(records::bus_sensor_record(&reading, at));
            output.events.push(records::bus_sensor_event(&reading, at));
        });
        output.collect(stop_readings, |output, reading| {
            output
                .records
                .push(records::stop_sensor_record(&reading, at));
        });
        output
    }
}

#[cfg(test)]
mod tests {
    use bus_sim_core::test_helpers::{sample_catalog, TEST_SEED};
    use bus_stream_core::contract::StreamEventKind;
    use chrono::TimeZone;

    use super::*;

    fn context() -> SimulationContext {
        SimulationContext::with_seed(Arc::new(sample_catalog()), TEST_SEED)
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    #[test]
    fn simulator_matches_requested_kind() {
        for kind in FeederKind::ALL {
            assert_eq!(simulator_for(kind).kind(), kind);
        }
    }

    #[test]
    fn position_tick_emits_one_row_and_event_per_bus_plus_arrivals() {
        let mut context = context();
        let output = PositionTick.simulate(&mut context, at(), Duration::from_secs(300));

        assert_eq!(output.entities_ok, 3);
        assert!(output.failures.is_empty());
        let positions = output
            .events
            .iter()
            .filter(|e| e.kind == StreamEventKind::BusPositionChanged)
            .count();
        let arrivals = output
            .events
            .iter()
            .filter(|e| e.kind == StreamEventKind::BusArrivedAtStop)
            .count();
        assert_eq!(positions, 3);
        assert!(arrivals > 0, "five minutes should reach at least one stop");
        assert_eq!(output.records.len(), positions + arrivals);
    }

    #[test]
    fn position_tick_isolates_a_broken_bus() {
        let mut context = context();
        context.bus_mut("B3").expect("bus").line_id = "ghost".to_string();

        let output = PositionTick.simulate(&mut context, at(), Duration::from_secs(15));
        assert_eq!(output.entities_ok, 2);
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].entity_id, "B3");
        let persisted: Vec<&str> = output
            .records
            .iter()
            .filter(|r| r.measure_name == "bus_state")
            .filter_map(|r| r.dimension("bus_id"))
            .collect();
        assert_eq!(persisted, vec!["B1", "B2"]);
    }

    #[test]
    fn people_count_tick_writes_every_stop() {
        let mut context = context();
        let output = PeopleCountTick.simulate(&mut context, at(), Duration::from_secs(60));
        assert_eq!(output.entities_ok, 5);
        assert_eq!(output.records.len(), 5);
        assert!(output
            .events
            .iter()
            .all(|e| e.kind == StreamEventKind::StopPeopleCountChanged));
    }

    #[test]
    fn unchanged_counts_are_not_published() {
        let mut context = context();
        // Zero elapsed time means no new arrivals and no boardings.
        let output = PeopleCountTick.simulate(&mut context, at(), Duration::ZERO);
        assert_eq!(output.records.len(), 5);
        assert!(output.events.is_empty());
    }

    #[test]
    fn sensor_tick_covers_buses_and_stops() {
        let mut context = context();
        let output = SensorTick.simulate(&mut context, at(), Duration::from_secs(30));
        assert_eq!(output.entities_ok, 8);
        assert_eq!(output.records.len(), 8);
        assert_eq!(output.events.len(), 3);
    }

    #[test]
    fn door_opens_after_a_position_tick_reaches_a_stop() {
        let mut context = context();
        let moved = PositionTick.simulate(&mut context, at(), Duration::from_secs(300));
        let arrived: Vec<String> = moved
            .events
            .iter()
            .filter(|e| e.kind == StreamEventKind::BusPositionChanged)
            .filter(|e| !e.payload["at_stop"].is_null())
            .map(|e| e.subject_id.clone())
            .collect();
        assert!(!arrived.is_empty());

        let sensors = SensorTick.simulate(&mut context, at(), Duration::from_secs(30));
        for event in sensors.events {
            let door_open = event.payload["door_open"].as_bool().expect("door flag");
            assert_eq!(door_open, arrived.contains(&event.subject_id));
        }
    }
}
