//! Ambient sensor synthesis for buses and stops.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::Stop;
use crate::patterns::diurnal_temperature_factor;
use crate::settings::SensorPolicy;
use crate::state::BusState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSensorReading {
    pub bus_id: String,
    pub line_id: String,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub co2_ppm: f64,
    pub noise_db: f64,
    pub door_open: bool,
    pub passenger_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopSensorReading {
    pub stop_id: String,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub noise_db: f64,
    pub pm25_ugm3: f64,
    pub waiting_count: u32,
}

#[derive(Debug, Clone)]
pub struct SensorGenerator {
    policy: SensorPolicy,
}

impl SensorGenerator {
    pub fn new(policy: SensorPolicy) -> Self {
        Self { policy }
    }

    fn jitter(&self, rng: &mut impl Rng) -> f64 {
        if self.policy.jitter <= 0.0 {
            return 0.0;
        }
        rng.gen_range(-self.policy.jitter..=self.policy.jitter)
    }

    fn outdoor_temperature(&self, local_hour: u32) -> f64 {
        self.policy.base_temperature_c
            + self.policy.diurnal_amplitude_c * diurnal_temperature_factor(local_hour)
    }

    /// Door state follows `at_stop`: open while the bus stands at the stop it reached last tick.
    pub fn bus_reading(
        &self,
        bus: &BusState,
        local_hour: u32,
        rng: &mut impl Rng,
    ) -> BusSensorReading {
        let load = bus.occupancy_pct() / 100.0;
        let door_open = bus.at_stop.is_some();
        // Cabin is climate controlled: halfway between outdoor and 21 C.
        let cabin = (self.outdoor_temperature(local_hour) + 21.0) / 2.0 + load * 2.0;
        let noise_base = self.policy.base_noise_db + load * 8.0 + if door_open { 6.0 } else { 0.0 };

        BusSensorReading {
            bus_id: bus.bus_id.clone(),
            line_id: bus.line_id.clone(),
            temperature_c: cabin + self.jitter(rng),
            humidity_pct: (self.policy.base_humidity_pct + load * 15.0 + self.jitter(rng))
                .clamp(0.0, 100.0),
            co2_ppm: (self.policy.base_co2_ppm
                + f64::from(bus.passenger_count) * self.policy.co2_per_passenger_ppm
                + self.jitter(rng) * 10.0)
                .max(0.0),
            noise_db: (noise_base + self.jitter(rng)).max(0.0),
            door_open,
            passenger_count: bus.passenger_count,
        }
    }

    pub fn stop_reading(
        &self,
        stop: &Stop,
        waiting_count: u32,
        local_hour: u32,
        rng: &mut impl Rng,
    ) -> StopSensorReading {
        let crowd = f64::from(waiting_count).min(50.0) / 50.0;
        StopSensorReading {
            stop_id: stop.stop_id.clone(),
            temperature_c: self.outdoor_temperature(local_hour) + self.jitter(rng),
            humidity_pct: (self.policy.base_humidity_pct + self.jitter(rng) * 2.0).clamp(0.0, 100.0),
            noise_db: (self.policy.base_noise_db + crowd * 10.0 + self.jitter(rng)).max(0.0),
            pm25_ugm3: (self.policy.base_pm25_ugm3 + self.jitter(rng)).max(0.0),
            waiting_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::catalog::{BusDefinition, Route};
    use crate::state::Direction;

    fn bus(passengers: u32) -> BusState {
        let stops = ["A", "B"]
            .iter()
            .enumerate()
            .map(|(i, id)| Stop {
                stop_id: id.to_string(),
                name: id.to_string(),
                latitude: 0.0,
                longitude: i as f64 * 0.01,
                is_terminal: true,
                base_arrival_rate: 1.0,
            })
            .collect();
        let route = Route::new("L1", "L1", stops).expect("route");
        BusState::from_definition(
            &BusDefinition {
                bus_id: "B1".to_string(),
                line_id: "L1".to_string(),
                capacity: 40,
                initial_passengers: passengers,
                start_stop_index: 0,
                direction: Direction::Forward,
            },
            &route,
        )
    }

    fn quiet() -> SensorGenerator {
        SensorGenerator::new(SensorPolicy {
            jitter: 0.0,
            ..Default::default()
        })
    }

    #[test]
    fn door_is_open_only_at_a_stop() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut standing = bus(10);
        assert!(!quiet().bus_reading(&standing, 12, &mut rng).door_open);
        standing.at_stop = Some("B".to_string());
        assert!(quiet().bus_reading(&standing, 12, &mut rng).door_open);
    }

    #[test]
    fn co2_rises_with_passengers() {
        let mut rng = StdRng::seed_from_u64(1);
        let empty = quiet().bus_reading(&bus(0), 12, &mut rng);
        let full = quiet().bus_reading(&bus(40), 12, &mut rng);
        assert!(full.co2_ppm > empty.co2_ppm);
        assert_eq!(full.co2_ppm - empty.co2_ppm, 40.0 * SensorPolicy::default().co2_per_passenger_ppm);
    }

    #[test]
    fn readings_stay_in_physical_ranges() {
        let generator = SensorGenerator::new(SensorPolicy::default());
        let mut rng = StdRng::seed_from_u64(9);
        let stop = Stop {
            stop_id: "S".to_string(),
            name: "S".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            is_terminal: false,
            base_arrival_rate: 1.0,
        };
        for hour in 0..24 {
            let reading = generator.stop_reading(&stop, 80, hour, &mut rng);
            assert!((0.0..=100.0).contains(&reading.humidity_pct));
            assert!(reading.pm25_ugm3 >= 0.0);
            assert_eq!(reading.waiting_count, 80);
        }
    }
}
