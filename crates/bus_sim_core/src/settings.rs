//! Tunable policy constants. All of them deserialize from the optional
//! `settings` block of a catalog file and fall back to the defaults below.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::patterns::STOP_DEMAND_PATTERN;

/// Fastest band a bus may be configured with.
pub const MAX_SPEED_KMH: f64 = 150.0;
/// Largest time-of-day multiplier accepted for the demand curve.
pub const MAX_DEMAND_MULTIPLIER: f64 = 10.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub flow: FlowPolicy,
    pub demand: DemandPolicy,
    pub speed: SpeedPolicy,
    pub sensors: SensorPolicy,
    /// Seed for every RNG owned by the simulation context. `None` = entropy.
    pub seed: Option<u64>,
}

impl SimulationSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.flow.alighting_fraction) {
            return Err(format!(
                "flow.alighting_fraction must be within [0, 1], got {}",
                self.flow.alighting_fraction
            ));
        }
        if self
            .demand
            .hourly_multipliers
            .iter()
            .any(|m| !(0.0..=MAX_DEMAND_MULTIPLIER).contains(m))
        {
            return Err(format!(
                "demand.hourly_multipliers must be within [0, {MAX_DEMAND_MULTIPLIER}]"
            ));
        }
        if !(0.0..=24.0 * 60.0).contains(&self.demand.seed_waiting_minutes) {
            return Err(format!(
                "demand.seed_waiting_minutes must be within [0, 1440], got {}",
                self.demand.seed_waiting_minutes
            ));
        }
        let band = self.speed.min_kmh..=self.speed.max_kmh;
        if !(self.speed.min_kmh > 0.0 && self.speed.max_kmh <= MAX_SPEED_KMH) || band.is_empty() {
            return Err(format!(
                "speed band must satisfy 0 < min_kmh <= max_kmh <= {MAX_SPEED_KMH}, got {}..{}",
                self.speed.min_kmh, self.speed.max_kmh
            ));
        }
        Ok(())
    }
}

/// Share of passengers leaving at a regular (non-terminal) stop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowPolicy {
    pub alighting_fraction: f64,
}

impl Default for FlowPolicy {
    fn default() -> Self {
        Self {
            alighting_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandPolicy {
    pub hourly_multipliers: [f64; 24],
    /// Offset applied to UTC to find the local hour used for the curve.
    pub utc_offset_minutes: i32,
    /// Initial waiting count = base_arrival_rate x this many minutes.
    pub seed_waiting_minutes: f64,
}

impl Default for DemandPolicy {
    fn default() -> Self {
        Self {
            hourly_multipliers: STOP_DEMAND_PATTERN,
            utc_offset_minutes: 0,
            seed_waiting_minutes: 2.0,
        }
    }
}

impl DemandPolicy {
    pub fn local_hour(&self, at: DateTime<Utc>) -> u32 {
        (at + Duration::minutes(i64::from(self.utc_offset_minutes))).hour()
    }

    /// Deterministic for a given clock time.
    pub fn multiplier_at(&self, at: DateTime<Utc>) -> f64 {
        self.hourly_multipliers[self.local_hour(at) as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedPolicy {
    pub min_kmh: f64,
    pub max_kmh: f64,
}

impl Default for SpeedPolicy {
    fn default() -> Self {
        Self {
            min_kmh: 15.0,
            max_kmh: 35.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorPolicy {
    pub base_temperature_c: f64,
    pub diurnal_amplitude_c: f64,
    pub base_humidity_pct: f64,
    pub base_co2_ppm: f64,
    pub co2_per_passenger_ppm: f64,
    pub base_noise_db: f64,
    pub base_pm25_ugm3: f64,
    /// Half-width of the uniform jitter applied to each reading.
    pub jitter: f64,
}

impl Default for SensorPolicy {
    fn default() -> Self {
        Self {
            base_temperature_c: 16.0,
            diurnal_amplitude_c: 6.0,
            base_humidity_pct: 60.0,
            base_co2_ppm: 420.0,
            co2_per_passenger_ppm: 18.0,
            base_noise_db: 58.0,
            base_pm25_ugm3: 12.0,
            jitter: 1.5,
        }
    }
}
