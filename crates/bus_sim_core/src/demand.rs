//! Demand generator and the waiting-count ledger.
//!
//! New arrivals at a stop follow a Poisson process whose mean is
//! `base_arrival_rate x time_of_day_multiplier x elapsed_minutes`. Arrivals
//! are counted by summing exponential inter-arrival gaps over the window.
//!
//! [`WaitingLedger`] is the single owner of every stop's waiting count. The
//! position feeder records boardings into it and the people-count feeder
//! folds them into the next demand update, so both act on one counter.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::catalog::{Catalog, Stop};
use crate::error::SimulationError;
use crate::settings::DemandPolicy;
use crate::state::ArrivalEvent;

/// Count events of a Poisson process with rate `rate_per_min` over `minutes`.
pub fn sample_arrivals(rate_per_min: f64, minutes: f64, rng: &mut impl Rng) -> u32 {
    if rate_per_min.is_nan() || rate_per_min <= 0.0 || minutes.is_nan() || minutes <= 0.0 {
        return 0;
    }
    let mut elapsed = 0.0;
    let mut count = 0u32;
    loop {
        let u: f64 = rng.gen();
        let u = u.max(1e-10); // Avoid log(0)
        elapsed += -u.ln() / rate_per_min;
        if elapsed > minutes {
            return count;
        }
        count = count.saturating_add(1);
    }
}

/// `max(0, previous + arrivals - boarded)`.
pub fn next_waiting_count(previous: u32, new_arrivals: u32, boarded: u32) -> u32 {
    previous.saturating_add(new_arrivals).saturating_sub(boarded)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemandUpdate {
    pub new_arrivals: u32,
    pub boarded: u32,
    pub waiting_count: u32,
    pub multiplier: f64,
}

#[derive(Debug, Clone)]
pub struct DemandGenerator {
    policy: DemandPolicy,
}

impl DemandGenerator {
    pub fn new(policy: DemandPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DemandPolicy {
        &self.policy
    }

    pub fn expected_arrivals(&self, stop: &Stop, at: DateTime<Utc>, elapsed_minutes: f64) -> f64 {
        stop.base_arrival_rate * self.policy.multiplier_at(at) * elapsed_minutes.max(0.0)
    }

    pub fn update(
        &self,
        stop: &Stop,
        at: DateTime<Utc>,
        previous: u32,
        boarded: u32,
        elapsed_minutes: f64,
        rng: &mut impl Rng,
    ) -> DemandUpdate {
        let multiplier = self.policy.multiplier_at(at);
        let rate = stop.base_arrival_rate * multiplier;
        let new_arrivals = sample_arrivals(rate, elapsed_minutes, rng);
        DemandUpdate {
            new_arrivals,
            boarded,
            waiting_count: next_waiting_count(previous, new_arrivals, boarded),
            multiplier,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StopDemandState {
    baseline: u32,
    boarded_since_baseline: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaitingLedger {
    stops: BTreeMap<String, StopDemandState>,
}

impl WaitingLedger {
    /// Seeds each stop with `base_arrival_rate x seed_waiting_minutes` people.
    pub fn seeded(catalog: &Catalog, policy: &DemandPolicy) -> Self {
        let stops = catalog
            .stops()
            .map(|stop| {
                let baseline =
                    (stop.base_arrival_rate * policy.seed_waiting_minutes.max(0.0)).round() as u32;
                (
                    stop.stop_id.clone(),
                    StopDemandState {
                        baseline,
                        boarded_since_baseline: 0,
                    },
                )
            })
            .collect();
        Self { stops }
    }

    pub fn stop_ids(&self) -> impl Iterator<Item = &str> {
        self.stops.keys().map(String::as_str)
    }

    /// Current count: last demand baseline minus everyone who boarded since.
    pub fn waiting(&self, stop_id: &str) -> Option<u32> {
        self.stops
            .get(stop_id)
            .map(|state| state.baseline.saturating_sub(state.boarded_since_baseline))
    }

    pub fn record_arrival(&mut self, event: &ArrivalEvent) -> Result<(), SimulationError> {
        let state = self
            .stops
            .get_mut(&event.stop_id)
            .ok_or_else(|| SimulationError::UnknownStop(event.stop_id.clone()))?;
        state.boarded_since_baseline = state
            .boarded_since_baseline
            .saturating_add(event.boarding_count);
        Ok(())
    }

    /// Baseline at the last demand tick, before subtracting recorded boardings.
    pub fn baseline(&self, stop_id: &str) -> Option<u32> {
        self.stops.get(stop_id).map(|state| state.baseline)
    }

    /// Hands the boardings recorded since the last baseline to the demand step and resets them.
    pub fn drain_boarded(&mut self, stop_id: &str) -> Result<u32, SimulationError> {
        let state = self
            .stops
            .get_mut(stop_id)
            .ok_or_else(|| SimulationError::UnknownStop(stop_id.to_string()))?;
        Ok(std::mem::take(&mut state.boarded_since_baseline))
    }

    pub fn set_baseline(&mut self, stop_id: &str, count: u32) -> Result<(), SimulationError> {
        let state = self
            .stops
            .get_mut(stop_id)
            .ok_or_else(|| SimulationError::UnknownStop(stop_id.to_string()))?;
        state.baseline = count;
        Ok(())
    }

    /// Replaces a stop's count with an already settled value; boardings recorded since the last baseline are discarded.
    pub fn restore(&mut self, stop_id: &str, count: u32) -> Result<(), SimulationError> {
        let state = self
            .stops
            .get_mut(stop_id)
            .ok_or_else(|| SimulationError::UnknownStop(stop_id.to_string()))?;
        state.baseline = count;
        state.boarded_since_baseline = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn stop(rate: f64) -> Stop {
        Stop {
            stop_id: "S1".to_string(),
            name: "Stop".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            is_terminal: false,
            base_arrival_rate: rate,
        }
    }

    fn arrival(stop_id: &str, boarding: u32) -> ArrivalEvent {
        ArrivalEvent {
            bus_id: "B1".to_string(),
            line_id: "L1".to_string(),
            stop_id: stop_id.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
            boarding_count: boarding,
            alighting_count: 0,
            bus_passenger_count: boarding,
            stop_waiting_count: 0,
        }
    }

    #[test]
    fn zero_window_produces_no_arrivals() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sample_arrivals(5.0, 0.0, &mut rng), 0);
        assert_eq!(sample_arrivals(0.0, 10.0, &mut rng), 0);
    }

    #[test]
    fn sampled_mean_tracks_rate() {
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 2_000;
        let total: u64 = (0..trials)
            .map(|_| u64::from(sample_arrivals(2.0, 3.0, &mut rng)))
            .sum();
        let mean = total as f64 / trials as f64;
        assert!((mean - 6.0).abs() < 0.4, "mean was {mean}");
    }

    #[test]
    fn waiting_count_never_goes_negative() {
        assert_eq!(next_waiting_count(3, 0, 10), 0);
        assert_eq!(next_waiting_count(3, 4, 2), 5);
    }

    #[test]
    fn rush_hour_expects_more_than_overnight() {
        let generator = DemandGenerator::new(DemandPolicy::default());
        let rush = Utc.with_ymd_and_hms(2026, 3, 2, 8, 15, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2026, 3, 2, 3, 15, 0).unwrap();
        assert!(
            generator.expected_arrivals(&stop(1.0), rush, 1.0)
                > generator.expected_arrivals(&stop(1.0), night, 1.0)
        );
    }

    #[test]
    fn update_subtracts_recorded_boardings() {
        let generator = DemandGenerator::new(DemandPolicy {
            hourly_multipliers: [0.0; 24],
            ..Default::default()
        });
        let mut rng = StdRng::seed_from_u64(7);
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let update = generator.update(
            &stop(2.0),
            at,
            10,
            5,
            1.0,
            &mut rng,
        );
        assert_eq!(update.new_arrivals, 0);
        assert_eq!(update.boarded, 5);
        assert_eq!(update.waiting_count, 5);
    }

    #[test]
    fn ledger_reflects_boardings_until_drained() {
        let mut ledger = WaitingLedger::default();
        ledger.stops.insert(
            "S1".to_string(),
            StopDemandState {
                baseline: 12,
                boarded_since_baseline: 0,
            },
        );
        ledger.record_arrival(&arrival("S1", 5)).expect("known stop");
        assert_eq!(ledger.waiting("S1"), Some(7));
        assert_eq!(ledger.baseline("S1"), Some(12));

        assert_eq!(ledger.drain_boarded("S1"), Ok(5));
        assert_eq!(ledger.waiting("S1"), Some(12));
        ledger.set_baseline("S1", 7).expect("known stop");
        assert_eq!(ledger.waiting("S1"), Some(7));
    }

    #[test]
    fn restore_discards_pending_boardings() {
        let mut ledger = WaitingLedger::default();
        ledger.stops.insert("S1".to_string(), StopDemandState::default());
        ledger.record_arrival(&arrival("S1", 3)).expect("known stop");

        ledger.restore("S1", 9).expect("known stop");
        assert_eq!(ledger.waiting("S1"), Some(9));
        assert_eq!(ledger.drain_boarded("S1"), Ok(0));
        assert!(ledger.restore("S9", 1).is_err());
    }

    #[test]
    fn ledger_state_stays_fixed_without_demand_ticks() {
        let mut ledger = WaitingLedger::default();
        ledger.stops.insert(
            "S1".to_string(),
            StopDemandState {
                baseline: 40,
                boarded_since_baseline: 0,
            },
        );
        let before = ledger.clone();
        for _ in 0..10_000 {
            ledger.record_arrival(&arrival("S1", 1)).expect("known stop");
        }
        assert_eq!(ledger.stops.len(), before.stops.len());
        assert_eq!(ledger.waiting("S1"), Some(0));
        assert_eq!(ledger.drain_boarded("S1"), Ok(10_000));
        assert_eq!(ledger.waiting("S1"), Some(40));
    }

    #[test]
    fn ledger_rejects_unknown_stop() {
        let mut ledger = WaitingLedger::default();
        assert_eq!(
            ledger.record_arrival(&arrival("nowhere", 1)),
            Err(SimulationError::UnknownStop("nowhere".to_string()))
        );
    }
}
