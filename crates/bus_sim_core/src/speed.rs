use rand::Rng;

use crate::settings::SpeedPolicy;

#[derive(Debug, Clone, Copy)]
pub struct SpeedFactors {
    pub multiplier: f64,
}

impl Default for SpeedFactors {
    fn default() -> Self {
        Self { multiplier: 1.0 }
    }
}

/// Samples a bus speed within a realistic urban band.
#[derive(Debug, Clone, Copy)]
pub struct SpeedModel {
    min_kmh: f64,
    max_kmh: f64,
}

impl SpeedModel {
    pub fn new(policy: &SpeedPolicy) -> Self {
        Self::with_range(policy.min_kmh, policy.max_kmh)
    }

    pub fn with_range(min_kmh: f64, max_kmh: f64) -> Self {
        let min_kmh = min_kmh.max(1.0);
        Self {
            min_kmh,
            max_kmh: max_kmh.max(min_kmh),
        }
    }

    pub fn sample_kmh(&self, rng: &mut impl Rng, factors: SpeedFactors) -> f64 {
        let base = rng.gen_range(self.min_kmh..=self.max_kmh);
        (base * factors.multiplier).max(1.0)
    }
}
