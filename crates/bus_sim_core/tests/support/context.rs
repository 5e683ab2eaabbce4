#![allow(dead_code)]

use std::sync::Arc;

use bus_sim_core::catalog::Catalog;
use bus_sim_core::context::SimulationContext;
use bus_sim_core::test_helpers::{SAMPLE_CATALOG_JSON, TEST_SEED};
use serde_json::{json, Value};

/// Builder for reproducible simulation contexts on the sample network.
///
/// Speed is pinned to a single value by default so distances per tick are exact.
#[derive(Debug, Clone)]
pub struct TestContextBuilder {
    seed: u64,
    buses: Option<Value>,
    settings: Value,
}

impl Default for TestContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContextBuilder {
    pub fn new() -> Self {
        Self {
            seed: TEST_SEED,
            buses: None,
            settings: json!({
                "speed": {"min_kmh": 30.0, "max_kmh": 30.0}
            }),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Replace the sample fleet.
    pub fn with_buses(mut self, buses: Value) -> Self {
        self.buses = Some(buses);
        self
    }

    /// Merge a top-level settings section (e.g. `"demand"`).
    pub fn with_setting(mut self, section: &str, value: Value) -> Self {
        self.settings[section] = value;
        self
    }

    pub fn catalog(&self) -> Catalog {
        let mut document: Value =
            serde_json::from_str(SAMPLE_CATALOG_JSON).expect("sample catalog is valid JSON");
        if let Some(buses) = &self.buses {
            document["buses"] = buses.clone();
        }
        document["settings"] = self.settings.clone();
        Catalog::from_json_str(&document.to_string()).expect("test catalog should load")
    }

    pub fn build(&self) -> SimulationContext {
        SimulationContext::with_seed(Arc::new(self.catalog()), self.seed)
    }
}

/// Seconds needed to cover `km` at `kmh`.
pub fn secs_for_km(km: f64, kmh: f64) -> f64 {
    km / kmh * 3_600.0
}
