//! Test helpers for common test setup and utilities.
//!
//! Shared fixtures so unit tests, integration tests and benchmarks build the
//! same small network.

use crate::catalog::Catalog;

pub const TEST_SEED: u64 = 42;

/// Two lines sharing stop S3. Stops are about 0.55 km apart.
///
/// ```text
/// L1: S1(T) - S2 - S3 - S4(T)
/// L2: S3 - S5(T)
/// ```
pub const SAMPLE_CATALOG_JSON: &str = r#"{
    "lines": [
        {"line_id": "L1", "name": "Riverside", "stops": [
            {"stop_id": "S1", "name": "North Depot", "latitude": 52.500, "longitude": 13.400, "is_terminal": true, "base_arrival_rate": 1.5},
            {"stop_id": "S2", "name": "Market Hall", "latitude": 52.505, "longitude": 13.400, "base_arrival_rate": 2.0},
            {"stop_id": "S3", "name": "Central", "latitude": 52.510, "longitude": 13.400, "base_arrival_rate": 3.0},
            {"stop_id": "S4", "name": "South Loop", "latitude": 52.515, "longitude": 13.400, "is_terminal": true, "base_arrival_rate": 1.0}
        ]},
        {"line_id": "L2", "name": "Harbour Shuttle", "stops": [
            {"stop_id": "S3", "name": "Central", "latitude": 52.510, "longitude": 13.400, "base_arrival_rate": 3.0},
            {"stop_id": "S5", "name": "Harbour", "latitude": 52.510, "longitude": 13.408, "is_terminal": true, "base_arrival_rate": 0.5}
        ]}
    ],
    "buses": [
        {"bus_id": "B1", "line_id": "L1", "capacity": 40},
        {"bus_id": "B2", "line_id": "L1", "capacity": 60, "initial_passengers": 12, "start_stop_index": 3, "direction": "reverse"},
        {"bus_id": "B3", "line_id": "L2", "capacity": 30, "initial_passengers": 5}
    ]
}"#;

/// Parse [`SAMPLE_CATALOG_JSON`].
///
/// # Panics
///
/// Panics if the fixture is invalid (should never happen).
pub fn sample_catalog() -> Catalog {
    Catalog::from_json_str(SAMPLE_CATALOG_JSON).expect("sample catalog should be valid")
}
