//! Performance benchmarks for bus_sim_core using Criterion.rs.

use std::sync::Arc;

use bus_sim_core::catalog::Catalog;
use bus_sim_core::context::SimulationContext;
use bus_sim_core::movement::advance;
use bus_sim_core::passenger_flow::apply_arrival;
use bus_sim_core::settings::FlowPolicy;
use bus_sim_core::state::BusState;
use bus_sim_core::test_helpers::{sample_catalog, TEST_SEED};
use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};

/// Sample network with `buses` buses spread over line L1.
fn fleet_catalog(buses: usize) -> Catalog {
    let mut document: Value = serde_json::from_str(bus_sim_core::test_helpers::SAMPLE_CATALOG_JSON)
        .expect("sample catalog is valid JSON");
    let fleet: Vec<Value> = (0..buses)
        .map(|i| {
            json!({
                "bus_id": format!("B{i}"),
                "line_id": "L1",
                "capacity": 60,
                "start_stop_index": i % 4,
            })
        })
        .collect();
    document["buses"] = Value::Array(fleet);
    Catalog::from_json_str(&document.to_string()).expect("fleet catalog should load")
}

fn bench_position_tick(c: &mut Criterion) {
    let at = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
    let mut group = c.benchmark_group("position_tick");
    for buses in [10usize, 100, 1_000] {
        let catalog = Arc::new(fleet_catalog(buses));
        group.bench_with_input(BenchmarkId::from_parameter(buses), &catalog, |b, catalog| {
            let mut context = SimulationContext::with_seed(Arc::clone(catalog), TEST_SEED);
            b.iter(|| black_box(context.advance_buses(at, 15.0)));
        });
    }
    group.finish();
}

fn bench_demand_tick(c: &mut Criterion) {
    let at = Utc.with_ymd_and_hms(2026, 3, 2, 17, 0, 0).unwrap();
    let mut context = SimulationContext::with_seed(Arc::new(sample_catalog()), TEST_SEED);
    c.bench_function("demand_tick", |b| {
        b.iter(|| black_box(context.update_demand(at, 1.0)))
    });
}

fn bench_movement_and_flow(c: &mut Criterion) {
    let catalog = sample_catalog();
    let route = catalog.route("L1").expect("L1");
    let bus = BusState::from_definition(&catalog.buses()[0], route);
    let policy = FlowPolicy::default();

    c.bench_function("advance_one_bus", |b| {
        b.iter(|| black_box(advance(&bus, route, 30.0, black_box(240.0))))
    });
    c.bench_function("apply_arrival", |b| {
        b.iter(|| black_box(apply_arrival(black_box(30), 40, black_box(20), false, &policy)))
    });
}

criterion_group!(
    benches,
    bench_position_tick,
    bench_demand_tick,
    bench_movement_and_flow
);
criterion_main!(benches);
