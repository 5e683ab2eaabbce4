mod support;

use bus_sim_core::state::Direction;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use support::context::TestContextBuilder;

/// 70 s at 30 km/h covers one 0.556 km stop spacing plus a little.
const ONE_STOP_SECS: f64 = 70.0;

fn at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
}

#[test]
fn regular_stop_boards_up_to_capacity() {
    let mut context = TestContextBuilder::new()
        .with_buses(json!([
            {"bus_id": "B1", "line_id": "L1", "capacity": 40, "initial_passengers": 30}
        ]))
        // S2 has base rate 2.0, so ten minutes of seeding leaves 20 waiting.
        .with_setting("demand", json!({"seed_waiting_minutes": 10.0}))
        .build();
    assert_eq!(context.waiting("S2"), Some(20));

    let tick = context.advance_bus("B1", at(), ONE_STOP_SECS).expect("advance");

    assert_eq!(tick.arrivals.len(), 1);
    let arrival = &tick.arrivals[0];
    assert_eq!(arrival.stop_id, "S2");
    assert_eq!(arrival.alighting_count, 6);
    assert_eq!(arrival.boarding_count, 16);
    assert_eq!(arrival.bus_passenger_count, 40);
    assert_eq!(arrival.stop_waiting_count, 4);
    assert_eq!(context.waiting("S2"), Some(4));
    assert_eq!(context.bus("B1").map(|b| b.passenger_count), Some(40));
}

#[test]
fn terminal_arrival_empties_bus_and_turns_around() {
    let mut context = TestContextBuilder::new()
        .with_buses(json!([
            {"bus_id": "B1", "line_id": "L1", "capacity": 40, "initial_passengers": 30, "start_stop_index": 2}
        ]))
        .with_setting("demand", json!({"seed_waiting_minutes": 10.0}))
        .build();
    // S4 has base rate 1.0.
    assert_eq!(context.waiting("S4"), Some(10));

    let tick = context.advance_bus("B1", at(), ONE_STOP_SECS).expect("advance");

    let arrival = &tick.arrivals[0];
    assert_eq!(arrival.stop_id, "S4");
    assert_eq!(arrival.alighting_count, 30);
    assert_eq!(arrival.boarding_count, 10);
    assert_eq!(arrival.bus_passenger_count, 10);
    assert_eq!(tick.state.direction, Direction::Reverse);
    assert_eq!(tick.state.next_stop_index, 2);
    assert_eq!(tick.state.at_stop.as_deref(), Some("S4"));

    let next = context.advance_bus("B1", at(), 10.0).expect("advance");
    assert!(next.arrivals.is_empty());
    assert_eq!(next.state.direction, Direction::Reverse);
    assert_eq!(next.state.at_stop, None);
}

#[test]
fn waiting_crowd_is_never_overdrawn_by_two_buses() {
    let mut context = TestContextBuilder::new()
        .with_buses(json!([
            {"bus_id": "B1", "line_id": "L1", "capacity": 40},
            {"bus_id": "B2", "line_id": "L1", "capacity": 40}
        ]))
        .build();
    let before = context.waiting("S2").expect("known stop");

    let first = context.advance_bus("B1", at(), ONE_STOP_SECS).expect("advance");
    let second = context.advance_bus("B2", at(), ONE_STOP_SECS).expect("advance");

    let boarded = first.arrivals[0].boarding_count + second.arrivals[0].boarding_count;
    assert_eq!(boarded, before);
    assert_eq!(second.arrivals[0].boarding_count, 0);
    assert_eq!(context.waiting("S2"), Some(0));
}

#[test]
fn passenger_and_waiting_invariants_hold_for_a_simulated_day() {
    let mut context = TestContextBuilder::new().with_seed(11).build();
    let start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
    for minute in 0..(24 * 60) {
        let now = start + chrono::Duration::minutes(minute);
        for result in context.advance_buses(now, 60.0) {
            result.outcome.expect("sample fleet is valid");
        }
        if minute % 2 == 0 {
            for result in context.update_demand(now, 2.0) {
                result.outcome.expect("sample stops are valid");
            }
        }
        for bus in context.buses() {
            assert!(bus.passenger_count <= bus.capacity, "{} overfull", bus.bus_id);
        }
    }
}
