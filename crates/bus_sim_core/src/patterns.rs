//! Time-of-day demand pattern for passengers arriving at stops.
//!
//! Multipliers are relative to a stop's `base_arrival_rate`. The curve is a
//! policy default; catalogs can override it through `DemandPolicy`.

/// Default hourly multipliers (index 0 = midnight, index 23 = 11 PM, local time).
pub const STOP_DEMAND_PATTERN: [f64; 24] = [
    0.2, // 12 AM - 1 AM
    0.2, // 1 AM - 2 AM
    0.2, // 2 AM - 3 AM
    0.2, // 3 AM - 4 AM
    0.2, // 4 AM - 5 AM
    0.2, // 5 AM - 6 AM
    0.8, // 6 AM - 7 AM
    2.5, // 7 AM - 8 AM (morning rush)
    3.0, // 8 AM - 9 AM (morning rush peak)
    1.4, // 9 AM - 10 AM
    1.0, // 10 AM - 11 AM
    1.0, // 11 AM - 12 PM
    1.2, // 12 PM - 1 PM
    1.0, // 1 PM - 2 PM
    1.0, // 2 PM - 3 PM
    1.1, // 3 PM - 4 PM
    1.5, // 4 PM - 5 PM
    2.8, // 5 PM - 6 PM (evening rush)
    3.2, // 6 PM - 7 PM (evening rush peak)
    1.6, // 7 PM - 8 PM
    1.0, // 8 PM - 9 PM
    0.7, // 9 PM - 10 PM
    0.5, // 10 PM - 11 PM
    0.3, // 11 PM - 12 AM
];

/// Ambient temperature offset per local hour, as a fraction of the diurnal amplitude.
/// Coldest just before dawn, warmest mid-afternoon.
pub fn diurnal_temperature_factor(hour: u32) -> f64 {
    let radians = (f64::from(hour % 24) - 9.0) / 24.0 * std::f64::consts::TAU;
    radians.sin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rush_hours_exceed_midday_and_overnight() {
        let overnight = STOP_DEMAND_PATTERN[3];
        let midday = STOP_DEMAND_PATTERN[11];
        for hour in [7, 8, 17, 18] {
            assert!(STOP_DEMAND_PATTERN[hour] > midday);
        }
        assert!(midday > overnight);
    }

    #[test]
    fn afternoon_is_warmer_than_dawn() {
        assert!(diurnal_temperature_factor(15) > diurnal_temperature_factor(4));
        assert!(diurnal_temperature_factor(15) > 0.9);
    }
}
