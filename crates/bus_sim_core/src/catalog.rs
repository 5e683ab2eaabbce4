//! Route/stop/bus catalog.
//!
//! Loaded once per process from a JSON description and immutable afterwards.
//! Every validation problem is a [`CatalogError`]; there is nothing useful to
//! simulate without a valid catalog, so callers treat these as fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::geo::{haversine_km, LatLng};
use crate::settings::SimulationSettings;
use crate::state::Direction;

/// Busiest stop the demand model accepts, in people per minute.
pub const MAX_ARRIVAL_RATE_PER_MIN: f64 = 500.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub is_terminal: bool,
    /// People per minute arriving at the stop at a multiplier of 1.0.
    pub base_arrival_rate: f64,
}

impl Stop {
    pub fn location(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let invalid = |field: &'static str, reason: String| CatalogError::InvalidStop {
            stop_id: self.stop_id.clone(),
            field,
            reason,
        };
        if self.stop_id.trim().is_empty() {
            return Err(invalid("stop_id", "must be non-empty".to_string()));
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(invalid("latitude", format!("{} is out of range", self.latitude)));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(invalid(
                "longitude",
                format!("{} is out of range", self.longitude),
            ));
        }
        if !(self.base_arrival_rate > 0.0 && self.base_arrival_rate <= MAX_ARRIVAL_RATE_PER_MIN) {
            return Err(invalid(
                "base_arrival_rate",
                format!(
                    "must be within (0, {MAX_ARRIVAL_RATE_PER_MIN}], got {}",
                    self.base_arrival_rate
                ),
            ));
        }
        Ok(())
    }
}

/// A line: an ordered stop sequence traversed back and forth.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub line_id: String,
    pub name: String,
    pub stops: Vec<Stop>,
    segments_km: Vec<f64>,
}

impl Route {
    pub fn new(
        line_id: impl Into<String>,
        name: impl Into<String>,
        stops: Vec<Stop>,
    ) -> Result<Self, CatalogError> {
        let line_id = line_id.into();
        if stops.len() < 2 {
            return Err(CatalogError::TooFewStops(line_id));
        }
        for stop in &stops {
            stop.validate()?;
        }
        let segments_km = stops
            .windows(2)
            .map(|pair| haversine_km(pair[0].location(), pair[1].location()))
            .collect();
        Ok(Self {
            line_id,
            name: name.into(),
            stops,
            segments_km,
        })
    }

    pub fn last_index(&self) -> usize {
        self.stops.len() - 1
    }

    /// Distance between two adjacent stop indices, in either order.
    pub fn segment_km(&self, a: usize, b: usize) -> Option<f64> {
        let low = a.min(b);
        if a.abs_diff(b) != 1 {
            return None;
        }
        self.segments_km.get(low).copied()
    }

    pub fn length_km(&self) -> f64 {
        self.segments_km.iter().sum()
    }
}

/// Static definition a `BusState` is seeded from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusDefinition {
    pub bus_id: String,
    pub line_id: String,
    pub capacity: u32,
    #[serde(default)]
    pub initial_passengers: u32,
    #[serde(default)]
    pub start_stop_index: usize,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, Clone, Deserialize)]
struct LineFile {
    line_id: String,
    #[serde(default)]
    name: String,
    stops: Vec<Stop>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    lines: Vec<LineFile>,
    #[serde(default)]
    buses: Vec<BusDefinition>,
    #[serde(default)]
    settings: SimulationSettings,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    routes: BTreeMap<String, Route>,
    stops: BTreeMap<String, Stop>,
    buses: Vec<BusDefinition>,
    settings: SimulationSettings,
}

impl Catalog {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(text)?;
        let routes = file
            .lines
            .into_iter()
            .map(|line| Route::new(line.line_id, line.name, line.stops))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(routes, file.buses, file.settings)
    }

    pub fn new(
        routes: Vec<Route>,
        buses: Vec<BusDefinition>,
        settings: SimulationSettings,
    ) -> Result<Self, CatalogError> {
        settings.validate().map_err(CatalogError::InvalidSettings)?;

        let mut route_map = BTreeMap::new();
        let mut stop_map: BTreeMap<String, Stop> = BTreeMap::new();
        for route in routes {
            for stop in &route.stops {
                match stop_map.get(&stop.stop_id) {
                    Some(existing) if existing != stop => {
                        return Err(CatalogError::ConflictingStop(stop.stop_id.clone()));
                    }
                    Some(_) => {}
                    None => {
                        stop_map.insert(stop.stop_id.clone(), stop.clone());
                    }
                }
            }
            if route_map.contains_key(&route.line_id) {
                return Err(CatalogError::DuplicateLine(route.line_id));
            }
            route_map.insert(route.line_id.clone(), route);
        }

        let mut seen_buses = BTreeSet::new();
        for bus in &buses {
            if !seen_buses.insert(bus.bus_id.as_str()) {
                return Err(CatalogError::DuplicateBus(bus.bus_id.clone()));
            }
            let Some(route) = route_map.get(&bus.line_id) else {
                return Err(CatalogError::UnknownLine {
                    bus_id: bus.bus_id.clone(),
                    line_id: bus.line_id.clone(),
                });
            };
            if bus.capacity == 0 {
                return Err(CatalogError::InvalidBus {
                    bus_id: bus.bus_id.clone(),
                    reason: "capacity must be positive".to_string(),
                });
            }
            if bus.initial_passengers > bus.capacity {
                return Err(CatalogError::InvalidBus {
                    bus_id: bus.bus_id.clone(),
                    reason: format!(
                        "initial_passengers {} exceeds capacity {}",
                        bus.initial_passengers, bus.capacity
                    ),
                });
            }
            if bus.start_stop_index > route.last_index() {
                return Err(CatalogError::InvalidBus {
                    bus_id: bus.bus_id.clone(),
                    reason: format!(
                        "start_stop_index {} is outside line '{}'",
                        bus.start_stop_index, bus.line_id
                    ),
                });
            }
        }

        log::debug!(
            "catalog loaded: {} lines, {} stops, {} buses",
            route_map.len(),
            stop_map.len(),
            buses.len()
        );
        Ok(Self {
            routes: route_map,
            stops: stop_map,
            buses,
            settings,
        })
    }

    pub fn route(&self, line_id: &str) -> Option<&Route> {
        self.routes.get(line_id)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn stop(&self, stop_id: &str) -> Option<&Stop> {
        self.stops.get(stop_id)
    }

    pub fn stops(&self) -> impl Iterator<Item = &Stop> {
        self.stops.values()
    }

    pub fn buses(&self) -> &[BusDefinition] {
        &self.buses
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    /// Lines serving a stop, in line-id order.
    pub fn lines_serving(&self, stop_id: &str) -> Vec<&str> {
        self.routes
            .values()
            .filter(|route| route.stops.iter().any(|stop| stop.stop_id == stop_id))
            .map(|route| route.line_id.as_str())
            .collect()
    }
}
