use thiserror::Error;

/// Fatal problems with the route/stop/bus description. Only raised at load time.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate line_id '{0}'")]
    DuplicateLine(String),
    #[error("duplicate bus_id '{0}'")]
    DuplicateBus(String),
    #[error("stop '{0}' is declared twice with different data")]
    ConflictingStop(String),
    #[error("line '{0}' must have at least two stops")]
    TooFewStops(String),
    #[error("stop '{stop_id}' has invalid field {field}: {reason}")]
    InvalidStop {
        stop_id: String,
        field: &'static str,
        reason: String,
    },
    #[error("bus '{bus_id}' is invalid: {reason}")]
    InvalidBus { bus_id: String, reason: String },
    #[error("bus '{bus_id}' references unknown line '{line_id}'")]
    UnknownLine { bus_id: String, line_id: String },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// Per-entity failure inside a tick. The orchestrator logs it and skips the entity.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("no route found for line '{line_id}' (bus '{bus_id}')")]
    UnknownLine { bus_id: String, line_id: String },
    #[error("unknown stop '{0}'")]
    UnknownStop(String),
    #[error("bus '{bus_id}' has malformed state: {reason}")]
    MalformedState { bus_id: String, reason: String },
    #[error("line '{0}' has zero total length")]
    DegenerateRoute(String),
    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// Violations detected by the passenger flow engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("capacity must be positive")]
    ZeroCapacity,
    #[error("passenger count {passenger_count} exceeds capacity {capacity}")]
    OverCapacity { passenger_count: u32, capacity: u32 },
    #[error("alighting {alighting} exceeds passenger count {passenger_count}")]
    AlightingExceedsLoad { alighting: u32, passenger_count: u32 },
}
