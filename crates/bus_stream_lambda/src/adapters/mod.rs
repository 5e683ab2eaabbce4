pub mod connections;
pub mod event_bus;
pub mod time_series;
pub mod transport;
