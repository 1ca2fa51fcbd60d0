pub mod telemetry;

pub use telemetry::{FlightMode, TelemetryState};
