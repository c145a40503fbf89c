pub mod config;
pub mod error;
pub mod framing;
pub mod telemetry;
