pub mod server;
pub mod telemetry;
