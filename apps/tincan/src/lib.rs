pub mod config;
pub mod media;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;
