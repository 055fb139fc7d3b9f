pub mod cli;
pub mod config;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod sheet;
pub mod telemetry;
pub mod transport;
