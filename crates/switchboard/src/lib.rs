//! Switchboard - Pluggable Message Bus
//!
//! This crate provides the bus runtime, including:
//! - Isolated handler activation in per-origin hosts (process or thread boundaries)
//! - Plugin discovery from `switchboard-plugin.toml` manifests
//! - Retry-aware handler resolution and parallel dispatch
//! - Transport contract with an in-memory implementation
//! - The start/stop controlled bus manager

// Re-export the shared handler/envelope crate
pub use switchboard_common as common;

// Bus configuration (switchboard.toml)
pub mod config;

// Isolation hosts, launchers and composable parts
pub mod isolation;

// Plugin discovery and composition
pub mod discovery;

// Handler contract and dispatch
pub mod handlers;

// Transport contract
pub mod transport;

// Bus manager
pub mod bus;

pub use bus::{BusError, BusManager, ConfigSource};
pub use config::BusConfig;
pub use handlers::{DispatchReport, Handler, HandlerManager};
