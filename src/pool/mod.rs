//! Connection lifecycle and caching module
//!
//! This module provides:
//! - Serialized, fault-counting access to one automation server instance
//! - Error budget that permanently rejects calls after repeated failures
//! - Debounced idle teardown
//! - Per-target connection cache

pub mod circuit;
pub mod connection;
pub mod factory;
mod idle;

pub use circuit::{CircuitState, ErrorBudget};
pub use connection::{Connection, ConnectionId, ConnectionSettings, ConnectionState};
pub use factory::ConnectionFactory;
