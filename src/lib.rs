//! v77broker - Serialized, fault-tolerant access to a single-threaded automation server

pub mod bridge;
pub mod config;
pub mod core;
pub mod error;
pub mod pool;
pub mod target;

pub use crate::core::{Broker, UnitOfWork};
pub use config::BrokerConfig;
pub use error::{Error, ErrorKind, Result};
pub use pool::{Connection, ConnectionFactory, ConnectionSettings, ConnectionState};
pub use target::ConnectionTarget;
