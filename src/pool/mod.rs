//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - Per-backend pools with bounded capacity and FIFO waiting
//! - Circuit breaker pattern for fault tolerance
//! - Idle reaping and replenishment toward a configured minimum
//! - The [`Connector`] seam through which backends are reached

pub mod circuit;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod lifecycle;
pub mod metrics;

pub use circuit::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats};
pub use config::{PoolConfig, PoolConfigUpdate};
pub use connection::{
    BackendType, Connection, ConnectionId, ConnectionInfo, ConnectionState, Endpoint, HealthStatus,
};
pub use connector::{Connector, ConnectorError, TcpConnector};
pub use error::PoolError;
pub use lifecycle::{MaintenanceReport, Pool};
pub use metrics::{ConnectionMetrics, ManagerSummary, PoolCounters, PoolStats};
