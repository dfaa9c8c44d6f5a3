use std::time::Duration;

use super::connector::ConnectorError;

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool already exists: {0}")]
    DuplicatePool(String),

    #[error("Pool not found: {0}")]
    UnknownPool(String),

    #[error("Timed out after {waited:?} waiting for a connection from pool: {pool}")]
    AcquireTimeout { pool: String, waited: Duration },

    #[error("Circuit breaker is open for pool {pool}, retry in {retry_in:?}")]
    CircuitOpen { pool: String, retry_in: Duration },

    #[error("Failed to create connection for pool {pool}: {source}")]
    ConnectionCreation {
        pool: String,
        #[source]
        source: ConnectorError,
    },

    #[error("Pool has been stopped: {0}")]
    PoolStopped(String),

    #[error("Pool is disabled: {0}")]
    PoolDisabled(String),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Errors a caller may reasonably retry later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PoolError::AcquireTimeout { .. }
                | PoolError::CircuitOpen { .. }
                | PoolError::ConnectionCreation { .. }
        )
    }
}
