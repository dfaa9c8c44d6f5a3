use serde::Serialize;
use std::time::Duration;

use super::error::PoolError;
use crate::lb::Strategy;

/// Configuration for a single pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolConfig {
    /// Disabled pools reject acquisition
    pub enabled: bool,

    /// Minimum number of connections to keep warm
    pub min_connections: usize,

    /// Maximum number of live connections
    pub max_connections: usize,

    /// Idle time after which a connection above the minimum is reaped
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Deadline for a single connect attempt
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,

    /// Default wait for `acquire` when no timeout is given
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,

    /// Interval between health-check passes
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,

    /// Deadline for a single probe
    #[serde(with = "duration_ms")]
    pub health_check_timeout: Duration,

    /// Creation retries before surfacing a failure to the caller
    pub retry_attempts: u32,

    /// Base delay between creation retries, doubled per attempt
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,

    /// Consecutive failures that open the circuit
    pub circuit_breaker_threshold: u32,

    /// Time the circuit stays open before allowing trials
    #[serde(with = "duration_ms")]
    pub circuit_breaker_timeout: Duration,

    /// Concurrent trials allowed while half-open
    pub half_open_max_calls: u32,

    /// Consecutive probe failures a connection survives before it is failed
    pub max_connection_errors: u32,

    pub load_balancing_strategy: Strategy,

    /// Fail pool creation when warm-up cannot reach `min_connections`
    pub propagate_create_error: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_connections: 2,
            max_connections: 10,
            idle_timeout: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(2),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            max_connection_errors: 3,
            load_balancing_strategy: Strategy::RoundRobin,
            propagate_create_error: false,
        }
    }
}

impl PoolConfig {
    /// Check structural consistency
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfig(format!(
                "min_connections ({}) must not exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(PoolError::InvalidConfig(
                "circuit_breaker_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(PoolError::InvalidConfig(
                "half_open_max_calls must be at least 1".to_string(),
            ));
        }
        if self.health_check_interval.is_zero()
            || self.health_check_timeout.is_zero()
            || self.connection_timeout.is_zero()
        {
            return Err(PoolError::InvalidConfig(
                "health_check_interval, health_check_timeout and connection_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (0-based)
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Partial update applied on top of an existing [`PoolConfig`]
#[derive(Debug, Clone, Default)]
pub struct PoolConfigUpdate {
    pub enabled: Option<bool>,
    pub min_connections: Option<usize>,
    pub max_connections: Option<usize>,
    pub idle_timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
    pub acquire_timeout: Option<Duration>,
    pub health_check_interval: Option<Duration>,
    pub health_check_timeout: Option<Duration>,
    pub retry_attempts: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub circuit_breaker_threshold: Option<u32>,
    pub circuit_breaker_timeout: Option<Duration>,
    pub half_open_max_calls: Option<u32>,
    pub max_connection_errors: Option<u32>,
    pub load_balancing_strategy: Option<Strategy>,
    pub propagate_create_error: Option<bool>,
}

impl PoolConfigUpdate {
    /// Produce the merged configuration without touching `base`
    pub fn apply_to(&self, base: &PoolConfig) -> PoolConfig {
        let mut merged = base.clone();
        macro_rules! merge {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    merged.$field = value;
                })*
            };
        }
        merge!(
            enabled,
            min_connections,
            max_connections,
            idle_timeout,
            connection_timeout,
            acquire_timeout,
            health_check_interval,
            health_check_timeout,
            retry_attempts,
            retry_delay,
            circuit_breaker_threshold,
            circuit_breaker_timeout,
            half_open_max_calls,
            max_connection_errors,
            load_balancing_strategy,
            propagate_create_error
        );
        merged
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
