//! Connection handles and their lifecycle state
//!
//! A [`Connection`] is the opaque handle the pool lends out. It carries the
//! backend identity plus the telemetry the health checker, load balancer and
//! reaper base their decisions on. The pool keeps the authoritative copy;
//! callers receive a clone that is only meaningful for its id until it is
//! released.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Unique identifier for a pooled connection
pub type ConnectionId = String;

/// Kind of backend a pool talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Postgres,
    Redis,
    Http,
    External,
}

impl BackendType {
    /// Backends whose connections can carry several logical streams at once.
    ///
    /// Only these get true least-connections balancing; exclusive-use
    /// backends degenerate to first-idle selection.
    pub fn supports_multiplexing(&self) -> bool {
        matches!(self, BackendType::Http)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Postgres => "postgres",
            BackendType::Redis => "redis",
            BackendType::Http => "http",
            BackendType::External => "external",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(BackendType::Postgres),
            "redis" => Ok(BackendType::Redis),
            "http" | "https" => Ok(BackendType::Http),
            "external" => Ok(BackendType::External),
            other => Err(format!("unknown backend type: {}", other)),
        }
    }
}

/// Where a pool's connections point to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub backend_type: BackendType,
    pub host: String,
    pub port: u16,
    /// Logical database or namespace, if the backend has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl Endpoint {
    pub fn new(backend_type: BackendType, host: impl Into<String>, port: u16) -> Self {
        Self {
            backend_type,
            host: host.into(),
            port,
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Default endpoint for a backend type
    pub fn default_for(backend_type: BackendType) -> Self {
        match backend_type {
            BackendType::Postgres => Self::new(backend_type, "localhost", 5432),
            BackendType::Redis => Self::new(backend_type, "localhost", 6379),
            BackendType::Http => Self::new(backend_type, "api.external.com", 443),
            BackendType::External => Self::new(backend_type, "localhost", 80),
        }
    }

    /// `host:port` string suitable for socket connects
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Active,
    Failed,
    /// Terminal; the reaper drops these from the collection
    Destroyed,
}

/// Result of the most recent health observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// A pooled connection handle
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub endpoint: Endpoint,
    pub state: ConnectionState,
    pub health: HealthStatus,

    /// Creation time
    pub created_at: Instant,

    /// Last acquire or release
    pub last_used: Instant,

    /// Last observed round trip (connect or probe)
    pub response_time: Duration,

    /// Cumulative errors over the connection lifetime
    pub error_count: u32,

    /// Consecutive probe failures, reset on success
    pub error_streak: u32,

    /// Number of times this connection has been lent out
    pub use_count: u64,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, endpoint: Endpoint, response_time: Duration) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint,
            state: ConnectionState::Idle,
            health: HealthStatus::Healthy,
            created_at: now,
            last_used: now,
            response_time,
            error_count: 0,
            error_streak: 0,
            use_count: 0,
        }
    }

    pub fn backend_type(&self) -> BackendType {
        self.endpoint.backend_type
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::Idle
    }

    /// Idle and healthy enough to be lent out
    pub fn is_available(&self) -> bool {
        self.state == ConnectionState::Idle && self.health != HealthStatus::Unhealthy
    }

    /// Still occupies a slot in the pool
    pub fn is_live(&self) -> bool {
        matches!(self.state, ConnectionState::Idle | ConnectionState::Active)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn mark_active(&mut self) {
        self.state = ConnectionState::Active;
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = ConnectionState::Idle;
        self.last_used = Instant::now();
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.state = ConnectionState::Destroyed;
    }

    /// Record a successful probe
    pub(crate) fn record_probe_success(&mut self, response_time: Duration) {
        self.health = HealthStatus::Healthy;
        self.error_streak = 0;
        self.response_time = response_time;
    }

    /// Record a failed probe; returns true when the connection crossed the
    /// error ceiling and was moved to `Failed`
    pub(crate) fn record_probe_failure(&mut self, response_time: Duration, max_errors: u32) -> bool {
        self.health = HealthStatus::Unhealthy;
        self.error_count += 1;
        self.error_streak += 1;
        self.response_time = response_time;
        if self.error_streak > max_errors && self.state == ConnectionState::Idle {
            self.state = ConnectionState::Failed;
            return true;
        }
        false
    }

    /// Whether a released connection should be retired instead of reused
    pub(crate) fn should_retire(&self, max_errors: u32) -> bool {
        self.health == HealthStatus::Unhealthy || self.error_count > max_errors
    }

    pub fn snapshot(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            backend_type: self.endpoint.backend_type,
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            database: self.endpoint.database.clone(),
            state: self.state,
            health: self.health,
            age_ms: self.created_at.elapsed().as_millis() as u64,
            idle_ms: self.last_used.elapsed().as_millis() as u64,
            response_time_ms: self.response_time.as_millis() as u64,
            error_count: self.error_count,
            use_count: self.use_count,
        }
    }
}

/// Serializable view of a connection, used in pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub backend_type: BackendType,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub state: ConnectionState,
    pub health: HealthStatus,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub response_time_ms: u64,
    pub error_count: u32,
    pub use_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection() -> Connection {
        Connection::new(
            "pg_1".to_string(),
            Endpoint::default_for(BackendType::Postgres),
            Duration::from_millis(5),
        )
    }

    #[test]
    fn test_default_endpoints() {
        assert_eq!(Endpoint::default_for(BackendType::Postgres).address(), "localhost:5432");
        assert_eq!(Endpoint::default_for(BackendType::Redis).port, 6379);
        assert_eq!(Endpoint::default_for(BackendType::Http).host, "api.external.com");
        assert_eq!(Endpoint::default_for(BackendType::External).port, 80);
    }

    #[test]
    fn test_backend_type_parse() {
        assert_eq!("postgres".parse::<BackendType>(), Ok(BackendType::Postgres));
        assert_eq!("HTTP".parse::<BackendType>(), Ok(BackendType::Http));
        assert!("mysql".parse::<BackendType>().is_err());
        assert!(BackendType::Http.supports_multiplexing());
        assert!(!BackendType::Redis.supports_multiplexing());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut conn = test_connection();
        assert!(conn.is_available());

        conn.mark_active();
        assert_eq!(conn.state, ConnectionState::Active);
        assert_eq!(conn.use_count, 1);
        assert!(!conn.is_available());
        assert!(conn.is_live());

        conn.mark_idle();
        assert!(conn.is_available());

        conn.mark_destroyed();
        assert!(!conn.is_live());
        assert!(!conn.is_available());
    }

    #[test]
    fn test_probe_failures_cross_ceiling() {
        let mut conn = test_connection();

        assert!(!conn.record_probe_failure(Duration::from_millis(1), 2));
        assert!(!conn.record_probe_failure(Duration::from_millis(1), 2));
        assert_eq!(conn.health, HealthStatus::Unhealthy);
        assert!(!conn.is_available());

        // Third consecutive failure exceeds a ceiling of 2
        assert!(conn.record_probe_failure(Duration::from_millis(1), 2));
        assert_eq!(conn.state, ConnectionState::Failed);
        assert_eq!(conn.error_count, 3);
    }

    #[test]
    fn test_probe_success_resets_streak() {
        let mut conn = test_connection();
        conn.record_probe_failure(Duration::from_millis(1), 5);
        conn.record_probe_success(Duration::from_millis(7));

        assert_eq!(conn.health, HealthStatus::Healthy);
        assert_eq!(conn.error_streak, 0);
        assert_eq!(conn.error_count, 1);
        assert_eq!(conn.response_time, Duration::from_millis(7));
        assert!(!conn.should_retire(3));
    }
}
