use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::lb::Strategy;
use crate::manager::ManagerConfig;
use crate::pool::{BackendType, Endpoint, PoolConfig};

/// Manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Interval of the reap / breaker / metrics cycle in milliseconds
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

fn default_reap_interval_ms() -> u64 {
    30_000
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            reap_interval_ms: default_reap_interval_ms(),
        }
    }
}

impl ManagerSettings {
    pub fn to_manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            reap_interval: Duration::from_millis(self.reap_interval_ms),
        }
    }
}

/// One named pool as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub backend_type: BackendType,

    /// Defaults to the standard host of the backend type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Defaults to the standard port of the backend type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    #[serde(default = "default_circuit_breaker_timeout_ms")]
    pub circuit_breaker_timeout_ms: u64,

    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,

    #[serde(default = "default_max_connection_errors")]
    pub max_connection_errors: u32,

    /// Load balancing strategy: round-robin, least-connections, weighted
    #[serde(default = "default_strategy")]
    pub load_balancing_strategy: Strategy,

    #[serde(default)]
    pub propagate_create_error: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_min_connections() -> usize {
    2
}

fn default_max_connections() -> usize {
    10
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_health_check_timeout_ms() -> u64 {
    2_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

fn default_max_connection_errors() -> u32 {
    3
}

fn default_strategy() -> Strategy {
    Strategy::RoundRobin
}

impl PoolSettings {
    /// Settings with every field at its default
    pub fn new(backend_type: BackendType) -> Self {
        Self {
            backend_type,
            host: None,
            port: None,
            database: None,
            enabled: default_enabled(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_timeout_ms: default_circuit_breaker_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
            max_connection_errors: default_max_connection_errors(),
            load_balancing_strategy: default_strategy(),
            propagate_create_error: false,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        let defaults = Endpoint::default_for(self.backend_type);
        Endpoint {
            backend_type: self.backend_type,
            host: self.host.clone().unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            database: self.database.clone().or(defaults.database),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            enabled: self.enabled,
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            health_check_timeout: Duration::from_millis(self.health_check_timeout_ms),
            retry_attempts: self.retry_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            circuit_breaker_threshold: self.circuit_breaker_threshold,
            circuit_breaker_timeout: Duration::from_millis(self.circuit_breaker_timeout_ms),
            half_open_max_calls: self.half_open_max_calls,
            max_connection_errors: self.max_connection_errors,
            load_balancing_strategy: self.load_balancing_strategy,
            propagate_create_error: self.propagate_create_error,
        }
    }

    /// Range checks for operator-supplied settings
    pub fn validate(&self, name: &str) -> Result<()> {
        check_range(name, "max_connections", self.max_connections as u64, 1, 100)?;
        check_range(name, "min_connections", self.min_connections as u64, 0, 50)?;
        check_range(name, "idle_timeout_ms", self.idle_timeout_ms, 10_000, 1_800_000)?;
        check_range(name, "connection_timeout_ms", self.connection_timeout_ms, 1_000, 60_000)?;
        check_range(name, "acquire_timeout_ms", self.acquire_timeout_ms, 1_000, 30_000)?;
        check_range(name, "health_check_interval_ms", self.health_check_interval_ms, 5_000, 300_000)?;
        check_range(name, "retry_attempts", self.retry_attempts as u64, 1, 10)?;
        check_range(name, "retry_delay_ms", self.retry_delay_ms, 100, 10_000)?;
        check_range(name, "circuit_breaker_threshold", self.circuit_breaker_threshold as u64, 1, 50)?;
        check_range(name, "circuit_breaker_timeout_ms", self.circuit_breaker_timeout_ms, 10_000, 600_000)?;

        self.pool_config()
            .validate()
            .with_context(|| format!("Pool '{}' has an inconsistent configuration", name))
    }
}

fn check_range(pool: &str, field: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        anyhow::bail!(
            "Pool '{}': {} = {} is out of range ({}..={})",
            pool,
            field,
            value,
            min,
            max
        );
    }
    Ok(())
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerSettings,

    /// Named pools, created in name order
    #[serde(default)]
    pub pools: BTreeMap<String, PoolSettings>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate every pool; an empty pool list is an error
    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            anyhow::bail!("No pools configured");
        }
        if self.manager.reap_interval_ms == 0 {
            anyhow::bail!("manager.reap_interval_ms must be greater than 0");
        }
        for (name, settings) in &self.pools {
            settings.validate(name)?;
        }
        Ok(())
    }
}

/// The stock pool set: postgres, redis and http
pub fn default_pools() -> BTreeMap<String, PoolSettings> {
    let postgres = PoolSettings {
        min_connections: 5,
        max_connections: 20,
        load_balancing_strategy: Strategy::LeastConnections,
        ..PoolSettings::new(BackendType::Postgres)
    };

    let redis = PoolSettings {
        min_connections: 3,
        max_connections: 15,
        idle_timeout_ms: 180_000,
        connection_timeout_ms: 5_000,
        acquire_timeout_ms: 3_000,
        health_check_interval_ms: 20_000,
        retry_delay_ms: 500,
        circuit_breaker_threshold: 3,
        circuit_breaker_timeout_ms: 30_000,
        ..PoolSettings::new(BackendType::Redis)
    };

    let http = PoolSettings {
        min_connections: 10,
        max_connections: 50,
        idle_timeout_ms: 120_000,
        connection_timeout_ms: 8_000,
        acquire_timeout_ms: 2_000,
        health_check_interval_ms: 60_000,
        retry_attempts: 2,
        retry_delay_ms: 2_000,
        circuit_breaker_threshold: 10,
        circuit_breaker_timeout_ms: 120_000,
        load_balancing_strategy: Strategy::Weighted,
        ..PoolSettings::new(BackendType::Http)
    };

    BTreeMap::from([
        ("postgres".to_string(), postgres),
        ("redis".to_string(), redis),
        ("http".to_string(), http),
    ])
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Starts from [`default_pools`] and applies overrides:
/// - POOLMGR_REAP_INTERVAL_MS
/// - POOLMGR_<POOL>_HOST / _PORT / _DATABASE
/// - POOLMGR_<POOL>_MIN_CONNECTIONS / _MAX_CONNECTIONS
/// - POOLMGR_<POOL>_STRATEGY
/// - POOLMGR_<POOL>_ENABLED
///
/// where `<POOL>` is POSTGRES, REDIS or HTTP.
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config {
        manager: ManagerSettings::default(),
        pools: default_pools(),
    };

    if let Some(interval) = env_parse::<u64>("POOLMGR_REAP_INTERVAL_MS")? {
        config.manager.reap_interval_ms = interval;
    }

    for (name, settings) in config.pools.iter_mut() {
        let prefix = format!("POOLMGR_{}", name.to_uppercase());

        if let Ok(host) = std::env::var(format!("{}_HOST", prefix)) {
            settings.host = Some(host);
        }
        if let Some(port) = env_parse::<u16>(&format!("{}_PORT", prefix))? {
            settings.port = Some(port);
        }
        if let Ok(database) = std::env::var(format!("{}_DATABASE", prefix)) {
            settings.database = Some(database);
        }
        if let Some(min) = env_parse::<usize>(&format!("{}_MIN_CONNECTIONS", prefix))? {
            settings.min_connections = min;
        }
        if let Some(max) = env_parse::<usize>(&format!("{}_MAX_CONNECTIONS", prefix))? {
            settings.max_connections = max;
        }
        if let Ok(strategy) = std::env::var(format!("{}_STRATEGY", prefix)) {
            settings.load_balancing_strategy = strategy
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("Invalid {}_STRATEGY", prefix))?;
        }
        if let Some(enabled) = env_parse::<bool>(&format!("{}_ENABLED", prefix))? {
            settings.enabled = enabled;
        }
    }

    Ok(config)
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        Err(_) => Ok(None),
    }
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise builds the default
/// pool set from environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
manager:
  reap_interval_ms: 10000

pools:
  orders:
    backend_type: postgres
    host: db.internal
    database: orders
    min_connections: 4
    max_connections: 12
    load_balancing_strategy: least-connections
  sessions:
    backend_type: redis
    idle_timeout_ms: 60000
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.manager.reap_interval_ms, 10_000);
        assert_eq!(config.pools.len(), 2);

        let orders = config.pools.get("orders").unwrap();
        let endpoint = orders.endpoint();
        assert_eq!(endpoint.host, "db.internal");
        assert_eq!(endpoint.port, 5432);
        assert_eq!(endpoint.database.as_deref(), Some("orders"));
        assert_eq!(orders.pool_config().load_balancing_strategy, Strategy::LeastConnections);

        let sessions = config.pools.get("sessions").unwrap();
        assert_eq!(sessions.endpoint().port, 6379);
        assert_eq!(sessions.pool_config().idle_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        let yaml = r#"
pools:
  minimal:
    backend_type: http
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let pool = config.pools.get("minimal").unwrap().pool_config();

        assert_eq!(pool, PoolConfig::default());
        assert_eq!(config.manager.reap_interval_ms, 30_000);
    }

    #[test]
    fn test_range_validation() {
        let mut settings = PoolSettings::new(BackendType::Redis);
        assert!(settings.validate("redis").is_ok());

        settings.max_connections = 101;
        let err = settings.validate("redis").unwrap_err();
        assert!(err.to_string().contains("max_connections"));

        settings.max_connections = 5;
        settings.min_connections = 6;
        assert!(settings.validate("redis").is_err());
    }

    #[test]
    fn test_default_pools_are_valid() {
        let config = Config {
            manager: ManagerSettings::default(),
            pools: default_pools(),
        };
        assert!(config.validate().is_ok());

        let http = config.pools.get("http").unwrap();
        assert_eq!(http.max_connections, 50);
        assert_eq!(http.endpoint().host, "api.external.com");
        assert_eq!(http.load_balancing_strategy, Strategy::Weighted);
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(Config::new().validate().is_err());
    }
}
