//! Pool manager
//!
//! [`PoolManager`] is the entry point: it owns every named [`Pool`], routes
//! calls to them by name and runs their background tasks.
//!
//! - Pools are created eagerly with `min_connections` warm connections
//! - The registry lock is never held while a pool suspends
//! - `stop` cancels all tasks and leaves every pool in its terminal state

pub mod scheduler;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::pool::{
    BackendType, Connection, Connector, Endpoint, ManagerSummary, Pool, PoolConfig, PoolConfigUpdate, PoolError,
    PoolStats, TcpConnector,
};
pub use scheduler::Scheduler;

/// Manager-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Interval of the reap / breaker / metrics cycle
    pub reap_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.reap_interval.is_zero() {
            return Err(PoolError::InvalidConfig("reap_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

pub struct PoolManager {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    connectors: HashMap<BackendType, Arc<dyn Connector>>,
    default_connector: Arc<dyn Connector>,
    config: ManagerConfig,
    scheduler: Scheduler,
    stopped: AtomicBool,
}

impl PoolManager {
    /// Create a manager that reaches every backend over plain TCP
    pub fn new(config: ManagerConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: ManagerConfig) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            connectors: HashMap::new(),
            default_connector: Arc::new(TcpConnector::new()),
            config,
            scheduler: Scheduler::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Use `connector` for every backend type without a specific one
    pub fn with_default_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.default_connector = connector;
        self
    }

    /// Use `connector` for pools of `backend_type`
    pub fn with_connector(mut self, backend_type: BackendType, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(backend_type, connector);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn connector_for(&self, backend_type: BackendType) -> Arc<dyn Connector> {
        self.connectors
            .get(&backend_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_connector))
    }

    /// Create a pool against the default endpoint of `backend_type`
    pub async fn create_pool(
        &self,
        name: &str,
        backend_type: BackendType,
        config: PoolConfig,
    ) -> Result<Arc<Pool>, PoolError> {
        self.create_pool_with_endpoint(name, Endpoint::default_for(backend_type), config)
            .await
    }

    /// Create, warm up and register a pool
    pub async fn create_pool_with_endpoint(
        &self,
        name: &str,
        endpoint: Endpoint,
        config: PoolConfig,
    ) -> Result<Arc<Pool>, PoolError> {
        if self.is_stopped() {
            return Err(PoolError::PoolStopped(name.to_string()));
        }
        if self.pools.read().await.contains_key(name) {
            return Err(PoolError::DuplicatePool(name.to_string()));
        }

        let connector = self.connector_for(endpoint.backend_type);
        let pool = Arc::new(Pool::new(name, endpoint, config, connector)?);

        if let Err(e) = pool.warm_up().await {
            warn!(pool = %name, error = %e, "Pool creation aborted");
            pool.stop().await;
            return Err(e);
        }

        let rejected = {
            let mut pools = self.pools.write().await;
            if self.is_stopped() {
                Some(PoolError::PoolStopped(name.to_string()))
            } else if pools.contains_key(name) {
                Some(PoolError::DuplicatePool(name.to_string()))
            } else {
                pools.insert(name.to_string(), Arc::clone(&pool));
                self.scheduler.schedule_pool(Arc::clone(&pool), self.config.reap_interval);
                None
            }
        };
        if let Some(e) = rejected {
            pool.stop().await;
            return Err(e);
        }

        let stats = pool.stats();
        info!(
            pool = %name,
            backend = %stats.backend_type,
            endpoint = %stats.endpoint.address(),
            connections = stats.metrics.total,
            "Pool created"
        );
        Ok(pool)
    }

    /// Look up a pool; the registry lock is released before returning
    pub async fn get_pool(&self, name: &str) -> Result<Arc<Pool>, PoolError> {
        self.pools
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownPool(name.to_string()))
    }

    /// Borrow a connection, waiting at most `timeout`; zero fails fast
    pub async fn acquire_connection(&self, pool: &str, timeout: Duration) -> Result<Connection, PoolError> {
        let pool = self.get_pool(pool).await?;
        pool.acquire(timeout).await
    }

    /// Borrow a connection using the pool's configured acquire timeout
    pub async fn acquire(&self, pool: &str) -> Result<Connection, PoolError> {
        let pool = self.get_pool(pool).await?;
        let timeout = pool.config().acquire_timeout;
        pool.acquire(timeout).await
    }

    /// Return a connection; never fails
    pub async fn release_connection(&self, pool: &str, connection_id: &str) {
        match self.get_pool(pool).await {
            Ok(pool) => pool.release(connection_id).await,
            Err(_) => warn!(pool = %pool, connection_id = %connection_id, "Release against unknown pool ignored"),
        }
    }

    pub async fn get_stats(&self, pool: &str) -> Result<PoolStats, PoolError> {
        Ok(self.get_pool(pool).await?.stats())
    }

    pub async fn get_all_stats(&self) -> BTreeMap<String, PoolStats> {
        self.snapshot()
            .await
            .into_iter()
            .map(|pool| (pool.name().to_string(), pool.stats()))
            .collect()
    }

    pub async fn summary(&self) -> ManagerSummary {
        let stats = self.get_all_stats().await;
        ManagerSummary::from_stats(stats.values())
    }

    /// Validate and apply a partial config update
    pub async fn update_pool_config(
        &self,
        pool: &str,
        update: &PoolConfigUpdate,
    ) -> Result<PoolConfig, PoolError> {
        self.get_pool(pool).await?.update_config(update)
    }

    pub async fn reset_circuit(&self, pool: &str) -> Result<(), PoolError> {
        self.get_pool(pool).await?.reset_circuit();
        Ok(())
    }

    pub async fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn snapshot(&self) -> Vec<Arc<Pool>> {
        self.pools.read().await.values().cloned().collect()
    }

    /// Stop every pool and background task. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping pool manager");

        self.scheduler.shutdown().await;

        let pools = self.snapshot().await;
        for pool in &pools {
            pool.stop().await;
        }
        info!(pools = pools.len(), "Pool manager stopped");
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::build(ManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectorError;
    use async_trait::async_trait;

    struct NoopConnector;

    #[async_trait]
    impl Connector for NoopConnector {
        async fn connect(&self, _connection_id: &str, _endpoint: &Endpoint) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn probe(&self, _connection: &Connection) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    fn manager() -> PoolManager {
        PoolManager::default().with_default_connector(Arc::new(NoopConnector))
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let manager = manager();
        manager
            .create_pool("cache", BackendType::Redis, PoolConfig::default())
            .await
            .unwrap();

        let stats = manager.get_stats("cache").await.unwrap();
        assert_eq!(stats.metrics.idle, 2);
        assert_eq!(stats.endpoint.port, 6379);
        assert_eq!(manager.pool_names().await, vec!["cache".to_string()]);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown() {
        let manager = manager();
        manager
            .create_pool("db", BackendType::Postgres, PoolConfig::default())
            .await
            .unwrap();

        let dup = manager
            .create_pool("db", BackendType::Postgres, PoolConfig::default())
            .await;
        assert!(matches!(dup, Err(PoolError::DuplicatePool(_))));

        let unknown = manager.acquire_connection("nope", Duration::ZERO).await;
        assert!(matches!(unknown, Err(PoolError::UnknownPool(_))));

        // Unknown pools are a warning on release, not an error
        manager.release_connection("nope", "x").await;
        manager.stop().await;
    }

    #[test]
    fn test_zero_reap_interval_rejected() {
        let result = PoolManager::new(ManagerConfig {
            reap_interval: Duration::ZERO,
        });
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
        assert!(PoolManager::new(ManagerConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = manager();
        manager
            .create_pool("api", BackendType::Http, PoolConfig::default())
            .await
            .unwrap();

        manager.stop().await;
        manager.stop().await;
        assert!(manager.is_stopped());

        let result = manager
            .create_pool("late", BackendType::Http, PoolConfig::default())
            .await;
        assert!(matches!(result, Err(PoolError::PoolStopped(_))));
    }
}
