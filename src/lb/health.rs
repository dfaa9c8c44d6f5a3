use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::connector::with_timeout;
use crate::pool::{Connection, Connector, Pool};

/// Overall rating of a pool from its last health-check pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    Healthy,
    Degraded,
    Critical,
}

impl PoolHealth {
    /// Rate a pool by its share of healthy connections
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 0.8 {
            PoolHealth::Healthy
        } else if ratio >= 0.5 {
            PoolHealth::Degraded
        } else {
            PoolHealth::Critical
        }
    }
}

/// Outcome of probing one connection
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub connection_id: String,
    pub success: bool,
    pub response_time: Duration,
    pub error: Option<String>,
}

/// Summary of one health-check pass over a pool
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub pool: String,
    pub checked: usize,
    pub healthy: usize,
    pub total: usize,
    pub ratio: f64,
    pub health: PoolHealth,
}

/// Periodically probes the idle connections of one pool
pub struct HealthChecker {
    pool: Arc<Pool>,
}

impl HealthChecker {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }

    /// Start the health check background task.
    /// Runs until `token` is cancelled or the pool stops.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                pool = %self.pool.name(),
                interval_ms = self.pool.health_check_interval().as_millis() as u64,
                "Health checker started"
            );

            loop {
                // Re-read every cycle so config updates take effect
                let interval = self.pool.health_check_interval();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }

                let start = Instant::now();
                let report = tokio::select! {
                    _ = token.cancelled() => break,
                    report = self.check_pool() => report,
                };
                if report.is_none() {
                    break;
                }
                debug!(
                    pool = %self.pool.name(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Health check cycle completed"
                );
            }

            debug!(pool = %self.pool.name(), "Health checker exited");
        })
    }

    /// Probe every idle connection concurrently and fold the results back
    /// into the pool. Returns `None` when the pool has stopped.
    pub async fn check_pool(&self) -> Option<HealthReport> {
        let (targets, timeout) = self.pool.health_targets();
        let connector = self.pool.connector();

        let mut handles = Vec::with_capacity(targets.len());
        for connection in targets {
            let connector = Arc::clone(&connector);
            handles.push(tokio::spawn(async move {
                Self::check_connection(connector.as_ref(), &connection, timeout).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => warn!(pool = %self.pool.name(), error = %e, "Health probe task failed"),
            }
        }

        let report = self.pool.apply_health_results(&results)?;
        match report.health {
            PoolHealth::Healthy => debug!(
                pool = %report.pool,
                healthy = report.healthy,
                total = report.total,
                "Pool health check passed"
            ),
            health => warn!(
                pool = %report.pool,
                healthy = report.healthy,
                total = report.total,
                health = ?health,
                "Pool health degraded"
            ),
        }
        Some(report)
    }

    async fn check_connection(
        connector: &dyn Connector,
        connection: &Connection,
        timeout: Duration,
    ) -> HealthCheckResult {
        let start = Instant::now();
        let outcome = with_timeout(timeout, connector.probe(connection)).await;
        let response_time = start.elapsed();

        match outcome {
            Ok(()) => HealthCheckResult {
                connection_id: connection.id.clone(),
                success: true,
                response_time,
                error: None,
            },
            Err(e) => {
                debug!(
                    connection_id = %connection.id,
                    error = %e,
                    latency_ms = response_time.as_millis() as u64,
                    "Health probe failed"
                );
                HealthCheckResult {
                    connection_id: connection.id.clone(),
                    success: false,
                    response_time,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BackendType, ConnectorError, Endpoint, HealthStatus, PoolConfig, PoolError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct ProbeConnector {
        probe_fails: AtomicBool,
    }

    #[async_trait]
    impl Connector for ProbeConnector {
        async fn connect(&self, _connection_id: &str, _endpoint: &Endpoint) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn probe(&self, _connection: &Connection) -> Result<(), ConnectorError> {
            if self.probe_fails.load(Ordering::SeqCst) {
                Err(ConnectorError::Refused("probe rejected".to_string()))
            } else {
                Ok(())
            }
        }
    }

    async fn warm_pool(connector: Arc<ProbeConnector>, max_connection_errors: u32, threshold: u32) -> Arc<Pool> {
        let config = PoolConfig {
            min_connections: 2,
            max_connections: 4,
            max_connection_errors,
            circuit_breaker_threshold: threshold,
            ..Default::default()
        };
        let pool = Arc::new(
            Pool::new("health", Endpoint::default_for(BackendType::Postgres), config, connector).unwrap(),
        );
        pool.warm_up().await.unwrap();
        pool
    }

    #[test]
    fn test_health_rating() {
        assert_eq!(PoolHealth::from_ratio(1.0), PoolHealth::Healthy);
        assert_eq!(PoolHealth::from_ratio(0.8), PoolHealth::Healthy);
        assert_eq!(PoolHealth::from_ratio(0.5), PoolHealth::Degraded);
        assert_eq!(PoolHealth::from_ratio(0.49), PoolHealth::Critical);
    }

    #[tokio::test]
    async fn test_healthy_pass() {
        let pool = warm_pool(Arc::new(ProbeConnector::default()), 3, 100).await;
        let checker = HealthChecker::new(Arc::clone(&pool));

        let report = checker.check_pool().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.health, PoolHealth::Healthy);

        let stats = pool.stats();
        assert_eq!(stats.metrics.health_check_passed, 2);
        assert!(stats.last_health_check_ms.is_some());
    }

    #[tokio::test]
    async fn test_failing_probes_mark_connections_failed() {
        let connector = Arc::new(ProbeConnector::default());
        let pool = warm_pool(Arc::clone(&connector), 1, 100).await;
        let checker = HealthChecker::new(Arc::clone(&pool));
        connector.probe_fails.store(true, Ordering::SeqCst);

        // First failure only marks unhealthy
        let report = checker.check_pool().await.unwrap();
        assert_eq!(report.health, PoolHealth::Critical);
        assert!(pool
            .stats()
            .connections
            .iter()
            .all(|c| c.health == HealthStatus::Unhealthy));

        // Second crosses the ceiling; the reaper replaces them
        checker.check_pool().await.unwrap();
        assert_eq!(pool.stats().metrics.total, 0);

        connector.probe_fails.store(false, Ordering::SeqCst);
        let report = pool.run_maintenance().await.unwrap();
        assert_eq!(report.reaped_failed, 2);
        assert_eq!(report.replenished, 2);
        assert_eq!(pool.stats().metrics.health_check_failed, 4);
    }

    #[tokio::test]
    async fn test_failed_probes_open_circuit_without_traffic() {
        let connector = Arc::new(ProbeConnector::default());
        let pool = warm_pool(Arc::clone(&connector), 5, 2).await;
        let checker = HealthChecker::new(Arc::clone(&pool));
        connector.probe_fails.store(true, Ordering::SeqCst);

        checker.check_pool().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.circuit.state, "open");
        assert_eq!(stats.metrics.circuit_breaker_open, 1);
        assert_eq!(stats.metrics.acquired, 0);

        let result = pool.acquire(Duration::ZERO).await;
        assert!(matches!(result, Err(PoolError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_checker_stops_on_cancel() {
        let pool = warm_pool(Arc::new(ProbeConnector::default()), 3, 100).await;
        let checker = Arc::new(HealthChecker::new(pool));
        let token = CancellationToken::new();

        let handle = checker.start(token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("checker did not exit")
            .unwrap();
    }
}
