//! Pool statistics
//!
//! [`ConnectionMetrics`] is recomputed from the connection collection plus the
//! append-only [`PoolCounters`] every time stats are read. Nothing here
//! mutates pool state.

use serde::Serialize;
use std::time::Duration;

use super::circuit::CircuitStats;
use super::config::PoolConfig;
use super::connection::{BackendType, Connection, ConnectionInfo, ConnectionState, Endpoint};
use crate::lb::PoolHealth;

/// Cumulative per-pool counters; only ever incremented
#[derive(Debug, Clone, Default)]
pub struct PoolCounters {
    pub created: u64,
    pub destroyed: u64,
    /// Failed creation attempts
    pub failed: u64,
    pub health_check_passed: u64,
    pub health_check_failed: u64,
    pub circuit_breaker_open: u64,
    pub load_balanced: u64,
    pub acquired: u64,
    pub acquire_timeouts: u64,
    pub total_acquire_time: Duration,
}

impl PoolCounters {
    pub fn record_acquire(&mut self, elapsed: Duration) {
        self.acquired += 1;
        self.total_acquire_time += elapsed;
    }
}

/// Point-in-time and cumulative metrics for one pool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionMetrics {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub created: u64,
    pub destroyed: u64,
    pub failed: u64,
    pub avg_acquire_time_ms: f64,
    pub avg_response_time_ms: f64,
    pub health_check_passed: u64,
    pub health_check_failed: u64,
    pub circuit_breaker_open: u64,
    pub load_balanced: u64,
    pub acquired: u64,
    pub acquire_timeouts: u64,
}

impl ConnectionMetrics {
    pub fn aggregate(connections: &[Connection], counters: &PoolCounters, waiting: usize) -> Self {
        let active = count_state(connections, ConnectionState::Active);
        let idle = count_state(connections, ConnectionState::Idle);

        let live: Vec<&Connection> = connections.iter().filter(|c| c.is_live()).collect();
        let avg_response_time_ms = if live.is_empty() {
            0.0
        } else {
            live.iter()
                .map(|c| c.response_time.as_secs_f64() * 1000.0)
                .sum::<f64>()
                / live.len() as f64
        };

        let avg_acquire_time_ms = if counters.acquired == 0 {
            0.0
        } else {
            counters.total_acquire_time.as_secs_f64() * 1000.0 / counters.acquired as f64
        };

        Self {
            total: active + idle,
            active,
            idle,
            waiting,
            created: counters.created,
            destroyed: counters.destroyed,
            failed: counters.failed,
            avg_acquire_time_ms,
            avg_response_time_ms,
            health_check_passed: counters.health_check_passed,
            health_check_failed: counters.health_check_failed,
            circuit_breaker_open: counters.circuit_breaker_open,
            load_balanced: counters.load_balanced,
            acquired: counters.acquired,
            acquire_timeouts: counters.acquire_timeouts,
        }
    }

    /// Percentage of passed health checks; 100 when nothing was checked yet
    pub fn health_check_pass_rate(&self) -> f64 {
        let checks = self.health_check_passed + self.health_check_failed;
        if checks == 0 {
            return 100.0;
        }
        self.health_check_passed as f64 / checks as f64 * 100.0
    }
}

fn count_state(connections: &[Connection], state: ConnectionState) -> usize {
    connections.iter().filter(|c| c.state == state).count()
}

/// Statistics snapshot for a pool, suitable for scraping
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub backend_type: BackendType,
    pub endpoint: Endpoint,
    pub config: PoolConfig,
    pub metrics: ConnectionMetrics,
    pub circuit: CircuitStats,
    pub health: PoolHealth,
    /// Milliseconds since the last completed health-check pass
    pub last_health_check_ms: Option<u64>,
    pub health_check_pass_rate: f64,
    pub stopped: bool,
    pub connections: Vec<ConnectionInfo>,
}

/// Aggregate over every pool of a manager
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerSummary {
    pub total_pools: usize,
    pub healthy_pools: usize,
    pub degraded_pools: usize,
    pub critical_pools: usize,
    pub total_connections: usize,
    pub active_connections: usize,
    pub waiting_callers: usize,
    pub open_circuit_breakers: usize,
}

impl ManagerSummary {
    pub fn from_stats<'a>(stats: impl IntoIterator<Item = &'a PoolStats>) -> Self {
        let mut summary = Self::default();
        for pool in stats {
            summary.total_pools += 1;
            match pool.health {
                PoolHealth::Healthy => summary.healthy_pools += 1,
                PoolHealth::Degraded => summary.degraded_pools += 1,
                PoolHealth::Critical => summary.critical_pools += 1,
            }
            summary.total_connections += pool.metrics.total;
            summary.active_connections += pool.metrics.active;
            summary.waiting_callers += pool.metrics.waiting;
            if pool.circuit.state == "open" {
                summary.open_circuit_breakers += 1;
            }
        }
        summary
    }
}
