use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::pool::Connection;

/// Load balancing strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Cursor advancing over the eligible idle set
    RoundRobin,
    /// Fewest borrows on multiplexing backends, first idle otherwise
    LeastConnections,
    /// Random pick biased by response time and error history
    Weighted,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastConnections => "least-connections",
            Strategy::Weighted => "weighted",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" | "round_robin" => Ok(Strategy::RoundRobin),
            "least-connections" | "least_connections" => Ok(Strategy::LeastConnections),
            "weighted" => Ok(Strategy::Weighted),
            other => Err(format!("unknown load balancing strategy: {}", other)),
        }
    }
}

/// Static weight of a connection for weighted selection
///
/// Fast, error-free connections score up to 110; a connection slower than
/// 100ms with 10+ errors scores zero.
pub fn connection_weight(connection: &Connection) -> u64 {
    let response_ms = connection.response_time.as_millis() as u64;
    let response_weight = 100u64.saturating_sub(response_ms);
    let error_weight = 10u64.saturating_sub(connection.error_count as u64);
    response_weight + error_weight
}

/// Picks which idle connection of a pool is lent out next
///
/// Lives inside the pool state, so the cursor is only advanced by the lock
/// holder.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    strategy: Strategy,
    /// Counter for round-robin selection
    cursor: usize,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy, cursor: 0 }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
    }

    /// Select an available (idle, not unhealthy) connection.
    /// Returns its index in `connections`.
    pub fn select(&mut self, connections: &[Connection]) -> Option<usize> {
        self.select_with_rng(connections, &mut rand::thread_rng())
    }

    pub fn select_with_rng<R: Rng>(&mut self, connections: &[Connection], rng: &mut R) -> Option<usize> {
        let candidates: Vec<usize> = connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_available())
            .map(|(idx, _)| idx)
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let picked = match self.strategy {
            Strategy::RoundRobin => self.select_round_robin(&candidates),
            Strategy::LeastConnections => Self::select_least_connections(connections, &candidates),
            Strategy::Weighted => Self::select_weighted(connections, &candidates, rng),
        };
        Some(picked)
    }

    fn select_round_robin(&mut self, candidates: &[usize]) -> usize {
        let index = candidates[self.cursor % candidates.len()];
        self.cursor = self.cursor.wrapping_add(1);
        index
    }

    fn select_least_connections(connections: &[Connection], candidates: &[usize]) -> usize {
        let first = candidates[0];
        if !connections[first].backend_type().supports_multiplexing() {
            return first;
        }
        candidates
            .iter()
            .copied()
            .min_by_key(|&idx| connections[idx].use_count)
            .unwrap_or(first)
    }

    fn select_weighted<R: Rng>(connections: &[Connection], candidates: &[usize], rng: &mut R) -> usize {
        let weights: Vec<u64> = candidates
            .iter()
            .map(|&idx| connection_weight(&connections[idx]))
            .collect();
        let total: u64 = weights.iter().sum();
        if total == 0 {
            return candidates[0];
        }

        let mut point = rng.gen_range(0..total);
        for (pos, weight) in weights.iter().enumerate() {
            if point < *weight {
                return candidates[pos];
            }
            point -= weight;
        }
        candidates[0]
    }
}
