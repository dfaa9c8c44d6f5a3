//! Circuit breaker implementation for fault tolerance
//!
//! Each pool owns one breaker with three states:
//! - Closed: Normal operation, acquisitions are allowed
//! - Open: Backend has failed, acquisitions are rejected without touching it
//! - HalfOpen: Testing recovery, a bounded number of trials allowed
//!
//! Creation failures and health-check failures both count against the
//! breaker, so a string of failed probes opens it even with no traffic.
//! The breaker is plain data; the pool lock serializes access to it.

use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::config::PoolConfig;

/// Circuit breaker error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitError {
    #[error("Circuit breaker is open, retry in {0:?}")]
    CircuitOpen(Duration),

    #[error("Half-open circuit has reached maximum concurrent trials")]
    HalfOpenLimitReached,
}

impl CircuitError {
    /// Time until the breaker may let a request through again
    pub fn retry_in(&self) -> Duration {
        match self {
            CircuitError::CircuitOpen(retry_in) => *retry_in,
            CircuitError::HalfOpenLimitReached => Duration::ZERO,
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,

    /// Backend has failed - requests are rejected
    Open {
        /// When the circuit may transition to HalfOpen
        retry_at: Instant,

        /// Number of consecutive failures that caused the circuit to open
        failure_count: u32,
    },

    /// Testing recovery - limited requests allowed
    HalfOpen {
        /// Trials currently in flight
        trials: u32,
    },
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half-open",
        }
    }
}

/// How a request was let through the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, no bookkeeping needed
    Normal,
    /// Half-open trial; must end in a success, failure or `release_trial`
    Trial,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// How long to wait before transitioning from open to half-open
    pub timeout: Duration,

    /// Maximum number of concurrent trials in half-open state
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

impl From<&PoolConfig> for CircuitBreakerConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_threshold,
            timeout: config.circuit_breaker_timeout,
            half_open_max_calls: config.half_open_max_calls,
        }
    }
}

/// Per-pool circuit breaker state and statistics
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    config: CircuitBreakerConfig,

    /// Consecutive failure count (in Closed state)
    consecutive_failures: u32,

    total_successes: u64,
    total_failures: u64,

    last_failure: Option<Instant>,
    last_transition: Instant,

    /// Number of times the circuit has opened
    open_count: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            config,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            last_failure: None,
            last_transition: Instant::now(),
            open_count: 0,
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    pub fn open_count(&self) -> u64 {
        self.open_count
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, CircuitState::Closed)
    }

    /// Replace thresholds; the current state is kept
    pub fn update_config(&mut self, config: CircuitBreakerConfig) {
        self.config = config;
    }

    /// Move Open to HalfOpen once the retry deadline has passed.
    /// Returns true when a transition happened.
    pub fn evaluate(&mut self) -> bool {
        if let CircuitState::Open { retry_at, .. } = self.state {
            if Instant::now() >= retry_at {
                info!("Circuit transitioning from Open to HalfOpen");
                self.transition_to_half_open();
                return true;
            }
        }
        false
    }

    /// Check if a request is allowed
    pub fn check(&mut self) -> Result<Admission, CircuitError> {
        self.evaluate();

        match &mut self.state {
            CircuitState::Closed => Ok(Admission::Normal),

            CircuitState::Open { retry_at, .. } => Err(CircuitError::CircuitOpen(
                retry_at.saturating_duration_since(Instant::now()),
            )),

            CircuitState::HalfOpen { trials } => {
                if *trials >= self.config.half_open_max_calls {
                    Err(CircuitError::HalfOpenLimitReached)
                } else {
                    *trials += 1;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Give back a trial slot that ended without a verdict
    pub fn release_trial(&mut self, admission: Admission) {
        if admission != Admission::Trial {
            return;
        }
        if let CircuitState::HalfOpen { trials } = &mut self.state {
            *trials = trials.saturating_sub(1);
        }
    }

    /// Record a successful backend interaction
    pub fn record_success(&mut self) {
        self.total_successes += 1;

        match &self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }

            CircuitState::Open { .. } => {
                // Only a trial may close an open circuit
                debug!("Ignoring success recorded while circuit is Open");
            }

            CircuitState::HalfOpen { .. } => {
                info!("Circuit transitioning from HalfOpen to Closed");
                self.transition_to_closed();
            }
        }
    }

    /// Record a failed backend interaction. Returns true when this failure
    /// opened (or re-opened) the circuit.
    pub fn record_failure(&mut self) -> bool {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        let now = Instant::now();
        self.last_failure = Some(now);

        match &mut self.state {
            CircuitState::Closed => {
                debug!(
                    consecutive_failures = self.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Failure recorded in Closed state"
                );

                if self.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        consecutive_failures = self.consecutive_failures,
                        "Circuit transitioning from Closed to Open"
                    );
                    self.transition_to_open();
                    return true;
                }
                false
            }

            CircuitState::Open { retry_at, .. } => {
                // Timeout counts from the most recent failure
                *retry_at = now + self.config.timeout;
                false
            }

            CircuitState::HalfOpen { .. } => {
                warn!("Trial failed in HalfOpen state - reopening circuit");
                self.transition_to_open();
                true
            }
        }
    }

    /// Manually reset the circuit to closed
    pub fn reset(&mut self) {
        self.transition_to_closed();
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_transition = Instant::now();
    }

    fn transition_to_open(&mut self) {
        let retry_at = Instant::now() + self.config.timeout;
        self.state = CircuitState::Open {
            retry_at,
            failure_count: self.consecutive_failures,
        };
        self.open_count += 1;
        self.last_transition = Instant::now();
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen { trials: 0 };
        self.last_transition = Instant::now();
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state.name(),
            consecutive_failures: self.consecutive_failures,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            open_count: self.open_count,
            time_in_state_ms: self.last_transition.elapsed().as_millis() as u64,
            last_failure_ms: self.last_failure.map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub open_count: u64,
    pub time_in_state_ms: u64,
    /// Milliseconds since the last recorded failure
    pub last_failure_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout: Duration, half_open: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout,
            half_open_max_calls: half_open,
        })
    }

    #[test]
    fn test_circuit_closed_to_open() {
        let mut breaker = breaker(3, Duration::from_secs(1), 1);
        assert!(breaker.is_closed());

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());

        assert!(!breaker.is_closed());
        assert_eq!(breaker.open_count(), 1);
        assert!(matches!(breaker.check(), Err(CircuitError::CircuitOpen(_))));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let mut breaker = breaker(3, Duration::from_secs(1), 1);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_closed());
    }

    #[tokio::test]
    async fn test_circuit_half_open_to_closed() {
        let mut breaker = breaker(2, Duration::from_millis(100), 1);
        breaker.record_failure();
        breaker.record_failure();

        tokio::time::sleep(Duration::from_millis(150)).await;

        // First trial admitted, concurrent second rejected
        assert_eq!(breaker.check(), Ok(Admission::Trial));
        assert_eq!(breaker.check(), Err(CircuitError::HalfOpenLimitReached));

        breaker.record_success();
        assert!(breaker.is_closed());
        assert_eq!(breaker.check(), Ok(Admission::Normal));
    }

    #[tokio::test]
    async fn test_circuit_half_open_to_open() {
        let mut breaker = breaker(2, Duration::from_millis(100), 1);
        breaker.record_failure();
        breaker.record_failure();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(breaker.evaluate());
        assert_eq!(breaker.state().name(), "half-open");

        assert_eq!(breaker.check(), Ok(Admission::Trial));
        assert!(breaker.record_failure());
        assert_eq!(breaker.state().name(), "open");
        assert_eq!(breaker.open_count(), 2);
    }

    #[tokio::test]
    async fn test_release_trial_frees_slot() {
        let mut breaker = breaker(1, Duration::from_millis(50), 1);
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let admission = breaker.check().unwrap();
        assert_eq!(admission, Admission::Trial);
        breaker.release_trial(admission);
        assert_eq!(breaker.check(), Ok(Admission::Trial));
    }

    #[test]
    fn test_success_while_open_keeps_circuit_open() {
        let mut breaker = breaker(1, Duration::from_secs(10), 1);
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state().name(), "open");
    }

    #[test]
    fn test_manual_reset() {
        let mut breaker = breaker(1, Duration::from_secs(10), 1);
        breaker.record_failure();
        breaker.reset();
        assert!(breaker.is_closed());
        assert_eq!(breaker.stats().consecutive_failures, 0);
        assert_eq!(breaker.stats().open_count, 1);
    }

    #[test]
    fn test_circuit_state_names() {
        assert_eq!(CircuitState::Closed.name(), "closed");
        assert_eq!(
            CircuitState::Open {
                retry_at: Instant::now(),
                failure_count: 5
            }
            .name(),
            "open"
        );
        assert_eq!(CircuitState::HalfOpen { trials: 0 }.name(), "half-open");
    }
}
