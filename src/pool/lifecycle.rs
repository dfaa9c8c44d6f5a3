//! Per-pool connection lifecycle
//!
//! A [`Pool`] owns the connections of one backend together with its circuit
//! breaker, load balancer cursor, counters and FIFO queue of waiting callers.
//! All of it sits behind a single mutex that is never held across an
//! `.await`: connects, probes and disconnects happen outside the lock, with
//! capacity reserved up front so concurrent creations cannot overshoot
//! `max_connections`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::circuit::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitError};
use super::config::{PoolConfig, PoolConfigUpdate};
use super::connection::{Connection, ConnectionState, Endpoint, HealthStatus};
use super::connector::{with_timeout, Connector, ConnectorError};
use super::error::PoolError;
use super::metrics::{ConnectionMetrics, PoolCounters, PoolStats};
use crate::lb::{HealthCheckResult, HealthReport, LoadBalancer, PoolHealth};

type Handoff = oneshot::Sender<Result<Connection, PoolError>>;

/// A caller parked until a connection frees up
struct Waiter {
    id: u64,
    tx: Handoff,
}

struct PoolState {
    config: PoolConfig,
    connections: Vec<Connection>,

    /// Creations in flight; they count against `max_connections`
    pending_creates: usize,

    circuit: CircuitBreaker,
    balancer: LoadBalancer,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    counters: PoolCounters,
    health: PoolHealth,
    last_health_check: Option<Instant>,
    stopped: bool,
}

impl PoolState {
    fn live_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_live()).count()
    }

    fn has_capacity(&self) -> bool {
        self.live_count() + self.pending_creates < self.config.max_connections
    }

    fn position(&self, connection_id: &str) -> Option<usize> {
        self.connections.iter().position(|c| c.id == connection_id)
    }

    /// Waiters whose caller is still listening
    fn waiting(&self) -> usize {
        self.waiters.iter().filter(|w| !w.tx.is_closed()).count()
    }

    /// Creations to start for queued callers the pool has room for
    fn creations_owed(&self) -> usize {
        if self.stopped {
            return 0;
        }
        let room = self
            .config
            .max_connections
            .saturating_sub(self.live_count() + self.pending_creates);
        room.min(self.waiting())
    }

    fn record_failure(&mut self) {
        self.counters.failed += 1;
        if self.circuit.record_failure() {
            self.counters.circuit_breaker_open += 1;
        }
    }

    fn lend(&mut self, idx: usize) -> Connection {
        self.connections[idx].mark_active();
        self.counters.load_balanced += 1;
        self.connections[idx].clone()
    }

    /// Hand available connections to queued callers, oldest first
    fn serve_waiters(&mut self, pool: &str) -> usize {
        let mut served = 0;
        loop {
            while self.waiters.front().map_or(false, |w| w.tx.is_closed()) {
                self.waiters.pop_front();
            }
            if self.waiters.is_empty() {
                break;
            }
            let Some(idx) = self.balancer.select(&self.connections) else {
                break;
            };
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };

            let mut handed = self.connections[idx].clone();
            handed.mark_active();
            if waiter.tx.send(Ok(handed)).is_ok() {
                self.lend(idx);
                served += 1;
                debug!(
                    pool = %pool,
                    connection_id = %self.connections[idx].id,
                    waiter = waiter.id,
                    "Connection handed to waiting caller"
                );
            }
            // A failed send means the caller gave up in the meantime; the
            // connection stays idle and the next waiter is tried.
        }
        served
    }
}

/// Capacity held for one in-flight creation
///
/// Must be finished under the pool lock; dropping it unfinished (for
/// instance when the acquiring future is cancelled) gives the slot back and
/// passes it on to whoever is queued.
struct Reservation<'a> {
    pool: &'a Arc<Pool>,
    admission: Admission,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a Arc<Pool>, admission: Admission) -> Self {
        Self {
            pool,
            admission,
            armed: true,
        }
    }

    fn finish(&mut self, st: &mut PoolState) {
        if !self.armed {
            return;
        }
        st.pending_creates = st.pending_creates.saturating_sub(1);
        st.circuit.release_trial(self.admission);
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let owed = {
            let mut guard = self.pool.state.lock();
            let st = &mut *guard;
            self.finish(st);
            st.creations_owed()
        };
        self.pool.spawn_creations(owed, Duration::ZERO);
    }
}

/// A caller's place in the waiter queue
///
/// Dropping it before the hand-off was consumed (the acquiring future was
/// cancelled) leaves the queue and puts back any connection already sent.
struct QueuedWait<'a> {
    pool: &'a Pool,
    id: u64,
    rx: oneshot::Receiver<Result<Connection, PoolError>>,
    resolved: bool,
}

impl QueuedWait<'_> {
    /// Leave the queue; returns a hand-off that raced with leaving
    fn leave(&mut self, st: &mut PoolState) -> Option<Result<Connection, PoolError>> {
        self.resolved = true;
        st.waiters.retain(|w| w.id != self.id);
        self.rx.try_recv().ok()
    }
}

impl Drop for QueuedWait<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let mut guard = self.pool.state.lock();
        let st = &mut *guard;
        let Some(Ok(connection)) = self.leave(st) else {
            return;
        };
        let Some(idx) = st.position(&connection.id) else {
            return;
        };
        if st.connections[idx].state == ConnectionState::Active {
            st.connections[idx].mark_idle();
            debug!(
                pool = %self.pool.name,
                connection_id = %connection.id,
                waiter = self.id,
                "Hand-off to cancelled caller returned"
            );
            st.serve_waiters(&self.pool.name);
        }
    }
}

enum AcquireStep<'a> {
    Ready(Connection),
    Create(Reservation<'a>),
    Wait(QueuedWait<'a>),
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub reaped_idle: usize,
    pub reaped_failed: usize,
    pub replenished: usize,
}

/// A named pool of connections to one backend
pub struct Pool {
    name: String,
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    next_connection_id: AtomicU64,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create an empty pool; call [`Pool::warm_up`] to open the minimum
    pub fn new(
        name: impl Into<String>,
        endpoint: Endpoint,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let state = PoolState {
            circuit: CircuitBreaker::new(CircuitBreakerConfig::from(&config)),
            balancer: LoadBalancer::new(config.load_balancing_strategy),
            connections: Vec::with_capacity(config.max_connections),
            config,
            pending_creates: 0,
            waiters: VecDeque::new(),
            next_waiter_id: 0,
            counters: PoolCounters::default(),
            health: PoolHealth::Healthy,
            last_health_check: None,
            stopped: false,
        };

        Ok(Self {
            name: name.into(),
            endpoint,
            connector,
            state: Mutex::new(state),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    pub fn config(&self) -> PoolConfig {
        self.state.lock().config.clone()
    }

    pub fn health_check_interval(&self) -> Duration {
        self.state.lock().config.health_check_interval
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    fn stopped_error(&self) -> PoolError {
        PoolError::PoolStopped(self.name.clone())
    }

    fn circuit_open(&self, err: CircuitError) -> PoolError {
        PoolError::CircuitOpen {
            pool: self.name.clone(),
            retry_in: err.retry_in(),
        }
    }

    /// Open `min_connections` connections.
    ///
    /// Failures are logged and skipped unless `propagate_create_error` is
    /// set. Stops early once the circuit opens.
    pub async fn warm_up(self: &Arc<Self>) -> Result<usize, PoolError> {
        let (target, propagate) = {
            let st = self.state.lock();
            (st.config.min_connections, st.config.propagate_create_error)
        };

        let mut created = 0;
        for _ in 0..target {
            match self.create_idle().await {
                Ok(true) => created += 1,
                Ok(false) => break,
                Err(err) if propagate => return Err(err),
                Err(PoolError::CircuitOpen { .. }) => {
                    warn!(pool = %self.name, created, target, "Circuit opened during warm-up");
                    break;
                }
                Err(err) => {
                    warn!(pool = %self.name, error = %err, "Warm-up connection failed");
                }
            }
        }

        info!(pool = %self.name, created, target, "Pool connections initialized");
        Ok(created)
    }

    /// Borrow a connection, waiting at most `timeout` when the pool is full
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<Connection, PoolError> {
        let started = Instant::now();
        let step = {
            let mut guard = self.state.lock();
            self.begin_acquire(&mut guard, timeout, started)?
        };

        match step {
            AcquireStep::Ready(connection) => Ok(connection),
            AcquireStep::Create(reservation) => self.create_for_caller(reservation, started).await,
            AcquireStep::Wait(wait) => self.wait_for(wait, timeout, started).await,
        }
    }

    fn begin_acquire<'a>(
        self: &'a Arc<Self>,
        st: &mut PoolState,
        timeout: Duration,
        started: Instant,
    ) -> Result<AcquireStep<'a>, PoolError> {
        if st.stopped {
            return Err(self.stopped_error());
        }
        if !st.config.enabled {
            return Err(PoolError::PoolDisabled(self.name.clone()));
        }

        let admission = st.circuit.check().map_err(|err| {
            debug!(pool = %self.name, error = %err, "Acquire rejected by circuit breaker");
            self.circuit_open(err)
        })?;

        if let Some(idx) = st.balancer.select(&st.connections) {
            let connection = st.lend(idx);
            if admission == Admission::Trial {
                st.circuit.record_success();
            }
            st.counters.record_acquire(started.elapsed());
            debug!(
                pool = %self.name,
                connection_id = %connection.id,
                strategy = %st.balancer.strategy(),
                "Connection acquired"
            );
            return Ok(AcquireStep::Ready(connection));
        }

        if st.has_capacity() {
            st.pending_creates += 1;
            return Ok(AcquireStep::Create(Reservation::new(self, admission)));
        }

        // Waiting is not a trial
        st.circuit.release_trial(admission);

        if timeout.is_zero() {
            st.counters.acquire_timeouts += 1;
            return Err(PoolError::AcquireTimeout {
                pool: self.name.clone(),
                waited: Duration::ZERO,
            });
        }

        let (tx, rx) = oneshot::channel();
        let id = st.next_waiter_id;
        st.next_waiter_id += 1;
        st.waiters.push_back(Waiter { id, tx });
        debug!(pool = %self.name, waiting = st.waiters.len(), "Pool exhausted, caller queued");
        Ok(AcquireStep::Wait(QueuedWait {
            pool: self,
            id,
            rx,
            resolved: false,
        }))
    }

    async fn open_connection(&self, timeout: Duration) -> Result<Connection, ConnectorError> {
        let id = format!(
            "{}_{}",
            self.name,
            self.next_connection_id.fetch_add(1, Ordering::Relaxed)
        );
        let started = Instant::now();
        with_timeout(timeout, self.connector.connect(&id, &self.endpoint)).await?;

        let connection = Connection::new(id, self.endpoint.clone(), started.elapsed());
        info!(
            pool = %self.name,
            connection_id = %connection.id,
            response_time_ms = connection.response_time.as_millis() as u64,
            "Connection created"
        );
        Ok(connection)
    }

    /// Create a connection on behalf of a caller, retrying with backoff
    async fn create_for_caller(
        self: &Arc<Self>,
        mut reservation: Reservation<'_>,
        started: Instant,
    ) -> Result<Connection, PoolError> {
        let mut attempt: u32 = 0;
        loop {
            let timeout = self.state.lock().config.connection_timeout;

            match self.open_connection(timeout).await {
                Ok(mut connection) => {
                    let stopped = {
                        let mut guard = self.state.lock();
                        let st = &mut *guard;
                        reservation.finish(st);
                        if st.stopped {
                            true
                        } else {
                            st.circuit.record_success();
                            st.counters.created += 1;
                            connection.mark_active();
                            st.connections.push(connection.clone());
                            st.counters.record_acquire(started.elapsed());
                            false
                        }
                    };
                    if stopped {
                        self.connector.disconnect(&connection).await;
                        return Err(self.stopped_error());
                    }
                    return Ok(connection);
                }
                Err(err) => {
                    let retry = {
                        let mut guard = self.state.lock();
                        let st = &mut *guard;
                        if st.stopped {
                            reservation.finish(st);
                            return Err(self.stopped_error());
                        }
                        st.record_failure();
                        warn!(
                            pool = %self.name,
                            attempt = attempt + 1,
                            error = %err,
                            "Connection attempt failed"
                        );
                        if attempt >= st.config.retry_attempts || !st.circuit.is_closed() {
                            reservation.finish(st);
                            Err((st.creations_owed(), st.config.retry_delay))
                        } else {
                            Ok(st.config.retry_backoff(attempt))
                        }
                    };

                    match retry {
                        Ok(delay) => {
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        Err((owed, delay)) => {
                            // The freed slot goes to whoever queued behind us
                            self.spawn_creations(owed, delay);
                            return Err(PoolError::ConnectionCreation {
                                pool: self.name.clone(),
                                source: err,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn wait_for(
        &self,
        mut wait: QueuedWait<'_>,
        timeout: Duration,
        started: Instant,
    ) -> Result<Connection, PoolError> {
        let received = tokio::time::timeout(timeout, &mut wait.rx).await;
        let outcome = match received {
            Ok(result) => {
                wait.resolved = true;
                result.unwrap_or_else(|_| Err(self.stopped_error()))
            }
            Err(_) => {
                let mut guard = self.state.lock();
                let st = &mut *guard;
                // A hand-off may have raced with the deadline
                match wait.leave(st) {
                    Some(result) => result,
                    None => {
                        if !st.stopped {
                            st.counters.acquire_timeouts += 1;
                        }
                        debug!(pool = %self.name, waiter = wait.id, "Acquire timed out");
                        return Err(PoolError::AcquireTimeout {
                            pool: self.name.clone(),
                            waited: started.elapsed(),
                        });
                    }
                }
            }
        };

        if outcome.is_ok() {
            let mut st = self.state.lock();
            if !st.stopped {
                st.counters.record_acquire(started.elapsed());
            }
        }
        outcome
    }

    /// Return a borrowed connection.
    ///
    /// Unknown or non-active connections are ignored with a warning.
    /// Unhealthy or error-prone connections are destroyed instead of being
    /// put back.
    pub async fn release(self: &Arc<Self>, connection_id: &str) {
        let retired = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.stopped {
                warn!(pool = %self.name, connection_id = %connection_id, "Release on stopped pool ignored");
                return;
            }
            let Some(idx) = st.position(connection_id) else {
                warn!(pool = %self.name, connection_id = %connection_id, "Release of unknown connection ignored");
                return;
            };
            if st.connections[idx].state != ConnectionState::Active {
                warn!(
                    pool = %self.name,
                    connection_id = %connection_id,
                    state = ?st.connections[idx].state,
                    "Release of connection that is not active ignored"
                );
                return;
            }

            if st.connections[idx].should_retire(st.config.max_connection_errors) {
                let mut connection = st.connections.remove(idx);
                connection.mark_destroyed();
                st.counters.destroyed += 1;
                Some((connection, st.waiting() > 0))
            } else {
                st.connections[idx].mark_idle();
                debug!(pool = %self.name, connection_id = %connection_id, "Connection released");
                st.serve_waiters(&self.name);
                None
            }
        };

        if let Some((connection, replace)) = retired {
            info!(
                pool = %self.name,
                connection_id = %connection.id,
                errors = connection.error_count,
                "Connection destroyed on release"
            );
            self.connector.disconnect(&connection).await;
            if replace {
                self.spawn_creations(1, Duration::ZERO);
            }
        }
    }

    /// Open `count` connections in the background after `delay`
    fn spawn_creations(self: &Arc<Self>, count: usize, delay: Duration) {
        if count == 0 {
            return;
        }
        // Drop guards may run while the runtime is shutting down
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        for _ in 0..count {
            let pool = Arc::clone(self);
            handle.spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if let Err(err) = pool.create_idle().await {
                    debug!(pool = %pool.name, error = %err, "Replacement connection not created");
                }
            });
        }
    }

    /// Open one idle connection if capacity and the circuit allow it.
    /// Returns false when the pool is already full.
    async fn create_idle(self: &Arc<Self>) -> Result<bool, PoolError> {
        let (mut reservation, timeout) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.stopped {
                return Err(self.stopped_error());
            }
            if !st.has_capacity() {
                return Ok(false);
            }
            let admission = st.circuit.check().map_err(|err| self.circuit_open(err))?;
            st.pending_creates += 1;
            (Reservation::new(self, admission), st.config.connection_timeout)
        };

        match self.open_connection(timeout).await {
            Ok(connection) => {
                let stopped = {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    reservation.finish(st);
                    if st.stopped {
                        true
                    } else {
                        st.circuit.record_success();
                        st.counters.created += 1;
                        st.connections.push(connection.clone());
                        st.serve_waiters(&self.name);
                        false
                    }
                };
                if stopped {
                    self.connector.disconnect(&connection).await;
                    return Err(self.stopped_error());
                }
                Ok(true)
            }
            Err(err) => {
                let (owed, delay) = {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    reservation.finish(st);
                    if !st.stopped {
                        st.record_failure();
                    }
                    (st.creations_owed(), st.config.retry_delay)
                };
                self.spawn_creations(owed, delay);
                Err(PoolError::ConnectionCreation {
                    pool: self.name.clone(),
                    source: err,
                })
            }
        }
    }

    /// Snapshot the connections a health pass should probe
    pub(crate) fn health_targets(&self) -> (Vec<Connection>, Duration) {
        let st = self.state.lock();
        if st.stopped {
            return (Vec::new(), st.config.health_check_timeout);
        }
        let targets = st
            .connections
            .iter()
            .filter(|c| c.state == ConnectionState::Idle)
            .cloned()
            .collect();
        (targets, st.config.health_check_timeout)
    }

    /// Apply probe outcomes in one critical section
    pub(crate) fn apply_health_results(&self, results: &[HealthCheckResult]) -> Option<HealthReport> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.stopped {
            return None;
        }

        let max_errors = st.config.max_connection_errors;
        for result in results {
            let Some(idx) = st.position(&result.connection_id) else {
                continue;
            };
            let connection = &mut st.connections[idx];
            if !connection.is_live() {
                continue;
            }

            if result.success {
                connection.record_probe_success(result.response_time);
                st.counters.health_check_passed += 1;
                st.circuit.record_success();
            } else {
                if connection.record_probe_failure(result.response_time, max_errors) {
                    warn!(
                        pool = %self.name,
                        connection_id = %connection.id,
                        errors = connection.error_streak,
                        "Connection failed health checks, handing to reaper"
                    );
                }
                st.counters.health_check_failed += 1;
                if st.circuit.record_failure() {
                    st.counters.circuit_breaker_open += 1;
                }
            }
        }

        let total = st.live_count();
        let healthy = st
            .connections
            .iter()
            .filter(|c| c.is_live() && c.health == HealthStatus::Healthy)
            .count();
        let ratio = if total == 0 { 1.0 } else { healthy as f64 / total as f64 };
        st.health = PoolHealth::from_ratio(ratio);
        st.last_health_check = Some(Instant::now());
        st.serve_waiters(&self.name);

        Some(HealthReport {
            pool: self.name.clone(),
            checked: results.len(),
            healthy,
            total,
            ratio,
            health: st.health,
        })
    }

    /// Reap failed and stale connections, evaluate the breaker timeout, and
    /// replenish toward `min_connections`. Returns `None` once stopped.
    pub async fn run_maintenance(self: &Arc<Self>) -> Option<MaintenanceReport> {
        let (retired, mut report, deficit) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.stopped {
                return None;
            }

            st.connections.retain(|c| c.state != ConnectionState::Destroyed);

            let (mut retired, kept): (Vec<Connection>, Vec<Connection>) =
                std::mem::take(&mut st.connections)
                    .into_iter()
                    .partition(|c| c.state == ConnectionState::Failed);
            st.connections = kept;
            let reaped_failed = retired.len();

            // Longest idle first, never below the configured minimum
            let excess = st.live_count().saturating_sub(st.config.min_connections);
            let idle_timeout = st.config.idle_timeout;
            let mut stale: Vec<(usize, Duration)> = st
                .connections
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_idle() && c.idle_for() > idle_timeout)
                .map(|(idx, c)| (idx, c.idle_for()))
                .collect();
            stale.sort_by(|a, b| b.1.cmp(&a.1));
            stale.truncate(excess);
            let mut doomed: Vec<usize> = stale.into_iter().map(|(idx, _)| idx).collect();
            doomed.sort_unstable_by(|a, b| b.cmp(a));
            let reaped_idle = doomed.len();
            for idx in doomed {
                retired.push(st.connections.remove(idx));
            }

            for connection in retired.iter_mut() {
                connection.mark_destroyed();
            }
            st.counters.destroyed += retired.len() as u64;

            st.circuit.evaluate();

            let deficit = st
                .config
                .min_connections
                .saturating_sub(st.live_count() + st.pending_creates);

            let report = MaintenanceReport {
                reaped_idle,
                reaped_failed,
                replenished: 0,
            };
            (retired, report, deficit)
        };

        for connection in &retired {
            self.connector.disconnect(connection).await;
        }
        if report.reaped_idle + report.reaped_failed > 0 {
            info!(
                pool = %self.name,
                idle = report.reaped_idle,
                failed = report.reaped_failed,
                "Connections reaped"
            );
        }

        for _ in 0..deficit {
            match self.create_idle().await {
                Ok(true) => report.replenished += 1,
                Ok(false) => break,
                Err(err) => {
                    debug!(pool = %self.name, error = %err, "Replenishment stopped");
                    break;
                }
            }
        }

        let metrics = self.stats().metrics;
        info!(
            pool = %self.name,
            total = metrics.total,
            active = metrics.active,
            idle = metrics.idle,
            waiting = metrics.waiting,
            created = metrics.created,
            destroyed = metrics.destroyed,
            "Pool metrics refreshed"
        );
        Some(report)
    }

    /// Apply a partial configuration update atomically
    pub fn update_config(self: &Arc<Self>, update: &PoolConfigUpdate) -> Result<PoolConfig, PoolError> {
        let (merged, spare) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.stopped {
                return Err(self.stopped_error());
            }
            let merged = update.apply_to(&st.config);
            merged.validate()?;

            st.circuit.update_config(CircuitBreakerConfig::from(&merged));
            st.balancer.set_strategy(merged.load_balancing_strategy);
            st.config = merged.clone();

            // A raised maximum can unblock queued callers right away
            (merged, st.creations_owed())
        };

        info!(
            pool = %self.name,
            max = merged.max_connections,
            min = merged.min_connections,
            strategy = %merged.load_balancing_strategy,
            "Pool configuration updated"
        );
        self.spawn_creations(spare, Duration::ZERO);
        Ok(merged)
    }

    /// Force the circuit breaker closed
    pub fn reset_circuit(&self) {
        let mut st = self.state.lock();
        if !st.stopped {
            info!(pool = %self.name, "Manually resetting circuit to Closed");
            st.circuit.reset();
        }
    }

    /// Destroy every connection and wake all waiters with `PoolStopped`.
    /// Nothing mutates the pool afterwards.
    pub async fn stop(&self) {
        let (retired, waiters) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.stopped {
                return;
            }
            st.stopped = true;

            let mut retired = Vec::new();
            for connection in st.connections.iter_mut() {
                if connection.state != ConnectionState::Destroyed {
                    connection.mark_destroyed();
                    st.counters.destroyed += 1;
                    retired.push(connection.clone());
                }
            }
            let waiters: Vec<Waiter> = st.waiters.drain(..).collect();
            (retired, waiters)
        };

        for waiter in waiters {
            let _ = waiter.tx.send(Err(self.stopped_error()));
        }
        for connection in &retired {
            self.connector.disconnect(connection).await;
        }
        info!(pool = %self.name, destroyed = retired.len(), "Pool stopped");
    }

    /// Current statistics; only holds the lock for the copy
    pub fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        let metrics = ConnectionMetrics::aggregate(&st.connections, &st.counters, st.waiting());
        PoolStats {
            name: self.name.clone(),
            backend_type: self.endpoint.backend_type,
            endpoint: self.endpoint.clone(),
            config: st.config.clone(),
            health_check_pass_rate: metrics.health_check_pass_rate(),
            metrics,
            circuit: st.circuit.stats(),
            health: st.health,
            last_health_check_ms: st.last_health_check.map(|t| t.elapsed().as_millis() as u64),
            stopped: st.stopped,
            connections: st.connections.iter().map(Connection::snapshot).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BackendType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct FlakyConnector {
        fail: AtomicBool,
        delay_ms: AtomicU64,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, _connection_id: &str, _endpoint: &Endpoint) -> Result<(), ConnectorError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            // Outcome is fixed when the attempt starts
            let fail = self.fail.load(Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if fail {
                Err(ConnectorError::Refused("backend down".to_string()))
            } else {
                Ok(())
            }
        }

        async fn probe(&self, _connection: &Connection) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    fn test_pool(config: PoolConfig) -> (Arc<Pool>, Arc<FlakyConnector>) {
        let connector = Arc::new(FlakyConnector::default());
        let pool = Pool::new(
            "test",
            Endpoint::default_for(BackendType::Redis),
            config,
            connector.clone(),
        )
        .unwrap();
        (Arc::new(pool), connector)
    }

    fn small_config() -> PoolConfig {
        PoolConfig {
            min_connections: 1,
            max_connections: 2,
            retry_attempts: 0,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_warm_up_creates_minimum() {
        let (pool, connector) = test_pool(PoolConfig {
            min_connections: 3,
            max_connections: 5,
            ..Default::default()
        });
        assert_eq!(pool.warm_up().await.unwrap(), 3);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

        let metrics = pool.stats().metrics;
        assert_eq!(metrics.idle, 3);
        assert_eq!(metrics.created, 3);
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let (pool, connector) = test_pool(small_config());
        pool.warm_up().await.unwrap();

        let conn = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(conn.state, ConnectionState::Active);
        pool.release(&conn.id).await;

        let again = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(again.id, conn.id);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_when_exhausted() {
        let (pool, _) = test_pool(small_config());
        pool.warm_up().await.unwrap();
        let _a = pool.acquire(Duration::ZERO).await.unwrap();
        let _b = pool.acquire(Duration::ZERO).await.unwrap();

        let result = pool.acquire(Duration::ZERO).await;
        assert!(matches!(result, Err(PoolError::AcquireTimeout { .. })));
        assert_eq!(pool.stats().metrics.acquire_timeouts, 1);
    }

    #[tokio::test]
    async fn test_timed_out_waiter_leaves_queue() {
        let (pool, _) = test_pool(small_config());
        let a = pool.acquire(Duration::ZERO).await.unwrap();
        let _b = pool.acquire(Duration::ZERO).await.unwrap();

        let result = pool.acquire(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(PoolError::AcquireTimeout { .. })));
        assert_eq!(pool.stats().metrics.waiting, 0);

        // The released connection goes back to idle, not to the dead waiter
        pool.release(&a.id).await;
        let metrics = pool.stats().metrics;
        assert_eq!(metrics.idle, 1);
        assert_eq!(metrics.active, 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (pool, _) = test_pool(small_config());
        let conn = pool.acquire(Duration::ZERO).await.unwrap();

        pool.release(&conn.id).await;
        pool.release(&conn.id).await;
        pool.release("nope").await;

        let metrics = pool.stats().metrics;
        assert_eq!(metrics.idle, 1);
        assert_eq!(metrics.active, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_connection_destroyed_on_release() {
        let (pool, _) = test_pool(small_config());
        let conn = pool.acquire(Duration::ZERO).await.unwrap();
        {
            let mut st = pool.state.lock();
            let idx = st.position(&conn.id).unwrap();
            st.connections[idx].health = HealthStatus::Unhealthy;
        }

        pool.release(&conn.id).await;
        let metrics = pool.stats().metrics;
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.destroyed, 1);
    }

    struct StalledConnector;

    #[async_trait]
    impl Connector for StalledConnector {
        async fn connect(&self, _connection_id: &str, _endpoint: &Endpoint) -> Result<(), ConnectorError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn probe(&self, _connection: &Connection) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancelled_create_returns_reservation() {
        let pool = Arc::new(
            Pool::new(
                "stalled",
                Endpoint::default_for(BackendType::Postgres),
                small_config(),
                Arc::new(StalledConnector),
            )
            .unwrap(),
        );

        let result = tokio::time::timeout(Duration::from_millis(20), pool.acquire(Duration::ZERO)).await;
        assert!(result.is_err());
        assert_eq!(pool.state.lock().pending_creates, 0);
        assert_eq!(pool.stats().metrics.total, 0);
    }

    #[tokio::test]
    async fn test_failed_create_passes_slot_to_waiter() {
        let (pool, connector) = test_pool(PoolConfig {
            min_connections: 0,
            max_connections: 1,
            retry_attempts: 0,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        });
        connector.fail.store(true, Ordering::SeqCst);
        connector.delay_ms.store(50, Ordering::SeqCst);

        let first = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        connector.fail.store(false, Ordering::SeqCst);
        connector.delay_ms.store(0, Ordering::SeqCst);

        // Queued behind the doomed creation, served once it fails
        let second = pool.acquire(Duration::from_millis(300)).await.unwrap();
        assert_eq!(second.state, ConnectionState::Active);
        assert!(matches!(
            first.await.unwrap(),
            Err(PoolError::ConnectionCreation { .. })
        ));

        let stats = pool.stats();
        assert_eq!(stats.metrics.total, 1);
        assert_eq!(stats.metrics.active, 1);
        assert_eq!(stats.circuit.state, "closed");
    }

    #[tokio::test]
    async fn test_cancelled_waiter_returns_handed_connection() {
        let (pool, _) = test_pool(PoolConfig {
            min_connections: 0,
            max_connections: 1,
            ..Default::default()
        });
        let held = pool.acquire(Duration::ZERO).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().metrics.waiting, 1);

        // Handed over on release, then the caller goes away before taking it
        pool.release(&held.id).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        let metrics = pool.stats().metrics;
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.idle, 1);
        assert_eq!(metrics.waiting, 0);

        let again = pool.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(again.id, held.id);
    }

    #[tokio::test]
    async fn test_half_open_rejects_beyond_trial_limit() {
        let (pool, connector) = test_pool(PoolConfig {
            min_connections: 0,
            max_connections: 2,
            retry_attempts: 0,
            retry_delay: Duration::from_millis(1),
            circuit_breaker_threshold: 1,
            circuit_breaker_timeout: Duration::from_millis(20),
            half_open_max_calls: 1,
            ..Default::default()
        });
        connector.fail.store(true, Ordering::SeqCst);
        let result = pool.acquire(Duration::ZERO).await;
        assert!(matches!(result, Err(PoolError::ConnectionCreation { .. })));
        assert_eq!(pool.stats().circuit.state, "open");

        tokio::time::sleep(Duration::from_millis(30)).await;
        connector.fail.store(false, Ordering::SeqCst);
        connector.delay_ms.store(50, Ordering::SeqCst);

        let trial = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The single trial slot is taken by the in-flight creation
        let rejected = pool.acquire(Duration::from_secs(1)).await;
        assert!(matches!(
            rejected,
            Err(PoolError::CircuitOpen { retry_in, .. }) if retry_in.is_zero()
        ));
        assert_eq!(pool.stats().circuit.state, "half-open");

        trial.await.unwrap().unwrap();
        assert_eq!(pool.stats().circuit.state, "closed");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_creation_failures_open_circuit() {
        let (pool, connector) = test_pool(PoolConfig {
            min_connections: 0,
            max_connections: 3,
            retry_attempts: 2,
            retry_delay: Duration::from_millis(1),
            circuit_breaker_threshold: 3,
            ..Default::default()
        });
        connector.fail.store(true, Ordering::SeqCst);

        let result = pool.acquire(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(PoolError::ConnectionCreation { .. })));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

        let result = pool.acquire(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(PoolError::CircuitOpen { .. })));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

        let metrics = pool.stats().metrics;
        assert_eq!(metrics.failed, 3);
        assert_eq!(metrics.circuit_breaker_open, 1);
    }

    #[tokio::test]
    async fn test_maintenance_reaps_idle_above_minimum() {
        let (pool, _) = test_pool(PoolConfig {
            min_connections: 1,
            max_connections: 3,
            idle_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let a = pool.acquire(Duration::ZERO).await.unwrap();
        let b = pool.acquire(Duration::ZERO).await.unwrap();
        let c = pool.acquire(Duration::ZERO).await.unwrap();
        for conn in [&a, &b, &c] {
            pool.release(&conn.id).await;
        }

        tokio::time::sleep(Duration::from_millis(40)).await;
        let report = pool.run_maintenance().await.unwrap();
        assert_eq!(report.reaped_idle, 2);

        let metrics = pool.stats().metrics;
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.destroyed, 2);
    }

    #[tokio::test]
    async fn test_update_config_rejects_invalid_merge() {
        let (pool, _) = test_pool(small_config());
        let update = PoolConfigUpdate {
            max_connections: Some(0),
            ..Default::default()
        };
        assert!(matches!(pool.update_config(&update), Err(PoolError::InvalidConfig(_))));
        assert_eq!(pool.config().max_connections, 2);
    }

    #[tokio::test]
    async fn test_disabled_pool_rejects_acquire() {
        let (pool, _) = test_pool(PoolConfig {
            enabled: false,
            ..small_config()
        });
        let result = pool.acquire(Duration::ZERO).await;
        assert!(matches!(result, Err(PoolError::PoolDisabled(_))));
    }
}
