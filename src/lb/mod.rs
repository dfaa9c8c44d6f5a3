//! Connection selection and health checking
//!
//! # Components
//!
//! - [`LoadBalancer`]: picks which idle connection of a pool is lent out next
//! - [`HealthChecker`]: periodically probes idle connections and rates the pool
//!
//! # Strategies
//!
//! - **Round-robin**: cursor over the available connections
//! - **Least-connections**: fewest borrows on multiplexing backends, first idle otherwise
//! - **Weighted**: random pick biased toward fast, error-free connections
//!
//! # Health Rating
//!
//! After every pass a pool is rated by its share of healthy connections:
//! healthy at 80% or more, degraded at 50% or more, critical below that.

pub mod balancer;
pub mod health;

pub use balancer::{connection_weight, LoadBalancer, Strategy};
pub use health::{HealthCheckResult, HealthChecker, HealthReport, PoolHealth};
