//! poolmgr - Connection pool manager with circuit breaking and load balancing

pub mod cli;
pub mod config;
pub mod lb;
pub mod manager;
pub mod pool;

pub use config::Config;
pub use manager::{ManagerConfig, PoolManager};
pub use pool::{BackendType, Connection, Connector, Endpoint, PoolConfig, PoolError, PoolStats};
