//! Command implementations for the `poolmgr` binary
//!
//! # Usage
//!
//! ```bash
//! # Keep the configured pools alive and print stats every 10 seconds
//! poolmgr --config pools.yaml run --interval-secs 10
//!
//! # One-shot JSON snapshot of every pool
//! poolmgr stats
//!
//! # Check a config file without connecting anywhere
//! poolmgr --config pools.yaml validate
//! ```

pub mod commands;

pub use commands::{cmd_run, cmd_stats, cmd_validate, start_pools};
