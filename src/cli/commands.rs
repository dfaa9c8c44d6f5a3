use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::manager::PoolManager;
use crate::pool::PoolStats;

/// Create every configured pool; a pool that fails to start is logged and
/// skipped. Returns the number of pools created.
pub async fn start_pools(manager: &PoolManager, config: &Config) -> Result<usize> {
    let mut created = 0;
    for (name, settings) in &config.pools {
        match manager
            .create_pool_with_endpoint(name, settings.endpoint(), settings.pool_config())
            .await
        {
            Ok(_) => created += 1,
            Err(e) => error!(pool = %name, error = %e, "Failed to create pool"),
        }
    }

    if created == 0 {
        anyhow::bail!("None of the {} configured pools could be created", config.pools.len());
    }
    Ok(created)
}

/// One human-readable line per pool
pub fn format_stats_line(stats: &PoolStats) -> String {
    let m = &stats.metrics;
    format!(
        "{:<12} {:<9} total={:<3} active={:<3} idle={:<3} waiting={:<3} circuit={:<9} health={:?} avg_acquire={:.1}ms",
        stats.name,
        stats.backend_type,
        m.total,
        m.active,
        m.idle,
        m.waiting,
        stats.circuit.state,
        stats.health,
        m.avg_acquire_time_ms
    )
}

/// Run the pools until Ctrl-C, printing stats every `interval`
pub async fn cmd_run(config: Config, interval: Duration) -> Result<()> {
    let manager = PoolManager::new(config.manager.to_manager_config()).context("Invalid manager settings")?;
    let created = start_pools(&manager, &config).await?;
    info!(pools = created, interval_secs = interval.as_secs(), "Pool manager running");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                break;
            }
            _ = ticker.tick() => {
                for stats in manager.get_all_stats().await.values() {
                    println!("{}", format_stats_line(stats));
                }
            }
        }
    }

    manager.stop().await;
    Ok(())
}

/// Create the pools, print a JSON snapshot and stop
pub async fn cmd_stats(config: Config) -> Result<()> {
    let manager = PoolManager::new(config.manager.to_manager_config()).context("Invalid manager settings")?;
    start_pools(&manager, &config).await?;

    let report = serde_json::json!({
        "pools": manager.get_all_stats().await,
        "summary": manager.summary().await,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize stats")?
    );

    manager.stop().await;
    Ok(())
}

/// Validate the configuration and list the pools it defines
pub fn cmd_validate(config: &Config) -> Result<()> {
    config.validate().context("Configuration is invalid")?;

    println!("Configuration OK: {} pools", config.pools.len());
    for (name, settings) in &config.pools {
        let pool = settings.pool_config();
        println!(
            "  {:<12} {:<9} {:<28} min={} max={} strategy={}",
            name,
            settings.backend_type,
            settings.endpoint().address(),
            pool.min_connections,
            pool.max_connections,
            pool.load_balancing_strategy
        );
    }
    Ok(())
}
