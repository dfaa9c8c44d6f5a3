use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lb::HealthChecker;
use crate::pool::Pool;

/// Owns every background task of a manager
///
/// Each pool gets a health-check task and a maintenance task. All of them
/// hang off one cancellation token, which is also cancelled on drop.
pub struct Scheduler {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Start health checking and maintenance for a pool
    pub fn schedule_pool(&self, pool: Arc<Pool>, reap_interval: Duration) {
        let checker = Arc::new(HealthChecker::new(Arc::clone(&pool)));
        let health = checker.start(self.token.child_token());
        let maintenance = spawn_maintenance(pool, reap_interval, self.token.child_token());

        self.tasks.lock().extend([health, maintenance]);
    }

    /// Cancel all tasks and wait for them to finish
    pub async fn shutdown(&self) {
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task panicked");
                }
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Reap, evaluate the breaker and refresh metrics every `interval`
fn spawn_maintenance(pool: Arc<Pool>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(interval) => {}
            }

            // A started pass always finishes; reaped connections are
            // already out of the pool and must still be disconnected
            if token.is_cancelled() {
                break;
            }
            match pool.run_maintenance().await {
                Some(report) => debug!(pool = %pool.name(), ?report, "Maintenance cycle completed"),
                None => break,
            }
        }
        debug!(pool = %pool.name(), "Maintenance task exited");
    })
}
