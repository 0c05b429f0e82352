//! Periodic cleanup worker.
//!
//! Runs TTL sweeps on an interval until shut down. Sweeps are re-entrant,
//! so overlapping instances (or a concurrent manual `cleanup()`) are
//! harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::manager::CacheManager;

pub struct CleanupWorker {
    manager: Arc<CacheManager>,
    every: Duration,
    shutdown_token: CancellationToken,
}

impl CleanupWorker {
    pub fn new(manager: Arc<CacheManager>, every: Duration, shutdown_token: CancellationToken) -> Self {
        Self {
            manager,
            every,
            shutdown_token,
        }
    }

    /// Spawn the worker onto the runtime. Cancel the token to stop it; the
    /// returned handle resolves once the loop exits.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until the shutdown token fires. A zero interval disables the
    /// worker entirely.
    pub async fn run(self) {
        if self.every.is_zero() {
            info!("cleanup worker disabled (zero interval)");
            return;
        }

        let mut ticker = interval(self.every);
        // Skip missed ticks so a slow sweep never causes back-to-back runs.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("cleanup worker received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    match self.manager.cleanup().await {
                        Ok(removed) if removed > 0 => {
                            info!(removed, "cleanup worker removed expired entries");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "cleanup sweep failed");
                        }
                    }
                }
            }
        }
    }
}
