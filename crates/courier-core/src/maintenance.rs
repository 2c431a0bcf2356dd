//! Periodic housekeeping: suppression pruning and stale lease release

use crate::stores::Stores;
use chrono::{Duration as ChronoDuration, Utc};
use courier_common::config::WorkerConfig;
use courier_common::Result;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// What a maintenance pass cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pruned_suppressions: u64,
    pub released_locks: u64,
}

pub struct Maintenance {
    stores: Stores,
    config: WorkerConfig,
}

impl Maintenance {
    pub fn new(stores: Stores, config: WorkerConfig) -> Self {
        Self { stores, config }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.config.prune_interval_secs.max(1)));
        info!(
            "Maintenance started (interval: {}s, stale lock age: {}m)",
            self.config.prune_interval_secs, self.config.stale_lock_minutes
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Maintenance pass failed: {}", e);
                    }
                }
            }
        }
    }

    /// Drop expired suppressions and free leases held by dead workers
    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        let pruned_suppressions = self.stores.suppressions.prune().await?;
        let cutoff = Utc::now() - ChronoDuration::minutes(self.config.stale_lock_minutes);
        let released_locks = self.stores.queue.release_stale_locks(cutoff).await?;

        if pruned_suppressions > 0 || released_locks > 0 {
            info!(
                pruned_suppressions,
                released_locks, "Maintenance pass cleaned up"
            );
        }

        Ok(MaintenanceReport {
            pruned_suppressions,
            released_locks,
        })
    }
}
