//! # Lease Sweeper
//!
//! Recurring background task that expires stale leases and returns their
//! tasks to the queue. Each sweep processes a bounded batch; each lease is
//! handled atomically by the engine so a failure on one lease never halts
//! the rest.
//!
//! Multi-instance deployments run one sweeper per node under a unique
//! instance id (validated at startup by the config). No partitioning is
//! required: the `expires_at <= now` predicate plus per-row locking during
//! the atomic update already serialises contention between replicas.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::engine::TaskEngine;

pub struct LeaseSweeper {
    engine: TaskEngine,
    instance_id: String,
    interval: Duration,
    batch_size: i64,
}

impl LeaseSweeper {
    pub fn new(engine: TaskEngine) -> Self {
        let config = engine.config();
        Self {
            instance_id: config.instance_id.clone(),
            interval: Duration::from_secs(config.lease_sweep_interval_seconds),
            batch_size: config.lease_sweep_batch,
            engine,
        }
    }

    /// Spawn the sweep loop. Returns the join handle and a shutdown sender;
    /// send `true` (or drop the sender) to stop after the in-flight sweep.
    pub fn spawn(self) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(shutdown_rx));
        (handle, shutdown_tx)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance_id = %self.instance_id,
            interval_seconds = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Lease sweep loop started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(instance_id = %self.instance_id, "Lease sweep loop stopped");
    }

    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn sweep_once(&self) {
        match self.engine.expire_leases(self.batch_size).await {
            Ok(0) => {}
            Ok(count) => {
                info!(expired = count, "Expired leases and requeued tasks");
            }
            Err(e) => {
                error!(error = %e, "Lease sweep failed; will retry next interval");
            }
        }
    }
}
