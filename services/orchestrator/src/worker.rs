//! Background control loop.
//!
//! Runs reconciliation and autoscale sweeps on independent intervals until
//! shutdown is signaled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument};

use crate::cluster::Cluster;

pub struct ControlLoop {
    cluster: Arc<Cluster>,
    reconcile_interval: Duration,
    autoscale_interval: Duration,
}

impl ControlLoop {
    pub fn new(cluster: Arc<Cluster>, reconcile_interval: Duration, autoscale_interval: Duration) -> Self {
        Self {
            cluster,
            reconcile_interval,
            autoscale_interval,
        }
    }

    /// Run until `shutdown` flips to true.
    #[instrument(skip(self, shutdown), name = "control_loop")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_ms = self.reconcile_interval.as_millis() as u64,
            autoscale_interval_ms = self.autoscale_interval.as_millis() as u64,
            "Starting control loop"
        );

        let mut reconcile = tokio::time::interval(self.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut autoscale = tokio::time::interval(self.autoscale_interval);
        autoscale.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Give workloads one reconcile interval before the first scaling decision.
        autoscale.tick().await;

        loop {
            tokio::select! {
                _ = reconcile.tick() => {
                    self.cluster.reconcile_all().await;
                }
                _ = autoscale.tick() => {
                    self.cluster.autoscale_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Control loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}
