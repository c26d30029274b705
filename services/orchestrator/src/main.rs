//! ork orchestrator
//!
//! Runs the control loop over a set of workloads loaded from TOML
//! manifests.
//!
//! ## Architecture
//!
//! - **Cluster**: admission gate, service directory, volume store and the
//!   registry of replica, stateful and autoscale controllers
//! - **Control Loop**: periodic reconciliation and autoscale sweeps
//! - **Substrate**: launches and tears down instances (mock in dev)

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ork_orchestrator::config::Config;
use ork_orchestrator::manifest::ManifestSet;
use ork_orchestrator::signals;
use ork_orchestrator::substrate::MockSubstrate;
use ork_orchestrator::worker::ControlLoop;
use ork_orchestrator::Cluster;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration before tracing so the configured level applies
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ork orchestrator");
    info!(
        capacity = %config.capacity,
        reconcile_interval_ms = config.reconcile_interval.as_millis() as u64,
        autoscale_interval_ms = config.autoscale_interval.as_millis() as u64,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    let (signal_tx, inbox) = signals::channel(config.signal_queue_capacity, config.signal_retention());

    // Only the mock substrate exists for now
    let substrate = if config.dev_mode {
        Arc::new(MockSubstrate::auto_ready(signal_tx))
    } else {
        warn!("No production substrate configured, instances will never report ready");
        Arc::new(MockSubstrate::new())
    };

    let cluster = Arc::new(Cluster::new(
        config.capacity,
        substrate,
        inbox,
        config.controller_settings(),
    ));

    if let Some(dir) = &config.manifest_dir {
        let mut set = ManifestSet::load_dir(dir, config.credential_policy())
            .with_context(|| format!("failed to load manifests from {}", dir.display()))?;
        for binding in &mut set.autoscalers {
            binding.policy = config
                .tune_policy(binding.policy.clone())
                .with_context(|| format!("invalid autoscaler '{}'", binding.name))?;
        }
        let count = set.len();
        cluster
            .apply_manifests(set)
            .await
            .context("failed to apply manifests")?;
        info!(manifests = count, dir = %dir.display(), "Manifests applied");
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control = ControlLoop::new(
        Arc::clone(&cluster),
        config.reconcile_interval,
        config.autoscale_interval,
    );
    let mut control_handle = tokio::spawn(async move { control.run(shutdown_rx).await });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut control_handle => {
            if let Err(e) = result {
                error!(error = %e, "Control loop task panicked");
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = control_handle.await {
        error!(error = %e, "Control loop task panicked");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
