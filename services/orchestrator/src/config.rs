//! Configuration for the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use ork_reconcile::{BackoffPolicy, RollingStrategy, DEFAULT_READINESS_TIMEOUT, DEFAULT_REPLACEMENT_LIMIT};

use crate::autoscale::{AutoscalePolicy, DEFAULT_SAMPLE_INTERVAL, DEFAULT_SCALE_DOWN_COOLDOWN, DEFAULT_STABILIZATION_THRESHOLD};
use crate::controller::ControllerSettings;
use crate::error::ControllerResult;
use crate::manifest::CredentialPolicy;
use crate::model::Resources;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity budget of the admission gate.
    pub capacity: Resources,

    pub reconcile_interval: Duration,
    pub autoscale_interval: Duration,
    pub readiness_timeout: Duration,

    /// Consecutive readiness failures before replacement halts.
    pub replacement_limit: u32,

    pub scale_down_cooldown: Duration,
    pub stabilization_threshold: f64,
    pub sample_interval: Duration,

    /// Bound of the readiness/utilization signal queue.
    pub signal_queue_capacity: usize,

    /// Directory of `*.toml` manifests applied at startup.
    pub manifest_dir: Option<PathBuf>,

    /// Run against the mock substrate with automatic readiness.
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Accept literal env values that embed passwords.
    pub allow_plaintext_credentials: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let flag = |key: &str| {
            lookup(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(v) => {
                    let secs: f64 = v.parse().with_context(|| format!("{key} must be a number of seconds"))?;
                    Duration::try_from_secs_f64(secs).with_context(|| format!("{key} is out of range"))
                }
                None => Ok(default),
            }
        };

        let capacity = Resources::parse(&var("ORK_CAPACITY_CPU", "8"), &var("ORK_CAPACITY_MEMORY", "16Gi"))
            .context("invalid ORK_CAPACITY_CPU / ORK_CAPACITY_MEMORY")?;

        let replacement_limit: u32 = var("ORK_REPLACEMENT_LIMIT", &DEFAULT_REPLACEMENT_LIMIT.to_string())
            .parse()
            .context("ORK_REPLACEMENT_LIMIT must be an integer")?;
        // A zero limit would trip the guard before the first launch.
        anyhow::ensure!(replacement_limit > 0, "ORK_REPLACEMENT_LIMIT must be at least 1");

        let stabilization_threshold = var(
            "ORK_STABILIZATION_THRESHOLD",
            &DEFAULT_STABILIZATION_THRESHOLD.to_string(),
        )
        .parse()
        .context("ORK_STABILIZATION_THRESHOLD must be a number")?;

        let signal_queue_capacity = var("ORK_SIGNAL_QUEUE_CAPACITY", "1024")
            .parse()
            .context("ORK_SIGNAL_QUEUE_CAPACITY must be an integer")?;

        Ok(Self {
            capacity,
            reconcile_interval: secs("ORK_RECONCILE_INTERVAL_SECS", ork_reconcile::DEFAULT_RECONCILE_INTERVAL)?,
            autoscale_interval: secs("ORK_AUTOSCALE_INTERVAL_SECS", DEFAULT_SAMPLE_INTERVAL)?,
            readiness_timeout: secs("ORK_READINESS_TIMEOUT_SECS", DEFAULT_READINESS_TIMEOUT)?,
            replacement_limit,
            scale_down_cooldown: secs("ORK_SCALE_DOWN_COOLDOWN_SECS", DEFAULT_SCALE_DOWN_COOLDOWN)?,
            stabilization_threshold,
            sample_interval: secs("ORK_SAMPLE_INTERVAL_SECS", DEFAULT_SAMPLE_INTERVAL)?,
            signal_queue_capacity,
            manifest_dir: lookup("ORK_MANIFEST_DIR").map(PathBuf::from),
            dev_mode: flag("ORK_DEV"),
            log_level: var("ORK_LOG_LEVEL", "info"),
            allow_plaintext_credentials: flag("ORK_ALLOW_PLAINTEXT_CREDENTIALS"),
        })
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            readiness_timeout: self.readiness_timeout,
            replacement_limit: self.replacement_limit,
            backoff: BackoffPolicy::default(),
            rolling: RollingStrategy::default(),
        }
    }

    /// Apply the configured cooldown, threshold and sampling to a policy.
    pub fn tune_policy(&self, policy: AutoscalePolicy) -> ControllerResult<AutoscalePolicy> {
        policy
            .with_cooldown(self.scale_down_cooldown)
            .with_threshold(self.stabilization_threshold)?
            .with_sampling(self.sample_interval, self.sample_interval * 4)
    }

    pub fn credential_policy(&self) -> CredentialPolicy {
        CredentialPolicy {
            allow_plaintext: self.allow_plaintext_credentials,
        }
    }

    /// Samples are retained for a full scaling window plus staleness slack.
    pub fn signal_retention(&self) -> Duration {
        self.sample_interval * 6
    }
}
