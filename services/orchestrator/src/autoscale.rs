//! Autoscale controller.
//!
//! Periodically averages CPU utilization over the target's Running
//! instances and moves the target's desired count toward
//! `ceil(current * observed / target)`, clamped to `[min, max]`.
//!
//! - Changes are applied only when `|observed / target - 1|` exceeds the
//!   stabilization threshold
//! - Scale-down is held for `scale_down_cooldown` after a scale-up;
//!   scale-up is never held
//! - Instances whose newest sample is older than twice the sample interval
//!   are left out of the mean; with no valid sample at all the desired
//!   count is frozen and `DegradedMetrics` is raised on the target

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{ControllerError, ControllerResult};
use crate::replica::ReplicaSetController;
use crate::signals::SignalInbox;
use crate::status::ConditionKind;

/// Default minimum relative change before a decision is applied.
pub const DEFAULT_STABILIZATION_THRESHOLD: f64 = 0.05;

/// Default quiet period for scale-down after a scale-up.
pub const DEFAULT_SCALE_DOWN_COOLDOWN: Duration = Duration::from_secs(300);

/// Default interval between samples from one instance.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Validated scaling bounds and target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalePolicy {
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Target CPU utilization as a ratio of the request (0.7 for 70%).
    pub target_utilization: f64,
    pub stabilization_threshold: f64,
    pub scale_down_cooldown: Duration,
    pub sample_interval: Duration,
    /// Trailing window the mean is computed over.
    pub window: Duration,
}

impl AutoscalePolicy {
    /// Build a policy with default threshold, cooldown and sampling.
    pub fn new(min_replicas: u32, max_replicas: u32, target_utilization: f64) -> ControllerResult<Self> {
        Self {
            min_replicas,
            max_replicas,
            target_utilization,
            stabilization_threshold: DEFAULT_STABILIZATION_THRESHOLD,
            scale_down_cooldown: DEFAULT_SCALE_DOWN_COOLDOWN,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            window: DEFAULT_SAMPLE_INTERVAL * 4,
        }
        .validated()
    }

    /// Policy from an HPA-style integer percentage.
    pub fn from_percent(min_replicas: u32, max_replicas: u32, target_percent: u32) -> ControllerResult<Self> {
        Self::new(min_replicas, max_replicas, f64::from(target_percent) / 100.0)
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.scale_down_cooldown = cooldown;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> ControllerResult<Self> {
        self.stabilization_threshold = threshold;
        self.validated()
    }

    pub fn with_sampling(mut self, sample_interval: Duration, window: Duration) -> ControllerResult<Self> {
        self.sample_interval = sample_interval;
        self.window = window;
        self.validated()
    }

    /// Samples older than this exclude their instance.
    pub fn stale_after(&self) -> Duration {
        self.sample_interval * 2
    }

    fn validated(self) -> ControllerResult<Self> {
        let invalid = |msg: String| Err(ControllerError::InvalidPolicy(msg));

        if self.max_replicas == 0 {
            return invalid("max_replicas must be at least 1".to_string());
        }
        if self.min_replicas > self.max_replicas {
            return invalid(format!(
                "min_replicas ({}) exceeds max_replicas ({})",
                self.min_replicas, self.max_replicas
            ));
        }
        if !(self.target_utilization.is_finite() && self.target_utilization > 0.0) {
            return invalid(format!("target utilization {} must be positive", self.target_utilization));
        }
        if !(self.stabilization_threshold.is_finite() && self.stabilization_threshold >= 0.0) {
            return invalid(format!(
                "stabilization threshold {} must be non-negative",
                self.stabilization_threshold
            ));
        }
        if self.sample_interval.is_zero() || self.window.is_zero() {
            return invalid("sample interval and window must be non-zero".to_string());
        }
        Ok(self)
    }

    /// Clamp a count into `[min, max]`.
    pub fn clamp(&self, count: u32) -> u32 {
        count.max(self.min_replicas).min(self.max_replicas)
    }
}

/// `ceil(current * observed / target)` clamped to `[min, max]`.
///
/// Never leaves the bounds: an infinite ratio saturates to `max` and a NaN
/// ratio keeps `current` before clamping.
pub fn compute_desired(current: u32, observed: f64, target: f64, min: u32, max: u32) -> u32 {
    let raw = f64::from(current) * observed / target;
    let desired = if raw.is_nan() {
        current
    } else {
        // `as` saturates: +inf -> u32::MAX, negatives -> 0.
        raw.ceil() as u32
    };
    desired.max(min).min(max)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HoldReason {
    /// No instance had a fresh, valid sample.
    NoSamples,
    /// Observed utilization within the stabilization threshold of target.
    WithinThreshold { observed: f64 },
    /// Scale-down proposed inside the cooldown after a scale-up.
    Cooldown { proposed: u32, remaining: Duration },
    /// The proposal equals the current desired count.
    Unchanged { observed: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Scale { from: u32, to: u32, observed: f64 },
    Hold(HoldReason),
}

impl Decision {
    pub fn is_scale(&self) -> bool {
        matches!(self, Self::Scale { .. })
    }
}

/// Inputs to one decision.
#[derive(Debug, Clone, Copy)]
pub struct Observed {
    /// Running instances of the target.
    pub running: u32,
    /// The target's desired count right now.
    pub desired: u32,
    /// Mean utilization, `None` if no valid sample.
    pub mean: Option<f64>,
}

/// Decide one step. Pure; `last_scale_up` is the instant of the previous
/// scale-up, if any.
pub fn decide(policy: &AutoscalePolicy, observed: Observed, last_scale_up: Option<Instant>, now: Instant) -> Decision {
    let Some(mean) = observed.mean else {
        return Decision::Hold(HoldReason::NoSamples);
    };

    let deviation = (mean / policy.target_utilization - 1.0).abs();
    // NaN deviation compares false and falls through to the clamp below.
    if deviation <= policy.stabilization_threshold {
        return Decision::Hold(HoldReason::WithinThreshold { observed: mean });
    }

    let proposed = compute_desired(
        observed.running,
        mean,
        policy.target_utilization,
        policy.min_replicas,
        policy.max_replicas,
    );
    if proposed == observed.desired {
        return Decision::Hold(HoldReason::Unchanged { observed: mean });
    }

    if proposed < observed.desired {
        if let Some(at) = last_scale_up {
            let since = now.saturating_duration_since(at);
            if since < policy.scale_down_cooldown {
                return Decision::Hold(HoldReason::Cooldown {
                    proposed,
                    remaining: policy.scale_down_cooldown - since,
                });
            }
        }
    }

    Decision::Scale {
        from: observed.desired,
        to: proposed,
        observed: mean,
    }
}

#[derive(Debug, Default)]
struct ScalerState {
    last_scale_up: Option<Instant>,
    last_decision: Option<Decision>,
}

/// Drives one replica set's desired count from utilization.
pub struct AutoscaleController {
    name: String,
    target: Arc<ReplicaSetController>,
    policy: AutoscalePolicy,
    signals: Arc<SignalInbox>,
    state: Mutex<ScalerState>,
}

impl std::fmt::Debug for AutoscaleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoscaleController")
            .field("name", &self.name)
            .field("target", &self.target.name())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl AutoscaleController {
    /// Attach to `target`, clamping its desired count into the policy bounds.
    pub fn attach(
        name: impl Into<String>,
        target: Arc<ReplicaSetController>,
        policy: AutoscalePolicy,
        signals: Arc<SignalInbox>,
    ) -> Self {
        let name = name.into();
        let desired = target.desired();
        let clamped = policy.clamp(desired);
        if clamped != desired {
            info!(autoscaler = %name, target = %target.name(), desired, clamped, "Clamped desired count into bounds");
            target.set_desired(clamped);
        }

        Self {
            name,
            target,
            policy,
            signals,
            state: Mutex::new(ScalerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Arc<ReplicaSetController> {
        &self.target
    }

    pub fn policy(&self) -> &AutoscalePolicy {
        &self.policy
    }

    pub async fn last_decision(&self) -> Option<Decision> {
        self.state.lock().await.last_decision
    }

    /// Observe, decide and apply one step.
    ///
    /// With no valid sample the desired count is left alone and
    /// `DegradedMetrics` is returned (and raised on the target).
    #[instrument(skip(self), fields(autoscaler = %self.name, target = %self.target.name()))]
    pub async fn evaluate(&self) -> ControllerResult<Decision> {
        self.signals.pump().await;
        let now = Instant::now();

        let running = self.target.running_instances().await;
        let observation = self
            .signals
            .utilization(&running, now, self.policy.window, self.policy.stale_after())
            .await;
        if observation.excluded > 0 {
            debug!(
                contributing = observation.contributing,
                excluded = observation.excluded,
                "Instances without fresh samples excluded"
            );
        }

        let desired = self.target.desired();
        let mut state = self.state.lock().await;
        let decision = decide(
            &self.policy,
            Observed {
                running: running.len() as u32,
                desired,
                mean: observation.mean,
            },
            state.last_scale_up,
            now,
        );
        state.last_decision = Some(decision);

        match decision {
            Decision::Hold(HoldReason::NoSamples) => {
                warn!(desired, "No valid utilization samples; desired count frozen");
                self.target
                    .raise_condition(
                        ConditionKind::DegradedMetrics,
                        format!("no valid utilization samples; desired count frozen at {desired}"),
                    )
                    .await;
                return Err(ControllerError::DegradedMetrics {
                    workload: self.target.name().to_string(),
                    desired,
                });
            }
            Decision::Scale { from, to, observed } => {
                info!(from, to, observed, "Scaling");
                self.target.set_desired(to);
                if to > from {
                    state.last_scale_up = Some(now);
                }
            }
            Decision::Hold(reason) => {
                debug!(?reason, "Holding");
            }
        }

        self.target.clear_condition(ConditionKind::DegradedMetrics).await;
        Ok(decision)
    }
}
