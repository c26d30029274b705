//! Observable workload status and conditions.
//!
//! Every error a controller handles is attached to the affected workload as
//! a condition, so nothing is only visible in the logs.

use chrono::{DateTime, Utc};
use ork_reconcile::ConvergenceStatus;
use serde::Serialize;

use crate::model::InstanceRef;

/// Kinds of conditions a workload can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Admission refused; creation retries with backoff.
    InsufficientCapacity,
    /// An instance never became ready and was replaced.
    ReadinessTimeout,
    /// Consecutive readiness failures halted automatic replacement.
    ReplacementStorm,
    /// Two claimants for one ordinal's volume.
    StorageBindingConflict,
    /// The autoscaler could not observe enough samples.
    DegradedMetrics,
    /// The substrate refused a launch or teardown.
    SubstrateFailure,
}

impl ConditionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientCapacity => "insufficient_capacity",
            Self::ReadinessTimeout => "readiness_timeout",
            Self::ReplacementStorm => "replacement_storm",
            Self::StorageBindingConflict => "storage_binding_conflict",
            Self::DegradedMetrics => "degraded_metrics",
            Self::SubstrateFailure => "substrate_failure",
        }
    }

    /// Conditions that block progress rather than merely report it.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCapacity | Self::ReplacementStorm | Self::StorageBindingConflict
        )
    }
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub message: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// How many times the condition was raised while active.
    pub count: u32,
}

/// Active conditions for one entity, at most one per kind.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    /// Raise a condition, or refresh it if already active.
    pub fn raise(&mut self, kind: ConditionKind, message: impl Into<String>) {
        let now = Utc::now();
        let message = message.into();

        if let Some(existing) = self.0.iter_mut().find(|c| c.kind == kind) {
            existing.message = message;
            existing.last_seen = now;
            existing.count = existing.count.saturating_add(1);
            return;
        }

        self.0.push(Condition {
            kind,
            message,
            first_seen: now,
            last_seen: now,
            count: 1,
        });
    }

    /// Clear a condition. Returns true if it was active.
    pub fn clear(&mut self, kind: ConditionKind) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.kind != kind);
        before != self.0.len()
    }

    pub fn get(&self, kind: ConditionKind) -> Option<&Condition> {
        self.0.iter().find(|c| c.kind == kind)
    }

    pub fn is_set(&self, kind: ConditionKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn any_blocking(&self) -> bool {
        self.0.iter().any(|c| c.kind.is_blocking())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn to_vec(&self) -> Vec<Condition> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

/// Point-in-time status snapshot of a workload.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadStatus {
    pub name: String,
    pub kind: WorkloadKind,
    pub desired: u32,
    pub active: u32,
    pub running: u32,
    #[serde(serialize_with = "serialize_convergence")]
    pub convergence: ConvergenceStatus,
    pub conditions: Vec<Condition>,
    pub instances: Vec<InstanceRef>,
}

impl WorkloadStatus {
    pub fn has_condition(&self, kind: ConditionKind) -> bool {
        self.conditions.iter().any(|c| c.kind == kind)
    }
}

fn serialize_convergence<S>(status: &ConvergenceStatus, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let s = match status {
        ConvergenceStatus::Converged => "converged",
        ConvergenceStatus::Converging => "converging",
        ConvergenceStatus::Stalled => "stalled",
    };
    serializer.serialize_str(s)
}

/// Classify convergence from counts and conditions.
pub fn convergence(desired: u32, running: u32, active: u32, conditions: &Conditions) -> ConvergenceStatus {
    if running == desired && active == desired {
        ConvergenceStatus::Converged
    } else if conditions.any_blocking() {
        ConvergenceStatus::Stalled
    } else {
        ConvergenceStatus::Converging
    }
}
