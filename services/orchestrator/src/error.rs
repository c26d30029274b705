//! Controller error taxonomy.
//!
//! Component errors live next to their component; this enum is what the
//! controllers and the cluster surface. Every variant is local to a single
//! workload and never stops reconciliation of other workloads.

use ork_id::Ordinal;
use thiserror::Error;

use crate::admission::AdmissionError;
use crate::stateful::BindingError;
use crate::substrate::SubstrateError;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Admission refused or invalid resources. Retried with backoff.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Volume claim lost to another instance. The later claimant backs off.
    #[error(transparent)]
    Binding(#[from] BindingError),

    /// Automatic replacement halted after consecutive readiness failures.
    #[error("replacement halted after {failures} consecutive readiness failures")]
    ReplacementStorm { failures: u32 },

    /// Autoscaler had no valid samples; desired count frozen.
    #[error("no valid utilization samples for '{workload}'; desired count frozen at {desired}")]
    DegradedMetrics { workload: String, desired: u32 },

    /// A stateful transition would break ordinal order.
    #[error("ordinal order violated for '{workload}' at ordinal {ordinal}: {reason}")]
    OrderingViolation {
        workload: String,
        ordinal: Ordinal,
        reason: String,
    },

    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error("unknown workload '{0}'")]
    UnknownWorkload(String),

    #[error("invalid autoscale policy: {0}")]
    InvalidPolicy(String),
}

impl ControllerError {
    /// Whether a later pass may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Admission(AdmissionError::InsufficientCapacity { .. })
                | Self::Binding(BindingError::Conflict { .. })
                | Self::DegradedMetrics { .. }
                | Self::Substrate(_)
        )
    }
}
