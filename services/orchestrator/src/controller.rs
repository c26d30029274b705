//! Pieces shared by the replica and stateful controllers.
//!
//! Both controllers own a set of members, observe their readiness through
//! the signal inbox, and tear them down in the same order: deregister from
//! the directory, mark Terminating, release the reservation, then ask the
//! substrate to stop the instance.

use std::sync::Arc;
use std::time::Duration;

use ork_id::{InstanceId, VolumeId};
use ork_reconcile::{Backoff, BackoffPolicy, RollingStrategy, DEFAULT_READINESS_TIMEOUT, DEFAULT_REPLACEMENT_LIMIT};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::admission::{AdmissionGate, Reservation};
use crate::directory::ServiceDirectory;
use crate::model::{InstanceRef, InstanceStatus, WorkloadSpec};
use crate::signals::SignalInbox;
use crate::substrate::{LaunchRequest, Substrate, SubstrateError, VolumeMount};

/// Shared state objects every controller is constructed with.
#[derive(Clone)]
pub struct ControlDeps {
    pub gate: Arc<AdmissionGate>,
    pub directory: Arc<ServiceDirectory>,
    pub signals: Arc<SignalInbox>,
    pub substrate: Arc<dyn Substrate>,
}

impl std::fmt::Debug for ControlDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlDeps")
            .field("gate", &self.gate)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

/// Tunables for the workload controllers.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// How long an instance may stay Pending before it is failed.
    pub readiness_timeout: Duration,

    /// Consecutive readiness failures before automatic replacement halts.
    pub replacement_limit: u32,

    /// Delay schedule after a refused admission or launch.
    pub backoff: BackoffPolicy,

    pub rolling: RollingStrategy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            replacement_limit: DEFAULT_REPLACEMENT_LIMIT,
            backoff: BackoffPolicy::default(),
            rolling: RollingStrategy::default(),
        }
    }
}

/// What a call to `reconcile` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// This caller owned the gate and ran one or more passes.
    Ran(PassReport),

    /// A pass was already running; the request was folded into it.
    Coalesced,
}

impl PassOutcome {
    pub fn report(&self) -> PassReport {
        match self {
            Self::Ran(report) => *report,
            Self::Coalesced => PassReport::default(),
        }
    }
}

/// Counters for the passes run by one `reconcile` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub passes: u32,
    pub created: u32,
    pub evicted: u32,
    pub promoted: u32,
    pub failed: u32,
}

impl PassReport {
    pub(crate) fn merge(&mut self, other: PassReport) {
        self.passes += other.passes;
        self.created += other.created;
        self.evicted += other.evicted;
        self.promoted += other.promoted;
        self.failed += other.failed;
    }

    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.evicted == 0 && self.promoted == 0 && self.failed == 0
    }
}

/// An instance owned by a controller, with the resources it holds.
#[derive(Debug)]
pub(crate) struct Member {
    pub instance: InstanceRef,
    pub reservation: Option<Reservation>,
    pub volume: Option<VolumeId>,
    pub created_at: Instant,
}

impl Member {
    pub fn new(instance: InstanceRef, reservation: Reservation, volume: Option<VolumeId>) -> Self {
        Self {
            instance,
            reservation: Some(reservation),
            volume,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.instance.id
    }

    pub fn status(&self) -> InstanceStatus {
        self.instance.status
    }
}

/// Why a member was failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FailureCause {
    Timeout(Duration),
    NotReady(String),
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(waited) => write!(f, "not ready after {waited:?}"),
            Self::NotReady(reason) => write!(f, "reported not ready: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Observation {
    Unchanged,
    Promoted,
    Failed(FailureCause),
}

/// Apply the latest readiness signal (or the timeout) to one member.
///
/// A promoted member is registered with the directory before it is marked
/// Running; a failed one is deregistered before it is marked Failed.
pub(crate) async fn observe(
    deps: &ControlDeps,
    settings: &ControllerSettings,
    spec: &WorkloadSpec,
    member: &mut Member,
    now: Instant,
) -> Observation {
    let id = member.id();
    let signal = deps.signals.take_readiness(&id).await;

    let cause = match (member.status(), signal) {
        (InstanceStatus::Pending, Some(s)) if s.ready => {
            deps.directory
                .register(id, &member.instance.labels, &member.instance.address, spec.primary_port())
                .await;
            member.instance.status = InstanceStatus::Running;
            info!(instance_id = %id, workload = %member.instance.workload, "Instance running");
            return Observation::Promoted;
        }
        (InstanceStatus::Pending | InstanceStatus::Running, Some(s)) if !s.ready => {
            FailureCause::NotReady(s.reason.unwrap_or_else(|| "unspecified".to_string()))
        }
        (InstanceStatus::Pending, None) => {
            let waited = now.saturating_duration_since(member.created_at);
            if waited < settings.readiness_timeout {
                return Observation::Unchanged;
            }
            FailureCause::Timeout(waited)
        }
        _ => return Observation::Unchanged,
    };

    deps.directory.deregister(&id).await;
    member.instance.status = InstanceStatus::Failed;
    Observation::Failed(cause)
}

/// Tear a member down, releasing everything it holds.
///
/// On error the member is left Terminating with its reservation already
/// released; calling this again retries the substrate teardown.
pub(crate) async fn teardown(deps: &ControlDeps, member: &mut Member) -> Result<(), SubstrateError> {
    let id = member.id();

    deps.directory.deregister(&id).await;
    member.instance.status = InstanceStatus::Terminating;

    if let Some(reservation) = member.reservation.take() {
        deps.gate.release(reservation);
        member.instance.reservation = None;
    }

    deps.substrate.teardown(&id).await?;
    deps.signals.forget(&id).await;

    debug!(instance_id = %id, "Instance torn down");
    Ok(())
}

/// Build the substrate request for a freshly admitted instance.
pub(crate) fn launch_request(spec: &WorkloadSpec, instance: &InstanceRef, volume: Option<VolumeMount>) -> LaunchRequest {
    LaunchRequest {
        instance_id: instance.id,
        workload: spec.name.clone(),
        image: spec.image.clone(),
        request: spec.request,
        limit: spec.limit,
        ports: spec.ports.iter().map(|p| p.container_port).collect(),
        env: spec.env.clone(),
        address: instance.address.clone(),
        ordinal: instance.ordinal,
        volume,
    }
}

/// Hostname for a stateless instance: workload name plus an id suffix.
pub(crate) fn stateless_hostname(workload: &str, id: &InstanceId) -> String {
    let ulid = id.ulid().to_string().to_lowercase();
    let suffix = &ulid[ulid.len().saturating_sub(6)..];
    format!("{workload}-{suffix}")
}

/// Backoff deadline for creation attempts.
#[derive(Debug)]
pub(crate) struct Throttle {
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl Throttle {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            backoff: Backoff::new(policy),
            retry_at: None,
        }
    }

    /// Whether creation may be attempted at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    /// Record a refusal; returns the delay before the next attempt.
    pub fn defer(&mut self, now: Instant) -> Duration {
        let delay = self.backoff.next_delay();
        self.retry_at = Some(now + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
        self.retry_at = None;
    }
}
