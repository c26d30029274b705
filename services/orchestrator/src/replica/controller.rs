//! Replica set controller.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ork_id::InstanceId;
use ork_reconcile::{PassGate, ReplacementGuard};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::plan::{plan, MemberView};
use crate::controller::{
    launch_request, observe, stateless_hostname, teardown, ControlDeps, ControllerSettings, Member, Observation,
    PassOutcome, PassReport, Throttle,
};
use crate::error::{ControllerError, ControllerResult};
use crate::model::{overlay_ipv6, InstanceAddress, InstanceRef, InstanceStatus, WorkloadSpec, LABEL_WORKLOAD};
use crate::status::{convergence, ConditionKind, Conditions, WorkloadKind, WorkloadStatus};

struct ReplicaState {
    members: Vec<Member>,
    next_seq: u64,
    guard: ReplacementGuard,
    throttle: Throttle,
    conditions: Conditions,
}

/// Keeps one stateless workload at its desired replica count.
pub struct ReplicaSetController {
    name: String,
    spec: ArcSwap<WorkloadSpec>,
    desired: AtomicU32,
    deps: ControlDeps,
    settings: ControllerSettings,
    gate: PassGate,
    state: Mutex<ReplicaState>,
}

impl std::fmt::Debug for ReplicaSetController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSetController")
            .field("name", &self.name)
            .field("desired", &self.desired())
            .finish_non_exhaustive()
    }
}

impl ReplicaSetController {
    pub fn new(spec: WorkloadSpec, desired: u32, deps: ControlDeps, settings: ControllerSettings) -> Self {
        let state = ReplicaState {
            members: Vec::new(),
            next_seq: 0,
            guard: ReplacementGuard::new(settings.replacement_limit),
            throttle: Throttle::new(settings.backoff.clone()),
            conditions: Conditions::default(),
        };

        Self {
            name: spec.name.clone(),
            spec: ArcSwap::from_pointee(spec),
            desired: AtomicU32::new(desired),
            deps,
            settings,
            gate: PassGate::new(),
            state: Mutex::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> Arc<WorkloadSpec> {
        self.spec.load_full()
    }

    pub fn desired(&self) -> u32 {
        self.desired.load(Ordering::SeqCst)
    }

    /// Set the target replica count. Takes effect on the next pass.
    pub fn set_desired(&self, desired: u32) {
        let previous = self.desired.swap(desired, Ordering::SeqCst);
        if previous != desired {
            info!(workload = %self.name, previous, desired, "Desired replicas changed");
        }
    }

    /// Replace the template wholesale. Returns true if it changed.
    ///
    /// Existing instances are rolled to the new template by later passes.
    pub fn replace_spec(&self, spec: WorkloadSpec) -> bool {
        let current = self.spec.load();
        if current.spec_hash() == spec.spec_hash() {
            return false;
        }

        info!(
            workload = %self.name,
            from = %current.spec_hash(),
            to = %spec.spec_hash(),
            "Template replaced"
        );
        self.spec.store(Arc::new(spec));
        true
    }

    /// Run a reconciliation pass, or fold into the one already running.
    pub async fn reconcile(&self) -> ControllerResult<PassOutcome> {
        let Some(mut guard) = self.gate.enter() else {
            debug!(workload = %self.name, "Pass coalesced");
            return Ok(PassOutcome::Coalesced);
        };

        let mut report = PassReport::default();
        while guard.next_pass() {
            report.merge(self.pass().await?);
        }
        Ok(PassOutcome::Ran(report))
    }

    #[instrument(skip(self), fields(workload = %self.name))]
    async fn pass(&self) -> ControllerResult<PassReport> {
        let mut state = self.state.lock().await;
        let spec = self.spec.load_full();
        let desired = self.desired();
        let mut report = PassReport {
            passes: 1,
            ..Default::default()
        };
        let mut failure: Option<ControllerError> = None;

        self.deps.signals.pump().await;
        let now = Instant::now();

        let ReplicaState {
            members,
            next_seq,
            guard,
            throttle,
            conditions,
        } = &mut *state;

        for member in members.iter_mut() {
            match observe(&self.deps, &self.settings, &spec, member, now).await {
                Observation::Unchanged => {}
                Observation::Promoted => {
                    report.promoted += 1;
                    guard.record_success();
                    conditions.clear(ConditionKind::ReadinessTimeout);
                }
                Observation::Failed(cause) => {
                    report.failed += 1;
                    warn!(instance_id = %member.id(), %cause, "Instance failed readiness");
                    conditions.raise(
                        ConditionKind::ReadinessTimeout,
                        format!("instance {} {cause}", member.id()),
                    );
                    if guard.record_failure() {
                        error!(
                            failures = guard.consecutive_failures(),
                            "Replacement halted after consecutive readiness failures"
                        );
                        conditions.raise(
                            ConditionKind::ReplacementStorm,
                            format!(
                                "{} consecutive readiness failures; automatic replacement halted",
                                guard.consecutive_failures()
                            ),
                        );
                    }
                }
            }
        }

        // Failed members are replaced by the creation step below.
        let mut retained = Vec::with_capacity(members.len());
        for mut member in members.drain(..) {
            if member.status().is_active() {
                retained.push(member);
                continue;
            }
            match teardown(&self.deps, &mut member).await {
                Ok(()) => report.evicted += 1,
                Err(e) => {
                    warn!(error = %e, "Teardown failed; will retry");
                    conditions.raise(ConditionKind::SubstrateFailure, e.to_string());
                    retained.push(member);
                }
            }
        }
        *members = retained;

        let spec_hash = spec.spec_hash();
        let views: Vec<MemberView> = members
            .iter()
            .map(|m| MemberView {
                id: m.id(),
                status: m.status(),
                current: m.instance.spec_hash == spec_hash,
                seq: m.instance.seq,
            })
            .collect();
        let plan = plan(desired, &views, &self.settings.rolling);
        if !plan.is_noop() {
            debug!(desired, create = plan.create, evict = plan.evict.len(), "Planned");
        }

        let mut gone = Vec::with_capacity(plan.evict.len());
        for id in &plan.evict {
            let Some(member) = members.iter_mut().find(|m| &m.id() == id) else {
                continue;
            };
            match teardown(&self.deps, member).await {
                Ok(()) => {
                    report.evicted += 1;
                    gone.push(*id);
                    info!(instance_id = %id, "Instance evicted");
                }
                Err(e) => {
                    warn!(error = %e, "Teardown failed; will retry");
                    conditions.raise(ConditionKind::SubstrateFailure, e.to_string());
                }
            }
        }
        members.retain(|m| !gone.contains(&m.id()));

        if plan.create > 0 {
            if guard.is_tripped() {
                failure = Some(ControllerError::ReplacementStorm {
                    failures: guard.consecutive_failures(),
                });
            } else if !throttle.ready(now) {
                debug!("Creation deferred by backoff");
            } else {
                match self.create(&spec, plan.create, members, next_seq).await {
                    Ok(created) => {
                        report.created += created;
                        throttle.reset();
                        conditions.clear(ConditionKind::InsufficientCapacity);
                    }
                    Err((created, e)) => {
                        report.created += created;
                        let delay = throttle.defer(now);
                        let kind = match e {
                            ControllerError::Substrate(_) => ConditionKind::SubstrateFailure,
                            _ => ConditionKind::InsufficientCapacity,
                        };
                        warn!(error = %e, retry_in = ?delay, "Instance creation refused");
                        conditions.raise(kind, format!("{e}; retrying in {delay:?}"));
                        failure = Some(e);
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Admit and launch up to `count` instances.
    ///
    /// Stops at the first refusal and returns how many were created.
    async fn create(
        &self,
        spec: &WorkloadSpec,
        count: u32,
        members: &mut Vec<Member>,
        next_seq: &mut u64,
    ) -> Result<u32, (u32, ControllerError)> {
        let mut created = 0;
        for _ in 0..count {
            let reservation = self
                .deps
                .gate
                .reserve(spec.request, spec.limit)
                .map_err(|e| (created, ControllerError::from(e)))?;

            let id = InstanceId::new();
            let mut labels = spec.labels.clone();
            labels.insert(LABEL_WORKLOAD.to_string(), spec.name.clone());
            let instance = InstanceRef {
                id,
                workload: spec.name.clone(),
                ordinal: None,
                status: InstanceStatus::Pending,
                labels,
                spec_hash: spec.spec_hash(),
                address: InstanceAddress {
                    hostname: stateless_hostname(&spec.name, &id),
                    ip: overlay_ipv6(&id),
                },
                request: spec.request,
                reservation: Some(reservation.id()),
                seq: *next_seq,
            };

            if let Err(e) = self.deps.substrate.launch(&launch_request(spec, &instance, None)).await {
                self.deps.gate.release(reservation);
                return Err((created, e.into()));
            }

            info!(instance_id = %id, seq = *next_seq, "Instance created");
            *next_seq += 1;
            members.push(Member::new(instance, reservation, None));
            created += 1;
        }
        Ok(created)
    }

    /// Tear down every member. Used when the workload is removed.
    pub async fn drain_all(&self) -> ControllerResult<u32> {
        self.set_desired(0);
        let mut state = self.state.lock().await;

        let mut drained = 0;
        let mut first_error = None;
        let mut retained = Vec::new();
        for mut member in state.members.drain(..) {
            match teardown(&self.deps, &mut member).await {
                Ok(()) => drained += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                    retained.push(member);
                }
            }
        }
        state.members = retained;

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(drained),
        }
    }

    pub async fn status(&self) -> WorkloadStatus {
        let state = self.state.lock().await;
        let desired = self.desired();
        let active = state.members.iter().filter(|m| m.status().is_active()).count() as u32;
        let running = state
            .members
            .iter()
            .filter(|m| m.status() == InstanceStatus::Running)
            .count() as u32;

        WorkloadStatus {
            name: self.name.clone(),
            kind: WorkloadKind::Deployment,
            desired,
            active,
            running,
            convergence: convergence(desired, running, active, &state.conditions),
            conditions: state.conditions.to_vec(),
            instances: state.members.iter().map(|m| m.instance.clone()).collect(),
        }
    }

    /// Ids of Running instances, oldest first.
    pub async fn running_instances(&self) -> Vec<InstanceId> {
        let state = self.state.lock().await;
        state
            .members
            .iter()
            .filter(|m| m.status() == InstanceStatus::Running)
            .map(|m| m.id())
            .collect()
    }

    /// Re-arm automatic replacement after a replacement storm.
    pub async fn reset_replacement_guard(&self) {
        let mut state = self.state.lock().await;
        state.guard.reset();
        state.conditions.clear(ConditionKind::ReplacementStorm);
        info!(workload = %self.name, "Replacement guard reset");
    }

    pub async fn raise_condition(&self, kind: ConditionKind, message: impl Into<String>) {
        self.state.lock().await.conditions.raise(kind, message);
    }

    pub async fn clear_condition(&self, kind: ConditionKind) -> bool {
        self.state.lock().await.conditions.clear(kind)
    }
}
