//! Stateful set controller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ork_id::{InstanceId, Ordinal};
use ork_reconcile::{PassGate, ReplacementGuard};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::binder::VolumeStore;
use super::ordering::{check_transition, next_transition, Slot, Transition};
use crate::controller::{
    launch_request, observe, teardown, ControlDeps, ControllerSettings, Member, Observation, PassOutcome,
    PassReport, Throttle,
};
use crate::error::{ControllerError, ControllerResult};
use crate::model::{
    overlay_ipv6, InstanceAddress, InstanceRef, InstanceStatus, WorkloadSpec, LABEL_ORDINAL, LABEL_WORKLOAD,
};
use crate::status::{convergence, ConditionKind, Conditions, WorkloadKind, WorkloadStatus};
use crate::substrate::{SubstrateError, VolumeMount};

struct StatefulState {
    members: BTreeMap<Ordinal, Member>,
    next_seq: u64,
    guard: ReplacementGuard,
    throttle: Throttle,
    conditions: Conditions,
}

impl StatefulState {
    fn slots(&self, spec: &WorkloadSpec) -> BTreeMap<Ordinal, Slot> {
        let hash = spec.spec_hash();
        self.members
            .iter()
            .map(|(ordinal, m)| {
                (
                    *ordinal,
                    Slot {
                        status: m.status(),
                        current: m.instance.spec_hash == hash,
                    },
                )
            })
            .collect()
    }
}

/// Manages identity, storage binding and ordered lifecycle of one stateful
/// workload.
pub struct StatefulSetController {
    name: String,
    spec: ArcSwap<WorkloadSpec>,
    desired: AtomicU32,
    deps: ControlDeps,
    volumes: Arc<VolumeStore>,
    settings: ControllerSettings,
    gate: PassGate,
    state: Mutex<StatefulState>,
}

impl std::fmt::Debug for StatefulSetController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulSetController")
            .field("name", &self.name)
            .field("desired", &self.desired())
            .finish_non_exhaustive()
    }
}

impl StatefulSetController {
    pub fn new(
        spec: WorkloadSpec,
        desired: u32,
        deps: ControlDeps,
        volumes: Arc<VolumeStore>,
        settings: ControllerSettings,
    ) -> Self {
        let state = StatefulState {
            members: BTreeMap::new(),
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
            volumes,
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

    pub fn set_desired(&self, desired: u32) {
        let previous = self.desired.swap(desired, Ordering::SeqCst);
        if previous != desired {
            info!(workload = %self.name, previous, desired, "Desired members changed");
        }
    }

    /// Replace the template. Members are replaced one at a time, highest
    /// ordinal first, once every member is Running.
    pub fn replace_spec(&self, spec: WorkloadSpec) -> bool {
        if self.spec.load().spec_hash() == spec.spec_hash() {
            return false;
        }
        info!(workload = %self.name, to = %spec.spec_hash(), "Template replaced");
        self.spec.store(Arc::new(spec));
        true
    }

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

        self.deps.signals.pump().await;
        let now = Instant::now();

        let StatefulState {
            members,
            guard,
            conditions,
            ..
        } = &mut *state;
        for (ordinal, member) in members.iter_mut() {
            match observe(&self.deps, &self.settings, &spec, member, now).await {
                Observation::Unchanged => {}
                Observation::Promoted => {
                    report.promoted += 1;
                    guard.record_success();
                    conditions.clear(ConditionKind::ReadinessTimeout);
                }
                Observation::Failed(cause) => {
                    report.failed += 1;
                    warn!(ordinal = %ordinal, instance_id = %member.id(), %cause, "Member failed readiness");
                    conditions.raise(
                        ConditionKind::ReadinessTimeout,
                        format!("member {} {cause}", ordinal.hostname(&self.name)),
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

        // Failed members give their ordinal back; it is recreated in order.
        let retiring: Vec<Ordinal> = state
            .members
            .iter()
            .filter(|(_, m)| !m.status().is_active())
            .map(|(o, _)| *o)
            .collect();
        for ordinal in retiring {
            if self.retire(&mut state, ordinal).await {
                report.evicted += 1;
            }
        }

        loop {
            let slots = state.slots(&spec);
            let transition = next_transition(desired, &slots);
            check_transition(&self.name, &slots, transition)?;

            match transition {
                Transition::Destroy(ordinal) | Transition::Replace(ordinal) => {
                    if !self.retire(&mut state, ordinal).await {
                        break;
                    }
                    report.evicted += 1;
                }
                Transition::Create(ordinal) => {
                    if self.create(&mut state, &spec, ordinal, now).await? {
                        report.created += 1;
                    }
                    break;
                }
                Transition::Wait | Transition::Idle => break,
            }
        }

        Ok(report)
    }

    /// Tear down the member at `ordinal` and unbind its volume.
    ///
    /// Returns false if the substrate refused; the member stays Terminating
    /// and keeps its ordinal until a later pass succeeds.
    async fn retire(&self, state: &mut StatefulState, ordinal: Ordinal) -> bool {
        matches!(self.try_retire(state, ordinal).await, Ok(true))
    }

    /// Like `retire`, but hands back the substrate's refusal.
    ///
    /// Returns Ok(false) if no member holds `ordinal`.
    async fn try_retire(&self, state: &mut StatefulState, ordinal: Ordinal) -> Result<bool, SubstrateError> {
        let Some(member) = state.members.get_mut(&ordinal) else {
            return Ok(false);
        };

        if let Err(e) = teardown(&self.deps, member).await {
            warn!(ordinal = %ordinal, error = %e, "Teardown failed; will retry");
            state
                .conditions
                .raise(ConditionKind::SubstrateFailure, e.to_string());
            return Err(e);
        }

        let id = member.id();
        if let Some(volume_id) = member.volume {
            self.volumes.release(&volume_id, &id);
        }
        state.members.remove(&ordinal);
        info!(ordinal = %ordinal, instance_id = %id, "Member removed");
        Ok(true)
    }

    /// Admit, bind storage and launch the member for `ordinal`.
    ///
    /// Returns Ok(false) when creation is held back by the replacement guard
    /// or by backoff.
    async fn create(
        &self,
        state: &mut StatefulState,
        spec: &WorkloadSpec,
        ordinal: Ordinal,
        now: Instant,
    ) -> ControllerResult<bool> {
        if state.guard.is_tripped() {
            return Err(ControllerError::ReplacementStorm {
                failures: state.guard.consecutive_failures(),
            });
        }
        if !state.throttle.ready(now) {
            debug!(ordinal = %ordinal, "Creation deferred by backoff");
            return Ok(false);
        }

        let reservation = match self.deps.gate.reserve(spec.request, spec.limit) {
            Ok(r) => r,
            Err(e) => {
                let delay = state.throttle.defer(now);
                warn!(ordinal = %ordinal, error = %e, retry_in = ?delay, "Admission refused");
                state
                    .conditions
                    .raise(ConditionKind::InsufficientCapacity, format!("{e}; retrying in {delay:?}"));
                return Err(e.into());
            }
        };

        let id = InstanceId::new();
        let volume = match &spec.storage {
            Some(template) => match self.volumes.claim(&self.name, ordinal, id, template) {
                Ok(v) => Some(VolumeMount {
                    volume_id: v.id,
                    capacity_bytes: v.capacity_bytes,
                    access_mode: v.access_mode,
                }),
                Err(e) => {
                    // The later claimant backs off against the binder's state.
                    self.deps.gate.release(reservation);
                    let delay = state.throttle.defer(now);
                    warn!(ordinal = %ordinal, error = %e, retry_in = ?delay, "Storage binding conflict");
                    state
                        .conditions
                        .raise(ConditionKind::StorageBindingConflict, e.to_string());
                    return Err(e.into());
                }
            },
            None => None,
        };

        let mut labels = spec.labels.clone();
        labels.insert(LABEL_WORKLOAD.to_string(), self.name.clone());
        labels.insert(LABEL_ORDINAL.to_string(), ordinal.to_string());
        let instance = InstanceRef {
            id,
            workload: self.name.clone(),
            ordinal: Some(ordinal),
            status: InstanceStatus::Pending,
            labels,
            spec_hash: spec.spec_hash(),
            address: InstanceAddress {
                hostname: ordinal.hostname(&self.name),
                ip: overlay_ipv6(&id),
            },
            request: spec.request,
            reservation: Some(reservation.id()),
            seq: state.next_seq,
        };

        let volume_id = volume.as_ref().map(|v| v.volume_id);
        if let Err(e) = self
            .deps
            .substrate
            .launch(&launch_request(spec, &instance, volume))
            .await
        {
            if let Some(volume_id) = volume_id {
                self.volumes.release(&volume_id, &id);
            }
            self.deps.gate.release(reservation);
            let delay = state.throttle.defer(now);
            warn!(ordinal = %ordinal, error = %e, retry_in = ?delay, "Launch failed");
            state
                .conditions
                .raise(ConditionKind::SubstrateFailure, e.to_string());
            return Err(e.into());
        }

        info!(
            ordinal = %ordinal,
            instance_id = %id,
            volume_id = ?volume_id,
            hostname = %instance.address.hostname,
            "Member created"
        );
        state.next_seq += 1;
        state.throttle.reset();
        state.conditions.clear(ConditionKind::InsufficientCapacity);
        state.conditions.clear(ConditionKind::StorageBindingConflict);
        state
            .members
            .insert(ordinal, Member::new(instance, reservation, volume_id));
        Ok(true)
    }

    /// Delete the member at `ordinal`. Operator action: the ordinal is
    /// recreated by the next pass, bound to the same volume.
    pub async fn delete_member(&self, ordinal: Ordinal) -> bool {
        let mut state = self.state.lock().await;
        self.retire(&mut state, ordinal).await
    }

    /// Tear down every member, highest ordinal first.
    ///
    /// Stops at the first refusal so lower ordinals never go before a
    /// higher one; the refused member stays Terminating.
    pub async fn drain_all(&self) -> ControllerResult<u32> {
        self.set_desired(0);
        let mut state = self.state.lock().await;

        let mut drained = 0;
        let ordinals: Vec<Ordinal> = state.members.keys().rev().copied().collect();
        for ordinal in ordinals {
            if self.try_retire(&mut state, ordinal).await? {
                drained += 1;
            }
        }
        Ok(drained)
    }

    pub async fn member(&self, ordinal: Ordinal) -> Option<InstanceRef> {
        self.state
            .lock()
            .await
            .members
            .get(&ordinal)
            .map(|m| m.instance.clone())
    }

    pub async fn status(&self) -> WorkloadStatus {
        let state = self.state.lock().await;
        let desired = self.desired();
        let active = state.members.values().filter(|m| m.status().is_active()).count() as u32;
        let running = state
            .members
            .values()
            .filter(|m| m.status() == InstanceStatus::Running)
            .count() as u32;

        WorkloadStatus {
            name: self.name.clone(),
            kind: WorkloadKind::StatefulSet,
            desired,
            active,
            running,
            convergence: convergence(desired, running, active, &state.conditions),
            conditions: state.conditions.to_vec(),
            instances: state.members.values().map(|m| m.instance.clone()).collect(),
        }
    }

    pub async fn reset_replacement_guard(&self) {
        let mut state = self.state.lock().await;
        state.guard.reset();
        state.conditions.clear(ConditionKind::ReplacementStorm);
        info!(workload = %self.name, "Replacement guard reset");
    }
}
