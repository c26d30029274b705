//! The cluster: shared state objects plus the registry of workloads.
//!
//! Every controller is constructed with explicit handles to the admission
//! gate, directory, signal inbox, substrate and volume store owned here.
//! Reconciliation errors stay local to the workload that raised them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::admission::AdmissionGate;
use crate::autoscale::{AutoscaleController, AutoscalePolicy};
use crate::controller::{ControlDeps, ControllerSettings, PassReport};
use crate::directory::{DirectoryError, ServiceDirectory, ServiceEntry};
use crate::error::{ControllerError, ControllerResult};
use crate::manifest::{ConnectionString, ManifestSet, ResolvedConnection};
use crate::model::{Resources, WorkloadSpec};
use crate::replica::ReplicaSetController;
use crate::signals::SignalInbox;
use crate::stateful::{StatefulSetController, VolumeStore};
use crate::status::WorkloadStatus;
use crate::substrate::Substrate;

/// Statistics from a reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub workloads_processed: u32,
    pub workloads_failed: u32,
    pub instances_created: u32,
    pub instances_evicted: u32,
    pub instances_promoted: u32,
    pub instances_failed: u32,
}

impl ReconcileStats {
    fn record(&mut self, report: PassReport) {
        self.instances_created += report.created;
        self.instances_evicted += report.evicted;
        self.instances_promoted += report.promoted;
        self.instances_failed += report.failed;
    }
}

/// Statistics from an autoscale sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoscaleStats {
    pub evaluated: u32,
    pub scaled: u32,
    pub degraded: u32,
    pub failed: u32,
}

pub struct Cluster {
    deps: ControlDeps,
    volumes: Arc<VolumeStore>,
    settings: ControllerSettings,
    deployments: RwLock<BTreeMap<String, Arc<ReplicaSetController>>>,
    stateful_sets: RwLock<BTreeMap<String, Arc<StatefulSetController>>>,
    autoscalers: RwLock<BTreeMap<String, Arc<AutoscaleController>>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("deps", &self.deps)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    pub fn new(
        capacity: Resources,
        substrate: Arc<dyn Substrate>,
        signals: SignalInbox,
        settings: ControllerSettings,
    ) -> Self {
        info!(%capacity, "Creating cluster");
        Self {
            deps: ControlDeps {
                gate: Arc::new(AdmissionGate::new(capacity)),
                directory: Arc::new(ServiceDirectory::new()),
                signals: Arc::new(signals),
                substrate,
            },
            volumes: Arc::new(VolumeStore::new()),
            settings,
            deployments: RwLock::new(BTreeMap::new()),
            stateful_sets: RwLock::new(BTreeMap::new()),
            autoscalers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.deps.gate
    }

    pub fn directory(&self) -> &Arc<ServiceDirectory> {
        &self.deps.directory
    }

    pub fn volumes(&self) -> &Arc<VolumeStore> {
        &self.volumes
    }

    pub fn signals(&self) -> &Arc<SignalInbox> {
        &self.deps.signals
    }

    // =========================================================================
    // Apply / remove
    // =========================================================================

    /// Create a deployment, or update its template and replica count.
    ///
    /// With an autoscaler attached, the replica count is clamped into the
    /// autoscaler's bounds.
    pub async fn apply_deployment(&self, spec: WorkloadSpec, replicas: u32) -> ControllerResult<Arc<ReplicaSetController>> {
        if self.stateful_sets.read().await.contains_key(&spec.name) {
            return Err(ControllerError::InvalidPolicy(format!(
                "'{}' already exists as a stateful set",
                spec.name
            )));
        }

        let name = spec.name.clone();
        let mut deployments = self.deployments.write().await;
        if let Some(existing) = deployments.get(&name) {
            existing.replace_spec(spec);
            let replicas = match self.autoscaler_for(&name).await {
                Some(scaler) => scaler.policy().clamp(replicas),
                None => replicas,
            };
            existing.set_desired(replicas);
            return Ok(Arc::clone(existing));
        }

        info!(workload = %name, replicas, image = %spec.image, "Deployment applied");
        let controller = Arc::new(ReplicaSetController::new(
            spec,
            replicas,
            self.deps.clone(),
            self.settings.clone(),
        ));
        deployments.insert(name, Arc::clone(&controller));
        Ok(controller)
    }

    pub async fn apply_stateful_set(
        &self,
        spec: WorkloadSpec,
        replicas: u32,
    ) -> ControllerResult<Arc<StatefulSetController>> {
        if self.deployments.read().await.contains_key(&spec.name) {
            return Err(ControllerError::InvalidPolicy(format!(
                "'{}' already exists as a deployment",
                spec.name
            )));
        }

        let name = spec.name.clone();
        let mut stateful_sets = self.stateful_sets.write().await;
        if let Some(existing) = stateful_sets.get(&name) {
            existing.replace_spec(spec);
            existing.set_desired(replicas);
            return Ok(Arc::clone(existing));
        }

        info!(workload = %name, replicas, image = %spec.image, "Stateful set applied");
        let controller = Arc::new(StatefulSetController::new(
            spec,
            replicas,
            self.deps.clone(),
            Arc::clone(&self.volumes),
            self.settings.clone(),
        ));
        stateful_sets.insert(name, Arc::clone(&controller));
        Ok(controller)
    }

    pub async fn apply_service(&self, entry: ServiceEntry) {
        self.deps.directory.upsert_service(entry).await;
    }

    /// Attach (or re-attach) an autoscaler to a deployment.
    pub async fn apply_autoscaler(
        &self,
        name: &str,
        target: &str,
        policy: AutoscalePolicy,
    ) -> ControllerResult<Arc<AutoscaleController>> {
        let deployment = self
            .deployment(target)
            .await
            .ok_or_else(|| ControllerError::UnknownWorkload(target.to_string()))?;

        let mut autoscalers = self.autoscalers.write().await;
        if let Some((other, _)) = autoscalers
            .iter()
            .find(|(n, a)| n.as_str() != name && a.target().name() == target)
        {
            return Err(ControllerError::InvalidPolicy(format!(
                "'{target}' is already scaled by '{other}'"
            )));
        }

        let scaler = Arc::new(AutoscaleController::attach(
            name,
            deployment,
            policy,
            Arc::clone(&self.deps.signals),
        ));
        autoscalers.insert(name.to_string(), Arc::clone(&scaler));
        info!(autoscaler = %name, target, "Autoscaler applied");
        Ok(scaler)
    }

    /// Apply a manifest set: services first, then workloads, then autoscalers.
    pub async fn apply_manifests(&self, set: ManifestSet) -> ControllerResult<()> {
        for service in set.services {
            self.apply_service(service).await;
        }
        for deployment in set.deployments {
            self.apply_deployment(deployment.spec, deployment.replicas).await?;
        }
        for stateful_set in set.stateful_sets {
            self.apply_stateful_set(stateful_set.spec, stateful_set.replicas)
                .await?;
        }
        for autoscaler in set.autoscalers {
            self.apply_autoscaler(&autoscaler.name, &autoscaler.target, autoscaler.policy)
                .await?;
        }
        Ok(())
    }

    /// Remove a deployment and its autoscaler, tearing down every instance.
    pub async fn remove_deployment(&self, name: &str) -> ControllerResult<u32> {
        let controller = self
            .deployment(name)
            .await
            .ok_or_else(|| ControllerError::UnknownWorkload(name.to_string()))?;

        self.autoscalers
            .write()
            .await
            .retain(|_, a| a.target().name() != name);
        let drained = controller.drain_all().await?;
        self.deployments.write().await.remove(name);
        info!(workload = %name, drained, "Deployment removed");
        Ok(drained)
    }

    /// Remove a stateful set. Its volumes are kept.
    pub async fn remove_stateful_set(&self, name: &str) -> ControllerResult<u32> {
        let controller = self
            .stateful_set(name)
            .await
            .ok_or_else(|| ControllerError::UnknownWorkload(name.to_string()))?;

        let drained = controller.drain_all().await?;
        self.stateful_sets.write().await.remove(name);
        info!(workload = %name, drained, volumes = self.volumes.list(name).len(), "Stateful set removed");
        Ok(drained)
    }

    pub async fn remove_service(&self, name: &str) -> bool {
        self.deps.directory.remove_service(name).await
    }

    pub async fn remove_autoscaler(&self, name: &str) -> bool {
        self.autoscalers.write().await.remove(name).is_some()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub async fn deployment(&self, name: &str) -> Option<Arc<ReplicaSetController>> {
        self.deployments.read().await.get(name).cloned()
    }

    pub async fn stateful_set(&self, name: &str) -> Option<Arc<StatefulSetController>> {
        self.stateful_sets.read().await.get(name).cloned()
    }

    pub async fn autoscaler(&self, name: &str) -> Option<Arc<AutoscaleController>> {
        self.autoscalers.read().await.get(name).cloned()
    }

    async fn autoscaler_for(&self, target: &str) -> Option<Arc<AutoscaleController>> {
        self.autoscalers
            .read()
            .await
            .values()
            .find(|a| a.target().name() == target)
            .cloned()
    }

    pub async fn status(&self, name: &str) -> Option<WorkloadStatus> {
        if let Some(d) = self.deployment(name).await {
            return Some(d.status().await);
        }
        match self.stateful_set(name).await {
            Some(s) => Some(s.status().await),
            None => None,
        }
    }

    /// Status of every workload, deployments first.
    pub async fn statuses(&self) -> Vec<WorkloadStatus> {
        let deployments: Vec<_> = self.deployments.read().await.values().cloned().collect();
        let stateful_sets: Vec<_> = self.stateful_sets.read().await.values().cloned().collect();

        let mut out = Vec::with_capacity(deployments.len() + stateful_sets.len());
        for d in deployments {
            out.push(d.status().await);
        }
        for s in stateful_sets {
            out.push(s.status().await);
        }
        out
    }

    /// Resolve a connection string's service name to an endpoint.
    pub fn resolve_connection_string(&self, connection: &ConnectionString) -> Result<ResolvedConnection, DirectoryError> {
        connection.resolve(&self.deps.directory)
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Reconcile every workload once. A failing workload is counted and
    /// logged; the others still run.
    #[instrument(skip(self))]
    pub async fn reconcile_all(&self) -> ReconcileStats {
        let mut stats = ReconcileStats::default();

        let deployments: Vec<_> = self.deployments.read().await.values().cloned().collect();
        for controller in deployments {
            stats.workloads_processed += 1;
            match controller.reconcile().await {
                Ok(outcome) => stats.record(outcome.report()),
                Err(e) => {
                    stats.workloads_failed += 1;
                    log_failure(controller.name(), &e);
                }
            }
        }

        let stateful_sets: Vec<_> = self.stateful_sets.read().await.values().cloned().collect();
        for controller in stateful_sets {
            stats.workloads_processed += 1;
            match controller.reconcile().await {
                Ok(outcome) => stats.record(outcome.report()),
                Err(e) => {
                    stats.workloads_failed += 1;
                    log_failure(controller.name(), &e);
                }
            }
        }

        if stats.instances_created > 0 || stats.instances_evicted > 0 || stats.workloads_failed > 0 {
            info!(
                workloads_processed = stats.workloads_processed,
                workloads_failed = stats.workloads_failed,
                instances_created = stats.instances_created,
                instances_evicted = stats.instances_evicted,
                instances_promoted = stats.instances_promoted,
                instances_failed = stats.instances_failed,
                "Reconciliation sweep complete"
            );
        }
        stats
    }

    /// Evaluate every autoscaler once.
    #[instrument(skip(self))]
    pub async fn autoscale_all(&self) -> AutoscaleStats {
        let mut stats = AutoscaleStats::default();

        let autoscalers: Vec<_> = self.autoscalers.read().await.values().cloned().collect();
        for scaler in autoscalers {
            stats.evaluated += 1;
            match scaler.evaluate().await {
                Ok(decision) if decision.is_scale() => stats.scaled += 1,
                Ok(_) => {}
                Err(ControllerError::DegradedMetrics { .. }) => stats.degraded += 1,
                Err(e) => {
                    stats.failed += 1;
                    error!(autoscaler = %scaler.name(), error = %e, "Autoscale evaluation failed");
                }
            }
        }

        debug!(
            evaluated = stats.evaluated,
            scaled = stats.scaled,
            degraded = stats.degraded,
            "Autoscale sweep complete"
        );
        stats
    }
}

fn log_failure(workload: &str, e: &ControllerError) {
    if e.is_retryable() {
        warn!(workload, error = %e, "Workload reconciliation deferred");
    } else {
        error!(workload, error = %e, "Workload reconciliation failed");
    }
}
