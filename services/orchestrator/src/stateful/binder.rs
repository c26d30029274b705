//! Ordinal-sticky storage volumes.
//!
//! One volume per (workload, ordinal), created on first claim and never
//! deleted automatically. A volume is bound to at most one instance at a
//! time; a replacement instance carrying the same ordinal claims the same
//! volume once the previous holder has released it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ork_id::{InstanceId, Ordinal, VolumeId};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{AccessMode, StorageTemplate};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// The ordinal's volume is bound to another instance.
    #[error("volume {volume_id} for {workload}-{ordinal} is bound to {bound_to}")]
    Conflict {
        workload: String,
        ordinal: Ordinal,
        volume_id: VolumeId,
        bound_to: InstanceId,
    },

    #[error("unknown volume {0}")]
    UnknownVolume(VolumeId),

    /// Deleting a volume requires that nothing holds it.
    #[error("volume {volume_id} is bound to {instance_id}")]
    VolumeBound {
        volume_id: VolumeId,
        instance_id: InstanceId,
    },
}

/// A durable volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageVolume {
    pub id: VolumeId,
    pub workload: String,
    pub ordinal: Ordinal,
    pub capacity_bytes: u64,
    pub access_mode: AccessMode,
    pub bound_instance: Option<InstanceId>,
    /// Free-form markers recorded against the volume's data.
    pub annotations: BTreeMap<String, String>,
}

impl StorageVolume {
    pub fn is_bound(&self) -> bool {
        self.bound_instance.is_some()
    }
}

#[derive(Debug, Default)]
struct Volumes {
    by_id: HashMap<VolumeId, StorageVolume>,
    by_ordinal: HashMap<(String, Ordinal), VolumeId>,
}

/// The authoritative binder state.
#[derive(Debug, Default)]
pub struct VolumeStore {
    inner: Mutex<Volumes>,
}

impl VolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the ordinal's volume to `instance_id`, creating it if absent.
    ///
    /// Claiming again for the instance that already holds it is a no-op.
    pub fn claim(
        &self,
        workload: &str,
        ordinal: Ordinal,
        instance_id: InstanceId,
        template: &StorageTemplate,
    ) -> Result<StorageVolume, BindingError> {
        let mut volumes = self.lock();
        let key = (workload.to_string(), ordinal);

        let volume_id = match volumes.by_ordinal.get(&key) {
            Some(id) => *id,
            None => {
                let volume = StorageVolume {
                    id: VolumeId::new(),
                    workload: workload.to_string(),
                    ordinal,
                    capacity_bytes: template.capacity_bytes,
                    access_mode: template.access_mode,
                    bound_instance: None,
                    annotations: BTreeMap::new(),
                };
                info!(
                    volume_id = %volume.id,
                    workload,
                    ordinal = %ordinal,
                    capacity_bytes = volume.capacity_bytes,
                    "Volume created"
                );
                let id = volume.id;
                volumes.by_ordinal.insert(key, id);
                volumes.by_id.insert(id, volume);
                id
            }
        };

        let volume = volumes
            .by_id
            .get_mut(&volume_id)
            .ok_or(BindingError::UnknownVolume(volume_id))?;

        match volume.bound_instance {
            Some(holder) if holder != instance_id => Err(BindingError::Conflict {
                workload: workload.to_string(),
                ordinal,
                volume_id,
                bound_to: holder,
            }),
            _ => {
                volume.bound_instance = Some(instance_id);
                debug!(volume_id = %volume_id, instance_id = %instance_id, "Volume bound");
                Ok(volume.clone())
            }
        }
    }

    /// Unbind a volume from `instance_id`. Returns false if it was not
    /// bound to that instance.
    pub fn release(&self, volume_id: &VolumeId, instance_id: &InstanceId) -> bool {
        let mut volumes = self.lock();
        let Some(volume) = volumes.by_id.get_mut(volume_id) else {
            return false;
        };
        if volume.bound_instance.as_ref() != Some(instance_id) {
            return false;
        }

        volume.bound_instance = None;
        debug!(volume_id = %volume_id, instance_id = %instance_id, "Volume released");
        true
    }

    pub fn get(&self, workload: &str, ordinal: Ordinal) -> Option<StorageVolume> {
        let volumes = self.lock();
        volumes
            .by_ordinal
            .get(&(workload.to_string(), ordinal))
            .and_then(|id| volumes.by_id.get(id))
            .cloned()
    }

    pub fn get_by_id(&self, volume_id: &VolumeId) -> Option<StorageVolume> {
        self.lock().by_id.get(volume_id).cloned()
    }

    /// Record a marker on a volume.
    pub fn annotate(
        &self,
        volume_id: &VolumeId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), BindingError> {
        let mut volumes = self.lock();
        let volume = volumes
            .by_id
            .get_mut(volume_id)
            .ok_or(BindingError::UnknownVolume(*volume_id))?;
        volume.annotations.insert(key.into(), value.into());
        Ok(())
    }

    /// Delete a volume. Operator action; refused while bound.
    pub fn delete(&self, volume_id: &VolumeId) -> Result<StorageVolume, BindingError> {
        let mut volumes = self.lock();
        let volume = volumes
            .by_id
            .get(volume_id)
            .ok_or(BindingError::UnknownVolume(*volume_id))?;

        if let Some(instance_id) = volume.bound_instance {
            warn!(volume_id = %volume_id, instance_id = %instance_id, "Refusing to delete bound volume");
            return Err(BindingError::VolumeBound {
                volume_id: *volume_id,
                instance_id,
            });
        }

        let key = (volume.workload.clone(), volume.ordinal);
        volumes.by_ordinal.remove(&key);
        let removed = volumes
            .by_id
            .remove(volume_id)
            .ok_or(BindingError::UnknownVolume(*volume_id))?;
        info!(volume_id = %volume_id, workload = %removed.workload, ordinal = %removed.ordinal, "Volume deleted");
        Ok(removed)
    }

    /// Volumes of one workload, by ordinal.
    pub fn list(&self, workload: &str) -> Vec<StorageVolume> {
        let mut list: Vec<_> = self
            .lock()
            .by_id
            .values()
            .filter(|v| v.workload == workload)
            .cloned()
            .collect();
        list.sort_by_key(|v| v.ordinal);
        list
    }

    fn lock(&self) -> MutexGuard<'_, Volumes> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
