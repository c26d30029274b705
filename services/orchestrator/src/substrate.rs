//! Executing substrate interface and mock implementation.
//!
//! The substrate actually starts and stops containers. It is an external
//! collaborator: the controllers hand it a `LaunchRequest` and later learn
//! about readiness through the signal inbox, never by waiting on a launch.
//!
//! A mock implementation is provided for development and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ork_id::{InstanceId, Ordinal, VolumeId};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{AccessMode, EnvBinding, InstanceAddress, Resources};
use crate::signals::SignalSender;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubstrateError {
    #[error("launch of {instance_id} failed: {reason}")]
    Launch {
        instance_id: InstanceId,
        reason: String,
    },

    #[error("teardown of {instance_id} failed: {reason}")]
    Teardown {
        instance_id: InstanceId,
        reason: String,
    },
}

/// Volume to attach at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume_id: VolumeId,
    pub capacity_bytes: u64,
    pub access_mode: AccessMode,
}

/// Everything the substrate needs to start one instance.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub instance_id: InstanceId,
    pub workload: String,
    pub image: String,
    pub request: Resources,
    pub limit: Resources,
    pub ports: Vec<u16>,
    pub env: Vec<EnvBinding>,
    pub address: InstanceAddress,
    pub ordinal: Option<Ordinal>,
    pub volume: Option<VolumeMount>,
}

/// Instance lifecycle operations.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Begin starting an instance. Returns once the request is accepted;
    /// readiness is reported separately.
    async fn launch(&self, request: &LaunchRequest) -> Result<(), SubstrateError>;

    /// Stop an instance and release its runtime resources.
    async fn teardown(&self, instance_id: &InstanceId) -> Result<(), SubstrateError>;
}

/// Mock substrate for tests and dev mode.
#[derive(Debug, Default)]
pub struct MockSubstrate {
    /// Reports readiness immediately after launch when set.
    auto_ready: Option<SignalSender>,
    fail_launches: AtomicBool,
    fail_teardowns: AtomicBool,
    launched: Mutex<Vec<LaunchRequest>>,
    torn_down: Mutex<Vec<InstanceId>>,
}

impl MockSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock that reports every launched instance ready right away.
    pub fn auto_ready(signals: SignalSender) -> Self {
        Self {
            auto_ready: Some(signals),
            ..Self::default()
        }
    }

    /// Make subsequent launches fail (or succeed again).
    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent teardowns fail (or succeed again).
    pub fn set_fail_teardowns(&self, fail: bool) {
        self.fail_teardowns.store(fail, Ordering::SeqCst);
    }

    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.launched
            .lock()
            .map(|l| l.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn torn_down(&self) -> Vec<InstanceId> {
        self.torn_down
            .lock()
            .map(|t| t.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

#[async_trait]
impl Substrate for MockSubstrate {
    async fn launch(&self, request: &LaunchRequest) -> Result<(), SubstrateError> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(SubstrateError::Launch {
                instance_id: request.instance_id,
                reason: "mock substrate configured to fail".to_string(),
            });
        }

        info!(
            instance_id = %request.instance_id,
            workload = %request.workload,
            image = %request.image,
            ordinal = ?request.ordinal,
            "[MOCK] Launching instance"
        );

        if let Ok(mut launched) = self.launched.lock() {
            launched.push(request.clone());
        }

        if let Some(signals) = &self.auto_ready {
            if let Err(e) = signals.ready(request.instance_id) {
                warn!(instance_id = %request.instance_id, error = %e, "[MOCK] Readiness signal dropped");
            }
        }

        Ok(())
    }

    async fn teardown(&self, instance_id: &InstanceId) -> Result<(), SubstrateError> {
        if self.fail_teardowns.load(Ordering::SeqCst) {
            return Err(SubstrateError::Teardown {
                instance_id: *instance_id,
                reason: "mock substrate configured to fail".to_string(),
            });
        }

        debug!(instance_id = %instance_id, "[MOCK] Tearing down instance");

        if let Ok(mut torn_down) = self.torn_down.lock() {
            torn_down.push(*instance_id);
        }
        Ok(())
    }
}
