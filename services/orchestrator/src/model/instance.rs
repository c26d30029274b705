//! Instance references and addressing.

use std::net::Ipv6Addr;

use ork_id::{InstanceId, Ordinal, ReservationId};
use ork_reconcile::{EvictionPriority, SpecHash};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Labels, Resources};

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Admitted and handed to the substrate; not ready yet.
    Pending,
    /// Ready and registered for discovery.
    Running,
    /// Deregistered and being torn down.
    Terminating,
    /// Readiness never arrived or was lost.
    Failed,
}

impl InstanceStatus {
    /// Pending and Running instances count toward the replica total.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn eviction_priority(&self) -> EvictionPriority {
        match self {
            Self::Failed | Self::Terminating => EvictionPriority::Failed,
            Self::Pending => EvictionPriority::Pending,
            Self::Running => EvictionPriority::Running,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Network identity of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceAddress {
    /// `{workload}-{ordinal}` for stateful members, the instance id otherwise.
    pub hostname: String,
    pub ip: Ipv6Addr,
}

/// Observable reference to one workload instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub id: InstanceId,
    pub workload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<Ordinal>,
    pub status: InstanceStatus,
    pub labels: Labels,
    pub spec_hash: SpecHash,
    pub address: InstanceAddress,
    pub request: Resources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<ReservationId>,
    /// Creation sequence within the owning workload.
    pub seq: u64,
}

/// Derive a stable overlay IPv6 address from an instance id.
///
/// Addresses live in `fd00::/8`; the low 64 bits come from a hash of the id.
pub fn overlay_ipv6(instance_id: &InstanceId) -> Ipv6Addr {
    let mut hasher = Sha256::new();
    hasher.update(instance_id.to_string().as_bytes());
    let hash = hasher.finalize();

    let segment = |i: usize| u16::from_be_bytes([hash[i], hash[i + 1]]);
    Ipv6Addr::new(0xfd00, 0, 0, 0, segment(0), segment(2), segment(4), segment(6))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_ipv6_is_stable_and_private() {
        let id = InstanceId::new();
        let a = overlay_ipv6(&id);
        let b = overlay_ipv6(&id);
        assert_eq!(a, b);
        assert_eq!(a.segments()[0], 0xfd00);
        assert_ne!(overlay_ipv6(&InstanceId::new()), a);
    }

    #[test]
    fn test_active_statuses() {
        assert!(InstanceStatus::Pending.is_active());
        assert!(InstanceStatus::Running.is_active());
        assert!(!InstanceStatus::Terminating.is_active());
        assert!(!InstanceStatus::Failed.is_active());
    }
}
