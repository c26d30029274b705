//! Reconciliation loop primitives.
//!
//! Helpers shared by the replica, stateful and autoscale controllers. Every
//! controller is level-triggered: it compares desired state with observed
//! state on each pass and issues corrective actions, so a missed or
//! duplicated trigger never changes the outcome.
//!
//! # Invariants
//!
//! - All decisions are deterministic given the same inputs (jitter aside)
//! - Repeating a pass with no state change is a no-op
//! - At most one pass per owner is in flight; extra triggers coalesce

mod backoff;
mod gate;

pub use backoff::{Backoff, BackoffPolicy};
pub use gate::{PassGate, PassGuard};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Convergence status for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Observed state matches desired state.
    Converged,

    /// Corrective actions are in flight.
    Converging,

    /// Progress is blocked (capacity, replacement storm, conflicts).
    Stalled,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// A spec hash for deterministic template comparison.
///
/// Instances remember the hash of the template they were created from, so
/// replacing a template wholesale marks every existing instance as old.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    // serde_json's string encoder already escapes control characters.
    serde_json::Value::String(s.to_string()).to_string()
}

/// Eviction priority for scale-down.
///
/// Lower values are evicted first. Running instances are ordered newest
/// first: the oldest members are the ones most likely to hold established
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvictionPriority {
    /// Instance has failed (evict first).
    Failed,

    /// Instance has not reported ready yet.
    Pending,

    /// Instance is serving; ties broken by creation order, newest first.
    Running,
}

/// Order `instances` for eviction.
///
/// `key` returns the priority class and a creation sequence number. Within
/// one class, higher sequence numbers (newer instances) come first.
pub fn order_for_eviction<T, F>(instances: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> (EvictionPriority, u64),
{
    let mut keyed: Vec<_> = instances
        .into_iter()
        .map(|i| {
            let (priority, seq) = key(&i);
            (priority, std::cmp::Reverse(seq), i)
        })
        .collect();

    keyed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    keyed.into_iter().map(|(_, _, i)| i).collect()
}

/// Rollout strategy for replacing a stateless template.
#[derive(Debug, Clone)]
pub struct RollingStrategy {
    /// Maximum number of instances that can be created above desired count.
    pub max_surge: u32,

    /// Maximum number of instances that can be unavailable during rollout.
    pub max_unavailable: u32,
}

impl Default for RollingStrategy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

impl RollingStrategy {
    /// Calculate how many instances to start and how many old ones to drain.
    ///
    /// Returns `(new_to_start, old_to_drain)`. With no old instances this
    /// reduces to "start whatever is missing".
    pub fn calculate_actions(
        &self,
        desired_count: u32,
        matching_ready: u32,
        matching_pending: u32,
        old_active: u32,
    ) -> (u32, u32) {
        let total_active = matching_ready + matching_pending + old_active;

        let need_to_start = desired_count.saturating_sub(matching_ready + matching_pending);
        let new_to_start = if old_active == 0 {
            need_to_start
        } else {
            let max_total = desired_count + self.max_surge;
            max_total.saturating_sub(total_active).min(need_to_start)
        };

        let min_available = desired_count.saturating_sub(self.max_unavailable);
        let available = matching_ready + old_active;
        let can_drain = available.saturating_sub(min_available);
        let old_to_drain = can_drain.min(old_active);

        (new_to_start, old_to_drain)
    }
}

/// Halts automatic replacement after too many consecutive readiness failures.
#[derive(Debug, Clone)]
pub struct ReplacementGuard {
    limit: u32,
    consecutive: u32,
}

impl ReplacementGuard {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    /// Record a failed instance. Returns true if the guard has now tripped.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.is_tripped()
    }

    /// An instance became ready; the streak is over.
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn is_tripped(&self) -> bool {
        self.consecutive >= self.limit
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    /// Operator re-arm after the underlying problem is fixed.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default consecutive readiness failures before replacement halts.
pub const DEFAULT_REPLACEMENT_LIMIT: u32 = 3;

/// Default time an instance may stay Pending before it is failed.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(120);
