//! Workload templates, labels and selectors.

use std::collections::BTreeMap;

use ork_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

use super::Resources;

/// Instance labels. Ordered so that hashing and display are stable.
pub type Labels = BTreeMap<String, String>;

/// Label used to carry a stateful member's ordinal.
pub const LABEL_ORDINAL: &str = "ork.io/ordinal";

/// Label used to carry the owning workload name.
pub const LABEL_WORKLOAD: &str = "ork.io/workload";

/// Equality-based label selector.
///
/// An instance matches when every selector pair is present in its labels.
/// An empty selector matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn new(pairs: BTreeMap<String, String>) -> Self {
        Self(pairs)
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        !self.0.is_empty() && self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A port the container listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub container_port: u16,
}

/// Reference to a value held by an external secret store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub secret: String,
    pub key: String,
}

/// Value of one environment binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvValue {
    /// Literal value passed through as-is.
    Literal(String),
    /// Resolved by the substrate at launch; never seen by the core.
    SecretRef(SecretRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvBinding {
    pub name: String,
    pub value: EnvValue,
}

/// Volume access mode, mirroring persistent volume claim semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

/// Per-ordinal volume template for stateful workloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTemplate {
    pub access_mode: AccessMode,
    pub capacity_bytes: u64,
}

/// Immutable instance template.
///
/// Controllers hold it behind an `Arc` and only ever swap it for a new
/// template; instances record the hash of the template they came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    pub request: Resources,
    pub limit: Resources,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub env: Vec<EnvBinding>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageTemplate>,
}

impl WorkloadSpec {
    /// Minimal template for a named image with no ports or env.
    pub fn new(name: impl Into<String>, image: impl Into<String>, request: Resources, limit: Resources) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            request,
            limit,
            ports: Vec::new(),
            env: Vec::new(),
            labels: Labels::new(),
            storage: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_port(mut self, container_port: u16) -> Self {
        self.ports.push(ContainerPort {
            name: None,
            container_port,
        });
        self
    }

    pub fn with_storage(mut self, storage: StorageTemplate) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Deterministic hash of the whole template.
    pub fn spec_hash(&self) -> SpecHash {
        // Maps here are keyed by strings, so conversion cannot fail.
        let json = serde_json::to_value(self).unwrap_or_default();
        SpecHash::from_json(&json)
    }

    /// First declared container port, used when a service has no mapping.
    pub fn primary_port(&self) -> Option<u16> {
        self.ports.first().map(|p| p.container_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_matches_subset() {
        let selector = Selector::from_pairs([("app", "mongodb")]);
        assert!(selector.matches(&labels(&[("app", "mongodb"), ("tier", "db")])));
        assert!(!selector.matches(&labels(&[("app", "web")])));
        assert!(!selector.matches(&Labels::new()));
    }

    #[test]
    fn test_empty_selector_matches_nothing() {
        assert!(!Selector::default().matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_spec_hash_tracks_template_changes() {
        let base = WorkloadSpec::new(
            "web",
            "flask-app:1",
            Resources::new(250, 128 << 20),
            Resources::new(500, 256 << 20),
        )
        .with_label("app", "web");

        let same = base.clone();
        let bumped = WorkloadSpec {
            image: "flask-app:2".to_string(),
            ..base.clone()
        };

        assert_eq!(base.spec_hash(), same.spec_hash());
        assert_ne!(base.spec_hash(), bumped.spec_hash());
    }
}
