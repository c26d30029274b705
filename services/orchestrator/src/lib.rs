//! ork orchestrator library.
//!
//! The workload orchestration core: it keeps stateless replica sets at
//! their desired size, scales them from observed CPU utilization, gives
//! stateful members stable identity and storage, answers name-based
//! discovery queries, and admits every instance against a capacity budget.
//!
//! ## Architecture
//!
//! ```text
//! AutoscaleController ──> ReplicaSetController ──> AdmissionGate
//!                                │                      ▲
//!                                ▼                      │
//!                          ServiceDirectory <── StatefulSetController ──> VolumeStore
//! ```
//!
//! `Cluster` owns the shared state objects and hands each controller
//! explicit handles at construction. `ControlLoop` drives the periodic
//! sweeps. Readiness and utilization arrive from the `Substrate` through a
//! bounded signal channel that controllers drain without waiting.
//!
//! ## Modules
//!
//! - `admission`: capacity ledger
//! - `replica`: stateless reconciliation
//! - `stateful`: ordinals, volume binding, ordered lifecycle
//! - `directory`: service discovery
//! - `autoscale`: utilization-driven scaling
//! - `manifest`: TOML manifests and connection strings

pub mod admission;
pub mod autoscale;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod directory;
pub mod error;
pub mod manifest;
pub mod model;
pub mod replica;
pub mod signals;
pub mod stateful;
pub mod status;
pub mod substrate;
pub mod worker;

// Re-export commonly used types
pub use admission::{AdmissionError, AdmissionGate, Reservation};
pub use autoscale::{AutoscaleController, AutoscalePolicy, Decision, HoldReason};
pub use cluster::{AutoscaleStats, Cluster, ReconcileStats};
pub use controller::{ControlDeps, ControllerSettings, PassOutcome, PassReport};
pub use directory::{DirectoryError, Endpoint, ServiceDirectory, ServiceEntry};
pub use error::{ControllerError, ControllerResult};
pub use manifest::{ConnectionString, CredentialPolicy, ManifestError, ManifestSet};
pub use replica::ReplicaSetController;
pub use signals::{SignalInbox, SignalSender, UtilizationSample};
pub use stateful::{BindingError, StatefulSetController, StorageVolume, VolumeStore};
pub use status::{Condition, ConditionKind, WorkloadStatus};
pub use substrate::{MockSubstrate, Substrate};
