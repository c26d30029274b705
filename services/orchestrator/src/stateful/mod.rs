//! Identity and storage binding for stateful workloads.
//!
//! Members get a stable ordinal, a stable hostname (`<workload>-<ordinal>`)
//! and a volume bound to that ordinal. Members are created lowest ordinal
//! first, each only once all lower ordinals are Running, and destroyed
//! highest ordinal first. Destroying a member unbinds its volume; the next
//! member with that ordinal binds the same volume again.

mod binder;
mod controller;
mod ordering;

pub use binder::{BindingError, StorageVolume, VolumeStore};
pub use controller::StatefulSetController;
pub use ordering::{check_transition, next_transition, Slot, Transition};
