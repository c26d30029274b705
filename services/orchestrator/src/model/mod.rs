//! Core data model: templates, instances, resources.

mod instance;
mod resources;
mod workload;

pub use instance::{overlay_ipv6, InstanceAddress, InstanceRef, InstanceStatus};
pub use resources::{format_bytes, parse_bytes, parse_cpu, QuantityError, Resources};
pub use workload::{
    AccessMode, ContainerPort, EnvBinding, EnvValue, Labels, SecretRef, Selector,
    StorageTemplate, WorkloadSpec, LABEL_ORDINAL, LABEL_WORKLOAD,
};
