//! # ork-id
//!
//! Typed identifiers for the ork orchestration core.
//!
//! Every system-generated identity uses a prefixed format: `{prefix}_{ulid}`.
//!
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F` (workload instance)
//! - `vol_01HV4Z5PZQMUST1KVUB9YENF6G` (storage volume)
//! - `rsv_01HV4Z6Q0RNVTU2MWVCAZFPG7H` (admission reservation)
//!
//! The ULID makes ids sortable by creation time, which the replica
//! controller relies on when it picks the newest instances for eviction.
//! Workloads and services are keyed by operator-chosen names instead.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
