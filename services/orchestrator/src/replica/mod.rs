//! Replica controller.
//!
//! Level-triggered reconciliation of a stateless workload toward its
//! desired replica count. Each pass:
//!
//! 1. Pumps the signal inbox and applies readiness (Pending -> Running) or
//!    failure (readiness timeout or a not-ready report)
//! 2. Tears down Failed members so the next step replaces them
//! 3. Plans creations and evictions with [`plan`]
//! 4. Evicts in priority order, then admits and launches new instances
//!
//! Consecutive readiness failures trip a replacement guard that halts all
//! further creation until an operator resets it.

mod controller;
mod plan;

pub use controller::ReplicaSetController;
pub use plan::{plan, MemberView, Plan};
