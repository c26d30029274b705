//! Coalescing of reconciliation passes.
//!
//! Each reconciled object owns one `PassGate`. A trigger that arrives while
//! a pass is running does not queue another pass; it raises a flag that the
//! running owner observes before it lets go, so any number of overlapping
//! triggers collapse into at most one follow-up pass.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct PassGate {
    in_flight: AtomicBool,
    requested: AtomicBool,
}

impl PassGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pass.
    ///
    /// Returns a guard if the caller became the owner and must run passes,
    /// or `None` if the request was folded into the pass already running.
    pub fn enter(&self) -> Option<PassGuard<'_>> {
        self.requested.store(true, Ordering::SeqCst);
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PassGuard {
                gate: self,
                held: true,
            })
    }
}

/// Ownership of a gate. Run one pass per `next_pass() == true`.
#[derive(Debug)]
pub struct PassGuard<'a> {
    gate: &'a PassGate,
    held: bool,
}

impl PassGuard<'_> {
    /// Consume the pending request, if any.
    ///
    /// Returns false once no request is outstanding; ownership is released
    /// at that point. A request that races with the release is picked up
    /// by re-acquiring the gate here rather than being lost.
    pub fn next_pass(&mut self) -> bool {
        loop {
            if !self.held {
                return false;
            }
            if self.gate.requested.swap(false, Ordering::SeqCst) {
                return true;
            }

            self.gate.in_flight.store(false, Ordering::SeqCst);
            self.held = false;

            if !self.gate.requested.load(Ordering::SeqCst) {
                return false;
            }
            if self
                .gate
                .in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // Another caller took ownership and will run the pass.
                return false;
            }
            self.held = true;
        }
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.gate.in_flight.store(false, Ordering::SeqCst);
        }
    }
}
