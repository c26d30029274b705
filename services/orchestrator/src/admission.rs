//! Resource admission gate.
//!
//! The gate is the shared capacity ledger: every instance reserves its
//! resource request here before it is handed to the substrate, and gives the
//! reservation back when it is torn down. Reserve and release run under one
//! mutex, so two callers racing for the last unit of capacity cannot both
//! win. Limits are enforced by the substrate at runtime; the gate only
//! guarantees that admitted demand never exceeds the configured budget.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ork_id::ReservationId;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::Resources;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The request exceeds its own limit in some dimension.
    #[error("request ({request}) exceeds limit ({limit})")]
    InvalidResources { request: Resources, limit: Resources },

    /// Outstanding reservations plus this request exceed capacity.
    #[error("insufficient capacity: requested {requested}, available {available}")]
    InsufficientCapacity {
        requested: Resources,
        available: Resources,
    },
}

/// Proof of an admitted request.
///
/// Not `Clone`: releasing consumes the token, so capacity can only be
/// returned once.
#[derive(Debug)]
#[must_use = "dropping a reservation without releasing it leaks capacity"]
pub struct Reservation {
    id: ReservationId,
    request: Resources,
}

impl Reservation {
    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn request(&self) -> Resources {
        self.request
    }
}

/// Ledger snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionUsage {
    pub capacity: Resources,
    pub reserved: Resources,
    pub outstanding: usize,
}

impl AdmissionUsage {
    pub fn available(&self) -> Resources {
        self.capacity.saturating_sub(&self.reserved)
    }
}

#[derive(Debug, Default)]
struct Ledger {
    reserved: Resources,
    outstanding: HashMap<ReservationId, Resources>,
}

/// The admission gate for one capacity budget.
#[derive(Debug)]
pub struct AdmissionGate {
    capacity: Resources,
    ledger: Mutex<Ledger>,
}

impl AdmissionGate {
    pub fn new(capacity: Resources) -> Self {
        Self {
            capacity,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn capacity(&self) -> Resources {
        self.capacity
    }

    /// Reserve `request` if it fits both its `limit` and the remaining budget.
    pub fn reserve(&self, request: Resources, limit: Resources) -> Result<Reservation, AdmissionError> {
        if !request.fits_within(&limit) {
            return Err(AdmissionError::InvalidResources { request, limit });
        }

        let mut ledger = self.lock();
        let after = ledger
            .reserved
            .checked_add(&request)
            .filter(|total| total.fits_within(&self.capacity));

        let Some(after) = after else {
            let available = self.capacity.saturating_sub(&ledger.reserved);
            debug!(%request, %available, "Admission refused");
            return Err(AdmissionError::InsufficientCapacity {
                requested: request,
                available,
            });
        };

        let id = ReservationId::new();
        ledger.reserved = after;
        ledger.outstanding.insert(id, request);

        debug!(reservation_id = %id, %request, reserved = %after, "Admitted");
        Ok(Reservation { id, request })
    }

    /// Return a reservation's capacity to the budget.
    pub fn release(&self, reservation: Reservation) {
        let mut ledger = self.lock();
        match ledger.outstanding.remove(&reservation.id) {
            Some(request) => {
                ledger.reserved = ledger.reserved.saturating_sub(&request);
                debug!(reservation_id = %reservation.id, reserved = %ledger.reserved, "Released");
            }
            None => {
                // Tokens are move-only, so this means a token from another gate.
                warn!(reservation_id = %reservation.id, "Release of unknown reservation ignored");
            }
        }
    }

    pub fn usage(&self) -> AdmissionUsage {
        let ledger = self.lock();
        AdmissionUsage {
            capacity: self.capacity,
            reserved: ledger.reserved,
            outstanding: ledger.outstanding.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        // The ledger is updated atomically under the lock; a panic elsewhere
        // cannot leave it half-written.
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    const MI: u64 = 1 << 20;

    #[test]
    fn test_reserve_and_release() {
        let gate = AdmissionGate::new(Resources::new(1000, 1024 * MI));
        let request = Resources::new(250, 256 * MI);
        let limit = Resources::new(500, 512 * MI);

        let a = gate.reserve(request, limit).unwrap();
        let b = gate.reserve(request, limit).unwrap();
        assert_eq!(gate.usage().reserved, Resources::new(500, 512 * MI));
        assert_eq!(gate.usage().outstanding, 2);

        gate.release(a);
        assert_eq!(gate.usage().reserved, request);
        gate.release(b);
        assert_eq!(gate.usage().reserved, Resources::ZERO);
        assert_eq!(gate.usage().available(), gate.capacity());
    }

    #[test]
    fn test_request_above_limit_is_invalid() {
        let gate = AdmissionGate::new(Resources::new(4000, 4096 * MI));
        let err = gate
            .reserve(Resources::new(500, 64 * MI), Resources::new(250, 128 * MI))
            .unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidResources { .. }));
        assert_eq!(gate.usage().outstanding, 0);
    }

    #[test]
    fn test_refuses_when_any_dimension_is_exhausted() {
        let gate = AdmissionGate::new(Resources::new(1000, 256 * MI));
        let request = Resources::new(100, 200 * MI);

        let held = gate.reserve(request, request).unwrap();
        let err = gate.reserve(request, request).unwrap_err();
        match err {
            AdmissionError::InsufficientCapacity { available, .. } => {
                assert_eq!(available, Resources::new(900, 56 * MI));
            }
            other => panic!("unexpected error: {other}"),
        }
        gate.release(held);
    }

    #[test]
    fn test_concurrent_reservations_for_last_unit() {
        const N: usize = 16;
        let c = Resources::new(100, 64 * MI);
        let capacity = Resources::new(100 * (N as u64 - 1), 64 * MI * (N as u64 - 1));
        let gate = Arc::new(AdmissionGate::new(capacity));
        let barrier = Arc::new(Barrier::new(N));

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    gate.reserve(c, c)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted = results.iter().filter(|r| r.is_ok()).count();
        let refused: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();

        assert_eq!(admitted, N - 1);
        assert_eq!(refused.len(), 1);
        assert!(matches!(refused[0], AdmissionError::InsufficientCapacity { .. }));
        assert_eq!(gate.usage().reserved, capacity);
    }
}
