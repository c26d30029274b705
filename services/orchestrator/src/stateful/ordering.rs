//! Ordinal sequencing for stateful members.
//!
//! [`next_transition`] picks the single next step; [`check_transition`]
//! verifies the sequence invariant for that step against the observed
//! members immediately before it is carried out.

use std::collections::BTreeMap;

use ork_id::Ordinal;

use crate::error::ControllerError;
use crate::model::InstanceStatus;

/// Observed state of the member holding one ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub status: InstanceStatus,
    /// Created from the current template.
    pub current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Start a member for this ordinal.
    Create(Ordinal),
    /// Tear down the member above the desired count.
    Destroy(Ordinal),
    /// Tear down a member built from a replaced template; it is recreated
    /// with the same ordinal afterwards.
    Replace(Ordinal),
    /// A lower ordinal is not Running yet.
    Wait,
    Idle,
}

/// Choose the next step toward `desired` members.
pub fn next_transition(desired: u32, slots: &BTreeMap<Ordinal, Slot>) -> Transition {
    if let Some((&highest, _)) = slots.last_key_value() {
        if highest.value() >= desired {
            return Transition::Destroy(highest);
        }
    }

    for value in 0..desired {
        let ordinal = Ordinal::new(value);
        match slots.get(&ordinal) {
            None => return Transition::Create(ordinal),
            Some(slot) if slot.status != InstanceStatus::Running => return Transition::Wait,
            Some(_) => {}
        }
    }

    // Every ordinal is present and Running: roll old templates from the top.
    slots
        .iter()
        .rev()
        .find(|(_, slot)| !slot.current)
        .map_or(Transition::Idle, |(&ordinal, _)| Transition::Replace(ordinal))
}

/// Verify that `transition` keeps ordinal order.
pub fn check_transition(
    workload: &str,
    slots: &BTreeMap<Ordinal, Slot>,
    transition: Transition,
) -> Result<(), ControllerError> {
    let violation = |ordinal: Ordinal, reason: &str| ControllerError::OrderingViolation {
        workload: workload.to_string(),
        ordinal,
        reason: reason.to_string(),
    };

    match transition {
        Transition::Create(ordinal) => {
            if slots.contains_key(&ordinal) {
                return Err(violation(ordinal, "ordinal already has a member"));
            }
            if let Some((lower, _)) = slots
                .range(..ordinal)
                .find(|(_, slot)| slot.status != InstanceStatus::Running)
            {
                return Err(violation(ordinal, &format!("ordinal {lower} is not running")));
            }
            let present = slots.range(..ordinal).count() as u32;
            if present != ordinal.value() {
                return Err(violation(ordinal, "a lower ordinal is missing"));
            }
        }
        Transition::Destroy(ordinal) | Transition::Replace(ordinal) => {
            if !slots.contains_key(&ordinal) {
                return Err(violation(ordinal, "ordinal has no member"));
            }
            if let Some((higher, _)) = slots.range(ordinal.next()..).next() {
                if matches!(transition, Transition::Destroy(_)) {
                    return Err(violation(ordinal, &format!("ordinal {higher} is still present")));
                }
            }
            if matches!(transition, Transition::Replace(_))
                && slots.values().any(|s| s.status != InstanceStatus::Running)
            {
                return Err(violation(ordinal, "replacement requires every member running"));
            }
        }
        Transition::Wait | Transition::Idle => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn slots(entries: &[(u32, InstanceStatus, bool)]) -> BTreeMap<Ordinal, Slot> {
        entries
            .iter()
            .map(|&(o, status, current)| (Ordinal::new(o), Slot { status, current }))
            .collect()
    }

    #[test]
    fn test_scale_up_waits_for_lower_ordinals() {
        use InstanceStatus::*;

        assert_eq!(next_transition(3, &slots(&[])), Transition::Create(Ordinal::ZERO));
        assert_eq!(next_transition(3, &slots(&[(0, Pending, true)])), Transition::Wait);
        assert_eq!(
            next_transition(3, &slots(&[(0, Running, true)])),
            Transition::Create(Ordinal::new(1))
        );
        assert_eq!(
            next_transition(2, &slots(&[(0, Running, true), (1, Running, true)])),
            Transition::Idle
        );
    }

    #[test]
    fn test_scale_down_from_highest() {
        use InstanceStatus::*;

        let s = slots(&[(0, Running, true), (1, Running, true), (2, Pending, true)]);
        assert_eq!(next_transition(1, &s), Transition::Destroy(Ordinal::new(2)));
        assert!(check_transition("db", &s, Transition::Destroy(Ordinal::new(1))).is_err());
        assert!(check_transition("db", &s, Transition::Destroy(Ordinal::new(2))).is_ok());
    }

    #[test]
    fn test_replaced_lower_ordinal_is_recreated_first() {
        use InstanceStatus::*;

        // Ordinal 0 failed and was retired while 1 is still serving.
        let s = slots(&[(1, Running, true)]);
        assert_eq!(next_transition(2, &s), Transition::Create(Ordinal::ZERO));
        assert!(check_transition("db", &s, Transition::Create(Ordinal::ZERO)).is_ok());
    }

    #[test]
    fn test_rollout_replaces_highest_old_member() {
        use InstanceStatus::*;

        let s = slots(&[(0, Running, false), (1, Running, false), (2, Running, true)]);
        assert_eq!(next_transition(3, &s), Transition::Replace(Ordinal::new(1)));
    }

    #[test]
    fn test_check_rejects_out_of_order_create() {
        use InstanceStatus::*;

        let s = slots(&[(0, Pending, true)]);
        let err = check_transition("db", &s, Transition::Create(Ordinal::new(1))).unwrap_err();
        assert!(matches!(err, ControllerError::OrderingViolation { .. }));

        let gap = slots(&[(1, Running, true)]);
        assert!(check_transition("db", &gap, Transition::Create(Ordinal::new(2))).is_err());
    }

    fn arb_slots() -> impl Strategy<Value = BTreeMap<Ordinal, Slot>> {
        prop::collection::btree_map(
            (0u32..8).prop_map(Ordinal::new),
            (any::<bool>(), any::<bool>()).prop_map(|(running, current)| Slot {
                status: if running {
                    InstanceStatus::Running
                } else {
                    InstanceStatus::Pending
                },
                current,
            }),
            0..8,
        )
    }

    proptest! {
        #[test]
        fn prop_chosen_transition_passes_its_own_check(desired in 0u32..8, s in arb_slots()) {
            let t = next_transition(desired, &s);
            prop_assert!(check_transition("db", &s, t).is_ok(), "{:?} for {:?}", t, s);
        }
    }
}
