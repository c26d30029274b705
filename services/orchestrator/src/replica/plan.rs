//! Pure replica planning: desired count + observed members -> actions.

use ork_id::InstanceId;
use ork_reconcile::{order_for_eviction, RollingStrategy};

use crate::model::InstanceStatus;

/// What the planner needs to know about one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberView {
    pub id: InstanceId,
    pub status: InstanceStatus,
    /// Created from the current template.
    pub current: bool,
    pub seq: u64,
}

/// Corrective actions for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub create: u32,
    /// Members to tear down, in order.
    pub evict: Vec<InstanceId>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.create == 0 && self.evict.is_empty()
    }
}

/// Plan one reconciliation pass.
///
/// Only Pending and Running members count. Surplus members built from the
/// current template are evicted in priority order (Pending before Running,
/// newest Running first). Members built from a replaced template are rolled
/// out under `strategy`: new instances start first and old ones drain only
/// while enough instances remain available.
pub fn plan(desired: u32, members: &[MemberView], strategy: &RollingStrategy) -> Plan {
    let (current, old): (Vec<MemberView>, Vec<MemberView>) = members
        .iter()
        .filter(|m| m.status.is_active())
        .partition(|m| m.current);

    let ready = current
        .iter()
        .filter(|m| m.status == InstanceStatus::Running)
        .count() as u32;
    let pending = current.len() as u32 - ready;

    let (create, drain_old) = strategy.calculate_actions(desired, ready, pending, old.len() as u32);
    let surplus = (current.len() as u32).saturating_sub(desired);

    let key = |m: &MemberView| (m.status.eviction_priority(), m.seq);
    let mut evict: Vec<InstanceId> = order_for_eviction(current, key)
        .into_iter()
        .take(surplus as usize)
        .map(|m| m.id)
        .collect();
    evict.extend(
        order_for_eviction(old, key)
            .into_iter()
            .take(drain_old as usize)
            .map(|m| m.id),
    );

    Plan { create, evict }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn view(status: InstanceStatus, current: bool, seq: u64) -> MemberView {
        MemberView {
            id: InstanceId::new(),
            status,
            current,
            seq,
        }
    }

    fn running(n: usize) -> Vec<MemberView> {
        (0..n)
            .map(|i| view(InstanceStatus::Running, true, i as u64))
            .collect()
    }

    #[rstest]
    #[case(3, 0, 3, 0)]
    #[case(3, 3, 0, 0)]
    #[case(2, 4, 0, 2)]
    #[case(0, 2, 0, 2)]
    fn test_plan_counts(
        #[case] desired: u32,
        #[case] members: usize,
        #[case] create: u32,
        #[case] evict: usize,
    ) {
        let plan = plan(desired, &running(members), &RollingStrategy::default());
        assert_eq!(plan.create, create);
        assert_eq!(plan.evict.len(), evict);
    }

    #[test]
    fn test_scale_down_prefers_pending_then_newest_running() {
        let oldest = view(InstanceStatus::Running, true, 1);
        let newest = view(InstanceStatus::Running, true, 7);
        let pending = view(InstanceStatus::Pending, true, 3);
        let members = vec![oldest, newest, pending];

        let plan = plan(1, &members, &RollingStrategy::default());
        assert_eq!(plan.evict, vec![pending.id, newest.id]);
    }

    #[test]
    fn test_inactive_members_are_ignored() {
        let mut members = running(2);
        members.push(view(InstanceStatus::Failed, true, 9));
        members.push(view(InstanceStatus::Terminating, true, 10));

        assert!(plan(2, &members, &RollingStrategy::default()).is_noop());
    }

    #[test]
    fn test_rollout_surges_before_draining() {
        let old: Vec<_> = (0..2)
            .map(|i| view(InstanceStatus::Running, false, i))
            .collect();

        let first = plan(2, &old, &RollingStrategy::default());
        assert_eq!(first.create, 1);
        assert!(first.evict.is_empty());

        let mut members = old.clone();
        members.push(view(InstanceStatus::Running, true, 5));
        let second = plan(2, &members, &RollingStrategy::default());
        assert_eq!(second.create, 0);
        assert_eq!(second.evict, vec![old[1].id]);
    }

    fn arb_members() -> impl Strategy<Value = Vec<MemberView>> {
        prop::collection::vec(
            (
                prop_oneof![
                    Just(InstanceStatus::Pending),
                    Just(InstanceStatus::Running),
                    Just(InstanceStatus::Failed),
                ],
                0u64..1000,
            ),
            0..12,
        )
        .prop_map(|v| {
            v.into_iter()
                .map(|(status, seq)| view(status, true, seq))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_plan_lands_on_desired(desired in 0u32..10, members in arb_members()) {
            let plan = plan(desired, &members, &RollingStrategy::default());
            let active = members.iter().filter(|m| m.status.is_active()).count() as u32;

            prop_assert_eq!(active + plan.create - plan.evict.len() as u32, desired);
            prop_assert!(plan.create == 0 || plan.evict.is_empty());
        }

        #[test]
        fn prop_running_evicted_only_after_pending(desired in 0u32..10, members in arb_members()) {
            let plan = plan(desired, &members, &RollingStrategy::default());
            let status_of = |id: &InstanceId| members.iter().find(|m| &m.id == id).map(|m| m.status);

            let evicts_running = plan.evict.iter().any(|id| status_of(id) == Some(InstanceStatus::Running));
            if evicts_running {
                let pending_left = members.iter().any(|m| {
                    m.status == InstanceStatus::Pending && !plan.evict.contains(&m.id)
                });
                prop_assert!(!pending_left);
            }
        }
    }
}
