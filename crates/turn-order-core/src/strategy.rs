//! Pure ordering strategies over resolved members.
//!
//! Nothing in this module touches storage. The engine reads the supporting
//! aggregates and hands them in, which keeps every rule here testable with
//! plain values.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use time::OffsetDateTime;

use crate::{Collator, Member, RotationHistoryRecord, WorkItem};

/// How the previous turn order becomes the base of the next one.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BaseOrderTransform {
    /// Last picker picks first.
    Reverse,
    /// Second becomes first, first goes to the back.
    RotateLeft,
}

/// Display name through the collator, then user ID, so the order is total.
#[must_use]
pub fn compare_members(lhs: &Member, rhs: &Member, collator: &dyn Collator) -> Ordering {
    collator
        .compare(&lhs.user_name, &rhs.user_name)
        .then_with(|| lhs.user_id.cmp(&rhs.user_id))
}

#[must_use]
pub fn alphabetical(members: &[Member], collator: &dyn Collator) -> Vec<Member> {
    let mut ordered = members.to_vec();
    ordered.sort_by(|lhs, rhs| compare_members(lhs, rhs, collator));
    ordered
}

/// Rebuild a turn order from the previous rotation.
///
/// The previous order is transformed first and then filtered to the current
/// members; members who left are dropped silently. Newcomers follow,
/// alphabetically among themselves. Without a previous rotation the order is
/// plain alphabetical.
#[must_use]
pub fn reorder_from_previous(
    previous: Option<&RotationHistoryRecord>,
    members: &[Member],
    transform: BaseOrderTransform,
    collator: &dyn Collator,
) -> Vec<Member> {
    let Some(previous) = previous else {
        return alphabetical(members, collator);
    };

    let mut base = previous.ordered_user_ids();
    match transform {
        BaseOrderTransform::Reverse => base.reverse(),
        BaseOrderTransform::RotateLeft => {
            if !base.is_empty() {
                base.rotate_left(1);
            }
        }
    }

    let by_id = members
        .iter()
        .map(|member| (member.user_id.as_str(), member))
        .collect::<BTreeMap<_, _>>();
    let mut placed = BTreeSet::new();
    let mut ordered = Vec::with_capacity(members.len());
    for user_id in base {
        if let Some(member) = by_id.get(user_id) {
            if placed.insert(user_id) {
                ordered.push((*member).clone());
            }
        }
    }

    let newcomers = members
        .iter()
        .filter(|member| !placed.contains(member.user_id.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    ordered.extend(alphabetical(&newcomers, collator));
    ordered
}

/// Fair share of the available points, rounded half-up to one decimal.
#[must_use]
pub fn quota_per_member(total_available_points: f64, member_count: usize) -> f64 {
    if member_count == 0 {
        return 0.0;
    }
    let count = f64::from(u32::try_from(member_count).unwrap_or(u32::MAX));
    round_half_up_one_decimal(total_available_points / count)
}

fn round_half_up_one_decimal(value: f64) -> f64 {
    (value * 10.0 + 0.5).floor() / 10.0
}

/// Points credited to each current member from work completed at or after `cutoff`.
///
/// Every member starts at zero; completions by anyone else are ignored.
#[must_use]
pub fn accumulate_points(
    members: &[Member],
    completed_work: &[WorkItem],
    cutoff: OffsetDateTime,
) -> BTreeMap<String, f64> {
    let mut totals =
        members.iter().map(|member| (member.user_id.clone(), 0.0)).collect::<BTreeMap<_, _>>();

    for item in completed_work {
        let (Some(completed_by), Some(completed_at)) = (&item.completed_by, item.completed_at)
        else {
            continue;
        };
        if completed_at < cutoff {
            continue;
        }
        if let Some(total) = totals.get_mut(completed_by) {
            *total += item.credited_points();
        }
    }

    totals
}

/// Fewest points first, ties alphabetical.
///
/// The output is the input members re-sorted, so its length always equals
/// the member count.
#[must_use]
pub fn points_balance_order(
    members: &[Member],
    points: &BTreeMap<String, f64>,
    collator: &dyn Collator,
) -> Vec<Member> {
    let mut ranked = members
        .iter()
        .map(|member| (points.get(&member.user_id).copied().unwrap_or(0.0), member))
        .collect::<Vec<_>>();
    ranked.sort_by(|(lhs_points, lhs), (rhs_points, rhs)| {
        lhs_points.total_cmp(rhs_points).then_with(|| compare_members(lhs, rhs, collator))
    });
    ranked.into_iter().map(|(_, member)| member.clone()).collect()
}
