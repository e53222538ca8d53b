use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::{
    BoxError, MemberProfile, RotationHistoryRecord, Selection, StableSettings, WorkItem,
};

/// Storage contract consumed by the engine.
///
/// Lookups return `Ok(None)` for missing documents; `Err` is reserved for
/// storage failures, which the engine propagates without retrying.
pub trait TurnOrderRepository {
    /// Membership keyed by organization and user.
    ///
    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    fn organization_member(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberProfile>, BoxError>;

    /// Membership scoped to a single stable.
    ///
    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    fn stable_member(&self, stable_id: &str, user_id: &str)
        -> Result<Option<MemberProfile>, BoxError>;

    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    fn stable_owner(&self, stable_id: &str) -> Result<Option<String>, BoxError>;

    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    fn user_profile(&self, user_id: &str) -> Result<Option<MemberProfile>, BoxError>;

    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    fn stable_settings(&self, stable_id: &str) -> Result<Option<StableSettings>, BoxError>;

    /// Sum of `points_value` over open work items scheduled in `[start, end]`.
    ///
    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    fn sum_open_points_in_range(
        &self,
        stable_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<f64, BoxError>;

    /// Completed work items with `completed_at >= cutoff`.
    ///
    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    fn completed_work_since(
        &self,
        stable_id: &str,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<WorkItem>, BoxError>;

    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    fn selections_for_process(&self, process_id: &str) -> Result<Vec<Selection>, BoxError>;

    /// Newest history record for the stable by `completed_at`.
    ///
    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    fn last_completed_history(
        &self,
        stable_id: &str,
    ) -> Result<Option<RotationHistoryRecord>, BoxError>;

    /// Append one immutable history record.
    ///
    /// # Errors
    /// Returns an error when the record cannot be written.
    fn append_history(&mut self, record: &RotationHistoryRecord) -> Result<(), BoxError>;
}

/// Repository held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    organization_members: BTreeMap<(String, String), MemberProfile>,
    stable_members: BTreeMap<(String, String), MemberProfile>,
    stable_owners: BTreeMap<String, String>,
    user_profiles: BTreeMap<String, MemberProfile>,
    stable_settings: BTreeMap<String, StableSettings>,
    work_items: Vec<WorkItem>,
    selections: Vec<Selection>,
    history: Vec<RotationHistoryRecord>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_organization_member(
        &mut self,
        organization_id: &str,
        user_id: &str,
        profile: MemberProfile,
    ) {
        self.organization_members
            .insert((organization_id.to_string(), user_id.to_string()), profile);
    }

    pub fn upsert_stable_member(&mut self, stable_id: &str, user_id: &str, profile: MemberProfile) {
        self.stable_members.insert((stable_id.to_string(), user_id.to_string()), profile);
    }

    pub fn set_stable_owner(&mut self, stable_id: &str, owner_id: &str) {
        self.stable_owners.insert(stable_id.to_string(), owner_id.to_string());
    }

    pub fn upsert_user_profile(&mut self, user_id: &str, profile: MemberProfile) {
        self.user_profiles.insert(user_id.to_string(), profile);
    }

    pub fn set_stable_settings(&mut self, stable_id: &str, settings: StableSettings) {
        self.stable_settings.insert(stable_id.to_string(), settings);
    }

    pub fn add_work_item(&mut self, item: WorkItem) {
        self.work_items.push(item);
    }

    pub fn add_selection(&mut self, selection: Selection) {
        self.selections.push(selection);
    }

    /// Every archived record for the stable, newest first.
    #[must_use]
    pub fn history_for_stable(&self, stable_id: &str) -> Vec<RotationHistoryRecord> {
        let mut records = self
            .history
            .iter()
            .enumerate()
            .filter(|(_, record)| record.stable_id == stable_id)
            .collect::<Vec<_>>();
        records.sort_by(|(lhs_index, lhs), (rhs_index, rhs)| {
            rhs.completed_at.cmp(&lhs.completed_at).then_with(|| rhs_index.cmp(lhs_index))
        });
        records.into_iter().map(|(_, record)| record.clone()).collect()
    }
}

impl TurnOrderRepository for InMemoryRepository {
    fn organization_member(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberProfile>, BoxError> {
        Ok(self
            .organization_members
            .get(&(organization_id.to_string(), user_id.to_string()))
            .cloned())
    }

    fn stable_member(
        &self,
        stable_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberProfile>, BoxError> {
        Ok(self.stable_members.get(&(stable_id.to_string(), user_id.to_string())).cloned())
    }

    fn stable_owner(&self, stable_id: &str) -> Result<Option<String>, BoxError> {
        Ok(self.stable_owners.get(stable_id).cloned())
    }

    fn user_profile(&self, user_id: &str) -> Result<Option<MemberProfile>, BoxError> {
        Ok(self.user_profiles.get(user_id).cloned())
    }

    fn stable_settings(&self, stable_id: &str) -> Result<Option<StableSettings>, BoxError> {
        Ok(self.stable_settings.get(stable_id).copied())
    }

    fn sum_open_points_in_range(
        &self,
        stable_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<f64, BoxError> {
        Ok(self
            .work_items
            .iter()
            .filter(|item| item.stable_id == stable_id && item.is_open())
            .filter(|item| item.scheduled_at >= start && item.scheduled_at <= end)
            .map(|item| item.points_value)
            .sum())
    }

    fn completed_work_since(
        &self,
        stable_id: &str,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<WorkItem>, BoxError> {
        Ok(self
            .work_items
            .iter()
            .filter(|item| item.stable_id == stable_id)
            .filter(|item| item.completed_at.is_some_and(|completed_at| completed_at >= cutoff))
            .cloned()
            .collect())
    }

    fn selections_for_process(&self, process_id: &str) -> Result<Vec<Selection>, BoxError> {
        Ok(self
            .selections
            .iter()
            .filter(|selection| selection.process_id == process_id)
            .cloned()
            .collect())
    }

    fn last_completed_history(
        &self,
        stable_id: &str,
    ) -> Result<Option<RotationHistoryRecord>, BoxError> {
        // `max_by_key` keeps the last maximum, so equal timestamps resolve to the latest append.
        Ok(self
            .history
            .iter()
            .filter(|record| record.stable_id == stable_id)
            .max_by_key(|record| record.completed_at)
            .cloned())
    }

    fn append_history(&mut self, record: &RotationHistoryRecord) -> Result<(), BoxError> {
        self.history.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Algorithm, HistoryId};
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn work(id: &str, scheduled_offset_days: i64, points: f64) -> WorkItem {
        WorkItem {
            work_item_id: id.to_string(),
            stable_id: "stable-1".to_string(),
            scheduled_at: fixture_time() + Duration::days(scheduled_offset_days),
            points_value: points,
            points_awarded: None,
            assigned_to: None,
            completed_by: None,
            completed_at: None,
        }
    }

    fn history(process_id: &str, completed_at: OffsetDateTime) -> RotationHistoryRecord {
        RotationHistoryRecord {
            history_id: HistoryId::new(),
            process_id: process_id.to_string(),
            process_name: process_id.to_string(),
            organization_id: "org-1".to_string(),
            stable_id: "stable-1".to_string(),
            algorithm: Algorithm::FairRotation,
            final_turn_order: Vec::new(),
            completed_at,
        }
    }

    #[test]
    fn open_points_sum_is_inclusive_and_skips_assigned_or_completed_items() {
        let mut repository = InMemoryRepository::new();
        repository.add_work_item(work("before", -1, 100.0));
        repository.add_work_item(work("start", 0, 2.0));
        repository.add_work_item(work("end", 7, 3.0));
        repository.add_work_item(work("after", 8, 100.0));

        let mut assigned = work("assigned", 3, 50.0);
        assigned.assigned_to = Some("u1".to_string());
        repository.add_work_item(assigned);

        let mut other_stable = work("other", 3, 50.0);
        other_stable.stable_id = "stable-2".to_string();
        repository.add_work_item(other_stable);

        let total = match repository.sum_open_points_in_range(
            "stable-1",
            fixture_time(),
            fixture_time() + Duration::days(7),
        ) {
            Ok(total) => total,
            Err(err) => panic!("in-memory sum should succeed: {err}"),
        };
        assert!((total - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn last_completed_history_prefers_newest_then_latest_append() {
        let mut repository = InMemoryRepository::new();
        for record in [
            history("old", fixture_time()),
            history("new-a", fixture_time() + Duration::days(1)),
            history("new-b", fixture_time() + Duration::days(1)),
        ] {
            if let Err(err) = repository.append_history(&record) {
                panic!("in-memory append should succeed: {err}");
            }
        }

        let last = match repository.last_completed_history("stable-1") {
            Ok(Some(record)) => record,
            Ok(None) => panic!("history should exist"),
            Err(err) => panic!("in-memory read should succeed: {err}"),
        };
        assert_eq!(last.process_id, "new-b");

        let listed = repository
            .history_for_stable("stable-1")
            .into_iter()
            .map(|record| record.process_id)
            .collect::<Vec<_>>();
        assert_eq!(listed, vec!["new-b", "new-a", "old"]);

        assert!(matches!(repository.last_completed_history("stable-2"), Ok(None)));
    }
}
