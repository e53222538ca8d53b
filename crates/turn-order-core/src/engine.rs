use time::{Duration, OffsetDateTime};

use crate::strategy::{self, BaseOrderTransform};
use crate::{
    get_last_completed_history, resolve_members, Algorithm, Collator, EngineError, ManualMetadata,
    Member, PointsBalanceMetadata, QuotaMetadata, RotationMetadata, StableSettings,
    SwedishCollator, TurnOrderMetadata, TurnOrderRepository, TurnOrderRequest, TurnOrderResult,
};

/// Turn-order orchestrator: resolves members once and dispatches to one strategy.
pub struct TurnOrderEngine {
    collator: Box<dyn Collator>,
}

impl Default for TurnOrderEngine {
    fn default() -> Self {
        Self::new(Box::new(SwedishCollator))
    }
}

impl std::fmt::Debug for TurnOrderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnOrderEngine").finish_non_exhaustive()
    }
}

impl TurnOrderEngine {
    #[must_use]
    pub fn new(collator: Box<dyn Collator>) -> Self {
        Self { collator }
    }

    #[must_use]
    pub fn collator(&self) -> &dyn Collator {
        self.collator.as_ref()
    }

    /// Compute the turn order for one selection occasion.
    ///
    /// `as_of` anchors the Points Balance memory horizon.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for malformed requests and
    /// [`EngineError::Storage`] when any repository read fails.
    pub fn compute_turn_order<R>(
        &self,
        repository: &R,
        request: &TurnOrderRequest,
        as_of: OffsetDateTime,
    ) -> Result<TurnOrderResult, EngineError>
    where
        R: TurnOrderRepository + ?Sized,
    {
        request.validate()?;
        let algorithm = Algorithm::resolve(request.algorithm.as_deref());
        let member_ids = request.distinct_member_ids();
        let members =
            resolve_members(repository, &request.stable_id, &request.organization_id, &member_ids)?;

        tracing::debug!(
            stable_id = %request.stable_id,
            algorithm = algorithm.as_str(),
            members = members.len(),
            "computing turn order"
        );

        match algorithm {
            Algorithm::QuotaBasedDraft => self.quota_based_draft(repository, request, members),
            Algorithm::PointsBalance => {
                self.points_balance(repository, &request.stable_id, members, as_of)
            }
            Algorithm::FairRotation => self.fair_rotation(repository, &request.stable_id, &members),
            Algorithm::Manual => Ok(TurnOrderResult {
                turns: members,
                algorithm: Algorithm::Manual,
                metadata: TurnOrderMetadata::Manual(ManualMetadata::default()),
            }),
        }
    }

    fn quota_based_draft<R>(
        &self,
        repository: &R,
        request: &TurnOrderRequest,
        members: Vec<Member>,
    ) -> Result<TurnOrderResult, EngineError>
    where
        R: TurnOrderRepository + ?Sized,
    {
        let total_available_points = repository
            .sum_open_points_in_range(
                &request.stable_id,
                request.selection_start,
                request.selection_end,
            )
            .map_err(EngineError::Storage)?;
        let quota_per_member = strategy::quota_per_member(total_available_points, members.len());

        let previous = get_last_completed_history(repository, &request.stable_id)?;
        let turns = strategy::reorder_from_previous(
            previous.as_ref(),
            &members,
            BaseOrderTransform::Reverse,
            self.collator(),
        );
        let previous_metadata = RotationMetadata::from_previous(previous.as_ref());

        Ok(TurnOrderResult {
            turns,
            algorithm: Algorithm::QuotaBasedDraft,
            metadata: TurnOrderMetadata::QuotaBasedDraft(QuotaMetadata {
                quota_per_member,
                total_available_points,
                previous_process_id: previous_metadata.previous_process_id,
                previous_process_name: previous_metadata.previous_process_name,
            }),
        })
    }

    fn points_balance<R>(
        &self,
        repository: &R,
        stable_id: &str,
        members: Vec<Member>,
        as_of: OffsetDateTime,
    ) -> Result<TurnOrderResult, EngineError>
    where
        R: TurnOrderRepository + ?Sized,
    {
        let settings = repository
            .stable_settings(stable_id)
            .map_err(EngineError::Storage)?
            .unwrap_or_default();
        let settings = if let Err(err) = settings.validate() {
            tracing::warn!(
                stable_id,
                memory_horizon_days = settings.memory_horizon_days,
                error = %err,
                "stored stable settings out of range, using defaults"
            );
            StableSettings::default()
        } else {
            settings
        };
        let cutoff = memory_cutoff(as_of, settings);
        let completed_work =
            repository.completed_work_since(stable_id, cutoff).map_err(EngineError::Storage)?;

        let member_points_map = strategy::accumulate_points(&members, &completed_work, cutoff);
        let turns = strategy::points_balance_order(&members, &member_points_map, self.collator());

        Ok(TurnOrderResult {
            turns,
            algorithm: Algorithm::PointsBalance,
            metadata: TurnOrderMetadata::PointsBalance(PointsBalanceMetadata {
                member_points_map,
                memory_horizon_days: settings.memory_horizon_days,
            }),
        })
    }

    fn fair_rotation<R>(
        &self,
        repository: &R,
        stable_id: &str,
        members: &[Member],
    ) -> Result<TurnOrderResult, EngineError>
    where
        R: TurnOrderRepository + ?Sized,
    {
        let previous = get_last_completed_history(repository, stable_id)?;
        let turns = strategy::reorder_from_previous(
            previous.as_ref(),
            members,
            BaseOrderTransform::RotateLeft,
            self.collator(),
        );

        Ok(TurnOrderResult {
            turns,
            algorithm: Algorithm::FairRotation,
            metadata: TurnOrderMetadata::FairRotation(RotationMetadata::from_previous(
                previous.as_ref(),
            )),
        })
    }
}

/// Start of the Points Balance window, never earlier than the first instant
/// a nanosecond timestamp key can hold.
fn memory_cutoff(as_of: OffsetDateTime, settings: StableSettings) -> OffsetDateTime {
    let earliest = OffsetDateTime::UNIX_EPOCH.saturating_sub(Duration::nanoseconds(i64::MAX));
    as_of
        .checked_sub(Duration::days(i64::from(settings.memory_horizon_days)))
        .map_or(earliest, |cutoff| cutoff.max(earliest))
}
