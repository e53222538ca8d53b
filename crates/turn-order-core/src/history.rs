use std::collections::BTreeMap;

use crate::{
    CompletedProcess, EngineError, FinalTurnEntry, HistoryId, RotationHistoryRecord, Selection,
    TurnOrderRepository,
};

/// Most recent archived rotation for a stable, or `None` before the first one.
///
/// # Errors
/// Returns [`EngineError::Storage`] when the history store cannot be read.
pub fn get_last_completed_history<R>(
    repository: &R,
    stable_id: &str,
) -> Result<Option<RotationHistoryRecord>, EngineError>
where
    R: TurnOrderRepository + ?Sized,
{
    repository.last_completed_history(stable_id).map_err(EngineError::Storage)
}

/// Build the immutable history record for a completed process.
///
/// Turns are stored in ascending `order`. Each entry carries the sum of the
/// points its user picked; selections by users outside the turn list are ignored.
#[must_use]
pub fn build_history_record(
    process: &CompletedProcess,
    selections: &[Selection],
) -> RotationHistoryRecord {
    let mut picked = BTreeMap::<&str, f64>::new();
    let own_selections =
        selections.iter().filter(|selection| selection.process_id == process.process_id);
    for selection in own_selections {
        *picked.entry(selection.selected_by.as_str()).or_insert(0.0) += selection.points_value;
    }

    let mut turns = process.turns.iter().collect::<Vec<_>>();
    turns.sort_by_key(|turn| turn.order);
    let final_turn_order = turns
        .into_iter()
        .map(|turn| FinalTurnEntry {
            user_id: turn.user_id.clone(),
            user_name: turn.user_name.clone(),
            order: turn.order,
            selections_count: turn.selections_count,
            total_points_picked: picked.get(turn.user_id.as_str()).copied().unwrap_or(0.0),
        })
        .collect();

    RotationHistoryRecord {
        history_id: HistoryId::new(),
        process_id: process.process_id.clone(),
        process_name: process.process_name.clone(),
        organization_id: process.organization_id.clone(),
        stable_id: process.stable_id.clone(),
        algorithm: process.algorithm,
        final_turn_order,
        completed_at: process.completed_at,
    }
}

/// Archive a completed process as rotation history.
///
/// # Errors
/// Returns [`EngineError::Validation`] for a malformed process and
/// [`EngineError::Storage`] when selections cannot be read or the record
/// cannot be appended.
pub fn save_completed_history<R>(
    repository: &mut R,
    process: &CompletedProcess,
) -> Result<HistoryId, EngineError>
where
    R: TurnOrderRepository + ?Sized,
{
    process.validate()?;
    let selections =
        repository.selections_for_process(&process.process_id).map_err(EngineError::Storage)?;
    let record = build_history_record(process, &selections);
    repository.append_history(&record).map_err(EngineError::Storage)?;

    tracing::info!(
        history_id = %record.history_id,
        process_id = %record.process_id,
        stable_id = %record.stable_id,
        turns = record.final_turn_order.len(),
        "rotation history saved"
    );
    Ok(record.history_id)
}

#[cfg(test)]
mod tests {
    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::{Algorithm, InMemoryRepository, ProcessTurn};

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn turn(user_id: &str, order: u32, selections_count: u32) -> ProcessTurn {
        ProcessTurn {
            user_id: user_id.to_string(),
            user_name: format!("Name {user_id}"),
            order,
            selections_count,
        }
    }

    fn selection(process_id: &str, selected_by: &str, points: f64) -> Selection {
        Selection {
            process_id: process_id.to_string(),
            selected_by: selected_by.to_string(),
            points_value: points,
        }
    }

    fn process(turns: Vec<ProcessTurn>) -> CompletedProcess {
        CompletedProcess {
            process_id: "p1".to_string(),
            process_name: "Vårens pass".to_string(),
            organization_id: "org-1".to_string(),
            stable_id: "stable-1".to_string(),
            algorithm: Algorithm::QuotaBasedDraft,
            turns,
            completed_at: fixture_time(),
        }
    }

    #[test]
    fn record_sums_points_per_user_and_sorts_by_order() {
        let process = process(vec![turn("u2", 2, 1), turn("u1", 1, 2), turn("u3", 3, 0)]);
        let selections = vec![
            selection("p1", "u1", 10.0),
            selection("p1", "u1", 20.0),
            selection("p1", "u2", 5.0),
            selection("p2", "u3", 99.0),
            selection("p1", "outsider", 7.0),
        ];

        let record = build_history_record(&process, &selections);
        assert_eq!(record.ordered_user_ids(), vec!["u1", "u2", "u3"]);
        let orders = record.final_turn_order.iter().map(|entry| entry.order).collect::<Vec<_>>();
        assert_eq!(orders, vec![1, 2, 3]);

        let u1 = &record.final_turn_order[0];
        assert_eq!(u1.selections_count, 2);
        assert_eq!(u1.user_name, "Name u1");
        assert!((u1.total_points_picked - 30.0).abs() < f64::EPSILON);
        assert!((record.final_turn_order[1].total_points_picked - 5.0).abs() < f64::EPSILON);
        assert!(record.final_turn_order[2].total_points_picked.abs() < f64::EPSILON);
        assert_eq!(record.algorithm, Algorithm::QuotaBasedDraft);
        assert_eq!(record.completed_at, fixture_time());
    }

    #[test]
    fn save_appends_record_that_becomes_last_history() {
        let mut repository = InMemoryRepository::new();
        repository.add_selection(selection("p1", "u1", 10.0));
        repository.add_selection(selection("p1", "u1", 20.0));

        let history_id = match save_completed_history(
            &mut repository,
            &process(vec![turn("u1", 1, 2), turn("u2", 2, 0)]),
        ) {
            Ok(history_id) => history_id,
            Err(err) => panic!("save should succeed: {err}"),
        };

        let last = match get_last_completed_history(&repository, "stable-1") {
            Ok(Some(record)) => record,
            Ok(None) => panic!("saved history should be readable"),
            Err(err) => panic!("history read should succeed: {err}"),
        };
        assert_eq!(last.history_id, history_id);
        assert!((last.final_turn_order[0].total_points_picked - 30.0).abs() < f64::EPSILON);
        assert!(matches!(get_last_completed_history(&repository, "stable-9"), Ok(None)));
    }

    #[test]
    fn save_rejects_invalid_process_without_writing() {
        let mut repository = InMemoryRepository::new();
        let invalid = process(vec![turn("u1", 1, 0), turn("u1", 2, 0)]);

        let result = save_completed_history(&mut repository, &invalid);
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert!(repository.history_for_stable("stable-1").is_empty());
    }
}
