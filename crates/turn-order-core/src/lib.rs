//! Fairness turn-order engine for stable duty selection.
//!
//! The engine decides in which order stable members pick upcoming duty work.
//! Storage is reached only through [`TurnOrderRepository`], so every strategy
//! runs unchanged against [`InMemoryRepository`] or a persistent store.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod collation;
mod engine;
mod history;
mod repository;
mod resolver;
pub mod strategy;

pub use collation::{Collator, OrdinalCollator, SwedishCollator};
pub use engine::TurnOrderEngine;
pub use history::{build_history_record, get_last_completed_history, save_completed_history};
pub use repository::{InMemoryRepository, TurnOrderRepository};
pub use resolver::resolve_members;

/// Lookback window applied by Points Balance when a stable has no setting.
pub const DEFAULT_MEMORY_HORIZON_DAYS: u32 = 90;

/// Longest accepted Points Balance lookback (one hundred years).
pub const MAX_MEMORY_HORIZON_DAYS: u32 = 36_500;

/// Boxed error returned by repository implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(#[source] BoxError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HistoryId(pub Ulid);

impl HistoryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HistoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for HistoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    QuotaBasedDraft,
    PointsBalance,
    FairRotation,
    Manual,
}

impl Algorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuotaBasedDraft => "quota_based_draft",
            Self::PointsBalance => "points_balance",
            Self::FairRotation => "fair_rotation",
            Self::Manual => "manual",
        }
    }

    /// Strict parse of a stored or user-supplied identifier.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "quota_based_draft" => Some(Self::QuotaBasedDraft),
            "points_balance" => Some(Self::PointsBalance),
            "fair_rotation" => Some(Self::FairRotation),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    /// Lenient resolution used by the orchestrator.
    ///
    /// A missing identifier selects [`Algorithm::Manual`]. An unrecognized one
    /// also selects Manual, and the fallback is logged so caller typos stay visible.
    #[must_use]
    pub fn resolve(value: Option<&str>) -> Self {
        let Some(raw) = value.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Self::Manual;
        };
        Self::parse(raw).unwrap_or_else(|| {
            tracing::warn!(algorithm = raw, "unrecognized turn-order algorithm, using manual");
            Self::Manual
        })
    }
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directory data for one user, as found in a membership or profile record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemberProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

impl MemberProfile {
    /// Trimmed "first last", falling back to email and then to the raw user ID.
    #[must_use]
    pub fn display_name(&self, user_id: &str) -> String {
        let full_name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let full_name = full_name.trim();
        if !full_name.is_empty() {
            return full_name.to_string();
        }
        match self.email() {
            Some(email) => email.to_string(),
            None => user_id.to_string(),
        }
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref().map(str::trim).filter(|email| !email.is_empty())
    }
}

/// A display-ready stable member. Never persisted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Member {
    pub user_id: String,
    pub user_name: String,
    pub user_email: Option<String>,
}

impl Member {
    #[must_use]
    pub fn from_profile(user_id: &str, profile: &MemberProfile) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_name: profile.display_name(user_id),
            user_email: profile.email().map(str::to_string),
        }
    }

    /// Member with no directory data; the raw ID doubles as display name.
    #[must_use]
    pub fn unresolved(user_id: &str) -> Self {
        Self { user_id: user_id.to_string(), user_name: user_id.to_string(), user_email: None }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StableSettings {
    pub memory_horizon_days: u32,
}

impl Default for StableSettings {
    fn default() -> Self {
        Self { memory_horizon_days: DEFAULT_MEMORY_HORIZON_DAYS }
    }
}

impl StableSettings {
    /// # Errors
    /// Returns [`EngineError::Validation`] when the horizon exceeds
    /// [`MAX_MEMORY_HORIZON_DAYS`].
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.memory_horizon_days > MAX_MEMORY_HORIZON_DAYS {
            return Err(EngineError::Validation(format!(
                "memory_horizon_days MUST be <= {MAX_MEMORY_HORIZON_DAYS}"
            )));
        }
        Ok(())
    }
}

/// One schedulable, point-valued piece of duty work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub work_item_id: String,
    pub stable_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_at: OffsetDateTime,
    pub points_value: f64,
    pub points_awarded: Option<f64>,
    pub assigned_to: Option<String>,
    pub completed_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl WorkItem {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.assigned_to.is_none() && self.completed_at.is_none()
    }

    /// Points credited to the completer: awarded points when recorded, else nominal value.
    #[must_use]
    pub fn credited_points(&self) -> f64 {
        self.points_awarded.unwrap_or(self.points_value)
    }

    /// Validate one work item before it is persisted.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for blank identifiers, non-finite or
    /// negative points, or a completion timestamp without a completer.
    pub fn validate(&self) -> Result<(), EngineError> {
        require_non_blank("work_item_id", &self.work_item_id)?;
        require_non_blank("stable_id", &self.stable_id)?;
        for (field, value) in
            [("points_value", Some(self.points_value)), ("points_awarded", self.points_awarded)]
        {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(EngineError::Validation(format!(
                        "{field} MUST be a finite, non-negative number"
                    )));
                }
            }
        }
        if self.completed_at.is_some() != self.completed_by.is_some() {
            return Err(EngineError::Validation(
                "completed_by and completed_at MUST be provided together".to_string(),
            ));
        }
        Ok(())
    }
}

/// One pick made during a selection process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Selection {
    pub process_id: String,
    pub selected_by: String,
    pub points_value: f64,
}

impl Selection {
    /// # Errors
    /// Returns [`EngineError::Validation`] for blank identifiers or non-finite points.
    pub fn validate(&self) -> Result<(), EngineError> {
        require_non_blank("process_id", &self.process_id)?;
        require_non_blank("selected_by", &self.selected_by)?;
        if !self.points_value.is_finite() {
            return Err(EngineError::Validation(
                "selection points_value MUST be finite".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalTurnEntry {
    pub user_id: String,
    pub user_name: String,
    pub order: u32,
    pub selections_count: u32,
    pub total_points_picked: f64,
}

/// Immutable record of one completed rotation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RotationHistoryRecord {
    pub history_id: HistoryId,
    pub process_id: String,
    pub process_name: String,
    pub organization_id: String,
    pub stable_id: String,
    pub algorithm: Algorithm,
    pub final_turn_order: Vec<FinalTurnEntry>,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

impl RotationHistoryRecord {
    /// User IDs in the order they took their turns.
    #[must_use]
    pub fn ordered_user_ids(&self) -> Vec<&str> {
        let mut entries = self.final_turn_order.iter().collect::<Vec<_>>();
        entries.sort_by_key(|entry| entry.order);
        entries.into_iter().map(|entry| entry.user_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProcessTurn {
    pub user_id: String,
    pub user_name: String,
    pub order: u32,
    pub selections_count: u32,
}

/// A finished selection process, as handed over for archiving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletedProcess {
    pub process_id: String,
    pub process_name: String,
    pub organization_id: String,
    pub stable_id: String,
    pub algorithm: Algorithm,
    pub turns: Vec<ProcessTurn>,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

impl CompletedProcess {
    /// Validate a completed process before it becomes history.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for blank identifiers, zero turn
    /// positions, or users appearing twice in the turn list.
    pub fn validate(&self) -> Result<(), EngineError> {
        require_non_blank("process_id", &self.process_id)?;
        require_non_blank("organization_id", &self.organization_id)?;
        require_non_blank("stable_id", &self.stable_id)?;

        let mut seen = std::collections::BTreeSet::new();
        for turn in &self.turns {
            require_non_blank("turn user_id", &turn.user_id)?;
            if turn.order == 0 {
                return Err(EngineError::Validation(
                    "turn order MUST be >= 1".to_string(),
                ));
            }
            if !seen.insert(turn.user_id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "user {} appears more than once in the turn list",
                    turn.user_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnOrderRequest {
    pub stable_id: String,
    pub organization_id: String,
    /// Algorithm identifier; see [`Algorithm::resolve`] for missing or unknown values.
    pub algorithm: Option<String>,
    pub member_ids: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub selection_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub selection_end: OffsetDateTime,
}

impl TurnOrderRequest {
    /// Validate request identifiers and the selection window.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for blank identifiers or an inverted range.
    pub fn validate(&self) -> Result<(), EngineError> {
        require_non_blank("stable_id", &self.stable_id)?;
        require_non_blank("organization_id", &self.organization_id)?;
        for member_id in &self.member_ids {
            require_non_blank("member_id", member_id)?;
        }
        if self.selection_start > self.selection_end {
            return Err(EngineError::Validation(
                "selection_start MUST NOT be after selection_end".to_string(),
            ));
        }
        Ok(())
    }

    /// Member IDs with later duplicates removed, first occurrence wins.
    #[must_use]
    pub fn distinct_member_ids(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        self.member_ids
            .iter()
            .filter(|member_id| seen.insert(member_id.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaMetadata {
    pub quota_per_member: f64,
    pub total_available_points: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_process_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_process_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PointsBalanceMetadata {
    pub member_points_map: BTreeMap<String, f64>,
    pub memory_horizon_days: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RotationMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_process_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_process_name: Option<String>,
}

impl RotationMetadata {
    fn from_previous(previous: Option<&RotationHistoryRecord>) -> Self {
        Self {
            previous_process_id: previous.map(|record| record.process_id.clone()),
            previous_process_name: previous.map(|record| record.process_name.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ManualMetadata {}

/// Algorithm-specific metadata; serializes as a plain object.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum TurnOrderMetadata {
    QuotaBasedDraft(QuotaMetadata),
    PointsBalance(PointsBalanceMetadata),
    FairRotation(RotationMetadata),
    Manual(ManualMetadata),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TurnOrderResult {
    pub turns: Vec<Member>,
    pub algorithm: Algorithm,
    pub metadata: TurnOrderMetadata,
}

impl TurnOrderResult {
    #[must_use]
    pub fn user_ids(&self) -> Vec<&str> {
        self.turns.iter().map(|member| member.user_id.as_str()).collect()
    }
}

fn require_non_blank(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} MUST be non-empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn assert_validation_error_contains(result: Result<(), EngineError>, expected_substring: &str) {
        let err = match result {
            Ok(()) => panic!("expected validation error containing: {expected_substring}"),
            Err(err) => err,
        };

        assert!(
            err.to_string().contains(expected_substring),
            "validation error `{err}` did not contain `{expected_substring}`"
        );
    }

    fn request(member_ids: &[&str]) -> TurnOrderRequest {
        TurnOrderRequest {
            stable_id: "stable-1".to_string(),
            organization_id: "org-1".to_string(),
            algorithm: None,
            member_ids: member_ids.iter().map(ToString::to_string).collect(),
            selection_start: fixture_time(),
            selection_end: fixture_time() + Duration::days(7),
        }
    }

    #[test]
    fn display_name_prefers_full_name_then_email_then_id() {
        let full = MemberProfile {
            first_name: Some("Karin".to_string()),
            last_name: Some("Öberg".to_string()),
            email: Some("karin@example.com".to_string()),
        };
        assert_eq!(full.display_name("u1"), "Karin Öberg");

        let first_only =
            MemberProfile { first_name: Some("Ada".to_string()), ..MemberProfile::default() };
        assert_eq!(first_only.display_name("u1"), "Ada");

        let email_only = MemberProfile {
            first_name: Some("  ".to_string()),
            last_name: None,
            email: Some("rider@example.com".to_string()),
        };
        assert_eq!(email_only.display_name("u1"), "rider@example.com");

        let blank_email =
            MemberProfile { email: Some(" ".to_string()), ..MemberProfile::default() };
        assert_eq!(blank_email.display_name("u1"), "u1");
        assert_eq!(Member::from_profile("u1", &blank_email).user_email, None);
    }

    #[test]
    fn algorithm_identifiers_round_trip_and_fallback_to_manual() {
        for algorithm in [
            Algorithm::QuotaBasedDraft,
            Algorithm::PointsBalance,
            Algorithm::FairRotation,
            Algorithm::Manual,
        ] {
            assert_eq!(Algorithm::parse(algorithm.as_str()), Some(algorithm));
        }
        assert_eq!(Algorithm::parse("quota_based"), None);
        assert_eq!(Algorithm::resolve(Some("quota_based")), Algorithm::Manual);
        assert_eq!(Algorithm::parse("fair-rotation"), None);

        assert_eq!(Algorithm::resolve(None), Algorithm::Manual);
        assert_eq!(Algorithm::resolve(Some("  ")), Algorithm::Manual);
        assert_eq!(Algorithm::resolve(Some("fair_rotaton")), Algorithm::Manual);
        assert_eq!(Algorithm::resolve(Some(" points_balance ")), Algorithm::PointsBalance);
    }

    #[test]
    fn request_validation_rejects_blank_ids_and_inverted_range() {
        let mut blank_stable = request(&["u1"]);
        blank_stable.stable_id = " ".to_string();
        assert_validation_error_contains(blank_stable.validate(), "stable_id");

        let blank_member = request(&["u1", ""]);
        assert_validation_error_contains(blank_member.validate(), "member_id");

        let mut inverted = request(&["u1"]);
        inverted.selection_end = inverted.selection_start - Duration::days(1);
        assert_validation_error_contains(inverted.validate(), "selection_start");

        let mut single_day = request(&["u1"]);
        single_day.selection_end = single_day.selection_start;
        assert!(single_day.validate().is_ok());
    }

    #[test]
    fn distinct_member_ids_keeps_first_occurrence() {
        let request = request(&["u2", "u1", "u2", "u3", "u1"]);
        assert_eq!(request.distinct_member_ids(), vec!["u2", "u1", "u3"]);
    }

    #[test]
    fn work_item_validation_checks_points_and_completion_pairing() {
        let mut item = WorkItem {
            work_item_id: "w1".to_string(),
            stable_id: "stable-1".to_string(),
            scheduled_at: fixture_time(),
            points_value: 3.0,
            points_awarded: None,
            assigned_to: None,
            completed_by: None,
            completed_at: None,
        };
        assert!(item.validate().is_ok());
        assert!(item.is_open());
        assert!((item.credited_points() - 3.0).abs() < f64::EPSILON);

        item.points_awarded = Some(f64::NAN);
        assert_validation_error_contains(item.validate(), "points_awarded");

        item.points_awarded = Some(4.5);
        item.completed_by = Some("u1".to_string());
        assert_validation_error_contains(item.validate(), "completed_at");

        item.completed_at = Some(fixture_time());
        assert!(item.validate().is_ok());
        assert!(!item.is_open());
        assert!((item.credited_points() - 4.5).abs() < f64::EPSILON);
    }

    #[test]
    fn completed_process_validation_rejects_duplicate_users_and_zero_order() {
        let turn = |user_id: &str, order: u32| ProcessTurn {
            user_id: user_id.to_string(),
            user_name: user_id.to_string(),
            order,
            selections_count: 1,
        };
        let mut process = CompletedProcess {
            process_id: "p1".to_string(),
            process_name: "Spring".to_string(),
            organization_id: "org-1".to_string(),
            stable_id: "stable-1".to_string(),
            algorithm: Algorithm::FairRotation,
            turns: vec![turn("u1", 1), turn("u2", 2)],
            completed_at: fixture_time(),
        };
        assert!(process.validate().is_ok());

        process.turns.push(turn("u1", 3));
        assert_validation_error_contains(process.validate(), "more than once");

        process.turns = vec![turn("u1", 0)];
        assert_validation_error_contains(process.validate(), "order MUST be >= 1");
    }

    #[test]
    fn manual_metadata_serializes_as_empty_object() {
        let result = TurnOrderResult {
            turns: vec![Member::unresolved("u1")],
            algorithm: Algorithm::Manual,
            metadata: TurnOrderMetadata::Manual(ManualMetadata::default()),
        };
        let value = match serde_json::to_value(&result) {
            Ok(value) => value,
            Err(err) => panic!("json serialization should succeed: {err}"),
        };
        assert_eq!(value["algorithm"], serde_json::json!("manual"));
        assert_eq!(value["metadata"], serde_json::json!({}));
        assert_eq!(value["turns"][0]["user_name"], serde_json::json!("u1"));
    }

    #[test]
    fn history_ordered_user_ids_follow_order_field() {
        let entry = |user_id: &str, order: u32| FinalTurnEntry {
            user_id: user_id.to_string(),
            user_name: user_id.to_string(),
            order,
            selections_count: 0,
            total_points_picked: 0.0,
        };
        let record = RotationHistoryRecord {
            history_id: HistoryId::new(),
            process_id: "p1".to_string(),
            process_name: "Spring".to_string(),
            organization_id: "org-1".to_string(),
            stable_id: "stable-1".to_string(),
            algorithm: Algorithm::FairRotation,
            final_turn_order: vec![entry("c", 3), entry("a", 1), entry("b", 2)],
            completed_at: fixture_time(),
        };
        assert_eq!(record.ordered_user_ids(), vec!["a", "b", "c"]);
    }
}
