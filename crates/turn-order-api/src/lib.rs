use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use turn_order_core::{
    get_last_completed_history, save_completed_history, CompletedProcess, EngineError,
    MemberProfile, RotationHistoryRecord, Selection, StableSettings, TurnOrderEngine,
    TurnOrderRequest, TurnOrderResult, WorkItem,
};
use turn_order_store_sqlite::{SchemaStatus, SqliteStore};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrganizationMemberRequest {
    pub organization_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub profile: MemberProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StableMemberRequest {
    pub stable_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub profile: MemberProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfileRequest {
    pub user_id: String,
    #[serde(flatten)]
    pub profile: MemberProfile,
}

/// Stable-level configuration; absent fields leave the stored value untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StableRequest {
    pub stable_id: String,
    pub owner_id: Option<String>,
    pub memory_horizon_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeTurnOrderRequest {
    #[serde(flatten)]
    pub request: TurnOrderRequest,
    /// Anchor for the Points Balance memory horizon; defaults to now.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct TurnOrderApi {
    db_path: PathBuf,
}

impl TurnOrderApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        tracing::debug!(db = %self.db_path.display(), "opening turn-order store");
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns a validation error for blank identifiers, or an error when persistence fails.
    pub fn upsert_organization_member(&self, input: &OrganizationMemberRequest) -> Result<()> {
        require_non_blank("organization_id", &input.organization_id)?;
        require_non_blank("user_id", &input.user_id)?;
        let store = self.open_migrated_store()?;
        store.upsert_organization_member(&input.organization_id, &input.user_id, &input.profile)
    }

    /// # Errors
    /// Returns a validation error for blank identifiers, or an error when persistence fails.
    pub fn upsert_stable_member(&self, input: &StableMemberRequest) -> Result<()> {
        require_non_blank("stable_id", &input.stable_id)?;
        require_non_blank("user_id", &input.user_id)?;
        let store = self.open_migrated_store()?;
        store.upsert_stable_member(&input.stable_id, &input.user_id, &input.profile)
    }

    /// # Errors
    /// Returns a validation error for a blank identifier, or an error when persistence fails.
    pub fn upsert_user_profile(&self, input: &UserProfileRequest) -> Result<()> {
        require_non_blank("user_id", &input.user_id)?;
        let store = self.open_migrated_store()?;
        store.upsert_user_profile(&input.user_id, &input.profile)
    }

    /// Set a stable's owner and/or memory horizon.
    ///
    /// # Errors
    /// Returns a validation error for blank identifiers, or an error when persistence fails.
    pub fn set_stable(&self, input: &StableRequest) -> Result<()> {
        require_non_blank("stable_id", &input.stable_id)?;
        if let Some(owner_id) = &input.owner_id {
            require_non_blank("owner_id", owner_id)?;
        }
        if let Some(memory_horizon_days) = input.memory_horizon_days {
            StableSettings { memory_horizon_days }.validate()?;
        }

        let store = self.open_migrated_store()?;
        if let Some(owner_id) = &input.owner_id {
            store.set_stable_owner(&input.stable_id, owner_id)?;
        }
        if let Some(memory_horizon_days) = input.memory_horizon_days {
            store.set_stable_settings(&input.stable_id, StableSettings { memory_horizon_days })?;
        }
        Ok(())
    }

    /// Insert or update one work item in the points ledger.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn upsert_work_item(&self, item: &WorkItem) -> Result<()> {
        let store = self.open_migrated_store()?;
        store.upsert_work_item(item)
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_selection(&self, selection: &Selection) -> Result<()> {
        let store = self.open_migrated_store()?;
        store.add_selection(selection)
    }

    /// Compute a turn order against the current directory, ledger and history.
    ///
    /// # Errors
    /// Returns an error when the request is invalid or storage cannot be read.
    pub fn compute_turn_order(&self, input: &ComputeTurnOrderRequest) -> Result<TurnOrderResult> {
        let store = self.open_migrated_store()?;
        let as_of = input.as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let result = TurnOrderEngine::default().compute_turn_order(&store, &input.request, as_of)?;
        Ok(result)
    }

    /// Archive a completed selection process and return the stored record.
    ///
    /// # Errors
    /// Returns an error when the process is invalid or persistence fails.
    pub fn complete_process(&self, process: &CompletedProcess) -> Result<RotationHistoryRecord> {
        let mut store = self.open_migrated_store()?;
        let history_id = save_completed_history(&mut store, process)?;
        store
            .history_by_id(history_id)?
            .ok_or_else(|| anyhow!("rotation history not found after save: {history_id}"))
    }

    /// # Errors
    /// Returns an error when storage cannot be read.
    pub fn last_history(&self, stable_id: &str) -> Result<Option<RotationHistoryRecord>> {
        require_non_blank("stable_id", stable_id)?;
        let store = self.open_migrated_store()?;
        Ok(get_last_completed_history(&store, stable_id)?)
    }

    /// # Errors
    /// Returns an error when storage cannot be read.
    pub fn list_history(&self, stable_id: &str) -> Result<Vec<RotationHistoryRecord>> {
        require_non_blank("stable_id", stable_id)?;
        let store = self.open_migrated_store()?;
        store.list_history(stable_id)
    }
}

fn require_non_blank(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} MUST be non-empty")));
    }
    Ok(())
}
