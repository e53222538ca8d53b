use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use turn_order_core::{
    Algorithm, BoxError, FinalTurnEntry, HistoryId, MemberProfile, RotationHistoryRecord,
    Selection, StableSettings, TurnOrderRepository, WorkItem,
};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// `*_key` columns hold unix nanoseconds; RFC 3339 text does not order
// correctly once fractional seconds differ in length.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS organization_members (
  organization_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  first_name TEXT,
  last_name TEXT,
  email TEXT,
  PRIMARY KEY (organization_id, user_id)
);

CREATE TABLE IF NOT EXISTS stable_members (
  stable_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  first_name TEXT,
  last_name TEXT,
  email TEXT,
  PRIMARY KEY (stable_id, user_id)
);

CREATE TABLE IF NOT EXISTS user_profiles (
  user_id TEXT PRIMARY KEY,
  first_name TEXT,
  last_name TEXT,
  email TEXT
);

CREATE TABLE IF NOT EXISTS stables (
  stable_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stable_settings (
  stable_id TEXT PRIMARY KEY,
  memory_horizon_days INTEGER NOT NULL CHECK (memory_horizon_days >= 0)
);

CREATE TABLE IF NOT EXISTS work_items (
  work_item_id TEXT PRIMARY KEY,
  stable_id TEXT NOT NULL,
  scheduled_at TEXT NOT NULL,
  scheduled_at_key INTEGER NOT NULL,
  points_value REAL NOT NULL CHECK (points_value >= 0),
  points_awarded REAL CHECK (points_awarded IS NULL OR points_awarded >= 0),
  assigned_to TEXT,
  completed_by TEXT,
  completed_at TEXT,
  completed_at_key INTEGER,
  CHECK ((completed_by IS NULL) = (completed_at IS NULL))
);

CREATE TABLE IF NOT EXISTS selections (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  process_id TEXT NOT NULL,
  selected_by TEXT NOT NULL,
  points_value REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS rotation_history (
  history_id TEXT PRIMARY KEY,
  process_id TEXT NOT NULL,
  process_name TEXT NOT NULL,
  organization_id TEXT NOT NULL,
  stable_id TEXT NOT NULL,
  algorithm TEXT NOT NULL CHECK (algorithm IN ('quota_based_draft','points_balance','fair_rotation','manual')),
  final_turn_order_json TEXT NOT NULL,
  completed_at TEXT NOT NULL,
  completed_at_key INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_items_stable_scheduled ON work_items(stable_id, scheduled_at_key);
CREATE INDEX IF NOT EXISTS idx_work_items_stable_completed ON work_items(stable_id, completed_at_key);
CREATE INDEX IF NOT EXISTS idx_selections_process ON selections(process_id);
CREATE INDEX IF NOT EXISTS idx_rotation_history_stable_completed ON rotation_history(stable_id, completed_at_key);
";

const HISTORY_COLUMNS: &str = "history_id, process_id, process_name, organization_id, stable_id,
     algorithm, final_turn_order_json, completed_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed turn-order store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            version = 1;
            tracing::info!(version, "applied schema migration");
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert or replace an organization membership.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_organization_member(
        &self,
        organization_id: &str,
        user_id: &str,
        profile: &MemberProfile,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO organization_members(organization_id, user_id, first_name, last_name, email)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(organization_id, user_id) DO UPDATE SET
                   first_name = excluded.first_name,
                   last_name = excluded.last_name,
                   email = excluded.email",
                params![
                    organization_id,
                    user_id,
                    profile.first_name,
                    profile.last_name,
                    profile.email
                ],
            )
            .context("failed to upsert organization member")?;
        Ok(())
    }

    /// Insert or replace a stable-scoped membership.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_stable_member(
        &self,
        stable_id: &str,
        user_id: &str,
        profile: &MemberProfile,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO stable_members(stable_id, user_id, first_name, last_name, email)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(stable_id, user_id) DO UPDATE SET
                   first_name = excluded.first_name,
                   last_name = excluded.last_name,
                   email = excluded.email",
                params![stable_id, user_id, profile.first_name, profile.last_name, profile.email],
            )
            .context("failed to upsert stable member")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_user_profile(&self, user_id: &str, profile: &MemberProfile) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_profiles(user_id, first_name, last_name, email)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                   first_name = excluded.first_name,
                   last_name = excluded.last_name,
                   email = excluded.email",
                params![user_id, profile.first_name, profile.last_name, profile.email],
            )
            .context("failed to upsert user profile")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub fn set_stable_owner(&self, stable_id: &str, owner_id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO stables(stable_id, owner_id) VALUES (?1, ?2)
                 ON CONFLICT(stable_id) DO UPDATE SET owner_id = excluded.owner_id",
                params![stable_id, owner_id],
            )
            .context("failed to set stable owner")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub fn set_stable_settings(&self, stable_id: &str, settings: StableSettings) -> Result<()> {
        settings.validate().context("stable settings validation failed")?;
        self.conn
            .execute(
                "INSERT INTO stable_settings(stable_id, memory_horizon_days) VALUES (?1, ?2)
                 ON CONFLICT(stable_id) DO UPDATE SET
                   memory_horizon_days = excluded.memory_horizon_days",
                params![stable_id, i64::from(settings.memory_horizon_days)],
            )
            .context("failed to set stable settings")?;
        Ok(())
    }

    /// Insert a work item, or replace it when its ID already exists.
    ///
    /// Completing a duty is recorded by upserting the item with
    /// `completed_by`/`completed_at` set.
    ///
    /// # Errors
    /// Returns an error when validation fails or the write fails.
    pub fn upsert_work_item(&self, item: &WorkItem) -> Result<()> {
        item.validate().context("work item validation failed")?;

        self.conn
            .execute(
                "INSERT INTO work_items(
                    work_item_id, stable_id, scheduled_at, scheduled_at_key,
                    points_value, points_awarded, assigned_to,
                    completed_by, completed_at, completed_at_key
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(work_item_id) DO UPDATE SET
                   stable_id = excluded.stable_id,
                   scheduled_at = excluded.scheduled_at,
                   scheduled_at_key = excluded.scheduled_at_key,
                   points_value = excluded.points_value,
                   points_awarded = excluded.points_awarded,
                   assigned_to = excluded.assigned_to,
                   completed_by = excluded.completed_by,
                   completed_at = excluded.completed_at,
                   completed_at_key = excluded.completed_at_key",
                params![
                    item.work_item_id,
                    item.stable_id,
                    rfc3339(item.scheduled_at)?,
                    time_key(item.scheduled_at)?,
                    item.points_value,
                    item.points_awarded,
                    item.assigned_to,
                    item.completed_by,
                    item.completed_at.map(rfc3339).transpose()?,
                    item.completed_at.map(time_key).transpose()?,
                ],
            )
            .context("failed to upsert work item")?;
        Ok(())
    }

    /// Record one pick in a selection process sub-ledger.
    ///
    /// # Errors
    /// Returns an error when validation fails or the write fails.
    pub fn add_selection(&self, selection: &Selection) -> Result<()> {
        selection.validate().context("selection validation failed")?;

        self.conn
            .execute(
                "INSERT INTO selections(process_id, selected_by, points_value) VALUES (?1, ?2, ?3)",
                params![selection.process_id, selection.selected_by, selection.points_value],
            )
            .context("failed to insert selection")?;
        Ok(())
    }

    /// Retrieve one archived rotation by its identifier.
    ///
    /// # Errors
    /// Returns an error when lookup or decoding fails.
    pub fn history_by_id(&self, history_id: HistoryId) -> Result<Option<RotationHistoryRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {HISTORY_COLUMNS} FROM rotation_history WHERE history_id = ?1"),
                params![history_id.to_string()],
                HistoryRow::from_row,
            )
            .optional()
            .context("failed to read rotation history by id")?;
        row.map(HistoryRow::into_record).transpose()
    }

    /// Every archived rotation for a stable, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_history(&self, stable_id: &str) -> Result<Vec<RotationHistoryRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM rotation_history
             WHERE stable_id = ?1
             ORDER BY completed_at_key DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![stable_id], HistoryRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn profile_lookup(&self, sql: &str, keys: &[&str]) -> Result<Option<MemberProfile>> {
        self.conn
            .query_row(sql, rusqlite::params_from_iter(keys), |row| {
                Ok(MemberProfile {
                    first_name: row.get(0)?,
                    last_name: row.get(1)?,
                    email: row.get(2)?,
                })
            })
            .optional()
            .context("failed to read directory entry")
    }

    fn last_history(&self, stable_id: &str) -> Result<Option<RotationHistoryRecord>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {HISTORY_COLUMNS} FROM rotation_history
                     WHERE stable_id = ?1
                     ORDER BY completed_at_key DESC, rowid DESC
                     LIMIT 1"
                ),
                params![stable_id],
                HistoryRow::from_row,
            )
            .optional()
            .context("failed to read last rotation history")?;
        row.map(HistoryRow::into_record).transpose()
    }

    fn insert_history(&mut self, record: &RotationHistoryRecord) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO rotation_history(
                history_id, process_id, process_name, organization_id, stable_id,
                algorithm, final_turn_order_json, completed_at, completed_at_key
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.history_id.to_string(),
                record.process_id,
                record.process_name,
                record.organization_id,
                record.stable_id,
                record.algorithm.as_str(),
                serde_json::to_string(&record.final_turn_order)
                    .context("failed to serialize final turn order")?,
                rfc3339(record.completed_at)?,
                time_key(record.completed_at)?,
            ],
        )
        .context("failed to insert rotation history")?;
        tx.commit().context("failed to commit rotation history transaction")?;
        Ok(())
    }

    fn open_points_in_range(
        &self,
        stable_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<f64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(points_value), 0.0) FROM work_items
                 WHERE stable_id = ?1
                   AND assigned_to IS NULL
                   AND completed_at IS NULL
                   AND scheduled_at_key BETWEEN ?2 AND ?3",
                params![stable_id, time_key(start)?, time_key(end)?],
                |row| row.get::<_, f64>(0),
            )
            .context("failed to sum open work item points")
    }

    fn completed_since(&self, stable_id: &str, cutoff: OffsetDateTime) -> Result<Vec<WorkItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT work_item_id, stable_id, scheduled_at, points_value, points_awarded,
                    assigned_to, completed_by, completed_at
             FROM work_items
             WHERE stable_id = ?1 AND completed_at_key >= ?2
             ORDER BY completed_at_key ASC, work_item_id ASC",
        )?;
        let mut rows = stmt.query(params![stable_id, time_key(cutoff)?])?;

        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            let scheduled_at_raw: String = row.get(2)?;
            let completed_at_raw: Option<String> = row.get(7)?;
            items.push(WorkItem {
                work_item_id: row.get(0)?,
                stable_id: row.get(1)?,
                scheduled_at: parse_rfc3339(&scheduled_at_raw)?,
                points_value: row.get(3)?,
                points_awarded: row.get(4)?,
                assigned_to: row.get(5)?,
                completed_by: row.get(6)?,
                completed_at: completed_at_raw.as_deref().map(parse_rfc3339).transpose()?,
            });
        }
        Ok(items)
    }

    fn selections(&self, process_id: &str) -> Result<Vec<Selection>> {
        let mut stmt = self.conn.prepare(
            "SELECT process_id, selected_by, points_value FROM selections
             WHERE process_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![process_id], |row| {
            Ok(Selection {
                process_id: row.get(0)?,
                selected_by: row.get(1)?,
                points_value: row.get(2)?,
            })
        })?;

        let mut selections = Vec::new();
        for row in rows {
            selections.push(row.context("failed to read selection row")?);
        }
        Ok(selections)
    }
}

impl TurnOrderRepository for SqliteStore {
    fn organization_member(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberProfile>, BoxError> {
        Ok(self.profile_lookup(
            "SELECT first_name, last_name, email FROM organization_members
             WHERE organization_id = ?1 AND user_id = ?2",
            &[organization_id, user_id],
        )?)
    }

    fn stable_member(
        &self,
        stable_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberProfile>, BoxError> {
        Ok(self.profile_lookup(
            "SELECT first_name, last_name, email FROM stable_members
             WHERE stable_id = ?1 AND user_id = ?2",
            &[stable_id, user_id],
        )?)
    }

    fn stable_owner(&self, stable_id: &str) -> Result<Option<String>, BoxError> {
        Ok(self
            .conn
            .query_row(
                "SELECT owner_id FROM stables WHERE stable_id = ?1",
                params![stable_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read stable owner")?)
    }

    fn user_profile(&self, user_id: &str) -> Result<Option<MemberProfile>, BoxError> {
        Ok(self.profile_lookup(
            "SELECT first_name, last_name, email FROM user_profiles WHERE user_id = ?1",
            &[user_id],
        )?)
    }

    fn stable_settings(&self, stable_id: &str) -> Result<Option<StableSettings>, BoxError> {
        let days = self
            .conn
            .query_row(
                "SELECT memory_horizon_days FROM stable_settings WHERE stable_id = ?1",
                params![stable_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to read stable settings")?;

        let Some(days) = days else {
            return Ok(None);
        };
        let Ok(memory_horizon_days) = u32::try_from(days) else {
            tracing::warn!(stable_id, days, "unreadable memory_horizon_days, using defaults");
            return Ok(None);
        };
        Ok(Some(StableSettings { memory_horizon_days }))
    }

    fn sum_open_points_in_range(
        &self,
        stable_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<f64, BoxError> {
        Ok(self.open_points_in_range(stable_id, start, end)?)
    }

    fn completed_work_since(
        &self,
        stable_id: &str,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<WorkItem>, BoxError> {
        Ok(self.completed_since(stable_id, cutoff)?)
    }

    fn selections_for_process(&self, process_id: &str) -> Result<Vec<Selection>, BoxError> {
        Ok(self.selections(process_id)?)
    }

    fn last_completed_history(
        &self,
        stable_id: &str,
    ) -> Result<Option<RotationHistoryRecord>, BoxError> {
        Ok(self.last_history(stable_id)?)
    }

    fn append_history(&mut self, record: &RotationHistoryRecord) -> Result<(), BoxError> {
        Ok(self.insert_history(record)?)
    }
}

struct HistoryRow {
    history_id: String,
    process_id: String,
    process_name: String,
    organization_id: String,
    stable_id: String,
    algorithm: String,
    final_turn_order_json: String,
    completed_at: String,
}

impl HistoryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            history_id: row.get(0)?,
            process_id: row.get(1)?,
            process_name: row.get(2)?,
            organization_id: row.get(3)?,
            stable_id: row.get(4)?,
            algorithm: row.get(5)?,
            final_turn_order_json: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<RotationHistoryRecord> {
        let algorithm = Algorithm::parse(&self.algorithm)
            .ok_or_else(|| anyhow!("unknown algorithm in history: {}", self.algorithm))?;
        let final_turn_order: Vec<FinalTurnEntry> =
            serde_json::from_str(&self.final_turn_order_json)
                .context("failed to deserialize stored final turn order")?;

        Ok(RotationHistoryRecord {
            history_id: parse_history_id(&self.history_id)?,
            process_id: self.process_id,
            process_name: self.process_name,
            organization_id: self.organization_id,
            stable_id: self.stable_id,
            algorithm,
            final_turn_order,
            completed_at: parse_rfc3339(&self.completed_at)?,
        })
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, rfc3339(OffsetDateTime::now_utc())?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn time_key(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp outside the storable range: {value}"))
}

fn parse_history_id(raw: &str) -> Result<HistoryId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(HistoryId(parsed))
}
