//! SQLite implementation of `LifecycleStore`.
//!
//! Provides the durable audit trail that survives process restarts.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table tracking the schema version.
//! To change the schema, increment `CURRENT_SCHEMA_VERSION` and add a
//! migration in `run_migrations()`; migrations run sequentially from the
//! stored version to the target version.
//!
//! # Invariant Enforcement
//!
//! The one-open-interval-per-opportunity invariant is enforced by a partial
//! unique index on `opportunity_id WHERE exited_at IS NULL`. Two racing
//! writers cannot both commit an open row: the second insert fails with a
//! constraint violation, surfaced as `RepositoryError::OpenIntervalExists`.
//! The close path uses an affected-rows check (`... AND exited_at IS NULL`)
//! so a record can never be closed twice.

mod analytics;


use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    Advance, CloseReceipt, LifecycleStore, OpenInterval, PathCount, RepositoryError, StateQuery,
    StateStats,
};
use crate::definition::{ClosedOutcome, OpportunityState, TriggerType};
use crate::record::{LifecycleRecord, NewRecord, OpportunityId, RecordId};

/// Current schema version. Increment when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

const SELECT_COLUMNS: &str = "id, opportunity_id, state, sub_state, entered_at, exited_at, \
     trigger_type, trigger_reason, triggered_by, previous_state, next_state, metadata";

/// SQLite-backed lifecycle store.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime. The connection is exposed as
/// `pub(crate)` so tests can manipulate timestamps when exercising
/// elapsed-time queries.
pub struct SqliteStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for better concurrency and crash safety
    /// - `synchronous = FULL` so committed transitions survive power failure
    /// - `busy_timeout = 5000ms` to handle concurrent access gracefully
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();

        let path_str = path_ref.to_string_lossy();
        if path_str != ":memory:" && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // Verify WAL mode was actually enabled - SQLite can silently keep
        // DELETE mode on filesystems without shared-memory support, which
        // would break the concurrency assumptions of the audit trail.
        // In-memory databases report "memory" and never use WAL.
        let is_in_memory = path_str == ":memory:";
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "failed to enable WAL mode: SQLite returned '{journal_mode}' instead of 'wal'"
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for tests and ephemeral use).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "database schema version {} is newer than supported version {}",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS lifecycle_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    opportunity_id TEXT NOT NULL,
                    state TEXT NOT NULL,
                    sub_state TEXT,
                    entered_at INTEGER NOT NULL,
                    exited_at INTEGER,
                    trigger_type TEXT NOT NULL,
                    trigger_reason TEXT NOT NULL DEFAULT '',
                    triggered_by TEXT,
                    previous_state TEXT,
                    next_state TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}'
                );

                CREATE INDEX IF NOT EXISTS idx_history
                    ON lifecycle_records(opportunity_id, entered_at);
                CREATE INDEX IF NOT EXISTS idx_open_by_state
                    ON lifecycle_records(state, entered_at) WHERE exited_at IS NULL;
                CREATE UNIQUE INDEX IF NOT EXISTS idx_one_open_per_opportunity
                    ON lifecycle_records(opportunity_id) WHERE exited_at IS NULL;
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT INTO schema_version (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = ?1",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }
}

// =============================================================================
// Row encoding / decoding
// =============================================================================

fn decode_timestamp(secs: i64, operation: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        RepositoryError::storage(operation, format!("invalid stored timestamp: {secs}"))
    })
}

fn decode_state(s: &str, operation: &str) -> Result<OpportunityState, RepositoryError> {
    OpportunityState::parse(s)
        .ok_or_else(|| RepositoryError::storage(operation, format!("unknown stored state: {s}")))
}

/// Decode a full record from a row selected with `SELECT_COLUMNS`.
fn decode_record(row: &Row<'_>, operation: &str) -> Result<LifecycleRecord, RepositoryError> {
    let map_err = |e: rusqlite::Error| RepositoryError::storage(operation, e.to_string());

    let id: i64 = row.get(0).map_err(map_err)?;
    let opportunity_id: String = row.get(1).map_err(map_err)?;
    let state: String = row.get(2).map_err(map_err)?;
    let sub_state: Option<String> = row.get(3).map_err(map_err)?;
    let entered_at: i64 = row.get(4).map_err(map_err)?;
    let exited_at: Option<i64> = row.get(5).map_err(map_err)?;
    let trigger_type: String = row.get(6).map_err(map_err)?;
    let trigger_reason: String = row.get(7).map_err(map_err)?;
    let triggered_by: Option<String> = row.get(8).map_err(map_err)?;
    let previous_state: Option<String> = row.get(9).map_err(map_err)?;
    let next_state: Option<String> = row.get(10).map_err(map_err)?;
    let metadata: String = row.get(11).map_err(map_err)?;

    let sub_state = sub_state
        .map(|s| {
            ClosedOutcome::parse(&s).ok_or_else(|| {
                RepositoryError::storage(operation, format!("unknown stored sub-state: {s}"))
            })
        })
        .transpose()?;
    let previous_state = previous_state
        .map(|s| decode_state(&s, operation))
        .transpose()?;
    let next_state = next_state
        .map(|s| decode_state(&s, operation))
        .transpose()?;
    let metadata = serde_json::from_str(&metadata)
        .map_err(|e| RepositoryError::storage(operation, format!("metadata decode: {e}")))?;

    Ok(LifecycleRecord {
        id: RecordId(id),
        opportunity_id: OpportunityId(opportunity_id),
        state: decode_state(&state, operation)?,
        sub_state,
        entered_at: decode_timestamp(entered_at, operation)?,
        exited_at: exited_at
            .map(|secs| decode_timestamp(secs, operation))
            .transpose()?,
        trigger_type: TriggerType::parse(&trigger_type).ok_or_else(|| {
            RepositoryError::storage(operation, format!("unknown stored trigger: {trigger_type}"))
        })?,
        trigger_reason,
        triggered_by,
        previous_state,
        next_state,
        metadata,
    })
}

/// Insert a new open row inside an existing connection/transaction context.
///
/// Maps the partial-unique-index violation to `OpenIntervalExists`.
fn insert_open_row(
    conn: &Connection,
    new: &NewRecord,
    now_secs: i64,
) -> Result<i64, RepositoryError> {
    let metadata_json = serde_json::to_string(&new.metadata)
        .map_err(|e| RepositoryError::storage("create_state serialize", e.to_string()))?;

    let result = conn.execute(
        "INSERT INTO lifecycle_records
             (opportunity_id, state, sub_state, entered_at, exited_at,
              trigger_type, trigger_reason, triggered_by, previous_state, next_state, metadata)
         VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?7, ?8, NULL, ?9)",
        params![
            new.opportunity_id.as_str(),
            new.state.as_str(),
            new.sub_state.map(|s| s.as_str()),
            now_secs,
            new.trigger_type.as_str(),
            new.trigger_reason,
            new.triggered_by,
            new.previous_state.map(|s| s.as_str()),
            metadata_json,
        ],
    );

    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(e) => {
            if is_constraint_violation(&e) {
                Err(RepositoryError::OpenIntervalExists {
                    opportunity_id: new.opportunity_id.clone(),
                })
            } else {
                Err(RepositoryError::storage("create_state", e.to_string()))
            }
        }
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

/// Close an open row with an affected-rows check. `exited_at IS NULL` in the
/// predicate means a concurrent closer loses cleanly instead of overwriting.
fn close_open_row(
    conn: &Connection,
    id: RecordId,
    next_state: OpportunityState,
    now_secs: i64,
) -> Result<(), RepositoryError> {
    let affected = conn
        .execute(
            "UPDATE lifecycle_records SET exited_at = ?1, next_state = ?2
             WHERE id = ?3 AND exited_at IS NULL",
            params![now_secs, next_state.as_str(), id.0],
        )
        .map_err(|e| RepositoryError::storage("close_state", e.to_string()))?;

    if affected == 1 {
        return Ok(());
    }

    // Distinguish "no such record" from "already closed".
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM lifecycle_records WHERE id = ?1",
            params![id.0],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| RepositoryError::storage("close_state", e.to_string()))?;

    if exists.is_some() {
        Err(RepositoryError::AlreadyClosed { id })
    } else {
        Err(RepositoryError::RecordNotFound { id })
    }
}

fn fetch_record(conn: &Connection, id: RecordId) -> Result<LifecycleRecord, RepositoryError> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM lifecycle_records WHERE id = ?1");
    let record = conn
        .query_row(&sql, params![id.0], |row| {
            Ok(decode_record(row, "fetch_record"))
        })
        .optional()
        .map_err(|e| RepositoryError::storage("fetch_record", e.to_string()))?;
    match record {
        Some(result) => result,
        None => Err(RepositoryError::RecordNotFound { id }),
    }
}

// =============================================================================
// LifecycleStore implementation
// =============================================================================

#[async_trait]
impl LifecycleStore for SqliteStore {
    async fn create_state(&self, new: NewRecord) -> Result<LifecycleRecord, RepositoryError> {
        let conn = self.conn.clone();
        let now_secs = Utc::now().timestamp();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let id = insert_open_row(&conn, &new, now_secs)?;
            fetch_record(&conn, RecordId(id))
        })
        .await
        .map_err(|e| RepositoryError::storage("create_state", e.to_string()))?
    }

    async fn close_state(
        &self,
        id: RecordId,
        next_state: OpportunityState,
    ) -> Result<CloseReceipt, RepositoryError> {
        let conn = self.conn.clone();
        let now_secs = Utc::now().timestamp();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            close_open_row(&conn, id, next_state, now_secs)?;
            Ok(CloseReceipt {
                id,
                exited_at: decode_timestamp(now_secs, "close_state")?,
            })
        })
        .await
        .map_err(|e| RepositoryError::storage("close_state", e.to_string()))?
    }

    async fn advance(
        &self,
        close_id: RecordId,
        new: NewRecord,
    ) -> Result<Advance, RepositoryError> {
        let conn = self.conn.clone();
        let now_secs = Utc::now().timestamp();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn
                .transaction()
                .map_err(|e| RepositoryError::storage("advance", e.to_string()))?;

            close_open_row(&tx, close_id, new.state, now_secs)?;
            let opened_id = insert_open_row(&tx, &new, now_secs)?;

            let closed = fetch_record(&tx, close_id)?;
            let opened = fetch_record(&tx, RecordId(opened_id))?;

            tx.commit()
                .map_err(|e| RepositoryError::storage("advance commit", e.to_string()))?;
            Ok(Advance { closed, opened })
        })
        .await
        .map_err(|e| RepositoryError::storage("advance", e.to_string()))?
    }

    async fn current_state(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Option<LifecycleRecord>, RepositoryError> {
        let conn = self.conn.clone();
        let opportunity_id = opportunity_id.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM lifecycle_records
                 WHERE opportunity_id = ?1 AND exited_at IS NULL
                 ORDER BY entered_at DESC, id DESC
                 LIMIT 1"
            );
            conn.query_row(&sql, params![opportunity_id.as_str()], |row| {
                Ok(decode_record(row, "current_state"))
            })
            .optional()
            .map_err(|e| RepositoryError::storage("current_state", e.to_string()))?
            .transpose()
        })
        .await
        .map_err(|e| RepositoryError::storage("current_state", e.to_string()))?
    }

    async fn lifecycle_history(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<LifecycleRecord>, RepositoryError> {
        let conn = self.conn.clone();
        let opportunity_id = opportunity_id.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM lifecycle_records
                 WHERE opportunity_id = ?1
                 ORDER BY entered_at ASC, id ASC"
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| RepositoryError::storage("lifecycle_history", e.to_string()))?;
            let rows = stmt
                .query_map(params![opportunity_id.as_str()], |row| {
                    Ok(decode_record(row, "lifecycle_history"))
                })
                .map_err(|e| RepositoryError::storage("lifecycle_history", e.to_string()))?;

            let mut history = Vec::new();
            for row in rows {
                history.push(
                    row.map_err(|e| {
                        RepositoryError::storage("lifecycle_history", e.to_string())
                    })??,
                );
            }
            Ok(history)
        })
        .await
        .map_err(|e| RepositoryError::storage("lifecycle_history", e.to_string()))?
    }

    async fn opportunities_in_state(
        &self,
        state: OpportunityState,
        query: StateQuery,
    ) -> Result<Vec<OpenInterval>, RepositoryError> {
        let conn = self.conn.clone();
        let now_secs = Utc::now().timestamp();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM lifecycle_records
                 WHERE state = ?1 AND exited_at IS NULL
                   AND (?2 IS NULL OR ?3 - entered_at >= ?2)
                   AND (?4 IS NULL OR ?3 - entered_at <= ?4)
                 ORDER BY entered_at ASC, id ASC
                 LIMIT ?5 OFFSET ?6"
            );
            let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
            let offset = query.offset.map(|o| o as i64).unwrap_or(0);

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| RepositoryError::storage("opportunities_in_state", e.to_string()))?;
            let rows = stmt
                .query_map(
                    params![
                        state.as_str(),
                        query.min_duration,
                        now_secs,
                        query.max_duration,
                        limit,
                        offset
                    ],
                    |row| Ok(decode_record(row, "opportunities_in_state")),
                )
                .map_err(|e| RepositoryError::storage("opportunities_in_state", e.to_string()))?;

            let mut intervals = Vec::new();
            for row in rows {
                let record = row.map_err(|e| {
                    RepositoryError::storage("opportunities_in_state", e.to_string())
                })??;
                intervals.push(OpenInterval {
                    seconds_in_state: now_secs - record.entered_at.timestamp(),
                    record,
                });
            }
            Ok(intervals)
        })
        .await
        .map_err(|e| RepositoryError::storage("opportunities_in_state", e.to_string()))?
    }

    async fn state_analytics(&self) -> Result<Vec<StateStats>, RepositoryError> {
        self.state_analytics_impl().await
    }

    async fn eligible_for_auto_transition(
        &self,
        from_state: OpportunityState,
        hours_in_state: f64,
    ) -> Result<Vec<LifecycleRecord>, RepositoryError> {
        self.open_older_than_impl(from_state, hours_in_state * 3600.0)
            .await
    }

    async fn eligible_for_dormancy(
        &self,
        from_state: OpportunityState,
        days_inactive: f64,
    ) -> Result<Vec<LifecycleRecord>, RepositoryError> {
        self.open_older_than_impl(from_state, days_inactive * 86_400.0)
            .await
    }

    async fn common_paths(&self, limit: usize) -> Result<Vec<PathCount>, RepositoryError> {
        self.common_paths_impl(limit).await
    }

    async fn average_journey_duration(&self) -> Result<Option<f64>, RepositoryError> {
        self.average_journey_duration_impl().await
    }
}

impl SqliteStore {
    /// Open records in `state` whose elapsed seconds strictly exceed the
    /// threshold.
    async fn open_older_than_impl(
        &self,
        state: OpportunityState,
        threshold_seconds: f64,
    ) -> Result<Vec<LifecycleRecord>, RepositoryError> {
        let conn = self.conn.clone();
        let now_secs = Utc::now().timestamp();
        // Truncation loses sub-second precision, which the seconds-resolution
        // schema never stores anyway.
        let cutoff = now_secs - threshold_seconds as i64;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM lifecycle_records
                 WHERE state = ?1 AND exited_at IS NULL AND entered_at < ?2
                 ORDER BY entered_at ASC, id ASC"
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| RepositoryError::storage("eligibility", e.to_string()))?;
            let rows = stmt
                .query_map(params![state.as_str(), cutoff], |row| {
                    Ok(decode_record(row, "eligibility"))
                })
                .map_err(|e| RepositoryError::storage("eligibility", e.to_string()))?;

            let mut eligible = Vec::new();
            for row in rows {
                eligible
                    .push(row.map_err(|e| RepositoryError::storage("eligibility", e.to_string()))??);
            }
            Ok(eligible)
        })
        .await
        .map_err(|e| RepositoryError::storage("eligibility", e.to_string()))?
    }

    /// Rewrite a record's entry timestamp. Test-only hook for exercising
    /// elapsed-time queries without sleeping.
    #[cfg(test)]
    pub(crate) fn backdate_entered(&self, id: RecordId, entered_at: DateTime<Utc>) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE lifecycle_records SET entered_at = ?1 WHERE id = ?2",
            params![entered_at.timestamp(), id.0],
        )
        .expect("backdate_entered");
    }
}
