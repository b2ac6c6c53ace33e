//! SQLite implementation of `WorkflowRepository`.
//!
//! This provides persistent storage that survives service restarts.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.
//!
//! Timestamps are stored as integer milliseconds since the Unix epoch.

mod rows;


use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::warn;

use ipflow_core::{
    Assignment, AssignmentStatus, Evaluation, ProcessTrackingEntry, Reviewer, ReviewerKind, Role,
    StageInstance, StageInstanceStatus, Submission, SubmissionId, SubmissionStatus, UserId,
};

use self::rows::{
    assignment, from_millis, history_entry, parse, read_assignment, read_history, read_reviewer,
    reviewer, to_millis, EvaluationRow, StageRow, SubmissionRow, ASSIGNMENT_COLUMNS,
    EVALUATION_COLUMNS, HISTORY_COLUMNS, REVIEWER_COLUMNS, STAGE_COLUMNS, SUBMISSION_COLUMNS,
};
use super::{RepositoryError, TransitionCommit, WorkflowRepository};

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed workflow repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteRepository {
    /// Exposed as `pub(crate)` so tests can inspect raw rows.
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// The database is configured with `journal_mode = WAL`,
    /// `synchronous = FULL` and `busy_timeout = 5000ms`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
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

        // Disclosures are confidential until filed.
        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite can silently keep DELETE mode on filesystems without shared
        // memory support. In-memory databases report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
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

    /// Create a new in-memory SQLite repository (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
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
                CREATE TABLE IF NOT EXISTS submissions (
                    id TEXT PRIMARY KEY,
                    applicant_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    abstract_text TEXT NOT NULL,
                    category TEXT NOT NULL,
                    details_json TEXT NOT NULL,
                    document_count INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    current_stage_label TEXT NOT NULL,
                    supervisor_id TEXT,
                    evaluator_id TEXT,
                    assigned_at INTEGER,
                    materials_status TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS process_tracking (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    submission_id TEXT NOT NULL,
                    stage_label TEXT NOT NULL,
                    status TEXT NOT NULL,
                    actor_id TEXT NOT NULL,
                    actor_name TEXT NOT NULL,
                    actor_role TEXT NOT NULL,
                    action TEXT NOT NULL,
                    description TEXT NOT NULL,
                    metadata_json TEXT NOT NULL,
                    recorded_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_process_tracking_submission
                    ON process_tracking(submission_id, id);

                CREATE TABLE IF NOT EXISTS evaluations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    submission_id TEXT NOT NULL,
                    evaluator_id TEXT NOT NULL,
                    innovation INTEGER NOT NULL,
                    feasibility INTEGER NOT NULL,
                    market_potential INTEGER NOT NULL,
                    technical_merit INTEGER NOT NULL,
                    grade TEXT NOT NULL,
                    remarks TEXT,
                    decision TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_evaluations_submission
                    ON evaluations(submission_id, id);

                CREATE TABLE IF NOT EXISTS assignments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    submission_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    reviewer_id TEXT NOT NULL,
                    assigned_by TEXT NOT NULL,
                    status TEXT NOT NULL,
                    remarks TEXT,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_assignments_submission
                    ON assignments(submission_id, id);

                CREATE TABLE IF NOT EXISTS reviewers (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    role TEXT NOT NULL,
                    category_specialization TEXT,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS stage_instances (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    submission_id TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    assigned_user_id TEXT,
                    created_at INTEGER NOT NULL,
                    due_at INTEGER NOT NULL,
                    extended_until INTEGER,
                    extensions_used INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    closed_at INTEGER,
                    notified_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_stage_instances_submission
                    ON stage_instances(submission_id, id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_stage_instances_one_open
                    ON stage_instances(submission_id, stage)
                    WHERE status IN ('OPEN', 'OVERDUE');
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

fn sql_err(operation: &'static str) -> impl Fn(rusqlite::Error) -> RepositoryError {
    move |e| RepositoryError::storage(operation, e.to_string())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn version_to_i64(version: u64) -> Result<i64, RepositoryError> {
    i64::try_from(version).map_err(|_| {
        RepositoryError::storage(
            "encode version",
            format!("version {} exceeds maximum storable value", version),
        )
    })
}

fn load_submission(
    conn: &Connection,
    id: &str,
    operation: &'static str,
) -> Result<Option<Submission>, RepositoryError> {
    conn.query_row(
        &format!("SELECT {} FROM submissions WHERE id = ?1", SUBMISSION_COLUMNS),
        params![id],
        SubmissionRow::read,
    )
    .optional()
    .map_err(sql_err(operation))?
    .map(SubmissionRow::into_submission)
    .transpose()
}

fn write_submission(
    conn: &Connection,
    submission: &Submission,
    operation: &'static str,
) -> Result<(), RepositoryError> {
    let details_json = serde_json::to_string(&submission.details)
        .map_err(|e| RepositoryError::storage("serialize details", e.to_string()))?;
    conn.execute(
        "UPDATE submissions SET title = ?2, abstract_text = ?3, details_json = ?4,
             document_count = ?5, status = ?6, current_stage_label = ?7,
             supervisor_id = ?8, evaluator_id = ?9, assigned_at = ?10,
             materials_status = ?11, version = ?12, updated_at = ?13
         WHERE id = ?1",
        params![
            submission.id.as_str(),
            submission.title,
            submission.abstract_text,
            details_json,
            i64::from(submission.document_count),
            submission.status.as_str(),
            submission.current_stage_label,
            submission.supervisor_id.as_ref().map(UserId::as_str),
            submission.evaluator_id.as_ref().map(UserId::as_str),
            submission.assigned_at.map(to_millis),
            submission.materials_status.as_str(),
            version_to_i64(submission.version)?,
            to_millis(submission.updated_at),
        ],
    )
    .map_err(sql_err(operation))?;
    Ok(())
}

fn insert_history(
    conn: &Connection,
    entry: &ProcessTrackingEntry,
) -> Result<(), RepositoryError> {
    let metadata_json = serde_json::to_string(&entry.metadata)
        .map_err(|e| RepositoryError::storage("serialize metadata", e.to_string()))?;
    conn.execute(
        &format!(
            "INSERT INTO process_tracking ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            HISTORY_COLUMNS
        ),
        params![
            entry.submission_id.as_str(),
            entry.stage_label,
            entry.status.as_str(),
            entry.actor_id.as_str(),
            entry.actor_name,
            entry.actor_role.as_str(),
            entry.action,
            entry.description,
            metadata_json,
            to_millis(entry.recorded_at),
        ],
    )
    .map_err(sql_err("append history"))?;
    Ok(())
}

fn insert_evaluation(conn: &Connection, evaluation: &Evaluation) -> Result<(), RepositoryError> {
    conn.execute(
        &format!(
            "INSERT INTO evaluations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            EVALUATION_COLUMNS
        ),
        params![
            evaluation.submission_id.as_str(),
            evaluation.evaluator_id.as_str(),
            evaluation.scores.innovation,
            evaluation.scores.feasibility,
            evaluation.scores.market_potential,
            evaluation.scores.technical_merit,
            evaluation.grade.as_str(),
            evaluation.remarks,
            evaluation.decision.as_str(),
            to_millis(evaluation.created_at),
        ],
    )
    .map_err(sql_err("record evaluation"))?;
    Ok(())
}

fn load_stage(conn: &Connection, id: i64) -> Result<Option<StageInstance>, RepositoryError> {
    conn.query_row(
        &format!("SELECT {} FROM stage_instances WHERE id = ?1", STAGE_COLUMNS),
        params![id],
        StageRow::read,
    )
    .optional()
    .map_err(sql_err("load stage instance"))?
    .map(StageRow::into_instance)
    .transpose()
}

fn write_stage(conn: &Connection, instance: &StageInstance) -> Result<(), RepositoryError> {
    conn.execute(
        "UPDATE stage_instances SET assigned_user_id = ?2, due_at = ?3,
             extended_until = ?4, extensions_used = ?5, status = ?6,
             closed_at = ?7, notified_at = ?8
         WHERE id = ?1",
        params![
            instance.id,
            instance.assigned_user_id.as_ref().map(UserId::as_str),
            to_millis(instance.due_at),
            instance.extended_until.map(to_millis),
            i64::from(instance.extensions_used),
            instance.status.as_str(),
            instance.closed_at.map(to_millis),
            instance.notified_at.map(to_millis),
        ],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            RepositoryError::conflict(format!(
                "an open {} stage already exists for submission {}",
                instance.stage, instance.submission_id
            ))
        } else {
            RepositoryError::storage("update stage instance", e.to_string())
        }
    })?;
    Ok(())
}

/// Row equality at the precision the table stores timestamps in.
fn same_stored_row(stored: &StageInstance, expected: &StageInstance) -> bool {
    let millis = |at: Option<DateTime<Utc>>| at.map(to_millis);
    stored.assigned_user_id == expected.assigned_user_id
        && stored.status == expected.status
        && stored.extensions_used == expected.extensions_used
        && to_millis(stored.due_at) == to_millis(expected.due_at)
        && millis(stored.extended_until) == millis(expected.extended_until)
        && millis(stored.closed_at) == millis(expected.closed_at)
        && millis(stored.notified_at) == millis(expected.notified_at)
}

fn query_stages(
    conn: &Connection,
    where_clause: &str,
    args: &[&dyn rusqlite::ToSql],
    operation: &'static str,
) -> Result<Vec<StageInstance>, RepositoryError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM stage_instances WHERE {} ORDER BY id",
            STAGE_COLUMNS, where_clause
        ))
        .map_err(sql_err(operation))?;
    let rows = stmt
        .query_map(args, StageRow::read)
        .map_err(sql_err(operation))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err(operation))?;
    rows.into_iter().map(StageRow::into_instance).collect()
}

// =============================================================================
// WorkflowRepository trait implementation
// =============================================================================

#[async_trait]
impl WorkflowRepository for SqliteRepository {
    async fn insert_submission(&self, submission: &Submission) -> Result<(), RepositoryError> {
        let submission = submission.clone();
        let details_json = serde_json::to_string(&submission.details)
            .map_err(|e| RepositoryError::storage("serialize details", e.to_string()))?;
        let version = version_to_i64(submission.version)?;

        self.with_conn("insert submission", move |conn| {
            let result = conn.execute(
                &format!(
                    "INSERT INTO submissions ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    SUBMISSION_COLUMNS
                ),
                params![
                    submission.id.as_str(),
                    submission.applicant_id.as_str(),
                    submission.title,
                    submission.abstract_text,
                    submission.category.as_str(),
                    details_json,
                    i64::from(submission.document_count),
                    submission.status.as_str(),
                    submission.current_stage_label,
                    submission.supervisor_id.as_ref().map(UserId::as_str),
                    submission.evaluator_id.as_ref().map(UserId::as_str),
                    submission.assigned_at.map(to_millis),
                    submission.materials_status.as_str(),
                    version,
                    to_millis(submission.created_at),
                    to_millis(submission.updated_at),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(RepositoryError::conflict(format!(
                    "submission {} already exists",
                    submission.id
                ))),
                Err(e) => Err(RepositoryError::storage("insert submission", e.to_string())),
            }
        })
        .await
    }

    async fn get_submission(
        &self,
        id: &SubmissionId,
    ) -> Result<Option<Submission>, RepositoryError> {
        let id = id.0.clone();
        self.with_conn("get submission", move |conn| {
            load_submission(conn, &id, "get submission")
        })
        .await
    }

    async fn commit_transition(
        &self,
        commit: TransitionCommit,
    ) -> Result<Submission, RepositoryError> {
        self.with_conn("commit transition", move |conn| {
            let tx = conn.transaction().map_err(sql_err("begin transaction"))?;

            let mut submission = load_submission(&tx, commit.submission_id.as_str(), "commit transition")?
                .ok_or_else(|| {
                    RepositoryError::not_found(format!("submission {}", commit.submission_id))
                })?;
            commit.check_current(&submission)?;
            commit.apply(&mut submission);

            write_submission(&tx, &submission, "commit transition")?;
            for entry in &commit.audit_entries {
                insert_history(&tx, entry)?;
            }
            for evaluation in &commit.evaluations {
                insert_evaluation(&tx, evaluation)?;
            }

            tx.commit().map_err(sql_err("commit transaction"))?;
            Ok(submission)
        })
        .await
    }

    async fn set_reviewer(
        &self,
        observed: &Submission,
        kind: ReviewerKind,
        reviewer_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Submission, RepositoryError> {
        let id = observed.id.clone();
        let (observed_status, observed_version) = (observed.status, observed.version);
        let reviewer_id = reviewer_id.clone();
        self.with_conn("set reviewer", move |conn| {
            let tx = conn.transaction().map_err(sql_err("begin transaction"))?;
            let mut submission = load_submission(&tx, id.as_str(), "set reviewer")?
                .ok_or_else(|| RepositoryError::not_found(format!("submission {}", id)))?;
            if submission.status != observed_status || submission.version != observed_version {
                return Err(RepositoryError::StaleState {
                    submission_id: id,
                    observed: observed_status,
                });
            }
            match kind {
                ReviewerKind::Supervisor => submission.supervisor_id = Some(reviewer_id),
                ReviewerKind::Evaluator => submission.evaluator_id = Some(reviewer_id),
            }
            submission.assigned_at = Some(at);
            submission.updated_at = at;
            submission.version += 1;
            write_submission(&tx, &submission, "set reviewer")?;
            tx.commit().map_err(sql_err("commit transaction"))?;
            Ok(submission)
        })
        .await
    }

    async fn history(
        &self,
        id: &SubmissionId,
    ) -> Result<Vec<ProcessTrackingEntry>, RepositoryError> {
        let id = id.0.clone();
        self.with_conn("history", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM process_tracking WHERE submission_id = ?1 ORDER BY id",
                    HISTORY_COLUMNS
                ))
                .map_err(sql_err("history"))?;
            let rows = stmt
                .query_map(params![id], read_history)
                .map_err(sql_err("history"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err("history"))?;
            rows.into_iter().map(history_entry).collect()
        })
        .await
    }

    async fn evaluations(&self, id: &SubmissionId) -> Result<Vec<Evaluation>, RepositoryError> {
        let id = id.0.clone();
        self.with_conn("evaluations", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM evaluations WHERE submission_id = ?1 ORDER BY id",
                    EVALUATION_COLUMNS
                ))
                .map_err(sql_err("evaluations"))?;
            let rows = stmt
                .query_map(params![id], EvaluationRow::read)
                .map_err(sql_err("evaluations"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err("evaluations"))?;
            rows.into_iter().map(EvaluationRow::into_evaluation).collect()
        })
        .await
    }

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<(), RepositoryError> {
        let a = assignment.clone();
        self.with_conn("insert assignment", move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO assignments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    ASSIGNMENT_COLUMNS
                ),
                params![
                    a.submission_id.as_str(),
                    a.kind.as_str(),
                    a.reviewer_id.as_str(),
                    a.assigned_by.as_str(),
                    a.status.as_str(),
                    a.remarks,
                    to_millis(a.created_at),
                ],
            )
            .map_err(sql_err("insert assignment"))?;
            Ok(())
        })
        .await
    }

    async fn assignments(&self, id: &SubmissionId) -> Result<Vec<Assignment>, RepositoryError> {
        let id = id.0.clone();
        self.with_conn("assignments", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM assignments WHERE submission_id = ?1 ORDER BY id",
                    ASSIGNMENT_COLUMNS
                ))
                .map_err(sql_err("assignments"))?;
            let rows = stmt
                .query_map(params![id], read_assignment)
                .map_err(sql_err("assignments"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err("assignments"))?;
            rows.into_iter().map(assignment).collect()
        })
        .await
    }

    async fn update_assignment_status(
        &self,
        id: &SubmissionId,
        kind: ReviewerKind,
        reviewer_id: &UserId,
        status: AssignmentStatus,
        remarks: Option<String>,
    ) -> Result<bool, RepositoryError> {
        let id = id.0.clone();
        let reviewer_id = reviewer_id.0.clone();
        self.with_conn("update assignment status", move |conn| {
            let updated = conn
                .execute(
                    "UPDATE assignments SET status = ?4, remarks = ?5
                     WHERE id = (
                         SELECT id FROM assignments
                         WHERE submission_id = ?1 AND kind = ?2 AND reviewer_id = ?3
                         ORDER BY id DESC LIMIT 1
                     )",
                    params![id, kind.as_str(), reviewer_id, status.as_str(), remarks],
                )
                .map_err(sql_err("update assignment status"))?;
            Ok(updated > 0)
        })
        .await
    }

    async fn upsert_reviewer(&self, reviewer: &Reviewer) -> Result<(), RepositoryError> {
        let r = reviewer.clone();
        self.with_conn("upsert reviewer", move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO reviewers ({}) VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                         name = excluded.name,
                         role = excluded.role,
                         category_specialization = excluded.category_specialization",
                    REVIEWER_COLUMNS
                ),
                params![
                    r.id.as_str(),
                    r.name,
                    r.role.as_str(),
                    r.category_specialization.map(|c| c.as_str()),
                    to_millis(r.created_at),
                ],
            )
            .map_err(sql_err("upsert reviewer"))?;
            Ok(())
        })
        .await
    }

    async fn get_reviewer(&self, id: &UserId) -> Result<Option<Reviewer>, RepositoryError> {
        let id = id.0.clone();
        self.with_conn("get reviewer", move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM reviewers WHERE id = ?1", REVIEWER_COLUMNS),
                params![id],
                read_reviewer,
            )
            .optional()
            .map_err(sql_err("get reviewer"))?
            .map(reviewer)
            .transpose()
        })
        .await
    }

    async fn reviewers(&self, role: Role) -> Result<Vec<Reviewer>, RepositoryError> {
        self.with_conn("reviewers", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM reviewers WHERE role = ?1 ORDER BY created_at, id",
                    REVIEWER_COLUMNS
                ))
                .map_err(sql_err("reviewers"))?;
            let rows = stmt
                .query_map(params![role.as_str()], read_reviewer)
                .map_err(sql_err("reviewers"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err("reviewers"))?;
            rows.into_iter().map(reviewer).collect()
        })
        .await
    }

    async fn insert_stage_instance(
        &self,
        instance: StageInstance,
    ) -> Result<StageInstance, RepositoryError> {
        self.with_conn("insert stage instance", move |conn| {
            let mut instance = instance;
            let result = conn.execute(
                "INSERT INTO stage_instances
                     (submission_id, stage, assigned_user_id, created_at, due_at,
                      extended_until, extensions_used, status, closed_at, notified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    instance.submission_id.as_str(),
                    instance.stage.as_str(),
                    instance.assigned_user_id.as_ref().map(UserId::as_str),
                    to_millis(instance.created_at),
                    to_millis(instance.due_at),
                    instance.extended_until.map(to_millis),
                    i64::from(instance.extensions_used),
                    instance.status.as_str(),
                    instance.closed_at.map(to_millis),
                    instance.notified_at.map(to_millis),
                ],
            );
            match result {
                Ok(_) => {
                    instance.id = conn.last_insert_rowid();
                    Ok(instance)
                }
                Err(e) if is_constraint_violation(&e) => Err(RepositoryError::conflict(format!(
                    "an open {} stage already exists for submission {}",
                    instance.stage, instance.submission_id
                ))),
                Err(e) => Err(RepositoryError::storage(
                    "insert stage instance",
                    e.to_string(),
                )),
            }
        })
        .await
    }

    async fn update_stage_instance(
        &self,
        instance: &StageInstance,
    ) -> Result<(), RepositoryError> {
        let instance = instance.clone();
        self.with_conn("update stage instance", move |conn| {
            let tx = conn.transaction().map_err(sql_err("begin transaction"))?;
            let stored = load_stage(&tx, instance.id)?.ok_or_else(|| {
                RepositoryError::not_found(format!("stage instance {}", instance.id))
            })?;
            if !stored.is_open() {
                return Err(RepositoryError::conflict(format!(
                    "stage instance {} is closed and cannot change",
                    instance.id
                )));
            }
            write_stage(&tx, &instance)?;
            tx.commit().map_err(sql_err("commit transaction"))?;
            Ok(())
        })
        .await
    }

    async fn replace_stage_instance(
        &self,
        expected: &StageInstance,
        updated: &StageInstance,
    ) -> Result<(), RepositoryError> {
        let expected = expected.clone();
        let updated = updated.clone();
        self.with_conn("replace stage instance", move |conn| {
            let tx = conn.transaction().map_err(sql_err("begin transaction"))?;
            let stored = load_stage(&tx, expected.id)?.ok_or_else(|| {
                RepositoryError::not_found(format!("stage instance {}", expected.id))
            })?;
            if !same_stored_row(&stored, &expected) {
                return Err(RepositoryError::conflict(format!(
                    "stage instance {} changed since it was read",
                    expected.id
                )));
            }
            write_stage(&tx, &updated)?;
            tx.commit().map_err(sql_err("commit transaction"))?;
            Ok(())
        })
        .await
    }

    async fn stage_instances(
        &self,
        id: &SubmissionId,
    ) -> Result<Vec<StageInstance>, RepositoryError> {
        let id = id.0.clone();
        self.with_conn("stage instances", move |conn| {
            query_stages(
                conn,
                "submission_id = ?1",
                &[&id as &dyn rusqlite::ToSql],
                "stage instances",
            )
        })
        .await
    }

    async fn open_stage_instances(&self) -> Result<Vec<StageInstance>, RepositoryError> {
        let open = StageInstanceStatus::Open.as_str();
        let overdue = StageInstanceStatus::Overdue.as_str();
        self.with_conn("open stage instances", move |conn| {
            query_stages(
                conn,
                "status IN (?1, ?2)",
                &[&open as &dyn rusqlite::ToSql, &overdue],
                "open stage instances",
            )
        })
        .await
    }
}

impl SqliteRepository {
    /// Number of submissions in each status.
    pub async fn status_counts(&self) -> Result<Vec<(SubmissionStatus, u64)>, RepositoryError> {
        self.with_conn("status counts", |conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM submissions GROUP BY status ORDER BY status")
                .map_err(sql_err("status counts"))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(sql_err("status counts"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err("status counts"))?;
            rows.into_iter()
                .map(|(status, count)| {
                    Ok((
                        parse(&status, "submission status")?,
                        u64::try_from(count).unwrap_or(0),
                    ))
                })
                .collect()
        })
        .await
    }

    /// Oldest created_at among open stage instances, for startup logging.
    pub async fn oldest_open_stage(&self) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        self.with_conn("oldest open stage", |conn| {
            let millis: Option<i64> = conn
                .query_row(
                    "SELECT MIN(created_at) FROM stage_instances
                     WHERE status IN ('OPEN', 'OVERDUE')",
                    [],
                    |row| row.get(0),
                )
                .map_err(sql_err("oldest open stage"))?;
            millis.map(|m| from_millis(m, "created_at")).transpose()
        })
        .await
    }
}
