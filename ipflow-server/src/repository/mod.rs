//! Repository abstraction for workflow persistence.
//!
//! The `WorkflowRepository` trait covers submissions, the append-only history,
//! evaluations, assignments, the reviewer directory and stage instances.
//! Implementations: `InMemoryRepository` (tests, ephemeral runs) and
//! `SqliteRepository` (durable).

mod memory;
pub mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ipflow_core::{
    Assignment, AssignmentStatus, Evaluation, MaterialsStatus, ProcessTrackingEntry, Reviewer,
    ReviewerKind, Role, StageInstance, Submission, SubmissionEdit, SubmissionId, SubmissionStatus,
    UserId, WorkflowError,
};

/// Errors from repository operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The backend failed (I/O, SQL, task join).
    Storage {
        operation: &'static str,
        message: String,
    },
    /// Stored data could not be decoded.
    Corruption { what: String },
    NotFound { what: String },
    /// A uniqueness rule would be broken.
    Conflict { message: String },
    /// Compare-and-swap lost: the submission moved on since it was read.
    StaleState {
        submission_id: SubmissionId,
        observed: SubmissionStatus,
    },
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage { operation, message } => {
                write!(f, "storage error during {}: {}", operation, message)
            }
            Self::Corruption { what } => write!(f, "corrupt {} in database", what),
            Self::NotFound { what } => write!(f, "{} not found", what),
            Self::Conflict { message } => write!(f, "{}", message),
            Self::StaleState {
                submission_id,
                observed,
            } => write!(
                f,
                "submission {} is no longer {}",
                submission_id, observed
            ),
        }
    }
}

impl std::error::Error for RepositoryError {}

impl From<RepositoryError> for WorkflowError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { what } => WorkflowError::NotFound(what),
            RepositoryError::Conflict { message } => WorkflowError::Conflict(message),
            RepositoryError::StaleState {
                submission_id,
                observed,
            } => WorkflowError::StaleState {
                submission: submission_id,
                observed,
            },
            other @ (RepositoryError::Storage { .. } | RepositoryError::Corruption { .. }) => {
                WorkflowError::Persistence(other.to_string())
            }
        }
    }
}

/// Everything an accepted transition writes atomically.
///
/// The status change, the history entry and any evaluation land together or
/// not at all. The write only succeeds if the stored submission still has
/// `expected_status` and `expected_version`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionCommit {
    pub submission_id: SubmissionId,
    pub expected_status: SubmissionStatus,
    pub expected_version: u64,
    pub new_status: SubmissionStatus,
    pub stage_label: String,
    pub materials_status: Option<MaterialsStatus>,
    pub edit: Option<SubmissionEdit>,
    pub audit_entries: Vec<ProcessTrackingEntry>,
    pub evaluations: Vec<Evaluation>,
    pub committed_at: DateTime<Utc>,
}

impl TransitionCommit {
    /// Check the compare-and-swap precondition against the stored record.
    pub fn check_current(&self, stored: &Submission) -> Result<(), RepositoryError> {
        if stored.status != self.expected_status || stored.version != self.expected_version {
            return Err(RepositoryError::StaleState {
                submission_id: self.submission_id.clone(),
                observed: self.expected_status,
            });
        }
        Ok(())
    }

    /// Apply the materialized changes to `submission`.
    pub fn apply(&self, submission: &mut Submission) {
        submission.status = self.new_status;
        submission.current_stage_label = self.stage_label.clone();
        if let Some(materials) = self.materials_status {
            submission.materials_status = materials;
        }
        if let Some(edit) = &self.edit {
            submission.apply_edit(edit);
        }
        submission.version += 1;
        submission.updated_at = self.committed_at;
    }
}

/// Persistence for the workflow.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    // -------------------------------------------------------------------------
    // Submissions and history
    // -------------------------------------------------------------------------

    /// Store a new submission. `Conflict` if the id already exists.
    async fn insert_submission(&self, submission: &Submission) -> Result<(), RepositoryError>;

    async fn get_submission(
        &self,
        id: &SubmissionId,
    ) -> Result<Option<Submission>, RepositoryError>;

    /// Atomically apply a transition (see `TransitionCommit`).
    ///
    /// Returns the updated submission, `StaleState` if the precondition does
    /// not hold, `NotFound` if the submission does not exist.
    async fn commit_transition(
        &self,
        commit: TransitionCommit,
    ) -> Result<Submission, RepositoryError>;

    /// Fill a reviewer slot on the submission as it was `observed`.
    ///
    /// Bumps the version. `StaleState` if the stored status or version no
    /// longer match the observed ones.
    async fn set_reviewer(
        &self,
        observed: &Submission,
        kind: ReviewerKind,
        reviewer_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Submission, RepositoryError>;

    /// History entries in the order they were appended.
    async fn history(&self, id: &SubmissionId)
        -> Result<Vec<ProcessTrackingEntry>, RepositoryError>;

    async fn evaluations(&self, id: &SubmissionId) -> Result<Vec<Evaluation>, RepositoryError>;

    // -------------------------------------------------------------------------
    // Assignments and the reviewer directory
    // -------------------------------------------------------------------------

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<(), RepositoryError>;

    async fn assignments(&self, id: &SubmissionId) -> Result<Vec<Assignment>, RepositoryError>;

    /// Update the most recent assignment of `reviewer_id` to `kind`.
    ///
    /// Returns false when there is no such assignment.
    async fn update_assignment_status(
        &self,
        id: &SubmissionId,
        kind: ReviewerKind,
        reviewer_id: &UserId,
        status: AssignmentStatus,
        remarks: Option<String>,
    ) -> Result<bool, RepositoryError>;

    async fn upsert_reviewer(&self, reviewer: &Reviewer) -> Result<(), RepositoryError>;

    async fn get_reviewer(&self, id: &UserId) -> Result<Option<Reviewer>, RepositoryError>;

    async fn reviewers(&self, role: Role) -> Result<Vec<Reviewer>, RepositoryError>;

    // -------------------------------------------------------------------------
    // Stage instances
    // -------------------------------------------------------------------------

    /// Store a new instance and return it with its id.
    ///
    /// `Conflict` if an `OPEN`/`OVERDUE` instance exists for the same
    /// (submission, stage).
    async fn insert_stage_instance(
        &self,
        instance: StageInstance,
    ) -> Result<StageInstance, RepositoryError>;

    /// Overwrite a stored instance. Closed instances are immutable (`Conflict`).
    async fn update_stage_instance(&self, instance: &StageInstance)
        -> Result<(), RepositoryError>;

    /// Overwrite an instance only if the stored row still equals `expected`.
    ///
    /// `Conflict` when it changed in between (an extension racing a sweep).
    async fn replace_stage_instance(
        &self,
        expected: &StageInstance,
        updated: &StageInstance,
    ) -> Result<(), RepositoryError>;

    /// All instances for a submission, oldest first.
    async fn stage_instances(
        &self,
        id: &SubmissionId,
    ) -> Result<Vec<StageInstance>, RepositoryError>;

    /// Every `OPEN`/`OVERDUE` instance across all submissions, oldest first.
    async fn open_stage_instances(&self) -> Result<Vec<StageInstance>, RepositoryError>;

    /// Most recently created instance for a submission, open or not.
    async fn latest_stage_instance(
        &self,
        id: &SubmissionId,
    ) -> Result<Option<StageInstance>, RepositoryError> {
        Ok(self.stage_instances(id).await?.into_iter().last())
    }

    /// Most recently created open instance for a submission.
    async fn latest_open_stage_instance(
        &self,
        id: &SubmissionId,
    ) -> Result<Option<StageInstance>, RepositoryError> {
        Ok(self
            .stage_instances(id)
            .await?
            .into_iter()
            .filter(StageInstance::is_open)
            .last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_errors_map_onto_workflow_errors() {
        let stale = RepositoryError::StaleState {
            submission_id: SubmissionId::from("s1"),
            observed: SubmissionStatus::WaitingSupervisor,
        };
        assert!(WorkflowError::from(stale).is_retryable());

        let storage = RepositoryError::storage("commit transition", "disk I/O error");
        match WorkflowError::from(storage) {
            WorkflowError::Persistence(msg) => assert!(msg.contains("commit transition")),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            WorkflowError::from(RepositoryError::conflict("open instance exists")),
            WorkflowError::Conflict(_)
        ));
    }
}
