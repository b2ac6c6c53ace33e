//! In-memory implementation of `WorkflowRepository`.
//!
//! All data lives behind one `RwLock`, so every method is atomic with respect
//! to the others. All state is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use ipflow_core::{
    Assignment, AssignmentStatus, Evaluation, ProcessTrackingEntry, Reviewer, ReviewerKind, Role,
    StageInstance, Submission, SubmissionId, UserId,
};

use super::{RepositoryError, TransitionCommit, WorkflowRepository};

#[derive(Default)]
struct Inner {
    submissions: HashMap<SubmissionId, Submission>,
    history: HashMap<SubmissionId, Vec<ProcessTrackingEntry>>,
    evaluations: HashMap<SubmissionId, Vec<Evaluation>>,
    assignments: Vec<Assignment>,
    reviewers: HashMap<UserId, Reviewer>,
    /// Ordered by id.
    stages: Vec<StageInstance>,
    next_stage_id: i64,
}

/// In-memory workflow repository.
pub struct InMemoryRepository {
    inner: RwLock<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_stage_id: 1,
                ..Default::default()
            }),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(id: &SubmissionId) -> RepositoryError {
    RepositoryError::not_found(format!("submission {}", id))
}

#[async_trait]
impl WorkflowRepository for InMemoryRepository {
    async fn insert_submission(&self, submission: &Submission) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        if inner.submissions.contains_key(&submission.id) {
            return Err(RepositoryError::conflict(format!(
                "submission {} already exists",
                submission.id
            )));
        }
        inner
            .submissions
            .insert(submission.id.clone(), submission.clone());
        Ok(())
    }

    async fn get_submission(
        &self,
        id: &SubmissionId,
    ) -> Result<Option<Submission>, RepositoryError> {
        Ok(self.inner.read().await.submissions.get(id).cloned())
    }

    async fn commit_transition(
        &self,
        commit: TransitionCommit,
    ) -> Result<Submission, RepositoryError> {
        let mut inner = self.inner.write().await;
        let submission = inner
            .submissions
            .get_mut(&commit.submission_id)
            .ok_or_else(|| missing(&commit.submission_id))?;

        commit.check_current(submission)?;
        commit.apply(submission);
        let updated = submission.clone();

        inner
            .history
            .entry(commit.submission_id.clone())
            .or_default()
            .extend(commit.audit_entries);
        inner
            .evaluations
            .entry(commit.submission_id)
            .or_default()
            .extend(commit.evaluations);
        Ok(updated)
    }

    async fn set_reviewer(
        &self,
        observed: &Submission,
        kind: ReviewerKind,
        reviewer_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Submission, RepositoryError> {
        let mut inner = self.inner.write().await;
        let submission = inner
            .submissions
            .get_mut(&observed.id)
            .ok_or_else(|| missing(&observed.id))?;
        if submission.status != observed.status || submission.version != observed.version {
            return Err(RepositoryError::StaleState {
                submission_id: observed.id.clone(),
                observed: observed.status,
            });
        }
        match kind {
            ReviewerKind::Supervisor => submission.supervisor_id = Some(reviewer_id.clone()),
            ReviewerKind::Evaluator => submission.evaluator_id = Some(reviewer_id.clone()),
        }
        submission.assigned_at = Some(at);
        submission.updated_at = at;
        submission.version += 1;
        Ok(submission.clone())
    }

    async fn history(
        &self,
        id: &SubmissionId,
    ) -> Result<Vec<ProcessTrackingEntry>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .history
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn evaluations(&self, id: &SubmissionId) -> Result<Vec<Evaluation>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .evaluations
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<(), RepositoryError> {
        self.inner.write().await.assignments.push(assignment.clone());
        Ok(())
    }

    async fn assignments(&self, id: &SubmissionId) -> Result<Vec<Assignment>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .assignments
            .iter()
            .filter(|a| &a.submission_id == id)
            .cloned()
            .collect())
    }

    async fn update_assignment_status(
        &self,
        id: &SubmissionId,
        kind: ReviewerKind,
        reviewer_id: &UserId,
        status: AssignmentStatus,
        remarks: Option<String>,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().await;
        let latest = inner.assignments.iter_mut().rev().find(|a| {
            &a.submission_id == id && a.kind == kind && &a.reviewer_id == reviewer_id
        });
        match latest {
            Some(assignment) => {
                assignment.status = status;
                assignment.remarks = remarks;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_reviewer(&self, reviewer: &Reviewer) -> Result<(), RepositoryError> {
        self.inner
            .write()
            .await
            .reviewers
            .insert(reviewer.id.clone(), reviewer.clone());
        Ok(())
    }

    async fn get_reviewer(&self, id: &UserId) -> Result<Option<Reviewer>, RepositoryError> {
        Ok(self.inner.read().await.reviewers.get(id).cloned())
    }

    async fn reviewers(&self, role: Role) -> Result<Vec<Reviewer>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut reviewers: Vec<Reviewer> = inner
            .reviewers
            .values()
            .filter(|r| r.role == role)
            .cloned()
            .collect();
        reviewers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(reviewers)
    }

    async fn insert_stage_instance(
        &self,
        mut instance: StageInstance,
    ) -> Result<StageInstance, RepositoryError> {
        let mut inner = self.inner.write().await;
        let duplicate = inner.stages.iter().any(|s| {
            s.is_open() && s.submission_id == instance.submission_id && s.stage == instance.stage
        });
        if duplicate {
            return Err(RepositoryError::conflict(format!(
                "an open {} stage already exists for submission {}",
                instance.stage, instance.submission_id
            )));
        }
        instance.id = inner.next_stage_id;
        inner.next_stage_id += 1;
        inner.stages.push(instance.clone());
        Ok(instance)
    }

    async fn update_stage_instance(
        &self,
        instance: &StageInstance,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .stages
            .iter_mut()
            .find(|s| s.id == instance.id)
            .ok_or_else(|| RepositoryError::not_found(format!("stage instance {}", instance.id)))?;
        if !stored.is_open() {
            return Err(RepositoryError::conflict(format!(
                "stage instance {} is closed and cannot change",
                instance.id
            )));
        }
        *stored = instance.clone();
        Ok(())
    }

    async fn replace_stage_instance(
        &self,
        expected: &StageInstance,
        updated: &StageInstance,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .stages
            .iter_mut()
            .find(|s| s.id == expected.id)
            .ok_or_else(|| RepositoryError::not_found(format!("stage instance {}", expected.id)))?;
        if stored != expected {
            return Err(RepositoryError::conflict(format!(
                "stage instance {} changed since it was read",
                expected.id
            )));
        }
        *stored = updated.clone();
        Ok(())
    }

    async fn stage_instances(
        &self,
        id: &SubmissionId,
    ) -> Result<Vec<StageInstance>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .stages
            .iter()
            .filter(|s| &s.submission_id == id)
            .cloned()
            .collect())
    }

    async fn open_stage_instances(&self) -> Result<Vec<StageInstance>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .stages
            .iter()
            .filter(|s| s.is_open())
            .cloned()
            .collect())
    }
}
