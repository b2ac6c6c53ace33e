//! Stage instance bookkeeping on top of the repository.
//!
//! The deadline arithmetic itself is pure and lives in `ipflow_core::sla`;
//! this type loads and stores instances and applies the configured policies.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use ipflow_core::sla::{self, CloseStatus};
use ipflow_core::{
    SlaPolicies, SlaSnapshot, StageInstance, StageName, StagePolicy, SubmissionId, UserId,
    WorkflowError,
};

use crate::repository::WorkflowRepository;

#[derive(Clone)]
pub struct StageInstanceTracker {
    repo: Arc<dyn WorkflowRepository>,
    policies: Arc<SlaPolicies>,
}

impl StageInstanceTracker {
    pub fn new(repo: Arc<dyn WorkflowRepository>, policies: SlaPolicies) -> Self {
        Self {
            repo,
            policies: Arc::new(policies),
        }
    }

    pub fn policy(&self, stage: StageName) -> StagePolicy {
        self.policies.get(stage)
    }

    /// Open a new instance due according to the stage policy.
    ///
    /// `Conflict` if an open instance already exists for the pair.
    pub async fn create(
        &self,
        submission_id: &SubmissionId,
        stage: StageName,
        assigned_user_id: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<StageInstance, WorkflowError> {
        let instance = StageInstance::open(
            submission_id.clone(),
            stage,
            assigned_user_id,
            &self.policy(stage),
            now,
        );
        let stored = self.repo.insert_stage_instance(instance).await?;
        info!(
            "Opened {} stage for {} (due {})",
            stage, submission_id, stored.due_at
        );
        Ok(stored)
    }

    /// Make sure `stage` is open for the submission and assigned to `assigned_user_id`.
    ///
    /// An existing open instance is reassigned in place and keeps its deadline.
    pub async fn ensure_open(
        &self,
        submission_id: &SubmissionId,
        stage: StageName,
        assigned_user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<StageInstance, WorkflowError> {
        let existing = self
            .repo
            .stage_instances(submission_id)
            .await?
            .into_iter()
            .find(|i| i.is_open() && i.stage == stage);

        match existing {
            Some(mut instance) => {
                if instance.assigned_user_id.as_ref() != Some(assigned_user_id) {
                    instance.assigned_user_id = Some(assigned_user_id.clone());
                    self.repo.update_stage_instance(&instance).await?;
                    info!(
                        "Reassigned open {} stage for {} to {}",
                        stage, submission_id, assigned_user_id
                    );
                }
                Ok(instance)
            }
            None => {
                self.create(submission_id, stage, Some(assigned_user_id.clone()), now)
                    .await
            }
        }
    }

    /// Close the most recent open instance of any stage. No-op if none is open.
    pub async fn close_latest(
        &self,
        submission_id: &SubmissionId,
        close_status: CloseStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<StageInstance>, WorkflowError> {
        let Some(mut instance) = self.repo.latest_open_stage_instance(submission_id).await? else {
            debug!("No open stage to close for {}", submission_id);
            return Ok(None);
        };
        instance.close(close_status, now);
        self.repo.update_stage_instance(&instance).await?;
        info!(
            "Closed {} stage for {} as {}",
            instance.stage,
            submission_id,
            instance.status.as_str()
        );
        Ok(Some(instance))
    }

    /// Extend the latest open instance by its policy's extension length.
    pub async fn extend(
        &self,
        submission_id: &SubmissionId,
        now: DateTime<Utc>,
    ) -> Result<StageInstance, WorkflowError> {
        let read = self
            .repo
            .latest_open_stage_instance(submission_id)
            .await?
            .ok_or_else(|| {
                WorkflowError::NotFound(format!("open stage for submission {}", submission_id))
            })?;
        let policy = self.policy(read.stage);
        let mut instance = read.clone();
        sla::extend(&mut instance, &policy, now)?;
        self.repo.replace_stage_instance(&read, &instance).await?;
        info!(
            "Extended {} stage for {} to {} ({} extension(s) used)",
            instance.stage,
            submission_id,
            instance.effective_due(),
            instance.extensions_used
        );
        Ok(instance)
    }

    /// Stage of the latest open instance, if any.
    pub async fn active_stage(
        &self,
        submission_id: &SubmissionId,
    ) -> Result<Option<StageName>, WorkflowError> {
        Ok(self
            .repo
            .latest_open_stage_instance(submission_id)
            .await?
            .map(|i| i.stage))
    }

    /// Classification of the submission's latest stage, open or closed.
    pub async fn sla_status(
        &self,
        submission_id: &SubmissionId,
        now: DateTime<Utc>,
    ) -> Result<Option<SlaSnapshot>, WorkflowError> {
        Ok(self
            .repo
            .latest_stage_instance(submission_id)
            .await?
            .map(|i| SlaSnapshot::of(&i, now)))
    }

    pub async fn open_instances(&self) -> Result<Vec<StageInstance>, WorkflowError> {
        Ok(self.repo.open_stage_instances().await?)
    }

    /// Store `updated` unless the instance changed since `read` was loaded.
    pub async fn save_if_unchanged(
        &self,
        read: &StageInstance,
        updated: &StageInstance,
    ) -> Result<(), WorkflowError> {
        Ok(self.repo.replace_stage_instance(read, updated).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::test_support::t0;
    use chrono::Duration;
    use ipflow_core::{SlaStatus, StageInstanceStatus};

    fn tracker() -> StageInstanceTracker {
        StageInstanceTracker::new(Arc::new(InMemoryRepository::new()), SlaPolicies::default())
    }

    fn sub() -> SubmissionId {
        SubmissionId::from("s1")
    }

    #[tokio::test]
    async fn test_create_rejects_second_open_instance() {
        let tracker = tracker();
        let first = tracker
            .create(&sub(), StageName::SupervisorReview, None, t0())
            .await
            .unwrap();
        assert_eq!(first.due_at, t0() + Duration::days(7));
        assert_eq!(first.status, StageInstanceStatus::Open);

        let err = tracker
            .create(&sub(), StageName::SupervisorReview, None, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_close_latest_picks_most_recent_open_instance() {
        let tracker = tracker();
        tracker
            .create(&sub(), StageName::SupervisorReview, None, t0())
            .await
            .unwrap();
        tracker
            .create(&sub(), StageName::Evaluation, None, t0() + Duration::hours(1))
            .await
            .unwrap();

        let closed = tracker
            .close_latest(&sub(), CloseStatus::Completed, t0() + Duration::hours(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.stage, StageName::Evaluation);
        assert_eq!(
            tracker.active_stage(&sub()).await.unwrap(),
            Some(StageName::SupervisorReview)
        );
    }

    #[tokio::test]
    async fn test_close_latest_without_open_instance_is_noop() {
        let tracker = tracker();
        let closed = tracker
            .close_latest(&sub(), CloseStatus::Completed, t0())
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_ensure_open_reassigns_without_resetting_deadline() {
        let tracker = tracker();
        let first = tracker
            .ensure_open(&sub(), StageName::SupervisorReview, &UserId::from("sup-1"), t0())
            .await
            .unwrap();
        let again = tracker
            .ensure_open(
                &sub(),
                StageName::SupervisorReview,
                &UserId::from("sup-2"),
                t0() + Duration::days(3),
            )
            .await
            .unwrap();

        assert_eq!(again.id, first.id);
        assert_eq!(again.due_at, first.due_at);
        assert_eq!(again.assigned_user_id, Some(UserId::from("sup-2")));
    }

    #[tokio::test]
    async fn test_extend_until_exhausted() {
        let tracker = tracker();
        tracker
            .create(&sub(), StageName::SupervisorReview, None, t0())
            .await
            .unwrap();

        let once = tracker.extend(&sub(), t0()).await.unwrap();
        assert_eq!(once.effective_due(), t0() + Duration::days(10));
        let twice = tracker.extend(&sub(), t0()).await.unwrap();
        assert_eq!(twice.effective_due(), t0() + Duration::days(13));

        let err = tracker.extend(&sub(), t0()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_extend_without_open_instance_is_not_found() {
        let err = tracker().extend(&sub(), t0()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sla_status_reports_latest_instance() {
        let tracker = tracker();
        assert!(tracker.sla_status(&sub(), t0()).await.unwrap().is_none());

        tracker
            .create(&sub(), StageName::SupervisorReview, None, t0())
            .await
            .unwrap();

        let snapshot = tracker
            .sla_status(&sub(), t0() + Duration::days(6))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, SlaStatus::DueSoon);
        assert_eq!(snapshot.days_remaining, 1);

        // Closing on time freezes the classification.
        tracker
            .close_latest(&sub(), CloseStatus::Completed, t0() + Duration::days(1))
            .await
            .unwrap();
        let later = tracker
            .sla_status(&sub(), t0() + Duration::days(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(later.status, SlaStatus::OnTrack);
    }
}
