//! Reviewer assignment.
//!
//! Supervisors are chosen by the applicant or an admin; evaluators are chosen
//! by an admin or matched on category specialization. A submission is never
//! evaluated by its own supervisor or its applicant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use ipflow_core::{
    Assignment, AssignmentStatus, Reviewer, ReviewerKind, Role, StageName, Submission,
    SubmissionStatus, UserId, WorkflowError,
};

use crate::repository::WorkflowRepository;
use crate::tracker::StageInstanceTracker;

/// Recorded as `assigned_by` for automatic matches.
pub const SYSTEM_ASSIGNER: &str = "system";

/// Pick the evaluator for a submission.
///
/// Candidates must specialize in the submission's category and be neither its
/// supervisor nor its applicant. Ties go to the earliest registered, then the
/// lowest id.
pub fn pick_evaluator<'a>(candidates: &'a [Reviewer], submission: &Submission) -> Option<&'a Reviewer> {
    candidates
        .iter()
        .filter(|r| r.role == Role::Evaluator)
        .filter(|r| r.category_specialization == Some(submission.category))
        .filter(|r| submission.supervisor_id.as_ref() != Some(&r.id))
        .filter(|r| r.id != submission.applicant_id)
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
}

#[derive(Clone)]
pub struct AssignmentResolver {
    repo: Arc<dyn WorkflowRepository>,
    tracker: StageInstanceTracker,
}

impl AssignmentResolver {
    pub fn new(repo: Arc<dyn WorkflowRepository>, tracker: StageInstanceTracker) -> Self {
        Self { repo, tracker }
    }

    /// Assign a supervisor.
    ///
    /// Returns `None` when `supervisor_id` already holds the slot. Otherwise
    /// records a `pending` assignment and, while the submission waits for its
    /// supervisor, opens the `supervisor_review` stage.
    pub async fn assign_supervisor(
        &self,
        submission: &Submission,
        supervisor_id: &UserId,
        assigner_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, WorkflowError> {
        self.assign(submission, ReviewerKind::Supervisor, supervisor_id, assigner_id, now)
            .await
    }

    /// Assign a specific evaluator. Same contract as `assign_supervisor`.
    pub async fn assign_evaluator(
        &self,
        submission: &Submission,
        evaluator_id: &UserId,
        assigner_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, WorkflowError> {
        self.assign(submission, ReviewerKind::Evaluator, evaluator_id, assigner_id, now)
            .await
    }

    /// Match an evaluator on category specialization.
    ///
    /// `NoEligibleEvaluator` when nobody qualifies; the submission then waits
    /// for an admin.
    pub async fn auto_assign_evaluator(
        &self,
        submission: &Submission,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, WorkflowError> {
        let candidates = self.repo.reviewers(Role::Evaluator).await?;
        let Some(evaluator) = pick_evaluator(&candidates, submission) else {
            warn!(
                "No {} evaluator available for submission {}",
                submission.category, submission.id
            );
            return Err(WorkflowError::NoEligibleEvaluator {
                category: submission.category,
            });
        };
        info!(
            "Auto-matched evaluator {} to submission {}",
            evaluator.id, submission.id
        );
        self.assign_evaluator(submission, &evaluator.id, &UserId::from(SYSTEM_ASSIGNER), now)
            .await
    }

    async fn assign(
        &self,
        submission: &Submission,
        kind: ReviewerKind,
        reviewer_id: &UserId,
        assigner_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, WorkflowError> {
        let (current, other) = match kind {
            ReviewerKind::Supervisor => (&submission.supervisor_id, &submission.evaluator_id),
            ReviewerKind::Evaluator => (&submission.evaluator_id, &submission.supervisor_id),
        };
        if current.as_ref() == Some(reviewer_id) {
            info!(
                "{} {} already assigned to {}",
                kind.as_str(),
                reviewer_id,
                submission.id
            );
            return Ok(None);
        }

        self.check_eligible(submission, kind, reviewer_id, other.as_ref())
            .await?;

        // Loses with StaleState if anyone wrote the submission since it was read.
        self.repo
            .set_reviewer(submission, kind, reviewer_id, now)
            .await?;

        if let Some(previous) = current {
            let released = self
                .repo
                .update_assignment_status(
                    &submission.id,
                    kind,
                    previous,
                    AssignmentStatus::Rejected,
                    Some(format!("reassigned to {}", reviewer_id)),
                )
                .await;
            if let Err(e) = released {
                warn!(
                    "Failed to release {} {} on {}: {}",
                    kind.as_str(),
                    previous,
                    submission.id,
                    e
                );
            }
        }

        let assignment = Assignment {
            submission_id: submission.id.clone(),
            kind,
            reviewer_id: reviewer_id.clone(),
            assigned_by: assigner_id.clone(),
            status: AssignmentStatus::Pending,
            remarks: None,
            created_at: now,
        };
        self.repo.insert_assignment(&assignment).await?;
        info!(
            "Assigned {} {} to {} (by {})",
            kind.as_str(),
            reviewer_id,
            submission.id,
            assigner_id
        );

        if let Some(stage) = review_stage(submission.status, kind) {
            if let Err(e) = self
                .tracker
                .ensure_open(&submission.id, stage, reviewer_id, now)
                .await
            {
                warn!(
                    "Failed to open {} stage for {}: {}",
                    stage, submission.id, e
                );
            }
        }

        Ok(Some(assignment))
    }

    async fn check_eligible(
        &self,
        submission: &Submission,
        kind: ReviewerKind,
        reviewer_id: &UserId,
        other_reviewer: Option<&UserId>,
    ) -> Result<(), WorkflowError> {
        if submission.status == SubmissionStatus::Draft {
            return Err(WorkflowError::validation(
                "reviewers cannot be assigned to a draft",
            ));
        }
        if submission.status.is_terminal() {
            return Err(WorkflowError::validation(format!(
                "reviewers cannot be assigned once a submission is {}",
                submission.status
            )));
        }
        if reviewer_id == &submission.applicant_id {
            return Err(WorkflowError::validation(
                "applicants cannot review their own submission",
            ));
        }
        if other_reviewer == Some(reviewer_id) {
            return Err(WorkflowError::validation(
                "the evaluator must differ from the supervisor",
            ));
        }

        let reviewer = self
            .repo
            .get_reviewer(reviewer_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("reviewer {}", reviewer_id)))?;
        if reviewer.role != kind.role() {
            return Err(WorkflowError::validation(format!(
                "{} is registered as {}, not {}",
                reviewer_id,
                reviewer.role,
                kind.role()
            )));
        }
        Ok(())
    }
}

/// The stage a freshly assigned reviewer starts on, if the submission is
/// waiting for them.
fn review_stage(status: SubmissionStatus, kind: ReviewerKind) -> Option<StageName> {
    match (status, kind) {
        (SubmissionStatus::WaitingSupervisor, ReviewerKind::Supervisor) => {
            Some(StageName::SupervisorReview)
        }
        (SubmissionStatus::WaitingEvaluation, ReviewerKind::Evaluator) => {
            Some(StageName::Evaluation)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::test_support::{draft, reviewer, t0};
    use ipflow_core::{Category, SlaPolicies, SubmissionId};
    use proptest::prelude::*;

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        resolver: AssignmentResolver,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let tracker = StageInstanceTracker::new(repo.clone(), SlaPolicies::default());
        Fixture {
            resolver: AssignmentResolver::new(repo.clone(), tracker),
            repo,
        }
    }

    async fn stored(repo: &InMemoryRepository, status: SubmissionStatus) -> Submission {
        let mut submission = draft("s1");
        submission.status = status;
        repo.insert_submission(&submission).await.unwrap();
        submission
    }

    async fn reload(repo: &InMemoryRepository) -> Submission {
        repo.get_submission(&SubmissionId::from("s1"))
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_pick_evaluator_prefers_earliest_specialist() {
        let mut submission = draft("s1");
        submission.supervisor_id = Some(UserId::from("e0"));
        let candidates = vec![
            reviewer("e0", Role::Evaluator, Some(Category::Patent), 0),
            reviewer("e3", Role::Evaluator, Some(Category::Patent), 20),
            reviewer("e2", Role::Evaluator, Some(Category::Patent), 10),
            reviewer("e1", Role::Evaluator, Some(Category::Patent), 10),
            reviewer("c1", Role::Evaluator, Some(Category::Copyright), 0),
        ];
        let picked = pick_evaluator(&candidates, &submission).unwrap();
        assert_eq!(picked.id, UserId::from("e1"));
    }

    #[test]
    fn test_pick_evaluator_none_without_specialist() {
        let submission = draft("s1");
        let candidates = vec![
            reviewer("e1", Role::Evaluator, None, 0),
            reviewer("e2", Role::Evaluator, Some(Category::Trademark), 0),
        ];
        assert!(pick_evaluator(&candidates, &submission).is_none());
    }

    fn arb_candidates() -> impl Strategy<Value = Vec<Reviewer>> {
        proptest::collection::vec((0u8..6, 0usize..6, 0i64..5), 0..12).prop_map(|specs| {
            specs
                .into_iter()
                .map(|(id, category, minutes)| {
                    reviewer(
                        &format!("u{}", id),
                        Role::Evaluator,
                        Some(Category::ALL[category]),
                        minutes,
                    )
                })
                .collect()
        })
    }

    proptest! {
        /// Property: auto-assignment never picks the supervisor.
        #[test]
        fn never_picks_supervisor(candidates in arb_candidates(), supervisor in 0u8..6) {
            let mut submission = draft("s1");
            submission.supervisor_id = Some(UserId::from(format!("u{}", supervisor)));
            if let Some(picked) = pick_evaluator(&candidates, &submission) {
                prop_assert_ne!(Some(&picked.id), submission.supervisor_id.as_ref());
                prop_assert_eq!(picked.category_specialization, Some(submission.category));
            }
        }
    }

    #[tokio::test]
    async fn test_reassigning_same_supervisor_is_idempotent() {
        let f = fixture();
        f.repo
            .upsert_reviewer(&reviewer("sup-1", Role::Supervisor, None, 0))
            .await
            .unwrap();
        let submission = stored(&f.repo, SubmissionStatus::WaitingSupervisor).await;

        let first = f
            .resolver
            .assign_supervisor(&submission, &UserId::from("sup-1"), &UserId::from("admin-1"), t0())
            .await
            .unwrap();
        assert!(first.is_some());

        let current = reload(&f.repo).await;
        let second = f
            .resolver
            .assign_supervisor(&current, &UserId::from("sup-1"), &UserId::from("admin-1"), t0())
            .await
            .unwrap();
        assert!(second.is_none());

        assert_eq!(f.repo.assignments(&submission.id).await.unwrap().len(), 1);
        let open: Vec<_> = f
            .repo
            .stage_instances(&submission.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.is_open() && i.stage == StageName::SupervisorReview)
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].assigned_user_id, Some(UserId::from("sup-1")));
    }

    #[tokio::test]
    async fn test_reassignment_releases_previous_supervisor() {
        let f = fixture();
        for id in ["sup-1", "sup-2"] {
            f.repo
                .upsert_reviewer(&reviewer(id, Role::Supervisor, None, 0))
                .await
                .unwrap();
        }
        let submission = stored(&f.repo, SubmissionStatus::WaitingSupervisor).await;
        f.resolver
            .assign_supervisor(&submission, &UserId::from("sup-1"), &UserId::from("admin-1"), t0())
            .await
            .unwrap();
        let current = reload(&f.repo).await;
        f.resolver
            .assign_supervisor(&current, &UserId::from("sup-2"), &UserId::from("admin-1"), t0())
            .await
            .unwrap();

        let assignments = f.repo.assignments(&submission.id).await.unwrap();
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].status, AssignmentStatus::Rejected);
        assert_eq!(assignments[1].status, AssignmentStatus::Pending);
        assert_eq!(
            reload(&f.repo).await.supervisor_id,
            Some(UserId::from("sup-2"))
        );
    }

    #[tokio::test]
    async fn test_evaluator_cannot_be_supervisor() {
        let f = fixture();
        f.repo
            .upsert_reviewer(&reviewer("dual", Role::Evaluator, Some(Category::Patent), 0))
            .await
            .unwrap();
        let mut submission = draft("s1");
        submission.status = SubmissionStatus::WaitingEvaluation;
        submission.supervisor_id = Some(UserId::from("dual"));
        f.repo.insert_submission(&submission).await.unwrap();

        let err = f
            .resolver
            .assign_evaluator(&submission, &UserId::from("dual"), &UserId::from("admin-1"), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let err = f
            .resolver
            .auto_assign_evaluator(&submission, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NoEligibleEvaluator { .. }));
    }

    #[tokio::test]
    async fn test_auto_assign_opens_evaluation_stage() {
        let f = fixture();
        f.repo
            .upsert_reviewer(&reviewer("E1", Role::Evaluator, Some(Category::Patent), 0))
            .await
            .unwrap();
        let submission = stored(&f.repo, SubmissionStatus::WaitingEvaluation).await;

        let assignment = f
            .resolver
            .auto_assign_evaluator(&submission, t0())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assignment.reviewer_id, UserId::from("E1"));
        assert_eq!(assignment.assigned_by, UserId::from(SYSTEM_ASSIGNER));
        assert_eq!(reload(&f.repo).await.evaluator_id, Some(UserId::from("E1")));

        let latest = f
            .repo
            .latest_open_stage_instance(&submission.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.stage, StageName::Evaluation);
    }

    #[tokio::test]
    async fn test_unregistered_or_wrong_role_is_rejected() {
        let f = fixture();
        f.repo
            .upsert_reviewer(&reviewer("eval-1", Role::Evaluator, None, 0))
            .await
            .unwrap();
        let submission = stored(&f.repo, SubmissionStatus::WaitingSupervisor).await;

        let err = f
            .resolver
            .assign_supervisor(&submission, &UserId::from("ghost"), &UserId::from("admin-1"), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));

        let err = f
            .resolver
            .assign_supervisor(&submission, &UserId::from("eval-1"), &UserId::from("admin-1"), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_draft_cannot_be_assigned() {
        let f = fixture();
        f.repo
            .upsert_reviewer(&reviewer("sup-1", Role::Supervisor, None, 0))
            .await
            .unwrap();
        let submission = stored(&f.repo, SubmissionStatus::Draft).await;
        let err = f
            .resolver
            .assign_supervisor(&submission, &UserId::from("sup-1"), &UserId::from("admin-1"), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }
}
