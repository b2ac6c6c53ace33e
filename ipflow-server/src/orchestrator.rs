//! Workflow orchestrator.
//!
//! The orchestrator is the boundary between the pure transition engine and
//! the impure world. For each request it:
//!
//! 1. Loads the submission and checks the caller may act on it
//! 2. Asks the engine for the new status and intents
//! 3. Commits the status change together with the critical intents (history
//!    entry, evaluation) as one compare-and-swap write
//! 4. Executes the remaining intents in order
//!
//! Step 3 either fully succeeds or leaves nothing behind. Failures in step 4
//! (notification, SLA bookkeeping, auto-assignment) are logged, reported as
//! warnings and never undo the transition.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use ipflow_core::sla::{self, CloseStatus, SweepAction};
use ipflow_core::state_machine::transition::{transition, TransitionInput, TransitionResult};
use ipflow_core::{
    Action, Actor, Assignment, Evaluation, Intent, LogLevel, NewSubmission, Notification,
    NotificationKind, ProcessTrackingEntry, Reviewer, Role, SlaPolicies, SlaSnapshot,
    StageInstance, StageInstanceStatus, Submission, SubmissionId, SubmissionStatus, UserId,
    WorkflowError,
};

use crate::assignment::AssignmentResolver;
use crate::clock::Clock;
use crate::notifier::Notifier;
use crate::repository::{TransitionCommit, WorkflowRepository};
use crate::sweeper::SweepSummary;
use crate::tracker::StageInstanceTracker;

/// What the caller learns about an accepted transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub submission_id: SubmissionId,
    pub status: SubmissionStatus,
    pub stage_label: String,
    pub supervisor_id: Option<UserId>,
    pub evaluator_id: Option<UserId>,
    /// Waiting on a reviewer slot that nobody fills (e.g. no specialist evaluator).
    pub needs_manual_assignment: bool,
    /// Non-critical follow-ups that failed. The transition itself stands.
    pub warnings: Vec<String>,
}

pub struct WorkflowOrchestrator {
    repo: Arc<dyn WorkflowRepository>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    tracker: StageInstanceTracker,
    resolver: AssignmentResolver,
}

impl WorkflowOrchestrator {
    pub fn new(
        repo: Arc<dyn WorkflowRepository>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        policies: SlaPolicies,
    ) -> Self {
        let tracker = StageInstanceTracker::new(repo.clone(), policies);
        let resolver = AssignmentResolver::new(repo.clone(), tracker.clone());
        Self {
            repo,
            notifier,
            clock,
            tracker,
            resolver,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn tracker(&self) -> &StageInstanceTracker {
        &self.tracker
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_submission(&self, id: &SubmissionId) -> Result<Submission, WorkflowError> {
        self.repo
            .get_submission(id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("submission {}", id)))
    }

    pub async fn history(
        &self,
        id: &SubmissionId,
    ) -> Result<Vec<ProcessTrackingEntry>, WorkflowError> {
        self.get_submission(id).await?;
        Ok(self.repo.history(id).await?)
    }

    pub async fn evaluations(&self, id: &SubmissionId) -> Result<Vec<Evaluation>, WorkflowError> {
        self.get_submission(id).await?;
        Ok(self.repo.evaluations(id).await?)
    }

    pub async fn assignments(&self, id: &SubmissionId) -> Result<Vec<Assignment>, WorkflowError> {
        self.get_submission(id).await?;
        Ok(self.repo.assignments(id).await?)
    }

    pub async fn stage_instances(
        &self,
        id: &SubmissionId,
    ) -> Result<Vec<StageInstance>, WorkflowError> {
        self.get_submission(id).await?;
        Ok(self.repo.stage_instances(id).await?)
    }

    /// Deadline classification of the submission's latest stage.
    ///
    /// `None` when no stage has ever been opened (e.g. a draft).
    pub async fn get_sla_status(
        &self,
        id: &SubmissionId,
    ) -> Result<Option<SlaSnapshot>, WorkflowError> {
        self.get_submission(id).await?;
        self.tracker.sla_status(id, self.now()).await
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Add or update an entry in the reviewer directory on behalf of an admin.
    pub async fn register_reviewer(
        &self,
        registrar: &Actor,
        reviewer: &Reviewer,
    ) -> Result<(), WorkflowError> {
        self.require_admin(registrar, "register reviewers").await?;
        self.seed_reviewer(reviewer).await
    }

    /// Write a directory entry without an actor check.
    ///
    /// For operators with direct store access (the CLI) and bootstrapping
    /// the first admin; not reachable over HTTP.
    pub async fn seed_reviewer(&self, reviewer: &Reviewer) -> Result<(), WorkflowError> {
        if reviewer.id.as_str().trim().is_empty() {
            return Err(WorkflowError::validation("reviewer id must not be empty"));
        }
        if reviewer.name.trim().is_empty() {
            return Err(WorkflowError::validation("reviewer name must not be empty"));
        }
        if reviewer.role == Role::Applicant {
            return Err(WorkflowError::validation(
                "applicants are not registered as reviewers",
            ));
        }
        self.repo.upsert_reviewer(reviewer).await?;
        info!("Registered {} {}", reviewer.role, reviewer.id);
        Ok(())
    }

    /// Create a draft owned by `applicant`.
    pub async fn create_draft(
        &self,
        applicant: &Actor,
        new: NewSubmission,
    ) -> Result<Submission, WorkflowError> {
        if applicant.role != Role::Applicant {
            return Err(WorkflowError::authorization(
                "only applicants can create submissions",
            ));
        }
        let submission =
            Submission::new_draft(SubmissionId::generate(), applicant.id.clone(), new, self.now())?;
        self.repo.insert_submission(&submission).await?;
        info!(
            "Created draft {} for applicant {}",
            submission.id, applicant.id
        );
        Ok(submission)
    }

    /// Apply `action` on behalf of `actor`.
    pub async fn request_transition(
        &self,
        id: &SubmissionId,
        actor: &Actor,
        action: Action,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let now = self.now();
        let submission = self.get_submission(id).await?;
        self.authorize(&submission, actor).await?;

        let active_stage = self.tracker.active_stage(id).await?;
        let result = transition(&TransitionInput {
            submission: &submission,
            actor,
            action: &action,
            active_stage,
            now,
        })?;

        let committed = self.commit(&submission, &result, now).await?;
        info!(
            "Submission {}: {} -> {} by {} {} ({})",
            id,
            submission.status,
            committed.status,
            actor.role,
            actor.id,
            action.kind()
        );

        let mut run = IntentRun::new(committed);
        for intent in result.intents {
            self.execute_intent(&mut run, actor, intent, now).await;
        }

        // Assignment intents may have moved the record on since the commit.
        let current = match self.repo.get_submission(id).await {
            Ok(Some(current)) => current,
            Ok(None) => run.submission,
            Err(e) => {
                warn!("Failed to reload submission {}: {}", id, e);
                run.submission
            }
        };

        Ok(TransitionOutcome {
            submission_id: current.id.clone(),
            status: current.status,
            stage_label: current.current_stage_label.clone(),
            needs_manual_assignment: current.needs_manual_assignment(),
            supervisor_id: current.supervisor_id,
            evaluator_id: current.evaluator_id,
            warnings: run.warnings,
        })
    }

    /// Admin assignment of a supervisor and/or evaluator.
    ///
    /// Returns the assignments created. Re-assigning the current reviewer
    /// creates nothing.
    pub async fn assign_reviewers(
        &self,
        id: &SubmissionId,
        supervisor_id: Option<&UserId>,
        evaluator_id: Option<&UserId>,
        assigner: &Actor,
    ) -> Result<Vec<Assignment>, WorkflowError> {
        self.require_admin(assigner, "assign reviewers").await?;
        if supervisor_id.is_none() && evaluator_id.is_none() {
            return Err(WorkflowError::validation(
                "name a supervisor, an evaluator or both",
            ));
        }
        if supervisor_id.is_some() && supervisor_id == evaluator_id {
            return Err(WorkflowError::validation(
                "the evaluator must differ from the supervisor",
            ));
        }

        let now = self.now();
        let mut submission = self.get_submission(id).await?;
        let mut created = Vec::new();

        if let Some(supervisor) = supervisor_id {
            if let Some(assignment) = self
                .resolver
                .assign_supervisor(&submission, supervisor, &assigner.id, now)
                .await?
            {
                created.push(assignment);
                submission = self.get_submission(id).await?;
            }
        }
        if let Some(evaluator) = evaluator_id {
            if let Some(assignment) = self
                .resolver
                .assign_evaluator(&submission, evaluator, &assigner.id, now)
                .await?
            {
                created.push(assignment);
            }
        }

        for assignment in &created {
            let notification = assigned_notification(&submission, assignment);
            if let Err(e) = self.notifier.send(&notification).await {
                warn!(
                    "Failed to notify {} of assignment to {}: {}",
                    assignment.reviewer_id, id, e
                );
            }
        }
        Ok(created)
    }

    /// Admin extension of the submission's latest open stage.
    pub async fn extend_stage(
        &self,
        id: &SubmissionId,
        actor: &Actor,
    ) -> Result<StageInstance, WorkflowError> {
        self.require_admin(actor, "extend stage deadlines").await?;
        self.get_submission(id).await?;
        let instance = self.tracker.extend(id, self.now()).await?;
        info!(
            "{} extended {} stage of {} to {}",
            actor.id,
            instance.stage,
            id,
            instance.effective_due()
        );
        Ok(instance)
    }

    /// Mark overdue stages, expire lapsed applicant stages and send reminders.
    ///
    /// Submission statuses are never touched. A failure on one instance is
    /// recorded in the summary and the sweep moves on.
    pub async fn sweep_overdue(&self, now: DateTime<Utc>) -> Result<SweepSummary, WorkflowError> {
        let instances = self.tracker.open_instances().await?;
        let mut summary = SweepSummary {
            scanned: instances.len(),
            ..Default::default()
        };

        for instance in instances {
            if let Err(e) = self.sweep_instance(instance, now, &mut summary).await {
                summary.errors.push(e);
            }
        }

        debug!("Sweep at {} finished: {:?}", now, summary);
        Ok(summary)
    }

    async fn sweep_instance(
        &self,
        mut instance: StageInstance,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<(), String> {
        let policy = self.tracker.policy(instance.stage);
        let Some(action) = sla::sweep_action(&instance, &policy, now) else {
            return Ok(());
        };
        let before = instance.clone();
        let label = format!(
            "{} stage {} of {}",
            instance.stage, instance.id, instance.submission_id
        );

        let kind = match action {
            SweepAction::MarkOverdue => {
                instance.status = StageInstanceStatus::Overdue;
                NotificationKind::StageOverdue
            }
            SweepAction::StillOverdue => NotificationKind::StageOverdue,
            SweepAction::Expire => NotificationKind::StageExpired,
        };

        if sla::should_notify(instance.notified_at, now) {
            match self.sweep_recipient(&instance).await {
                Some(recipient) => {
                    let notification = overdue_notification(&instance, recipient, kind, now);
                    match self.notifier.send(&notification).await {
                        Ok(()) => {
                            instance.notified_at = Some(now);
                            summary.notifications_sent += 1;
                        }
                        Err(e) => warn!("Failed to send reminder for {}: {}", label, e),
                    }
                }
                None => debug!("No one to remind about {}", label),
            }
        }

        if action == SweepAction::Expire {
            instance.close(CloseStatus::Expired, now);
        }

        if instance == before {
            return Ok(());
        }
        match self.tracker.save_if_unchanged(&before, &instance).await {
            Ok(()) => {}
            // Extended or closed while we were sweeping; the next sweep sees the new row.
            Err(WorkflowError::Conflict(reason)) => {
                info!("Skipped {}: {}", label, reason);
                return Ok(());
            }
            Err(e) => return Err(format!("{}: {}", label, e)),
        }
        match action {
            SweepAction::MarkOverdue => summary.marked_overdue += 1,
            SweepAction::Expire => {
                summary.expired += 1;
                info!("Expired {}", label);
            }
            SweepAction::StillOverdue => {}
        }
        Ok(())
    }

    /// The assigned user, or the applicant for applicant stages.
    async fn sweep_recipient(&self, instance: &StageInstance) -> Option<UserId> {
        if let Some(user) = &instance.assigned_user_id {
            return Some(user.clone());
        }
        if !instance.stage.is_applicant_stage() {
            return None;
        }
        match self.repo.get_submission(&instance.submission_id).await {
            Ok(submission) => submission.map(|s| s.applicant_id),
            Err(e) => {
                warn!(
                    "Failed to load submission {} for reminder: {}",
                    instance.submission_id, e
                );
                None
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn authorize(&self, submission: &Submission, actor: &Actor) -> Result<(), WorkflowError> {
        let allowed = match actor.role {
            Role::Applicant => actor.id == submission.applicant_id,
            Role::Supervisor => submission.supervisor_id.as_ref() == Some(&actor.id),
            Role::Evaluator => submission.evaluator_id.as_ref() == Some(&actor.id),
            Role::Admin => return self.require_admin(actor, "act on submissions").await,
        };
        if allowed {
            Ok(())
        } else {
            Err(WorkflowError::authorization(format!(
                "{} is not the {} of submission {}",
                actor.id,
                actor.role.display_name().to_lowercase(),
                submission.id
            )))
        }
    }

    /// Admins must be registered as such in the reviewer directory.
    async fn require_admin(&self, actor: &Actor, what: &str) -> Result<(), WorkflowError> {
        let registered = self.repo.get_reviewer(&actor.id).await?;
        match registered {
            Some(r) if actor.role == Role::Admin && r.role == Role::Admin => Ok(()),
            _ => Err(WorkflowError::authorization(format!(
                "only admins can {}",
                what
            ))),
        }
    }

    async fn commit(
        &self,
        submission: &Submission,
        result: &TransitionResult,
        now: DateTime<Utc>,
    ) -> Result<Submission, WorkflowError> {
        let mut audit_entries = Vec::new();
        let mut evaluations = Vec::new();
        for intent in &result.intents {
            match intent {
                Intent::AppendAudit(entry) => audit_entries.push(entry.clone()),
                Intent::RecordEvaluation(evaluation) => evaluations.push(evaluation.clone()),
                _ => {}
            }
        }

        let commit = TransitionCommit {
            submission_id: submission.id.clone(),
            expected_status: submission.status,
            expected_version: submission.version,
            new_status: result.status,
            stage_label: result.stage_label.clone(),
            materials_status: result.materials_status,
            edit: result.edit.clone(),
            audit_entries,
            evaluations,
            committed_at: now,
        };

        self.repo.commit_transition(commit).await.map_err(|e| {
            let err = WorkflowError::from(e);
            if err.is_retryable() {
                info!("Lost transition race on {}: {}", submission.id, err);
            } else {
                error!("Failed to commit transition on {}: {}", submission.id, err);
            }
            err
        })
    }

    async fn execute_intent(
        &self,
        run: &mut IntentRun,
        actor: &Actor,
        intent: Intent,
        now: DateTime<Utc>,
    ) {
        let id = run.submission.id.clone();
        match intent {
            // Already committed with the status change.
            Intent::AppendAudit(_) | Intent::RecordEvaluation(_) => {}

            Intent::CloseStageInstance { close_status } => {
                if let Err(e) = self.tracker.close_latest(&id, close_status, now).await {
                    run.warn(format!("failed to close stage for {}: {}", id, e));
                }
            }

            Intent::OpenStageInstance {
                stage,
                assigned_user_id,
            } => {
                if let Err(e) = self.tracker.create(&id, stage, assigned_user_id, now).await {
                    run.warn(format!("failed to open {} stage for {}: {}", stage, id, e));
                }
            }

            Intent::AssignSupervisor { supervisor_id } => {
                match self
                    .resolver
                    .assign_supervisor(&run.submission, &supervisor_id, &actor.id, now)
                    .await
                {
                    Ok(_) => self.refresh(run).await,
                    Err(e) => run.warn(format!(
                        "failed to assign supervisor {} to {}: {}",
                        supervisor_id, id, e
                    )),
                }
            }

            Intent::AutoAssignEvaluator => {
                match self.resolver.auto_assign_evaluator(&run.submission, now).await {
                    Ok(assignment) => {
                        self.refresh(run).await;
                        if let Some(assignment) = assignment {
                            let notification = assigned_notification(&run.submission, &assignment);
                            self.send(run, notification).await;
                        }
                    }
                    Err(e @ WorkflowError::NoEligibleEvaluator { .. }) => {
                        run.warn(format!("{}; submission {} awaits manual assignment", e, id))
                    }
                    Err(e) => run.warn(format!("failed to auto-assign evaluator to {}: {}", id, e)),
                }
            }

            Intent::UpdateAssignmentStatus {
                kind,
                reviewer_id,
                status,
                remarks,
            } => match self
                .repo
                .update_assignment_status(&id, kind, &reviewer_id, status, remarks)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(
                    "No {} assignment of {} on {} to update",
                    kind.as_str(),
                    reviewer_id,
                    id
                ),
                Err(e) => run.warn(format!(
                    "failed to update {} assignment on {}: {}",
                    kind.as_str(),
                    id,
                    e
                )),
            },

            Intent::Notify(notification) => self.send(run, notification).await,

            Intent::Log { level, message } => match level {
                LogLevel::Info => info!("{}", message),
                LogLevel::Warn => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            },
        }
    }

    async fn send(&self, run: &mut IntentRun, notification: Notification) {
        if let Err(e) = self.notifier.send(&notification).await {
            run.warn(format!(
                "failed to notify {} ({}): {}",
                notification.recipient_id,
                notification.kind.as_str(),
                e
            ));
        }
    }

    async fn refresh(&self, run: &mut IntentRun) {
        match self.repo.get_submission(&run.submission.id).await {
            Ok(Some(current)) => run.submission = current,
            Ok(None) => {}
            Err(e) => warn!("Failed to reload submission {}: {}", run.submission.id, e),
        }
    }
}

/// State threaded through intent execution.
struct IntentRun {
    submission: Submission,
    warnings: Vec<String>,
}

impl IntentRun {
    fn new(submission: Submission) -> Self {
        Self {
            submission,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

fn assigned_notification(submission: &Submission, assignment: &Assignment) -> Notification {
    Notification::new(
        assignment.reviewer_id.clone(),
        NotificationKind::Assigned,
        submission.id.clone(),
        format!("New submission assigned as {}", assignment.kind.as_str()),
        format!(
            "\"{}\" has been assigned to you for {} review.",
            submission.title,
            assignment.kind.as_str()
        ),
    )
}

fn overdue_notification(
    instance: &StageInstance,
    recipient: UserId,
    kind: NotificationKind,
    now: DateTime<Utc>,
) -> Notification {
    let days = sla::days_overdue(instance, now);
    let (title, message) = match kind {
        NotificationKind::StageExpired => (
            format!("{} stage expired", instance.stage.label()),
            format!(
                "The {} stage passed its deadline and grace period and has been closed.",
                instance.stage.label()
            ),
        ),
        _ => (
            format!("{} stage overdue", instance.stage.label()),
            format!(
                "The {} stage is {} day(s) past its deadline.",
                instance.stage.label(),
                days
            ),
        ),
    };
    Notification::new(recipient, kind, instance.submission_id.clone(), title, message).with_payload(
        json!({
            "stage": instance.stage,
            "due_date": instance.effective_due(),
            "days_overdue": days,
        }),
    )
}
