//! Pure state transition function.
//!
//! `transition` takes the current submission, the acting user and the
//! requested action, and returns the new status plus the intents to execute.
//! It has NO side effects: persistence, notification and assignment are all
//! returned as data.
//!
//! Each group of source states has its own handler module:
//! - `draft`: submission of a draft
//! - `supervisor_review`: supervisor decisions
//! - `evaluation`: evaluator decisions and scoring
//! - `revision`: applicant resubmission after a revision request
//! - `completion`: admin legal/materials/completion steps and certificate issuance

mod completion;
mod draft;
mod evaluation;
mod revision;
mod supervisor_review;

use chrono::{DateTime, Utc};

use super::action::{Action, ActionKind, Decision};
use super::intent::{Intent, Notification, NotificationKind};
use super::state::{
    Actor, MaterialsStatus, ProcessTrackingEntry, Role, StageName, Submission, SubmissionEdit,
    SubmissionStatus, UserId,
};
use crate::error::WorkflowError;

/// Everything the engine needs to decide a transition.
#[derive(Debug, Clone)]
pub struct TransitionInput<'a> {
    pub submission: &'a Submission,
    pub actor: &'a Actor,
    pub action: &'a Action,
    /// Stage of the latest open stage instance, if any.
    pub active_stage: Option<StageName>,
    pub now: DateTime<Utc>,
}

/// Result of an accepted transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    pub status: SubmissionStatus,
    pub stage_label: String,
    /// Set when the action changes the materials request.
    pub materials_status: Option<MaterialsStatus>,
    /// Content changes to apply together with the status (resubmission).
    pub edit: Option<SubmissionEdit>,
    pub intents: Vec<Intent>,
}

impl TransitionResult {
    pub fn new(status: SubmissionStatus, stage_label: impl Into<String>) -> Self {
        Self {
            status,
            stage_label: stage_label.into(),
            materials_status: None,
            edit: None,
            intents: Vec::new(),
        }
    }

    pub(crate) fn push(mut self, intent: Intent) -> Self {
        self.intents.push(intent);
        self
    }

    pub(crate) fn extend(mut self, intents: impl IntoIterator<Item = Intent>) -> Self {
        self.intents.extend(intents);
        self
    }

    /// The single history entry this transition appends.
    pub fn audit_entry(&self) -> Option<&ProcessTrackingEntry> {
        self.intents.iter().find_map(|intent| match intent {
            Intent::AppendAudit(entry) => Some(entry),
            _ => None,
        })
    }
}

/// Role dispatch table: may `role` perform `action` while the submission is `from`?
pub fn can_transition(role: Role, from: SubmissionStatus, action: ActionKind) -> bool {
    use ActionKind as A;
    use SubmissionStatus as S;

    match (role, from, action) {
        (Role::Applicant, S::Draft, A::Submit) => true,
        (Role::Supervisor, S::WaitingSupervisor, A::Approve | A::RequestRevision | A::Reject) => {
            true
        }
        (Role::Evaluator, S::WaitingEvaluation, A::Approve | A::RequestRevision | A::Reject) => {
            true
        }
        (Role::Applicant, S::SupervisorRevision | S::EvaluatorRevision, A::Resubmit) => true,
        (
            Role::Admin,
            S::EvaluatorApproved,
            A::MarkComplete | A::PrepareLegal | A::RequestMaterials | A::RejectMaterials,
        ) => true,
        (
            Role::Admin,
            S::PreparingLegal,
            A::MarkComplete | A::RequestMaterials | A::RejectMaterials,
        ) => true,
        (Role::Applicant, S::EvaluatorApproved | S::PreparingLegal, A::SubmitMaterials) => true,
        (Role::Admin, S::ReadyForFiling, A::IssueCertificate) => true,
        _ => false,
    }
}

/// Pure state transition function.
///
/// Illegal (role, status, action) combinations fail with `InvalidTransition`
/// before any guard runs; guard failures are `Validation` errors. On success
/// the result carries exactly one `AppendAudit` intent whose status equals
/// the new status.
pub fn transition(input: &TransitionInput<'_>) -> Result<TransitionResult, WorkflowError> {
    let from = input.submission.status;
    let role = input.actor.role;
    let kind = input.action.kind();

    if !can_transition(role, from, kind) {
        return Err(WorkflowError::InvalidTransition {
            from,
            role,
            action: kind,
        });
    }

    match from {
        SubmissionStatus::Draft => draft::handle(input),
        SubmissionStatus::WaitingSupervisor => supervisor_review::handle(input),
        SubmissionStatus::WaitingEvaluation => evaluation::handle(input),
        SubmissionStatus::SupervisorRevision | SubmissionStatus::EvaluatorRevision => {
            revision::handle(input)
        }
        SubmissionStatus::EvaluatorApproved
        | SubmissionStatus::PreparingLegal
        | SubmissionStatus::ReadyForFiling => completion::handle(input),
        SubmissionStatus::Submitted
        | SubmissionStatus::SupervisorApproved
        | SubmissionStatus::Rejected => Err(WorkflowError::InvalidTransition {
            from,
            role,
            action: kind,
        }),
    }
}

// =============================================================================
// Helpers shared by the handlers
// =============================================================================

/// Build the history entry for this transition.
pub(crate) fn audit(
    input: &TransitionInput<'_>,
    status: SubmissionStatus,
    stage_label: &str,
    action_code: &str,
    description: impl Into<String>,
    metadata: serde_json::Value,
) -> Intent {
    Intent::AppendAudit(ProcessTrackingEntry {
        submission_id: input.submission.id.clone(),
        stage_label: stage_label.to_string(),
        status,
        actor_id: input.actor.id.clone(),
        actor_name: input.actor.name.clone(),
        actor_role: input.actor.role,
        action: action_code.to_string(),
        description: description.into(),
        metadata,
        recorded_at: input.now,
    })
}

pub(crate) fn notify(
    input: &TransitionInput<'_>,
    recipient: &UserId,
    kind: NotificationKind,
    title: impl Into<String>,
    message: impl Into<String>,
) -> Intent {
    Intent::Notify(Notification::new(
        recipient.clone(),
        kind,
        input.submission.id.clone(),
        title,
        message,
    ))
}

pub(crate) fn notify_applicant(
    input: &TransitionInput<'_>,
    kind: NotificationKind,
    title: impl Into<String>,
    message: impl Into<String>,
) -> Intent {
    notify(input, &input.submission.applicant_id, kind, title, message)
}

/// Non-approve decisions must explain themselves.
pub(crate) fn require_remarks(decision: &Decision, what: &str) -> Result<String, WorkflowError> {
    decision
        .trimmed_remarks()
        .map(str::to_string)
        .ok_or_else(|| WorkflowError::validation(format!("remarks are required to {}", what)))
}

/// Handlers are only reached through `can_transition`, so a mismatch here is a
/// dispatch bug surfaced as an ordinary invalid transition.
pub(crate) fn unexpected(input: &TransitionInput<'_>) -> WorkflowError {
    WorkflowError::InvalidTransition {
        from: input.submission.status,
        role: input.actor.role,
        action: input.action.kind(),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::evaluation::{ScoreSheet, Scores};
    use crate::state_machine::state::fixtures;
    use proptest::prelude::*;

    const ROLES: [Role; 4] = [Role::Applicant, Role::Supervisor, Role::Evaluator, Role::Admin];

    #[test]
    fn test_dispatch_table_terminal_states_are_closed() {
        for role in ROLES {
            for kind in ActionKind::ALL {
                assert!(!can_transition(role, SubmissionStatus::Rejected, kind));
                assert!(!can_transition(role, SubmissionStatus::Submitted, kind));
                assert!(!can_transition(role, SubmissionStatus::SupervisorApproved, kind));
            }
        }
    }

    #[test]
    fn test_wrong_role_is_invalid_transition() {
        let submission = fixtures::in_status(SubmissionStatus::WaitingSupervisor, Some("sup-1"), None);
        let err = run(
            &submission,
            &evaluator(),
            Action::Approve(Decision::default()),
            Some(StageName::SupervisorReview),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
    }

    #[test]
    fn test_rejected_accepts_nothing() {
        let submission = fixtures::in_status(SubmissionStatus::Rejected, Some("sup-1"), None);
        for actor in [applicant(), supervisor(), evaluator(), admin()] {
            let err = run(&submission, &actor, Action::IssueCertificate, None).unwrap_err();
            assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
        }
    }

    fn action_for(kind: ActionKind, remarks: bool, score: bool) -> Action {
        let decision = Decision {
            remarks: remarks.then(|| "Needs work on claims".to_string()),
            score: score.then_some(ScoreSheet {
                scores: Scores {
                    innovation: 7,
                    feasibility: 8,
                    market_potential: 6,
                    technical_merit: 9,
                },
                grade_override: None,
            }),
        };
        match kind {
            ActionKind::Submit => Action::Submit {
                supervisor_id: Some(UserId::from("sup-1")),
            },
            ActionKind::Approve => Action::Approve(decision),
            ActionKind::RequestRevision => Action::RequestRevision(decision),
            ActionKind::Reject => Action::Reject(decision),
            ActionKind::Resubmit => Action::Resubmit {
                edit: SubmissionEdit {
                    documents_added: 1,
                    ..Default::default()
                },
            },
            ActionKind::MarkComplete => Action::MarkComplete { remarks: None },
            ActionKind::PrepareLegal => Action::PrepareLegal { remarks: None },
            ActionKind::RequestMaterials => Action::RequestMaterials,
            ActionKind::SubmitMaterials => Action::SubmitMaterials,
            ActionKind::RejectMaterials => Action::RejectMaterials {
                remarks: remarks.then(|| "Slides are missing".to_string()),
            },
            ActionKind::IssueCertificate => Action::IssueCertificate,
        }
    }

    fn arb_materials() -> impl Strategy<Value = MaterialsStatus> {
        prop_oneof![
            Just(MaterialsStatus::NotRequested),
            Just(MaterialsStatus::Requested),
            Just(MaterialsStatus::Submitted),
            Just(MaterialsStatus::Rejected),
        ]
    }

    proptest! {
        #[test]
        fn accepted_transitions_append_exactly_one_matching_audit_entry(
            status_idx in 0usize..11,
            role_idx in 0usize..4,
            kind_idx in 0usize..11,
            remarks in any::<bool>(),
            score in any::<bool>(),
            materials in arb_materials(),
            stage_idx in proptest::option::of(0usize..5),
        ) {
            let status = SubmissionStatus::ALL[status_idx];
            let role = ROLES[role_idx];
            let kind = ActionKind::ALL[kind_idx];
            let mut submission = fixtures::in_status(
                status,
                (status != SubmissionStatus::Draft).then_some("sup-1"),
                None,
            );
            submission.materials_status = materials;
            let actor = actor(match role {
                Role::Applicant => "applicant-1",
                Role::Supervisor => "sup-1",
                Role::Evaluator => "eval-1",
                Role::Admin => "admin-1",
            }, role);
            let action = action_for(kind, remarks, score);
            let active = stage_idx.map(|i| StageName::ALL[i]);

            match run(&submission, &actor, action, active) {
                Ok(result) => {
                    prop_assert!(can_transition(role, status, kind));
                    prop_assert!(SubmissionStatus::ALL.contains(&result.status));
                    let audits = count(&result, |i| matches!(i, Intent::AppendAudit(_)));
                    prop_assert_eq!(audits, 1);
                    let entry = result.audit_entry().unwrap();
                    prop_assert_eq!(entry.status, result.status);
                    prop_assert_eq!(&entry.stage_label, &result.stage_label);
                }
                Err(WorkflowError::InvalidTransition { .. }) => {
                    prop_assert!(!can_transition(role, status, kind));
                }
                Err(err) => {
                    prop_assert!(can_transition(role, status, kind));
                    prop_assert!(matches!(err, WorkflowError::Validation(_)), "{:?}", err);
                }
            }
        }

        #[test]
        fn blank_remarks_never_pass_non_approve_decisions(
            blank in "[ \t\n]{0,5}",
            reviewer_is_supervisor in any::<bool>(),
            reject in any::<bool>(),
        ) {
            let (status, actor) = if reviewer_is_supervisor {
                (SubmissionStatus::WaitingSupervisor, supervisor())
            } else {
                (SubmissionStatus::WaitingEvaluation, evaluator())
            };
            let submission = fixtures::in_status(status, Some("sup-1"), Some("eval-1"));
            let decision = Decision {
                remarks: Some(blank),
                score: (!reviewer_is_supervisor).then_some(ScoreSheet {
                    scores: Scores { innovation: 5, feasibility: 5, market_potential: 5, technical_merit: 5 },
                    grade_override: None,
                }),
            };
            let action = if reject { Action::Reject(decision) } else { Action::RequestRevision(decision) };
            let err = run(&submission, &actor, action, None).unwrap_err();
            prop_assert!(matches!(err, WorkflowError::Validation(_)));
        }
    }
}
