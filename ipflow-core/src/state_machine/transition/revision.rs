//! Revision state transitions (SupervisorRevision / EvaluatorRevision).

use serde_json::json;

use super::{audit, notify, unexpected, TransitionInput, TransitionResult};
use crate::error::WorkflowError;
use crate::sla::CloseStatus;
use crate::state_machine::action::Action;
use crate::state_machine::intent::{Intent, LogLevel, NotificationKind};
use crate::state_machine::state::{
    AssignmentStatus, ReviewerKind, StageName, SubmissionStatus, UserId,
};

pub const RESUBMITTED_TO_SUPERVISOR_LABEL: &str = "Resubmitted - Waiting for Supervisor Review";
pub const RESUBMITTED_TO_EVALUATOR_LABEL: &str = "Resubmitted - Waiting for Evaluation";

/// Handle the applicant resubmitting after a revision request.
///
/// The resubmission goes back to whichever reviewer asked for it.
pub fn handle(input: &TransitionInput<'_>) -> Result<TransitionResult, WorkflowError> {
    let Action::Resubmit { edit } = input.action else {
        return Err(unexpected(input));
    };
    let submission = input.submission;

    edit.validate(submission.category)?;
    if !edit.is_material_for(submission) {
        return Err(WorkflowError::validation(
            "a resubmission must change the title, abstract or details, or add a document",
        ));
    }

    let (status, label, kind, stage, reviewer) = match submission.status {
        SubmissionStatus::SupervisorRevision => (
            SubmissionStatus::WaitingSupervisor,
            RESUBMITTED_TO_SUPERVISOR_LABEL,
            ReviewerKind::Supervisor,
            StageName::SupervisorReview,
            submission.supervisor_id.as_ref(),
        ),
        SubmissionStatus::EvaluatorRevision => (
            SubmissionStatus::WaitingEvaluation,
            RESUBMITTED_TO_EVALUATOR_LABEL,
            ReviewerKind::Evaluator,
            StageName::Evaluation,
            submission.evaluator_id.as_ref(),
        ),
        _ => return Err(unexpected(input)),
    };

    let mut result = TransitionResult::new(status, label).extend([
        audit(
            input,
            status,
            label,
            "applicant_resubmit",
            format!("Applicant resubmitted for {} review", kind.as_str()),
            json!({
                "title_changed": edit.title.is_some(),
                "abstract_changed": edit.abstract_text.is_some(),
                "details_changed": edit.details.is_some(),
                "documents_added": edit.documents_added,
            }),
        ),
        Intent::CloseStageInstance {
            close_status: CloseStatus::Completed,
        },
    ]);
    result.edit = Some(edit.clone());

    result = match reviewer {
        Some(reviewer) => result.extend(back_to_reviewer(input, kind, stage, reviewer)),
        None if kind == ReviewerKind::Evaluator => result.push(Intent::AutoAssignEvaluator),
        None => result.push(Intent::Log {
            level: LogLevel::Warn,
            message: format!(
                "submission {} was resubmitted but has no supervisor; waiting for admin assignment",
                submission.id
            ),
        }),
    };

    Ok(result)
}

fn back_to_reviewer(
    input: &TransitionInput<'_>,
    kind: ReviewerKind,
    stage: StageName,
    reviewer: &UserId,
) -> [Intent; 3] {
    [
        Intent::UpdateAssignmentStatus {
            kind,
            reviewer_id: reviewer.clone(),
            status: AssignmentStatus::Pending,
            remarks: None,
        },
        Intent::OpenStageInstance {
            stage,
            assigned_user_id: Some(reviewer.clone()),
        },
        notify(
            input,
            reviewer,
            NotificationKind::Resubmitted,
            "Revised submission ready",
            format!(
                "\"{}\" has been revised and resubmitted for your review.",
                input.submission.title
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::state_machine::state::{fixtures, SubmissionEdit};

    fn resubmit(edit: SubmissionEdit) -> Action {
        Action::Resubmit { edit }
    }

    fn retitled() -> SubmissionEdit {
        SubmissionEdit {
            title: Some("Hydrophobic panel coating, revised".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resubmit_returns_to_supervisor() {
        let submission = fixtures::in_status(SubmissionStatus::SupervisorRevision, Some("sup-1"), None);
        let result = run(
            &submission,
            &applicant(),
            resubmit(retitled()),
            Some(StageName::RevisionRequested),
        )
        .unwrap();

        assert_eq!(result.status, SubmissionStatus::WaitingSupervisor);
        assert_eq!(result.stage_label, RESUBMITTED_TO_SUPERVISOR_LABEL);
        assert_eq!(result.edit, Some(retitled()));
        assert!(result.intents.contains(&Intent::OpenStageInstance {
            stage: StageName::SupervisorReview,
            assigned_user_id: Some(UserId::from("sup-1")),
        }));
    }

    #[test]
    fn test_resubmit_returns_to_evaluator() {
        let submission =
            fixtures::in_status(SubmissionStatus::EvaluatorRevision, Some("sup-1"), Some("eval-1"));
        let result = run(&submission, &applicant(), resubmit(retitled()), None).unwrap();

        assert_eq!(result.status, SubmissionStatus::WaitingEvaluation);
        assert!(result.intents.contains(&Intent::UpdateAssignmentStatus {
            kind: ReviewerKind::Evaluator,
            reviewer_id: UserId::from("eval-1"),
            status: AssignmentStatus::Pending,
            remarks: None,
        }));
    }

    #[test]
    fn test_resubmit_without_evaluator_auto_assigns() {
        let submission = fixtures::in_status(SubmissionStatus::EvaluatorRevision, Some("sup-1"), None);
        let result = run(&submission, &applicant(), resubmit(retitled()), None).unwrap();
        assert!(result.intents.contains(&Intent::AutoAssignEvaluator));
    }

    #[test]
    fn test_unchanged_resubmission_is_rejected() {
        let submission = fixtures::in_status(SubmissionStatus::SupervisorRevision, Some("sup-1"), None);
        let unchanged = SubmissionEdit {
            title: Some(submission.title.clone()),
            ..Default::default()
        };
        let err = run(&submission, &applicant(), resubmit(unchanged), None).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }
}
