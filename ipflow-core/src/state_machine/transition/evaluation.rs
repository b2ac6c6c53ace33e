//! WaitingEvaluation state transitions.
//!
//! Every evaluator decision records a scored `Evaluation` alongside the
//! history entry, so each review round leaves its own immutable record.

use serde_json::json;

use super::{audit, notify_applicant, require_remarks, unexpected, TransitionInput, TransitionResult};
use crate::error::WorkflowError;
use crate::evaluation::{Evaluation, EvaluationDecision, ScoreSheet};
use crate::sla::CloseStatus;
use crate::state_machine::action::{Action, Decision};
use crate::state_machine::intent::{Intent, NotificationKind};
use crate::state_machine::state::{AssignmentStatus, ReviewerKind, StageName, SubmissionStatus};

pub const APPROVED_LABEL: &str = "Approved by Evaluator - Ready for Legal Filing";
pub const REVISION_LABEL: &str = "Revision Requested by Evaluator";
pub const REJECTED_LABEL: &str = "Rejected by Evaluator";

pub fn handle(input: &TransitionInput<'_>) -> Result<TransitionResult, WorkflowError> {
    let (decision, verdict) = match input.action {
        Action::Approve(decision) => (decision, EvaluationDecision::Approved),
        Action::RequestRevision(decision) => (decision, EvaluationDecision::Revision),
        Action::Reject(decision) => (decision, EvaluationDecision::Rejected),
        _ => return Err(unexpected(input)),
    };

    let sheet = require_score(decision)?;
    let remarks = match verdict {
        EvaluationDecision::Approved => decision.trimmed_remarks().map(str::to_string),
        EvaluationDecision::Revision => Some(require_remarks(decision, "request a revision")?),
        EvaluationDecision::Rejected => Some(require_remarks(decision, "reject a submission")?),
    };

    let evaluation = Evaluation {
        submission_id: input.submission.id.clone(),
        evaluator_id: input.actor.id.clone(),
        scores: sheet.scores,
        grade: sheet.grade(),
        remarks: remarks.clone(),
        decision: verdict,
        created_at: input.now,
    };

    let (status, label, action_code, description, assignment_status) = match verdict {
        EvaluationDecision::Approved => (
            SubmissionStatus::EvaluatorApproved,
            APPROVED_LABEL,
            "evaluator_approve",
            "Evaluator approved the submission",
            AssignmentStatus::Accepted,
        ),
        EvaluationDecision::Revision => (
            SubmissionStatus::EvaluatorRevision,
            REVISION_LABEL,
            "evaluator_revision",
            "Evaluator requested a revision",
            AssignmentStatus::Rejected,
        ),
        EvaluationDecision::Rejected => (
            SubmissionStatus::Rejected,
            REJECTED_LABEL,
            "evaluator_reject",
            "Evaluator rejected the submission",
            AssignmentStatus::Rejected,
        ),
    };

    let metadata = json!({
        "grade": evaluation.grade.as_str(),
        "overall_score": evaluation.overall_percent(),
        "scores": evaluation.scores,
        "remarks": remarks,
    });

    let mut result = TransitionResult::new(status, label).extend([
        Intent::RecordEvaluation(evaluation.clone()),
        audit(input, status, label, action_code, description, metadata),
        Intent::UpdateAssignmentStatus {
            kind: ReviewerKind::Evaluator,
            reviewer_id: input.actor.id.clone(),
            status: assignment_status,
            remarks: remarks.clone(),
        },
        Intent::CloseStageInstance {
            close_status: CloseStatus::Completed,
        },
    ]);

    if verdict == EvaluationDecision::Revision {
        result = result.push(Intent::OpenStageInstance {
            stage: StageName::RevisionRequested,
            assigned_user_id: Some(input.submission.applicant_id.clone()),
        });
    }

    let (kind, title, message) = match verdict {
        EvaluationDecision::Approved => (
            NotificationKind::Approved,
            "Approved by evaluator",
            format!(
                "Your submission passed technical evaluation with grade {}.",
                evaluation.grade
            ),
        ),
        EvaluationDecision::Revision => (
            NotificationKind::RevisionRequested,
            "Revision requested by evaluator",
            format!(
                "The evaluator has requested revisions: {}",
                remarks.as_deref().unwrap_or_default()
            ),
        ),
        EvaluationDecision::Rejected => (
            NotificationKind::Rejected,
            "Submission rejected by evaluator",
            format!(
                "Your submission was rejected after evaluation: {}",
                remarks.as_deref().unwrap_or_default()
            ),
        ),
    };

    Ok(result.push(notify_applicant(input, kind, title, message)))
}

fn require_score(decision: &Decision) -> Result<ScoreSheet, WorkflowError> {
    let sheet = decision
        .score
        .ok_or_else(|| WorkflowError::validation("evaluators must record a score"))?;
    sheet.scores.validate()?;
    Ok(sheet)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::evaluation::{Grade, Scores};
    use crate::state_machine::state::{fixtures, Submission};

    fn waiting() -> Submission {
        fixtures::in_status(SubmissionStatus::WaitingEvaluation, Some("sup-1"), Some("eval-1"))
    }

    fn scored(remarks: Option<&str>) -> Decision {
        Decision {
            remarks: remarks.map(str::to_string),
            score: Some(ScoreSheet {
                scores: Scores {
                    innovation: 9,
                    feasibility: 8,
                    market_potential: 9,
                    technical_merit: 10,
                },
                grade_override: None,
            }),
        }
    }

    fn recorded(result: &TransitionResult) -> &Evaluation {
        result
            .intents
            .iter()
            .find_map(|i| match i {
                Intent::RecordEvaluation(e) => Some(e),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_approve_records_scored_evaluation() {
        let result = run(
            &waiting(),
            &evaluator(),
            Action::Approve(scored(None)),
            Some(StageName::Evaluation),
        )
        .unwrap();

        assert_eq!(result.status, SubmissionStatus::EvaluatorApproved);
        let evaluation = recorded(&result);
        assert_eq!(evaluation.grade, Grade::APlus);
        assert_eq!(evaluation.overall_percent(), 90.0);
        assert_eq!(evaluation.decision, EvaluationDecision::Approved);

        let entry = result.audit_entry().unwrap();
        assert_eq!(entry.action, "evaluator_approve");
        assert_eq!(entry.metadata["grade"], "A+");
    }

    #[test]
    fn test_approve_without_score_fails() {
        let err = run(
            &waiting(),
            &evaluator(),
            Action::Approve(Decision::with_remarks("fine")),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("score"));
    }

    #[test]
    fn test_revision_requires_remarks_and_opens_applicant_stage() {
        let err = run(
            &waiting(),
            &evaluator(),
            Action::RequestRevision(scored(Some(" "))),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let result = run(
            &waiting(),
            &evaluator(),
            Action::RequestRevision(scored(Some("Clarify novelty"))),
            None,
        )
        .unwrap();
        assert_eq!(result.status, SubmissionStatus::EvaluatorRevision);
        assert_eq!(recorded(&result).decision, EvaluationDecision::Revision);
        assert_eq!(
            count(&result, |i| matches!(
                i,
                Intent::OpenStageInstance {
                    stage: StageName::RevisionRequested,
                    ..
                }
            )),
            1
        );
    }

    #[test]
    fn test_reject_is_terminal() {
        let result = run(
            &waiting(),
            &evaluator(),
            Action::Reject(scored(Some("Not novel"))),
            None,
        )
        .unwrap();
        assert_eq!(result.status, SubmissionStatus::Rejected);
        assert!(result.status.is_terminal());
    }

    #[test]
    fn test_out_of_range_score_fails() {
        let mut decision = scored(None);
        if let Some(sheet) = decision.score.as_mut() {
            sheet.scores.innovation = 12;
        }
        let err = run(&waiting(), &evaluator(), Action::Approve(decision), None).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }
}
