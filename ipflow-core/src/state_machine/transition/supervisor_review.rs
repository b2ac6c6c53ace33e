//! WaitingSupervisor state transitions.

use serde_json::json;

use super::{
    audit, notify, notify_applicant, require_remarks, unexpected, TransitionInput,
    TransitionResult,
};
use crate::error::WorkflowError;
use crate::sla::CloseStatus;
use crate::state_machine::action::{Action, Decision};
use crate::state_machine::intent::{Intent, NotificationKind};
use crate::state_machine::state::{
    AssignmentStatus, ReviewerKind, StageName, SubmissionStatus,
};

pub const APPROVED_LABEL: &str = "Approved by Supervisor - Waiting for Evaluation";
pub const REVISION_LABEL: &str = "Revision Requested by Supervisor";
pub const REJECTED_LABEL: &str = "Rejected by Supervisor";

/// Handle supervisor decisions.
pub fn handle(input: &TransitionInput<'_>) -> Result<TransitionResult, WorkflowError> {
    match input.action {
        Action::Approve(decision) => approve(input, decision),
        Action::RequestRevision(decision) => request_revision(input, decision),
        Action::Reject(decision) => reject(input, decision),
        _ => Err(unexpected(input)),
    }
}

fn reject_scores(decision: &Decision) -> Result<(), WorkflowError> {
    if decision.score.is_some() {
        return Err(WorkflowError::validation(
            "supervisors do not record evaluation scores",
        ));
    }
    Ok(())
}

fn assignment_update(
    input: &TransitionInput<'_>,
    status: AssignmentStatus,
    remarks: Option<String>,
) -> Intent {
    Intent::UpdateAssignmentStatus {
        kind: ReviewerKind::Supervisor,
        reviewer_id: input.actor.id.clone(),
        status,
        remarks,
    }
}

fn approve(
    input: &TransitionInput<'_>,
    decision: &Decision,
) -> Result<TransitionResult, WorkflowError> {
    reject_scores(decision)?;
    let remarks = decision.trimmed_remarks().map(str::to_string);
    let status = SubmissionStatus::WaitingEvaluation;

    let mut result = TransitionResult::new(status, APPROVED_LABEL).extend([
        audit(
            input,
            status,
            APPROVED_LABEL,
            "supervisor_approve",
            "Supervisor approved the submission",
            json!({ "remarks": remarks }),
        ),
        assignment_update(input, AssignmentStatus::Accepted, remarks.clone()),
        Intent::CloseStageInstance {
            close_status: CloseStatus::Completed,
        },
    ]);

    result = match &input.submission.evaluator_id {
        Some(evaluator) => result.extend([
            Intent::OpenStageInstance {
                stage: StageName::Evaluation,
                assigned_user_id: Some(evaluator.clone()),
            },
            notify(
                input,
                evaluator,
                NotificationKind::Assigned,
                "New submission to evaluate",
                format!(
                    "\"{}\" has been approved by its supervisor and is ready for evaluation.",
                    input.submission.title
                ),
            ),
        ]),
        None => result.push(Intent::AutoAssignEvaluator),
    };

    Ok(result.push(notify_applicant(
        input,
        NotificationKind::Approved,
        "Approved by supervisor",
        match &remarks {
            Some(r) => format!(
                "Your submission has been approved by your supervisor. Remarks: {}",
                r
            ),
            None => "Your submission has been approved by your supervisor.".to_string(),
        },
    )))
}

fn request_revision(
    input: &TransitionInput<'_>,
    decision: &Decision,
) -> Result<TransitionResult, WorkflowError> {
    let remarks = require_remarks(decision, "request a revision")?;
    reject_scores(decision)?;
    let status = SubmissionStatus::SupervisorRevision;

    Ok(TransitionResult::new(status, REVISION_LABEL).extend([
        audit(
            input,
            status,
            REVISION_LABEL,
            "supervisor_revision",
            "Supervisor requested a revision",
            json!({ "remarks": remarks }),
        ),
        assignment_update(input, AssignmentStatus::Rejected, Some(remarks.clone())),
        Intent::CloseStageInstance {
            close_status: CloseStatus::Completed,
        },
        Intent::OpenStageInstance {
            stage: StageName::RevisionRequested,
            assigned_user_id: Some(input.submission.applicant_id.clone()),
        },
        notify_applicant(
            input,
            NotificationKind::RevisionRequested,
            "Revision requested by supervisor",
            format!("Your supervisor has requested revisions: {}", remarks),
        ),
    ]))
}

fn reject(
    input: &TransitionInput<'_>,
    decision: &Decision,
) -> Result<TransitionResult, WorkflowError> {
    let remarks = require_remarks(decision, "reject a submission")?;
    reject_scores(decision)?;
    let status = SubmissionStatus::Rejected;

    Ok(TransitionResult::new(status, REJECTED_LABEL).extend([
        audit(
            input,
            status,
            REJECTED_LABEL,
            "supervisor_reject",
            "Supervisor rejected the submission",
            json!({ "remarks": remarks }),
        ),
        assignment_update(input, AssignmentStatus::Rejected, Some(remarks.clone())),
        Intent::CloseStageInstance {
            close_status: CloseStatus::Completed,
        },
        notify_applicant(
            input,
            NotificationKind::Rejected,
            "Submission rejected by supervisor",
            format!("Your submission was rejected by your supervisor: {}", remarks),
        ),
    ]))
}
