//! Draft state transitions.

use serde_json::json;

use super::{audit, notify, notify_applicant, unexpected, TransitionInput, TransitionResult};
use crate::error::WorkflowError;
use crate::state_machine::action::Action;
use crate::state_machine::intent::{Intent, LogLevel, NotificationKind};
use crate::state_machine::state::SubmissionStatus;

pub const SUBMITTED_LABEL: &str = "Waiting for Supervisor Review";

/// Handle transitions from the Draft state.
///
/// The only way out of a draft is the applicant submitting it. The chosen
/// supervisor, if any, is assigned by the orchestrator after commit.
pub fn handle(input: &TransitionInput<'_>) -> Result<TransitionResult, WorkflowError> {
    let Action::Submit { supervisor_id } = input.action else {
        return Err(unexpected(input));
    };
    let submission = input.submission;

    if submission.document_count == 0 {
        return Err(WorkflowError::validation(
            "at least one document must be uploaded before submitting",
        ));
    }
    if submission.title.trim().is_empty() {
        return Err(WorkflowError::validation("title must not be empty"));
    }
    if submission.abstract_text.trim().is_empty() {
        return Err(WorkflowError::validation("abstract must not be empty"));
    }
    submission.details.validate(submission.category)?;
    if supervisor_id.as_ref() == Some(&submission.applicant_id) {
        return Err(WorkflowError::validation(
            "applicants cannot supervise their own submission",
        ));
    }

    let status = SubmissionStatus::WaitingSupervisor;
    let mut result = TransitionResult::new(status, SUBMITTED_LABEL).push(audit(
        input,
        status,
        SUBMITTED_LABEL,
        "applicant_submit",
        "Submission submitted for supervisor review",
        json!({
            "supervisor_id": supervisor_id,
            "document_count": submission.document_count,
        }),
    ));

    result = match supervisor_id {
        Some(supervisor) => result.extend([
            Intent::AssignSupervisor {
                supervisor_id: supervisor.clone(),
            },
            notify(
                input,
                supervisor,
                NotificationKind::Assigned,
                "New submission to review",
                format!("\"{}\" has been submitted for your review.", submission.title),
            ),
        ]),
        None => result.push(Intent::Log {
            level: LogLevel::Warn,
            message: format!(
                "submission {} was submitted without a supervisor; waiting for admin assignment",
                submission.id
            ),
        }),
    };

    Ok(result.push(notify_applicant(
        input,
        NotificationKind::Submitted,
        "Submission received",
        format!(
            "Your submission \"{}\" has been received and is waiting for supervisor review.",
            submission.title
        ),
    )))
}
