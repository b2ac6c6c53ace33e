//! Post-evaluation transitions: legal preparation, academic presentation
//! materials, completion and certificate issuance.

use serde_json::json;

use super::{audit, notify_applicant, unexpected, TransitionInput, TransitionResult};
use crate::error::WorkflowError;
use crate::sla::CloseStatus;
use crate::state_machine::action::Action;
use crate::state_machine::intent::{Intent, LogLevel, NotificationKind};
use crate::state_machine::state::{MaterialsStatus, StageName, SubmissionStatus};

pub const PREPARING_LEGAL_LABEL: &str = "Preparing for Legal Filing";
pub const MATERIALS_REQUESTED_LABEL: &str = "Academic Presentation Materials Requested";
pub const MATERIALS_SUBMITTED_LABEL: &str = "Academic Presentation Materials Submitted";
pub const MATERIALS_REJECTED_LABEL: &str = "Academic Presentation Materials Rejected";
pub const READY_FOR_FILING_LABEL: &str = "Ready for IPO Philippines Filing";
pub const CERTIFICATE_ISSUED_LABEL: &str = "Certificate Issued";

pub fn handle(input: &TransitionInput<'_>) -> Result<TransitionResult, WorkflowError> {
    match input.action {
        Action::PrepareLegal { remarks } => Ok(prepare_legal(input, remarks.as_deref())),
        Action::RequestMaterials => request_materials(input),
        Action::SubmitMaterials => submit_materials(input),
        Action::RejectMaterials { remarks } => reject_materials(input, remarks.as_deref()),
        Action::MarkComplete { remarks } => mark_complete(input, remarks.as_deref()),
        Action::IssueCertificate => issue_certificate(input),
        _ => Err(unexpected(input)),
    }
}

fn prepare_legal(input: &TransitionInput<'_>, remarks: Option<&str>) -> TransitionResult {
    let status = SubmissionStatus::PreparingLegal;
    TransitionResult::new(status, PREPARING_LEGAL_LABEL).extend([
        audit(
            input,
            status,
            PREPARING_LEGAL_LABEL,
            "admin_prepare_legal",
            "Legal filing preparation started",
            json!({ "remarks": remarks }),
        ),
        notify_applicant(
            input,
            NotificationKind::Approved,
            "Preparing for legal filing",
            "Your submission is being prepared for legal filing.",
        ),
    ])
}

/// Materials are requested without changing the workflow status.
///
/// A request whose stage lapsed without an answer may be repeated.
fn request_materials(input: &TransitionInput<'_>) -> Result<TransitionResult, WorkflowError> {
    let submission = input.submission;
    let awaiting = input.active_stage == Some(StageName::AcademicPresentationMaterials);
    match submission.materials_status {
        MaterialsStatus::NotRequested => {}
        MaterialsStatus::Requested | MaterialsStatus::Rejected if !awaiting => {}
        other => {
            return Err(WorkflowError::validation(format!(
                "academic presentation materials are already {}",
                other
            )))
        }
    }

    let status = submission.status;
    let mut result = TransitionResult::new(status, MATERIALS_REQUESTED_LABEL).extend([
        audit(
            input,
            status,
            MATERIALS_REQUESTED_LABEL,
            "admin_request_materials",
            "Academic presentation materials requested",
            json!({ "previous_materials_status": submission.materials_status }),
        ),
        Intent::OpenStageInstance {
            stage: StageName::AcademicPresentationMaterials,
            assigned_user_id: Some(submission.applicant_id.clone()),
        },
        notify_applicant(
            input,
            NotificationKind::MaterialsRequested,
            "Academic presentation materials requested",
            "Please submit your academic presentation materials before the stage deadline.",
        ),
    ]);
    result.materials_status = Some(MaterialsStatus::Requested);
    Ok(result)
}

fn submit_materials(input: &TransitionInput<'_>) -> Result<TransitionResult, WorkflowError> {
    let submission = input.submission;
    if !submission.materials_status.is_pending() {
        return Err(WorkflowError::validation(format!(
            "no materials request is pending (materials are {})",
            submission.materials_status
        )));
    }

    let status = submission.status;
    let mut result = TransitionResult::new(status, MATERIALS_SUBMITTED_LABEL).extend([
        audit(
            input,
            status,
            MATERIALS_SUBMITTED_LABEL,
            "applicant_submit_materials",
            "Academic presentation materials submitted",
            serde_json::Value::Null,
        ),
        Intent::CloseStageInstance {
            close_status: CloseStatus::Completed,
        },
        Intent::Log {
            level: LogLevel::Info,
            message: format!("materials submitted for {}", submission.id),
        },
    ]);
    result.materials_status = Some(MaterialsStatus::Submitted);
    Ok(result)
}

/// Submitted materials go back to the applicant, who resubmits against a fresh stage.
fn reject_materials(
    input: &TransitionInput<'_>,
    remarks: Option<&str>,
) -> Result<TransitionResult, WorkflowError> {
    let submission = input.submission;
    let reason = remarks.map(str::trim).filter(|r| !r.is_empty()).ok_or_else(|| {
        WorkflowError::validation("a reason is required when rejecting materials")
    })?;
    if submission.materials_status != MaterialsStatus::Submitted {
        return Err(WorkflowError::validation(format!(
            "only submitted materials can be rejected (materials are {})",
            submission.materials_status
        )));
    }

    let status = submission.status;
    let mut result = TransitionResult::new(status, MATERIALS_REJECTED_LABEL).extend([
        audit(
            input,
            status,
            MATERIALS_REJECTED_LABEL,
            "admin_reject_materials",
            "Academic presentation materials rejected",
            json!({ "reason": reason }),
        ),
        Intent::OpenStageInstance {
            stage: StageName::AcademicPresentationMaterials,
            assigned_user_id: Some(submission.applicant_id.clone()),
        },
        notify_applicant(
            input,
            NotificationKind::MaterialsRejected,
            "Academic presentation materials rejected",
            format!("Your materials were not accepted: {}. Please resubmit.", reason),
        ),
    ]);
    result.materials_status = Some(MaterialsStatus::Rejected);
    Ok(result)
}

fn mark_complete(
    input: &TransitionInput<'_>,
    remarks: Option<&str>,
) -> Result<TransitionResult, WorkflowError> {
    let submission = input.submission;
    // An outstanding request blocks completion even after its stage expired.
    if submission.materials_status.is_pending() {
        return Err(WorkflowError::validation(format!(
            "academic presentation materials must be submitted before completion (materials are {})",
            submission.materials_status
        )));
    }

    let status = SubmissionStatus::ReadyForFiling;
    Ok(TransitionResult::new(status, READY_FOR_FILING_LABEL).extend([
        audit(
            input,
            status,
            READY_FOR_FILING_LABEL,
            "admin_mark_complete",
            "Submission marked ready for IPO Philippines filing",
            json!({ "remarks": remarks }),
        ),
        Intent::CloseStageInstance {
            close_status: CloseStatus::Completed,
        },
        Intent::OpenStageInstance {
            stage: StageName::CertificateIssued,
            assigned_user_id: Some(input.actor.id.clone()),
        },
        notify_applicant(
            input,
            NotificationKind::ReadyForFiling,
            "Ready for filing",
            "Your submission is complete and ready for IPO Philippines filing.",
        ),
    ]))
}

/// Issuing the certificate closes the last tracked stage; status stays terminal.
fn issue_certificate(input: &TransitionInput<'_>) -> Result<TransitionResult, WorkflowError> {
    if input.active_stage != Some(StageName::CertificateIssued) {
        return Err(WorkflowError::validation(
            "no certificate issuance is pending for this submission",
        ));
    }

    let status = SubmissionStatus::ReadyForFiling;
    Ok(TransitionResult::new(status, CERTIFICATE_ISSUED_LABEL).extend([
        audit(
            input,
            status,
            CERTIFICATE_ISSUED_LABEL,
            "admin_issue_certificate",
            "Certificate issued",
            serde_json::Value::Null,
        ),
        Intent::CloseStageInstance {
            close_status: CloseStatus::Completed,
        },
        notify_applicant(
            input,
            NotificationKind::CertificateIssued,
            "Certificate issued",
            "Your certificate has been issued.",
        ),
    ]))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::state_machine::state::{fixtures, Submission};

    fn approved(materials: MaterialsStatus) -> Submission {
        let mut s =
            fixtures::in_status(SubmissionStatus::EvaluatorApproved, Some("sup-1"), Some("eval-1"));
        s.materials_status = materials;
        s
    }

    #[test]
    fn test_request_materials_keeps_status() {
        let submission = approved(MaterialsStatus::NotRequested);
        let result = run(&submission, &admin(), Action::RequestMaterials, None).unwrap();

        assert_eq!(result.status, SubmissionStatus::EvaluatorApproved);
        assert_eq!(result.materials_status, Some(MaterialsStatus::Requested));
        assert!(result.intents.iter().any(|i| matches!(
            i,
            Intent::OpenStageInstance {
                stage: StageName::AcademicPresentationMaterials,
                ..
            }
        )));
    }

    #[test]
    fn test_request_materials_twice_fails() {
        let submission = approved(MaterialsStatus::Requested);
        let err = run(
            &submission,
            &admin(),
            Action::RequestMaterials,
            Some(StageName::AcademicPresentationMaterials),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let submission = approved(MaterialsStatus::Submitted);
        assert!(run(&submission, &admin(), Action::RequestMaterials, None).is_err());
    }

    #[test]
    fn test_lapsed_materials_request_can_be_repeated() {
        let submission = approved(MaterialsStatus::Requested);
        let result = run(&submission, &admin(), Action::RequestMaterials, None).unwrap();
        assert_eq!(result.materials_status, Some(MaterialsStatus::Requested));
    }

    #[test]
    fn test_reject_materials_reopens_stage_for_applicant() {
        let submission = approved(MaterialsStatus::Submitted);
        let result = run(
            &submission,
            &admin(),
            Action::RejectMaterials {
                remarks: Some("  Slides are missing ".to_string()),
            },
            None,
        )
        .unwrap();

        assert_eq!(result.status, SubmissionStatus::EvaluatorApproved);
        assert_eq!(result.materials_status, Some(MaterialsStatus::Rejected));
        let entry = result.audit_entry().unwrap();
        assert_eq!(entry.action, "admin_reject_materials");
        assert_eq!(entry.metadata["reason"], "Slides are missing");
        assert!(result.intents.iter().any(|i| matches!(
            i,
            Intent::OpenStageInstance {
                stage: StageName::AcademicPresentationMaterials,
                assigned_user_id: Some(user),
            } if *user == submission.applicant_id
        )));
        assert!(result.intents.iter().any(|i| matches!(
            i,
            Intent::Notify(n) if n.kind == NotificationKind::MaterialsRejected
        )));

        // The applicant can answer a rejection like a request.
        let mut rejected = submission.clone();
        rejected.materials_status = MaterialsStatus::Rejected;
        let result = run(
            &rejected,
            &applicant(),
            Action::SubmitMaterials,
            Some(StageName::AcademicPresentationMaterials),
        )
        .unwrap();
        assert_eq!(result.materials_status, Some(MaterialsStatus::Submitted));
    }

    #[test]
    fn test_reject_materials_needs_reason_and_submission() {
        let submission = approved(MaterialsStatus::Submitted);
        let err = run(
            &submission,
            &admin(),
            Action::RejectMaterials {
                remarks: Some("   ".to_string()),
            },
            None,
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let submission = approved(MaterialsStatus::Requested);
        let err = run(
            &submission,
            &admin(),
            Action::RejectMaterials {
                remarks: Some("Too short".to_string()),
            },
            Some(StageName::AcademicPresentationMaterials),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn test_mark_complete_blocked_after_materials_stage_expired() {
        // The materials stage is closed (expired), so nothing is active.
        for pending in [MaterialsStatus::Requested, MaterialsStatus::Rejected] {
            let submission = approved(pending);
            let err = run(
                &submission,
                &admin(),
                Action::MarkComplete { remarks: None },
                None,
            )
            .unwrap_err();
            assert!(matches!(err, WorkflowError::Validation(_)));
        }
    }

    #[test]
    fn test_submit_materials_requires_request() {
        let submission = approved(MaterialsStatus::NotRequested);
        assert!(run(&submission, &applicant(), Action::SubmitMaterials, None).is_err());

        let submission = approved(MaterialsStatus::Requested);
        let result = run(
            &submission,
            &applicant(),
            Action::SubmitMaterials,
            Some(StageName::AcademicPresentationMaterials),
        )
        .unwrap();
        assert_eq!(result.materials_status, Some(MaterialsStatus::Submitted));
    }

    #[test]
    fn test_mark_complete_gated_on_materials() {
        let submission = approved(MaterialsStatus::Requested);
        let err = run(
            &submission,
            &admin(),
            Action::MarkComplete { remarks: None },
            Some(StageName::AcademicPresentationMaterials),
        )
        .unwrap_err();
        assert!(err.to_string().contains("materials"));

        let submission = approved(MaterialsStatus::NotRequested);
        let result = run(
            &submission,
            &admin(),
            Action::MarkComplete { remarks: None },
            None,
        )
        .unwrap();
        assert_eq!(result.status, SubmissionStatus::ReadyForFiling);
        assert_eq!(result.audit_entry().unwrap().action, "admin_mark_complete");
    }

    #[test]
    fn test_prepare_legal_then_complete() {
        let submission = approved(MaterialsStatus::NotRequested);
        let result = run(
            &submission,
            &admin(),
            Action::PrepareLegal { remarks: None },
            None,
        )
        .unwrap();
        assert_eq!(result.status, SubmissionStatus::PreparingLegal);

        let mut preparing = submission.clone();
        preparing.status = result.status;
        let result = run(
            &preparing,
            &admin(),
            Action::MarkComplete {
                remarks: Some("Filed".to_string()),
            },
            None,
        )
        .unwrap();
        assert_eq!(result.status, SubmissionStatus::ReadyForFiling);
    }

    #[test]
    fn test_issue_certificate_only_once() {
        let mut submission = approved(MaterialsStatus::NotRequested);
        submission.status = SubmissionStatus::ReadyForFiling;

        let result = run(
            &submission,
            &admin(),
            Action::IssueCertificate,
            Some(StageName::CertificateIssued),
        )
        .unwrap();
        assert_eq!(result.status, SubmissionStatus::ReadyForFiling);

        let err = run(&submission, &admin(), Action::IssueCertificate, None).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }
}
