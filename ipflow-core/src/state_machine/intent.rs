//! Intents (side effects as data).
//!
//! A transition returns intents describing what should happen next. The
//! orchestrator executes them: critical intents are committed together with
//! the status change, everything else is best-effort.

use serde::{Deserialize, Serialize};

use super::state::{
    AssignmentStatus, ProcessTrackingEntry, ReviewerKind, StageName, SubmissionId, UserId,
};
use crate::evaluation::Evaluation;
use crate::sla::CloseStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    // =========================================================================
    // Critical (committed atomically with the status change)
    // =========================================================================
    /// Append a history entry.
    AppendAudit(ProcessTrackingEntry),

    /// Store an evaluator's scores and decision.
    RecordEvaluation(Evaluation),

    // =========================================================================
    // SLA bookkeeping
    // =========================================================================
    /// Close the most recent open instance of the submission's active stage.
    CloseStageInstance { close_status: CloseStatus },

    /// Open a new stage instance with a due date from policy.
    OpenStageInstance {
        stage: StageName,
        assigned_user_id: Option<UserId>,
    },

    // =========================================================================
    // Assignment
    // =========================================================================
    AssignSupervisor { supervisor_id: UserId },

    /// Pick an evaluator by category specialization.
    AutoAssignEvaluator,

    UpdateAssignmentStatus {
        kind: ReviewerKind,
        reviewer_id: UserId,
        status: AssignmentStatus,
        remarks: Option<String>,
    },

    // =========================================================================
    // Messaging
    // =========================================================================
    Notify(Notification),

    Log { level: LogLevel, message: String },
}

impl Intent {
    /// True for intents whose failure must abort the transition.
    pub fn is_critical(&self) -> bool {
        matches!(self, Intent::AppendAudit(_) | Intent::RecordEvaluation(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Submitted,
    Assigned,
    Approved,
    RevisionRequested,
    Rejected,
    Resubmitted,
    MaterialsRequested,
    MaterialsSubmitted,
    MaterialsRejected,
    ReadyForFiling,
    CertificateIssued,
    StageOverdue,
    StageExpired,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Assigned => "assigned",
            Self::Approved => "approved",
            Self::RevisionRequested => "revision_requested",
            Self::Rejected => "rejected",
            Self::Resubmitted => "resubmitted",
            Self::MaterialsRequested => "materials_requested",
            Self::MaterialsSubmitted => "materials_submitted",
            Self::MaterialsRejected => "materials_rejected",
            Self::ReadyForFiling => "ready_for_filing",
            Self::CertificateIssued => "certificate_issued",
            Self::StageOverdue => "stage_overdue",
            Self::StageExpired => "stage_expired",
        }
    }
}

/// A message for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub submission_id: SubmissionId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(
        recipient_id: UserId,
        kind: NotificationKind,
        submission_id: SubmissionId,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            recipient_id,
            kind,
            title: title.into(),
            message: message.into(),
            submission_id,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}
