//! Actions (the workflow's input events).
//!
//! An action is what an actor asks to do. Whether it is legal depends on the
//! actor's role and the submission's current status; see `transition`.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::state::{SubmissionEdit, UserId};
use crate::evaluation::ScoreSheet;

/// Discriminant of an `Action`, used in the permission table and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Submit,
    Approve,
    RequestRevision,
    Reject,
    Resubmit,
    MarkComplete,
    PrepareLegal,
    RequestMaterials,
    SubmitMaterials,
    RejectMaterials,
    IssueCertificate,
}

impl ActionKind {
    pub const ALL: [ActionKind; 11] = [
        Self::Submit,
        Self::Approve,
        Self::RequestRevision,
        Self::Reject,
        Self::Resubmit,
        Self::MarkComplete,
        Self::PrepareLegal,
        Self::RequestMaterials,
        Self::SubmitMaterials,
        Self::RejectMaterials,
        Self::IssueCertificate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::RequestRevision => "request_revision",
            Self::Reject => "reject",
            Self::Resubmit => "resubmit",
            Self::MarkComplete => "mark_complete",
            Self::PrepareLegal => "prepare_legal",
            Self::RequestMaterials => "request_materials",
            Self::SubmitMaterials => "submit_materials",
            Self::RejectMaterials => "reject_materials",
            Self::IssueCertificate => "issue_certificate",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reviewer decision payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub remarks: Option<String>,
    /// Required for evaluator decisions, forbidden for supervisor decisions.
    #[serde(default)]
    pub score: Option<ScoreSheet>,
}

impl Decision {
    pub fn with_remarks(remarks: impl Into<String>) -> Self {
        Self {
            remarks: Some(remarks.into()),
            score: None,
        }
    }

    /// Remarks with surrounding whitespace removed, `None` if blank.
    pub fn trimmed_remarks(&self) -> Option<&str> {
        self.remarks
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

/// All actions an actor can request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Applicant submits a draft, optionally naming a supervisor.
    Submit {
        #[serde(default)]
        supervisor_id: Option<UserId>,
    },
    Approve(Decision),
    RequestRevision(Decision),
    Reject(Decision),
    Resubmit {
        #[serde(default)]
        edit: SubmissionEdit,
    },
    MarkComplete {
        #[serde(default)]
        remarks: Option<String>,
    },
    PrepareLegal {
        #[serde(default)]
        remarks: Option<String>,
    },
    RequestMaterials,
    SubmitMaterials,
    /// Admin sends submitted materials back to the applicant.
    RejectMaterials {
        #[serde(default)]
        remarks: Option<String>,
    },
    IssueCertificate,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Submit { .. } => ActionKind::Submit,
            Self::Approve(_) => ActionKind::Approve,
            Self::RequestRevision(_) => ActionKind::RequestRevision,
            Self::Reject(_) => ActionKind::Reject,
            Self::Resubmit { .. } => ActionKind::Resubmit,
            Self::MarkComplete { .. } => ActionKind::MarkComplete,
            Self::PrepareLegal { .. } => ActionKind::PrepareLegal,
            Self::RequestMaterials => ActionKind::RequestMaterials,
            Self::SubmitMaterials => ActionKind::SubmitMaterials,
            Self::RejectMaterials { .. } => ActionKind::RejectMaterials,
            Self::IssueCertificate => ActionKind::IssueCertificate,
        }
    }
}
