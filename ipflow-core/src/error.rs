//! Error taxonomy for workflow operations.
//!
//! Caller mistakes (`Validation`, `InvalidTransition`, `Authorization`) are
//! surfaced verbatim so a UI can render targeted messages. `StaleState` carries
//! a retry hint. `Persistence` is the only variant that represents a system
//! fault.

use thiserror::Error;

use crate::state_machine::action::ActionKind;
use crate::state_machine::state::{Category, Role, SubmissionId, SubmissionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    /// A guard was not satisfied (missing remarks, missing documents, bad scores...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The action is not legal from the current status for this role.
    #[error("cannot {action} as {role} while submission is {from}")]
    InvalidTransition {
        from: SubmissionStatus,
        role: Role,
        action: ActionKind,
    },

    /// The actor is not the assigned supervisor/evaluator/applicant/admin.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// A uniqueness rule would be broken (e.g. duplicate open stage instance).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Another transition landed between our read and our write.
    #[error(
        "submission {submission} changed since it was read as {observed}; reload and retry"
    )]
    StaleState {
        submission: SubmissionId,
        observed: SubmissionStatus,
    },

    /// Auto-assignment found no evaluator specialized in this category.
    #[error("no eligible evaluator for category {category}")]
    NoEligibleEvaluator { category: Category },

    #[error("not found: {0}")]
    NotFound(String),

    /// A critical write (status, audit entry, evaluation) failed.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl WorkflowError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    /// Errors caused by the request itself rather than by the system.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InvalidTransition { .. }
                | Self::Authorization(_)
                | Self::NotFound(_)
        )
    }

    /// Whether repeating the request against fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleState { .. })
    }
}
