pub mod error;
pub mod evaluation;
pub mod sla;
pub mod state_machine;

pub use error::WorkflowError;
pub use evaluation::{Evaluation, EvaluationDecision, Grade, ScoreSheet, Scores};
pub use sla::{SlaPolicies, SlaSnapshot, SlaStatus, StageInstance, StageInstanceStatus, StagePolicy};
pub use state_machine::*;
