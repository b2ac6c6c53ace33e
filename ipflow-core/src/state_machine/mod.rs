//! Explicit state machine for the submission lifecycle.
//!
//! The design separates:
//! - **State**: What the system knows (`Submission`, `SubmissionStatus`)
//! - **Actions**: What an actor asks for (`Action`)
//! - **Intents**: What to do as a result (`Intent`)
//! - **Transition**: Pure function `(Submission, Actor, Action) -> (Status, Vec<Intent>)`
//!
//! The orchestrator in the server crate executes intents against storage and
//! the notifier.

pub mod action;
pub mod intent;
pub mod state;
pub mod transition;

pub use action::*;
pub use intent::*;
pub use state::*;
pub use transition::*;
