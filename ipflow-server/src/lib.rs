pub mod api;
pub mod assignment;
pub mod clock;
pub mod config;
pub mod notifier;
pub mod orchestrator;
pub mod repository;
pub mod sweeper;
pub mod tracker;

pub use assignment::AssignmentResolver;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use notifier::{MemoryNotifier, Notifier, NotifierError, OutboxNotifier, TracingNotifier};
pub use orchestrator::{TransitionOutcome, WorkflowOrchestrator};
pub use repository::{
    InMemoryRepository, RepositoryError, SqliteRepository, TransitionCommit, WorkflowRepository,
};
pub use sweeper::{sweep_loop, SweepSummary};
pub use tracker::StageInstanceTracker;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use ipflow_core::{
        Category, CategoryDetails, Inventor, NewSubmission, Reviewer, Role, Submission,
        SubmissionDetails, SubmissionId, UserId,
    };

    /// Monday 2025-03-03 09:00 UTC.
    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()
    }

    pub fn details() -> SubmissionDetails {
        SubmissionDetails {
            description: "A self-cleaning solar panel coating".to_string(),
            keywords: vec!["solar".to_string()],
            inventors: vec![Inventor {
                name: "Ana Reyes".to_string(),
                affiliation: "College of Engineering".to_string(),
                contribution: "Formulation".to_string(),
            }],
            category_details: CategoryDetails::Patent {
                technical_field: "Materials science".to_string(),
                problem_statement: None,
                solution: None,
                prior_art: None,
            },
        }
    }

    pub fn new_patent() -> NewSubmission {
        NewSubmission {
            title: "Hydrophobic panel coating".to_string(),
            abstract_text: "A coating that sheds dust.".to_string(),
            category: Category::Patent,
            details: details(),
            document_count: 1,
        }
    }

    pub fn draft(id: &str) -> Submission {
        Submission::new_draft(
            SubmissionId::from(id),
            UserId::from("applicant-1"),
            new_patent(),
            t0(),
        )
        .unwrap()
    }

    /// A reviewer registered `minutes` after `t0`.
    pub fn reviewer(id: &str, role: Role, specialization: Option<Category>, minutes: i64) -> Reviewer {
        Reviewer {
            id: UserId::from(id),
            name: format!("Reviewer {}", id),
            role,
            category_specialization: specialization,
            created_at: t0() + Duration::minutes(minutes),
        }
    }
}
