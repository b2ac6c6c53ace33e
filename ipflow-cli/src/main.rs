use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use ipflow_core::{
    Action, Actor, Category, Decision, Grade, NewSubmission, Reviewer, Role, ScoreSheet, Scores,
    SlaPolicies, SubmissionEdit, SubmissionId, UserId,
};
use ipflow_server::{
    Clock, ManualClock, SqliteRepository, SystemClock, TracingNotifier, WorkflowOrchestrator,
};

/// ipflow: operate on the IP disclosure workflow store
#[derive(Parser, Debug)]
#[command(name = "ipflow")]
#[command(about = "Operator tool for the IP disclosure workflow store", long_about = None)]
struct Cli {
    /// SQLite database to operate on
    #[arg(long, env = "IPFLOW_DB", default_value = "ipflow-state.db")]
    db: PathBuf,

    /// Pretend the current time is this RFC 3339 timestamp
    #[arg(long)]
    at: Option<DateTime<Utc>>,

    /// JSON file of stage policies overriding the defaults
    #[arg(long, env = "SLA_POLICY_PATH")]
    sla_policy: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a submission with its assignments and open stages
    Show { id: String },
    /// Print the append-only history of a submission
    History { id: String },
    /// Print the deadline status of a submission's latest stage
    Sla { id: String },
    /// Create a draft from a JSON file describing the submission
    Draft(DraftArgs),
    /// Apply a workflow action on behalf of an actor
    Transition(TransitionArgs),
    /// Assign a supervisor and/or evaluator (admin only)
    Assign(AssignArgs),
    /// Extend the deadline of the latest open stage (admin only)
    Extend {
        id: String,
        /// Admin performing the extension
        #[arg(long = "as")]
        admin: String,
    },
    /// Mark overdue stages, expire lapsed applicant stages and send reminders
    Sweep,
    /// Add or update an entry in the reviewer directory (direct store access, no actor check)
    AddReviewer(AddReviewerArgs),
    /// Count submissions per status
    Summary,
}

#[derive(Args, Debug)]
struct ActorArgs {
    /// Id of the acting user
    #[arg(long = "as", id = "actor_id")]
    actor_id: String,

    /// Role the actor is acting in
    #[arg(long)]
    role: Role,

    /// Display name recorded in history (defaults to the id)
    #[arg(long)]
    name: Option<String>,
}

impl ActorArgs {
    fn actor(&self) -> Actor {
        let name = self.name.clone().unwrap_or_else(|| self.actor_id.clone());
        Actor::new(self.actor_id.as_str(), name, self.role)
    }
}

#[derive(Args, Debug)]
struct DraftArgs {
    /// JSON file with title, abstract_text, category, details and document_count
    file: PathBuf,

    /// Applicant creating the draft
    #[arg(long = "as")]
    applicant: String,

    #[arg(long)]
    name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ActionArg {
    Submit,
    Approve,
    RequestRevision,
    Reject,
    Resubmit,
    PrepareLegal,
    RequestMaterials,
    SubmitMaterials,
    RejectMaterials,
    MarkComplete,
    IssueCertificate,
}

#[derive(Args, Debug)]
struct TransitionArgs {
    id: String,

    #[arg(value_enum)]
    action: ActionArg,

    #[command(flatten)]
    actor: ActorArgs,

    /// Reviewer or admin remarks
    #[arg(long)]
    remarks: Option<String>,

    /// Supervisor to route a submitted draft to
    #[arg(long)]
    supervisor: Option<String>,

    /// Evaluator scores: innovation,feasibility,market_potential,technical_merit
    #[arg(long, value_delimiter = ',', num_args = 4)]
    scores: Option<Vec<u8>>,

    /// Override the grade derived from the scores
    #[arg(long)]
    grade: Option<Grade>,

    /// Documents uploaded with a resubmission
    #[arg(long, default_value_t = 0)]
    documents_added: u32,

    /// New title for a resubmission
    #[arg(long)]
    title: Option<String>,
}

impl TransitionArgs {
    fn to_action(&self) -> Result<Action> {
        let decision = || -> Result<Decision> {
            let score = match &self.scores {
                Some(values) => {
                    let [innovation, feasibility, market_potential, technical_merit] =
                        values[..]
                    else {
                        return Err(anyhow!("--scores takes exactly four values"));
                    };
                    Some(ScoreSheet {
                        scores: Scores {
                            innovation,
                            feasibility,
                            market_potential,
                            technical_merit,
                        },
                        grade_override: self.grade,
                    })
                }
                None if self.grade.is_some() => {
                    return Err(anyhow!("--grade requires --scores"));
                }
                None => None,
            };
            Ok(Decision {
                remarks: self.remarks.clone(),
                score,
            })
        };

        Ok(match self.action {
            ActionArg::Submit => Action::Submit {
                supervisor_id: self.supervisor.as_deref().map(UserId::from),
            },
            ActionArg::Approve => Action::Approve(decision()?),
            ActionArg::RequestRevision => Action::RequestRevision(decision()?),
            ActionArg::Reject => Action::Reject(decision()?),
            ActionArg::Resubmit => Action::Resubmit {
                edit: SubmissionEdit {
                    title: self.title.clone(),
                    documents_added: self.documents_added,
                    ..Default::default()
                },
            },
            ActionArg::PrepareLegal => Action::PrepareLegal {
                remarks: self.remarks.clone(),
            },
            ActionArg::RequestMaterials => Action::RequestMaterials,
            ActionArg::SubmitMaterials => Action::SubmitMaterials,
            ActionArg::RejectMaterials => Action::RejectMaterials {
                remarks: self.remarks.clone(),
            },
            ActionArg::MarkComplete => Action::MarkComplete {
                remarks: self.remarks.clone(),
            },
            ActionArg::IssueCertificate => Action::IssueCertificate,
        })
    }
}

#[derive(Args, Debug)]
struct AssignArgs {
    id: String,

    /// Admin making the assignment
    #[arg(long = "as")]
    admin: String,

    #[arg(long)]
    supervisor: Option<String>,

    #[arg(long)]
    evaluator: Option<String>,
}

#[derive(Args, Debug)]
struct AddReviewerArgs {
    id: String,

    name: String,

    #[arg(long)]
    role: Role,

    /// Category an evaluator is auto-matched to
    #[arg(long)]
    specialization: Option<Category>,
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn admin(id: &str) -> Actor {
    Actor::new(id, id, Role::Admin)
}

fn load_policies(path: Option<&PathBuf>) -> Result<SlaPolicies> {
    let Some(path) = path else {
        return Ok(SlaPolicies::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read SLA policy file {}", path.display()))?;
    SlaPolicies::from_json(&json)
        .with_context(|| format!("Invalid SLA policy file {}", path.display()))
}

async fn run(cli: Cli) -> Result<()> {
    let repo = Arc::new(
        SqliteRepository::new(&cli.db)
            .with_context(|| format!("Failed to open database {}", cli.db.display()))?,
    );
    let clock: Arc<dyn Clock> = match cli.at {
        Some(at) => Arc::new(ManualClock::new(at)),
        None => Arc::new(SystemClock),
    };
    let orchestrator = WorkflowOrchestrator::new(
        repo.clone(),
        Arc::new(TracingNotifier),
        clock,
        load_policies(cli.sla_policy.as_ref())?,
    );

    match cli.command {
        Commands::Show { id } => {
            let id = SubmissionId(id);
            let submission = orchestrator.get_submission(&id).await?;
            let assignments = orchestrator.assignments(&id).await?;
            let stages = orchestrator.stage_instances(&id).await?;
            let evaluations = orchestrator.evaluations(&id).await?;
            print_json(&serde_json::json!({
                "submission": submission,
                "assignments": assignments,
                "stages": stages,
                "evaluations": evaluations,
            }))
        }
        Commands::History { id } => {
            for entry in orchestrator.history(&SubmissionId(id)).await? {
                println!(
                    "{}  {:<22} {:<28} {} ({} {})",
                    entry.recorded_at.format("%Y-%m-%d %H:%M"),
                    entry.status,
                    entry.action,
                    entry.description,
                    entry.actor_role,
                    entry.actor_id
                );
            }
            Ok(())
        }
        Commands::Sla { id } => match orchestrator.get_sla_status(&SubmissionId(id)).await? {
            Some(snapshot) => print_json(&snapshot),
            None => {
                println!("No stage has been opened yet");
                Ok(())
            }
        },
        Commands::Draft(args) => {
            let json = std::fs::read_to_string(&args.file)
                .with_context(|| format!("Failed to read {}", args.file.display()))?;
            let new: NewSubmission =
                serde_json::from_str(&json).context("Failed to parse submission JSON")?;
            let name = args.name.unwrap_or_else(|| args.applicant.clone());
            let applicant = Actor::new(args.applicant.as_str(), name, Role::Applicant);
            let draft = orchestrator.create_draft(&applicant, new).await?;
            println!("{}", draft.id);
            Ok(())
        }
        Commands::Transition(args) => {
            let action = args.to_action()?;
            let outcome = orchestrator
                .request_transition(&SubmissionId(args.id.clone()), &args.actor.actor(), action)
                .await?;
            for warning in &outcome.warnings {
                eprintln!("Warning: {}", warning);
            }
            print_json(&outcome)
        }
        Commands::Assign(args) => {
            let supervisor = args.supervisor.as_deref().map(UserId::from);
            let evaluator = args.evaluator.as_deref().map(UserId::from);
            let created = orchestrator
                .assign_reviewers(
                    &SubmissionId(args.id),
                    supervisor.as_ref(),
                    evaluator.as_ref(),
                    &admin(&args.admin),
                )
                .await?;
            if created.is_empty() {
                eprintln!("Nothing to do: reviewers already assigned");
            }
            print_json(&created)
        }
        Commands::Extend { id, admin: admin_id } => {
            let instance = orchestrator
                .extend_stage(&SubmissionId(id), &admin(&admin_id))
                .await?;
            print_json(&instance)
        }
        Commands::Sweep => {
            let summary = orchestrator.sweep_overdue(orchestrator.now()).await?;
            for error in &summary.errors {
                eprintln!("Error: {}", error);
            }
            print_json(&summary)
        }
        Commands::AddReviewer(args) => {
            let reviewer = Reviewer {
                id: UserId(args.id),
                name: args.name,
                role: args.role,
                category_specialization: args.specialization,
                created_at: orchestrator.now(),
            };
            orchestrator.seed_reviewer(&reviewer).await?;
            print_json(&reviewer)
        }
        Commands::Summary => {
            let counts = repo.status_counts().await?;
            if counts.is_empty() {
                println!("No submissions");
            }
            for (status, count) in counts {
                println!("{:<22} {}", status.to_string(), count);
            }
            Ok(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(args: &[&str]) -> TransitionArgs {
        let mut argv = vec!["ipflow", "transition"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Transition(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_evaluator_decision_with_scores() {
        let args = transition(&[
            "sub-1",
            "approve",
            "--as",
            "E1",
            "--role",
            "evaluator",
            "--scores",
            "8,7,9,6",
            "--grade",
            "B+",
        ]);
        assert_eq!(args.actor.actor().role, Role::Evaluator);
        let Action::Approve(decision) = args.to_action().unwrap() else {
            panic!("expected approve");
        };
        let sheet = decision.score.unwrap();
        assert_eq!(sheet.scores.market_potential, 9);
        assert_eq!(sheet.grade_override, Some(Grade::BPlus));
    }

    #[test]
    fn test_grade_without_scores_is_rejected() {
        let args = transition(&[
            "sub-1", "approve", "--as", "E1", "--role", "evaluator", "--grade", "A",
        ]);
        assert!(args.to_action().is_err());
    }

    #[test]
    fn test_submit_with_supervisor() {
        let args = transition(&[
            "sub-1",
            "submit",
            "--as",
            "applicant-1",
            "--role",
            "applicant",
            "--supervisor",
            "sup-1",
        ]);
        assert_eq!(
            args.to_action().unwrap(),
            Action::Submit {
                supervisor_id: Some(UserId::from("sup-1"))
            }
        );
    }

    #[test]
    fn test_command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_submission_and_actor_ids_are_distinct() {
        let args = transition(&[
            "sub-1",
            "reject-materials",
            "--as",
            "admin-1",
            "--role",
            "admin",
            "--remarks",
            "Slides missing",
        ]);
        assert_eq!(args.id, "sub-1");
        assert_eq!(args.actor.actor().id, UserId::from("admin-1"));
        assert_eq!(
            args.to_action().unwrap(),
            Action::RejectMaterials {
                remarks: Some("Slides missing".to_string())
            }
        );
    }

    #[test]
    fn test_global_time_override() {
        let cli = Cli::try_parse_from([
            "ipflow",
            "--db",
            "/tmp/x.db",
            "--at",
            "2025-03-10T09:00:00Z",
            "sweep",
        ])
        .unwrap();
        assert_eq!(cli.at.unwrap().to_rfc3339(), "2025-03-10T09:00:00+00:00");
    }
}
