//! State types for the submission workflow.
//!
//! Following the principle of "make illegal states unrepresentable", every
//! status, role, category and stage is a closed enum. Strings only appear at
//! the storage and wire boundaries, via `as_str()` / `FromStr`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkflowError;

/// Returned when a stored or wire string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Newtype for submission ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub String);

impl SubmissionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SubmissionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubmissionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype for user ID (applicants, reviewers and admins share one namespace).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Workflow status of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Draft,
    Submitted,
    WaitingSupervisor,
    SupervisorRevision,
    SupervisorApproved,
    WaitingEvaluation,
    EvaluatorRevision,
    EvaluatorApproved,
    PreparingLegal,
    ReadyForFiling,
    Rejected,
}

impl SubmissionStatus {
    pub const ALL: [SubmissionStatus; 11] = [
        Self::Draft,
        Self::Submitted,
        Self::WaitingSupervisor,
        Self::SupervisorRevision,
        Self::SupervisorApproved,
        Self::WaitingEvaluation,
        Self::EvaluatorRevision,
        Self::EvaluatorApproved,
        Self::PreparingLegal,
        Self::ReadyForFiling,
        Self::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::WaitingSupervisor => "waiting_supervisor",
            Self::SupervisorRevision => "supervisor_revision",
            Self::SupervisorApproved => "supervisor_approved",
            Self::WaitingEvaluation => "waiting_evaluation",
            Self::EvaluatorRevision => "evaluator_revision",
            Self::EvaluatorApproved => "evaluator_approved",
            Self::PreparingLegal => "preparing_legal",
            Self::ReadyForFiling => "ready_for_filing",
            Self::Rejected => "rejected",
        }
    }

    /// Human-readable label for dashboards.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::Submitted => "Submitted",
            Self::WaitingSupervisor => "Waiting for Supervisor",
            Self::SupervisorRevision => "Revision Requested - Supervisor",
            Self::SupervisorApproved => "Approved by Supervisor",
            Self::WaitingEvaluation => "Waiting for Evaluation",
            Self::EvaluatorRevision => "Revision Requested - Evaluator",
            Self::EvaluatorApproved => "Approved by Evaluator",
            Self::PreparingLegal => "Preparing for Legal Filing",
            Self::ReadyForFiling => "Ready for IPO Philippines Filing",
            Self::Rejected => "Rejected",
        }
    }

    /// Index into the five-step progress display (submitted .. ready for filing).
    ///
    /// `None` for drafts and rejected submissions, which are off the track.
    pub fn progress_step(&self) -> Option<u8> {
        match self {
            Self::Draft | Self::Rejected => None,
            Self::Submitted => Some(0),
            Self::WaitingSupervisor | Self::SupervisorRevision => Some(1),
            Self::SupervisorApproved | Self::WaitingEvaluation | Self::EvaluatorRevision => {
                Some(2)
            }
            Self::EvaluatorApproved | Self::PreparingLegal => Some(3),
            Self::ReadyForFiling => Some(4),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ReadyForFiling | Self::Rejected)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "submission status",
                value: s.to_string(),
            })
    }
}

/// Role an actor plays in the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Applicant,
    Supervisor,
    Evaluator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applicant => "applicant",
            Self::Supervisor => "supervisor",
            Self::Evaluator => "evaluator",
            Self::Admin => "admin",
        }
    }

    /// Capitalized name used in audit entries.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Applicant => "Applicant",
            Self::Supervisor => "Supervisor",
            Self::Evaluator => "Evaluator",
            Self::Admin => "Admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applicant" => Ok(Self::Applicant),
            "supervisor" => Ok(Self::Supervisor),
            "evaluator" => Ok(Self::Evaluator),
            "admin" => Ok(Self::Admin),
            other => Err(UnknownVariant {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// IP category of a disclosure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Patent,
    Copyright,
    Trademark,
    Design,
    UtilityModel,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Self::Patent,
        Self::Copyright,
        Self::Trademark,
        Self::Design,
        Self::UtilityModel,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patent => "patent",
            Self::Copyright => "copyright",
            Self::Trademark => "trademark",
            Self::Design => "design",
            Self::UtilityModel => "utility_model",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "category",
                value: s.to_string(),
            })
    }
}

/// Status of the academic presentation materials request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialsStatus {
    #[default]
    NotRequested,
    Requested,
    Submitted,
    Rejected,
}

impl MaterialsStatus {
    /// Requested or sent back, and not yet answered by the applicant.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Requested | Self::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequested => "not_requested",
            Self::Requested => "requested",
            Self::Submitted => "submitted",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for MaterialsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaterialsStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_requested" => Ok(Self::NotRequested),
            "requested" => Ok(Self::Requested),
            "submitted" => Ok(Self::Submitted),
            "rejected" => Ok(Self::Rejected),
            other => Err(UnknownVariant {
                kind: "materials status",
                value: other.to_string(),
            }),
        }
    }
}

/// A workflow stage whose turnaround is tracked against an SLA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    SupervisorReview,
    Evaluation,
    RevisionRequested,
    AcademicPresentationMaterials,
    CertificateIssued,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        Self::SupervisorReview,
        Self::Evaluation,
        Self::RevisionRequested,
        Self::AcademicPresentationMaterials,
        Self::CertificateIssued,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SupervisorReview => "supervisor_review",
            Self::Evaluation => "evaluation",
            Self::RevisionRequested => "revision_requested",
            Self::AcademicPresentationMaterials => "academic_presentation_materials",
            Self::CertificateIssued => "certificate_issued",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::SupervisorReview => "Supervisor Review",
            Self::Evaluation => "Evaluation",
            Self::RevisionRequested => "Revision Requested",
            Self::AcademicPresentationMaterials => "Academic Presentation Materials",
            Self::CertificateIssued => "Certificate Issuance",
        }
    }

    /// Stages where the applicant, not a reviewer, is expected to act.
    ///
    /// Only these can lapse into `EXPIRED` once their grace period runs out.
    pub fn is_applicant_stage(&self) -> bool {
        matches!(
            self,
            Self::RevisionRequested | Self::AcademicPresentationMaterials
        )
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "stage",
                value: s.to_string(),
            })
    }
}

/// Someone acting on a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
        }
    }
}

/// A registered user who can be assigned work (or an admin who assigns it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reviewer {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    /// For evaluators: the category they are auto-matched to.
    pub category_specialization: Option<Category>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventor {
    pub name: String,
    #[serde(default)]
    pub affiliation: String,
    #[serde(default)]
    pub contribution: String,
}

/// Category-specific disclosure fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum CategoryDetails {
    Patent {
        technical_field: String,
        #[serde(default)]
        problem_statement: Option<String>,
        #[serde(default)]
        solution: Option<String>,
        #[serde(default)]
        prior_art: Option<String>,
    },
    UtilityModel {
        technical_field: String,
        #[serde(default)]
        prior_art: Option<String>,
    },
    Copyright {
        work_type: String,
        #[serde(default)]
        date_created: Option<String>,
    },
    Trademark {
        mark_text: String,
        #[serde(default)]
        goods_and_services: Vec<String>,
    },
    Design {
        article: String,
        #[serde(default)]
        design_features: Option<String>,
    },
    Other {
        #[serde(default)]
        notes: Option<String>,
    },
}

impl CategoryDetails {
    pub fn category(&self) -> Category {
        match self {
            Self::Patent { .. } => Category::Patent,
            Self::UtilityModel { .. } => Category::UtilityModel,
            Self::Copyright { .. } => Category::Copyright,
            Self::Trademark { .. } => Category::Trademark,
            Self::Design { .. } => Category::Design,
            Self::Other { .. } => Category::Other,
        }
    }

    fn required_field(&self) -> Option<(&'static str, &str)> {
        match self {
            Self::Patent {
                technical_field, ..
            }
            | Self::UtilityModel {
                technical_field, ..
            } => Some(("technical field", technical_field)),
            Self::Copyright { work_type, .. } => Some(("work type", work_type)),
            Self::Trademark { mark_text, .. } => Some(("mark text", mark_text)),
            Self::Design { article, .. } => Some(("article", article)),
            Self::Other { .. } => None,
        }
    }
}

/// Structured disclosure details, validated at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionDetails {
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub inventors: Vec<Inventor>,
    pub category_details: CategoryDetails,
}

impl SubmissionDetails {
    pub fn validate(&self, category: Category) -> Result<(), WorkflowError> {
        if self.category_details.category() != category {
            return Err(WorkflowError::validation(format!(
                "details are for {} but the submission category is {}",
                self.category_details.category(),
                category
            )));
        }
        if self.description.trim().is_empty() {
            return Err(WorkflowError::validation("description must not be empty"));
        }
        if !self.inventors.iter().any(|i| !i.name.trim().is_empty()) {
            return Err(WorkflowError::validation(
                "at least one inventor with a name is required",
            ));
        }
        if let Some((field, value)) = self.category_details.required_field() {
            if value.trim().is_empty() {
                return Err(WorkflowError::validation(format!(
                    "{} must not be empty for a {} disclosure",
                    field, category
                )));
            }
        }
        Ok(())
    }
}

/// Applicant-supplied content for a new draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubmission {
    pub title: String,
    pub abstract_text: String,
    pub category: Category,
    pub details: SubmissionDetails,
    #[serde(default)]
    pub document_count: u32,
}

/// Changes an applicant makes when resubmitting after a revision request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubmissionEdit {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub details: Option<SubmissionDetails>,
    #[serde(default)]
    pub documents_added: u32,
}

impl SubmissionEdit {
    /// True if applying this edit would change something a reviewer can see.
    pub fn is_material_for(&self, submission: &Submission) -> bool {
        self.documents_added > 0
            || self
                .title
                .as_ref()
                .is_some_and(|t| t.trim() != submission.title.trim())
            || self
                .abstract_text
                .as_ref()
                .is_some_and(|a| a.trim() != submission.abstract_text.trim())
            || self
                .details
                .as_ref()
                .is_some_and(|d| *d != submission.details)
    }

    pub fn validate(&self, category: Category) -> Result<(), WorkflowError> {
        if self.title.as_ref().is_some_and(|t| t.trim().is_empty()) {
            return Err(WorkflowError::validation("title must not be empty"));
        }
        if self
            .abstract_text
            .as_ref()
            .is_some_and(|a| a.trim().is_empty())
        {
            return Err(WorkflowError::validation("abstract must not be empty"));
        }
        if let Some(details) = &self.details {
            details.validate(category)?;
        }
        Ok(())
    }
}

/// A disclosure under review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub applicant_id: UserId,
    pub title: String,
    pub abstract_text: String,
    pub category: Category,
    pub details: SubmissionDetails,
    pub document_count: u32,
    pub status: SubmissionStatus,
    pub current_stage_label: String,
    pub supervisor_id: Option<UserId>,
    pub evaluator_id: Option<UserId>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub materials_status: MaterialsStatus,
    /// Bumped on every committed transition; used for compare-and-swap.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    /// Create a draft owned by `applicant_id`.
    pub fn new_draft(
        id: SubmissionId,
        applicant_id: UserId,
        new: NewSubmission,
        now: DateTime<Utc>,
    ) -> Result<Self, WorkflowError> {
        if new.title.trim().is_empty() {
            return Err(WorkflowError::validation("title must not be empty"));
        }
        new.details.validate(new.category)?;

        Ok(Self {
            id,
            applicant_id,
            title: new.title,
            abstract_text: new.abstract_text,
            category: new.category,
            details: new.details,
            document_count: new.document_count,
            status: SubmissionStatus::Draft,
            current_stage_label: SubmissionStatus::Draft.label().to_string(),
            supervisor_id: None,
            evaluator_id: None,
            assigned_at: None,
            materials_status: MaterialsStatus::NotRequested,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn apply_edit(&mut self, edit: &SubmissionEdit) {
        if let Some(title) = &edit.title {
            self.title = title.clone();
        }
        if let Some(abstract_text) = &edit.abstract_text {
            self.abstract_text = abstract_text.clone();
        }
        if let Some(details) = &edit.details {
            self.details = details.clone();
        }
        self.document_count += edit.documents_added;
    }

    /// The submission is waiting on a reviewer slot nobody fills.
    pub fn needs_manual_assignment(&self) -> bool {
        match self.status {
            SubmissionStatus::WaitingSupervisor => self.supervisor_id.is_none(),
            SubmissionStatus::WaitingEvaluation => self.evaluator_id.is_none(),
            _ => false,
        }
    }

    /// Check the record-level invariants.
    pub fn check_invariants(&self) -> Result<(), WorkflowError> {
        if self.status == SubmissionStatus::Draft
            && (self.supervisor_id.is_some() || self.evaluator_id.is_some())
        {
            return Err(WorkflowError::validation(
                "a draft cannot have reviewers assigned",
            ));
        }
        if let (Some(supervisor), Some(evaluator)) = (&self.supervisor_id, &self.evaluator_id) {
            if supervisor == evaluator {
                return Err(WorkflowError::validation(
                    "the evaluator must differ from the supervisor",
                ));
            }
        }
        Ok(())
    }
}

/// Which reviewer slot an assignment fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerKind {
    Supervisor,
    Evaluator,
}

impl ReviewerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Evaluator => "evaluator",
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Supervisor => Role::Supervisor,
            Self::Evaluator => Role::Evaluator,
        }
    }
}

impl FromStr for ReviewerKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supervisor" => Ok(Self::Supervisor),
            "evaluator" => Ok(Self::Evaluator),
            other => Err(UnknownVariant {
                kind: "reviewer kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Accepted,
    Rejected,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for AssignmentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(UnknownVariant {
                kind: "assignment status",
                value: other.to_string(),
            }),
        }
    }
}

/// Accountability record: who was assigned to a submission, and by whom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub submission_id: SubmissionId,
    pub kind: ReviewerKind,
    pub reviewer_id: UserId,
    pub assigned_by: UserId,
    pub status: AssignmentStatus,
    pub remarks: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only history record. The latest entry for a submission always
/// carries the same status as the materialized `Submission::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTrackingEntry {
    pub submission_id: SubmissionId,
    pub stage_label: String,
    pub status: SubmissionStatus,
    pub actor_id: UserId,
    pub actor_name: String,
    pub actor_role: Role,
    pub action: String,
    pub description: String,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in SubmissionStatus::ALL {
            assert_eq!(status.as_str().parse::<SubmissionStatus>(), Ok(status));
        }
        assert!("approved".parse::<SubmissionStatus>().is_err());
    }

    #[test]
    fn test_status_serde_matches_as_str() {
        for status in SubmissionStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = SubmissionStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![SubmissionStatus::ReadyForFiling, SubmissionStatus::Rejected]
        );
    }

    #[test]
    fn test_new_draft_has_no_reviewers() {
        let submission = draft();
        assert_eq!(submission.status, SubmissionStatus::Draft);
        assert!(submission.supervisor_id.is_none());
        assert!(submission.evaluator_id.is_none());
        assert!(submission.check_invariants().is_ok());
    }

    #[test]
    fn test_new_draft_rejects_mismatched_details() {
        let mut new = new_patent();
        new.category = Category::Trademark;
        let err = Submission::new_draft(
            SubmissionId::from("s"),
            UserId::from("a"),
            new,
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn test_details_require_named_inventor() {
        let mut details = patent_details();
        details.inventors = vec![Inventor {
            name: "  ".to_string(),
            affiliation: String::new(),
            contribution: String::new(),
        }];
        assert!(details.validate(Category::Patent).is_err());
    }

    #[test]
    fn test_details_require_category_field() {
        let mut details = patent_details();
        details.category_details = CategoryDetails::Patent {
            technical_field: " ".to_string(),
            problem_statement: None,
            solution: None,
            prior_art: None,
        };
        let err = details.validate(Category::Patent).unwrap_err();
        assert!(err.to_string().contains("technical field"));
    }

    #[test]
    fn test_category_details_tagged_json() {
        let json = serde_json::json!({
            "category": "trademark",
            "mark_text": "SUNSHED",
            "goods_and_services": ["coatings"]
        });
        let details: CategoryDetails = serde_json::from_value(json).unwrap();
        assert_eq!(details.category(), Category::Trademark);
    }

    #[test]
    fn test_edit_materiality() {
        let submission = draft();
        assert!(!SubmissionEdit::default().is_material_for(&submission));

        let same_title = SubmissionEdit {
            title: Some(submission.title.clone()),
            ..Default::default()
        };
        assert!(!same_title.is_material_for(&submission));

        let new_doc = SubmissionEdit {
            documents_added: 1,
            ..Default::default()
        };
        assert!(new_doc.is_material_for(&submission));
    }

    #[test]
    fn test_invariants_catch_same_supervisor_and_evaluator() {
        let submission = in_status(SubmissionStatus::WaitingEvaluation, Some("u1"), Some("u1"));
        assert!(submission.check_invariants().is_err());
    }

    #[test]
    fn test_needs_manual_assignment() {
        assert!(in_status(SubmissionStatus::WaitingEvaluation, Some("s"), None)
            .needs_manual_assignment());
        assert!(!in_status(SubmissionStatus::WaitingEvaluation, Some("s"), Some("e"))
            .needs_manual_assignment());
        assert!(in_status(SubmissionStatus::WaitingSupervisor, None, None)
            .needs_manual_assignment());
    }
}
