//! Row decoding for the SQLite repository.
//!
//! Closures passed to rusqlite only pull raw column values; conversion into
//! domain types happens here so bad data surfaces as `Corruption` rather than
//! a generic SQL error.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::Row;

use ipflow_core::{
    Assignment, Evaluation, ProcessTrackingEntry, Reviewer, Scores, StageInstance, Submission,
    SubmissionDetails, SubmissionId, UserId,
};

use crate::repository::RepositoryError;

pub(super) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(super) fn from_millis(millis: i64, what: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| RepositoryError::corruption(format!("{} timestamp {}", what, millis)))
}

fn opt_from_millis(
    millis: Option<i64>,
    what: &str,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    millis.map(|m| from_millis(m, what)).transpose()
}

pub(super) fn parse<T: FromStr>(value: &str, what: &str) -> Result<T, RepositoryError> {
    value
        .parse()
        .map_err(|_| RepositoryError::corruption(format!("{} {:?}", what, value)))
}

fn to_u8(value: i64, what: &str) -> Result<u8, RepositoryError> {
    u8::try_from(value).map_err(|_| RepositoryError::corruption(format!("{} {}", what, value)))
}

pub(super) const SUBMISSION_COLUMNS: &str = "id, applicant_id, title, abstract_text, category, \
     details_json, document_count, status, current_stage_label, supervisor_id, evaluator_id, \
     assigned_at, materials_status, version, created_at, updated_at";

pub(super) struct SubmissionRow {
    id: String,
    applicant_id: String,
    title: String,
    abstract_text: String,
    category: String,
    details_json: String,
    document_count: i64,
    status: String,
    current_stage_label: String,
    supervisor_id: Option<String>,
    evaluator_id: Option<String>,
    assigned_at: Option<i64>,
    materials_status: String,
    version: i64,
    created_at: i64,
    updated_at: i64,
}

impl SubmissionRow {
    pub(super) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            applicant_id: row.get(1)?,
            title: row.get(2)?,
            abstract_text: row.get(3)?,
            category: row.get(4)?,
            details_json: row.get(5)?,
            document_count: row.get(6)?,
            status: row.get(7)?,
            current_stage_label: row.get(8)?,
            supervisor_id: row.get(9)?,
            evaluator_id: row.get(10)?,
            assigned_at: row.get(11)?,
            materials_status: row.get(12)?,
            version: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    pub(super) fn into_submission(self) -> Result<Submission, RepositoryError> {
        let details: SubmissionDetails = serde_json::from_str(&self.details_json)
            .map_err(|_| RepositoryError::corruption("submission details JSON"))?;
        Ok(Submission {
            id: SubmissionId(self.id),
            applicant_id: UserId(self.applicant_id),
            title: self.title,
            abstract_text: self.abstract_text,
            category: parse(&self.category, "category")?,
            details,
            document_count: u32::try_from(self.document_count)
                .map_err(|_| RepositoryError::corruption("document count"))?,
            status: parse(&self.status, "submission status")?,
            current_stage_label: self.current_stage_label,
            supervisor_id: self.supervisor_id.map(UserId),
            evaluator_id: self.evaluator_id.map(UserId),
            assigned_at: opt_from_millis(self.assigned_at, "assigned_at")?,
            materials_status: parse(&self.materials_status, "materials status")?,
            version: u64::try_from(self.version)
                .map_err(|_| RepositoryError::corruption("submission version"))?,
            created_at: from_millis(self.created_at, "created_at")?,
            updated_at: from_millis(self.updated_at, "updated_at")?,
        })
    }
}

pub(super) const HISTORY_COLUMNS: &str = "submission_id, stage_label, status, actor_id, \
     actor_name, actor_role, action, description, metadata_json, recorded_at";

pub(super) type HistoryRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
);

pub(super) fn read_history(row: &Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

pub(super) fn history_entry(row: HistoryRow) -> Result<ProcessTrackingEntry, RepositoryError> {
    let (
        submission_id,
        stage_label,
        status,
        actor_id,
        actor_name,
        actor_role,
        action,
        description,
        metadata_json,
        recorded_at,
    ) = row;
    Ok(ProcessTrackingEntry {
        submission_id: SubmissionId(submission_id),
        stage_label,
        status: parse(&status, "history status")?,
        actor_id: UserId(actor_id),
        actor_name,
        actor_role: parse(&actor_role, "actor role")?,
        action,
        description,
        metadata: serde_json::from_str(&metadata_json)
            .map_err(|_| RepositoryError::corruption("history metadata JSON"))?,
        recorded_at: from_millis(recorded_at, "recorded_at")?,
    })
}

pub(super) const EVALUATION_COLUMNS: &str = "submission_id, evaluator_id, innovation, \
     feasibility, market_potential, technical_merit, grade, remarks, decision, created_at";

pub(super) struct EvaluationRow {
    submission_id: String,
    evaluator_id: String,
    scores: [i64; 4],
    grade: String,
    remarks: Option<String>,
    decision: String,
    created_at: i64,
}

impl EvaluationRow {
    pub(super) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            submission_id: row.get(0)?,
            evaluator_id: row.get(1)?,
            scores: [row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?],
            grade: row.get(6)?,
            remarks: row.get(7)?,
            decision: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    pub(super) fn into_evaluation(self) -> Result<Evaluation, RepositoryError> {
        let [innovation, feasibility, market_potential, technical_merit] = self.scores;
        Ok(Evaluation {
            submission_id: SubmissionId(self.submission_id),
            evaluator_id: UserId(self.evaluator_id),
            scores: Scores {
                innovation: to_u8(innovation, "innovation score")?,
                feasibility: to_u8(feasibility, "feasibility score")?,
                market_potential: to_u8(market_potential, "market potential score")?,
                technical_merit: to_u8(technical_merit, "technical merit score")?,
            },
            grade: parse(&self.grade, "grade")?,
            remarks: self.remarks,
            decision: parse(&self.decision, "evaluation decision")?,
            created_at: from_millis(self.created_at, "evaluation created_at")?,
        })
    }
}

pub(super) const ASSIGNMENT_COLUMNS: &str =
    "submission_id, kind, reviewer_id, assigned_by, status, remarks, created_at";

pub(super) type AssignmentRow = (String, String, String, String, String, Option<String>, i64);

pub(super) fn read_assignment(row: &Row<'_>) -> rusqlite::Result<AssignmentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

pub(super) fn assignment(row: AssignmentRow) -> Result<Assignment, RepositoryError> {
    let (submission_id, kind, reviewer_id, assigned_by, status, remarks, created_at) = row;
    Ok(Assignment {
        submission_id: SubmissionId(submission_id),
        kind: parse(&kind, "reviewer kind")?,
        reviewer_id: UserId(reviewer_id),
        assigned_by: UserId(assigned_by),
        status: parse(&status, "assignment status")?,
        remarks,
        created_at: from_millis(created_at, "assignment created_at")?,
    })
}

pub(super) const REVIEWER_COLUMNS: &str = "id, name, role, category_specialization, created_at";

pub(super) type ReviewerRow = (String, String, String, Option<String>, i64);

pub(super) fn read_reviewer(row: &Row<'_>) -> rusqlite::Result<ReviewerRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

pub(super) fn reviewer(row: ReviewerRow) -> Result<Reviewer, RepositoryError> {
    let (id, name, role, specialization, created_at) = row;
    Ok(Reviewer {
        id: UserId(id),
        name,
        role: parse(&role, "role")?,
        category_specialization: specialization
            .map(|c| parse(&c, "category specialization"))
            .transpose()?,
        created_at: from_millis(created_at, "reviewer created_at")?,
    })
}

pub(super) const STAGE_COLUMNS: &str = "id, submission_id, stage, assigned_user_id, created_at, \
     due_at, extended_until, extensions_used, status, closed_at, notified_at";

pub(super) struct StageRow {
    id: i64,
    submission_id: String,
    stage: String,
    assigned_user_id: Option<String>,
    created_at: i64,
    due_at: i64,
    extended_until: Option<i64>,
    extensions_used: i64,
    status: String,
    closed_at: Option<i64>,
    notified_at: Option<i64>,
}

impl StageRow {
    pub(super) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            submission_id: row.get(1)?,
            stage: row.get(2)?,
            assigned_user_id: row.get(3)?,
            created_at: row.get(4)?,
            due_at: row.get(5)?,
            extended_until: row.get(6)?,
            extensions_used: row.get(7)?,
            status: row.get(8)?,
            closed_at: row.get(9)?,
            notified_at: row.get(10)?,
        })
    }

    pub(super) fn into_instance(self) -> Result<StageInstance, RepositoryError> {
        Ok(StageInstance {
            id: self.id,
            submission_id: SubmissionId(self.submission_id),
            stage: parse(&self.stage, "stage")?,
            assigned_user_id: self.assigned_user_id.map(UserId),
            created_at: from_millis(self.created_at, "stage created_at")?,
            due_at: from_millis(self.due_at, "due_at")?,
            extended_until: opt_from_millis(self.extended_until, "extended_until")?,
            extensions_used: u32::try_from(self.extensions_used)
                .map_err(|_| RepositoryError::corruption("extensions used"))?,
            status: parse(&self.status, "stage instance status")?,
            closed_at: opt_from_millis(self.closed_at, "closed_at")?,
            notified_at: opt_from_millis(self.notified_at, "notified_at")?,
        })
    }
}
