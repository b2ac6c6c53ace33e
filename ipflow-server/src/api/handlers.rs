//! Route handlers. Each one is a thin adapter onto a `WorkflowOrchestrator` method.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use ipflow_core::{
    Action, Actor, Assignment, Category, Evaluation, NewSubmission, ProcessTrackingEntry,
    Reviewer, Role, SlaSnapshot, StageInstance, Submission, SubmissionId, UserId,
};

use super::ApiError;
use crate::orchestrator::{TransitionOutcome, WorkflowOrchestrator};
use crate::sweeper::SweepSummary;

type AppState = State<Arc<WorkflowOrchestrator>>;
type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct CreateDraftRequest {
    pub actor: Actor,
    pub submission: NewSubmission,
}

/// `{"actor": {...}, "action": "approve", "remarks": "..."}`
#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub actor: Actor,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub actor: Actor,
    #[serde(default)]
    pub supervisor_id: Option<UserId>,
    #[serde(default)]
    pub evaluator_id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub actor: Actor,
}

#[derive(Debug, Deserialize)]
pub struct RegisterReviewerRequest {
    pub actor: Actor,
    pub id: UserId,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub category_specialization: Option<Category>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "ipflow"
    }))
}

pub async fn register_reviewer(
    State(orchestrator): AppState,
    Json(request): Json<RegisterReviewerRequest>,
) -> Result<(StatusCode, Json<Reviewer>), ApiError> {
    let reviewer = Reviewer {
        id: request.id,
        name: request.name,
        role: request.role,
        category_specialization: request.category_specialization,
        created_at: orchestrator.now(),
    };
    orchestrator
        .register_reviewer(&request.actor, &reviewer)
        .await?;
    Ok((StatusCode::CREATED, Json(reviewer)))
}

pub async fn create_draft(
    State(orchestrator): AppState,
    Json(request): Json<CreateDraftRequest>,
) -> Result<(StatusCode, Json<Submission>), ApiError> {
    let submission = orchestrator
        .create_draft(&request.actor, request.submission)
        .await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

pub async fn get_submission(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> ApiResult<Submission> {
    Ok(Json(orchestrator.get_submission(&SubmissionId(id)).await?))
}

pub async fn transition(
    State(orchestrator): AppState,
    Path(id): Path<String>,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<TransitionOutcome> {
    let outcome = orchestrator
        .request_transition(&SubmissionId(id), &request.actor, request.action)
        .await?;
    Ok(Json(outcome))
}

pub async fn history(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> ApiResult<Vec<ProcessTrackingEntry>> {
    Ok(Json(orchestrator.history(&SubmissionId(id)).await?))
}

pub async fn evaluations(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> ApiResult<Vec<Evaluation>> {
    Ok(Json(orchestrator.evaluations(&SubmissionId(id)).await?))
}

pub async fn assignments(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> ApiResult<Vec<Assignment>> {
    Ok(Json(orchestrator.assignments(&SubmissionId(id)).await?))
}

pub async fn assign(
    State(orchestrator): AppState,
    Path(id): Path<String>,
    Json(request): Json<AssignRequest>,
) -> ApiResult<Vec<Assignment>> {
    let created = orchestrator
        .assign_reviewers(
            &SubmissionId(id),
            request.supervisor_id.as_ref(),
            request.evaluator_id.as_ref(),
            &request.actor,
        )
        .await?;
    Ok(Json(created))
}

pub async fn stage_instances(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> ApiResult<Vec<StageInstance>> {
    Ok(Json(orchestrator.stage_instances(&SubmissionId(id)).await?))
}

/// `null` when no stage has been opened yet.
pub async fn sla_status(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> ApiResult<Option<SlaSnapshot>> {
    Ok(Json(orchestrator.get_sla_status(&SubmissionId(id)).await?))
}

pub async fn extend_stage(
    State(orchestrator): AppState,
    Path(id): Path<String>,
    Json(request): Json<ExtendRequest>,
) -> ApiResult<StageInstance> {
    let instance = orchestrator
        .extend_stage(&SubmissionId(id), &request.actor)
        .await?;
    Ok(Json(instance))
}

pub async fn sweep(State(orchestrator): AppState) -> ApiResult<SweepSummary> {
    let now = orchestrator.now();
    Ok(Json(orchestrator.sweep_overdue(now).await?))
}
