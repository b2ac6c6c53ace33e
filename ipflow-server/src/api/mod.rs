//! JSON HTTP API over the workflow orchestrator.
//!
//! Every write carries the acting user in the request body as `actor`; the
//! orchestrator decides whether that actor may do what it asks.

mod handlers;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::error;

use ipflow_core::WorkflowError;

use crate::orchestrator::WorkflowOrchestrator;

pub use handlers::{
    AssignRequest, CreateDraftRequest, ExtendRequest, RegisterReviewerRequest, TransitionRequest,
};

pub fn router(orchestrator: Arc<WorkflowOrchestrator>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/reviewers", post(handlers::register_reviewer))
        .route("/submissions", post(handlers::create_draft))
        .route("/submissions/:id", get(handlers::get_submission))
        .route("/submissions/:id/transitions", post(handlers::transition))
        .route("/submissions/:id/history", get(handlers::history))
        .route("/submissions/:id/evaluations", get(handlers::evaluations))
        .route(
            "/submissions/:id/assignments",
            get(handlers::assignments).post(handlers::assign),
        )
        .route("/submissions/:id/stages", get(handlers::stage_instances))
        .route("/submissions/:id/sla", get(handlers::sla_status))
        .route("/submissions/:id/extend", post(handlers::extend_stage))
        .route("/sweep", post(handlers::sweep))
        .with_state(orchestrator)
}

/// A workflow error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub WorkflowError);

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            WorkflowError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WorkflowError::InvalidTransition { .. }
            | WorkflowError::Conflict(_)
            | WorkflowError::StaleState { .. }
            | WorkflowError::NoEligibleEvaluator { .. } => StatusCode::CONFLICT,
            WorkflowError::Authorization(_) => StatusCode::FORBIDDEN,
            WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
            WorkflowError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            WorkflowError::Validation(_) => "validation",
            WorkflowError::InvalidTransition { .. } => "invalid_transition",
            WorkflowError::Authorization(_) => "authorization",
            WorkflowError::Conflict(_) => "conflict",
            WorkflowError::StaleState { .. } => "stale_state",
            WorkflowError::NoEligibleEvaluator { .. } => "no_eligible_evaluator",
            WorkflowError::NotFound(_) => "not_found",
            WorkflowError::Persistence(_) => "persistence",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = json!({
            "error": self.0.to_string(),
            "kind": self.kind(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}
