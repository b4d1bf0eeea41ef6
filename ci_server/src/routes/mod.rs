//! CI server HTTP routes — queue activity, triggers, control.

pub mod api;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use ci_queue::{AccessControl, Actor, CancelOutcome, QueueError, RequestId};

use crate::config::CiConfig;
use crate::models::build::{BuildState, CiBuild};
use crate::models::project::{CiProject, NewCiProject};
use crate::services::dispatcher::Dispatcher;
use crate::services::project_service::{ProjectError, ProjectRegistry};

/// Header naming the acting user.
pub const ACTOR_HEADER: &str = "x-ci-actor";
/// Header carrying the acting user's numeric id.
pub const ACTOR_ID_HEADER: &str = "x-ci-actor-id";

/// Shared state for CI route handlers.
#[derive(Clone)]
pub struct CiRouterState {
    pub dispatcher: Arc<Dispatcher>,
    pub projects: Arc<ProjectRegistry>,
    pub access: Arc<dyn AccessControl>,
    pub config: CiConfig,
}

/// Build the CI server's Axum router (nested at `/ci`).
pub fn ci_router(state: CiRouterState) -> Router {
    Router::new()
        // Activity
        .route("/api/activity", get(activity_handler))
        // Build API
        .route("/api/builds", get(list_builds_handler))
        .route("/api/builds/trigger", post(trigger_build_handler))
        .route("/api/builds/{build_id}", get(get_build))
        // Request API
        .route("/api/requests/{request_id}", get(get_request_handler))
        .route("/api/requests/{request_id}/cancel", post(cancel_request_handler))
        .route("/api/requests/{request_id}/complete", post(complete_build_handler))
        // Queue control
        .route("/api/queue/pause", post(pause_handler))
        .route("/api/queue/resume", post(resume_handler))
        .route("/api/queue/cancel_all", post(cancel_all_handler))
        // Project API
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{project_id}/active", post(set_project_active))
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound | ApiError::Queue(QueueError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Project(ProjectError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Project(_) => StatusCode::CONFLICT,
            ApiError::Queue(_) | ApiError::Internal(_) => {
                tracing::error!("API error: {self}");
                crate::metrics::error_recorded("api");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// The actor named by the request headers, anonymous when absent.
pub fn actor_from_headers(headers: &HeaderMap) -> Actor {
    let name = headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let id = headers
        .get(ACTOR_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());
    match name {
        Some(name) => Actor::new(id, name),
        None => Actor::anonymous(),
    }
}

// ── Activity ──

async fn activity_handler(
    State(state): State<CiRouterState>,
    headers: HeaderMap,
) -> Json<api::ActivityJson> {
    let actor = actor_from_headers(&headers);
    Json(api::activity(
        &state.dispatcher,
        &state.projects,
        state.access.as_ref(),
        &actor,
    ))
}

// ── Build API ──

async fn trigger_build_handler(
    State(state): State<CiRouterState>,
    Json(req): Json<api::TriggerRequest>,
) -> Result<(StatusCode, Json<api::TriggerResponse>), ApiError> {
    let max_wait = state.config.max_trigger_wait_secs;
    let response = api::trigger_build(&state.dispatcher, req, max_wait).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Deserialize)]
pub struct ListBuildsQuery {
    pub limit: Option<usize>,
}

async fn list_builds_handler(
    State(state): State<CiRouterState>,
    Query(query): Query<ListBuildsQuery>,
) -> Json<Vec<CiBuild>> {
    Json(state.dispatcher.builds().list_builds(query.limit.unwrap_or(20)))
}

async fn get_build(
    State(state): State<CiRouterState>,
    Path(build_id): Path<i64>,
) -> Result<Json<CiBuild>, ApiError> {
    state
        .dispatcher
        .builds()
        .get_build(build_id)
        .map(Json)
        .ok_or(ApiError::NotFound)
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub state: BuildState,
}

async fn complete_build_handler(
    State(state): State<CiRouterState>,
    Path(request_id): Path<u64>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CiBuild>, ApiError> {
    if !req.state.is_finished() {
        return Err(ApiError::BadRequest(format!(
            "'{}' is not a final build state",
            req.state
        )));
    }
    state
        .dispatcher
        .complete(RequestId(request_id), req.state)
        .map(Json)
        .ok_or(ApiError::NotFound)
}

// ── Request API ──

async fn get_request_handler(
    State(state): State<CiRouterState>,
    Path(request_id): Path<u64>,
) -> Result<Json<api::RequestJson>, ApiError> {
    Ok(Json(api::get_request(&state.dispatcher, RequestId(request_id))?))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub outcome: CancelOutcome,
}

async fn cancel_request_handler(
    State(state): State<CiRouterState>,
    headers: HeaderMap,
    Path(request_id): Path<u64>,
) -> Result<Json<CancelResponse>, ApiError> {
    let id = RequestId(request_id);
    let actor = actor_from_headers(&headers);

    // Checked for every registered request: a late cancel still changes status.
    let request = state.dispatcher.queue().registry().request(id)?;
    if !state.access.can_cancel(&actor, &request) {
        return Err(ApiError::Forbidden);
    }

    let outcome = state.dispatcher.cancel(id)?;
    tracing::info!(request_id = %id, actor = %actor.name, ?outcome, "Cancel requested");
    Ok(Json(CancelResponse {
        cancelled: outcome.is_cancelled(),
        outcome,
    }))
}

// ── Queue control ──

#[derive(Debug, Serialize)]
pub struct QueueStateResponse {
    pub running: bool,
}

async fn pause_handler(
    State(state): State<CiRouterState>,
    headers: HeaderMap,
) -> Result<Json<QueueStateResponse>, ApiError> {
    let actor = actor_from_headers(&headers);
    if !state.access.can_toggle_queue(&actor) {
        return Err(ApiError::Forbidden);
    }
    state.dispatcher.pause();
    tracing::info!(actor = %actor.name, "Queue paused");
    Ok(Json(QueueStateResponse {
        running: state.dispatcher.queue().is_running(),
    }))
}

async fn resume_handler(
    State(state): State<CiRouterState>,
    headers: HeaderMap,
) -> Result<Json<QueueStateResponse>, ApiError> {
    let actor = actor_from_headers(&headers);
    if !state.access.can_toggle_queue(&actor) {
        return Err(ApiError::Forbidden);
    }
    state.dispatcher.resume();
    tracing::info!(actor = %actor.name, "Queue resumed");
    Ok(Json(QueueStateResponse {
        running: state.dispatcher.queue().is_running(),
    }))
}

#[derive(Debug, Serialize)]
pub struct CancelAllResponse {
    pub cancelled: Vec<RequestId>,
}

async fn cancel_all_handler(
    State(state): State<CiRouterState>,
    headers: HeaderMap,
) -> Result<Json<CancelAllResponse>, ApiError> {
    let actor = actor_from_headers(&headers);
    if !state.access.can_cancel_all(&actor) {
        return Err(ApiError::Forbidden);
    }
    let cancelled = state.dispatcher.cancel_all()?;
    tracing::warn!(actor = %actor.name, count = cancelled.len(), "Cancel all requested");
    Ok(Json(CancelAllResponse { cancelled }))
}

// ── Project API ──

async fn list_projects(State(state): State<CiRouterState>) -> Json<Vec<CiProject>> {
    Json(state.projects.list_projects())
}

async fn create_project(
    State(state): State<CiRouterState>,
    Json(new_project): Json<NewCiProject>,
) -> Result<(StatusCode, Json<CiProject>), ApiError> {
    let project = state.projects.create_project(new_project)?;
    Ok((StatusCode::CREATED, Json(project)))
}

#[derive(Deserialize)]
pub struct ProjectActiveRequest {
    pub active: bool,
}

/// Disabled projects keep their queued and active builds; new requests are rejected.
async fn set_project_active(
    State(state): State<CiRouterState>,
    Path(project_id): Path<i64>,
    Json(req): Json<ProjectActiveRequest>,
) -> Result<Json<CiProject>, ApiError> {
    Ok(Json(state.projects.set_active(project_id, req.active)?))
}
