use axum::extract::{Path, Query, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;

use rozet_core::capability::CapabilitySet;
use rozet_core::ids::{AgentId, ArtifactId, CommandId, OperationId, SessionId, TaskId};
use rozet_core::status::{OperationStatus, SessionStatus, TaskStatus};
use rozet_core::ApiError;
use rozet_store::operations::OperationRow;

use crate::auth::{authenticate, Principal};
use crate::error::HttpError;
use crate::server::AppState;
use crate::tracker::WaitOutcome;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 200;

/// Bearer-auth middleware: resolves a principal or short-circuits with 401.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match authenticate(&state.config.auth, header) {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(e) => HttpError(e).into_response(),
    }
}

/// 202 response with the operation Location contract.
fn accepted(session_id: &SessionId, op: &OperationRow, resource: Option<(&str, &str)>) -> Response {
    let location = format!("/api/sessions/{session_id}/operations/{}", op.id);
    let mut body = serde_json::json!({
        "operation_id": op.id.as_str(),
        "status": "queued",
    });
    if let Some((key, value)) = resource {
        body[key] = serde_json::Value::String(value.to_string());
    }
    (
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(body),
    )
        .into_response()
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

// ---- sessions ----

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub working_dir: String,
    #[serde(default)]
    pub provider_config: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Response, HttpError> {
    let provider_config = req.provider_config.map(|v| v.to_string());
    let row = state.sessions.create(
        Some(&principal.subject),
        &req.working_dir,
        provider_config.as_deref(),
        req.metadata.unwrap_or_else(|| serde_json::json!({})),
    )?;
    Ok((StatusCode::CREATED, Json(row)).into_response())
}

#[derive(Deserialize)]
pub struct ListSessionsParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub include_archived: Option<bool>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<ListSessionsParams>,
) -> Result<Response, HttpError> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            s.parse::<SessionStatus>()
                .map_err(|e| ApiError::Validation(e))
        })
        .transpose()?;
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    let rows = state.sessions.list(
        Some(&principal.subject),
        status,
        params.include_archived.unwrap_or(false),
        limit,
        params.offset.unwrap_or(0),
    )?;
    Ok(Json(serde_json::json!({ "sessions": rows })).into_response())
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> Result<Response, HttpError> {
    let detail = state.sessions.get(&session_id)?;
    Ok(Json(detail).into_response())
}

#[derive(Deserialize, Default)]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn terminate_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    body: Option<Json<ReasonRequest>>,
) -> Result<Response, HttpError> {
    let reason = body.and_then(|Json(b)| b.reason);
    let op = state.sessions.terminate(&session_id, reason)?;
    Ok(accepted(&session_id, &op, None))
}

// ---- agents ----

#[derive(Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub model: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub max_context: Option<i64>,
}

pub async fn create_agent(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<CreateAgentRequest>,
) -> Result<Response, HttpError> {
    let capabilities =
        CapabilitySet::parse_slice(&req.capabilities).map_err(ApiError::Validation)?;
    let row = state
        .agents
        .create(
            &session_id,
            &req.name,
            req.system_prompt.as_deref(),
            &req.model,
            capabilities,
            req.max_context,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(row)).into_response())
}

pub async fn list_agents(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> Result<Response, HttpError> {
    let rows = state.agents.list(&session_id)?;
    Ok(Json(serde_json::json!({ "agents": rows })).into_response())
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path((session_id, agent_id)): Path<(SessionId, AgentId)>,
) -> Result<Response, HttpError> {
    let row = state.agents.get(&session_id, &agent_id)?;
    Ok(Json(row).into_response())
}

pub async fn delete_agent(
    State(state): State<AppState>,
    Path((session_id, agent_id)): Path<(SessionId, AgentId)>,
    body: Option<Json<ReasonRequest>>,
) -> Result<Response, HttpError> {
    let reason = body.and_then(|Json(b)| b.reason);
    let op = state.agents.delete(&session_id, &agent_id, reason)?;
    Ok(accepted(&session_id, &op, Some(("agent_id", agent_id.as_str()))))
}

// ---- commands ----

#[derive(Deserialize)]
pub struct DispatchCommandRequest {
    pub command: String,
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
}

pub async fn dispatch_command(
    State(state): State<AppState>,
    Path((session_id, agent_id)): Path<(SessionId, AgentId)>,
    Json(req): Json<DispatchCommandRequest>,
) -> Result<Response, HttpError> {
    let (cmd, op) = state
        .dispatcher
        .command(&session_id, &agent_id, &req.command, req.arguments)?;
    Ok(accepted(&session_id, &op, Some(("command_id", cmd.id.as_str()))))
}

pub async fn get_command(
    State(state): State<AppState>,
    Path((session_id, command_id)): Path<(SessionId, CommandId)>,
) -> Result<Response, HttpError> {
    let row = state.dispatcher.get_command(&session_id, &command_id)?;
    Ok(Json(row).into_response())
}

// ---- tasks ----

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub description: String,
    #[serde(default)]
    pub spec: Option<rozet_store::tasks::TaskSpec>,
}

pub async fn create_task(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Response, HttpError> {
    let (task, op) = state
        .dispatcher
        .task(&session_id, &req.description, req.spec)?;
    Ok(accepted(&session_id, &op, Some(("task_id", task.id.as_str()))))
}

#[derive(Deserialize)]
pub struct ListTasksParams {
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Query(params): Query<ListTasksParams>,
) -> Result<Response, HttpError> {
    let status = params
        .status
        .as_deref()
        .map(|s| s.parse::<TaskStatus>().map_err(ApiError::Validation))
        .transpose()?;
    let rows = state.dispatcher.list_tasks(&session_id, status)?;
    Ok(Json(serde_json::json!({ "tasks": rows })).into_response())
}

pub async fn get_task(
    State(state): State<AppState>,
    Path((session_id, task_id)): Path<(SessionId, TaskId)>,
) -> Result<Response, HttpError> {
    let row = state.dispatcher.get_task(&session_id, &task_id)?;
    Ok(Json(row).into_response())
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path((session_id, task_id)): Path<(SessionId, TaskId)>,
    body: Option<Json<ReasonRequest>>,
) -> Result<Response, HttpError> {
    let reason = body.and_then(|Json(b)| b.reason);
    let op = state.dispatcher.cancel_task(&session_id, &task_id, reason)?;
    Ok(accepted(&session_id, &op, Some(("task_id", task_id.as_str()))))
}

// ---- operations ----

#[derive(Deserialize)]
pub struct ListOperationsParams {
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn list_operations(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Query(params): Query<ListOperationsParams>,
) -> Result<Response, HttpError> {
    let status = params
        .status
        .as_deref()
        .map(|s| s.parse::<OperationStatus>().map_err(ApiError::Validation))
        .transpose()?;
    let rows = state.tracker.list_for_session(&session_id, status)?;
    Ok(Json(serde_json::json!({ "operations": rows })).into_response())
}

pub async fn get_operation(
    State(state): State<AppState>,
    Path((session_id, operation_id)): Path<(SessionId, OperationId)>,
) -> Result<Response, HttpError> {
    let row = state.tracker.get(&session_id, &operation_id)?;
    Ok(Json(row).into_response())
}

#[derive(Deserialize)]
pub struct WaitParams {
    /// Seconds. Defaults to 60, clamps at 300.
    #[serde(default)]
    pub timeout: Option<u64>,
}

pub async fn wait_operation(
    State(state): State<AppState>,
    Path((session_id, operation_id)): Path<(SessionId, OperationId)>,
    Query(params): Query<WaitParams>,
) -> Result<Response, HttpError> {
    let timeout = params.timeout.map(std::time::Duration::from_secs);
    match state.tracker.wait(&session_id, &operation_id, timeout).await? {
        WaitOutcome::Completed(row) => Ok(Json(row).into_response()),
        WaitOutcome::TimedOut { retry_after_secs } => {
            let body = serde_json::json!({
                "error": {
                    "code": "WAIT_TIMEOUT",
                    "message": "operation has not reached a terminal state yet",
                    "details": { "retry_after_secs": retry_after_secs },
                }
            });
            Ok((
                StatusCode::REQUEST_TIMEOUT,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(body),
            )
                .into_response())
        }
    }
}

// ---- artifacts ----

pub async fn list_artifacts(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> Result<Response, HttpError> {
    let rows = state.artifacts.list_for_session(&session_id).map_err(HttpError::from)?;
    Ok(Json(serde_json::json!({ "artifacts": rows })).into_response())
}

pub async fn get_artifact(
    State(state): State<AppState>,
    Path((session_id, artifact_id)): Path<(SessionId, ArtifactId)>,
) -> Result<Response, HttpError> {
    let row = state.artifacts.get(&session_id, &artifact_id)?;
    Ok(Json(row).into_response())
}

#[derive(Deserialize)]
pub struct DeleteArtifactParams {
    #[serde(default)]
    pub force: Option<bool>,
}

pub async fn delete_artifact(
    State(state): State<AppState>,
    Path((session_id, artifact_id)): Path<(SessionId, ArtifactId)>,
    Query(params): Query<DeleteArtifactParams>,
) -> Result<Response, HttpError> {
    state
        .artifacts
        .delete(&session_id, &artifact_id, params.force.unwrap_or(false))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
