//! Agent-facing REST handlers and the shared response envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::warn;

use fleetgrid_rollout::{AgentId, AgentReport, DeploymentStatus, RolloutError, StackId};

use crate::ApiState;
use crate::dispatch::collect_commands;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Map a rollout-layer error to an HTTP status.
pub(crate) fn rollout_error_response(e: &RolloutError) -> axum::response::Response {
    let status = match e {
        RolloutError::Policy(_) => StatusCode::BAD_REQUEST,
        RolloutError::StackNotFound(_) => StatusCode::NOT_FOUND,
        RolloutError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
        RolloutError::Store(_) | RolloutError::Outbox(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Stacks ─────────────────────────────────────────────────────

/// GET /api/v1/stacks
pub async fn list_stacks(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_stacks() {
        Ok(stacks) => ApiResponse::ok(stacks).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Status reports ─────────────────────────────────────────────

/// Status report body sent by an agent.
#[derive(serde::Deserialize)]
pub struct StatusRequest {
    pub agent: AgentId,
    pub status: DeploymentStatus,
    pub version: u64,
    #[serde(default)]
    pub message: Option<String>,
}

/// POST /api/v1/stacks/{stack}/status
pub async fn report_status(
    State(state): State<ApiState>,
    Path(stack): Path<StackId>,
    Json(req): Json<StatusRequest>,
) -> impl IntoResponse {
    if let Err(e) = state.store.touch_agent(req.agent) {
        warn!(agent = req.agent, error = %e, "failed to record agent check-in");
    }
    if let Some(message) = &req.message {
        if req.status == DeploymentStatus::Error {
            warn!(stack, agent = req.agent, version = req.version, %message, "agent reported deployment error");
        }
    }

    let report = AgentReport {
        stack_id: stack,
        agent: req.agent,
        status: req.status,
        version: req.version,
        message: req.message,
    };
    match state.bridge.forward(&report).await {
        Ok(forwarded) => ApiResponse::ok(serde_json::json!({
            "stack": stack,
            "agent": report.agent,
            "forwarded": forwarded,
        }))
        .into_response(),
        Err(e) => rollout_error_response(&e),
    }
}

// ── Commands ───────────────────────────────────────────────────

/// GET /api/v1/agents/{agent}/commands
///
/// Hands out the commands the agent may act on now and removes them from
/// the outbox.
pub async fn fetch_commands(
    State(state): State<ApiState>,
    Path(agent): Path<AgentId>,
) -> impl IntoResponse {
    let record = match state.store.get_agent(agent) {
        Ok(Some(record)) => record,
        Ok(None) => return error_response("agent not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    if let Err(e) = state.store.touch_agent(agent) {
        warn!(agent, error = %e, "failed to record agent check-in");
    }

    match collect_commands(&state.store, &state.pool, agent, record.mode).await {
        Ok(commands) => ApiResponse::ok(commands).into_response(),
        Err(e) => rollout_error_response(&e),
    }
}
