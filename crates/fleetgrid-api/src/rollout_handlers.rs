//! REST API handlers for rollout management.
//!
//! Provides endpoints to start, list, inspect, gate and resume rollouts.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use fleetgrid_rollout::{
    AgentId, AsyncAgent, CommandOutbox, GroupResolver, RolloutKey, RolloutSnapshot, StackId,
    StaggerConfig,
};
use fleetgrid_state::AgentMode;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response, rollout_error_response};

/// Request body to start a rollout.
#[derive(Debug, Default, Deserialize)]
pub struct StartRolloutRequest {
    /// New stack version. Omitted means the stack's current version.
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub stagger: StaggerConfig,
}

/// Outcome of starting a rollout.
#[derive(Debug, Serialize)]
pub struct StartedRollout {
    pub key: RolloutKey,
    /// False for broadcast rollouts, which the pool does not track.
    pub tracked: bool,
    pub agents: usize,
    pub async_agents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<RolloutSnapshot>,
}

/// Per-agent gate answered to the dispatch layer.
#[derive(Debug, Serialize)]
pub struct AgentGate {
    pub key: RolloutKey,
    pub agent: AgentId,
    pub tracked: bool,
    pub can_proceed: bool,
    pub paused: bool,
    pub completed: bool,
    pub should_rollback: bool,
    pub was_rolled_back: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_target: Option<u64>,
}

/// POST /api/v1/stacks/{stack}/rollouts
pub async fn start_rollout(
    State(state): State<ApiState>,
    Path(stack): Path<StackId>,
    Json(req): Json<StartRolloutRequest>,
) -> impl IntoResponse {
    // Configuration errors never reach the pool.
    let policy = match req.stagger.validate() {
        Ok(policy) => policy,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response(),
    };

    let record = match state.store.get_stack(stack) {
        Ok(Some(record)) => record,
        Ok(None) => return error_response("stack not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    let record = match req.version {
        Some(version) if version > record.file_version => {
            match state.store.bump_stack_version(stack, version) {
                Ok(updated) => updated,
                Err(e) => {
                    return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                        .into_response();
                }
            }
        }
        _ => record,
    };
    let key = RolloutKey::new(stack, record.file_version);

    let agents = match state.store.resolve_agents(stack) {
        Ok(agents) => agents,
        Err(e) => return rollout_error_response(&e),
    };

    let tracked = match state.pool.register(key, policy, agents.clone()).await {
        Ok(tracked) => tracked,
        Err(e) => return rollout_error_response(&e),
    };

    // Standard agents get their command queued now and gated on fetch;
    // async agents are handed to the coordinator.
    let mut async_agents: Vec<AsyncAgent> = Vec::new();
    for id in &agents {
        let mode = match state.store.get_agent(*id) {
            Ok(Some(agent)) => {
                if let Some(view) = agent.as_async() {
                    async_agents.push(view);
                }
                agent.mode
            }
            Ok(None) => AgentMode::Standard,
            Err(e) => {
                return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                    .into_response();
            }
        };
        if mode == AgentMode::Standard {
            if let Err(e) = state.store.replace_stack_command(*id, stack) {
                warn!(rollout = %key, agent = id, error = %e, "failed to queue update command");
            }
        }
    }
    if !async_agents.is_empty() {
        state.coordinator.start(key, async_agents.clone()).await;
    }

    info!(
        rollout = %key,
        tracked,
        agents = agents.len(),
        async_agents = async_agents.len(),
        "rollout started"
    );
    let started = StartedRollout {
        key,
        tracked,
        agents: agents.len(),
        async_agents: async_agents.len(),
        snapshot: state.pool.snapshot(key).await,
    };
    (StatusCode::CREATED, ApiResponse::ok(started)).into_response()
}

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.pool.list().await).into_response()
}

/// GET /api/v1/stacks/{stack}/rollouts/{generation}
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path((stack, generation)): Path<(StackId, u64)>,
) -> impl IntoResponse {
    match state.pool.snapshot(RolloutKey::new(stack, generation)).await {
        Some(snapshot) => ApiResponse::ok(snapshot).into_response(),
        None => error_response("rollout not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// GET /api/v1/stacks/{stack}/rollouts/{generation}/agents/{agent}
///
/// Untracked rollouts answer `can_proceed: true`: they are not staggered.
pub async fn agent_gate(
    State(state): State<ApiState>,
    Path((stack, generation, agent)): Path<(StackId, u64, AgentId)>,
) -> impl IntoResponse {
    let key = RolloutKey::new(stack, generation);
    let pool = &state.pool;
    let gate = AgentGate {
        key,
        agent,
        tracked: pool.is_rollout_tracked(key).await,
        can_proceed: pool.can_proceed(key, agent).await,
        paused: pool.is_paused(key).await,
        completed: pool.is_completed(key).await,
        should_rollback: pool.should_rollback(key).await,
        was_rolled_back: pool.was_rolled_back(key, agent).await,
        rollback_target: pool.rollback_target(key).await,
    };
    ApiResponse::ok(gate).into_response()
}

/// POST /api/v1/stacks/{stack}/rollouts/{generation}/resume
pub async fn resume_rollout(
    State(state): State<ApiState>,
    Path((stack, generation)): Path<(StackId, u64)>,
) -> impl IntoResponse {
    let key = RolloutKey::new(stack, generation);
    if !state.pool.is_rollout_tracked(key).await {
        return error_response("rollout not found", StatusCode::NOT_FOUND).into_response();
    }
    match state.pool.resume(key).await {
        Ok(true) => match state.pool.snapshot(key).await {
            Some(snapshot) => ApiResponse::ok(snapshot).into_response(),
            None => error_response("rollout not found", StatusCode::NOT_FOUND).into_response(),
        },
        Ok(false) => error_response("rollout is not paused", StatusCode::CONFLICT).into_response(),
        Err(e) => rollout_error_response(&e),
    }
}
