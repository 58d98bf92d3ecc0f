//! fleetgrid-api: REST API for FleetGrid.
//!
//! Provides axum route handlers to start and inspect staggered rollouts,
//! resume paused ones, accept agent status reports and hand agents their
//! pending commands.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/stacks/{stack}/rollouts` | Start a rollout |
//! | GET | `/api/v1/stacks` | List stacks |
//! | GET | `/api/v1/rollouts` | List tracked rollouts |
//! | GET | `/api/v1/stacks/{stack}/rollouts/{generation}` | Rollout snapshot |
//! | GET | `/api/v1/stacks/{stack}/rollouts/{generation}/agents/{agent}` | Per-agent gate |
//! | POST | `/api/v1/stacks/{stack}/rollouts/{generation}/resume` | Resume a paused rollout |
//! | POST | `/api/v1/stacks/{stack}/status` | Agent status report |
//! | GET | `/api/v1/agents/{agent}/commands` | Fetch pending commands |

pub mod dispatch;
pub mod handlers;
pub mod rollout_handlers;

use axum::Router;
use axum::routing::{get, post};
use fleetgrid_rollout::{FleetCoordinator, RolloutPool, StatusBridge};
use fleetgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub pool: RolloutPool,
    pub coordinator: FleetCoordinator,
    pub bridge: StatusBridge,
}

impl ApiState {
    pub fn new(store: StateStore, pool: RolloutPool, coordinator: FleetCoordinator) -> Self {
        Self {
            bridge: StatusBridge::new(pool.clone()),
            store,
            pool,
            coordinator,
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/stacks", get(handlers::list_stacks))
        .route("/rollouts", get(rollout_handlers::list_rollouts))
        .route("/stacks/{stack}/rollouts", post(rollout_handlers::start_rollout))
        .route(
            "/stacks/{stack}/rollouts/{generation}",
            get(rollout_handlers::get_rollout),
        )
        .route(
            "/stacks/{stack}/rollouts/{generation}/agents/{agent}",
            get(rollout_handlers::agent_gate),
        )
        .route(
            "/stacks/{stack}/rollouts/{generation}/resume",
            post(rollout_handlers::resume_rollout),
        )
        .route("/stacks/{stack}/status", post(handlers::report_status))
        .route("/agents/{agent}/commands", get(handlers::fetch_commands))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
