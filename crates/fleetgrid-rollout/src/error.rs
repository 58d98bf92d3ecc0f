//! Rollout error types.

use thiserror::Error;

use crate::strategy::PolicyError;

/// Errors surfaced by the rollout subsystem.
///
/// Unknown rollouts and late or duplicate status reports are deliberately
/// absent: they are dropped silently, never reported as failures.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid stagger policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("stack not found: {0}")]
    StackNotFound(u32),

    #[error("store error: {0}")]
    Store(String),

    #[error("command outbox error: {0}")]
    Outbox(String),

    #[error("rollout pool worker is not running")]
    PoolClosed,
}

pub type RolloutResult<T> = Result<T, RolloutError>;
