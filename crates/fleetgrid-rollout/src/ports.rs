//! Contracts for the collaborators the rollout subsystem depends on.
//!
//! The rollout core never touches storage or the agent wire protocol
//! directly. These traits are implemented by `fleetgrid-state` in the
//! daemon and by simple in-memory fakes in tests.

use serde::{Deserialize, Serialize};

use crate::error::RolloutResult;
use crate::strategy::StaggerPolicy;
use crate::types::{AgentId, RolloutKey, StackId, StatusReport};

/// Pending-command outbox fetched by agents on their next check-in.
///
/// All operations are idempotent upserts and safe for concurrent callers.
pub trait CommandOutbox: Send + Sync {
    /// Ask `agent` to deploy the stack's current version.
    fn replace_stack_command(&self, agent: AgentId, stack: StackId) -> RolloutResult<()>;

    /// Ask `agent` to deploy a specific version (used for rollbacks).
    fn replace_stack_command_with_version(
        &self,
        agent: AgentId,
        stack: StackId,
        version: u64,
    ) -> RolloutResult<()>;

    /// Ask `agent` to remove the stack.
    fn remove_stack_command(&self, agent: AgentId, stack: StackId) -> RolloutResult<()>;
}

/// Read access to stack deployment version pointers.
pub trait StackStore: Send + Sync {
    /// Current content version of the stack.
    fn stack_file_version(&self, stack: StackId) -> RolloutResult<Option<u64>>;

    /// Version of the deployment preceding the current one, if any.
    fn previous_deployment_version(&self, stack: StackId) -> RolloutResult<Option<u64>>;
}

/// Resolves a stack's target groups to the agents currently in scope.
pub trait GroupResolver: Send + Sync {
    /// Flat, de-duplicated, ordered list of agents targeted by `stack`.
    fn resolve_agents(&self, stack: StackId) -> RolloutResult<Vec<AgentId>>;
}

/// Durable record of a registered rollout and the reports applied to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub key: RolloutKey,
    pub policy: StaggerPolicy,
    pub batches: Vec<Vec<AgentId>>,
    /// Reports in the order the pool applied them.
    pub reports: Vec<StatusReport>,
    /// Operator resumes, as the index into `reports` at which each happened.
    #[serde(default)]
    pub resumes: Vec<usize>,
}

/// Persistence used to rebuild the rollout pool after a restart.
pub trait RolloutJournal: Send + Sync {
    fn record_registration(&self, record: &RolloutRecord) -> RolloutResult<()>;

    fn record_report(&self, report: &StatusReport) -> RolloutResult<()>;

    fn record_resume(&self, key: RolloutKey) -> RolloutResult<()>;

    fn remove(&self, key: RolloutKey) -> RolloutResult<()>;

    /// All recorded rollouts, ordered by key.
    fn load(&self) -> RolloutResult<Vec<RolloutRecord>>;
}
