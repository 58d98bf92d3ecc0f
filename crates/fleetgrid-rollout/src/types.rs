//! Identifiers and status values shared across the rollout subsystem.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a remote agent (an environment/endpoint in the fleet).
pub type AgentId = u32;

/// Identifier of a deployable stack.
pub type StackId = u32;

/// Identity of one staggered rollout: the stack plus the content version
/// (generation) the rollout was started for.
///
/// Keying on the generation lets a second update of the same stack be
/// tracked independently while the first is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RolloutKey {
    pub stack_id: StackId,
    pub generation: u64,
}

impl RolloutKey {
    pub fn new(stack_id: StackId, generation: u64) -> Self {
        Self {
            stack_id,
            generation,
        }
    }

    /// Composite key used by the state store (`{stack}:{generation}`),
    /// zero-padded so keys sort numerically.
    pub fn table_key(&self) -> String {
        format!("{:010}:{:020}", self.stack_id, self.generation)
    }
}

impl fmt::Display for RolloutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.stack_id, self.generation)
    }
}

/// Per-agent status inside a schedule operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRolloutStatus {
    /// No terminal report yet (forward), or reverted (after a rollback visit).
    #[default]
    Pending,
    Running,
    Error,
}

impl AgentRolloutStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Where a status report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportOrigin {
    /// Reported by the agent (through the status bridge).
    Agent,
    /// Synthesised by a per-agent timeout armed for `batch`.
    Timeout { batch: usize, rolling_back: bool },
}

/// A single status report flowing into the rollout pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub key: RolloutKey,
    pub agent: AgentId,
    pub status: AgentRolloutStatus,
    /// Version the agent reverted to, when the report concerns a rollback.
    pub rollback_hint: Option<u64>,
    pub origin: ReportOrigin,
}

impl StatusReport {
    pub fn from_agent(
        key: RolloutKey,
        agent: AgentId,
        status: AgentRolloutStatus,
        rollback_hint: Option<u64>,
    ) -> Self {
        Self {
            key,
            agent,
            status,
            rollback_hint,
            origin: ReportOrigin::Agent,
        }
    }

    pub(crate) fn timed_out(key: RolloutKey, agent: AgentId, batch: usize, rolling_back: bool) -> Self {
        Self {
            key,
            agent,
            status: AgentRolloutStatus::Error,
            rollback_hint: None,
            origin: ReportOrigin::Timeout {
                batch,
                rolling_back,
            },
        }
    }
}
