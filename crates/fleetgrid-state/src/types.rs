//! Domain types for the FleetGrid state store.
//!
//! These types represent the persisted state of stacks, agents and the
//! commands queued for agents. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};

use fleetgrid_rollout::{AgentId, AsyncAgent, CheckinIntervals, StackId};

// ── Stack ─────────────────────────────────────────────────────────

/// A deployable stack and its version pointers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackRecord {
    pub id: StackId,
    pub name: String,
    /// Content version of the stack file; bumped on every update.
    pub file_version: u64,
    /// The deployment that was current before the latest update.
    #[serde(default)]
    pub previous_deployment: Option<DeploymentInfo>,
    /// Agent groups the stack targets.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Unix timestamp (seconds) when this record was last updated.
    pub updated_at: u64,
}

/// Pointer to a past deployment of a stack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentInfo {
    pub file_version: u64,
    pub deployed_at: u64,
}

impl StackRecord {
    pub fn table_key(&self) -> String {
        stack_key(self.id)
    }
}

pub(crate) fn stack_key(id: StackId) -> String {
    format!("{id:010}")
}

// ── Agent ─────────────────────────────────────────────────────────

/// How an agent receives its commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Long-polls; the update path drives it directly.
    #[default]
    Standard,
    /// Checks in on its own schedule; driven by the fleet coordinator.
    Async,
}

/// A remote agent in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default)]
    pub intervals: CheckinIntervals,
    /// Unix timestamp of the last check-in, if any.
    #[serde(default)]
    pub last_checkin: Option<u64>,
}

impl AgentRecord {
    pub fn table_key(&self) -> String {
        agent_key(self.id)
    }

    /// The coordinator's view of this agent, if it self-schedules.
    pub fn as_async(&self) -> Option<AsyncAgent> {
        (self.mode == AgentMode::Async).then_some(AsyncAgent {
            id: self.id,
            intervals: self.intervals,
        })
    }
}

pub(crate) fn agent_key(id: AgentId) -> String {
    format!("{id:010}")
}

// ── Command ───────────────────────────────────────────────────────

/// What an agent is asked to do with a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOperation {
    /// Deploy the stack; `version` pins a specific one (rollbacks).
    Deploy,
    Remove,
}

/// The pending command for one agent and one stack.
///
/// At most one command is pending per pair; a newer one replaces it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackCommand {
    pub agent: AgentId,
    pub stack: StackId,
    pub operation: CommandOperation,
    /// Version to deploy. `None` means the stack's current version.
    #[serde(default)]
    pub version: Option<u64>,
    pub created_at: u64,
}

impl StackCommand {
    pub fn table_key(&self) -> String {
        command_key(self.agent, self.stack)
    }
}

pub(crate) fn command_key(agent: AgentId, stack: StackId) -> String {
    format!("{}:{}", agent_key(agent), stack_key(stack))
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
