//! The store's implementations of the rollout collaborator contracts.

use tracing::debug;

use fleetgrid_rollout::{
    AgentId, CommandOutbox, GroupResolver, RolloutError, RolloutJournal, RolloutKey,
    RolloutRecord, RolloutResult, StackId, StackStore, StatusReport,
};

use crate::store::StateStore;
use crate::types::{CommandOperation, StackCommand, epoch_secs};

impl StateStore {
    fn queue(
        &self,
        agent: AgentId,
        stack: StackId,
        operation: CommandOperation,
        version: Option<u64>,
    ) -> RolloutResult<()> {
        let command = StackCommand {
            agent,
            stack,
            operation,
            version,
            created_at: epoch_secs(),
        };
        self.put_command(&command)
            .map_err(|e| RolloutError::Outbox(e.to_string()))
    }
}

impl CommandOutbox for StateStore {
    fn replace_stack_command(&self, agent: AgentId, stack: StackId) -> RolloutResult<()> {
        self.queue(agent, stack, CommandOperation::Deploy, None)
    }

    fn replace_stack_command_with_version(
        &self,
        agent: AgentId,
        stack: StackId,
        version: u64,
    ) -> RolloutResult<()> {
        self.queue(agent, stack, CommandOperation::Deploy, Some(version))
    }

    fn remove_stack_command(&self, agent: AgentId, stack: StackId) -> RolloutResult<()> {
        self.queue(agent, stack, CommandOperation::Remove, None)
    }
}

impl StackStore for StateStore {
    fn stack_file_version(&self, stack: StackId) -> RolloutResult<Option<u64>> {
        Ok(self.get_stack(stack)?.map(|s| s.file_version))
    }

    fn previous_deployment_version(&self, stack: StackId) -> RolloutResult<Option<u64>> {
        Ok(self
            .get_stack(stack)?
            .and_then(|s| s.previous_deployment)
            .map(|d| d.file_version))
    }
}

impl GroupResolver for StateStore {
    fn resolve_agents(&self, stack: StackId) -> RolloutResult<Vec<AgentId>> {
        let record = self
            .get_stack(stack)?
            .ok_or(RolloutError::StackNotFound(stack))?;
        let agents: Vec<AgentId> = self
            .list_agents_in_groups(&record.groups)?
            .iter()
            .map(|a| a.id)
            .collect();
        debug!(stack, groups = ?record.groups, agents = agents.len(), "stack groups resolved");
        Ok(agents)
    }
}

impl RolloutJournal for StateStore {
    fn record_registration(&self, record: &RolloutRecord) -> RolloutResult<()> {
        Ok(self.put_rollout(record)?)
    }

    fn record_report(&self, report: &StatusReport) -> RolloutResult<()> {
        self.append_rollout_report(report)?;
        Ok(())
    }

    fn record_resume(&self, key: RolloutKey) -> RolloutResult<()> {
        self.append_rollout_resume(key)?;
        Ok(())
    }

    fn remove(&self, key: RolloutKey) -> RolloutResult<()> {
        self.delete_rollout(key)?;
        Ok(())
    }

    fn load(&self) -> RolloutResult<Vec<RolloutRecord>> {
        Ok(self.list_rollouts()?)
    }
}
