//! Command dispatch for agents checking in.
//!
//! Standard agents are gated here, on fetch: a pending deploy command for
//! a staggered rollout is only handed out once the rollout pool lets the
//! agent proceed, and while a rollout walks back the agent is handed a
//! revert command when its batch comes up. Async agents were already
//! gated by the fleet coordinator, so their commands pass straight through.

use tracing::debug;

use fleetgrid_rollout::{
    AgentId, RolloutPhase, RolloutPool, RolloutResult, RolloutKey, StackStore,
};
use fleetgrid_state::{AgentMode, CommandOperation, StackCommand, StateStore, epoch_secs};

/// What happens to one pending command on this fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Deliver,
    Hold,
    /// The rollout turned into a rollback before the agent got the update.
    Drop,
}

/// Commands `agent` may act on now. Delivered and dropped commands are
/// removed from the outbox; held ones stay queued.
pub async fn collect_commands(
    store: &StateStore,
    pool: &RolloutPool,
    agent: AgentId,
    mode: AgentMode,
) -> RolloutResult<Vec<StackCommand>> {
    let mut delivered = Vec::new();

    for command in store.list_commands_for_agent(agent)? {
        let verdict = match mode {
            AgentMode::Async => Verdict::Deliver,
            AgentMode::Standard => gate(store, pool, &command).await?,
        };
        debug!(agent, stack = command.stack, ?verdict, "pending command");
        match verdict {
            Verdict::Hold => {}
            Verdict::Deliver => {
                store.delete_command(agent, command.stack)?;
                delivered.push(command);
            }
            Verdict::Drop => {
                store.delete_command(agent, command.stack)?;
            }
        }
    }

    if mode == AgentMode::Standard {
        delivered.extend(rollback_turns(store, pool, agent, &delivered).await?);
    }
    Ok(delivered)
}

async fn gate(
    store: &StateStore,
    pool: &RolloutPool,
    command: &StackCommand,
) -> RolloutResult<Verdict> {
    // Pinned versions and removals are never staggered.
    if command.operation != CommandOperation::Deploy || command.version.is_some() {
        return Ok(Verdict::Deliver);
    }
    let Some(generation) = store.stack_file_version(command.stack)? else {
        return Ok(Verdict::Deliver);
    };

    let key = RolloutKey::new(command.stack, generation);
    if pool.should_rollback(key).await {
        return Ok(Verdict::Drop);
    }
    if pool.is_completed(key).await || pool.can_proceed(key, command.agent).await {
        return Ok(Verdict::Deliver);
    }
    Ok(Verdict::Hold)
}

/// Revert commands for rollouts walking back through the agent's batch.
async fn rollback_turns(
    store: &StateStore,
    pool: &RolloutPool,
    agent: AgentId,
    already: &[StackCommand],
) -> RolloutResult<Vec<StackCommand>> {
    let mut commands = Vec::new();

    for snapshot in pool.list().await {
        if snapshot.phase != RolloutPhase::RollingBack || !snapshot.agents.contains_key(&agent) {
            continue;
        }
        let key = snapshot.key;
        if already.iter().any(|c| c.stack == key.stack_id) || !pool.can_proceed(key, agent).await {
            continue;
        }
        let target = match store.previous_deployment_version(key.stack_id)? {
            Some(version) => Some(version),
            None => snapshot.rollback_target,
        };
        let Some(version) = target else {
            debug!(rollout = %key, agent, "no rollback target known yet");
            continue;
        };
        commands.push(StackCommand {
            agent,
            stack: key.stack_id,
            operation: CommandOperation::Deploy,
            version: Some(version),
            created_at: epoch_secs(),
        });
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use fleetgrid_rollout::{
        AgentRolloutStatus, CommandOutbox, FailureAction, StaggerPolicy,
    };
    use fleetgrid_state::{DeploymentInfo, StackRecord};
    use tokio::sync::watch;

    use super::*;

    fn store_with_stack() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_stack(&StackRecord {
                id: 1,
                name: "web".to_string(),
                file_version: 8,
                previous_deployment: Some(DeploymentInfo {
                    file_version: 7,
                    deployed_at: 100,
                }),
                groups: vec![],
                updated_at: 200,
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn holds_deploy_until_agents_turn() {
        let store = store_with_stack();
        let (_tx, rx) = watch::channel(false);
        let (pool, _h) = RolloutPool::spawn(rx);
        let key = RolloutKey::new(1, 8);
        pool.register(key, StaggerPolicy::fixed(1, FailureAction::Continue), vec![1, 2])
            .await
            .unwrap();
        store.replace_stack_command(1, 1).unwrap();
        store.replace_stack_command(2, 1).unwrap();

        let first = collect_commands(&store, &pool, 2, AgentMode::Standard).await.unwrap();
        assert!(first.is_empty());
        assert_eq!(store.list_commands_for_agent(2).unwrap().len(), 1);

        let got = collect_commands(&store, &pool, 1, AgentMode::Standard).await.unwrap();
        assert_eq!(got.len(), 1);
        assert!(store.list_commands_for_agent(1).unwrap().is_empty());

        pool.report_status(key, 1, AgentRolloutStatus::Running, None)
            .unwrap();
        pool.sync().await.unwrap();
        let got = collect_commands(&store, &pool, 2, AgentMode::Standard).await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn async_agents_bypass_the_gate() {
        let store = store_with_stack();
        let (_tx, rx) = watch::channel(false);
        let (pool, _h) = RolloutPool::spawn(rx);
        pool.register(
            RolloutKey::new(1, 8),
            StaggerPolicy::fixed(1, FailureAction::Continue),
            vec![1, 2],
        )
        .await
        .unwrap();
        store.replace_stack_command(2, 1).unwrap();

        let got = collect_commands(&store, &pool, 2, AgentMode::Async).await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn rollback_replaces_held_deploy_with_revert() {
        let store = store_with_stack();
        let (_tx, rx) = watch::channel(false);
        let (pool, _h) = RolloutPool::spawn(rx);
        let key = RolloutKey::new(1, 8);
        pool.register(key, StaggerPolicy::fixed(2, FailureAction::Rollback), vec![1, 2])
            .await
            .unwrap();
        store.replace_stack_command(2, 1).unwrap();

        pool.report_status(key, 1, AgentRolloutStatus::Error, None)
            .unwrap();
        pool.sync().await.unwrap();

        let got = collect_commands(&store, &pool, 2, AgentMode::Standard).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].version, Some(7));
        assert!(store.list_commands_for_agent(2).unwrap().is_empty());

        // Once reverted, the agent is not asked again.
        pool.report_status(key, 2, AgentRolloutStatus::Running, Some(7))
            .unwrap();
        pool.sync().await.unwrap();
        assert!(collect_commands(&store, &pool, 2, AgentMode::Standard)
            .await
            .unwrap()
            .is_empty());
    }
}
