//! Async fleet coordinator: drives rollouts to self-scheduling agents.
//!
//! Asynchronous agents fetch their commands on their own cadence, so
//! nothing on the update path is there to ask the pool whether their turn
//! has come. The coordinator fills that gap: one supervisor task per
//! rollout spawns a polling task per async agent that pushes the update
//! command to the outbox once the pool lets that agent proceed.
//!
//! If the rollout turns into a rollback, the first forward task to notice
//! hands the set of agents it dispatched to the supervisor through a
//! single-slot channel. The supervisor merges it with what the pool knows
//! (batches that already settled survive a restart, the dispatch set does
//! not) and fans out a second set of polling tasks that push the revert
//! command as the cursor walks back.
//!
//! # Lifecycle
//!
//! ```text
//! start(key) ──► supervisor ──► forward task per agent ──► CommandOutbox
//!    │               │                 │ should_rollback
//!    │               │ ◄── updated ────┘ (single slot)
//!    │               └──► rollback task per agent ──► CommandOutbox
//!    └── newer generation of the same stack cancels the older supervisor
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::pool::RolloutPool;
use crate::ports::{CommandOutbox, StackStore};
use crate::types::{AgentId, AgentRolloutStatus, RolloutKey, StackId};

/// Check-in cadence an async agent is configured with, in seconds.
///
/// Zero disables an interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinIntervals {
    #[serde(default)]
    pub ping_secs: u64,
    #[serde(default)]
    pub command_secs: u64,
    #[serde(default)]
    pub snapshot_secs: u64,
}

impl CheckinIntervals {
    /// Polling period for this agent: half its shortest enabled interval,
    /// never below `min_tick`. Falls back to `default_tick`.
    pub fn tick_period(&self, config: &CoordinatorConfig) -> Duration {
        [self.ping_secs, self.command_secs, self.snapshot_secs]
            .into_iter()
            .filter(|secs| *secs > 0)
            .min()
            .map(|secs| (Duration::from_secs(secs) / 2).max(config.min_tick))
            .unwrap_or(config.default_tick)
    }
}

/// An agent that checks in on its own schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncAgent {
    pub id: AgentId,
    pub intervals: CheckinIntervals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Period used when an agent has every interval disabled.
    pub default_tick: Duration,
    /// Lower bound on any derived period.
    pub min_tick: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_tick: Duration::from_secs(10),
            min_tick: Duration::from_secs(1),
        }
    }
}

/// Collaborators shared by every task of every rollout.
struct Shared {
    pool: RolloutPool,
    outbox: Arc<dyn CommandOutbox>,
    stacks: Arc<dyn StackStore>,
    config: CoordinatorConfig,
}

/// Supervisor of the latest coordinated generation of one stack.
struct CoordinatorSlot {
    generation: u64,
    handle: JoinHandle<()>,
    cancel_tx: watch::Sender<bool>,
}

/// Starts, supersedes and stops rollout supervisors. Cheap to clone.
#[derive(Clone)]
pub struct FleetCoordinator {
    shared: Arc<Shared>,
    slots: Arc<RwLock<HashMap<StackId, CoordinatorSlot>>>,
}

impl FleetCoordinator {
    pub fn new(
        pool: RolloutPool,
        outbox: Arc<dyn CommandOutbox>,
        stacks: Arc<dyn StackStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                outbox,
                stacks,
                config,
            }),
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start coordinating `agents` for a rollout. Returns whether a
    /// supervisor was started.
    ///
    /// A running supervisor for an older generation of the same stack is
    /// cancelled. Requests for an older generation than the one already
    /// coordinated are ignored.
    pub async fn start(&self, key: RolloutKey, agents: Vec<AsyncAgent>) -> bool {
        if agents.is_empty() {
            return false;
        }

        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get(&key.stack_id) {
            if slot.generation > key.generation
                || (slot.generation == key.generation && !slot.handle.is_finished())
            {
                debug!(rollout = %key, running = slot.generation, "coordination request ignored");
                return false;
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let agent_count = agents.len();
        let handle = tokio::spawn(supervise(self.shared.clone(), key, agents, cancel_rx));

        if let Some(old) = slots.insert(
            key.stack_id,
            CoordinatorSlot {
                generation: key.generation,
                handle,
                cancel_tx,
            },
        ) {
            if !old.handle.is_finished() {
                let _ = old.cancel_tx.send(true);
                info!(rollout = %key, superseded = old.generation, "older rollout coordination cancelled");
            }
        }

        info!(rollout = %key, agents = agent_count, "fleet coordination started");
        true
    }

    /// Cancel the stack's supervisor and wait for all its tasks to exit.
    pub async fn stop(&self, stack: StackId) {
        let slot = self.slots.write().await.remove(&stack);
        if let Some(slot) = slot {
            let _ = slot.cancel_tx.send(true);
            let _ = slot.handle.await;
            info!(stack, generation = slot.generation, "fleet coordination stopped");
        }
    }

    /// Stop every supervisor (for graceful shutdown).
    pub async fn stop_all(&self) {
        let drained: Vec<(StackId, CoordinatorSlot)> = self.slots.write().await.drain().collect();
        for (_, slot) in &drained {
            let _ = slot.cancel_tx.send(true);
        }
        for (stack, slot) in drained {
            let _ = slot.handle.await;
            debug!(stack, generation = slot.generation, "fleet coordination stopped");
        }
        info!("all fleet coordination stopped");
    }

    /// Rollouts whose supervisor is still running.
    pub async fn active(&self) -> Vec<RolloutKey> {
        let slots = self.slots.read().await;
        let mut keys: Vec<RolloutKey> = slots
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(stack, slot)| RolloutKey::new(*stack, slot.generation))
            .collect();
        keys.sort();
        keys
    }
}

/// Top-level task of one rollout. Returns only after every task it
/// spawned has exited.
async fn supervise(
    shared: Arc<Shared>,
    key: RolloutKey,
    agents: Vec<AsyncAgent>,
    cancel: watch::Receiver<bool>,
) {
    if *cancel.borrow() {
        return;
    }
    if !shared.pool.is_rollout_tracked(key).await {
        info!(rollout = %key, agents = agents.len(), "rollout not staggered, dispatching to every agent");
        for agent in &agents {
            if let Err(e) = shared.outbox.replace_stack_command(agent.id, key.stack_id) {
                warn!(rollout = %key, agent = agent.id, error = %e, "failed to queue update command");
            }
        }
        return;
    }

    // Coordination picked up an operation that is already walking back, so
    // nothing is known about what was dispatched in the stopped batch.
    let resumed_rollback = shared.pool.should_rollback(key).await;

    let (rollback_tx, mut rollback_rx) = mpsc::channel::<Vec<AgentId>>(1);
    let updated = Arc::new(Mutex::new(BTreeSet::new()));

    let mut forward = JoinSet::new();
    for agent in &agents {
        forward.spawn(forward_loop(
            shared.clone(),
            key,
            *agent,
            updated.clone(),
            rollback_tx.clone(),
            cancel.clone(),
        ));
    }
    drop(rollback_tx);

    while forward.join_next().await.is_some() {}

    let Ok(dispatched) = rollback_rx.try_recv() else {
        debug!(rollout = %key, "fleet coordination finished");
        return;
    };
    if *cancel.borrow() {
        return;
    }
    let mut already_updated = shared.pool.updated_agents(key, resumed_rollback).await;
    already_updated.extend(dispatched);
    already_updated.sort_unstable();
    already_updated.dedup();

    let Some(target) = rollback_target(&shared, key).await else {
        warn!(rollout = %key, "no previous deployment recorded, rollback commands not sent");
        return;
    };
    info!(
        rollout = %key,
        target,
        updated = already_updated.len(),
        "rollback fan-out started"
    );

    let mut rollback = JoinSet::new();
    for agent in &agents {
        let was_updated = already_updated.contains(&agent.id);
        rollback.spawn(rollback_loop(
            shared.clone(),
            key,
            *agent,
            target,
            was_updated,
            cancel.clone(),
        ));
    }
    while rollback.join_next().await.is_some() {}
    debug!(rollout = %key, "rollback fan-out finished");
}

/// Previous deployment version of the stack, else the version agents
/// already reported reverting to.
async fn rollback_target(shared: &Shared, key: RolloutKey) -> Option<u64> {
    match shared.stacks.previous_deployment_version(key.stack_id) {
        Ok(Some(version)) => return Some(version),
        Ok(None) => {}
        Err(e) => warn!(rollout = %key, error = %e, "failed to read previous deployment"),
    }
    shared.pool.rollback_target(key).await
}

/// Sleep one period. Returns false once cancelled.
async fn tick(period: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => !*cancel.borrow(),
        _ = cancel.changed() => false,
    }
}

async fn forward_loop(
    shared: Arc<Shared>,
    key: RolloutKey,
    agent: AsyncAgent,
    updated: Arc<Mutex<BTreeSet<AgentId>>>,
    rollback_tx: mpsc::Sender<Vec<AgentId>>,
    mut cancel: watch::Receiver<bool>,
) {
    let period = agent.intervals.tick_period(&shared.config);
    let mut dispatched = false;

    while tick(period, &mut cancel).await {
        let pool = &shared.pool;
        if pool.should_rollback(key).await {
            let snapshot: Vec<AgentId> = updated.lock().await.iter().copied().collect();
            if rollback_tx.try_send(snapshot).is_ok() {
                info!(rollout = %key, agent = agent.id, "rollback signalled");
            }
            return;
        }
        if !pool.is_rollout_tracked(key).await || pool.is_completed(key).await {
            return;
        }
        if dispatched || !pool.can_proceed(key, agent.id).await {
            continue;
        }

        match shared.outbox.replace_stack_command(agent.id, key.stack_id) {
            Ok(()) => {
                dispatched = true;
                updated.lock().await.insert(agent.id);
                info!(rollout = %key, agent = agent.id, "update command queued");
            }
            Err(e) => {
                warn!(rollout = %key, agent = agent.id, error = %e, "failed to queue update command, retrying next tick");
            }
        }
    }
    debug!(rollout = %key, agent = agent.id, "forward task cancelled");
}

/// Wait for the agent's turn in the regressing cursor, then revert it.
///
/// Agents that never received the update are already on the target
/// version; their revert is confirmed straight to the pool.
async fn rollback_loop(
    shared: Arc<Shared>,
    key: RolloutKey,
    agent: AsyncAgent,
    target: u64,
    was_updated: bool,
    mut cancel: watch::Receiver<bool>,
) {
    let period = agent.intervals.tick_period(&shared.config);

    while tick(period, &mut cancel).await {
        let pool = &shared.pool;
        if !pool.is_rollout_tracked(key).await || pool.is_completed(key).await {
            return;
        }
        if !pool.can_proceed(key, agent.id).await {
            continue;
        }

        let result = if was_updated {
            shared
                .outbox
                .replace_stack_command_with_version(agent.id, key.stack_id, target)
        } else {
            pool.report_status(key, agent.id, AgentRolloutStatus::Running, Some(target))
        };
        match result {
            Ok(()) => {
                info!(rollout = %key, agent = agent.id, target, was_updated, "rollback queued");
                return;
            }
            Err(e) => {
                warn!(rollout = %key, agent = agent.id, error = %e, "failed to queue rollback, retrying next tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::error::RolloutResult;
    use crate::strategy::{FailureAction, StaggerPolicy};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Command {
        Update(AgentId),
        Rollback(AgentId, u64),
        Remove(AgentId),
    }

    #[derive(Default)]
    struct RecordingOutbox {
        commands: StdMutex<Vec<Command>>,
    }

    impl RecordingOutbox {
        fn take(&self) -> Vec<Command> {
            std::mem::take(&mut *self.commands.lock().unwrap())
        }
    }

    impl CommandOutbox for RecordingOutbox {
        fn replace_stack_command(&self, agent: AgentId, _stack: StackId) -> RolloutResult<()> {
            self.commands.lock().unwrap().push(Command::Update(agent));
            Ok(())
        }

        fn replace_stack_command_with_version(
            &self,
            agent: AgentId,
            _stack: StackId,
            version: u64,
        ) -> RolloutResult<()> {
            self.commands
                .lock()
                .unwrap()
                .push(Command::Rollback(agent, version));
            Ok(())
        }

        fn remove_stack_command(&self, agent: AgentId, _stack: StackId) -> RolloutResult<()> {
            self.commands.lock().unwrap().push(Command::Remove(agent));
            Ok(())
        }
    }

    struct FixedStacks {
        previous: Option<u64>,
    }

    impl StackStore for FixedStacks {
        fn stack_file_version(&self, _stack: StackId) -> RolloutResult<Option<u64>> {
            Ok(None)
        }

        fn previous_deployment_version(&self, _stack: StackId) -> RolloutResult<Option<u64>> {
            Ok(self.previous)
        }
    }

    /// Agents polling every 10s (ping interval 20s, halved).
    fn async_agents(ids: &[AgentId]) -> Vec<AsyncAgent> {
        ids.iter()
            .map(|id| AsyncAgent {
                id: *id,
                intervals: CheckinIntervals {
                    ping_secs: 20,
                    ..Default::default()
                },
            })
            .collect()
    }

    struct Harness {
        pool: RolloutPool,
        coordinator: FleetCoordinator,
        outbox: Arc<RecordingOutbox>,
        _shutdown: watch::Sender<bool>,
    }

    fn setup(previous: Option<u64>) -> Harness {
        let (shutdown, rx) = watch::channel(false);
        let (pool, _h) = RolloutPool::spawn(rx);
        let outbox = Arc::new(RecordingOutbox::default());
        let coordinator = FleetCoordinator::new(
            pool.clone(),
            outbox.clone(),
            Arc::new(FixedStacks { previous }),
            CoordinatorConfig::default(),
        );
        Harness {
            pool,
            coordinator,
            outbox,
            _shutdown: shutdown,
        }
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[test]
    fn tick_period_uses_shortest_interval() {
        let config = CoordinatorConfig::default();
        let intervals = CheckinIntervals {
            ping_secs: 60,
            command_secs: 30,
            snapshot_secs: 0,
        };
        assert_eq!(intervals.tick_period(&config), Duration::from_secs(15));

        let fast = CheckinIntervals {
            ping_secs: 1,
            ..Default::default()
        };
        assert_eq!(fast.tick_period(&config), config.min_tick);

        assert_eq!(
            CheckinIntervals::default().tick_period(&config),
            config.default_tick
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_batch_by_batch() {
        let Harness { pool, coordinator, outbox, _shutdown } = setup(None);
        let key = RolloutKey::new(4, 7);
        pool.register(key, StaggerPolicy::fixed(1, FailureAction::Continue), vec![1, 2])
            .await
            .unwrap();
        assert!(coordinator.start(key, async_agents(&[1, 2])).await);

        advance(11).await;
        assert_eq!(outbox.take(), vec![Command::Update(1)]);

        advance(10).await;
        assert!(outbox.take().is_empty(), "agent 2 must wait for batch 0");

        pool.report_status(key, 1, AgentRolloutStatus::Running, None)
            .unwrap();
        pool.sync().await.unwrap();
        advance(10).await;
        assert_eq!(outbox.take(), vec![Command::Update(2)]);

        pool.report_status(key, 2, AgentRolloutStatus::Running, None)
            .unwrap();
        pool.sync().await.unwrap();
        advance(10).await;
        assert!(pool.is_completed(key).await);
        assert!(coordinator.active().await.is_empty());
        assert!(outbox.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_rollout_dispatches_immediately() {
        let Harness { coordinator, outbox, _shutdown, .. } = setup(None);
        let key = RolloutKey::new(4, 1);
        assert!(coordinator.start(key, async_agents(&[1, 2, 3])).await);

        advance(1).await;
        assert_eq!(
            outbox.take(),
            vec![Command::Update(1), Command::Update(2), Command::Update(3)]
        );
        assert!(coordinator.active().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_reverts_updated_agents_in_reverse_order() {
        let Harness { pool, coordinator, outbox, _shutdown } = setup(Some(6));
        let key = RolloutKey::new(4, 7);
        pool.register(key, StaggerPolicy::fixed(1, FailureAction::Rollback), vec![1, 2])
            .await
            .unwrap();
        coordinator.start(key, async_agents(&[1, 2])).await;

        advance(11).await;
        pool.report_status(key, 1, AgentRolloutStatus::Running, None)
            .unwrap();
        pool.sync().await.unwrap();
        advance(10).await;
        assert_eq!(outbox.take(), vec![Command::Update(1), Command::Update(2)]);

        pool.report_status(key, 2, AgentRolloutStatus::Error, None)
            .unwrap();
        pool.sync().await.unwrap();
        assert!(pool.should_rollback(key).await);

        // Forward tasks notice at t=30, rollback tasks first tick at t=40.
        advance(20).await;
        assert_eq!(outbox.take(), vec![Command::Rollback(2, 6)]);

        pool.report_status(key, 2, AgentRolloutStatus::Running, Some(6))
            .unwrap();
        pool.sync().await.unwrap();
        advance(10).await;
        assert_eq!(outbox.take(), vec![Command::Rollback(1, 6)]);

        pool.report_status(key, 1, AgentRolloutStatus::Running, Some(6))
            .unwrap();
        pool.sync().await.unwrap();
        assert!(pool.is_completed(key).await);
        assert!(pool.was_rolled_back(key, 1).await);
        assert!(pool.was_rolled_back(key, 2).await);

        advance(10).await;
        assert!(coordinator.active().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_confirms_agents_that_never_updated() {
        let Harness { pool, coordinator, outbox, _shutdown } = setup(Some(6));
        let key = RolloutKey::new(4, 7);
        pool.register(key, StaggerPolicy::fixed(2, FailureAction::Rollback), vec![1, 2])
            .await
            .unwrap();
        // Agent 2 polls far less often than agent 1.
        let agents = vec![
            AsyncAgent {
                id: 1,
                intervals: CheckinIntervals {
                    ping_secs: 20,
                    ..Default::default()
                },
            },
            AsyncAgent {
                id: 2,
                intervals: CheckinIntervals {
                    ping_secs: 200,
                    ..Default::default()
                },
            },
        ];
        coordinator.start(key, agents).await;

        advance(11).await;
        assert_eq!(outbox.take(), vec![Command::Update(1)]);
        pool.report_status(key, 1, AgentRolloutStatus::Error, None)
            .unwrap();
        pool.sync().await.unwrap();

        // Agent 2's forward task only exits at t=100; the supervisor waits
        // for it before fanning out, so agent 1's revert lands at t=110.
        advance(95).await;
        assert!(outbox.take().is_empty());
        advance(5).await;
        assert_eq!(outbox.take(), vec![Command::Rollback(1, 6)]);

        pool.report_status(key, 1, AgentRolloutStatus::Running, Some(6))
            .unwrap();
        pool.sync().await.unwrap();
        advance(100).await;
        pool.sync().await.unwrap();

        assert!(pool.is_completed(key).await);
        assert!(pool.was_rolled_back(key, 2).await);
        assert!(outbox.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_reverts_batches_settled_before_coordination() {
        let Harness { pool, coordinator, outbox, _shutdown } = setup(Some(6));
        let key = RolloutKey::new(4, 7);
        pool.register(key, StaggerPolicy::fixed(1, FailureAction::Rollback), vec![1, 2])
            .await
            .unwrap();
        // Batch 0 settled under an earlier coordinator (before a restart).
        pool.report_status(key, 1, AgentRolloutStatus::Running, None)
            .unwrap();
        pool.sync().await.unwrap();
        coordinator.start(key, async_agents(&[1, 2])).await;

        advance(11).await;
        assert_eq!(outbox.take(), vec![Command::Update(2)]);
        pool.report_status(key, 2, AgentRolloutStatus::Error, None)
            .unwrap();
        pool.sync().await.unwrap();

        advance(20).await;
        assert_eq!(outbox.take(), vec![Command::Rollback(2, 6)]);
        pool.report_status(key, 2, AgentRolloutStatus::Running, Some(6))
            .unwrap();
        pool.sync().await.unwrap();

        advance(10).await;
        assert_eq!(outbox.take(), vec![Command::Rollback(1, 6)]);
        pool.report_status(key, 1, AgentRolloutStatus::Running, Some(6))
            .unwrap();
        pool.sync().await.unwrap();
        assert!(pool.is_completed(key).await);
        assert!(pool.was_rolled_back(key, 1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_rollback_reverts_whole_stopped_batch() {
        let Harness { pool, coordinator, outbox, _shutdown } = setup(Some(6));
        let key = RolloutKey::new(4, 7);
        pool.register(key, StaggerPolicy::fixed(2, FailureAction::Rollback), vec![1, 2])
            .await
            .unwrap();
        pool.report_status(key, 1, AgentRolloutStatus::Error, None)
            .unwrap();
        pool.sync().await.unwrap();
        assert!(pool.should_rollback(key).await);

        // Agent 2 may have received the update before the restart.
        coordinator.start(key, async_agents(&[1, 2])).await;
        advance(21).await;
        let commands = outbox.take();
        assert_eq!(commands.len(), 2);
        assert!(commands.contains(&Command::Rollback(1, 6)));
        assert!(commands.contains(&Command::Rollback(2, 6)));
        assert!(!pool.was_rolled_back(key, 2).await);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_generation_supersedes_older() {
        let Harness { pool, coordinator, outbox, _shutdown } = setup(None);
        let old = RolloutKey::new(4, 1);
        let new = RolloutKey::new(4, 2);
        for key in [old, new] {
            pool.register(key, StaggerPolicy::fixed(1, FailureAction::Continue), vec![1])
                .await
                .unwrap();
        }

        assert!(coordinator.start(old, async_agents(&[1])).await);
        assert!(coordinator.start(new, async_agents(&[1])).await);
        assert!(!coordinator.start(old, async_agents(&[1])).await);
        assert!(!coordinator.start(new, async_agents(&[1])).await);

        advance(11).await;
        assert_eq!(outbox.take(), vec![Command::Update(1)]);
        assert_eq!(coordinator.active().await, vec![new]);

        coordinator.stop_all().await;
        assert!(coordinator.active().await.is_empty());
        advance(30).await;
        assert!(outbox.take().is_empty());
    }
}
