//! Schedule operation: the per-rollout state machine.
//!
//! A `ScheduleOperation` owns the batch queue of one rollout, a cursor
//! pointing at the active batch, and the status every agent reported.
//! It is mutated only by the rollout pool worker; every other reader
//! sees it through the pool's read lock.
//!
//! # Transitions
//!
//! ```text
//!            Error (Pause)                    Error (Rollback)
//!   Paused ◄──────────────── Active ───────────────────────► RollingBack
//!     │        resume           │ batch settled                  │ batch reverted
//!     └────────────────────────►│ cursor += 1                    │ cursor -= 1
//!                               ▼                                ▼
//!                           Completed                        RolledBack
//! ```
//!
//! A forward report only counts for agents of the current batch and only
//! while the agent is still `Pending`, so duplicate reports and timeouts
//! racing a genuine report resolve to the first arrival.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batch::build_batches;
use crate::strategy::{FailureAction, StaggerPolicy};
use crate::types::{AgentId, AgentRolloutStatus, ReportOrigin, RolloutKey, StatusReport};

/// Lifecycle phase of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Batches advance as their agents report.
    Active,
    /// Frozen after a failure; waits for an operator resume.
    Paused,
    /// Walking batches backwards, reverting agents.
    RollingBack,
    /// Every batch settled.
    Completed,
    /// The rollback walk went past the first batch.
    RolledBack,
}

impl RolloutPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

/// What a single report (or resume) did to the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Dropped: unknown agent, not in the current batch, already settled,
    /// stale timeout, or the rollout is over.
    Ignored,
    /// Status stored; the current batch is still waiting on others.
    Recorded,
    /// The cursor moved forward to `batch`.
    Advanced { batch: usize },
    /// The last batch settled.
    Completed,
    Paused,
    /// A failure started the rollback walk at `batch`.
    RollbackStarted { batch: usize },
    /// The rollback walk moved back to `batch`.
    Regressed { batch: usize },
    /// The rollback walk finished.
    RolledBack,
}

impl ReportOutcome {
    /// True when the current batch changed and fresh timeouts are needed.
    pub fn moved_cursor(self) -> bool {
        matches!(
            self,
            Self::Advanced { .. } | Self::RollbackStarted { .. } | Self::Regressed { .. }
        )
    }
}

/// Outstanding per-agent timeout. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct TimeoutHandle(AbortHandle);

impl TimeoutHandle {
    pub fn new(handle: AbortHandle) -> Self {
        Self(handle)
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Mutable state of one staggered rollout.
#[derive(Debug)]
pub struct ScheduleOperation {
    key: RolloutKey,
    policy: StaggerPolicy,
    batches: Vec<Vec<AgentId>>,
    cursor: usize,
    phase: RolloutPhase,
    agent_status: HashMap<AgentId, AgentRolloutStatus>,
    /// Rollback settlement per agent: `true` reverted, `false` failed and skipped.
    reverted: HashMap<AgentId, bool>,
    /// Errors an operator accepted when resuming a paused rollout.
    acknowledged: HashSet<AgentId>,
    rollback_target: Option<u64>,
    /// Batch the failure happened in and which of its agents had reported.
    rollback_origin: Option<(usize, Vec<AgentId>)>,
    timeouts: HashMap<AgentId, TimeoutHandle>,
    delay_not_before: HashMap<usize, Instant>,
    finished_at: Option<Instant>,
}

impl ScheduleOperation {
    /// Create an operation, partitioning `agents` per the policy.
    pub fn new(key: RolloutKey, policy: StaggerPolicy, agents: &[AgentId]) -> Self {
        let batches = build_batches(agents, &policy.batching);
        Self::from_batches(key, policy, batches)
    }

    /// Create an operation from an already-built batch queue.
    pub fn from_batches(key: RolloutKey, policy: StaggerPolicy, batches: Vec<Vec<AgentId>>) -> Self {
        let agent_status = batches
            .iter()
            .flatten()
            .map(|agent| (*agent, AgentRolloutStatus::Pending))
            .collect();
        let phase = if batches.is_empty() {
            RolloutPhase::Completed
        } else {
            RolloutPhase::Active
        };

        Self {
            key,
            policy,
            batches,
            cursor: 0,
            phase,
            agent_status,
            reverted: HashMap::new(),
            acknowledged: HashSet::new(),
            rollback_target: None,
            rollback_origin: None,
            timeouts: HashMap::new(),
            delay_not_before: HashMap::new(),
            finished_at: None,
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn key(&self) -> RolloutKey {
        self.key
    }

    pub fn policy(&self) -> &StaggerPolicy {
        &self.policy
    }

    pub fn batches(&self) -> &[Vec<AgentId>] {
        &self.batches
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn phase(&self) -> RolloutPhase {
        self.phase
    }

    pub fn rollback_target(&self) -> Option<u64> {
        self.rollback_target
    }

    pub fn status_of(&self, agent: AgentId) -> Option<AgentRolloutStatus> {
        self.agent_status.get(&agent).copied()
    }

    /// Agents of the active batch, or `None` once the rollout is over.
    pub fn current_batch(&self) -> Option<&[AgentId]> {
        if self.phase.is_terminal() {
            return None;
        }
        self.batches.get(self.cursor).map(Vec::as_slice)
    }

    pub fn is_paused(&self) -> bool {
        self.phase == RolloutPhase::Paused
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// True once a failure triggered a rollback, including after it finished.
    pub fn should_rollback(&self) -> bool {
        matches!(self.phase, RolloutPhase::RollingBack | RolloutPhase::RolledBack)
    }

    pub fn agent_in_current_batch(&self, agent: AgentId) -> bool {
        self.current_batch()
            .is_some_and(|batch| batch.contains(&agent))
    }

    /// True if the agent settled as reverted during the rollback walk.
    pub fn was_rolled_back(&self, agent: AgentId) -> bool {
        self.reverted.get(&agent).copied().unwrap_or(false)
            && self.status_of(agent) == Some(AgentRolloutStatus::Pending)
    }

    /// Agents that were handed this rollout's version.
    ///
    /// Every agent of a batch before the one the rollout stopped at, plus
    /// the agents of that batch which had reported. With `include_silent`,
    /// the batch's agents that never reported are counted as well.
    pub fn updated_agents(&self, include_silent: bool) -> Vec<AgentId> {
        let (batch, reported) = match &self.rollback_origin {
            Some((batch, reported)) => (*batch, reported.clone()),
            None => {
                let reported = self
                    .batches
                    .get(self.cursor)
                    .into_iter()
                    .flatten()
                    .copied()
                    .filter(|agent| self.status_of(*agent) != Some(AgentRolloutStatus::Pending))
                    .collect();
                (self.cursor, reported)
            }
        };

        let mut agents: Vec<AgentId> = self.batches.iter().take(batch).flatten().copied().collect();
        match self.batches.get(batch) {
            Some(current) if include_silent => agents.extend(current),
            _ => agents.extend(reported),
        }
        agents.sort_unstable();
        agents.dedup();
        agents
    }

    /// Time left before the current batch may start, if it is still delayed.
    pub fn delay_remaining(&self, now: Instant) -> Option<Duration> {
        self.delay_not_before
            .get(&self.cursor)
            .filter(|not_before| **not_before > now)
            .map(|not_before| *not_before - now)
    }

    /// Gate checked before dispatching a command to `agent`.
    ///
    /// The agent must belong to the current batch, the rollout must be
    /// neither paused nor over, and any inter-batch delay must have passed.
    /// While rolling back, agents whose revert already settled are refused.
    pub fn can_proceed(&self, agent: AgentId, now: Instant) -> bool {
        if self.is_paused() || !self.agent_in_current_batch(agent) {
            return false;
        }
        if self.delay_remaining(now).is_some() {
            return false;
        }
        if self.phase == RolloutPhase::RollingBack {
            return !self.reverted.contains_key(&agent);
        }
        true
    }

    /// Agents of the current batch still awaiting a report and without a
    /// running timeout.
    pub fn unarmed_agents(&self) -> Vec<AgentId> {
        let Some(batch) = self.current_batch() else {
            return Vec::new();
        };
        batch
            .iter()
            .copied()
            .filter(|agent| !self.timeouts.contains_key(agent))
            .filter(|agent| self.awaiting_report(*agent))
            .collect()
    }

    fn awaiting_report(&self, agent: AgentId) -> bool {
        match self.phase {
            RolloutPhase::RollingBack => !self.reverted.contains_key(&agent),
            RolloutPhase::Active | RolloutPhase::Paused => {
                self.status_of(agent) == Some(AgentRolloutStatus::Pending)
            }
            RolloutPhase::Completed | RolloutPhase::RolledBack => false,
        }
    }

    // ── Timeouts ───────────────────────────────────────────────────

    pub fn arm_timeout(&mut self, agent: AgentId, handle: TimeoutHandle) {
        self.timeouts.insert(agent, handle);
    }

    fn clear_timeout(&mut self, agent: AgentId) {
        self.timeouts.remove(&agent);
    }

    pub(crate) fn clear_all_timeouts(&mut self) {
        self.timeouts.clear();
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Apply one status report.
    pub fn apply(&mut self, report: &StatusReport, now: Instant) -> ReportOutcome {
        if self.is_terminal() {
            return ReportOutcome::Ignored;
        }
        if let ReportOrigin::Timeout {
            batch,
            rolling_back,
        } = report.origin
        {
            let stale =
                batch != self.cursor || rolling_back != (self.phase == RolloutPhase::RollingBack);
            if stale {
                debug!(rollout = %self.key, agent = report.agent, batch, "stale timeout dropped");
                return ReportOutcome::Ignored;
            }
        }

        let outcome = match self.phase {
            RolloutPhase::RollingBack => {
                self.apply_rollback(report.agent, report.status, report.rollback_hint)
            }
            _ => self.apply_forward(report.agent, report.status, now),
        };
        self.note_finished(now);
        outcome
    }

    /// When the operation reached a terminal phase. Operations that were
    /// empty from the start report `None`.
    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    fn note_finished(&mut self, now: Instant) {
        if self.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }

    fn apply_forward(
        &mut self,
        agent: AgentId,
        status: AgentRolloutStatus,
        now: Instant,
    ) -> ReportOutcome {
        if !status.is_terminal() || !self.agent_in_current_batch(agent) {
            return ReportOutcome::Ignored;
        }
        if self.status_of(agent) != Some(AgentRolloutStatus::Pending) {
            debug!(rollout = %self.key, agent, "duplicate report ignored");
            return ReportOutcome::Ignored;
        }

        self.agent_status.insert(agent, status);
        self.clear_timeout(agent);
        debug!(rollout = %self.key, agent, ?status, batch = self.cursor, "agent reported");

        if status == AgentRolloutStatus::Error {
            match self.policy.failure_action {
                FailureAction::Continue => {
                    warn!(rollout = %self.key, agent, "agent failed, continuing");
                }
                FailureAction::Pause => {
                    if self.phase != RolloutPhase::Paused {
                        warn!(rollout = %self.key, agent, batch = self.cursor, "agent failed, pausing rollout");
                        self.phase = RolloutPhase::Paused;
                    }
                    return ReportOutcome::Paused;
                }
                FailureAction::Rollback => return self.start_rollback(agent),
            }
        }

        self.try_advance(now)
    }

    fn start_rollback(&mut self, failed: AgentId) -> ReportOutcome {
        warn!(
            rollout = %self.key,
            agent = failed,
            batch = self.cursor,
            "agent failed, rolling back"
        );
        self.phase = RolloutPhase::RollingBack;
        self.clear_all_timeouts();
        self.reverted.clear();
        let reported = self.updated_agents(false);
        self.rollback_origin = Some((self.cursor, reported));
        if let Some(batch) = self.batches.get(self.cursor) {
            for agent in batch {
                self.agent_status.insert(*agent, AgentRolloutStatus::Pending);
            }
        }
        ReportOutcome::RollbackStarted { batch: self.cursor }
    }

    fn apply_rollback(
        &mut self,
        agent: AgentId,
        status: AgentRolloutStatus,
        hint: Option<u64>,
    ) -> ReportOutcome {
        if !status.is_terminal()
            || !self.agent_in_current_batch(agent)
            || self.reverted.contains_key(&agent)
        {
            return ReportOutcome::Ignored;
        }
        // A report about this rollout's own version (or a newer one) says
        // nothing about the revert.
        if hint.is_some_and(|version| version >= self.key.generation) {
            debug!(rollout = %self.key, agent, ?hint, "forward report during rollback ignored");
            return ReportOutcome::Ignored;
        }

        self.clear_timeout(agent);
        if let Some(version) = hint {
            self.rollback_target = Some(version);
        }

        match status {
            AgentRolloutStatus::Running => {
                self.agent_status.insert(agent, AgentRolloutStatus::Pending);
                self.reverted.insert(agent, true);
                debug!(rollout = %self.key, agent, "agent reverted");
            }
            _ => {
                // Rollback is best effort: a second failure is skipped.
                self.agent_status.insert(agent, AgentRolloutStatus::Error);
                self.reverted.insert(agent, false);
                warn!(rollout = %self.key, agent, "agent failed to revert, skipping");
            }
        }

        let settled = self.batches[self.cursor]
            .iter()
            .all(|a| self.reverted.contains_key(a));
        if !settled {
            return ReportOutcome::Recorded;
        }

        if self.cursor == 0 {
            self.phase = RolloutPhase::RolledBack;
            self.clear_all_timeouts();
            info!(rollout = %self.key, "rollout rolled back");
            return ReportOutcome::RolledBack;
        }

        self.cursor -= 1;
        info!(rollout = %self.key, batch = self.cursor, "rollback moved to previous batch");
        ReportOutcome::Regressed { batch: self.cursor }
    }

    fn try_advance(&mut self, now: Instant) -> ReportOutcome {
        if self.phase != RolloutPhase::Active {
            return ReportOutcome::Recorded;
        }

        let continue_on_error = self.policy.failure_action == FailureAction::Continue;
        let settled = self.batches[self.cursor].iter().all(|agent| {
            match self.status_of(*agent) {
                Some(AgentRolloutStatus::Running) => true,
                Some(AgentRolloutStatus::Error) => {
                    continue_on_error || self.acknowledged.contains(agent)
                }
                _ => false,
            }
        });
        if !settled {
            return ReportOutcome::Recorded;
        }

        self.cursor += 1;
        if self.cursor >= self.batches.len() {
            self.phase = RolloutPhase::Completed;
            self.clear_all_timeouts();
            info!(rollout = %self.key, batches = self.batches.len(), "rollout completed");
            return ReportOutcome::Completed;
        }

        if !self.policy.inter_batch_delay.is_zero() {
            self.delay_not_before
                .insert(self.cursor, now + self.policy.inter_batch_delay);
        }
        info!(
            rollout = %self.key,
            batch = self.cursor,
            total = self.batches.len(),
            "advancing to next batch"
        );
        ReportOutcome::Advanced { batch: self.cursor }
    }

    /// Operator resume of a paused rollout.
    ///
    /// Errors already reported in the current batch are accepted and the
    /// batch-completion check runs again.
    pub fn resume(&mut self, now: Instant) -> ReportOutcome {
        if self.phase != RolloutPhase::Paused {
            return ReportOutcome::Ignored;
        }
        let errored: Vec<AgentId> = self.batches[self.cursor]
            .iter()
            .copied()
            .filter(|agent| self.status_of(*agent) == Some(AgentRolloutStatus::Error))
            .collect();
        self.acknowledged.extend(errored);
        self.phase = RolloutPhase::Active;
        info!(rollout = %self.key, batch = self.cursor, "rollout resumed");

        let outcome = self.try_advance(now);
        self.note_finished(now);
        outcome
    }

    /// Serializable view for inspection endpoints.
    pub fn snapshot(&self) -> RolloutSnapshot {
        RolloutSnapshot {
            key: self.key,
            phase: self.phase,
            cursor: self.cursor,
            total_batches: self.batches.len(),
            failure_action: self.policy.failure_action,
            batches: self.batches.clone(),
            agents: self
                .agent_status
                .iter()
                .map(|(agent, status)| (*agent, *status))
                .collect(),
            rolled_back: {
                let mut agents: Vec<AgentId> = self
                    .reverted
                    .keys()
                    .copied()
                    .filter(|agent| self.was_rolled_back(*agent))
                    .collect();
                agents.sort_unstable();
                agents
            },
            rollback_target: self.rollback_target,
        }
    }
}

/// Point-in-time view of a schedule operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolloutSnapshot {
    pub key: RolloutKey,
    pub phase: RolloutPhase,
    pub cursor: usize,
    pub total_batches: usize,
    pub failure_action: FailureAction,
    pub batches: Vec<Vec<AgentId>>,
    pub agents: BTreeMap<AgentId, AgentRolloutStatus>,
    pub rolled_back: Vec<AgentId>,
    pub rollback_target: Option<u64>,
}
