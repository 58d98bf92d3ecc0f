//! Rollout pool: process-wide registry of schedule operations.
//!
//! A single worker task is the only writer of any [`ScheduleOperation`].
//! It drains two serialized queues: rollout registrations and status
//! updates (agent reports, synthesized timeouts, operator resumes).
//! Everyone else reads the operations through a shared `RwLock`, so
//! queries never wait on the worker and never block each other.
//!
//! # Architecture
//!
//! ```text
//! RolloutPool (Clone)
//!   ├── register_tx ──┐
//!   ├── status_tx ────┼──► PoolWorker (one task, biased toward registrations)
//!   │                 │      ├── ScheduleOperation::apply / resume
//!   │                 │      ├── per-agent timeout tasks ──► status_tx
//!   │                 │      ├── RolloutJournal (optional)
//!   │                 │      └── retention sweep (optional) ──► evict
//!   └── rollouts: Arc<RwLock<HashMap<RolloutKey, ScheduleOperation>>>
//! ```
//!
//! Finished rollouts stay queryable until the retention sweep (or an
//! explicit `evict`) drops them together with their journal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{RolloutError, RolloutResult};
use crate::ports::{RolloutJournal, RolloutRecord};
use crate::schedule::{ReportOutcome, RolloutSnapshot, ScheduleOperation, TimeoutHandle};
use crate::strategy::StaggerPolicy;
use crate::types::{AgentId, AgentRolloutStatus, RolloutKey, StackId, StatusReport};

type Rollouts = Arc<RwLock<HashMap<RolloutKey, ScheduleOperation>>>;

/// A rollout registration waiting for the worker.
struct RegisterJob {
    key: RolloutKey,
    policy: StaggerPolicy,
    agents: Vec<AgentId>,
    ack: oneshot::Sender<bool>,
}

/// Everything that mutates an existing rollout.
enum StatusJob {
    Report(StatusReport),
    Resume {
        key: RolloutKey,
        ack: oneshot::Sender<bool>,
    },
    Evict {
        key: RolloutKey,
        ack: oneshot::Sender<bool>,
    },
    /// Completes once every job queued before it was applied.
    Barrier(oneshot::Sender<()>),
}

/// Handle to the rollout pool. Cheap to clone.
#[derive(Clone)]
pub struct RolloutPool {
    rollouts: Rollouts,
    register_tx: mpsc::UnboundedSender<RegisterJob>,
    status_tx: mpsc::UnboundedSender<StatusJob>,
}

/// The single writer behind a [`RolloutPool`].
pub struct PoolWorker {
    rollouts: Rollouts,
    register_rx: mpsc::UnboundedReceiver<RegisterJob>,
    status_rx: mpsc::UnboundedReceiver<StatusJob>,
    status_tx: mpsc::UnboundedSender<StatusJob>,
    journal: Option<Arc<dyn RolloutJournal>>,
    /// How long a finished rollout is kept before the sweep evicts it.
    retention: Option<Duration>,
}

impl RolloutPool {
    /// Create a pool and its (not yet running) worker.
    pub fn new() -> (Self, PoolWorker) {
        Self::build(None)
    }

    /// Create a pool whose worker records every mutation in `journal`.
    pub fn with_journal(journal: Arc<dyn RolloutJournal>) -> (Self, PoolWorker) {
        Self::build(Some(journal))
    }

    fn build(journal: Option<Arc<dyn RolloutJournal>>) -> (Self, PoolWorker) {
        let rollouts: Rollouts = Arc::new(RwLock::new(HashMap::new()));
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        let pool = Self {
            rollouts: rollouts.clone(),
            register_tx,
            status_tx: status_tx.clone(),
        };
        let worker = PoolWorker {
            rollouts,
            register_rx,
            status_rx,
            status_tx,
            journal,
            retention: None,
        };
        (pool, worker)
    }

    /// Create a pool and spawn its worker on the current runtime.
    pub fn spawn(shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let (pool, worker) = Self::new();
        let handle = tokio::spawn(worker.run(shutdown));
        (pool, handle)
    }

    // ── Writes (queued to the worker) ──────────────────────────────

    /// Register a rollout. Returns whether the pool now tracks it.
    ///
    /// Broadcast (`AllAtOnce`) policies are not tracked. Registering a key
    /// that is already tracked is a no-op that returns `true`.
    pub async fn register(
        &self,
        key: RolloutKey,
        policy: StaggerPolicy,
        agents: Vec<AgentId>,
    ) -> RolloutResult<bool> {
        let (ack, rx) = oneshot::channel();
        self.register_tx
            .send(RegisterJob {
                key,
                policy,
                agents,
                ack,
            })
            .map_err(|_| RolloutError::PoolClosed)?;
        rx.await.map_err(|_| RolloutError::PoolClosed)
    }

    /// Queue a status report. Reports for unknown rollouts are dropped.
    pub fn report_status(
        &self,
        key: RolloutKey,
        agent: AgentId,
        status: AgentRolloutStatus,
        rollback_hint: Option<u64>,
    ) -> RolloutResult<()> {
        self.submit(StatusReport::from_agent(key, agent, status, rollback_hint))
    }

    /// Queue a prepared status report.
    pub fn submit(&self, report: StatusReport) -> RolloutResult<()> {
        self.status_tx
            .send(StatusJob::Report(report))
            .map_err(|_| RolloutError::PoolClosed)
    }

    /// Operator resume of a paused rollout. Returns whether anything changed.
    pub async fn resume(&self, key: RolloutKey) -> RolloutResult<bool> {
        let (ack, rx) = oneshot::channel();
        self.status_tx
            .send(StatusJob::Resume { key, ack })
            .map_err(|_| RolloutError::PoolClosed)?;
        rx.await.map_err(|_| RolloutError::PoolClosed)
    }

    /// Drop a finished rollout from memory. Active rollouts are kept.
    pub async fn evict(&self, key: RolloutKey) -> RolloutResult<bool> {
        let (ack, rx) = oneshot::channel();
        self.status_tx
            .send(StatusJob::Evict { key, ack })
            .map_err(|_| RolloutError::PoolClosed)?;
        rx.await.map_err(|_| RolloutError::PoolClosed)
    }

    /// Wait until every status job queued so far has been applied.
    pub async fn sync(&self) -> RolloutResult<()> {
        let (ack, rx) = oneshot::channel();
        self.status_tx
            .send(StatusJob::Barrier(ack))
            .map_err(|_| RolloutError::PoolClosed)?;
        rx.await.map_err(|_| RolloutError::PoolClosed)
    }

    // ── Queries (read lock) ────────────────────────────────────────

    pub async fn is_rollout_tracked(&self, key: RolloutKey) -> bool {
        self.rollouts.read().await.contains_key(&key)
    }

    /// Whether `agent` may receive its command now.
    ///
    /// Untracked rollouts are not staggered, so every agent may proceed.
    pub async fn can_proceed(&self, key: RolloutKey, agent: AgentId) -> bool {
        let rollouts = self.rollouts.read().await;
        match rollouts.get(&key) {
            Some(op) => op.can_proceed(agent, Instant::now()),
            None => true,
        }
    }

    pub async fn is_paused(&self, key: RolloutKey) -> bool {
        self.read(key, ScheduleOperation::is_paused).await
    }

    /// True once the rollout completed or finished rolling back.
    pub async fn is_completed(&self, key: RolloutKey) -> bool {
        self.read(key, ScheduleOperation::is_terminal).await
    }

    pub async fn should_rollback(&self, key: RolloutKey) -> bool {
        self.read(key, ScheduleOperation::should_rollback).await
    }

    pub async fn was_rolled_back(&self, key: RolloutKey, agent: AgentId) -> bool {
        self.read(key, |op| op.was_rolled_back(agent)).await
    }

    /// Agents that were handed the rollout's version, as far as the pool
    /// can tell. See [`ScheduleOperation::updated_agents`].
    pub async fn updated_agents(&self, key: RolloutKey, include_silent: bool) -> Vec<AgentId> {
        let rollouts = self.rollouts.read().await;
        rollouts
            .get(&key)
            .map(|op| op.updated_agents(include_silent))
            .unwrap_or_default()
    }

    pub async fn rollback_target(&self, key: RolloutKey) -> Option<u64> {
        let rollouts = self.rollouts.read().await;
        rollouts.get(&key).and_then(ScheduleOperation::rollback_target)
    }

    pub async fn snapshot(&self, key: RolloutKey) -> Option<RolloutSnapshot> {
        let rollouts = self.rollouts.read().await;
        rollouts.get(&key).map(ScheduleOperation::snapshot)
    }

    /// Snapshots of every tracked rollout, ordered by key.
    pub async fn list(&self) -> Vec<RolloutSnapshot> {
        let rollouts = self.rollouts.read().await;
        let mut snapshots: Vec<RolloutSnapshot> =
            rollouts.values().map(ScheduleOperation::snapshot).collect();
        snapshots.sort_by_key(|s| s.key);
        snapshots
    }

    /// Generations of `stack` that are currently walking a rollback.
    pub async fn rolling_back(&self, stack: StackId) -> Vec<RolloutKey> {
        let rollouts = self.rollouts.read().await;
        let mut keys: Vec<RolloutKey> = rollouts
            .values()
            .filter(|op| op.key().stack_id == stack && op.should_rollback() && !op.is_terminal())
            .map(ScheduleOperation::key)
            .collect();
        keys.sort();
        keys
    }

    async fn read(&self, key: RolloutKey, f: impl FnOnce(&ScheduleOperation) -> bool) -> bool {
        let rollouts = self.rollouts.read().await;
        rollouts.get(&key).is_some_and(f)
    }
}

impl PoolWorker {
    /// Evict finished rollouts once they have been over for `retention`.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Rebuild schedule operations from the journal. Call before [`run`].
    ///
    /// [`run`]: PoolWorker::run
    pub async fn restore(&mut self) -> RolloutResult<usize> {
        let Some(journal) = self.journal.clone() else {
            return Ok(0);
        };
        let records = journal.load()?;
        let now = Instant::now();
        let mut rollouts = self.rollouts.write().await;

        for record in &records {
            let mut op = replay(record, now);
            info!(
                rollout = %record.key,
                phase = ?op.phase(),
                cursor = op.cursor(),
                reports = record.reports.len(),
                "rollout restored"
            );
            self.arm_timeouts(&mut op);
            rollouts.insert(record.key, op);
        }
        Ok(records.len())
    }

    /// Process jobs until `shutdown` flips or every pool handle is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!(retention = ?self.retention, "rollout pool worker starting");
        let period = self.retention.map_or(Duration::from_secs(60), sweep_period);
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(job) = self.register_rx.recv() => self.handle_register(job).await,
                Some(job) = self.status_rx.recv() => self.handle_status(job).await,
                _ = sweep.tick(), if self.retention.is_some() => self.sweep().await,
                else => break,
            }
        }

        // Outstanding timers must not outlive the worker.
        let mut rollouts = self.rollouts.write().await;
        for op in rollouts.values_mut() {
            op.clear_all_timeouts();
        }
        debug!("rollout pool worker stopped");
    }

    async fn handle_register(&self, job: RegisterJob) {
        let RegisterJob {
            key,
            policy,
            agents,
            ack,
        } = job;

        if !policy.is_staggered() {
            debug!(rollout = %key, "broadcast rollout, not tracked");
            let _ = ack.send(false);
            return;
        }

        let mut rollouts = self.rollouts.write().await;
        if rollouts.contains_key(&key) {
            debug!(rollout = %key, "rollout already registered");
            let _ = ack.send(true);
            return;
        }

        let mut op = ScheduleOperation::new(key, policy, &agents);
        if let Some(journal) = &self.journal {
            let record = RolloutRecord {
                key,
                policy: op.policy().clone(),
                batches: op.batches().to_vec(),
                reports: Vec::new(),
                resumes: Vec::new(),
            };
            if let Err(e) = journal.record_registration(&record) {
                error!(rollout = %key, error = %e, "failed to journal rollout registration");
            }
        }
        self.arm_timeouts(&mut op);

        info!(
            rollout = %key,
            agents = agents.len(),
            batches = op.batches().len(),
            failure_action = ?op.policy().failure_action,
            "rollout registered"
        );
        rollouts.insert(key, op);
        let _ = ack.send(true);
    }

    async fn handle_status(&self, job: StatusJob) {
        match job {
            StatusJob::Report(report) => self.apply_report(report).await,
            StatusJob::Resume { key, ack } => {
                let mut rollouts = self.rollouts.write().await;
                let changed = match rollouts.get_mut(&key) {
                    Some(op) => {
                        let outcome = op.resume(Instant::now());
                        if outcome != ReportOutcome::Ignored {
                            self.journal_resume(key);
                            self.arm_timeouts(op);
                        }
                        outcome != ReportOutcome::Ignored
                    }
                    None => false,
                };
                let _ = ack.send(changed);
            }
            StatusJob::Evict { key, ack } => {
                let mut rollouts = self.rollouts.write().await;
                let evicted = rollouts
                    .get(&key)
                    .is_some_and(ScheduleOperation::is_terminal);
                if evicted {
                    self.evict(&mut rollouts, key);
                }
                let _ = ack.send(evicted);
            }
            StatusJob::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn evict(&self, rollouts: &mut HashMap<RolloutKey, ScheduleOperation>, key: RolloutKey) {
        rollouts.remove(&key);
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.remove(key) {
                warn!(rollout = %key, error = %e, "failed to remove rollout journal");
            }
        }
        info!(rollout = %key, "rollout evicted");
    }

    /// Evict every rollout that has been over for longer than the retention.
    async fn sweep(&self) {
        let Some(retention) = self.retention else {
            return;
        };
        let now = Instant::now();
        let mut rollouts = self.rollouts.write().await;
        let expired: Vec<RolloutKey> = rollouts
            .values()
            .filter(|op| op.is_terminal())
            .filter(|op| {
                op.finished_at()
                    .is_none_or(|at| now.saturating_duration_since(at) >= retention)
            })
            .map(ScheduleOperation::key)
            .collect();
        for key in expired {
            self.evict(&mut rollouts, key);
        }
    }

    async fn apply_report(&self, report: StatusReport) {
        let mut rollouts = self.rollouts.write().await;
        let Some(op) = rollouts.get_mut(&report.key) else {
            debug!(rollout = %report.key, agent = report.agent, "report for untracked rollout dropped");
            return;
        };

        let outcome = op.apply(&report, Instant::now());
        if outcome == ReportOutcome::Ignored {
            return;
        }
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_report(&report) {
                error!(rollout = %report.key, error = %e, "failed to journal status report");
            }
        }
        if outcome.moved_cursor() {
            self.arm_timeouts(op);
        }
    }

    fn journal_resume(&self, key: RolloutKey) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_resume(key) {
                error!(rollout = %key, error = %e, "failed to journal resume");
            }
        }
    }

    /// Start a timeout for every current-batch agent still owing a report.
    ///
    /// A fired timeout re-enters through the status queue as an `Error`
    /// report tagged with the batch it was armed for.
    fn arm_timeouts(&self, op: &mut ScheduleOperation) {
        let timeout = op.policy().timeout;
        if timeout.is_zero() {
            return;
        }

        let key = op.key();
        let batch = op.cursor();
        let rolling_back = op.should_rollback();
        let deadline = Instant::now() + op.delay_remaining(Instant::now()).unwrap_or_default() + timeout;

        for agent in op.unarmed_agents() {
            let tx = self.status_tx.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                debug!(rollout = %key, agent, batch, "agent timed out");
                let _ = tx.send(StatusJob::Report(StatusReport::timed_out(
                    key,
                    agent,
                    batch,
                    rolling_back,
                )));
            });
            op.arm_timeout(agent, TimeoutHandle::new(task.abort_handle()));
        }
    }
}

/// Sweep often enough that nothing outlives its retention by much.
fn sweep_period(retention: Duration) -> Duration {
    (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(60))
}

/// Rebuild an operation by re-applying journaled reports and resumes in order.
fn replay(record: &RolloutRecord, now: Instant) -> ScheduleOperation {
    let mut op =
        ScheduleOperation::from_batches(record.key, record.policy.clone(), record.batches.clone());
    for (index, report) in record.reports.iter().enumerate() {
        for _ in record.resumes.iter().filter(|at| **at == index) {
            op.resume(now);
        }
        op.apply(report, now);
    }
    let tail = record.reports.len();
    for _ in record.resumes.iter().filter(|at| **at == tail) {
        op.resume(now);
    }
    op
}
