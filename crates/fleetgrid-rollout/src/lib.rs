//! FleetGrid staggered rollouts.
//!
//! This crate drives a phased update of a stack across a population of
//! remote agents. Agents are partitioned into ordered batches; each batch
//! must report back before the next one may receive its update command.
//! Failures are routed through the rollout's failure action (continue,
//! pause, or rollback).
//!
//! # Components
//!
//! - **`batch`**: Queue builder (fixed and incremental batches)
//! - **`strategy`**: Stagger policy, raw config payload and validation
//! - **`schedule`**: Per-rollout state machine (`ScheduleOperation`)
//! - **`pool`**: Single-writer actor owning every schedule operation
//! - **`coordinator`**: Per-agent polling tasks for self-scheduling agents
//! - **`bridge`**: Forwards agent-reported deployment status to the pool
//! - **`ports`**: Contracts for the command outbox, stack store, group
//!   resolver and rollout journal
//!
//! # Architecture
//!
//! ```text
//! StatusBridge ──► RolloutPool worker ──► ScheduleOperation (per RolloutKey)
//!                       ▲    │
//!       register ───────┘    └──► RwLock<HashMap> snapshots ◄── queries
//!                                              ▲
//! FleetCoordinator ── per-agent ticker ────────┘──► CommandOutbox
//! ```

pub mod batch;
pub mod bridge;
pub mod coordinator;
pub mod error;
pub mod pool;
pub mod ports;
pub mod schedule;
pub mod strategy;
pub mod types;

pub use batch::{build_batches, build_fixed_batches, build_incremental_batches};
pub use bridge::{AgentReport, DeploymentStatus, StatusBridge};
pub use coordinator::{AsyncAgent, CheckinIntervals, CoordinatorConfig, FleetCoordinator};
pub use error::{RolloutError, RolloutResult};
pub use pool::{PoolWorker, RolloutPool};
pub use ports::{CommandOutbox, GroupResolver, RolloutJournal, RolloutRecord, StackStore};
pub use schedule::{ReportOutcome, RolloutPhase, RolloutSnapshot, ScheduleOperation};
pub use strategy::{
    BatchingStrategy, FailureAction, PolicyError, StaggerConfig, StaggerMode, StaggerPolicy,
};
pub use types::{AgentId, AgentRolloutStatus, ReportOrigin, RolloutKey, StackId, StatusReport};
