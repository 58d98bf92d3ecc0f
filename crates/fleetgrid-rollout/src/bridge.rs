//! Status bridge: forwards agent-reported deployment status into the pool.
//!
//! Agents report a rich set of deployment states. Only terminal ones
//! (running, error, rolled back) move a rollout; everything else is
//! progress chatter and is dropped here.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RolloutResult;
use crate::pool::RolloutPool;
use crate::types::{AgentId, AgentRolloutStatus, RolloutKey, StackId};

/// Deployment state as reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Acknowledged,
    ImagesPulled,
    Deploying,
    Running,
    Error,
    RollingBack,
    RolledBack,
    Removing,
    Removed,
}

/// One status report received from an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub stack_id: StackId,
    pub agent: AgentId,
    pub status: DeploymentStatus,
    /// Stack version the status refers to.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Glue between the agent-facing layer and the rollout pool.
#[derive(Clone)]
pub struct StatusBridge {
    pool: RolloutPool,
}

impl StatusBridge {
    pub fn new(pool: RolloutPool) -> Self {
        Self { pool }
    }

    /// Forward a qualifying report. Returns how many rollouts it was sent to.
    ///
    /// A report about a version older than a rollout that is rolling back
    /// is the agent confirming (or failing) its revert, and is routed to
    /// that rollout with the version as rollback hint.
    pub async fn forward(&self, report: &AgentReport) -> RolloutResult<usize> {
        let status = match report.status {
            DeploymentStatus::Running | DeploymentStatus::RolledBack => AgentRolloutStatus::Running,
            DeploymentStatus::Error => AgentRolloutStatus::Error,
            other => {
                debug!(stack = report.stack_id, agent = report.agent, status = ?other, "non-terminal status not forwarded");
                return Ok(0);
            }
        };

        let reverting: Vec<RolloutKey> = self
            .pool
            .rolling_back(report.stack_id)
            .await
            .into_iter()
            .filter(|key| key.generation > report.version)
            .collect();

        if !reverting.is_empty() || report.status == DeploymentStatus::RolledBack {
            for key in &reverting {
                self.pool
                    .report_status(*key, report.agent, status, Some(report.version))?;
            }
            debug!(
                stack = report.stack_id,
                agent = report.agent,
                rollouts = reverting.len(),
                "rollback report forwarded"
            );
            return Ok(reverting.len());
        }

        // The version rides along as hint so that a late report about the
        // rollout's own version is not taken as a revert if the rollout
        // turned into a rollback in the meantime.
        let key = RolloutKey::new(report.stack_id, report.version);
        self.pool
            .report_status(key, report.agent, status, Some(report.version))?;
        debug!(rollout = %key, agent = report.agent, ?status, "status forwarded");
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::watch;

    use super::*;
    use crate::strategy::{FailureAction, StaggerPolicy};

    fn report(agent: AgentId, status: DeploymentStatus, version: u64) -> AgentReport {
        AgentReport {
            stack_id: 5,
            agent,
            status,
            version,
            message: None,
        }
    }

    #[tokio::test]
    async fn forwards_terminal_statuses() {
        let (_tx, rx) = watch::channel(false);
        let (pool, _h) = RolloutPool::spawn(rx);
        let key = RolloutKey::new(5, 2);
        pool.register(key, StaggerPolicy::fixed(2, FailureAction::Continue), vec![1, 2])
            .await
            .unwrap();

        let bridge = StatusBridge::new(pool.clone());
        assert_eq!(bridge.forward(&report(1, DeploymentStatus::Deploying, 2)).await.unwrap(), 0);
        assert_eq!(bridge.forward(&report(1, DeploymentStatus::Running, 2)).await.unwrap(), 1);
        assert_eq!(bridge.forward(&report(2, DeploymentStatus::Error, 2)).await.unwrap(), 1);
        pool.sync().await.unwrap();

        assert!(pool.is_completed(key).await);
    }

    #[tokio::test]
    async fn routes_reverts_to_rolling_back_generation() {
        let (_tx, rx) = watch::channel(false);
        let (pool, _h) = RolloutPool::spawn(rx);
        let key = RolloutKey::new(5, 3);
        pool.register(key, StaggerPolicy::fixed(2, FailureAction::Rollback), vec![1, 2])
            .await
            .unwrap();

        let bridge = StatusBridge::new(pool.clone());
        bridge.forward(&report(1, DeploymentStatus::Error, 3)).await.unwrap();
        pool.sync().await.unwrap();
        assert!(pool.should_rollback(key).await);

        // Agent 1 reverted to version 2; agent 2 confirms it is running version 2.
        assert_eq!(bridge.forward(&report(1, DeploymentStatus::RolledBack, 2)).await.unwrap(), 1);
        assert_eq!(bridge.forward(&report(2, DeploymentStatus::Running, 2)).await.unwrap(), 1);
        pool.sync().await.unwrap();

        assert!(pool.is_completed(key).await);
        assert!(pool.was_rolled_back(key, 1).await);
        assert!(pool.was_rolled_back(key, 2).await);
        assert_eq!(pool.rollback_target(key).await, Some(2));
    }

    #[tokio::test]
    async fn late_forward_report_is_not_a_revert() {
        let (_tx, rx) = watch::channel(false);
        let (pool, _h) = RolloutPool::spawn(rx);
        let key = RolloutKey::new(5, 3);
        pool.register(key, StaggerPolicy::fixed(2, FailureAction::Rollback), vec![1, 2])
            .await
            .unwrap();

        let bridge = StatusBridge::new(pool.clone());
        bridge.forward(&report(1, DeploymentStatus::Error, 3)).await.unwrap();
        // Agent 2 finishes deploying version 3 after the rollback began.
        bridge.forward(&report(2, DeploymentStatus::Running, 3)).await.unwrap();
        pool.sync().await.unwrap();

        assert!(pool.should_rollback(key).await);
        assert!(!pool.was_rolled_back(key, 2).await);
        assert!(pool.can_proceed(key, 2).await);

        bridge.forward(&report(2, DeploymentStatus::RolledBack, 2)).await.unwrap();
        pool.sync().await.unwrap();
        assert!(pool.was_rolled_back(key, 2).await);
    }

    #[tokio::test]
    async fn rolled_back_without_rollback_is_dropped() {
        let (_tx, rx) = watch::channel(false);
        let (pool, _h) = RolloutPool::spawn(rx);
        let bridge = StatusBridge::new(pool);
        assert_eq!(bridge.forward(&report(1, DeploymentStatus::RolledBack, 1)).await.unwrap(), 0);
    }
}
