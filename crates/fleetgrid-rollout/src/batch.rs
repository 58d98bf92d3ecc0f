//! Queue builder: partitions an ordered agent list into rollout batches.
//!
//! Both builders preserve input order, never duplicate or drop an agent,
//! and assume parameters were validated by [`StaggerConfig::validate`].
//!
//! [`StaggerConfig::validate`]: crate::strategy::StaggerConfig::validate

use crate::strategy::BatchingStrategy;
use crate::types::AgentId;

/// Build the batch queue for a strategy.
pub fn build_batches(agents: &[AgentId], strategy: &BatchingStrategy) -> Vec<Vec<AgentId>> {
    match *strategy {
        BatchingStrategy::Fixed { batch_size } => build_fixed_batches(agents, batch_size),
        BatchingStrategy::Incremental {
            start_size,
            growth_factor,
        } => build_incremental_batches(agents, start_size, growth_factor),
    }
}

/// Consecutive chunks of `batch_size`; the final chunk may be shorter.
pub fn build_fixed_batches(agents: &[AgentId], batch_size: usize) -> Vec<Vec<AgentId>> {
    agents.chunks(batch_size.max(1)).map(<[AgentId]>::to_vec).collect()
}

/// Geometrically growing batches: `start`, `start * growth`, ...
///
/// The final batch takes whatever remains.
pub fn build_incremental_batches(
    agents: &[AgentId],
    start_size: usize,
    growth_factor: usize,
) -> Vec<Vec<AgentId>> {
    let growth = growth_factor.max(1);
    let mut width = start_size.max(1);
    let mut rest = agents;
    let mut batches = Vec::new();

    while !rest.is_empty() {
        let (head, tail) = rest.split_at(width.min(rest.len()));
        batches.push(head.to_vec());
        rest = tail;
        width = width.saturating_mul(growth);
    }

    batches
}
