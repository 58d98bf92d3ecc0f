//! Stagger policies: how a rollout is batched and how failures are handled.
//!
//! Policies arrive from the API layer as a loosely typed [`StaggerConfig`]
//! payload and are validated into a [`StaggerPolicy`] before any rollout
//! is registered. Invalid configurations never reach the rollout pool.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether the rollout is staggered at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaggerMode {
    /// Broadcast to every agent at once. Not tracked by the rollout pool.
    AllAtOnce,
    /// Batched rollout gated on agent reports.
    Parallel,
}

/// How agents are partitioned into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchingStrategy {
    /// Every batch holds `batch_size` agents (the last may be shorter).
    Fixed { batch_size: usize },
    /// The first batch holds `start_size` agents; each later batch is
    /// `growth_factor` times wider than the previous one.
    Incremental {
        start_size: usize,
        growth_factor: usize,
    },
}

/// What to do when an agent in the current batch reports an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    Continue,
    Pause,
    Rollback,
}

/// Validated, immutable stagger policy for one rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaggerPolicy {
    pub mode: StaggerMode,
    pub batching: BatchingStrategy,
    pub failure_action: FailureAction,
    /// Per-agent report deadline. Zero disables timeouts.
    pub timeout: Duration,
    /// Minimum delay between a batch completing and the next one starting.
    pub inter_batch_delay: Duration,
}

impl StaggerPolicy {
    /// A fixed-size batched policy with no timeout and no delay.
    pub fn fixed(batch_size: usize, failure_action: FailureAction) -> Self {
        Self {
            mode: StaggerMode::Parallel,
            batching: BatchingStrategy::Fixed { batch_size },
            failure_action,
            timeout: Duration::ZERO,
            inter_batch_delay: Duration::ZERO,
        }
    }

    /// An incrementally growing policy with no timeout and no delay.
    pub fn incremental(
        start_size: usize,
        growth_factor: usize,
        failure_action: FailureAction,
    ) -> Self {
        Self {
            mode: StaggerMode::Parallel,
            batching: BatchingStrategy::Incremental {
                start_size,
                growth_factor,
            },
            failure_action,
            timeout: Duration::ZERO,
            inter_batch_delay: Duration::ZERO,
        }
    }

    /// The broadcast policy. Rollouts using it bypass the rollout pool.
    pub fn all_at_once() -> Self {
        Self {
            mode: StaggerMode::AllAtOnce,
            batching: BatchingStrategy::Fixed { batch_size: 1 },
            failure_action: FailureAction::Continue,
            timeout: Duration::ZERO,
            inter_batch_delay: Duration::ZERO,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    /// True if this policy needs orchestration by the rollout pool.
    pub fn is_staggered(&self) -> bool {
        self.mode == StaggerMode::Parallel
    }
}

/// Configuration errors, raised at validation time only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("unknown stagger mode: {0:?}")]
    UnknownMode(String),

    #[error("unknown batching strategy: {0:?}")]
    UnknownStrategy(String),

    #[error("unknown failure action: {0:?}")]
    UnknownFailureAction(String),

    #[error("{field} must be a positive integer, got {value}")]
    NonPositive { field: &'static str, value: i64 },

    #[error("{field} must be a whole number of seconds, got {value:?}")]
    MalformedDuration { field: &'static str, value: String },
}

/// Raw stagger configuration as received from an API payload.
///
/// Durations are strings of digits (seconds); `"0"` or an empty string
/// disables the corresponding feature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaggerConfig {
    /// `"all_at_once"` or `"parallel"`.
    pub mode: String,
    /// `"fixed"` or `"incremental"`.
    pub batching_strategy: String,
    pub batch_size: i64,
    pub start_size: i64,
    pub growth_factor: i64,
    /// `"continue"`, `"pause"` or `"rollback"`.
    pub failure_action: String,
    pub timeout: String,
    pub inter_batch_delay: String,
}

impl StaggerConfig {
    /// Validate the payload and produce a typed policy.
    pub fn validate(&self) -> Result<StaggerPolicy, PolicyError> {
        let mode = match normalize(&self.mode).as_str() {
            "" | "all_at_once" => StaggerMode::AllAtOnce,
            "parallel" => StaggerMode::Parallel,
            _ => return Err(PolicyError::UnknownMode(self.mode.clone())),
        };
        if mode == StaggerMode::AllAtOnce {
            return Ok(StaggerPolicy::all_at_once());
        }

        let batching = match normalize(&self.batching_strategy).as_str() {
            "fixed" => BatchingStrategy::Fixed {
                batch_size: positive("batch_size", self.batch_size)?,
            },
            "incremental" => BatchingStrategy::Incremental {
                start_size: positive("start_size", self.start_size)?,
                growth_factor: positive("growth_factor", self.growth_factor)?,
            },
            _ => {
                return Err(PolicyError::UnknownStrategy(
                    self.batching_strategy.clone(),
                ))
            }
        };

        let failure_action = match normalize(&self.failure_action).as_str() {
            "continue" => FailureAction::Continue,
            "pause" => FailureAction::Pause,
            "rollback" => FailureAction::Rollback,
            _ => {
                return Err(PolicyError::UnknownFailureAction(
                    self.failure_action.clone(),
                ))
            }
        };

        Ok(StaggerPolicy {
            mode,
            batching,
            failure_action,
            timeout: parse_duration_secs("timeout", &self.timeout)?,
            inter_batch_delay: parse_duration_secs("inter_batch_delay", &self.inter_batch_delay)?,
        })
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace('-', "_")
}

fn positive(field: &'static str, value: i64) -> Result<usize, PolicyError> {
    usize::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or(PolicyError::NonPositive { field, value })
}

/// Parse a digits-only duration in seconds. Empty means disabled.
pub fn parse_duration_secs(field: &'static str, raw: &str) -> Result<Duration, PolicyError> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(Duration::ZERO);
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PolicyError::MalformedDuration {
            field,
            value: raw.to_string(),
        });
    }
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| PolicyError::MalformedDuration {
            field,
            value: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parallel(strategy: &str) -> StaggerConfig {
        StaggerConfig {
            mode: "parallel".to_string(),
            batching_strategy: strategy.to_string(),
            batch_size: 2,
            start_size: 1,
            growth_factor: 2,
            failure_action: "continue".to_string(),
            timeout: "30".to_string(),
            inter_batch_delay: "0".to_string(),
        }
    }

    #[test]
    fn fixed_config_validates() {
        let policy = parallel("fixed").validate().unwrap();
        assert_eq!(policy.batching, BatchingStrategy::Fixed { batch_size: 2 });
        assert_eq!(policy.failure_action, FailureAction::Continue);
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert_eq!(policy.inter_batch_delay, Duration::ZERO);
        assert!(policy.is_staggered());
    }

    #[test]
    fn incremental_config_validates() {
        let mut cfg = parallel("incremental");
        cfg.failure_action = "Rollback".to_string();
        let policy = cfg.validate().unwrap();
        assert_eq!(
            policy.batching,
            BatchingStrategy::Incremental {
                start_size: 1,
                growth_factor: 2
            }
        );
        assert_eq!(policy.failure_action, FailureAction::Rollback);
    }

    #[test]
    fn all_at_once_skips_batch_validation() {
        let cfg = StaggerConfig {
            mode: "all-at-once".to_string(),
            batch_size: -4,
            ..Default::default()
        };
        let policy = cfg.validate().unwrap();
        assert!(!policy.is_staggered());
    }

    #[test]
    fn rejects_non_positive_batch_size() {
        let mut cfg = parallel("fixed");
        cfg.batch_size = 0;
        assert_eq!(
            cfg.validate(),
            Err(PolicyError::NonPositive {
                field: "batch_size",
                value: 0
            })
        );
    }

    #[test]
    fn rejects_non_positive_growth() {
        let mut cfg = parallel("incremental");
        cfg.growth_factor = -1;
        assert!(matches!(
            cfg.validate(),
            Err(PolicyError::NonPositive {
                field: "growth_factor",
                ..
            })
        ));
    }

    #[test]
    fn rejects_unknown_enums() {
        let mut cfg = parallel("fixed");
        cfg.mode = "serial".to_string();
        assert!(matches!(cfg.validate(), Err(PolicyError::UnknownMode(_))));

        let cfg = parallel("exponential");
        assert!(matches!(cfg.validate(), Err(PolicyError::UnknownStrategy(_))));

        let mut cfg = parallel("fixed");
        cfg.failure_action = "retry".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(PolicyError::UnknownFailureAction(_))
        ));
    }

    #[test]
    fn rejects_malformed_durations() {
        let mut cfg = parallel("fixed");
        cfg.timeout = "5m".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(PolicyError::MalformedDuration { field: "timeout", .. })
        ));

        let mut cfg = parallel("fixed");
        cfg.inter_batch_delay = "-3".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(PolicyError::MalformedDuration {
                field: "inter_batch_delay",
                ..
            })
        ));
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration_secs("t", "").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration_secs("t", "0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration_secs("t", " 90 ").unwrap(), Duration::from_secs(90));
        assert!(parse_duration_secs("t", "1.5").is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: StaggerConfig = serde_json::from_str(
            r#"{"mode":"parallel","batching_strategy":"fixed","batch_size":3,"failure_action":"pause"}"#,
        )
        .unwrap();
        let policy = cfg.validate().unwrap();
        assert_eq!(policy.batching, BatchingStrategy::Fixed { batch_size: 3 });
        assert_eq!(policy.failure_action, FailureAction::Pause);
        assert_eq!(policy.timeout, Duration::ZERO);
    }
}
