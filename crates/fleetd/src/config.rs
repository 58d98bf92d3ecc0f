//! fleetd.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fleetgrid_rollout::{AgentId, CheckinIntervals, CoordinatorConfig, StackId};
use fleetgrid_state::{AgentMode, AgentRecord, StackRecord, StateStore, epoch_secs};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetdConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub stacks: Vec<StackEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8443 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    /// Poll period for async agents with no check-in interval configured.
    pub default_checkin_secs: u64,
    pub min_tick_ms: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            default_checkin_secs: 10,
            min_tick_ms: 1000,
        }
    }
}

impl CoordinatorSection {
    pub fn to_config(&self) -> CoordinatorConfig {
        let min_tick = Duration::from_millis(self.min_tick_ms.max(1));
        CoordinatorConfig {
            default_tick: Duration::from_secs(self.default_checkin_secs).max(min_tick),
            min_tick,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Seconds a finished rollout stays queryable before it is evicted.
    pub retention_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
        }
    }
}

impl PoolSection {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs.max(1))
    }
}

/// Agent inventory entry seeded into the store at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default)]
    pub intervals: CheckinIntervals,
}

/// Stack inventory entry seeded into the store at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackEntry {
    pub id: StackId,
    pub name: String,
    #[serde(default = "first_version")]
    pub version: u64,
    #[serde(default)]
    pub groups: Vec<String>,
}

fn first_version() -> u64 {
    1
}

impl FleetdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetdConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Write the inventory into the store.
    ///
    /// Agents keep their last check-in. Stacks already in the store keep
    /// their version pointers; only name and groups are refreshed.
    pub fn seed(&self, store: &StateStore) -> anyhow::Result<()> {
        for entry in &self.agents {
            let last_checkin = store.get_agent(entry.id)?.and_then(|a| a.last_checkin);
            store.put_agent(&AgentRecord {
                id: entry.id,
                name: entry.name.clone(),
                groups: entry.groups.clone(),
                mode: entry.mode,
                intervals: entry.intervals,
                last_checkin,
            })?;
        }

        for entry in &self.stacks {
            let record = match store.get_stack(entry.id)? {
                Some(existing) => StackRecord {
                    name: entry.name.clone(),
                    groups: entry.groups.clone(),
                    ..existing
                },
                None => StackRecord {
                    id: entry.id,
                    name: entry.name.clone(),
                    file_version: entry.version,
                    previous_deployment: None,
                    groups: entry.groups.clone(),
                    updated_at: epoch_secs(),
                },
            };
            debug!(stack = record.id, version = record.file_version, "stack seeded");
            store.put_stack(&record)?;
        }

        info!(
            agents = self.agents.len(),
            stacks = self.stacks.len(),
            "inventory seeded"
        );
        Ok(())
    }
}
