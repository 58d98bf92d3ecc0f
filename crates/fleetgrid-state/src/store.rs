//! StateStore: redb-backed state persistence for FleetGrid.
//!
//! Provides typed CRUD operations over stacks, agents, pending commands and
//! rollout journals. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use fleetgrid_rollout::{AgentId, RolloutKey, RolloutRecord, StackId, StatusReport};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(STACKS).map_err(map_err!(Table))?;
        txn.open_table(AGENTS).map_err(map_err!(Table))?;
        txn.open_table(COMMANDS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(
        &self,
        table: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every value whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write of one value inside a single write transaction.
    ///
    /// Returns `false` without writing when the key is absent.
    fn update<T, F>(
        &self,
        table: JsonTable,
        key: &str,
        f: F,
    ) -> StateResult<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let found;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            found = current.is_some();
            if let Some(mut value) = current {
                f(&mut value);
                let bytes = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
                table
                    .insert(key, bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(found)
    }

    // ── Stacks ─────────────────────────────────────────────────────

    /// Insert or update a stack record.
    pub fn put_stack(&self, stack: &StackRecord) -> StateResult<()> {
        self.put(STACKS, &stack.table_key(), stack)?;
        debug!(stack = stack.id, version = stack.file_version, "stack stored");
        Ok(())
    }

    pub fn get_stack(&self, id: StackId) -> StateResult<Option<StackRecord>> {
        self.get(STACKS, &stack_key(id))
    }

    /// List all stacks, ordered by id.
    pub fn list_stacks(&self) -> StateResult<Vec<StackRecord>> {
        self.scan(STACKS, "")
    }

    /// Move a stack to `version`, remembering the current one as the
    /// previous deployment. Lower or equal versions leave it untouched.
    pub fn bump_stack_version(&self, id: StackId, version: u64) -> StateResult<StackRecord> {
        let now = epoch_secs();
        let found = self.update(STACKS, &stack_key(id), |stack: &mut StackRecord| {
            if version > stack.file_version {
                stack.previous_deployment = Some(DeploymentInfo {
                    file_version: stack.file_version,
                    deployed_at: stack.updated_at,
                });
                stack.file_version = version;
                stack.updated_at = now;
            }
        })?;
        if !found {
            return Err(StateError::NotFound(format!("stack {id}")));
        }
        let stack = self
            .get_stack(id)?
            .ok_or_else(|| StateError::NotFound(format!("stack {id}")))?;
        debug!(stack = id, version = stack.file_version, "stack version bumped");
        Ok(stack)
    }

    // ── Agents ─────────────────────────────────────────────────────

    /// Insert or update an agent record.
    pub fn put_agent(&self, agent: &AgentRecord) -> StateResult<()> {
        self.put(AGENTS, &agent.table_key(), agent)
    }

    pub fn get_agent(&self, id: AgentId) -> StateResult<Option<AgentRecord>> {
        self.get(AGENTS, &agent_key(id))
    }

    /// List all agents, ordered by id.
    pub fn list_agents(&self) -> StateResult<Vec<AgentRecord>> {
        self.scan(AGENTS, "")
    }

    /// Agents belonging to at least one of `groups`, ordered by id.
    pub fn list_agents_in_groups(&self, groups: &[String]) -> StateResult<Vec<AgentRecord>> {
        let agents = self.list_agents()?;
        Ok(agents
            .into_iter()
            .filter(|a| a.groups.iter().any(|g| groups.contains(g)))
            .collect())
    }

    /// Stamp an agent's check-in time. Unknown agents are ignored.
    pub fn touch_agent(&self, id: AgentId) -> StateResult<bool> {
        let now = epoch_secs();
        self.update(AGENTS, &agent_key(id), |agent: &mut AgentRecord| {
            agent.last_checkin = Some(now);
        })
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Insert or replace the pending command for an agent and stack.
    pub fn put_command(&self, command: &StackCommand) -> StateResult<()> {
        self.put(COMMANDS, &command.table_key(), command)?;
        debug!(
            agent = command.agent,
            stack = command.stack,
            operation = ?command.operation,
            version = ?command.version,
            "command queued"
        );
        Ok(())
    }

    pub fn get_command(&self, agent: AgentId, stack: StackId) -> StateResult<Option<StackCommand>> {
        self.get(COMMANDS, &command_key(agent, stack))
    }

    /// Pending commands for an agent, ordered by stack.
    pub fn list_commands_for_agent(&self, agent: AgentId) -> StateResult<Vec<StackCommand>> {
        self.scan(COMMANDS, &format!("{}:", agent_key(agent)))
    }

    /// Remove the pending command for an agent and stack, typically once
    /// it was delivered. Returns true if one existed.
    pub fn delete_command(&self, agent: AgentId, stack: StackId) -> StateResult<bool> {
        let existed = self.delete(COMMANDS, &command_key(agent, stack))?;
        debug!(agent, stack, existed, "command removed");
        Ok(existed)
    }

    // ── Rollout journals ───────────────────────────────────────────

    pub fn put_rollout(&self, record: &RolloutRecord) -> StateResult<()> {
        self.put(ROLLOUTS, &record.key.table_key(), record)
    }

    pub fn get_rollout(&self, key: RolloutKey) -> StateResult<Option<RolloutRecord>> {
        self.get(ROLLOUTS, &key.table_key())
    }

    /// All rollout journals, ordered by stack then generation.
    pub fn list_rollouts(&self) -> StateResult<Vec<RolloutRecord>> {
        self.scan(ROLLOUTS, "")
    }

    /// Append an applied report. Reports for unknown rollouts are ignored.
    pub fn append_rollout_report(&self, report: &StatusReport) -> StateResult<bool> {
        let report = report.clone();
        self.update(ROLLOUTS, &report.key.table_key(), |record: &mut RolloutRecord| {
            record.reports.push(report);
        })
    }

    /// Mark an operator resume at the current end of the report log.
    pub fn append_rollout_resume(&self, key: RolloutKey) -> StateResult<bool> {
        self.update(ROLLOUTS, &key.table_key(), |record: &mut RolloutRecord| {
            let at = record.reports.len();
            record.resumes.push(at);
        })
    }

    pub fn delete_rollout(&self, key: RolloutKey) -> StateResult<bool> {
        let existed = self.delete(ROLLOUTS, &key.table_key())?;
        debug!(rollout = %key, existed, "rollout journal deleted");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_rollout::{AgentRolloutStatus, CheckinIntervals, FailureAction, StaggerPolicy};

    fn test_stack(id: StackId, version: u64) -> StackRecord {
        StackRecord {
            id,
            name: format!("stack-{id}"),
            file_version: version,
            previous_deployment: None,
            groups: vec!["edge".to_string()],
            updated_at: 1000,
        }
    }

    fn test_agent(id: AgentId, groups: &[&str]) -> AgentRecord {
        AgentRecord {
            id,
            name: format!("agent-{id}"),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            mode: AgentMode::Standard,
            intervals: CheckinIntervals::default(),
            last_checkin: None,
        }
    }

    fn test_command(agent: AgentId, stack: StackId, version: Option<u64>) -> StackCommand {
        StackCommand {
            agent,
            stack,
            operation: CommandOperation::Deploy,
            version,
            created_at: 1000,
        }
    }

    fn test_record(stack: StackId, generation: u64) -> RolloutRecord {
        RolloutRecord {
            key: RolloutKey::new(stack, generation),
            policy: StaggerPolicy::fixed(2, FailureAction::Pause),
            batches: vec![vec![1, 2], vec![3]],
            reports: Vec::new(),
            resumes: Vec::new(),
        }
    }

    // ── Stack CRUD ─────────────────────────────────────────────────

    #[test]
    fn stack_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let stack = test_stack(1, 3);

        store.put_stack(&stack).unwrap();
        assert_eq!(store.get_stack(1).unwrap(), Some(stack));
        assert!(store.get_stack(2).unwrap().is_none());
    }

    #[test]
    fn stacks_list_in_numeric_order() {
        let store = StateStore::open_in_memory().unwrap();
        for id in [10, 2, 1] {
            store.put_stack(&test_stack(id, 1)).unwrap();
        }
        let ids: Vec<StackId> = store.list_stacks().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 10]);
    }

    #[test]
    fn bump_version_records_previous_deployment() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_stack(&test_stack(1, 3)).unwrap();

        let stack = store.bump_stack_version(1, 4).unwrap();
        assert_eq!(stack.file_version, 4);
        assert_eq!(
            stack.previous_deployment,
            Some(DeploymentInfo {
                file_version: 3,
                deployed_at: 1000
            })
        );

        // Not newer: unchanged.
        let stack = store.bump_stack_version(1, 4).unwrap();
        assert_eq!(stack.previous_deployment.unwrap().file_version, 3);
    }

    #[test]
    fn bump_version_of_missing_stack_fails() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            store.bump_stack_version(9, 1),
            Err(StateError::NotFound(_))
        ));
    }

    // ── Agents ─────────────────────────────────────────────────────

    #[test]
    fn agents_filtered_by_group() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_agent(&test_agent(3, &["edge", "eu"])).unwrap();
        store.put_agent(&test_agent(1, &["edge"])).unwrap();
        store.put_agent(&test_agent(2, &["lab"])).unwrap();

        let groups = vec!["edge".to_string(), "eu".to_string()];
        let ids: Vec<AgentId> = store
            .list_agents_in_groups(&groups)
            .unwrap()
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn touch_agent_stamps_checkin() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_agent(&test_agent(1, &[])).unwrap();
        assert!(store.touch_agent(1).unwrap());
        assert!(store.get_agent(1).unwrap().unwrap().last_checkin.is_some());
        assert!(!store.touch_agent(2).unwrap());
    }

    #[test]
    fn async_agent_view() {
        let mut agent = test_agent(4, &[]);
        assert!(agent.as_async().is_none());
        agent.mode = AgentMode::Async;
        agent.intervals.ping_secs = 60;
        let view = agent.as_async().unwrap();
        assert_eq!(view.id, 4);
        assert_eq!(view.intervals.ping_secs, 60);
    }

    // ── Commands ───────────────────────────────────────────────────

    #[test]
    fn command_replaces_previous_for_same_stack() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_command(&test_command(1, 5, None)).unwrap();
        store.put_command(&test_command(1, 5, Some(4))).unwrap();
        store.put_command(&test_command(1, 6, None)).unwrap();
        store.put_command(&test_command(2, 5, None)).unwrap();

        let pending = store.list_commands_for_agent(1).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(store.get_command(1, 5).unwrap().unwrap().version, Some(4));
    }

    #[test]
    fn delete_command_only_touches_that_pair() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_command(&test_command(1, 5, None)).unwrap();
        store.put_command(&test_command(1, 6, None)).unwrap();
        store.put_command(&test_command(10, 5, None)).unwrap();

        assert!(store.delete_command(1, 5).unwrap());
        assert!(!store.delete_command(1, 5).unwrap());
        assert_eq!(store.list_commands_for_agent(1).unwrap().len(), 1);
        assert_eq!(store.list_commands_for_agent(10).unwrap().len(), 1);
    }

    // ── Rollout journals ───────────────────────────────────────────

    #[test]
    fn rollout_journal_appends() {
        let store = StateStore::open_in_memory().unwrap();
        let record = test_record(1, 7);
        store.put_rollout(&record).unwrap();

        let report =
            StatusReport::from_agent(record.key, 1, AgentRolloutStatus::Running, None);
        assert!(store.append_rollout_report(&report).unwrap());
        assert!(store.append_rollout_resume(record.key).unwrap());

        let loaded = store.get_rollout(record.key).unwrap().unwrap();
        assert_eq!(loaded.reports, vec![report]);
        assert_eq!(loaded.resumes, vec![1]);

        let unknown =
            StatusReport::from_agent(RolloutKey::new(2, 1), 1, AgentRolloutStatus::Running, None);
        assert!(!store.append_rollout_report(&unknown).unwrap());
    }

    #[test]
    fn rollouts_list_in_key_order() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_rollout(&test_record(10, 1)).unwrap();
        store.put_rollout(&test_record(1, 10)).unwrap();
        store.put_rollout(&test_record(2, 3)).unwrap();
        store.put_rollout(&test_record(1, 9)).unwrap();

        let keys: Vec<RolloutKey> = store.list_rollouts().unwrap().iter().map(|r| r.key).collect();
        assert_eq!(
            keys,
            vec![
                RolloutKey::new(1, 9),
                RolloutKey::new(1, 10),
                RolloutKey::new(2, 3),
                RolloutKey::new(10, 1),
            ]
        );

        assert!(store.delete_rollout(RolloutKey::new(1, 9)).unwrap());
        assert_eq!(store.list_rollouts().unwrap().len(), 3);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_stack(&test_stack(1, 2)).unwrap();
            store.put_rollout(&test_record(1, 2)).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_stack(1).unwrap().unwrap().file_version, 2);
        assert_eq!(store.list_rollouts().unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_stacks().unwrap().is_empty());
        assert!(store.list_agents().unwrap().is_empty());
        assert!(store.list_rollouts().unwrap().is_empty());
        assert!(store.list_commands_for_agent(1).unwrap().is_empty());
        assert!(!store.delete_rollout(RolloutKey::new(1, 1)).unwrap());
    }
}
