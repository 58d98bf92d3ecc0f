//! redb table definitions for the FleetGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Numeric ids are zero-padded so that lexical key order matches numeric order.

use redb::TableDefinition;

/// Shape shared by every table: string key, JSON value.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Stack records keyed by `{stack_id}`.
pub const STACKS: JsonTable = TableDefinition::new("stacks");

/// Agent records keyed by `{agent_id}`.
pub const AGENTS: JsonTable = TableDefinition::new("agents");

/// Pending agent commands keyed by `{agent_id}:{stack_id}`.
pub const COMMANDS: JsonTable = TableDefinition::new("commands");

/// Rollout journals keyed by `{stack_id}:{generation}`.
pub const ROLLOUTS: JsonTable = TableDefinition::new("rollouts");
