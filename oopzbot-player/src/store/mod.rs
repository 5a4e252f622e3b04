//! Shared state store
//!
//! The cross-process surface of the playback core: JSON documents under
//! fixed keys plus an append/pop command list. Presentation layers read the
//! documents and push commands; the core publishes state and pops commands.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Current track document
pub const KEY_CURRENT: &str = "current";
/// Pending queue document
pub const KEY_QUEUE: &str = "queue";
/// Canonical PlayState document
pub const KEY_PLAY_STATE: &str = "play_state";

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn put(&self, key: &str, value: &Value) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Append one encoded command to the tail of the command list
    async fn push_command(&self, body: &str) -> Result<()>;

    /// Remove and return the head of the command list, waiting up to `wait`
    /// for one to arrive. `Ok(None)` when the wait elapsed.
    async fn pop_command(&self, wait: Duration) -> Result<Option<String>>;

    /// Wait up to `wait` for the published play_state revision to exceed
    /// `after`; returns the revision seen, `None` on timeout.
    async fn wait_revision(&self, after: u64, wait: Duration) -> Result<Option<u64>>;
}

/// Revision field of a play_state document
pub(crate) fn revision_of(value: &Value) -> Option<u64> {
    value.get("revision").and_then(Value::as_u64)
}
