//! Durable last-applied state with an exclusive run lock.
//!
//! Every write carries the version the writer last read; the store rejects stale writes and
//! assigns `version + 1`. The lock is non-reentrant and never queues: a second `try_lock`
//! returns `false` until the holder unlocks.

use async_trait::async_trait;

use crate::error::StateError;
use crate::types::{StateRecord, StateSnapshot};

mod file;
mod memory;

pub use file::{FileStateStore, LOCK_FILENAME, STATE_FILENAME};
pub use memory::MemoryStateStore;

#[async_trait]
pub trait StateStore: Send + Sync {
  /// All records, read in one consistent pass.
  async fn snapshot(&self) -> Result<StateSnapshot, StateError>;

  async fn get(&self, id: &str) -> Result<Option<StateRecord>, StateError>;

  /// Takes the lock for `run_id`. Returns `false` if anyone holds it, including `run_id`.
  async fn try_lock(&self, run_id: &str) -> Result<bool, StateError>;

  /// Releases the lock. Fails if `run_id` is not the holder.
  async fn unlock(&self, run_id: &str) -> Result<(), StateError>;

  async fn lock_holder(&self) -> Result<Option<String>, StateError>;

  /// Writes `record` for `id` if `record.version` matches the stored version (0 when absent).
  /// Returns the new version.
  async fn commit(&self, id: &str, record: StateRecord) -> Result<u64, StateError>;

  /// Removes the record for `id` if its stored version equals `version`.
  async fn remove(&self, id: &str, version: u64) -> Result<(), StateError>;
}

/// Optimistic version check shared by store implementations.
pub(crate) fn check_version(
  id: &str,
  stored: Option<&StateRecord>,
  expected: u64,
) -> Result<(), StateError> {
  let stored = stored.map(|r| r.version).unwrap_or(0);
  if stored != expected {
    return Err(StateError::VersionConflict {
      id: id.to_string(),
      expected,
      stored,
    });
  }
  Ok(())
}
