//! In-process state store.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{StateStore, check_version};
use crate::error::StateError;
use crate::types::{StateRecord, StateSnapshot};

#[derive(Debug, Default)]
struct Inner {
  records: StateSnapshot,
  lock: Option<String>,
}

/// State store kept in memory. Lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
  inner: Mutex<Inner>,
}

impl MemoryStateStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store pre-populated with `records` (versions kept as given).
  pub fn with_records(records: StateSnapshot) -> Self {
    Self {
      inner: Mutex::new(Inner {
        records,
        lock: None,
      }),
    }
  }

  fn inner(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[async_trait]
impl StateStore for MemoryStateStore {
  async fn snapshot(&self) -> Result<StateSnapshot, StateError> {
    Ok(self.inner().records.clone())
  }

  async fn get(&self, id: &str) -> Result<Option<StateRecord>, StateError> {
    Ok(self.inner().records.get(id).cloned())
  }

  async fn try_lock(&self, run_id: &str) -> Result<bool, StateError> {
    let mut inner = self.inner();
    if inner.lock.is_some() {
      return Ok(false);
    }
    inner.lock = Some(run_id.to_string());
    debug!(run_id, "state lock acquired");
    Ok(true)
  }

  async fn unlock(&self, run_id: &str) -> Result<(), StateError> {
    let mut inner = self.inner();
    if inner.lock.as_deref() != Some(run_id) {
      return Err(StateError::NotLockHolder(run_id.to_string()));
    }
    inner.lock = None;
    debug!(run_id, "state lock released");
    Ok(())
  }

  async fn lock_holder(&self) -> Result<Option<String>, StateError> {
    Ok(self.inner().lock.clone())
  }

  async fn commit(&self, id: &str, mut record: StateRecord) -> Result<u64, StateError> {
    let mut inner = self.inner();
    check_version(id, inner.records.get(id), record.version)?;
    record.version += 1;
    let version = record.version;
    inner.records.insert(id.to_string(), record);
    Ok(version)
  }

  async fn remove(&self, id: &str, version: u64) -> Result<(), StateError> {
    let mut inner = self.inner();
    check_version(id, inner.records.get(id), version)?;
    inner.records.remove(id);
    Ok(())
  }
}
