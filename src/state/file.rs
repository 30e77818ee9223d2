//! State store backed by a JSON file in a state directory.
//!
//! Layout under the directory:
//! - `state.json`: all records, rewritten through a temp file and rename on every write.
//! - `state.lock`: created exclusively by the lock holder; contains the run id.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{StateStore, check_version};
use crate::error::StateError;
use crate::types::{StateRecord, StateSnapshot};

/// Default filename for records under the state directory.
pub const STATE_FILENAME: &str = "state.json";

/// Default filename for the run lock under the state directory.
pub const LOCK_FILENAME: &str = "state.lock";

const FORMAT_VERSION: u32 = 1;

/// Root structure for state.json.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
  format: u32,
  records: StateSnapshot,
}

/// File-backed state store.
#[derive(Debug)]
pub struct FileStateStore {
  dir: PathBuf,
  /// Serializes read-modify-write cycles within this process.
  write_guard: Mutex<()>,
}

impl FileStateStore {
  /// Opens (creating if needed) a state directory.
  pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
    let dir = dir.into();
    tokio::fs::create_dir_all(&dir).await?;
    Ok(Self {
      dir,
      write_guard: Mutex::new(()),
    })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  fn state_path(&self) -> PathBuf {
    self.dir.join(STATE_FILENAME)
  }

  fn lock_path(&self) -> PathBuf {
    self.dir.join(LOCK_FILENAME)
  }

  #[instrument(level = "trace", skip(self))]
  async fn load(&self) -> Result<StateFile, StateError> {
    match tokio::fs::read(self.state_path()).await {
      Ok(bytes) => {
        serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt(e.to_string()))
      }
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(StateFile {
        format: FORMAT_VERSION,
        records: StateSnapshot::new(),
      }),
      Err(e) => Err(e.into()),
    }
  }

  #[instrument(level = "trace", skip(self, file))]
  async fn save(&self, file: &StateFile) -> Result<(), StateError> {
    let json =
      serde_json::to_vec_pretty(file).map_err(|e| StateError::Corrupt(e.to_string()))?;
    let tmp = self.dir.join(format!("{}.tmp", STATE_FILENAME));
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, self.state_path()).await?;
    Ok(())
  }
}

#[async_trait]
impl StateStore for FileStateStore {
  async fn snapshot(&self) -> Result<StateSnapshot, StateError> {
    Ok(self.load().await?.records)
  }

  async fn get(&self, id: &str) -> Result<Option<StateRecord>, StateError> {
    Ok(self.load().await?.records.remove(id))
  }

  async fn try_lock(&self, run_id: &str) -> Result<bool, StateError> {
    let opened = tokio::fs::OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(self.lock_path())
      .await;
    match opened {
      Ok(mut f) => {
        f.write_all(run_id.as_bytes()).await?;
        f.flush().await?;
        debug!(run_id, path = %self.lock_path().display(), "state lock acquired");
        Ok(true)
      }
      Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
      Err(e) => Err(e.into()),
    }
  }

  async fn unlock(&self, run_id: &str) -> Result<(), StateError> {
    if self.lock_holder().await?.as_deref() != Some(run_id) {
      return Err(StateError::NotLockHolder(run_id.to_string()));
    }
    tokio::fs::remove_file(self.lock_path()).await?;
    debug!(run_id, "state lock released");
    Ok(())
  }

  async fn lock_holder(&self) -> Result<Option<String>, StateError> {
    match tokio::fs::read_to_string(self.lock_path()).await {
      Ok(s) => Ok(Some(s.trim().to_string())),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  async fn commit(&self, id: &str, mut record: StateRecord) -> Result<u64, StateError> {
    let _guard = self.write_guard.lock().await;
    let mut file = self.load().await?;
    check_version(id, file.records.get(id), record.version)?;
    record.version += 1;
    let version = record.version;
    file.records.insert(id.to_string(), record);
    file.format = FORMAT_VERSION;
    self.save(&file).await?;
    Ok(version)
  }

  async fn remove(&self, id: &str, version: u64) -> Result<(), StateError> {
    let _guard = self.write_guard.lock().await;
    let mut file = self.load().await?;
    check_version(id, file.records.get(id), version)?;
    file.records.remove(id);
    self.save(&file).await
  }
}
