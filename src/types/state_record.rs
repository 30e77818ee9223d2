//! Durable per-resource record of what was last applied.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ResourceKind, ResourceStatus};

/// Snapshot of all records keyed by resource id.
pub type StateSnapshot = BTreeMap<String, StateRecord>;

/// Durable per-resource record of what was last applied.
///
/// `version` is assigned by the state store on every write; callers pass the version they read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
  pub kind: ResourceKind,
  /// Hash of the last successfully applied configuration (empty if never applied).
  pub config_hash: String,
  /// Provider-assigned identifier of the external resource.
  pub handle: Option<String>,
  pub status: ResourceStatus,
  /// Dependencies at apply time, used to order deletes once the definition is gone.
  #[serde(default)]
  pub depends_on: Vec<String>,
  #[serde(default)]
  pub version: u64,
  pub updated_at: DateTime<Utc>,
}

impl StateRecord {
  pub fn new(
    kind: ResourceKind,
    config_hash: impl Into<String>,
    handle: Option<String>,
    status: ResourceStatus,
    depends_on: Vec<String>,
  ) -> Self {
    Self {
      kind,
      config_hash: config_hash.into(),
      handle,
      status,
      depends_on,
      version: 0,
      updated_at: Utc::now(),
    }
  }

  /// Copy with a new status and a fresh timestamp; keeps the version for the next commit.
  pub fn with_status(&self, status: ResourceStatus) -> Self {
    Self {
      status,
      updated_at: Utc::now(),
      ..self.clone()
    }
  }
}
