//! A declared resource (infrastructure or workload) loaded from a definitions source.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::instrument;

/// Opaque declared configuration. Ordered so hashing is deterministic.
pub type ResourceConfig = BTreeMap<String, String>;

/// Config key holding a workload's manifest payload.
pub const MANIFEST_KEY: &str = "manifest";

/// Kind of a declared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
  Network,
  ComputeCluster,
  NodeGroup,
  Workload,
}

impl ResourceKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceKind::Network => "network",
      ResourceKind::ComputeCluster => "compute-cluster",
      ResourceKind::NodeGroup => "node-group",
      ResourceKind::Workload => "workload",
    }
  }

  /// Workloads go to the orchestrator; everything else to the provisioning API.
  pub fn is_workload(&self) -> bool {
    matches!(self, ResourceKind::Workload)
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceKind {
  type Err = String;

  /// Accepts both `compute-cluster` and `compute_cluster` spellings.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
      "network" => Ok(ResourceKind::Network),
      "compute-cluster" | "cluster" => Ok(ResourceKind::ComputeCluster),
      "node-group" | "nodegroup" => Ok(ResourceKind::NodeGroup),
      "workload" => Ok(ResourceKind::Workload),
      other => Err(format!("unknown resource kind '{}'", other)),
    }
  }
}

/// A declared resource. Immutable for the duration of a plan cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
  pub id: String,
  pub kind: ResourceKind,
  #[serde(default)]
  pub config: ResourceConfig,
  #[serde(default)]
  pub depends_on: Vec<String>,
}

impl ResourceDefinition {
  pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
    Self {
      id: id.into(),
      kind,
      config: ResourceConfig::new(),
      depends_on: vec![],
    }
  }

  pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.config.insert(key.into(), value.into());
    self
  }

  pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
    self.depends_on.push(id.into());
    self
  }

  /// SHA-256 over kind and ordered config entries, lowercase hex.
  #[instrument(level = "trace", skip(self), fields(resource = %self.id))]
  pub fn config_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.kind.as_str().as_bytes());
    hasher.update([0u8]);
    for (k, v) in &self.config {
      hasher.update(k.as_bytes());
      hasher.update(b"=");
      hasher.update(v.as_bytes());
      hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
  }

  /// Parses a numeric config value; missing or malformed values yield `None`.
  pub fn config_u32(&self, key: &str) -> Option<u32> {
    self.config.get(key).and_then(|v| v.trim().parse().ok())
  }

  /// Manifest handed to the orchestrator for workloads.
  /// Falls back to the whole config as JSON when no explicit manifest is declared.
  pub fn workload_manifest(&self) -> String {
    match self.config.get(MANIFEST_KEY) {
      Some(m) => m.clone(),
      None => serde_json::to_string(&self.config).unwrap_or_default(),
    }
  }
}
