//! Orchestrator configuration: JSON file, then `CLUSTERWEAVE_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::ConfigError;

/// Whether a run waits for an explicit approval after planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ApprovalMode {
  #[default]
  Auto,
  Manual { timeout_secs: u64 },
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
  /// Operations applied in parallel within one tier.
  pub max_concurrency: usize,
  /// Attempts per operation, including the first.
  pub max_attempts: u32,
  pub backoff_base_ms: u64,
  pub backoff_max_ms: u64,
  pub operation_timeout_secs: u64,
  pub poll_interval_ms: u64,
  pub convergence_timeout_secs: u64,
  pub approval: ApprovalMode,
  /// Where run records are archived; `None` disables archiving.
  pub run_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      max_concurrency: 4,
      max_attempts: 3,
      backoff_base_ms: 500,
      backoff_max_ms: 30_000,
      operation_timeout_secs: 300,
      poll_interval_ms: 2_000,
      convergence_timeout_secs: 900,
      approval: ApprovalMode::Auto,
      run_dir: None,
    }
  }
}

impl OrchestratorConfig {
  /// Loads from an optional JSON file, then applies process environment overrides.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let config = match path {
      Some(p) => Self::from_file(p)?,
      None => Self::default(),
    };
    config.with_overrides(|key| std::env::var(key).ok())
  }

  /// Reads a JSON file; missing fields keep their defaults.
  #[instrument(level = "trace")]
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  /// Applies `CLUSTERWEAVE_*` overrides looked up through `lookup`.
  pub fn with_overrides(
    mut self,
    lookup: impl Fn(&str) -> Option<String>,
  ) -> Result<Self, ConfigError> {
    if let Some(v) = lookup("CLUSTERWEAVE_MAX_CONCURRENCY") {
      self.max_concurrency = parse_override("CLUSTERWEAVE_MAX_CONCURRENCY", &v)?;
    }
    if let Some(v) = lookup("CLUSTERWEAVE_MAX_ATTEMPTS") {
      self.max_attempts = parse_override("CLUSTERWEAVE_MAX_ATTEMPTS", &v)?;
    }
    if let Some(v) = lookup("CLUSTERWEAVE_POLL_INTERVAL_MS") {
      self.poll_interval_ms = parse_override("CLUSTERWEAVE_POLL_INTERVAL_MS", &v)?;
    }
    if let Some(v) = lookup("CLUSTERWEAVE_CONVERGENCE_TIMEOUT_SECS") {
      self.convergence_timeout_secs =
        parse_override("CLUSTERWEAVE_CONVERGENCE_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = lookup("CLUSTERWEAVE_RUN_DIR") {
      self.run_dir = Some(PathBuf::from(v));
    }
    debug!(config = ?self, "configuration resolved");
    Ok(self)
  }

  pub fn operation_timeout(&self) -> Duration {
    Duration::from_secs(self.operation_timeout_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn convergence_timeout(&self) -> Duration {
    Duration::from_secs(self.convergence_timeout_secs)
  }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
  value.trim().parse().map_err(|_| ConfigError::InvalidValue {
    key: key.to_string(),
    value: value.to_string(),
  })
}
