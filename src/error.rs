//! Error taxonomy for graph construction, planning, applying, convergence and pipeline control.

use thiserror::Error;

/// Graph construction errors. Raised before any external mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  #[error("duplicate resource identifier: {0}")]
  DuplicateIdentifier(String),

  #[error("resource '{resource}' depends on unknown resource '{missing}'")]
  DanglingReference { resource: String, missing: String },

  /// Cycle listed in dependency direction: each id depends on the next, the last on the first.
  #[error("dependency cycle: {}", .cycle.join(" -> "))]
  Cycle { cycle: Vec<String> },
}

/// Errors reading resource definitions from a source.
#[derive(Debug, Error)]
pub enum ParseError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("invalid definitions JSON: {0}")]
  Json(#[from] serde_json::Error),

  #[error("invalid DOT: {0}")]
  Dot(String),

  #[error("invalid resource identifier: '{0}'")]
  InvalidIdentifier(String),

  #[error("resource '{0}' has no kind")]
  MissingKind(String),

  #[error("resource '{id}' has unknown kind '{kind}'")]
  UnknownKind { id: String, kind: String },

  #[error("edge references undeclared resource '{0}'")]
  UndeclaredResource(String),

  #[error("unsupported definitions file: {0}")]
  UnsupportedFormat(String),
}

impl From<String> for ParseError {
  fn from(s: String) -> Self {
    ParseError::Dot(s)
  }
}

impl From<&str> for ParseError {
  fn from(s: &str) -> Self {
    ParseError::Dot(s.to_string())
  }
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
  #[error("version conflict for '{id}': expected {expected}, stored {stored}")]
  VersionConflict { id: String, expected: u64, stored: u64 },

  #[error("lock is not held by run {0}")]
  NotLockHolder(String),

  #[error("state file is corrupt: {0}")]
  Corrupt(String),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
  #[error("state is locked by run {holder}")]
  Conflict { holder: String },

  #[error(transparent)]
  State(#[from] StateError),
}

/// Error reported by an external provisioning or orchestration API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
  #[error("timed out: {0}")]
  Timeout(String),

  #[error("rate limited: {0}")]
  RateLimited(String),

  #[error("unavailable: {0}")]
  Unavailable(String),

  #[error("validation rejected: {0}")]
  Validation(String),

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("not found: {0}")]
  NotFound(String),
}

impl ApiError {
  /// Timeouts, rate limits and unavailability are retried; everything else is final.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      ApiError::Timeout(_) | ApiError::RateLimited(_) | ApiError::Unavailable(_)
    )
  }
}

/// Final classification of a failed apply operation.
#[derive(Debug, Clone, Error)]
pub enum ApplyError {
  #[error("transient failure on '{id}' after {attempts} attempts: {source}")]
  Transient {
    id: String,
    attempts: u32,
    source: ApiError,
  },

  #[error("permanent failure on '{id}': {source}")]
  Permanent { id: String, source: ApiError },

  #[error("state commit for '{id}' failed: {detail}")]
  Commit { id: String, detail: String },
}

/// Convergence failures for a single resource.
#[derive(Debug, Clone, Error)]
pub enum ConvergenceError {
  #[error("'{id}' did not become ready within {waited_secs}s: {last_observation}")]
  Timeout {
    id: String,
    waited_secs: u64,
    last_observation: String,
  },

  #[error("provider reported '{id}' failed: {detail}")]
  ProviderFailed { id: String, detail: String },
}

/// Pipeline-level failure attached to a finished run.
#[derive(Debug, Error)]
pub enum PipelineError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Plan(#[from] PlanError),

  #[error(transparent)]
  State(#[from] StateError),

  #[error("apply failed for: {}", .failed.join(", "))]
  Apply { failed: Vec<String> },

  #[error("resources did not converge: {}", not_converged(.degraded, .failed))]
  NotConverged {
    /// Timed out while still transient.
    degraded: Vec<String>,
    /// Reported failed by the provider.
    failed: Vec<String>,
  },

  #[error("verification failed for workload '{workload}': {detail}")]
  VerificationFailed { workload: String, detail: String },

  #[error("approval denied")]
  ApprovalDenied,

  #[error("approval timed out after {0}s")]
  ApprovalTimeout(u64),

  #[error("run aborted")]
  Aborted,
}

/// Errors from abort/approve requests against a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
  #[error("run not found")]
  NotFound,

  #[error("run is not in a state that accepts this request")]
  NotActive,
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("invalid configuration: {0}")]
  Json(#[from] serde_json::Error),

  #[error("invalid value for {key}: '{value}'")]
  InvalidValue { key: String, value: String },
}

fn not_converged(degraded: &[String], failed: &[String]) -> String {
  let mut parts = Vec::new();
  if !degraded.is_empty() {
    parts.push(format!("degraded {}", degraded.join(", ")));
  }
  if !failed.is_empty() {
    parts.push(format!("failed {}", failed.join(", ")));
  }
  parts.join("; ")
}
