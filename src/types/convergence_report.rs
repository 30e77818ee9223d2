//! Result of waiting for one resource to converge.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a watched resource ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceOutcome {
  Ready,
  /// Deletion confirmed; the record was removed.
  Removed,
  /// Timed out before reaching ready.
  Degraded,
  /// Provider reported a terminal failure.
  Failed,
  /// Not checked because a dependency is not ready.
  Blocked,
  /// Not checked because the run was aborted.
  Skipped,
}

impl ConvergenceOutcome {
  pub fn is_converged(&self) -> bool {
    matches!(self, ConvergenceOutcome::Ready | ConvergenceOutcome::Removed)
  }
}

impl fmt::Display for ConvergenceOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ConvergenceOutcome::Ready => "ready",
      ConvergenceOutcome::Removed => "removed",
      ConvergenceOutcome::Degraded => "degraded",
      ConvergenceOutcome::Failed => "failed",
      ConvergenceOutcome::Blocked => "blocked",
      ConvergenceOutcome::Skipped => "skipped",
    };
    f.write_str(s)
  }
}

/// Convergence result for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceReport {
  pub id: String,
  pub outcome: ConvergenceOutcome,
  pub detail: Option<String>,
  pub polls: u32,
  pub elapsed_ms: u64,
}

impl ConvergenceReport {
  pub fn new(id: impl Into<String>, outcome: ConvergenceOutcome) -> Self {
    Self {
      id: id.into(),
      outcome,
      detail: None,
      polls: 0,
      elapsed_ms: 0,
    }
  }

  pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
    self.detail = Some(detail.into());
    self
  }
}
