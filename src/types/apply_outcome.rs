//! Per-operation result of applying a change-set.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ChangeAction, ChangeOperation};

/// Terminal outcome of one apply operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
  Applied,
  Failed,
  /// Not attempted because a prerequisite failed, was blocked, or never became ready.
  Blocked,
  /// Not attempted because the run was aborted.
  Skipped,
}

impl fmt::Display for ApplyOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ApplyOutcome::Applied => write!(f, "applied"),
      ApplyOutcome::Failed => write!(f, "failed"),
      ApplyOutcome::Blocked => write!(f, "blocked"),
      ApplyOutcome::Skipped => write!(f, "skipped"),
    }
  }
}

/// Result of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
  pub id: String,
  pub action: ChangeAction,
  pub outcome: ApplyOutcome,
  pub error: Option<String>,
  pub attempts: u32,
}

impl OperationResult {
  pub fn applied(op: &ChangeOperation, attempts: u32) -> Self {
    Self::with(op, ApplyOutcome::Applied, None, attempts)
  }

  pub fn failed(op: &ChangeOperation, error: impl Into<String>, attempts: u32) -> Self {
    Self::with(op, ApplyOutcome::Failed, Some(error.into()), attempts)
  }

  pub fn blocked(op: &ChangeOperation, reason: impl Into<String>) -> Self {
    Self::with(op, ApplyOutcome::Blocked, Some(reason.into()), 0)
  }

  pub fn skipped(op: &ChangeOperation, reason: impl Into<String>) -> Self {
    Self::with(op, ApplyOutcome::Skipped, Some(reason.into()), 0)
  }

  fn with(op: &ChangeOperation, outcome: ApplyOutcome, error: Option<String>, attempts: u32) -> Self {
    Self {
      id: op.id.clone(),
      action: op.action,
      outcome,
      error,
      attempts,
    }
  }
}
