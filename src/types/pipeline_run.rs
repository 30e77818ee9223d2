//! Pipeline run record: state machine pointer, stage results and per-resource outcomes.
//!
//! Archived as `<run_dir>/runs/<id>.json` by [crate::run_log_io].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::{ConvergenceOutcome, ConvergenceReport, OperationResult, PlannedChange};

/// Pipeline state machine.
///
/// `Pending → Planning → AwaitingApproval → Applying → Converging → Verifying → Succeeded`;
/// any non-terminal state may move to `Failed` or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
  Pending,
  Planning,
  AwaitingApproval,
  Applying,
  Converging,
  Verifying,
  Succeeded,
  Failed,
  Aborted,
}

impl PipelineState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      PipelineState::Succeeded | PipelineState::Failed | PipelineState::Aborted
    )
  }

  /// Whether `next` is a legal successor. Approval, convergence and verification may be skipped
  /// (manual approval off, nothing to apply).
  pub fn can_transition_to(&self, next: PipelineState) -> bool {
    use PipelineState::*;
    if self.is_terminal() {
      return false;
    }
    if matches!(next, Failed | Aborted) {
      return true;
    }
    matches!(
      (self, next),
      (Pending, Planning)
        | (Planning, AwaitingApproval)
        | (Planning, Applying)
        | (Planning, Verifying)
        | (AwaitingApproval, Applying)
        | (AwaitingApproval, Verifying)
        | (Applying, Converging)
        | (Applying, Verifying)
        | (Converging, Verifying)
        | (Verifying, Succeeded)
    )
  }
}

impl fmt::Display for PipelineState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      PipelineState::Pending => "pending",
      PipelineState::Planning => "planning",
      PipelineState::AwaitingApproval => "awaiting_approval",
      PipelineState::Applying => "applying",
      PipelineState::Converging => "converging",
      PipelineState::Verifying => "verifying",
      PipelineState::Succeeded => "succeeded",
      PipelineState::Failed => "failed",
      PipelineState::Aborted => "aborted",
    };
    f.write_str(s)
  }
}

/// Outcome of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
  Succeeded,
  Failed,
  Aborted,
}

/// One recorded stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
  pub stage: PipelineState,
  pub started_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  pub outcome: Option<StageOutcome>,
  pub detail: Option<String>,
}

/// Audit record of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
  pub id: Uuid,
  pub state: PipelineState,
  pub created_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  pub stages: Vec<StageResult>,
  pub planned: Vec<PlannedChange>,
  pub apply_results: Vec<OperationResult>,
  pub convergence: Vec<ConvergenceReport>,
  pub error: Option<String>,
}

impl PipelineRun {
  pub fn new(id: Uuid) -> Self {
    Self {
      id,
      state: PipelineState::Pending,
      created_at: Utc::now(),
      finished_at: None,
      stages: vec![],
      planned: vec![],
      apply_results: vec![],
      convergence: vec![],
      error: None,
    }
  }

  /// Moves the state pointer. Illegal transitions are refused and logged.
  pub fn advance(&mut self, next: PipelineState) -> bool {
    if !self.state.can_transition_to(next) {
      warn!(run_id = %self.id, from = %self.state, to = %next, "refusing illegal transition");
      return false;
    }
    self.state = next;
    if next.is_terminal() {
      self.finished_at = Some(Utc::now());
    }
    true
  }

  /// Advances into `stage` and opens its stage record.
  pub fn begin_stage(&mut self, stage: PipelineState) -> bool {
    if !self.advance(stage) {
      return false;
    }
    self.stages.push(StageResult {
      stage,
      started_at: Utc::now(),
      finished_at: None,
      outcome: None,
      detail: None,
    });
    true
  }

  /// Closes the most recent open stage.
  pub fn finish_stage(&mut self, outcome: StageOutcome, detail: Option<String>) {
    if let Some(stage) = self.stages.last_mut().filter(|s| s.finished_at.is_none()) {
      stage.finished_at = Some(Utc::now());
      stage.outcome = Some(outcome);
      stage.detail = detail;
    }
  }

  pub fn current_stage(&self) -> Option<&StageResult> {
    self.stages.last()
  }

  /// Ids whose convergence timed out.
  pub fn degraded_resources(&self) -> Vec<String> {
    self
      .convergence
      .iter()
      .filter(|r| r.outcome == ConvergenceOutcome::Degraded)
      .map(|r| r.id.clone())
      .collect()
  }
}
