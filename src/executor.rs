//! Apply executor: runs a change-set against the external APIs.
//!
//! Tiers run one after another. Inside a tier up to `max_concurrency` operations are in
//! flight. A failed operation is never rolled back; anything that lists it as a prerequisite
//! is reported `blocked` instead of being attempted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::abort::AbortSignal;
use crate::api::Backends;
use crate::config::OrchestratorConfig;
use crate::error::{ApiError, ApplyError};
use crate::retry::RetryPolicy;
use crate::state::StateStore;
use crate::types::{
  ApplyOutcome, ChangeAction, ChangeOperation, ChangeSet, OperationResult, ResourceStatus,
  StateRecord,
};

/// Awaited after every tier with the ids applied in it.
#[async_trait]
pub trait ReadinessGate: Send + Sync {
  /// Returns the ids that did not become usable, with a reason for each.
  async fn await_ready(&self, ids: &[String]) -> BTreeMap<String, String>;
}

pub struct ApplyExecutor {
  backends: Backends,
  store: Arc<dyn StateStore>,
  retry: RetryPolicy,
  max_concurrency: usize,
  operation_timeout: Duration,
  abort: AbortSignal,
}

impl ApplyExecutor {
  pub fn new(backends: Backends, store: Arc<dyn StateStore>, config: &OrchestratorConfig) -> Self {
    Self {
      backends,
      store,
      retry: RetryPolicy::from_config(config),
      max_concurrency: config.max_concurrency.max(1),
      operation_timeout: config.operation_timeout(),
      abort: AbortSignal::new(),
    }
  }

  pub fn with_abort(mut self, abort: AbortSignal) -> Self {
    self.abort = abort;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub async fn apply(&self, change_set: &ChangeSet) -> Vec<OperationResult> {
    self.apply_gated(change_set, None).await
  }

  /// Applies every tier, awaiting `gate` (when given) before the next tier starts.
  pub async fn apply_gated(
    &self,
    change_set: &ChangeSet,
    gate: Option<&dyn ReadinessGate>,
  ) -> Vec<OperationResult> {
    self.apply_with_blockers(change_set, gate, BTreeMap::new()).await
  }

  /// Like [`ApplyExecutor::apply_gated`], with `blockers` (id to reason) already unusable:
  /// resources outside the change-set that dependents must not build on.
  pub async fn apply_with_blockers(
    &self,
    change_set: &ChangeSet,
    gate: Option<&dyn ReadinessGate>,
    blockers: BTreeMap<String, String>,
  ) -> Vec<OperationResult> {
    let mut results = Vec::with_capacity(change_set.len());
    // Ids that dependents must not build on, with the reason.
    let mut unusable = blockers;

    for (index, tier) in change_set.tiers().iter().enumerate() {
      if self.abort.is_aborted() {
        for op in tier {
          unusable.insert(op.id.clone(), "aborted".to_string());
          results.push(OperationResult::skipped(op, "run aborted"));
        }
        continue;
      }

      let mut dispatch = Vec::with_capacity(tier.len());
      for op in tier {
        match op.prerequisites.iter().find(|p| unusable.contains_key(*p)) {
          Some(blocker) => {
            let reason = format!("prerequisite '{}' {}", blocker, unusable[blocker]);
            debug!(resource = %op.id, %reason, "operation blocked");
            unusable.insert(op.id.clone(), format!("blocked by '{}'", blocker));
            results.push(OperationResult::blocked(op, reason));
          }
          None => dispatch.push(op),
        }
      }

      debug!(tier = index, operations = dispatch.len(), "applying tier");
      let mut tier_results: Vec<OperationResult> = stream::iter(
        dispatch
          .into_iter()
          .map(|op| self.run_operation(op))
          .collect::<Vec<_>>(),
      )
      .buffer_unordered(self.max_concurrency)
      .collect()
      .await;
      tier_results.sort_by(|a, b| a.id.cmp(&b.id));

      let mut applied = Vec::new();
      for result in &tier_results {
        match result.outcome {
          ApplyOutcome::Applied => applied.push(result.id.clone()),
          _ => {
            unusable.insert(result.id.clone(), result.outcome.to_string());
          }
        }
      }
      results.extend(tier_results);

      if let Some(gate) = gate {
        if !applied.is_empty() && !self.abort.is_aborted() {
          for (id, reason) in gate.await_ready(&applied).await {
            unusable.insert(id, format!("not ready: {}", reason));
          }
        }
      }
    }

    let failed = results
      .iter()
      .filter(|r| r.outcome == ApplyOutcome::Failed)
      .count();
    info!(operations = results.len(), failed, "change-set applied");
    results
  }

  #[instrument(level = "trace", skip(self, op), fields(resource = %op.id, action = %op.action))]
  async fn run_operation(&self, op: &ChangeOperation) -> OperationResult {
    if self.abort.is_aborted() {
      return OperationResult::skipped(op, "run aborted");
    }
    let mut attempts = 0;
    loop {
      attempts += 1;
      let outcome = match tokio::time::timeout(self.operation_timeout, self.dispatch(op)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ApiError::Timeout(format!(
          "no response within {}s",
          self.operation_timeout.as_secs()
        ))),
      };
      match outcome {
        Ok(handle) => return self.commit_success(op, handle, attempts).await,
        Err(e) if e.is_transient() && self.retry.should_retry(attempts) && !self.abort.is_aborted() => {
          let delay = self.retry.jittered_backoff(attempts);
          warn!(resource = %op.id, attempt = attempts, error = %e, ?delay, "transient failure, retrying");
          tokio::time::sleep(delay).await;
        }
        Err(e) => {
          let error = if e.is_transient() {
            ApplyError::Transient {
              id: op.id.clone(),
              attempts,
              source: e,
            }
          } else {
            ApplyError::Permanent {
              id: op.id.clone(),
              source: e,
            }
          };
          warn!(resource = %op.id, %error, "operation failed");
          self.commit_failure(op).await;
          return OperationResult::failed(op, error.to_string(), attempts);
        }
      }
    }
  }

  /// One call against the owning API. Returns the handle to record.
  async fn dispatch(&self, op: &ChangeOperation) -> Result<Option<String>, ApiError> {
    let prior_handle = op.prior.as_ref().and_then(|r| r.handle.clone());
    match op.action {
      ChangeAction::Create | ChangeAction::Update => {
        let def = op
          .definition
          .as_ref()
          .ok_or_else(|| ApiError::Validation(format!("no definition for '{}'", op.id)))?;
        if def.kind.is_workload() {
          self
            .backends
            .orchestrator
            .apply_workload(&def.id, &def.workload_manifest())
            .await?;
          return Ok(Some(def.id.clone()));
        }
        match (op.action, prior_handle) {
          (ChangeAction::Update, Some(handle)) => {
            self.backends.provisioning.update(&handle, &def.config).await?;
            Ok(Some(handle))
          }
          _ => {
            let handle = self
              .backends
              .provisioning
              .create(def.kind, &def.id, &def.config)
              .await?;
            Ok(Some(handle))
          }
        }
      }
      ChangeAction::Delete => {
        let result = if op.kind.is_workload() {
          self.backends.orchestrator.delete_workload(&op.id).await
        } else if let Some(handle) = &prior_handle {
          self.backends.provisioning.delete(handle).await
        } else {
          Ok(())
        };
        match result {
          Ok(()) | Err(ApiError::NotFound(_)) => Ok(prior_handle),
          Err(e) => Err(e),
        }
      }
    }
  }

  async fn commit_success(
    &self,
    op: &ChangeOperation,
    handle: Option<String>,
    attempts: u32,
  ) -> OperationResult {
    let expected = op.prior.as_ref().map(|r| r.version).unwrap_or(0);
    let record = match (&op.action, &op.definition, &op.prior) {
      (ChangeAction::Delete, _, Some(prior)) => {
        let mut record = prior.with_status(ResourceStatus::Deleting);
        record.handle = handle;
        record
      }
      (_, Some(def), _) => {
        let status = if op.action == ChangeAction::Create {
          ResourceStatus::Creating
        } else {
          ResourceStatus::Updating
        };
        let mut record = StateRecord::new(
          def.kind,
          op.desired_hash.clone().unwrap_or_else(|| def.config_hash()),
          handle,
          status,
          def.depends_on.clone(),
        );
        record.version = expected;
        record
      }
      _ => {
        return OperationResult::failed(op, "operation carries no record to commit", attempts);
      }
    };
    match self.store.commit(&op.id, record).await {
      Ok(version) => {
        info!(resource = %op.id, action = %op.action, attempts, version, "operation applied");
        OperationResult::applied(op, attempts)
      }
      Err(e) => {
        let error = ApplyError::Commit {
          id: op.id.clone(),
          detail: e.to_string(),
        };
        warn!(resource = %op.id, %error, "state commit failed");
        OperationResult::failed(op, error.to_string(), attempts)
      }
    }
  }

  /// Marks the resource failed, keeping the prior hash and handle so the next plan retries it.
  async fn commit_failure(&self, op: &ChangeOperation) {
    let record = match (&op.prior, &op.definition) {
      (Some(prior), _) => prior.with_status(ResourceStatus::Failed),
      (None, Some(def)) => StateRecord::new(
        def.kind,
        String::new(),
        None,
        ResourceStatus::Failed,
        def.depends_on.clone(),
      ),
      (None, None) => return,
    };
    if let Err(e) = self.store.commit(&op.id, record).await {
      warn!(resource = %op.id, error = %e, "could not record failure");
    }
  }
}
