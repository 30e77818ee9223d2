//! Pipeline coordinator: plan, approve, apply, converge, verify.
//!
//! Every run owns a [`PipelineRun`] record that moves through an explicit state machine. The
//! state lock is taken during planning and released on every exit path. Runs are kept in an
//! in-process registry and, when a run directory is configured, archived after every stage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::abort::AbortSignal;
use crate::api::Backends;
use crate::config::{ApprovalMode, OrchestratorConfig};
use crate::error::{ControlError, PipelineError, PlanError};
use crate::executor::ApplyExecutor;
use crate::graph::ResourceGraph;
use crate::plan::plan;
use crate::run_log_io::write_run_record;
use crate::state::StateStore;
use crate::types::{
  ApplyOutcome, ChangeSet, ConvergenceOutcome, PipelineRun, PipelineState, ResourceDefinition,
  StageOutcome,
};
use crate::watcher::{ConvergenceGate, ConvergenceWatcher};

/// A request to converge infrastructure onto `definitions`. Submitting an earlier set of
/// definitions rolls back; an empty set tears everything down.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
  pub definitions: Vec<ResourceDefinition>,
  /// Overrides the configured approval mode for this run.
  #[serde(default)]
  pub approval: Option<ApprovalMode>,
}

impl RunRequest {
  pub fn new(definitions: Vec<ResourceDefinition>) -> Self {
    Self {
      definitions,
      approval: None,
    }
  }

  pub fn with_approval(mut self, approval: ApprovalMode) -> Self {
    self.approval = Some(approval);
    self
  }
}

struct RunHandle {
  id: Uuid,
  run: Mutex<PipelineRun>,
  abort: AbortSignal,
  approval: Mutex<Option<oneshot::Sender<bool>>>,
  done: watch::Sender<bool>,
}

impl RunHandle {
  fn new(id: Uuid) -> (Self, oneshot::Receiver<bool>) {
    let (approval_tx, approval_rx) = oneshot::channel();
    let (done, _) = watch::channel(false);
    let handle = Self {
      id,
      run: Mutex::new(PipelineRun::new(id)),
      abort: AbortSignal::new(),
      approval: Mutex::new(Some(approval_tx)),
      done,
    };
    (handle, approval_rx)
  }

  fn update<T>(&self, f: impl FnOnce(&mut PipelineRun) -> T) -> T {
    let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut run)
  }

  fn snapshot(&self) -> PipelineRun {
    self.update(|run| run.clone())
  }

  fn begin(&self, stage: PipelineState) {
    if self.update(|run| run.begin_stage(stage)) {
      info!(run_id = %self.id, %stage, "stage started");
    }
  }

  fn finish_stage(&self, detail: impl Into<String>) {
    let detail = detail.into();
    info!(run_id = %self.id, %detail, "stage succeeded");
    self.update(|run| run.finish_stage(StageOutcome::Succeeded, Some(detail)));
  }

  fn check_abort(&self) -> Result<(), PipelineError> {
    if self.abort.is_aborted() {
      return Err(PipelineError::Aborted);
    }
    Ok(())
  }
}

struct Inner {
  backends: Backends,
  store: Arc<dyn StateStore>,
  config: OrchestratorConfig,
  runs: RwLock<BTreeMap<Uuid, Arc<RunHandle>>>,
}

/// Entry point for triggering and controlling pipeline runs. Cheap to clone.
#[derive(Clone)]
pub struct PipelineCoordinator {
  inner: Arc<Inner>,
}

impl PipelineCoordinator {
  pub fn new(backends: Backends, store: Arc<dyn StateStore>, config: OrchestratorConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        backends,
        store,
        config,
        runs: RwLock::new(BTreeMap::new()),
      }),
    }
  }

  pub fn config(&self) -> &OrchestratorConfig {
    &self.inner.config
  }

  fn register(&self) -> (Arc<RunHandle>, oneshot::Receiver<bool>) {
    let (handle, approval_rx) = RunHandle::new(Uuid::new_v4());
    let handle = Arc::new(handle);
    self
      .inner
      .runs
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(handle.id, handle.clone());
    (handle, approval_rx)
  }

  fn handle(&self, id: Uuid) -> Option<Arc<RunHandle>> {
    self
      .inner
      .runs
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(&id)
      .cloned()
  }

  /// Starts a run in the background and returns its id immediately.
  pub fn submit(&self, request: RunRequest) -> Uuid {
    let (handle, approval_rx) = self.register();
    let id = handle.id;
    info!(run_id = %id, resources = request.definitions.len(), "run submitted");
    let this = self.clone();
    tokio::spawn(async move { this.execute(handle, request, approval_rx).await });
    id
  }

  /// Runs a pipeline to completion on the current task.
  pub async fn run(&self, request: RunRequest) -> PipelineRun {
    let (handle, approval_rx) = self.register();
    info!(run_id = %handle.id, resources = request.definitions.len(), "run started");
    self.execute(handle.clone(), request, approval_rx).await;
    handle.snapshot()
  }

  pub fn status(&self, id: Uuid) -> Option<PipelineRun> {
    self.handle(id).map(|h| h.snapshot())
  }

  /// Every registered run, oldest first.
  pub fn runs(&self) -> Vec<PipelineRun> {
    let handles: Vec<Arc<RunHandle>> = self
      .inner
      .runs
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .values()
      .cloned()
      .collect();
    let mut runs: Vec<PipelineRun> = handles.iter().map(|h| h.snapshot()).collect();
    runs.sort_by_key(|r| r.created_at);
    runs
  }

  /// Waits for run `id` to finish and returns its final record.
  pub async fn wait(&self, id: Uuid) -> Option<PipelineRun> {
    let handle = self.handle(id)?;
    let mut done = handle.done.subscribe();
    let _ = done.wait_for(|finished| *finished).await;
    Some(handle.snapshot())
  }

  /// Requests cooperative cancellation. In-flight external calls finish first.
  pub fn abort(&self, id: Uuid) -> Result<(), ControlError> {
    let handle = self.handle(id).ok_or(ControlError::NotFound)?;
    if handle.update(|run| run.state.is_terminal()) {
      return Err(ControlError::NotActive);
    }
    info!(run_id = %id, "abort requested");
    handle.abort.abort();
    Ok(())
  }

  /// Answers a pending manual approval.
  pub fn approve(&self, id: Uuid, approved: bool) -> Result<(), ControlError> {
    let handle = self.handle(id).ok_or(ControlError::NotFound)?;
    if handle.update(|run| run.state) != PipelineState::AwaitingApproval {
      return Err(ControlError::NotActive);
    }
    let sender = handle
      .approval
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take()
      .ok_or(ControlError::NotActive)?;
    info!(run_id = %id, approved, "approval answered");
    sender.send(approved).map_err(|_| ControlError::NotActive)
  }

  async fn execute(
    &self,
    handle: Arc<RunHandle>,
    request: RunRequest,
    approval_rx: oneshot::Receiver<bool>,
  ) {
    let result = self.drive(&handle, request, approval_rx).await;
    let aborted = handle.abort.is_aborted();
    handle.update(|run| match result {
      Ok(()) => {}
      Err(e) => {
        let (outcome, state) = match e {
          PipelineError::Aborted | PipelineError::ApprovalDenied | PipelineError::ApprovalTimeout(_) => {
            (StageOutcome::Aborted, PipelineState::Aborted)
          }
          _ if aborted => (StageOutcome::Aborted, PipelineState::Aborted),
          _ => (StageOutcome::Failed, PipelineState::Failed),
        };
        run.finish_stage(outcome, Some(e.to_string()));
        run.error = Some(e.to_string());
        run.advance(state);
      }
    });
    let run = handle.snapshot();
    match run.state {
      PipelineState::Succeeded => info!(run_id = %run.id, "run succeeded"),
      state => error!(run_id = %run.id, %state, error = ?run.error, "run did not succeed"),
    }
    self.archive(&handle);
    handle.done.send_replace(true);
  }

  async fn drive(
    &self,
    handle: &RunHandle,
    request: RunRequest,
    approval_rx: oneshot::Receiver<bool>,
  ) -> Result<(), PipelineError> {
    handle.begin(PipelineState::Planning);
    let graph = ResourceGraph::build(request.definitions)?;
    handle.check_abort()?;

    let run_id = handle.id.to_string();
    let store = self.inner.store.as_ref();
    if !store.try_lock(&run_id).await? {
      let holder = store
        .lock_holder()
        .await?
        .unwrap_or_else(|| "unknown".to_string());
      return Err(PlanError::Conflict { holder }.into());
    }
    let approval = request.approval.unwrap_or(self.inner.config.approval);
    let result = self.locked_stages(handle, &graph, approval, approval_rx).await;
    if let Err(e) = store.unlock(&run_id).await {
      warn!(run_id = %run_id, error = %e, "could not release state lock");
    }
    result
  }

  /// Stages that run while this run holds the state lock.
  async fn locked_stages(
    &self,
    handle: &RunHandle,
    graph: &ResourceGraph,
    approval: ApprovalMode,
    approval_rx: oneshot::Receiver<bool>,
  ) -> Result<(), PipelineError> {
    let store = self.inner.store.clone();
    let change_set = plan(graph, store.as_ref(), &handle.id.to_string()).await?;
    let (creates, updates, deletes) = change_set.counts();
    handle.update(|run| run.planned = change_set.summary());
    handle.finish_stage(format!(
      "{} to create, {} to update, {} to delete",
      creates, updates, deletes
    ));
    self.archive(handle);
    handle.check_abort()?;

    let unsettled = self.unsettled(graph, &change_set).await?;
    if !change_set.is_empty() || !unsettled.is_empty() {
      if !change_set.is_empty() {
        if let ApprovalMode::Manual { timeout_secs } = approval {
          handle.begin(PipelineState::AwaitingApproval);
          self.archive(handle);
          let decision = tokio::select! {
            d = tokio::time::timeout(Duration::from_secs(timeout_secs), approval_rx) => d,
            _ = handle.abort.aborted() => return Err(PipelineError::Aborted),
          };
          match decision {
            Ok(Ok(true)) => handle.finish_stage("approved"),
            Ok(Ok(false)) | Ok(Err(_)) => return Err(PipelineError::ApprovalDenied),
            Err(_) => return Err(PipelineError::ApprovalTimeout(timeout_secs)),
          }
        }
      }

      handle.begin(PipelineState::Applying);
      self.archive(handle);
      let watcher = ConvergenceWatcher::new(
        self.inner.backends.clone(),
        store.clone(),
        &self.inner.config,
      )
      .with_abort(handle.abort.clone());
      let executor = ApplyExecutor::new(self.inner.backends.clone(), store.clone(), &self.inner.config)
        .with_abort(handle.abort.clone());

      // Records an earlier run left mid-flight settle before anything builds on them.
      let mut reports = Vec::new();
      if !unsettled.is_empty() {
        info!(run_id = %handle.id, resources = ?unsettled, "resuming convergence of unsettled records");
        reports = watcher.watch(graph, &unsettled).await;
      }
      let blockers: BTreeMap<String, String> = reports
        .iter()
        .filter(|r| !r.outcome.is_converged())
        .map(|r| (r.id.clone(), format!("not ready: {}", r.outcome)))
        .collect();

      let gate = ConvergenceGate::new(&watcher, graph);
      let results = executor
        .apply_with_blockers(&change_set, Some(&gate), blockers)
        .await;
      reports.extend(gate.into_reports());

      let applied: Vec<String> = results
        .iter()
        .filter(|r| r.outcome == ApplyOutcome::Applied)
        .map(|r| r.id.clone())
        .collect();
      let failed: Vec<String> = results
        .iter()
        .filter(|r| r.outcome == ApplyOutcome::Failed)
        .map(|r| r.id.clone())
        .collect();
      handle.update(|run| run.apply_results = results);
      handle.check_abort()?;
      if !failed.is_empty() {
        handle.update(|run| run.convergence = reports);
        return Err(PipelineError::Apply { failed });
      }
      handle.finish_stage(format!("{} operations applied", applied.len()));
      self.archive(handle);

      handle.begin(PipelineState::Converging);
      let watched: BTreeSet<String> = reports.iter().map(|r| r.id.clone()).collect();
      let remaining: Vec<String> = applied
        .into_iter()
        .filter(|id| !watched.contains(id))
        .collect();
      if !remaining.is_empty() {
        reports.extend(watcher.watch(graph, &remaining).await);
      }
      let with_outcome = |outcome: ConvergenceOutcome| -> Vec<String> {
        reports
          .iter()
          .filter(|r| r.outcome == outcome)
          .map(|r| r.id.clone())
          .collect()
      };
      let degraded = with_outcome(ConvergenceOutcome::Degraded);
      let failed = with_outcome(ConvergenceOutcome::Failed);
      let converged = reports.iter().filter(|r| r.outcome.is_converged()).count();
      handle.update(|run| run.convergence = reports);
      handle.check_abort()?;
      if !degraded.is_empty() || !failed.is_empty() {
        return Err(PipelineError::NotConverged { degraded, failed });
      }
      handle.finish_stage(format!("{} resources converged", converged));
      self.archive(handle);
    }

    handle.begin(PipelineState::Verifying);
    let workloads: Vec<&ResourceDefinition> = graph
      .definitions_in_order()
      .filter(|d| d.kind.is_workload())
      .collect();
    let timeout = self.inner.config.operation_timeout();
    for workload in &workloads {
      handle.check_abort()?;
      let check = self.inner.backends.orchestrator.health_check(&workload.id);
      let detail = match tokio::time::timeout(timeout, check).await {
        Ok(Ok(())) => continue,
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("no answer within {}s", timeout.as_secs()),
      };
      return Err(PipelineError::VerificationFailed {
        workload: workload.id.clone(),
        detail,
      });
    }
    handle.finish_stage(format!("{} workloads healthy", workloads.len()));
    handle.update(|run| run.advance(PipelineState::Succeeded));
    Ok(())
  }

  /// Graph ids whose record is still transient although the plan leaves them alone, as after
  /// an interrupted run.
  async fn unsettled(
    &self,
    graph: &ResourceGraph,
    change_set: &ChangeSet,
  ) -> Result<Vec<String>, PipelineError> {
    let planned: BTreeSet<&str> = change_set.operations().map(|op| op.id.as_str()).collect();
    let snapshot = self.inner.store.snapshot().await?;
    Ok(
      graph
        .topological_order()
        .iter()
        .filter(|id| !planned.contains(id.as_str()))
        .filter(|id| snapshot.get(*id).is_some_and(|r| r.status.is_transient()))
        .cloned()
        .collect(),
    )
  }

  fn archive(&self, handle: &RunHandle) {
    let Some(run_dir) = &self.inner.config.run_dir else {
      return;
    };
    if let Err(e) = write_run_record(run_dir, &handle.snapshot()) {
      warn!(run_id = %handle.id, error = %e, "could not archive run record");
    }
  }
}
