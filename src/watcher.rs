//! Convergence watcher: polls external status until applied resources are usable.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::abort::AbortSignal;
use crate::api::{Backends, ProviderPhase, StatusReport, WorkloadStatus};
use crate::config::OrchestratorConfig;
use crate::error::{ApiError, ConvergenceError};
use crate::executor::ReadinessGate;
use crate::graph::ResourceGraph;
use crate::state::StateStore;
use crate::types::{
  ConvergenceOutcome, ConvergenceReport, ResourceConfig, ResourceDefinition, ResourceKind,
  ResourceStatus, StateRecord,
};

/// Verdict of one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
  Ready,
  /// Not there yet; carries what was observed.
  Pending(String),
  /// The provider no longer knows the resource.
  Gone,
  Failed(String),
}

fn config_u32(config: &ResourceConfig, key: &str) -> Option<u32> {
  config.get(key).and_then(|v| v.trim().parse().ok())
}

/// Readiness of a provisioned resource from one status report.
pub fn infrastructure_readiness(
  kind: ResourceKind,
  config: &ResourceConfig,
  report: &StatusReport,
) -> Readiness {
  match report.phase {
    ProviderPhase::Failed => {
      return Readiness::Failed(
        report
          .message
          .clone()
          .unwrap_or_else(|| "provider reported failure".to_string()),
      );
    }
    ProviderPhase::NotFound => return Readiness::Gone,
    ProviderPhase::Pending | ProviderPhase::Provisioning => {
      return Readiness::Pending(format!("phase {}", report.phase));
    }
    ProviderPhase::Available => {}
  }
  match kind {
    ResourceKind::ComputeCluster => {
      let min_nodes = config_u32(config, "min_nodes").unwrap_or(1);
      if report.control_plane_reachable && report.active_nodes >= min_nodes {
        Readiness::Ready
      } else {
        Readiness::Pending(format!(
          "control plane reachable: {}, {}/{} nodes active",
          report.control_plane_reachable, report.active_nodes, min_nodes
        ))
      }
    }
    ResourceKind::NodeGroup => {
      let desired = config_u32(config, "desired_size").unwrap_or(1);
      if report.active_nodes >= desired {
        Readiness::Ready
      } else {
        Readiness::Pending(format!("{}/{} nodes active", report.active_nodes, desired))
      }
    }
    ResourceKind::Network | ResourceKind::Workload => Readiness::Ready,
  }
}

/// Readiness of a workload: `min_replicas` (default the desired count, at least 1) ready and
/// a non-zero desired count.
pub fn workload_readiness(config: &ResourceConfig, status: &WorkloadStatus) -> Readiness {
  let min = config_u32(config, "min_replicas").unwrap_or(status.replicas_desired.max(1));
  if status.replicas_desired > 0 && status.replicas_ready >= min {
    Readiness::Ready
  } else {
    Readiness::Pending(format!(
      "{}/{} replicas ready (need {})",
      status.replicas_ready, status.replicas_desired, min
    ))
  }
}

fn api_readiness(error: ApiError) -> Readiness {
  match error {
    ApiError::NotFound(_) => Readiness::Gone,
    e if e.is_transient() => Readiness::Pending(e.to_string()),
    e => Readiness::Failed(e.to_string()),
  }
}

pub struct ConvergenceWatcher {
  backends: Backends,
  store: Arc<dyn StateStore>,
  poll_interval: Duration,
  timeout: Duration,
  abort: AbortSignal,
}

impl ConvergenceWatcher {
  pub fn new(backends: Backends, store: Arc<dyn StateStore>, config: &OrchestratorConfig) -> Self {
    Self {
      backends,
      store,
      poll_interval: config.poll_interval(),
      timeout: config.convergence_timeout(),
      abort: AbortSignal::new(),
    }
  }

  pub fn with_abort(mut self, abort: AbortSignal) -> Self {
    self.abort = abort;
    self
  }

  /// Watches `ids` tier by tier. A resource whose dependency did not converge is reported
  /// `blocked` without being polled. Ids missing from `graph` are deletions and are watched
  /// last.
  pub async fn watch(&self, graph: &ResourceGraph, ids: &[String]) -> Vec<ConvergenceReport> {
    let wanted: BTreeSet<&String> = ids.iter().collect();
    let mut unready: BTreeSet<String> = BTreeSet::new();
    let mut reports = Vec::with_capacity(ids.len());

    for tier in graph.tiers() {
      let mut watch = Vec::new();
      for id in tier.iter().filter(|id| wanted.contains(id)) {
        if let Some(dep) = graph.dependencies(id).find(|d| unready.contains(*d)) {
          unready.insert(id.clone());
          reports.push(
            ConvergenceReport::new(id.clone(), ConvergenceOutcome::Blocked)
              .with_detail(format!("dependency '{}' is not ready", dep)),
          );
        } else {
          watch.push(id);
        }
      }
      let tier_reports =
        join_all(watch.into_iter().map(|id| self.watch_resource(graph.get(id), id))).await;
      for report in tier_reports {
        if !report.outcome.is_converged() {
          unready.insert(report.id.clone());
        }
        reports.push(report);
      }
    }

    let deletions = ids.iter().filter(|id| !graph.contains(id));
    reports.extend(join_all(deletions.map(|id| self.watch_resource(None, id))).await);
    reports
  }

  /// Polls one resource until it converges, fails or times out, then records the result.
  #[instrument(level = "trace", skip(self, definition))]
  pub async fn watch_resource(
    &self,
    definition: Option<&ResourceDefinition>,
    id: &str,
  ) -> ConvergenceReport {
    let record = match self.store.get(id).await {
      Ok(Some(record)) => record,
      Ok(None) => return ConvergenceReport::new(id, ConvergenceOutcome::Removed),
      Err(e) => {
        return ConvergenceReport::new(id, ConvergenceOutcome::Failed).with_detail(e.to_string());
      }
    };
    if !record.status.is_transient() {
      let outcome = match record.status {
        ResourceStatus::Ready => ConvergenceOutcome::Ready,
        ResourceStatus::Absent => ConvergenceOutcome::Removed,
        ResourceStatus::Degraded => ConvergenceOutcome::Degraded,
        _ => ConvergenceOutcome::Failed,
      };
      return ConvergenceReport::new(id, outcome).with_detail(format!("recorded {}", record.status));
    }

    let deleting = record.status == ResourceStatus::Deleting;
    let empty = ResourceConfig::new();
    let config = definition.map(|d| &d.config).unwrap_or(&empty);
    let started = Instant::now();
    let mut polls = 0u32;
    let mut last_observation: String;

    let (outcome, detail) = loop {
      if self.abort.is_aborted() {
        break (ConvergenceOutcome::Skipped, Some("run aborted".to_string()));
      }
      polls += 1;
      let remaining = self.timeout.saturating_sub(started.elapsed());
      let observed = match tokio::time::timeout(remaining, self.observe(&record, config)).await {
        Ok(readiness) => readiness,
        Err(_) => Readiness::Pending("status call did not answer".to_string()),
      };
      match (observed, deleting) {
        (Readiness::Ready, false) => break (ConvergenceOutcome::Ready, None),
        (Readiness::Gone, true) => break (ConvergenceOutcome::Removed, None),
        (Readiness::Failed(detail), _) => {
          let error = ConvergenceError::ProviderFailed {
            id: id.to_string(),
            detail,
          };
          break (ConvergenceOutcome::Failed, Some(error.to_string()));
        }
        (Readiness::Gone, false) => {
          break (
            ConvergenceOutcome::Failed,
            Some("provider no longer knows the resource".to_string()),
          );
        }
        (Readiness::Ready, true) => last_observation = "still present".to_string(),
        (Readiness::Pending(observed), _) => last_observation = observed,
      }
      debug!(resource = id, polls, observation = %last_observation, "not converged yet");

      let elapsed = started.elapsed();
      if elapsed >= self.timeout {
        let error = ConvergenceError::Timeout {
          id: id.to_string(),
          waited_secs: elapsed.as_secs(),
          last_observation: last_observation.clone(),
        };
        break (ConvergenceOutcome::Degraded, Some(error.to_string()));
      }
      let wait = self.poll_interval.min(self.timeout - elapsed);
      tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = self.abort.aborted() => {}
      }
    };

    self.record(id, &record, outcome).await;
    let mut report = ConvergenceReport::new(id, outcome);
    report.detail = detail;
    report.polls = polls;
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
      ConvergenceOutcome::Ready | ConvergenceOutcome::Removed => {
        info!(resource = id, %outcome, polls, "resource converged")
      }
      _ => warn!(resource = id, %outcome, polls, detail = ?report.detail, "resource did not converge"),
    }
    report
  }

  async fn observe(&self, record: &StateRecord, config: &ResourceConfig) -> Readiness {
    if record.kind.is_workload() {
      let name = record.handle.as_deref().unwrap_or_default();
      return match self.backends.orchestrator.workload_status(name).await {
        Ok(status) => workload_readiness(config, &status),
        Err(e) => api_readiness(e),
      };
    }
    let Some(handle) = record.handle.as_deref() else {
      return Readiness::Gone;
    };
    match self.backends.provisioning.status(handle).await {
      Ok(report) => infrastructure_readiness(record.kind, config, &report),
      Err(e) => api_readiness(e),
    }
  }

  async fn record(&self, id: &str, record: &StateRecord, outcome: ConvergenceOutcome) {
    let result = match outcome {
      ConvergenceOutcome::Ready => self
        .store
        .commit(id, record.with_status(ResourceStatus::Ready))
        .await
        .map(|_| ()),
      ConvergenceOutcome::Removed => self.store.remove(id, record.version).await,
      ConvergenceOutcome::Degraded => self
        .store
        .commit(id, record.with_status(ResourceStatus::Degraded))
        .await
        .map(|_| ()),
      ConvergenceOutcome::Failed => self
        .store
        .commit(id, record.with_status(ResourceStatus::Failed))
        .await
        .map(|_| ()),
      ConvergenceOutcome::Blocked | ConvergenceOutcome::Skipped => Ok(()),
    };
    if let Err(e) = result {
      warn!(resource = id, error = %e, "could not record convergence result");
    }
  }
}

/// Readiness gate for the executor backed by a watcher. Keeps every report it produced.
pub struct ConvergenceGate<'a> {
  watcher: &'a ConvergenceWatcher,
  graph: &'a ResourceGraph,
  reports: Mutex<Vec<ConvergenceReport>>,
}

impl<'a> ConvergenceGate<'a> {
  pub fn new(watcher: &'a ConvergenceWatcher, graph: &'a ResourceGraph) -> Self {
    Self {
      watcher,
      graph,
      reports: Mutex::new(Vec::new()),
    }
  }

  pub fn into_reports(self) -> Vec<ConvergenceReport> {
    self.reports.into_inner().unwrap_or_else(|e| e.into_inner())
  }
}

#[async_trait]
impl ReadinessGate for ConvergenceGate<'_> {
  async fn await_ready(&self, ids: &[String]) -> BTreeMap<String, String> {
    let reports = join_all(
      ids
        .iter()
        .map(|id| self.watcher.watch_resource(self.graph.get(id), id)),
    )
    .await;
    let not_ready = reports
      .iter()
      .filter(|r| !r.outcome.is_converged())
      .map(|r| (r.id.clone(), r.outcome.to_string()))
      .collect();
    self
      .reports
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .extend(reports);
    not_ready
  }
}
