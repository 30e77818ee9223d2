//! In-memory provider and orchestrator used by the CLI and the test suites.
//!
//! Each resource id can be scripted with a [`Behavior`]. Handles have the form
//! `sim/<kind>/<id>`; unknown handles that were never deleted are adopted as healthy, so a
//! fresh process can keep working against state written by an earlier one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, trace};

use crate::api::{
  Backends, OrchestratorApi, ProviderPhase, ProvisioningApi, StatusReport, WorkloadStatus,
};
use crate::error::ApiError;
use crate::types::{ResourceConfig, ResourceKind};

/// Scripted behavior for one resource id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Behavior {
  /// Every mutating call is rejected with a validation error.
  pub permanent_failure: bool,
  /// Mutating calls fail with `Unavailable` this many times before succeeding.
  pub transient_failures: u32,
  /// Status never reports ready.
  pub never_ready: bool,
  /// Workload health checks fail.
  pub unhealthy: bool,
  /// Status polls answered "provisioning" before the resource reports ready.
  pub polls_until_ready: u32,
  /// Added to every call touching this resource.
  pub latency: Option<Duration>,
  /// Status and health calls never answer.
  pub stalls: bool,
}

impl Behavior {
  pub fn permanent_failure() -> Self {
    Self {
      permanent_failure: true,
      ..Self::default()
    }
  }

  pub fn transient_failures(n: u32) -> Self {
    Self {
      transient_failures: n,
      ..Self::default()
    }
  }

  pub fn never_ready() -> Self {
    Self {
      never_ready: true,
      ..Self::default()
    }
  }

  pub fn unhealthy() -> Self {
    Self {
      unhealthy: true,
      ..Self::default()
    }
  }

  pub fn ready_after_polls(n: u32) -> Self {
    Self {
      polls_until_ready: n,
      ..Self::default()
    }
  }

  pub fn slow(latency: Duration) -> Self {
    Self {
      latency: Some(latency),
      ..Self::default()
    }
  }

  pub fn stalled() -> Self {
    Self {
      stalls: true,
      ..Self::default()
    }
  }
}

/// One recorded call against the simulated backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimCall {
  pub operation: String,
  pub resource: String,
}

#[derive(Debug)]
struct SimResource {
  kind: ResourceKind,
  config: ResourceConfig,
  polls: u32,
}

#[derive(Debug)]
struct SimWorkload {
  replicas: u32,
  polls: u32,
}

#[derive(Debug, Default)]
struct Cloud {
  behaviors: HashMap<String, Behavior>,
  failures_left: HashMap<String, u32>,
  resources: BTreeMap<String, SimResource>,
  workloads: BTreeMap<String, SimWorkload>,
  deleted: BTreeSet<String>,
  calls: Vec<SimCall>,
}

impl Cloud {
  fn behavior(&self, id: &str) -> Behavior {
    self.behaviors.get(id).cloned().unwrap_or_default()
  }

  /// Records the call and applies scripted failures for mutating operations.
  fn mutate(&mut self, operation: &str, id: &str) -> Result<(), ApiError> {
    self.calls.push(SimCall {
      operation: operation.to_string(),
      resource: id.to_string(),
    });
    let behavior = self.behavior(id);
    if behavior.permanent_failure {
      return Err(ApiError::Validation(format!(
        "{} rejected for '{}'",
        operation, id
      )));
    }
    let left = self
      .failures_left
      .entry(id.to_string())
      .or_insert(behavior.transient_failures);
    if *left > 0 {
      *left -= 1;
      return Err(ApiError::Unavailable(format!(
        "{} for '{}' temporarily unavailable",
        operation, id
      )));
    }
    Ok(())
  }

  fn observe(&mut self, operation: &str, id: &str) {
    self.calls.push(SimCall {
      operation: operation.to_string(),
      resource: id.to_string(),
    });
  }
}

/// Simulated cloud provider plus container orchestrator.
#[derive(Debug, Default)]
pub struct SimulatedCloud {
  cloud: Mutex<Cloud>,
}

impl SimulatedCloud {
  pub fn new() -> Self {
    Self::default()
  }

  /// Scripts `behavior` for resource `id`.
  pub fn with_behavior(self, id: impl Into<String>, behavior: Behavior) -> Self {
    self.set_behavior(id, behavior);
    self
  }

  pub fn set_behavior(&self, id: impl Into<String>, behavior: Behavior) {
    let id = id.into();
    let mut cloud = self.cloud();
    cloud.failures_left.remove(&id);
    cloud.behaviors.insert(id, behavior);
  }

  /// Both capability handles backed by this cloud.
  pub fn backends(self: &Arc<Self>) -> Backends {
    Backends::new(self.clone(), self.clone())
  }

  /// Every call made so far, in order.
  pub fn calls(&self) -> Vec<SimCall> {
    self.cloud().calls.clone()
  }

  /// Operations made against `id`, in order.
  pub fn calls_for(&self, id: &str) -> Vec<String> {
    self
      .cloud()
      .calls
      .iter()
      .filter(|c| c.resource == id)
      .map(|c| c.operation.clone())
      .collect()
  }

  /// Whether a resource or workload with this id currently exists.
  pub fn exists(&self, id: &str) -> bool {
    let cloud = self.cloud();
    cloud.workloads.contains_key(id) || cloud.resources.contains_key(&handle_for_id(&cloud, id))
  }

  fn cloud(&self) -> MutexGuard<'_, Cloud> {
    self.cloud.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Read calls for a stalled id hang forever.
  async fn stall(&self, id: &str) {
    let stalls = self.cloud().behavior(id).stalls;
    if stalls {
      std::future::pending::<()>().await;
    }
  }

  async fn delay(&self, id: &str) {
    let latency = self.cloud().behavior(id).latency;
    if let Some(d) = latency {
      tokio::time::sleep(d).await;
    }
  }
}

fn handle_of(kind: ResourceKind, id: &str) -> String {
  format!("sim/{}/{}", kind, id)
}

/// Splits `sim/<kind>/<id>`; foreign handles are treated as network ids.
fn parse_handle(handle: &str) -> (ResourceKind, String) {
  let mut parts = handle.splitn(3, '/');
  match (parts.next(), parts.next(), parts.next()) {
    (Some("sim"), Some(kind), Some(id)) => (
      kind.parse().unwrap_or(ResourceKind::Network),
      id.to_string(),
    ),
    _ => (ResourceKind::Network, handle.to_string()),
  }
}

fn handle_for_id(cloud: &Cloud, id: &str) -> String {
  cloud
    .resources
    .keys()
    .find(|h| parse_handle(h).1 == id)
    .cloned()
    .unwrap_or_default()
}

fn replicas_in(manifest: &str) -> u32 {
  serde_json::from_str::<BTreeMap<String, String>>(manifest)
    .ok()
    .and_then(|m| m.get("replicas").and_then(|r| r.parse().ok()))
    .unwrap_or(1)
}

fn nodes_for(kind: ResourceKind, config: &ResourceConfig) -> u32 {
  let key = match kind {
    ResourceKind::ComputeCluster => "min_nodes",
    ResourceKind::NodeGroup => "desired_size",
    _ => return 0,
  };
  config
    .get(key)
    .and_then(|v| v.parse().ok())
    .unwrap_or(1)
}

#[async_trait]
impl ProvisioningApi for SimulatedCloud {
  async fn create(
    &self,
    kind: ResourceKind,
    id: &str,
    config: &ResourceConfig,
  ) -> Result<String, ApiError> {
    self.delay(id).await;
    let mut cloud = self.cloud();
    cloud.mutate("create", id)?;
    let handle = handle_of(kind, id);
    cloud.deleted.remove(&handle);
    cloud.resources.insert(
      handle.clone(),
      SimResource {
        kind,
        config: config.clone(),
        polls: 0,
      },
    );
    debug!(resource = id, handle = %handle, "simulated create");
    Ok(handle)
  }

  async fn update(&self, handle: &str, config: &ResourceConfig) -> Result<(), ApiError> {
    let (kind, id) = parse_handle(handle);
    self.delay(&id).await;
    let mut cloud = self.cloud();
    cloud.mutate("update", &id)?;
    let resource = cloud
      .resources
      .entry(handle.to_string())
      .or_insert(SimResource {
        kind,
        config: ResourceConfig::new(),
        polls: 0,
      });
    resource.config = config.clone();
    resource.polls = 0;
    Ok(())
  }

  async fn delete(&self, handle: &str) -> Result<(), ApiError> {
    let (_, id) = parse_handle(handle);
    self.delay(&id).await;
    let mut cloud = self.cloud();
    cloud.mutate("delete", &id)?;
    cloud.resources.remove(handle);
    cloud.deleted.insert(handle.to_string());
    Ok(())
  }

  async fn status(&self, handle: &str) -> Result<StatusReport, ApiError> {
    let (kind, id) = parse_handle(handle);
    self.stall(&id).await;
    let mut cloud = self.cloud();
    cloud.observe("status", &id);
    if cloud.deleted.contains(handle) {
      return Ok(StatusReport::phase(ProviderPhase::NotFound));
    }
    let behavior = cloud.behavior(&id);
    let resource = cloud
      .resources
      .entry(handle.to_string())
      .or_insert_with(|| SimResource {
        kind,
        config: ResourceConfig::new(),
        polls: behavior.polls_until_ready,
      });
    resource.polls += 1;
    trace!(resource = %id, polls = resource.polls, "simulated status poll");
    if behavior.never_ready || resource.polls <= behavior.polls_until_ready {
      return Ok(StatusReport {
        message: Some("provisioning".to_string()),
        ..StatusReport::phase(ProviderPhase::Provisioning)
      });
    }
    Ok(StatusReport {
      phase: ProviderPhase::Available,
      control_plane_reachable: resource.kind == ResourceKind::ComputeCluster,
      active_nodes: nodes_for(resource.kind, &resource.config),
      message: None,
    })
  }
}

#[async_trait]
impl OrchestratorApi for SimulatedCloud {
  async fn apply_workload(&self, name: &str, manifest: &str) -> Result<(), ApiError> {
    self.delay(name).await;
    let mut cloud = self.cloud();
    cloud.mutate("apply_workload", name)?;
    cloud.deleted.remove(name);
    cloud.workloads.insert(
      name.to_string(),
      SimWorkload {
        replicas: replicas_in(manifest),
        polls: 0,
      },
    );
    Ok(())
  }

  async fn workload_status(&self, name: &str) -> Result<WorkloadStatus, ApiError> {
    self.stall(name).await;
    let mut cloud = self.cloud();
    cloud.observe("workload_status", name);
    if cloud.deleted.contains(name) {
      return Err(ApiError::NotFound(format!("workload '{}'", name)));
    }
    let behavior = cloud.behavior(name);
    let workload = cloud
      .workloads
      .entry(name.to_string())
      .or_insert_with(|| SimWorkload {
        replicas: 1,
        polls: behavior.polls_until_ready,
      });
    workload.polls += 1;
    let ready = !behavior.never_ready && workload.polls > behavior.polls_until_ready;
    Ok(WorkloadStatus {
      replicas_ready: if ready { workload.replicas } else { 0 },
      replicas_desired: workload.replicas,
    })
  }

  async fn delete_workload(&self, name: &str) -> Result<(), ApiError> {
    self.delay(name).await;
    let mut cloud = self.cloud();
    cloud.mutate("delete_workload", name)?;
    cloud.workloads.remove(name);
    cloud.deleted.insert(name.to_string());
    Ok(())
  }

  async fn health_check(&self, name: &str) -> Result<(), ApiError> {
    self.stall(name).await;
    let mut cloud = self.cloud();
    cloud.observe("health_check", name);
    if cloud.deleted.contains(name) {
      return Err(ApiError::NotFound(format!("workload '{}'", name)));
    }
    if cloud.behavior(name).unhealthy {
      return Err(ApiError::Unavailable(format!(
        "health probe for '{}' failed",
        name
      )));
    }
    Ok(())
  }
}
