//! Tests for the convergence watcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::{ProviderPhase, StatusReport, WorkloadStatus};
use crate::config::OrchestratorConfig;
use crate::executor::ApplyExecutor;
use crate::graph::ResourceGraph;
use crate::plan::compute_change_set;
use crate::simulated::{Behavior, SimulatedCloud};
use crate::state::{MemoryStateStore, StateStore};
use crate::types::{
  ApplyOutcome, ConvergenceOutcome, ResourceConfig, ResourceDefinition, ResourceKind,
  ResourceStatus, StateRecord,
};
use crate::watcher::{
  ConvergenceGate, ConvergenceWatcher, Readiness, infrastructure_readiness, workload_readiness,
};

fn config() -> OrchestratorConfig {
  OrchestratorConfig {
    poll_interval_ms: 100,
    convergence_timeout_secs: 5,
    backoff_base_ms: 10,
    ..OrchestratorConfig::default()
  }
}

fn defs() -> Vec<ResourceDefinition> {
  vec![
    ResourceDefinition::new("net", ResourceKind::Network),
    ResourceDefinition::new("cluster", ResourceKind::ComputeCluster)
      .with_config("min_nodes", "2")
      .with_dependency("net"),
    ResourceDefinition::new("app", ResourceKind::Workload)
      .with_config("replicas", "3")
      .with_dependency("cluster"),
  ]
}

fn ids() -> Vec<String> {
  vec!["net".to_string(), "cluster".to_string(), "app".to_string()]
}

struct Harness {
  cloud: Arc<SimulatedCloud>,
  store: Arc<MemoryStateStore>,
  graph: ResourceGraph,
}

impl Harness {
  async fn applied(cloud: SimulatedCloud) -> Self {
    let cloud = Arc::new(cloud);
    let store = Arc::new(MemoryStateStore::new());
    let graph = ResourceGraph::build(defs()).unwrap();
    let executor = ApplyExecutor::new(cloud.backends(), store.clone(), &config());
    executor
      .apply(&compute_change_set(&graph, &BTreeMap::new()))
      .await;
    Self { cloud, store, graph }
  }

  fn watcher(&self) -> ConvergenceWatcher {
    ConvergenceWatcher::new(self.cloud.backends(), self.store.clone(), &config())
  }
}

fn config_of(pairs: &[(&str, &str)]) -> ResourceConfig {
  pairs
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[test]
fn cluster_needs_control_plane_and_min_nodes() {
  let config = config_of(&[("min_nodes", "3")]);
  let mut report = StatusReport::phase(ProviderPhase::Available);
  report.active_nodes = 3;
  assert!(matches!(
    infrastructure_readiness(ResourceKind::ComputeCluster, &config, &report),
    Readiness::Pending(_)
  ));
  report.control_plane_reachable = true;
  assert_eq!(
    infrastructure_readiness(ResourceKind::ComputeCluster, &config, &report),
    Readiness::Ready
  );
  report.active_nodes = 2;
  assert!(matches!(
    infrastructure_readiness(ResourceKind::ComputeCluster, &config, &report),
    Readiness::Pending(_)
  ));
}

#[test]
fn node_group_and_network_readiness() {
  let mut report = StatusReport::phase(ProviderPhase::Available);
  report.active_nodes = 1;
  let config = config_of(&[("desired_size", "2")]);
  assert!(matches!(
    infrastructure_readiness(ResourceKind::NodeGroup, &config, &report),
    Readiness::Pending(_)
  ));
  assert_eq!(
    infrastructure_readiness(ResourceKind::NodeGroup, &ResourceConfig::new(), &report),
    Readiness::Ready
  );
  assert_eq!(
    infrastructure_readiness(
      ResourceKind::Network,
      &ResourceConfig::new(),
      &StatusReport::phase(ProviderPhase::Provisioning)
    ),
    Readiness::Pending("phase provisioning".to_string())
  );
  assert_eq!(
    infrastructure_readiness(
      ResourceKind::Network,
      &ResourceConfig::new(),
      &StatusReport::phase(ProviderPhase::NotFound)
    ),
    Readiness::Gone
  );
  assert!(matches!(
    infrastructure_readiness(
      ResourceKind::Network,
      &ResourceConfig::new(),
      &StatusReport::phase(ProviderPhase::Failed)
    ),
    Readiness::Failed(_)
  ));
}

#[test]
fn workload_readiness_defaults_to_desired_replicas() {
  let status = |ready, desired| WorkloadStatus {
    replicas_ready: ready,
    replicas_desired: desired,
  };
  let empty = ResourceConfig::new();
  assert_eq!(workload_readiness(&empty, &status(3, 3)), Readiness::Ready);
  assert!(matches!(workload_readiness(&empty, &status(2, 3)), Readiness::Pending(_)));
  assert!(matches!(workload_readiness(&empty, &status(0, 0)), Readiness::Pending(_)));
  let relaxed = config_of(&[("min_replicas", "2")]);
  assert_eq!(workload_readiness(&relaxed, &status(2, 3)), Readiness::Ready);
}

#[tokio::test(start_paused = true)]
async fn healthy_resources_become_ready() {
  let h = Harness::applied(SimulatedCloud::new()).await;
  let reports = h.watcher().watch(&h.graph, &ids()).await;
  assert_eq!(reports.len(), 3);
  assert!(reports.iter().all(|r| r.outcome == ConvergenceOutcome::Ready));
  for id in ids() {
    assert_eq!(h.store.get(&id).await.unwrap().unwrap().status, ResourceStatus::Ready);
  }
}

#[tokio::test(start_paused = true)]
async fn slow_resource_is_polled_until_ready() {
  let h = Harness::applied(SimulatedCloud::new().with_behavior("cluster", Behavior::ready_after_polls(3)))
    .await;
  let report = h
    .watcher()
    .watch_resource(h.graph.get("cluster"), "cluster")
    .await;
  assert_eq!(report.outcome, ConvergenceOutcome::Ready);
  assert_eq!(report.polls, 4);
  assert!(report.elapsed_ms >= 300);
}

#[tokio::test(start_paused = true)]
async fn timeout_degrades_and_blocks_dependents() {
  let h = Harness::applied(SimulatedCloud::new().with_behavior("cluster", Behavior::never_ready()))
    .await;
  let reports = h.watcher().watch(&h.graph, &ids()).await;
  let by_id: BTreeMap<&str, ConvergenceOutcome> =
    reports.iter().map(|r| (r.id.as_str(), r.outcome)).collect();
  assert_eq!(by_id["net"], ConvergenceOutcome::Ready);
  assert_eq!(by_id["cluster"], ConvergenceOutcome::Degraded);
  assert_eq!(by_id["app"], ConvergenceOutcome::Blocked);

  let cluster = reports.iter().find(|r| r.id == "cluster").unwrap();
  assert!(cluster.detail.as_deref().unwrap().contains("did not become ready"));
  assert!(cluster.polls > 1);
  assert_eq!(h.store.get("cluster").await.unwrap().unwrap().status, ResourceStatus::Degraded);
  assert_eq!(h.store.get("app").await.unwrap().unwrap().status, ResourceStatus::Creating);
  assert!(!h.cloud.calls_for("app").contains(&"workload_status".to_string()));
}

#[tokio::test(start_paused = true)]
async fn deleted_resources_are_removed_from_state() {
  let h = Harness::applied(SimulatedCloud::new()).await;
  let watcher = h.watcher();
  watcher.watch(&h.graph, &ids()).await;

  let empty = ResourceGraph::build(Vec::new()).unwrap();
  let teardown = compute_change_set(&empty, &h.store.snapshot().await.unwrap());
  let executor = ApplyExecutor::new(h.cloud.backends(), h.store.clone(), &config());
  let results = executor.apply_gated(&teardown, Some(&ConvergenceGate::new(&watcher, &empty))).await;
  assert!(results.iter().all(|r| r.outcome == ApplyOutcome::Applied));
  assert!(h.store.snapshot().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn gate_collects_reports_and_blocks_the_next_tier() {
  let h = Harness {
    cloud: Arc::new(SimulatedCloud::new().with_behavior("cluster", Behavior::never_ready())),
    store: Arc::new(MemoryStateStore::new()),
    graph: ResourceGraph::build(defs()).unwrap(),
  };
  let watcher = h.watcher();
  let gate = ConvergenceGate::new(&watcher, &h.graph);
  let executor = ApplyExecutor::new(h.cloud.backends(), h.store.clone(), &config());
  let results = executor
    .apply_gated(&compute_change_set(&h.graph, &BTreeMap::new()), Some(&gate))
    .await;

  let app = results.iter().find(|r| r.id == "app").unwrap();
  assert_eq!(app.outcome, ApplyOutcome::Blocked);
  assert!(h.cloud.calls_for("app").is_empty());

  let reports = gate.into_reports();
  let outcomes: Vec<(&str, ConvergenceOutcome)> =
    reports.iter().map(|r| (r.id.as_str(), r.outcome)).collect();
  assert_eq!(
    outcomes,
    vec![
      ("net", ConvergenceOutcome::Ready),
      ("cluster", ConvergenceOutcome::Degraded),
    ]
  );
}

#[tokio::test(start_paused = true)]
async fn unanswered_status_call_degrades_at_the_deadline() {
  let cloud = Arc::new(SimulatedCloud::new().with_behavior("net", Behavior::stalled()));
  let store = Arc::new(MemoryStateStore::new());
  let net = ResourceDefinition::new("net", ResourceKind::Network);
  let record = StateRecord::new(
    ResourceKind::Network,
    net.config_hash(),
    Some("sim/network/net".to_string()),
    ResourceStatus::Creating,
    vec![],
  );
  store.commit("net", record).await.unwrap();
  let watcher = ConvergenceWatcher::new(cloud.backends(), store.clone(), &config());

  let report = tokio::time::timeout(
    std::time::Duration::from_secs(3600),
    watcher.watch_resource(Some(&net), "net"),
  )
  .await
  .expect("watcher gave up at the convergence deadline");

  assert_eq!(report.outcome, ConvergenceOutcome::Degraded);
  assert_eq!(report.polls, 1);
  let detail = report.detail.as_deref().unwrap();
  assert!(detail.contains("did not become ready"));
  assert!(detail.contains("status call did not answer"));
  assert!((5000..6000).contains(&report.elapsed_ms));
  assert_eq!(store.get("net").await.unwrap().unwrap().status, ResourceStatus::Degraded);
}
