//! End-to-end pipeline runs against the simulated cloud.

use std::sync::Arc;

use clusterweave::simulated::{Behavior, SimulatedCloud};
use clusterweave::types::{ApplyOutcome, ConvergenceOutcome, ResourceStatus, StateRecord};
use clusterweave::{
  FileStateStore, MemoryStateStore, OrchestratorConfig, PipelineCoordinator, PipelineRun,
  PipelineState, ResourceDefinition, ResourceKind, RunRequest, StateStore,
};

fn config() -> OrchestratorConfig {
  OrchestratorConfig {
    poll_interval_ms: 100,
    convergence_timeout_secs: 10,
    backoff_base_ms: 50,
    ..OrchestratorConfig::default()
  }
}

/// network -> cluster -> workload
fn stack() -> Vec<ResourceDefinition> {
  vec![
    ResourceDefinition::new("network", ResourceKind::Network).with_config("cidr", "10.0.0.0/16"),
    ResourceDefinition::new("cluster", ResourceKind::ComputeCluster)
      .with_config("min_nodes", "2")
      .with_dependency("network"),
    ResourceDefinition::new("workload", ResourceKind::Workload)
      .with_config("replicas", "2")
      .with_dependency("cluster"),
  ]
}

fn apply_outcome(run: &PipelineRun, id: &str) -> Option<ApplyOutcome> {
  run.apply_results.iter().find(|r| r.id == id).map(|r| r.outcome)
}

fn convergence(run: &PipelineRun, id: &str) -> Option<ConvergenceOutcome> {
  run.convergence.iter().find(|r| r.id == id).map(|r| r.outcome)
}

async fn status(store: &dyn StateStore, id: &str) -> Option<ResourceStatus> {
  store.get(id).await.unwrap().map(|r| r.status)
}

#[tokio::test(start_paused = true)]
async fn healthy_stack_succeeds_with_ready_records() {
  let cloud = Arc::new(SimulatedCloud::new());
  let store = Arc::new(MemoryStateStore::new());
  let coordinator = PipelineCoordinator::new(cloud.backends(), store.clone(), config());

  let run = coordinator.run(RunRequest::new(stack())).await;
  assert_eq!(run.state, PipelineState::Succeeded, "error: {:?}", run.error);
  for id in ["network", "cluster", "workload"] {
    assert_eq!(apply_outcome(&run, id), Some(ApplyOutcome::Applied));
    assert_eq!(convergence(&run, id), Some(ConvergenceOutcome::Ready));
    assert_eq!(status(store.as_ref(), id).await, Some(ResourceStatus::Ready));
  }
  assert_eq!(store.snapshot().await.unwrap().len(), 3);
  assert!(cloud.calls_for("workload").contains(&"health_check".to_string()));
  assert_eq!(store.lock_holder().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn permanent_cluster_failure_blocks_the_workload() {
  let cloud = Arc::new(SimulatedCloud::new().with_behavior("cluster", Behavior::permanent_failure()));
  let store = Arc::new(MemoryStateStore::new());
  let coordinator = PipelineCoordinator::new(cloud.backends(), store.clone(), config());

  let run = coordinator.run(RunRequest::new(stack())).await;
  assert_eq!(run.state, PipelineState::Failed);
  assert_eq!(apply_outcome(&run, "network"), Some(ApplyOutcome::Applied));
  assert_eq!(apply_outcome(&run, "cluster"), Some(ApplyOutcome::Failed));
  assert_eq!(apply_outcome(&run, "workload"), Some(ApplyOutcome::Blocked));
  assert_eq!(status(store.as_ref(), "network").await, Some(ResourceStatus::Ready));
  assert_eq!(status(store.as_ref(), "cluster").await, Some(ResourceStatus::Failed));
  assert_eq!(status(store.as_ref(), "workload").await, None);
  assert!(cloud.calls_for("workload").is_empty());
  assert!(run.error.as_deref().unwrap().contains("cluster"));
  assert_eq!(
    run.stages.last().map(|s| s.stage),
    Some(PipelineState::Applying)
  );
}

#[tokio::test(start_paused = true)]
async fn cluster_that_never_converges_is_degraded() {
  let cloud = Arc::new(SimulatedCloud::new().with_behavior("cluster", Behavior::never_ready()));
  let store = Arc::new(MemoryStateStore::new());
  let coordinator = PipelineCoordinator::new(cloud.backends(), store.clone(), config());

  let run = coordinator.run(RunRequest::new(stack())).await;
  assert_eq!(run.state, PipelineState::Failed);
  assert_eq!(convergence(&run, "cluster"), Some(ConvergenceOutcome::Degraded));
  assert_eq!(apply_outcome(&run, "workload"), Some(ApplyOutcome::Blocked));
  assert_eq!(status(store.as_ref(), "cluster").await, Some(ResourceStatus::Degraded));
  assert_eq!(status(store.as_ref(), "network").await, Some(ResourceStatus::Ready));
  assert!(cloud.calls_for("workload").is_empty());
  assert_eq!(run.degraded_resources(), vec!["cluster"]);
  assert!(run.error.as_deref().unwrap().contains("degraded cluster"));
  assert_eq!(
    run.stages.last().map(|s| s.stage),
    Some(PipelineState::Converging)
  );
}

#[tokio::test(start_paused = true)]
async fn rerun_after_fix_remediates_only_the_broken_resource() {
  let cloud = Arc::new(SimulatedCloud::new().with_behavior("cluster", Behavior::never_ready()));
  let store = Arc::new(MemoryStateStore::new());
  let coordinator = PipelineCoordinator::new(cloud.backends(), store.clone(), config());
  assert_eq!(
    coordinator.run(RunRequest::new(stack())).await.state,
    PipelineState::Failed
  );

  cloud.set_behavior("cluster", Behavior::default());
  let run = coordinator.run(RunRequest::new(stack())).await;
  assert_eq!(run.state, PipelineState::Succeeded, "error: {:?}", run.error);
  let planned: Vec<(&str, String)> = run
    .planned
    .iter()
    .map(|c| (c.id.as_str(), c.action.to_string()))
    .collect();
  assert_eq!(
    planned,
    vec![("cluster", "update".to_string()), ("workload", "create".to_string())]
  );
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_absorbed() {
  let cloud = Arc::new(SimulatedCloud::new().with_behavior("network", Behavior::transient_failures(2)));
  let store = Arc::new(MemoryStateStore::new());
  let coordinator = PipelineCoordinator::new(cloud.backends(), store, config());
  let run = coordinator.run(RunRequest::new(stack())).await;
  assert_eq!(run.state, PipelineState::Succeeded);
  let network = run.apply_results.iter().find(|r| r.id == "network").unwrap();
  assert_eq!(network.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn unhealthy_workload_fails_verification() {
  let cloud = Arc::new(SimulatedCloud::new().with_behavior("workload", Behavior::unhealthy()));
  let store = Arc::new(MemoryStateStore::new());
  let coordinator = PipelineCoordinator::new(cloud.backends(), store, config());
  let run = coordinator.run(RunRequest::new(stack())).await;
  assert_eq!(run.state, PipelineState::Failed);
  assert_eq!(run.stages.last().map(|s| s.stage), Some(PipelineState::Verifying));
  assert!(run.error.as_deref().unwrap().contains("verification failed"));
}

#[tokio::test(start_paused = true)]
async fn second_run_is_refused_while_the_lock_is_held() {
  let cloud = Arc::new(SimulatedCloud::new());
  let store = Arc::new(MemoryStateStore::new());
  assert!(store.try_lock("maintenance").await.unwrap());
  assert!(!store.try_lock("maintenance").await.unwrap());

  let coordinator = PipelineCoordinator::new(cloud.backends(), store.clone(), config());
  let run = coordinator.run(RunRequest::new(stack())).await;
  assert_eq!(run.state, PipelineState::Failed);
  assert!(run.error.as_deref().unwrap().contains("locked by run maintenance"));
  assert!(cloud.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_definitions_tear_down_in_reverse_order() {
  let dir = tempfile::tempdir().unwrap();
  let cloud = Arc::new(SimulatedCloud::new());
  let store = Arc::new(FileStateStore::open(dir.path()).await.unwrap());
  let coordinator = PipelineCoordinator::new(cloud.backends(), store.clone(), config());
  assert_eq!(
    coordinator.run(RunRequest::new(stack())).await.state,
    PipelineState::Succeeded
  );

  let teardown = coordinator.run(RunRequest::new(Vec::new())).await;
  assert_eq!(teardown.state, PipelineState::Succeeded, "error: {:?}", teardown.error);
  let order: Vec<&str> = teardown.planned.iter().map(|c| c.id.as_str()).collect();
  assert_eq!(order, vec!["workload", "cluster", "network"]);
  assert!(teardown
    .convergence
    .iter()
    .all(|r| r.outcome == ConvergenceOutcome::Removed));
  assert!(store.snapshot().await.unwrap().is_empty());

  let mutations: Vec<String> = cloud
    .calls()
    .into_iter()
    .filter(|c| c.operation.starts_with("delete"))
    .map(|c| c.resource)
    .collect();
  assert_eq!(mutations, vec!["workload", "cluster", "network"]);
}

/// Leaves `network` as an interrupted run would: created and recorded, never confirmed ready.
async fn seed_unsettled_network(store: &dyn StateStore) {
  let network = &stack()[0];
  let record = StateRecord::new(
    ResourceKind::Network,
    network.config_hash(),
    Some("sim/network/network".to_string()),
    ResourceStatus::Creating,
    vec![],
  );
  store.commit("network", record).await.unwrap();
}

fn position(cloud: &SimulatedCloud, operation: &str, resource: &str) -> usize {
  cloud
    .calls()
    .iter()
    .position(|c| c.operation == operation && c.resource == resource)
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn rerun_settles_a_record_left_creating() {
  let cloud = Arc::new(SimulatedCloud::new());
  let store = Arc::new(MemoryStateStore::new());
  seed_unsettled_network(store.as_ref()).await;
  let coordinator = PipelineCoordinator::new(cloud.backends(), store.clone(), config());

  let run = coordinator.run(RunRequest::new(stack())).await;
  assert_eq!(run.state, PipelineState::Succeeded, "error: {:?}", run.error);
  assert!(run.planned.iter().all(|c| c.id != "network"));
  assert_eq!(convergence(&run, "network"), Some(ConvergenceOutcome::Ready));
  assert_eq!(status(store.as_ref(), "network").await, Some(ResourceStatus::Ready));
  assert!(position(&cloud, "status", "network") < position(&cloud, "create", "cluster"));
  for id in ["cluster", "workload"] {
    assert_eq!(status(store.as_ref(), id).await, Some(ResourceStatus::Ready));
  }
}

#[tokio::test(start_paused = true)]
async fn unsettled_dependency_that_never_converges_blocks_dependents() {
  let cloud = Arc::new(SimulatedCloud::new().with_behavior("network", Behavior::never_ready()));
  let store = Arc::new(MemoryStateStore::new());
  seed_unsettled_network(store.as_ref()).await;
  let coordinator = PipelineCoordinator::new(cloud.backends(), store.clone(), config());

  let run = coordinator.run(RunRequest::new(stack())).await;
  assert_eq!(run.state, PipelineState::Failed);
  assert_eq!(convergence(&run, "network"), Some(ConvergenceOutcome::Degraded));
  assert_eq!(apply_outcome(&run, "cluster"), Some(ApplyOutcome::Blocked));
  assert_eq!(apply_outcome(&run, "workload"), Some(ApplyOutcome::Blocked));
  assert!(cloud.calls_for("cluster").is_empty());
  assert_eq!(status(store.as_ref(), "network").await, Some(ResourceStatus::Degraded));
  assert!(run.error.as_deref().unwrap().contains("degraded network"));
  assert_eq!(store.lock_holder().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn unanswered_health_check_fails_verification() {
  let cloud = Arc::new(SimulatedCloud::new());
  let store = Arc::new(MemoryStateStore::new());
  let coordinator = PipelineCoordinator::new(cloud.backends(), store.clone(), config());
  assert_eq!(
    coordinator.run(RunRequest::new(stack())).await.state,
    PipelineState::Succeeded
  );

  cloud.set_behavior("workload", Behavior::stalled());
  let run = tokio::time::timeout(
    std::time::Duration::from_secs(3600),
    coordinator.run(RunRequest::new(stack())),
  )
  .await
  .expect("verification gave up on the health check");
  assert_eq!(run.state, PipelineState::Failed);
  assert_eq!(run.stages.last().map(|s| s.stage), Some(PipelineState::Verifying));
  let error = run.error.as_deref().unwrap();
  assert!(error.contains("verification failed for workload 'workload'"));
  assert!(error.contains("no answer within 300s"));
  assert_eq!(store.lock_holder().await.unwrap(), None);
}
