//! Tests for the plan engine.

use std::collections::BTreeMap;

use crate::error::PlanError;
use crate::graph::ResourceGraph;
use crate::plan::{compute_change_set, plan};
use crate::state::{MemoryStateStore, StateStore};
use crate::types::{
  ChangeAction, ResourceDefinition, ResourceKind, ResourceStatus, StateRecord, StateSnapshot,
};

fn stack() -> Vec<ResourceDefinition> {
  vec![
    ResourceDefinition::new("net", ResourceKind::Network).with_config("cidr", "10.0.0.0/16"),
    ResourceDefinition::new("cluster", ResourceKind::ComputeCluster)
      .with_config("min_nodes", "2")
      .with_dependency("net"),
    ResourceDefinition::new("app", ResourceKind::Workload)
      .with_config("image", "app:1")
      .with_dependency("cluster"),
  ]
}

fn ready_record(def: &ResourceDefinition) -> StateRecord {
  let mut r = StateRecord::new(
    def.kind,
    def.config_hash(),
    Some(format!("h-{}", def.id)),
    ResourceStatus::Ready,
    def.depends_on.clone(),
  );
  r.version = 1;
  r
}

fn applied(defs: &[ResourceDefinition]) -> StateSnapshot {
  defs.iter().map(|d| (d.id.clone(), ready_record(d))).collect()
}

#[test]
fn empty_state_creates_everything_in_tiers() {
  let g = ResourceGraph::build(stack()).unwrap();
  let cs = compute_change_set(&g, &BTreeMap::new());
  let tiers: Vec<Vec<(&str, ChangeAction)>> = cs
    .tiers()
    .iter()
    .map(|t| t.iter().map(|op| (op.id.as_str(), op.action)).collect())
    .collect();
  assert_eq!(
    tiers,
    vec![
      vec![("net", ChangeAction::Create)],
      vec![("cluster", ChangeAction::Create)],
      vec![("app", ChangeAction::Create)],
    ]
  );
  assert_eq!(cs.get("app").unwrap().prerequisites, vec!["cluster"]);
}

#[test]
fn unchanged_state_plans_nothing() {
  let defs = stack();
  let g = ResourceGraph::build(defs.clone()).unwrap();
  assert!(compute_change_set(&g, &applied(&defs)).is_empty());
}

#[test]
fn changed_hash_is_an_update_carrying_the_prior_record() {
  let defs = stack();
  let snapshot = applied(&defs);
  let mut changed = defs.clone();
  changed[2] = changed[2].clone().with_config("image", "app:2");
  let g = ResourceGraph::build(changed).unwrap();
  let cs = compute_change_set(&g, &snapshot);
  assert_eq!(cs.len(), 1);
  let op = cs.get("app").unwrap();
  assert_eq!(op.action, ChangeAction::Update);
  assert_eq!(op.prior.as_ref().unwrap().version, 1);
  assert_ne!(op.desired_hash.as_deref(), Some(snapshot["app"].config_hash.as_str()));
}

#[test]
fn missing_handle_and_failed_status_are_remediated() {
  let defs = stack();
  let mut snapshot = applied(&defs);
  snapshot.get_mut("net").unwrap().handle = None;
  snapshot.get_mut("cluster").unwrap().status = ResourceStatus::Degraded;
  let g = ResourceGraph::build(defs).unwrap();
  let cs = compute_change_set(&g, &snapshot);
  assert_eq!(cs.get("net").unwrap().action, ChangeAction::Create);
  assert_eq!(cs.get("cluster").unwrap().action, ChangeAction::Update);
  assert!(cs.get("app").is_none());
}

#[test]
fn removed_resources_are_deleted_in_reverse_order_after_changes() {
  let defs = stack();
  let snapshot = applied(&defs);
  let g = ResourceGraph::build(vec![
    ResourceDefinition::new("dns", ResourceKind::Network),
  ])
  .unwrap();
  let cs = compute_change_set(&g, &snapshot);
  let order: Vec<(&str, ChangeAction)> = cs
    .operations()
    .map(|op| (op.id.as_str(), op.action))
    .collect();
  assert_eq!(
    order,
    vec![
      ("dns", ChangeAction::Create),
      ("app", ChangeAction::Delete),
      ("cluster", ChangeAction::Delete),
      ("net", ChangeAction::Delete),
    ]
  );
  assert_eq!(cs.get("net").unwrap().prerequisites, vec!["cluster"]);
  assert!(cs.get("app").unwrap().prerequisites.is_empty());
  assert!(cs.get("cluster").unwrap().definition.is_none());
}

#[test]
fn empty_definitions_tear_everything_down() {
  let defs = stack();
  let g = ResourceGraph::build(Vec::new()).unwrap();
  let cs = compute_change_set(&g, &applied(&defs));
  assert_eq!(cs.counts(), (0, 0, 3));
  assert_eq!(cs.tiers().len(), 3);
}

#[tokio::test]
async fn planning_twice_is_idempotent() {
  let defs = stack();
  let store = MemoryStateStore::with_records(applied(&defs));
  let g = ResourceGraph::build(defs).unwrap();
  let first = plan(&g, &store, "run-1").await.unwrap();
  let second = plan(&g, &store, "run-1").await.unwrap();
  assert!(first.is_empty());
  assert_eq!(first.summary(), second.summary());
}

#[tokio::test]
async fn lock_held_by_another_run_is_a_conflict() {
  let store = MemoryStateStore::new();
  assert!(store.try_lock("other").await.unwrap());
  let g = ResourceGraph::build(stack()).unwrap();
  match plan(&g, &store, "mine").await {
    Err(PlanError::Conflict { holder }) => assert_eq!(holder, "other"),
    other => panic!("expected conflict, got {:?}", other.map(|cs| cs.len())),
  }
  // The holder itself may plan.
  assert_eq!(plan(&g, &store, "other").await.unwrap().len(), 3);
}
