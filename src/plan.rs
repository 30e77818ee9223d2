//! Plan engine: diffs declared definitions against last-applied state.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, instrument, warn};

use crate::error::PlanError;
use crate::graph::ResourceGraph;
use crate::state::StateStore;
use crate::types::{
  ChangeAction, ChangeOperation, ChangeSet, ResourceDefinition, ResourceStatus, StateRecord,
  StateSnapshot,
};

/// Reads one snapshot and computes the change-set for `run_id`.
///
/// Fails with [`PlanError::Conflict`] when another run holds the state lock.
#[instrument(level = "trace", skip(graph, store))]
pub async fn plan(
  graph: &ResourceGraph,
  store: &dyn StateStore,
  run_id: &str,
) -> Result<ChangeSet, PlanError> {
  match store.lock_holder().await? {
    Some(holder) if holder != run_id => {
      warn!(run_id, holder = %holder, "state locked by another run");
      return Err(PlanError::Conflict { holder });
    }
    _ => {}
  }
  let snapshot = store.snapshot().await?;
  let change_set = compute_change_set(graph, &snapshot);
  let (creates, updates, deletes) = change_set.counts();
  info!(run_id, creates, updates, deletes, "plan computed");
  Ok(change_set)
}

/// Pure diff. Creates and updates follow the graph's tiers; deletes come after them in
/// reverse order of the stored dependency relation.
#[instrument(level = "trace", skip_all)]
pub fn compute_change_set(graph: &ResourceGraph, snapshot: &StateSnapshot) -> ChangeSet {
  let mut tiers: Vec<Vec<ChangeOperation>> = graph
    .tiers()
    .into_iter()
    .map(|tier| {
      tier
        .iter()
        .filter_map(|id| graph.get(id))
        .filter_map(|def| diff_one(graph, def, snapshot.get(&def.id)))
        .collect()
    })
    .collect();
  tiers.extend(delete_tiers(graph, snapshot));
  ChangeSet::new(tiers)
}

fn diff_one(
  graph: &ResourceGraph,
  def: &ResourceDefinition,
  record: Option<&StateRecord>,
) -> Option<ChangeOperation> {
  let desired_hash = def.config_hash();
  let action = match record {
    None => ChangeAction::Create,
    Some(r) if r.handle.is_none() => ChangeAction::Create,
    Some(r) if r.config_hash != desired_hash => ChangeAction::Update,
    Some(r) if r.status.needs_remediation() => ChangeAction::Update,
    Some(_) => return None,
  };
  debug!(resource = %def.id, %action, "change planned");
  Some(ChangeOperation {
    id: def.id.clone(),
    action,
    kind: def.kind,
    definition: Some(def.clone()),
    prior: record.cloned(),
    desired_hash: Some(desired_hash),
    prerequisites: graph.dependencies(&def.id).cloned().collect(),
  })
}

/// Records whose id is gone from the graph, deepest dependents first.
fn delete_tiers(graph: &ResourceGraph, snapshot: &StateSnapshot) -> Vec<Vec<ChangeOperation>> {
  let orphans: BTreeSet<&String> = snapshot
    .iter()
    .filter(|(id, r)| !graph.contains(id) && r.status != ResourceStatus::Absent)
    .map(|(id, _)| id)
    .collect();
  if orphans.is_empty() {
    return vec![];
  }

  // Rebuild the stored relation among orphans only; edges to surviving resources do not
  // constrain deletion order.
  let stored = orphans.iter().map(|id| {
    let record = &snapshot[id.as_str()];
    let mut def = ResourceDefinition::new(id.as_str(), record.kind);
    def.depends_on = record
      .depends_on
      .iter()
      .filter(|d| orphans.contains(d))
      .cloned()
      .collect();
    def
  });

  let (tiers, mut prerequisites) = match ResourceGraph::build(stored) {
    Ok(orphan_graph) => {
      let mut tiers = orphan_graph.tiers();
      tiers.reverse();
      let prerequisites: BTreeMap<String, Vec<String>> = orphan_graph
        .topological_order()
        .iter()
        .map(|id| (id.clone(), orphan_graph.dependents(id).cloned().collect()))
        .collect();
      (tiers, prerequisites)
    }
    Err(e) => {
      warn!(error = %e, "stored dependencies are inconsistent; deleting orphans in one tier");
      (
        vec![orphans.iter().map(|id| (*id).clone()).collect()],
        BTreeMap::new(),
      )
    }
  };

  tiers
    .into_iter()
    .map(|tier| {
      tier
        .into_iter()
        .map(|id| {
          let record = &snapshot[&id];
          debug!(resource = %id, action = %ChangeAction::Delete, "change planned");
          ChangeOperation {
            prerequisites: prerequisites.remove(&id).unwrap_or_default(),
            action: ChangeAction::Delete,
            kind: record.kind,
            definition: None,
            prior: Some(record.clone()),
            desired_hash: None,
            id,
          }
        })
        .collect()
    })
    .collect()
}
