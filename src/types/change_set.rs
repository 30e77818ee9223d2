//! Ordered create/update/delete operations derived from one plan cycle.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ResourceDefinition, ResourceKind, StateRecord};

/// What an operation does to the external resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
  Create,
  Update,
  Delete,
}

impl fmt::Display for ChangeAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ChangeAction::Create => write!(f, "create"),
      ChangeAction::Update => write!(f, "update"),
      ChangeAction::Delete => write!(f, "delete"),
    }
  }
}

/// One planned change against a single resource.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeOperation {
  pub id: String,
  pub action: ChangeAction,
  pub kind: ResourceKind,
  /// Declared definition; `None` for deletes.
  pub definition: Option<ResourceDefinition>,
  /// Record read at plan time, if any.
  pub prior: Option<StateRecord>,
  /// Hash recorded on success; `None` for deletes.
  pub desired_hash: Option<String>,
  /// Ids that must not have failed or been blocked for this operation to run.
  pub prerequisites: Vec<String>,
}

/// Planned change summary kept on the pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChange {
  pub id: String,
  pub action: ChangeAction,
  pub tier: usize,
}

/// Ordered operations grouped into tiers. Tiers run sequentially; operations in a tier may run
/// concurrently. Create/update tiers come first in forward order, delete tiers last in reverse.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSet {
  tiers: Vec<Vec<ChangeOperation>>,
}

impl ChangeSet {
  /// Builds a change-set, dropping empty tiers and sorting each tier by id.
  pub fn new(tiers: Vec<Vec<ChangeOperation>>) -> Self {
    let tiers = tiers
      .into_iter()
      .filter(|t| !t.is_empty())
      .map(|mut t| {
        t.sort_by(|a, b| a.id.cmp(&b.id));
        t
      })
      .collect();
    Self { tiers }
  }

  pub fn tiers(&self) -> &[Vec<ChangeOperation>] {
    &self.tiers
  }

  pub fn operations(&self) -> impl Iterator<Item = &ChangeOperation> {
    self.tiers.iter().flatten()
  }

  pub fn len(&self) -> usize {
    self.tiers.iter().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.tiers.is_empty()
  }

  pub fn get(&self, id: &str) -> Option<&ChangeOperation> {
    self.operations().find(|op| op.id == id)
  }

  /// Flat summary in execution order.
  pub fn summary(&self) -> Vec<PlannedChange> {
    self
      .tiers
      .iter()
      .enumerate()
      .flat_map(|(tier, ops)| {
        ops.iter().map(move |op| PlannedChange {
          id: op.id.clone(),
          action: op.action,
          tier,
        })
      })
      .collect()
  }

  /// Number of (create, update, delete) operations.
  pub fn counts(&self) -> (usize, usize, usize) {
    self
      .operations()
      .fold((0, 0, 0), |(c, u, d), op| match op.action {
        ChangeAction::Create => (c + 1, u, d),
        ChangeAction::Update => (c, u + 1, d),
        ChangeAction::Delete => (c, u, d + 1),
      })
  }
}
