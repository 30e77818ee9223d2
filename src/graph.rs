//! Resource dependency graph.
//!
//! Edges point from a dependency to its dependents. Construction validates identifiers,
//! references and acyclicity, and fixes a deterministic topological order (Kahn's algorithm,
//! ties broken by lexical id order).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, instrument};

use crate::error::GraphError;
use crate::types::ResourceDefinition;

/// Validated, acyclic set of resource definitions.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
  definitions: BTreeMap<String, ResourceDefinition>,
  /// Deduplicated dependencies per id.
  dependencies: BTreeMap<String, BTreeSet<String>>,
  /// Dependents per id (reverse edges).
  dependents: BTreeMap<String, BTreeSet<String>>,
  order: Vec<String>,
  depth: BTreeMap<String, usize>,
}

impl ResourceGraph {
  /// Builds the graph. Fails on duplicate ids, unknown dependencies or cycles.
  #[instrument(level = "trace", skip(definitions))]
  pub fn build(
    definitions: impl IntoIterator<Item = ResourceDefinition>,
  ) -> Result<Self, GraphError> {
    let mut defs = BTreeMap::new();
    for def in definitions {
      if defs.contains_key(&def.id) {
        return Err(GraphError::DuplicateIdentifier(def.id));
      }
      defs.insert(def.id.clone(), def);
    }

    let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut dependents: BTreeMap<String, BTreeSet<String>> =
      defs.keys().map(|id| (id.clone(), BTreeSet::new())).collect();
    for (id, def) in &defs {
      let mut deps = BTreeSet::new();
      for dep in &def.depends_on {
        if !defs.contains_key(dep) {
          return Err(GraphError::DanglingReference {
            resource: id.clone(),
            missing: dep.clone(),
          });
        }
        deps.insert(dep.clone());
        if let Some(set) = dependents.get_mut(dep) {
          set.insert(id.clone());
        }
      }
      dependencies.insert(id.clone(), deps);
    }

    let order = topological_order(&dependencies, &dependents)?;

    let mut depth = BTreeMap::new();
    for id in &order {
      let d = dependencies[id]
        .iter()
        .map(|dep| depth.get(dep).copied().unwrap_or(0) + 1)
        .max()
        .unwrap_or(0);
      depth.insert(id.clone(), d);
    }

    debug!(resources = defs.len(), "resource graph built");
    Ok(Self {
      definitions: defs,
      dependencies,
      dependents,
      order,
      depth,
    })
  }

  pub fn len(&self) -> usize {
    self.definitions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.definitions.is_empty()
  }

  pub fn contains(&self, id: &str) -> bool {
    self.definitions.contains_key(id)
  }

  pub fn get(&self, id: &str) -> Option<&ResourceDefinition> {
    self.definitions.get(id)
  }

  /// Ids with every dependency before its dependents; ties in lexical order.
  pub fn topological_order(&self) -> &[String] {
    &self.order
  }

  pub fn definitions_in_order(&self) -> impl Iterator<Item = &ResourceDefinition> {
    self.order.iter().filter_map(|id| self.definitions.get(id))
  }

  /// Length of the longest dependency chain below `id` (0 for roots).
  pub fn depth(&self, id: &str) -> Option<usize> {
    self.depth.get(id).copied()
  }

  /// Ids grouped by depth; each tier sorted lexically.
  pub fn tiers(&self) -> Vec<Vec<String>> {
    let mut tiers: Vec<Vec<String>> = Vec::new();
    for (id, &d) in &self.depth {
      if tiers.len() <= d {
        tiers.resize_with(d + 1, Vec::new);
      }
      tiers[d].push(id.clone());
    }
    tiers
  }

  pub fn dependencies<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a String> + use<'a> {
    self.dependencies.get(id).into_iter().flatten()
  }

  /// Direct dependents of `id`.
  pub fn dependents<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a String> + use<'a> {
    self.dependents.get(id).into_iter().flatten()
  }

  /// Every resource that depends on `id`, directly or not.
  pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<&String> = self.dependents(id).collect();
    while let Some(next) = queue.pop_front() {
      if seen.insert(next.clone()) {
        queue.extend(self.dependents(next));
      }
    }
    seen
  }
}

/// Kahn's algorithm over an ordered ready set. On leftover nodes, reports one cycle.
fn topological_order(
  dependencies: &BTreeMap<String, BTreeSet<String>>,
  dependents: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, GraphError> {
  let mut in_degree: BTreeMap<&String, usize> =
    dependencies.iter().map(|(id, deps)| (id, deps.len())).collect();
  let mut ready: BTreeSet<&String> = in_degree
    .iter()
    .filter(|(_, d)| **d == 0)
    .map(|(id, _)| *id)
    .collect();
  let mut order = Vec::with_capacity(dependencies.len());

  while let Some(id) = ready.pop_first() {
    order.push(id.clone());
    for dependent in &dependents[id] {
      if let Some(d) = in_degree.get_mut(dependent) {
        *d -= 1;
        if *d == 0 {
          ready.insert(dependent);
        }
      }
    }
  }

  if order.len() == dependencies.len() {
    return Ok(order);
  }

  let remaining: BTreeSet<&String> = in_degree
    .into_iter()
    .filter(|(_, d)| *d > 0)
    .map(|(id, _)| id)
    .collect();
  Err(GraphError::Cycle {
    cycle: find_cycle(dependencies, &remaining),
  })
}

/// Walks dependency edges among nodes Kahn could not order. Each of them still has an unordered
/// dependency, so the walk must revisit a node; the revisited suffix is a cycle.
fn find_cycle(
  dependencies: &BTreeMap<String, BTreeSet<String>>,
  remaining: &BTreeSet<&String>,
) -> Vec<String> {
  let Some(start) = remaining.first() else {
    return vec![];
  };
  let mut path: Vec<&String> = vec![*start];
  let mut position: BTreeMap<&String, usize> = BTreeMap::from([(*start, 0)]);
  loop {
    let current = path[path.len() - 1];
    let next = dependencies[current]
      .iter()
      .find(|dep| remaining.contains(dep));
    let Some(next) = next else {
      return path.into_iter().cloned().collect();
    };
    if let Some(&at) = position.get(next) {
      let mut cycle: Vec<String> = path[at..].iter().map(|s| (*s).clone()).collect();
      // Start at the lexically smallest member so reports are stable.
      if let Some(min_at) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
      {
        cycle.rotate_left(min_at);
      }
      return cycle;
    }
    position.insert(next, path.len());
    path.push(next);
  }
}
