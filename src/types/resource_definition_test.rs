//! Tests for `ResourceDefinition` and `ResourceKind`.

use super::{ResourceDefinition, ResourceKind};

#[test]
fn kind_parses_both_spellings() {
  assert_eq!(
    "compute-cluster".parse::<ResourceKind>().unwrap(),
    ResourceKind::ComputeCluster
  );
  assert_eq!(
    "compute_cluster".parse::<ResourceKind>().unwrap(),
    ResourceKind::ComputeCluster
  );
  assert_eq!("Node_Group".parse::<ResourceKind>().unwrap(), ResourceKind::NodeGroup);
  assert!("database".parse::<ResourceKind>().is_err());
}

#[test]
fn kind_serializes_kebab_case() {
  let json = serde_json::to_string(&ResourceKind::ComputeCluster).unwrap();
  assert_eq!(json, "\"compute-cluster\"");
  assert_eq!(ResourceKind::NodeGroup.to_string(), "node-group");
}

#[test]
fn config_hash_is_stable_and_order_independent() {
  let a = ResourceDefinition::new("eks", ResourceKind::ComputeCluster)
    .with_config("version", "1.29")
    .with_config("min_nodes", "2");
  let b = ResourceDefinition::new("eks", ResourceKind::ComputeCluster)
    .with_config("min_nodes", "2")
    .with_config("version", "1.29");
  assert_eq!(a.config_hash(), b.config_hash());
  assert_eq!(a.config_hash().len(), 64);
}

#[test]
fn config_hash_changes_with_config_and_kind() {
  let base = ResourceDefinition::new("x", ResourceKind::Network).with_config("cidr", "10.0.0.0/16");
  let changed = base.clone().with_config("cidr", "10.1.0.0/16");
  let other_kind = ResourceDefinition {
    kind: ResourceKind::NodeGroup,
    ..base.clone()
  };
  assert_ne!(base.config_hash(), changed.config_hash());
  assert_ne!(base.config_hash(), other_kind.config_hash());
}

#[test]
fn config_hash_ignores_dependencies() {
  let a = ResourceDefinition::new("w", ResourceKind::Workload);
  let b = a.clone().with_dependency("eks");
  assert_eq!(a.config_hash(), b.config_hash());
}

#[test]
fn config_u32_parses_or_none() {
  let d = ResourceDefinition::new("ng", ResourceKind::NodeGroup)
    .with_config("desired_size", " 3 ")
    .with_config("label", "spot");
  assert_eq!(d.config_u32("desired_size"), Some(3));
  assert_eq!(d.config_u32("label"), None);
  assert_eq!(d.config_u32("missing"), None);
}

#[test]
fn workload_manifest_prefers_explicit_manifest() {
  let d = ResourceDefinition::new("web", ResourceKind::Workload)
    .with_config("manifest", "kind: Deployment")
    .with_config("replicas", "2");
  assert_eq!(d.workload_manifest(), "kind: Deployment");

  let implicit = ResourceDefinition::new("web", ResourceKind::Workload).with_config("replicas", "2");
  let parsed: serde_json::Value = serde_json::from_str(&implicit.workload_manifest()).unwrap();
  assert_eq!(parsed["replicas"], "2");
}

#[test]
fn definition_deserializes_with_defaults() {
  let d: ResourceDefinition = serde_json::from_str(r#"{"id":"net","kind":"network"}"#).unwrap();
  assert_eq!(d.kind, ResourceKind::Network);
  assert!(d.config.is_empty());
  assert!(d.depends_on.is_empty());
}
