//! Capability interfaces for the external systems the orchestrator drives.
//!
//! Infrastructure kinds (network, cluster, node group) go through [`ProvisioningApi`];
//! workloads go through [`OrchestratorApi`]. Both are object-safe so tests and the CLI can
//! swap in a simulated backend.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::types::{ResourceConfig, ResourceKind};

/// Lifecycle phase reported by the provisioning API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderPhase {
  Pending,
  Provisioning,
  Available,
  Failed,
  NotFound,
}

impl fmt::Display for ProviderPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ProviderPhase::Pending => "pending",
      ProviderPhase::Provisioning => "provisioning",
      ProviderPhase::Available => "available",
      ProviderPhase::Failed => "failed",
      ProviderPhase::NotFound => "not_found",
    };
    f.write_str(s)
  }
}

/// One observation of a provisioned resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
  pub phase: ProviderPhase,
  /// Only meaningful for compute clusters.
  pub control_plane_reachable: bool,
  /// Active nodes for clusters and node groups.
  pub active_nodes: u32,
  pub message: Option<String>,
}

impl StatusReport {
  pub fn phase(phase: ProviderPhase) -> Self {
    Self {
      phase,
      control_plane_reachable: false,
      active_nodes: 0,
      message: None,
    }
  }
}

/// Replica counts reported by the orchestrator for one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
  pub replicas_ready: u32,
  pub replicas_desired: u32,
}

#[async_trait]
pub trait ProvisioningApi: Send + Sync {
  /// Creates a resource and returns its provider handle.
  async fn create(
    &self,
    kind: ResourceKind,
    id: &str,
    config: &ResourceConfig,
  ) -> Result<String, ApiError>;

  async fn update(&self, handle: &str, config: &ResourceConfig) -> Result<(), ApiError>;

  async fn delete(&self, handle: &str) -> Result<(), ApiError>;

  async fn status(&self, handle: &str) -> Result<StatusReport, ApiError>;
}

#[async_trait]
pub trait OrchestratorApi: Send + Sync {
  /// Applies a workload manifest (create or update).
  async fn apply_workload(&self, name: &str, manifest: &str) -> Result<(), ApiError>;

  async fn workload_status(&self, name: &str) -> Result<WorkloadStatus, ApiError>;

  async fn delete_workload(&self, name: &str) -> Result<(), ApiError>;

  /// Application-level health probe run during verification.
  async fn health_check(&self, name: &str) -> Result<(), ApiError>;
}

/// The pair of external collaborators handed to the executor, watcher and coordinator.
#[derive(Clone)]
pub struct Backends {
  pub provisioning: Arc<dyn ProvisioningApi>,
  pub orchestrator: Arc<dyn OrchestratorApi>,
}

impl Backends {
  pub fn new(
    provisioning: Arc<dyn ProvisioningApi>,
    orchestrator: Arc<dyn OrchestratorApi>,
  ) -> Self {
    Self {
      provisioning,
      orchestrator,
    }
  }
}

impl fmt::Debug for Backends {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Backends").finish_non_exhaustive()
  }
}
