//! Last known status of an externally provisioned resource.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Last known status of an externally provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
  Absent,
  Creating,
  Updating,
  Ready,
  Degraded,
  Deleting,
  Failed,
}

impl ResourceStatus {
  /// Statuses the convergence watcher still has to resolve.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      ResourceStatus::Creating | ResourceStatus::Updating | ResourceStatus::Deleting
    )
  }

  /// Statuses that make the next plan re-apply the resource even when its hash is unchanged.
  pub fn needs_remediation(&self) -> bool {
    matches!(self, ResourceStatus::Failed | ResourceStatus::Degraded)
  }
}

impl fmt::Display for ResourceStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ResourceStatus::Absent => "absent",
      ResourceStatus::Creating => "creating",
      ResourceStatus::Updating => "updating",
      ResourceStatus::Ready => "ready",
      ResourceStatus::Degraded => "degraded",
      ResourceStatus::Deleting => "deleting",
      ResourceStatus::Failed => "failed",
    };
    f.write_str(s)
  }
}
