//! # clusterweave
//!
//! Dependency-ordered provisioning and deployment orchestrator for managed clusters.
//!
//! ## Architecture
//!
//! A run flows through five components, leaves first:
//!
//! - [`graph`]: validates resource definitions into an acyclic dependency graph.
//! - [`plan`]: diffs the graph against last-applied state into a tiered change-set.
//! - [`executor`]: applies the change-set tier by tier with bounded concurrency and retries.
//! - [`watcher`]: polls external status until applied resources are ready.
//! - [`coordinator`]: sequences plan, approval, apply, convergence and verification.
//!
//! Last-applied state lives behind the [`state::StateStore`] trait. External systems are
//! reached through the capability traits in [`api`]; [`simulated`] provides an in-memory
//! implementation of both.

pub mod abort;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod definitions_io;
pub mod definitions_parser;
pub mod error;
pub mod executor;
pub mod graph;
pub mod http;
pub mod plan;
#[cfg(test)]
mod plan_test;
pub mod retry;
pub mod run_log_io;
pub mod simulated;
pub mod state;
pub mod types;
pub mod watcher;
#[cfg(test)]
mod watcher_test;

pub use api::{Backends, OrchestratorApi, ProvisioningApi};
pub use config::{ApprovalMode, OrchestratorConfig};
pub use coordinator::{PipelineCoordinator, RunRequest};
pub use definitions_io::{DefinitionsSource, FileDefinitionsSource, StaticDefinitionsSource};
pub use error::{GraphError, ParseError, PipelineError, PlanError, StateError};
pub use graph::ResourceGraph;
pub use plan::{compute_change_set, plan};
pub use state::{FileStateStore, MemoryStateStore, StateStore};
pub use types::{PipelineRun, PipelineState, ResourceDefinition, ResourceKind};
