//! Orchestrator data model: definitions, state records, change-sets, outcomes and pipeline runs.

mod apply_outcome;
mod change_set;
mod convergence_report;
mod pipeline_run;
mod resource_definition;
#[cfg(test)]
mod resource_definition_test;
mod resource_status;
mod state_record;

pub use apply_outcome::{ApplyOutcome, OperationResult};
pub use change_set::{ChangeAction, ChangeOperation, ChangeSet, PlannedChange};
pub use convergence_report::{ConvergenceOutcome, ConvergenceReport};
pub use pipeline_run::{PipelineRun, PipelineState, StageOutcome, StageResult};
pub use resource_definition::{MANIFEST_KEY, ResourceConfig, ResourceDefinition, ResourceKind};
pub use resource_status::ResourceStatus;
pub use state_record::{StateRecord, StateSnapshot};
