//! CLI: plan, run or serve infrastructure pipelines.
//!
//! Usage:
//!   `run_pipeline run <definitions.{json,dot}>`
//!   `run_pipeline plan <definitions.{json,dot}>`
//!   `run_pipeline serve --addr 127.0.0.1:8080`
//!
//! State is kept in `<run-dir>/state.json`; run records in `<run-dir>/runs/`. Without a real
//! cloud backend configured, commands drive the simulated provider.
//!
//! Set RUST_LOG=clusterweave=trace for TRACE-level span enter/exit and events.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use clusterweave::simulated::SimulatedCloud;
use clusterweave::types::ApplyOutcome;
use clusterweave::{
  ApprovalMode, DefinitionsSource, FileDefinitionsSource, FileStateStore, OrchestratorConfig,
  PipelineCoordinator, PipelineState, ResourceGraph, RunRequest, StateStore, compute_change_set,
  http,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

const RUN_DIR: &str = ".clusterweave";

/// Provision infrastructure and deploy workloads in dependency order.
#[derive(Parser, Debug)]
#[command(name = "run_pipeline")]
#[command(
  after_help = r#"Environment variables (override the config file when set):
  CLUSTERWEAVE_MAX_CONCURRENCY           Operations applied in parallel within a tier.
  CLUSTERWEAVE_MAX_ATTEMPTS              Attempts per operation, including the first.
  CLUSTERWEAVE_POLL_INTERVAL_MS          Convergence poll interval.
  CLUSTERWEAVE_CONVERGENCE_TIMEOUT_SECS  Time a resource may take to become ready.
  CLUSTERWEAVE_RUN_DIR                   State and run archive directory (default: .clusterweave).

Examples:
  run_pipeline plan infra.dot
  run_pipeline run --approve infra.json
  run_pipeline serve --addr 0.0.0.0:8080"#
)]
struct Args {
  /// JSON configuration file.
  #[arg(long, value_name = "FILE", global = true)]
  config: Option<PathBuf>,

  /// State and run archive directory. Overridden by CLUSTERWEAVE_RUN_DIR if set.
  #[arg(long, value_name = "DIR", global = true)]
  run_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Plan, apply, converge and verify.
  Run {
    /// Path to the definitions file (.json or .dot)
    #[arg(value_name = "definitions")]
    definitions: PathBuf,
  },
  /// Print the change-set without applying it.
  Plan {
    #[arg(value_name = "definitions")]
    definitions: PathBuf,
  },
  /// Accept runs over HTTP.
  Serve {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// Require POST /runs/:id/approve before applying, waiting up to this many seconds.
    #[arg(long, value_name = "SECS")]
    manual_approval: Option<u64>,
  },
}

fn fail(message: impl std::fmt::Display) -> ! {
  eprintln!("Error: {}", message);
  process::exit(1);
}

fn load_config(args: &Args) -> OrchestratorConfig {
  let mut config = match &args.config {
    Some(path) => OrchestratorConfig::from_file(path).unwrap_or_else(|e| fail(e)),
    None => OrchestratorConfig::default(),
  };
  if let Some(dir) = &args.run_dir {
    config.run_dir = Some(dir.clone());
  }
  // Env vars override flags and the config file.
  let mut config = config
    .with_overrides(|key| std::env::var(key).ok())
    .unwrap_or_else(|e| fail(e));
  if config.run_dir.is_none() {
    config.run_dir = Some(PathBuf::from(RUN_DIR));
  }
  config
}

fn load_definitions(path: &Path) -> Vec<clusterweave::ResourceDefinition> {
  FileDefinitionsSource::new(path)
    .load()
    .unwrap_or_else(|e| fail(format!("{}: {}", path.display(), e)))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
    .init();

  let args = Args::parse();
  let mut config = load_config(&args);
  let run_dir = config.run_dir.clone().unwrap_or_else(|| PathBuf::from(RUN_DIR));
  info!(run_dir = %run_dir.display(), "run_pipeline starting");

  let store: Arc<dyn StateStore> = match FileStateStore::open(&run_dir).await {
    Ok(s) => Arc::new(s),
    Err(e) => fail(format!("opening state in {}: {}", run_dir.display(), e)),
  };
  let cloud = Arc::new(SimulatedCloud::new());

  match args.command {
    Command::Plan { definitions } => {
      let graph = ResourceGraph::build(load_definitions(&definitions)).unwrap_or_else(|e| fail(e));
      let snapshot = store.snapshot().await.unwrap_or_else(|e| fail(e));
      let change_set = compute_change_set(&graph, &snapshot);
      if change_set.is_empty() {
        println!("No changes. Infrastructure matches the definitions.");
        return;
      }
      let (creates, updates, deletes) = change_set.counts();
      println!("Plan: {} to create, {} to update, {} to delete.", creates, updates, deletes);
      for change in change_set.summary() {
        println!("  tier {}: {} {}", change.tier, change.action, change.id);
      }
    }
    Command::Run { definitions } => {
      let coordinator = PipelineCoordinator::new(cloud.backends(), store, config);
      let run = coordinator
        .run(RunRequest::new(load_definitions(&definitions)))
        .await;

      info!(run_id = %run.id, state = %run.state, "pipeline finished");
      println!("Run {} {}.", run.id, run.state);
      for stage in &run.stages {
        let outcome = stage
          .outcome
          .map(|o| format!("{:?}", o))
          .unwrap_or_else(|| "open".to_string());
        println!(
          "  {:<18} {:<10} {}",
          stage.stage.to_string(),
          outcome,
          stage.detail.as_deref().unwrap_or("")
        );
      }
      for result in &run.apply_results {
        let marker = if result.outcome == ApplyOutcome::Applied { "+" } else { "!" };
        println!(
          "  {} {} {} ({}){}",
          marker,
          result.action,
          result.id,
          result.outcome,
          result
            .error
            .as_ref()
            .map(|e| format!(": {}", e))
            .unwrap_or_default()
        );
      }
      for report in &run.convergence {
        println!("  {} {}", report.id, report.outcome);
      }
      if let Some(error) = &run.error {
        println!("  Error: {}", error);
      }
      if run.state != PipelineState::Succeeded {
        process::exit(1);
      }
    }
    Command::Serve {
      addr,
      manual_approval,
    } => {
      if let Some(timeout_secs) = manual_approval {
        config.approval = ApprovalMode::Manual { timeout_secs };
      }
      let coordinator = PipelineCoordinator::new(cloud.backends(), store, config);
      if let Err(e) = http::serve(coordinator, addr).await {
        fail(e);
      }
    }
  }
}
