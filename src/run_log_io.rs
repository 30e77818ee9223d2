//! Archive of pipeline runs as `<run_dir>/runs/<run_id>.json`.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::types::PipelineRun;

/// Subdirectory of the run directory holding one JSON file per run.
pub const RUNS_DIRNAME: &str = "runs";

/// Path of the archived record for `run_id` under `run_dir`.
pub fn run_record_path(run_dir: &Path, run_id: Uuid) -> PathBuf {
  run_dir.join(RUNS_DIRNAME).join(format!("{}.json", run_id))
}

/// Loads an archived run. Errors if the file is missing or not a run record.
pub fn load_run_record(path: &Path) -> Result<PipelineRun, std::io::Error> {
  let bytes = std::fs::read(path)?;
  serde_json::from_slice(&bytes)
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Writes `run` to its archive path (rewritten after each stage). Partial records are written
/// with `finished_at: None` so an interrupted run never looks finished.
/// Creates the parent directory if needed.
pub fn write_run_record(run_dir: &Path, run: &PipelineRun) -> Result<PathBuf, std::io::Error> {
  let path = run_record_path(run_dir, run.id);
  let record = if run.state.is_terminal() {
    run.clone()
  } else {
    PipelineRun {
      finished_at: None,
      ..run.clone()
    }
  };
  let json = serde_json::to_string_pretty(&record)
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::write(&path, json)?;
  Ok(path)
}

/// Every archived run under `run_dir`, oldest first. Unreadable files are skipped.
pub fn list_run_records(run_dir: &Path) -> Result<Vec<PipelineRun>, std::io::Error> {
  let dir = run_dir.join(RUNS_DIRNAME);
  if !dir.exists() {
    return Ok(vec![]);
  }
  let mut runs: Vec<PipelineRun> = std::fs::read_dir(dir)?
    .filter_map(Result::ok)
    .map(|entry| entry.path())
    .filter(|p| p.extension().is_some_and(|e| e == "json"))
    .filter_map(|p| load_run_record(&p).ok())
    .collect();
  runs.sort_by_key(|r| r.created_at);
  Ok(runs)
}
