//! Where resource definitions come from.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::definitions_parser::parse_definitions;
use crate::error::ParseError;
use crate::types::ResourceDefinition;

static RESOURCE_ID: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,62}$").expect("valid resource id pattern")
});

/// Produces a fresh set of definitions for each run.
pub trait DefinitionsSource: Send + Sync {
  fn load(&self) -> Result<Vec<ResourceDefinition>, ParseError>;
}

/// Accepted JSON shapes: a bare array or `{"resources": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionsFile {
  List(Vec<ResourceDefinition>),
  Document { resources: Vec<ResourceDefinition> },
}

/// Reads `.json` or `.dot` files.
#[derive(Debug, Clone)]
pub struct FileDefinitionsSource {
  path: PathBuf,
}

impl FileDefinitionsSource {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl DefinitionsSource for FileDefinitionsSource {
  #[instrument(level = "trace", skip(self), fields(path = %self.path.display()))]
  fn load(&self) -> Result<Vec<ResourceDefinition>, ParseError> {
    let extension = self
      .path
      .extension()
      .and_then(|e| e.to_str())
      .map(str::to_ascii_lowercase);
    let definitions = match extension.as_deref() {
      Some("json") => parse_json(&std::fs::read_to_string(&self.path)?)?,
      Some("dot") | Some("gv") => parse_definitions(&std::fs::read_to_string(&self.path)?)?,
      _ => {
        return Err(ParseError::UnsupportedFormat(
          self.path.display().to_string(),
        ));
      }
    };
    validate_ids(&definitions)?;
    debug!(resources = definitions.len(), "definitions loaded");
    Ok(definitions)
  }
}

/// Definitions held in memory; handed out unchanged on every load.
#[derive(Debug, Clone, Default)]
pub struct StaticDefinitionsSource {
  definitions: Vec<ResourceDefinition>,
}

impl StaticDefinitionsSource {
  pub fn new(definitions: Vec<ResourceDefinition>) -> Self {
    Self { definitions }
  }
}

impl DefinitionsSource for StaticDefinitionsSource {
  fn load(&self) -> Result<Vec<ResourceDefinition>, ParseError> {
    validate_ids(&self.definitions)?;
    Ok(self.definitions.clone())
  }
}

pub fn parse_json(source: &str) -> Result<Vec<ResourceDefinition>, ParseError> {
  Ok(match serde_json::from_str(source)? {
    DefinitionsFile::List(defs) => defs,
    DefinitionsFile::Document { resources } => resources,
  })
}

/// Ids must be 1-63 characters of letters, digits, `_`, `-` or `.`, starting alphanumeric.
pub fn validate_ids(definitions: &[ResourceDefinition]) -> Result<(), ParseError> {
  for def in definitions {
    if !RESOURCE_ID.is_match(&def.id) {
      return Err(ParseError::InvalidIdentifier(def.id.clone()));
    }
    if let Some(dep) = def.depends_on.iter().find(|d| !RESOURCE_ID.is_match(d)) {
      return Err(ParseError::InvalidIdentifier(dep.clone()));
    }
  }
  Ok(())
}
