//! DOT front end for resource definitions.
//!
//! ```text
//! digraph infra {
//!   net     [kind=network, cidr="10.0.0.0/16"]
//!   cluster [kind="compute-cluster", min_nodes=2]
//!   web     [kind=workload, replicas=3]
//!   net -> cluster -> web
//! }
//! ```
//!
//! Node attribute `kind` is required; every other attribute becomes config. An edge `a -> b`
//! means `b` depends on `a`. Edge attributes, `graph`/`node`/`edge` defaults and subgraphs are
//! accepted and ignored.

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use crate::error::ParseError;
use crate::types::{ResourceConfig, ResourceDefinition, ResourceKind};

/// Nodes in declaration order plus dependency edges.
#[derive(Debug, Default)]
struct DotGraph {
  order: Vec<String>,
  attrs: BTreeMap<String, ResourceConfig>,
  edges: Vec<(String, String)>,
}

impl DotGraph {
  fn declare(&mut self, id: &str, attrs: AttrList) {
    if !self.attrs.contains_key(id) {
      self.order.push(id.to_string());
    }
    self.attrs.entry(id.to_string()).or_default().extend(attrs);
  }
}

/// Parses a DOT digraph into resource definitions, in declaration order.
#[instrument(level = "trace", skip(source))]
pub fn parse_definitions(source: &str) -> Result<Vec<ResourceDefinition>, ParseError> {
  let source = strip_comments(source);
  let source = source.trim();

  let rest = source
    .strip_prefix("digraph")
    .ok_or("Expected 'digraph' at start")?
    .trim_start();
  // The graph name is optional.
  let rest = match parse_id(rest) {
    Ok((_, rest)) => rest.trim_start(),
    Err(_) => rest,
  };
  let rest = rest
    .strip_prefix('{')
    .ok_or("Expected '{' after graph name")?;

  let mut graph = DotGraph::default();
  let mut remaining = rest.trim();
  while !remaining.is_empty() && !remaining.starts_with('}') {
    remaining = parse_statement(remaining, &mut graph)?;
    remaining = remaining.trim();
  }
  if !remaining.starts_with('}') {
    return Err(ParseError::Dot("Expected '}' at end of graph".to_string()));
  }

  into_definitions(graph)
}

fn into_definitions(mut graph: DotGraph) -> Result<Vec<ResourceDefinition>, ParseError> {
  let mut dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();
  for (from, to) in &graph.edges {
    for end in [from, to] {
      if !graph.attrs.contains_key(end) {
        return Err(ParseError::UndeclaredResource(end.clone()));
      }
    }
    let deps = dependencies.entry(to.clone()).or_default();
    if !deps.contains(from) {
      deps.push(from.clone());
    }
  }

  let mut definitions = Vec::with_capacity(graph.order.len());
  for id in &graph.order {
    let mut config = graph.attrs.remove(id).unwrap_or_default();
    let kind = config
      .remove("kind")
      .ok_or_else(|| ParseError::MissingKind(id.clone()))?;
    let kind: ResourceKind = kind.parse().map_err(|_| ParseError::UnknownKind {
      id: id.clone(),
      kind: kind.clone(),
    })?;
    definitions.push(ResourceDefinition {
      id: id.clone(),
      kind,
      config,
      depends_on: dependencies.remove(id).unwrap_or_default(),
    });
  }
  debug!(resources = definitions.len(), "definitions parsed from DOT");
  Ok(definitions)
}

/// Strips `//` and `/* */` style comments from DOT source. Quoted strings are left alone.
pub(crate) fn strip_comments(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  let mut chars = s.chars().peekable();
  let mut in_string = false;
  while let Some(c) = chars.next() {
    if in_string {
      out.push(c);
      match c {
        '\\' => {
          if let Some(next) = chars.next() {
            out.push(next);
          }
        }
        '"' => in_string = false,
        _ => {}
      }
      continue;
    }
    match (c, chars.peek()) {
      ('"', _) => {
        in_string = true;
        out.push(c);
      }
      ('/', Some('/')) => {
        for next in chars.by_ref() {
          if next == '\n' {
            out.push('\n');
            break;
          }
        }
      }
      ('/', Some('*')) => {
        chars.next();
        let mut prev = '\0';
        for next in chars.by_ref() {
          if prev == '*' && next == '/' {
            break;
          }
          prev = next;
        }
      }
      _ => out.push(c),
    }
  }
  out
}

/// Parses a bare identifier. Letters, digits, `_`, `-` and `.` are allowed; `->` ends it.
pub(crate) fn parse_identifier(s: &str) -> Option<(&str, &str)> {
  let s = s.trim_start();
  let bytes = s.as_bytes();
  let mut end = 0;
  while end < bytes.len() {
    let c = bytes[end];
    if c == b'-' && bytes.get(end + 1) == Some(&b'>') {
      break;
    }
    if !(c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'.') {
      break;
    }
    end += 1;
  }
  if end > 0 {
    Some((&s[..end], &s[end..]))
  } else {
    None
  }
}

/// Parses a node id: quoted string or bare identifier.
fn parse_id(s: &str) -> Result<(String, &str), ParseError> {
  let s = s.trim_start();
  if s.starts_with('"') {
    return parse_quoted(s);
  }
  let (id, rest) = parse_identifier(s).ok_or("Expected identifier")?;
  Ok((id.to_string(), rest))
}

/// Parses a single statement into `graph`. Returns the unconsumed remainder.
fn parse_statement<'a>(s: &'a str, graph: &mut DotGraph) -> Result<&'a str, ParseError> {
  let s = s.trim_start();
  if let Some(rest) = s.strip_prefix(';') {
    return Ok(rest);
  }
  for keyword in ["graph", "node", "edge"] {
    match s.strip_prefix(keyword) {
      Some(rest) if rest.trim_start().starts_with('[') => return skip_attr_block(rest),
      _ => {}
    }
  }
  if s.starts_with("subgraph") || s.starts_with('{') {
    return skip_subgraph(s);
  }

  let (id, rest) = parse_id(s)?;
  let rest = rest.trim_start();

  if rest.starts_with('=') {
    return skip_assign(rest);
  }
  if rest.starts_with("->") {
    return parse_edge_stmt(&id, rest, graph);
  }
  if rest.starts_with('[') {
    let (attrs, rest) = parse_attr_block(rest)?;
    graph.declare(&id, attrs);
    return Ok(rest.trim_start().trim_start_matches(';'));
  }
  graph.declare(&id, Vec::new());
  Ok(rest.trim_start().trim_start_matches(';'))
}

/// List of key-value attribute pairs from DOT `[key=value,...]` blocks.
type AttrList = Vec<(String, String)>;

/// Parses `[key=value,...]` and returns the attributes plus the remainder.
fn parse_attr_block(s: &str) -> Result<(AttrList, &str), ParseError> {
  let s = s.trim_start().strip_prefix('[').ok_or("Expected '['")?;
  let mut attrs = Vec::new();
  let mut remaining = s.trim_start();
  while !remaining.starts_with(']') {
    if remaining.is_empty() {
      return Err("Unclosed attribute block".into());
    }
    let (k, rest) = parse_id(remaining)?;
    let rest = rest.trim_start().strip_prefix('=').ok_or("Expected '='")?;
    let (v, rest) = parse_value(rest)?;
    attrs.push((k, v));
    remaining = rest.trim_start().trim_start_matches([',', ';']).trim_start();
  }
  Ok((attrs, remaining[1..].trim_start()))
}

/// Unescapes DOT quoted string escape sequences (\\n, \\t, \\\", \\\\).
pub(crate) fn unescape_quoted_string(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  let mut chars = s.chars();
  while let Some(c) = chars.next() {
    if c != '\\' {
      out.push(c);
      continue;
    }
    match chars.next() {
      Some('n') => out.push('\n'),
      Some('t') => out.push('\t'),
      Some(other) => out.push(other),
      None => out.push('\\'),
    }
  }
  out
}

fn parse_quoted(s: &str) -> Result<(String, &str), ParseError> {
  let bytes = s.as_bytes();
  let mut end = 1;
  while end < bytes.len() {
    match bytes[end] {
      b'\\' => end += 2,
      b'"' => return Ok((unescape_quoted_string(&s[1..end]), &s[end + 1..])),
      _ => end += 1,
    }
  }
  Err("Unterminated string".into())
}

/// Parses a quoted string, number, or identifier value and returns it plus the remainder.
pub(crate) fn parse_value(s: &str) -> Result<(String, &str), ParseError> {
  let s = s.trim_start();
  if s.starts_with('"') {
    return parse_quoted(s);
  }
  let (v, rest) = parse_identifier(s).ok_or("Expected value")?;
  Ok((v.to_string(), rest))
}

/// Parses an edge chain `a -> b -> c [attrs]`; each target depends on its predecessor.
fn parse_edge_stmt<'a>(from: &str, s: &'a str, graph: &mut DotGraph) -> Result<&'a str, ParseError> {
  let mut prev = from.to_string();
  let mut s = s;
  while let Some(rest) = s.trim_start().strip_prefix("->") {
    let (to, rest) = parse_id(rest)?;
    graph.edges.push((prev, to.clone()));
    prev = to;
    s = rest;
  }
  let s = s.trim_start();
  let s = if s.starts_with('[') { skip_attr_block(s)? } else { s };
  Ok(s.trim_start().trim_start_matches(';'))
}

/// Skips a balanced `[...]` attribute block and returns the remainder.
fn skip_attr_block(s: &str) -> Result<&str, ParseError> {
  let s = s.trim_start();
  let idx = s.find('[').ok_or("Expected '['")?;
  let mut depth = 0;
  for (j, c) in s[idx..].char_indices() {
    match c {
      '[' => depth += 1,
      ']' => {
        depth -= 1;
        if depth == 0 {
          return Ok(s[idx + j + 1..].trim_start().trim_start_matches(';'));
        }
      }
      _ => {}
    }
  }
  Err("Unclosed attribute block".into())
}

/// Skips an assignment `key=value;` and returns the remainder.
fn skip_assign(s: &str) -> Result<&str, ParseError> {
  let rest = s.trim_start().strip_prefix('=').ok_or("Expected '='")?;
  let (_, rest) = parse_value(rest)?;
  Ok(rest.trim_start().trim_start_matches(';'))
}

/// Skips a balanced `{...}` subgraph and returns the remainder.
fn skip_subgraph(s: &str) -> Result<&str, ParseError> {
  let start = s.find('{').ok_or("Expected '{'")?;
  let mut depth = 0;
  for (i, c) in s[start..].char_indices() {
    match c {
      '{' => depth += 1,
      '}' => {
        depth -= 1;
        if depth == 0 {
          return Ok(&s[start + i + 1..]);
        }
      }
      _ => {}
    }
  }
  Err("Unclosed subgraph".into())
}
