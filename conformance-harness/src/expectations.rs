use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Lines whose trimmed text starts with this marker are comments.
pub const COMMENT_MARKER: char = '#';

/// Identity of a list inside an [`ExpectationRegistry`], in load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListId(usize);

impl fmt::Display for ListId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
  /// A test id. `raw` keeps the original text including its terminator.
  Entry { raw: String, id: String },
  /// A blank or comment line, kept verbatim.
  Verbatim(String),
}

impl Line {
  fn raw(&self) -> &str {
    match self {
      Line::Entry { raw, .. } => raw,
      Line::Verbatim(raw) => raw,
    }
  }
}

/// A single expected-failure file: one test id per line.
#[derive(Debug, Clone)]
pub struct ExpectationList {
  path: PathBuf,
  lines: Vec<Line>,
  members: BTreeSet<String>,
}

impl ExpectationList {
  pub fn from_path(path: &Path) -> Result<Self> {
    let raw = fs::read_to_string(path)
      .with_context(|| format!("read expectation list {}", path.display()))?;
    Ok(Self::parse(path.to_path_buf(), &raw))
  }

  pub fn parse(path: PathBuf, raw: &str) -> Self {
    let mut lines = Vec::new();
    let mut members = BTreeSet::new();
    for segment in raw.split_inclusive('\n') {
      let trimmed = segment.trim();
      if trimmed.is_empty() || trimmed.starts_with(COMMENT_MARKER) {
        lines.push(Line::Verbatim(segment.to_string()));
        continue;
      }
      members.insert(trimmed.to_string());
      lines.push(Line::Entry {
        raw: segment.to_string(),
        id: trimmed.to_string(),
      });
    }

    Self {
      path,
      lines,
      members,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn contains(&self, id: &str) -> bool {
    self.members.contains(id)
  }

  pub fn members(&self) -> &BTreeSet<String> {
    &self.members
  }

  /// The file content as it would be written back.
  pub fn render(&self) -> String {
    self.lines.iter().map(Line::raw).collect()
  }

  /// Drops every entry line whose id is in `remove`, returning how many lines went away.
  fn remove_entries(&mut self, remove: &BTreeSet<String>) -> usize {
    let before = self.lines.len();
    self.lines.retain(|line| match line {
      Line::Entry { id, .. } => !remove.contains(id),
      Line::Verbatim(_) => true,
    });
    self.members.retain(|id| !remove.contains(id));
    before - self.lines.len()
  }
}

/// All expected-failure lists loaded for a run.
#[derive(Debug, Clone, Default)]
pub struct ExpectationRegistry {
  lists: Vec<ExpectationList>,
}

impl ExpectationRegistry {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn load(paths: &[PathBuf]) -> Result<Self> {
    let lists = paths
      .iter()
      .map(|path| ExpectationList::from_path(path))
      .collect::<Result<Vec<_>>>()?;
    Ok(Self { lists })
  }

  pub fn from_lists(lists: Vec<ExpectationList>) -> Self {
    Self { lists }
  }

  pub fn is_empty(&self) -> bool {
    self.lists.is_empty()
  }

  pub fn list(&self, id: ListId) -> &ExpectationList {
    &self.lists[id.0]
  }

  pub fn lists(&self) -> impl Iterator<Item = (ListId, &ExpectationList)> {
    self
      .lists
      .iter()
      .enumerate()
      .map(|(idx, list)| (ListId(idx), list))
  }

  /// Every list naming `test_id`, in load order. An id may be listed more than once.
  pub fn relevant_lists(&self, test_id: &str) -> Vec<ListId> {
    self
      .lists()
      .filter(|(_, list)| list.contains(test_id))
      .map(|(id, _)| id)
      .collect()
  }

  /// Rewrites the list's file without the lines naming ids in `remove`.
  ///
  /// Every other line, comments and blank lines included, is written back
  /// byte-for-byte in its original position. Nothing is written when no line
  /// matches. Returns the number of removed lines.
  pub fn reconcile(&mut self, list: ListId, remove: &BTreeSet<String>) -> Result<usize> {
    let target = &mut self.lists[list.0];
    if !remove.iter().any(|id| target.contains(id)) {
      return Ok(0);
    }

    let mut updated = target.clone();
    let removed = updated.remove_entries(remove);
    fs::write(&updated.path, updated.render())
      .with_context(|| format!("write expectation list {}", updated.path.display()))?;
    tracing::debug!(path = %updated.path.display(), removed, "rewrote expectation list");
    *target = updated;
    Ok(removed)
  }
}
