use crate::{HarnessError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Selectors used when none are given on the command line.
pub const DEFAULT_SELECTORS: &[&str] = &["built-ins/**/*.js", "intl402/**/*.js"];

const FIXTURE_SUFFIX: &str = "_FIXTURE.js";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTest {
  /// Path relative to `<test262>/test`, always `/`-separated.
  pub id: String,
  pub path: PathBuf,
}

/// Finds every test under `<test262>/test` matching one of `selectors`, sorted by id.
pub fn discover_tests(test262_dir: &Path, selectors: &[String]) -> Result<Vec<DiscoveredTest>> {
  let test_dir = test262_dir.join("test");
  if !test_dir.is_dir() {
    return Err(HarnessError::MissingInput {
      what: "test262 test directory",
      path: test_dir,
    });
  }

  let selectors: Vec<String> = if selectors.is_empty() {
    DEFAULT_SELECTORS.iter().map(|s| s.to_string()).collect()
  } else {
    selectors.to_vec()
  };
  let matcher = compile_selectors(&selectors)?;

  let mut out = Vec::new();
  for entry in WalkDir::new(&test_dir).into_iter().filter_map(|e| e.ok()) {
    if !entry.file_type().is_file() {
      continue;
    }
    let path = entry.into_path();
    let id = normalize_id(&test_dir, &path);
    if id.ends_with(FIXTURE_SUFFIX) || !matcher.is_match(&id) {
      continue;
    }
    out.push(DiscoveredTest { id, path });
  }

  if out.is_empty() {
    return Err(HarnessError::NoTestsSelected(selectors));
  }

  out.sort_by(|a, b| a.id.cmp(&b.id));
  tracing::debug!(count = out.len(), "discovered tests");
  Ok(out)
}

fn compile_selectors(patterns: &[String]) -> Result<GlobSet> {
  let mut builder = GlobSetBuilder::new();
  for pattern in patterns {
    let glob = Glob::new(pattern).map_err(|source| HarnessError::InvalidSelector {
      pattern: pattern.clone(),
      source,
    })?;
    builder.add(glob);
  }
  builder
    .build()
    .map_err(|source| HarnessError::InvalidSelector {
      pattern: patterns.join(", "),
      source,
    })
}

fn normalize_id(root: &Path, path: &Path) -> String {
  let mut id = path
    .strip_prefix(root)
    .unwrap_or(path)
    .to_string_lossy()
    .into_owned();
  if id.contains('\\') {
    id = id.replace('\\', "/");
  }
  id
}
