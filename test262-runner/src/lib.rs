use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub mod config;
pub mod discover;
pub mod executor;
pub mod frontmatter;
pub mod report;
pub mod runner;
pub mod sandbox;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
  #[error("{what} not found at {}", path.display())]
  MissingInput { what: &'static str, path: PathBuf },
  #[error("no tests matched selectors: {}", .0.join(", "))]
  NoTestsSelected(Vec<String>),
  #[error("invalid selector '{pattern}': {source}")]
  InvalidSelector {
    pattern: String,
    source: globset::Error,
  },
  #[error("failed to load harness helper {}: {source}", path.display())]
  HelperLoad { path: PathBuf, source: io::Error },
  #[error("invalid config {}: {message}", path.display())]
  Config { path: PathBuf, message: String },
  #[error(transparent)]
  Io(#[from] io::Error),
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

impl HarnessError {
  /// Whether the run never started because an input was absent.
  pub fn is_missing_input(&self) -> bool {
    matches!(
      self,
      HarnessError::MissingInput { .. } | HarnessError::NoTestsSelected(_)
    )
  }
}

pub use config::RunConfig;
pub use discover::{discover_tests, DiscoveredTest};
pub use executor::{ErrorPayload, Executor, HostExecutor, ProgramLayout, Script};
pub use frontmatter::{extract, Metadata};
pub use report::{report, ReportOptions};
pub use runner::{Outcome, RunOptions, RunSummary, Runner};
pub use sandbox::{BodyMode, ExecOutcome, Sandbox};
