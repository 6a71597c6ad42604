use crate::executor::ProgramLayout;
use crate::runner::{RunOptions, DEFAULT_TIMEOUT, SLOW_TEST_THRESHOLD};
use crate::{HarnessError, Result};
use clap::Args;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run settings accepted on the command line.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
  /// Glob selectors relative to `<test262>/test` (default: built-ins and intl402).
  pub selectors: Vec<String>,

  /// JavaScript file providing the implementation under test.
  #[arg(long, value_name = "PATH")]
  pub subject: Option<PathBuf>,

  /// Root of a tc39/test262 checkout.
  #[arg(long, value_name = "DIR")]
  pub test262_dir: Option<PathBuf>,

  /// File listing test ids expected to fail; may be repeated.
  #[arg(long = "expected-failures", value_name = "PATH")]
  pub expected_failures: Vec<PathBuf>,

  /// Per-test timeout in milliseconds.
  #[arg(long, value_name = "MS")]
  pub timeout: Option<String>,

  /// Skip remaining tests after this many unexpected failures (0 = unlimited).
  #[arg(long, value_name = "N")]
  pub max_failures: Option<usize>,

  /// Remove tests that unexpectedly passed from the expected-failure files.
  #[arg(long)]
  pub update_expected_failures: bool,

  /// JavaScript host used to run each test.
  #[arg(long, value_name = "COMMAND")]
  pub host: Option<PathBuf>,

  /// Extra argument passed to the host before the program path; may be repeated.
  #[arg(long = "host-arg", value_name = "ARG", allow_hyphen_values = true)]
  pub host_args: Vec<String>,

  /// How the program file is laid out (default: `node` for node hosts, else `concatenated`).
  #[arg(long, value_enum, value_name = "LAYOUT")]
  pub host_layout: Option<ProgramLayout>,

  /// Write a JSON report to this path.
  #[arg(long, value_name = "PATH")]
  pub json_out: Option<PathBuf>,

  /// Read settings from a TOML or JSON file; command-line values take precedence.
  #[arg(long, value_name = "PATH")]
  pub config: Option<PathBuf>,
}

/// The same settings as [`RunArgs`], read from a file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct FileConfig {
  pub subject: Option<PathBuf>,
  pub test262_dir: Option<PathBuf>,
  pub selectors: Vec<String>,
  pub expected_failures: Vec<PathBuf>,
  pub timeout: Option<TimeoutValue>,
  pub max_failures: Option<usize>,
  pub update_expected_failures: bool,
  pub host: Option<PathBuf>,
  pub host_args: Vec<String>,
  pub host_layout: Option<ProgramLayout>,
  pub json_out: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TimeoutValue {
  Number(f64),
  Text(String),
}

impl TimeoutValue {
  fn as_text(&self) -> String {
    match self {
      TimeoutValue::Number(n) => n.to_string(),
      TimeoutValue::Text(s) => s.clone(),
    }
  }
}

pub fn load_file_config(path: &Path) -> Result<FileConfig> {
  let raw = std::fs::read_to_string(path).map_err(|err| HarnessError::Config {
    path: path.to_path_buf(),
    message: err.to_string(),
  })?;
  let mut config = parse_file_config(&raw).map_err(|message| HarnessError::Config {
    path: path.to_path_buf(),
    message,
  })?;
  if let Some(base) = path.parent() {
    config.resolve_paths(base);
  }
  Ok(config)
}

pub fn parse_file_config(raw: &str) -> std::result::Result<FileConfig, String> {
  match toml::from_str::<FileConfig>(raw) {
    Ok(config) => Ok(config),
    Err(toml_err) => serde_json::from_str::<FileConfig>(raw).map_err(|json_err| {
      format!("failed to parse config as TOML ({toml_err}) or JSON ({json_err})")
    }),
  }
}

impl FileConfig {
  fn resolve_paths(&mut self, base: &Path) {
    let resolve = |path: &mut PathBuf| {
      if path.is_relative() {
        *path = base.join(&*path);
      }
    };
    self.subject.iter_mut().for_each(resolve);
    self.test262_dir.iter_mut().for_each(resolve);
    self.expected_failures.iter_mut().for_each(resolve);
    self.json_out.iter_mut().for_each(resolve);
  }
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
  pub subject: PathBuf,
  pub test262_dir: PathBuf,
  pub selectors: Vec<String>,
  pub expected_failures: Vec<PathBuf>,
  pub timeout: Duration,
  pub max_failures: Option<usize>,
  pub update_expected_failures: bool,
  pub host: PathBuf,
  pub host_args: Vec<String>,
  pub host_layout: Option<ProgramLayout>,
  pub json_out: Option<PathBuf>,
}

impl RunConfig {
  pub fn resolve(args: RunArgs) -> Result<Self> {
    let file = match &args.config {
      Some(path) => load_file_config(path)?,
      None => FileConfig::default(),
    };
    Self::merge(args, file)
  }

  /// Command-line values win; list-valued options replace rather than extend the file's.
  pub fn merge(args: RunArgs, file: FileConfig) -> Result<Self> {
    let subject = args
      .subject
      .or(file.subject)
      .ok_or_else(|| config_error(&args.config, "missing `subject`"))?;
    let test262_dir = args
      .test262_dir
      .or(file.test262_dir)
      .ok_or_else(|| config_error(&args.config, "missing `test262_dir`"))?;

    let timeout_raw = args
      .timeout
      .or_else(|| file.timeout.as_ref().map(TimeoutValue::as_text));

    Ok(Self {
      subject,
      test262_dir,
      selectors: prefer(args.selectors, file.selectors),
      expected_failures: prefer(args.expected_failures, file.expected_failures),
      timeout: parse_timeout(timeout_raw.as_deref()),
      max_failures: args
        .max_failures
        .or(file.max_failures)
        .filter(|max| *max > 0),
      update_expected_failures: args.update_expected_failures || file.update_expected_failures,
      host: args
        .host
        .or(file.host)
        .unwrap_or_else(|| PathBuf::from("node")),
      host_args: prefer(args.host_args, file.host_args),
      host_layout: args.host_layout.or(file.host_layout),
      json_out: args.json_out.or(file.json_out),
    })
  }

  pub fn harness_dir(&self) -> PathBuf {
    self.test262_dir.join("harness")
  }

  pub fn run_options(&self) -> RunOptions {
    RunOptions {
      timeout: self.timeout,
      max_failures: self.max_failures,
      slow_threshold: SLOW_TEST_THRESHOLD,
    }
  }

  /// Checks that every input path exists before any test runs.
  pub fn check_inputs(&self) -> Result<()> {
    if !self.subject.is_file() {
      return Err(HarnessError::MissingInput {
        what: "subject file",
        path: self.subject.clone(),
      });
    }
    if !self.test262_dir.is_dir() {
      return Err(HarnessError::MissingInput {
        what: "test262 directory",
        path: self.test262_dir.clone(),
      });
    }
    for list in &self.expected_failures {
      if !list.is_file() {
        return Err(HarnessError::MissingInput {
          what: "expected-failure list",
          path: list.clone(),
        });
      }
    }
    Ok(())
  }
}

/// Milliseconds from a number or numeric string; anything else means the default.
pub fn parse_timeout(raw: Option<&str>) -> Duration {
  raw
    .and_then(|raw| raw.trim().parse::<f64>().ok())
    .filter(|ms| ms.is_finite() && *ms > 0.0)
    .map(|ms| Duration::from_micros((ms * 1000.0).round() as u64))
    .unwrap_or(DEFAULT_TIMEOUT)
}

fn prefer<T>(cli: Vec<T>, file: Vec<T>) -> Vec<T> {
  if cli.is_empty() {
    file
  } else {
    cli
  }
}

fn config_error(config: &Option<PathBuf>, message: &str) -> HarnessError {
  HarnessError::Config {
    path: config.clone().unwrap_or_else(|| PathBuf::from("<command line>")),
    message: message.to_string(),
  }
}
