use crate::executor::ErrorPayload;
use crate::runner::{Outcome, RunSummary};
use conformance_harness::ExpectationRegistry;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportOptions {
  /// Remove unexpected passes from the lists that named them.
  pub update_expected_failures: bool,
  pub json_out: Option<PathBuf>,
}

/// What happened to one expectation list during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListUpdate {
  Rewritten { path: PathBuf, removed: usize },
  Failed { path: PathBuf, error: String },
}

/// Reconciles lists if asked, prints the report to stdout, and returns whether the run succeeded.
pub fn report(
  summary: &RunSummary,
  registry: &mut ExpectationRegistry,
  options: &ReportOptions,
) -> bool {
  let updates = if options.update_expected_failures {
    reconcile(summary, registry)
  } else {
    Vec::new()
  };

  let mut text = render(summary, registry, &updates, options.update_expected_failures);
  if let Some(path) = &options.json_out {
    match write_json_report(path, summary) {
      Ok(()) => {
        let _ = writeln!(text, "JSON report written to {}", path.display());
      }
      Err(err) => {
        let _ = writeln!(text, "Failed to write JSON report {}: {err}", path.display());
      }
    }
  }

  let stdout = std::io::stdout();
  let mut handle = stdout.lock();
  let _ = handle.write_all(text.as_bytes());
  let _ = handle.flush();

  summary.succeeded()
}

/// Removes each list's unexpected passes from its file.
pub fn reconcile(summary: &RunSummary, registry: &mut ExpectationRegistry) -> Vec<ListUpdate> {
  let mut updates = Vec::new();
  for (list, ids) in &summary.unexpected_passes {
    let path = registry.list(*list).path().to_path_buf();
    match registry.reconcile(*list, ids) {
      Ok(0) => {}
      Ok(removed) => updates.push(ListUpdate::Rewritten { path, removed }),
      Err(err) => {
        tracing::warn!(path = %path.display(), "failed to update expectation list: {err:#}");
        updates.push(ListUpdate::Failed {
          path,
          error: format!("{err:#}"),
        });
      }
    }
  }
  updates
}

/// The human-readable report.
pub fn render(
  summary: &RunSummary,
  registry: &ExpectationRegistry,
  updates: &[ListUpdate],
  updating: bool,
) -> String {
  let mut out = String::new();

  if !summary.failures.is_empty() {
    let _ = writeln!(out, "\nFailures ({}):", summary.failures.len());
    for failure in &summary.failures {
      let tag = if failure.timed_out { "TIMEOUT" } else { "FAIL" };
      let _ = writeln!(out, "  {tag} {}", failure.id);
      write_payload(&mut out, &failure.error);
    }
  }

  if !summary.unexpected_passes.is_empty() {
    let _ = writeln!(out, "\nUnexpected passes:");
    for (list, ids) in &summary.unexpected_passes {
      let _ = writeln!(out, "  listed in {}:", registry.list(*list).path().display());
      for id in ids {
        let _ = writeln!(out, "    {id}");
      }
    }
    if !updating {
      let _ = writeln!(
        out,
        "  (rerun with --update-expected-failures to remove them from their lists)"
      );
    }
  }

  let timed_out: Vec<_> = summary.timed_out().collect();
  if !timed_out.is_empty() {
    let _ = writeln!(out, "\nTimed out ({}):", timed_out.len());
    for result in timed_out {
      let _ = writeln!(out, "  {} ({})", result.id, format_duration(result.duration));
    }
  }

  if !summary.slow_tests.is_empty() {
    let mut slow = summary.slow_tests.clone();
    slow.sort_by(|a, b| b.duration.cmp(&a.duration).then_with(|| a.id.cmp(&b.id)));
    let _ = writeln!(out, "\nSlow tests ({}):", slow.len());
    for test in slow {
      let _ = writeln!(out, "  {} ({})", test.id, format_duration(Some(test.duration)));
    }
  }

  if !updates.is_empty() {
    let _ = writeln!(out, "\nExpected-failure lists:");
    for update in updates {
      match update {
        ListUpdate::Rewritten { path, removed } => {
          let _ = writeln!(out, "  updated {} (removed {removed})", path.display());
        }
        ListUpdate::Failed { path, error } => {
          let _ = writeln!(out, "  could not update {}: {error}", path.display());
        }
      }
    }
  }

  let _ = writeln!(
    out,
    "\n{} passed, {} failed, {} expected failures, {} unexpected passes, {} skipped ({} total) in {:.2}s",
    summary.pass_count,
    summary.fail_count,
    summary.expected_fail_count,
    summary.unexpected_pass_count,
    summary.skipped_count,
    summary.total(),
    summary.elapsed.as_secs_f64()
  );
  out
}

fn write_payload(out: &mut String, error: &ErrorPayload) {
  let _ = writeln!(out, "    {}", error.message);
  let detail = error.output.trim();
  if detail.is_empty() || detail == error.message {
    return;
  }
  for line in detail.lines() {
    let _ = writeln!(out, "      {line}");
  }
}

fn format_duration(duration: Option<Duration>) -> String {
  match duration {
    Some(duration) => format!("{} ms", duration.as_millis()),
    None => "not run".to_string(),
  }
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
  schema_version: u32,
  summary: JsonSummary,
  results: Vec<JsonResult<'a>>,
}

#[derive(Debug, Serialize)]
struct JsonSummary {
  total: usize,
  passed: usize,
  failed: usize,
  expected_failures: usize,
  unexpected_passes: usize,
  skipped: usize,
  elapsed_ms: u64,
}

#[derive(Debug, Serialize)]
struct JsonResult<'a> {
  id: &'a str,
  outcome: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  duration_ms: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<&'a ErrorPayload>,
}

fn json_report(summary: &RunSummary) -> JsonReport<'_> {
  JsonReport {
    schema_version: REPORT_SCHEMA_VERSION,
    summary: JsonSummary {
      total: summary.total(),
      passed: summary.pass_count,
      failed: summary.fail_count,
      expected_failures: summary.expected_fail_count,
      unexpected_passes: summary.unexpected_pass_count,
      skipped: summary.skipped_count,
      elapsed_ms: summary.elapsed.as_millis() as u64,
    },
    results: summary
      .results
      .iter()
      .map(|result| {
        let (outcome, error) = match &result.outcome {
          Outcome::Pass => ("pass", None),
          Outcome::Fail { error } => ("fail", Some(error)),
          Outcome::ExpectedFail => ("expected_fail", None),
          Outcome::UnexpectedPass { .. } => ("unexpected_pass", None),
          Outcome::TimedOut { error } => ("timed_out", Some(error)),
          Outcome::Skipped => ("skipped", None),
        };
        JsonResult {
          id: &result.id,
          outcome,
          duration_ms: result.duration.map(|d| d.as_millis() as u64),
          error,
        }
      })
      .collect(),
  }
}

/// Writes a pretty JSON report, creating parent directories as needed.
pub fn write_json_report(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
  use anyhow::Context;

  if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
  }
  let file = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
  let mut writer = BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &json_report(summary)).context("write JSON report")?;
  writeln!(writer).context("write JSON report")?;
  writer.flush().context("flush JSON report")?;
  Ok(())
}
