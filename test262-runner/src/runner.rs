use crate::discover::DiscoveredTest;
use crate::executor::{ErrorPayload, Script};
use crate::frontmatter::{extract, Metadata, Negative, ASYNC_FLAG, ONLY_STRICT_FLAG, RAW_FLAG};
use crate::sandbox::{BodyMode, ExecOutcome, Sandbox};
use crate::Result;
use conformance_harness::{ExpectationRegistry, ListId};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Helpers every non-`raw` test gets, ahead of its own includes.
pub const BASE_HELPERS: [&str; 2] = ["assert.js", "sta.js"];
/// Defines `$DONE` for `async` tests.
pub const ASYNC_HELPER: &str = "doneprintHandle.js";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
pub const SLOW_TEST_THRESHOLD: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
  pub timeout: Duration,
  /// Stop executing once this many unexpected failures were recorded.
  pub max_failures: Option<usize>,
  pub slow_threshold: Duration,
}

impl Default for RunOptions {
  fn default() -> Self {
    Self {
      timeout: DEFAULT_TIMEOUT,
      max_failures: None,
      slow_threshold: SLOW_TEST_THRESHOLD,
    }
  }
}

/// A test read from disk, used for exactly one execution.
#[derive(Debug, Clone)]
pub struct TestCase {
  pub id: String,
  pub path: PathBuf,
  pub source: String,
  pub metadata: Metadata,
}

impl TestCase {
  pub fn read(test: &DiscoveredTest) -> std::io::Result<Self> {
    let source = std::fs::read_to_string(&test.path)?;
    let metadata = extract(&source);
    Ok(Self {
      id: test.id.clone(),
      path: test.path.clone(),
      source,
      metadata,
    })
  }

  /// Base helpers (unless `raw`), the `$DONE` helper for async tests, then
  /// declared includes. First occurrence wins.
  pub fn helpers(&self) -> Vec<String> {
    let base = if self.metadata.has_flag(RAW_FLAG) {
      &[][..]
    } else {
      &BASE_HELPERS[..]
    };
    let done = self.is_async().then_some(ASYNC_HELPER);
    let mut seen = HashSet::new();
    base
      .iter()
      .copied()
      .chain(done)
      .map(str::to_string)
      .chain(self.metadata.includes.iter().cloned())
      .filter(|name| seen.insert(name.clone()))
      .collect()
  }

  pub fn strict(&self) -> bool {
    self.metadata.has_flag(ONLY_STRICT_FLAG) && !self.metadata.has_flag(RAW_FLAG)
  }

  pub fn is_async(&self) -> bool {
    self.metadata.has_flag(ASYNC_FLAG)
  }

  pub fn mode(&self) -> BodyMode {
    BodyMode {
      strict: self.strict(),
      asynchronous: self.is_async(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
  Pass,
  Fail { error: ErrorPayload },
  ExpectedFail,
  UnexpectedPass { lists: Vec<ListId> },
  TimedOut { error: ErrorPayload },
  Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
  pub id: String,
  pub outcome: Outcome,
  /// Wall time of the execution; `None` when the test never ran.
  pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
  pub id: String,
  pub error: ErrorPayload,
  pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowTest {
  pub id: String,
  pub duration: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
  pub pass_count: usize,
  pub fail_count: usize,
  pub expected_fail_count: usize,
  pub unexpected_pass_count: usize,
  pub skipped_count: usize,
  /// Unexpected failures in run order, timeouts included.
  pub failures: Vec<FailureRecord>,
  pub unexpected_passes: BTreeMap<ListId, BTreeSet<String>>,
  pub slow_tests: Vec<SlowTest>,
  pub results: Vec<TestResult>,
  pub elapsed: Duration,
}

impl RunSummary {
  pub fn total(&self) -> usize {
    self.pass_count
      + self.fail_count
      + self.expected_fail_count
      + self.unexpected_pass_count
      + self.skipped_count
  }

  /// No unexpected failures and no unexpected passes.
  pub fn succeeded(&self) -> bool {
    self.fail_count == 0 && self.unexpected_pass_count == 0
  }

  pub fn timed_out(&self) -> impl Iterator<Item = &TestResult> {
    self
      .results
      .iter()
      .filter(|result| matches!(result.outcome, Outcome::TimedOut { .. }))
  }

  fn record(&mut self, id: &str, outcome: Outcome, duration: Option<Duration>) {
    match &outcome {
      Outcome::Pass => self.pass_count += 1,
      Outcome::Fail { error } | Outcome::TimedOut { error } => {
        self.fail_count += 1;
        self.failures.push(FailureRecord {
          id: id.to_string(),
          error: error.clone(),
          timed_out: matches!(outcome, Outcome::TimedOut { .. }),
        });
      }
      Outcome::ExpectedFail => self.expected_fail_count += 1,
      Outcome::UnexpectedPass { lists } => {
        self.unexpected_pass_count += 1;
        for list in lists {
          self
            .unexpected_passes
            .entry(*list)
            .or_default()
            .insert(id.to_string());
        }
      }
      Outcome::Skipped => self.skipped_count += 1,
    }
    self.results.push(TestResult {
      id: id.to_string(),
      outcome,
      duration,
    });
  }
}

/// Drives a whole run: one test at a time, each in a fresh realm.
pub struct Runner<'a> {
  sandbox: Sandbox,
  registry: &'a ExpectationRegistry,
  subject: Arc<Script>,
  options: RunOptions,
}

impl<'a> Runner<'a> {
  pub fn new(
    sandbox: Sandbox,
    registry: &'a ExpectationRegistry,
    subject: Script,
    options: RunOptions,
  ) -> Self {
    Self {
      sandbox,
      registry,
      subject: Arc::new(subject),
      options,
    }
  }

  /// Runs `tests` in id order. Only an unreadable harness helper aborts the run.
  pub fn run(&mut self, tests: &[DiscoveredTest]) -> Result<RunSummary> {
    let started = Instant::now();
    let mut ordered: Vec<&DiscoveredTest> = tests.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));

    tracing::info!(
      tests = ordered.len(),
      timeout_ms = self.options.timeout.as_millis() as u64,
      max_failures = ?self.options.max_failures,
      "starting run"
    );

    let mut summary = RunSummary::default();
    for (idx, test) in ordered.iter().enumerate() {
      if self
        .options
        .max_failures
        .is_some_and(|max| summary.fail_count >= max)
      {
        tracing::info!(
          skipped = ordered.len() - idx,
          "failure ceiling reached; skipping remaining tests"
        );
        for rest in &ordered[idx..] {
          summary.record(&rest.id, Outcome::Skipped, None);
        }
        break;
      }

      let (outcome, duration) = self.run_one(test)?;
      tracing::debug!(id = %test.id, ?outcome, duration_ms = duration.as_millis() as u64, "test finished");
      if duration > self.options.slow_threshold {
        summary.slow_tests.push(SlowTest {
          id: test.id.clone(),
          duration,
        });
      }
      summary.record(&test.id, outcome, Some(duration));
    }

    summary.elapsed = started.elapsed();
    tracing::info!(
      passed = summary.pass_count,
      failed = summary.fail_count,
      expected_failures = summary.expected_fail_count,
      unexpected_passes = summary.unexpected_pass_count,
      skipped = summary.skipped_count,
      "run finished"
    );
    Ok(summary)
  }

  fn run_one(&mut self, test: &DiscoveredTest) -> Result<(Outcome, Duration)> {
    let lists = self.registry.relevant_lists(&test.id);
    let start = Instant::now();

    let executed = match TestCase::read(test) {
      Ok(case) => {
        let helpers = case.helpers();
        let mode = case.mode();
        let negative = case.metadata.negative.clone();
        let body = Script::new(case.id, &case.source);
        let outcome =
          self
            .sandbox
            .execute(&self.subject, &helpers, body, mode, self.options.timeout)?;
        apply_negative(negative.as_ref(), outcome)
      }
      Err(err) => ExecOutcome::Fail(ErrorPayload::new(format!(
        "read {}: {err}",
        test.path.display()
      ))),
    };

    Ok((classify(executed, lists), start.elapsed()))
  }
}

/// For `negative` tests the expected error is a pass and completion is a failure.
pub fn apply_negative(negative: Option<&Negative>, outcome: ExecOutcome) -> ExecOutcome {
  let Some(negative) = negative else {
    return outcome;
  };

  match outcome {
    ExecOutcome::Pass => ExecOutcome::Fail(ErrorPayload::new(format!(
      "expected {} {} but the test completed",
      negative.phase, negative.typ
    ))),
    ExecOutcome::Fail(payload) if payload.name.as_deref() == Some(negative.typ.as_str()) => {
      ExecOutcome::Pass
    }
    ExecOutcome::Fail(payload) => {
      let actual = payload.name.as_deref().unwrap_or("<unknown error type>");
      ExecOutcome::Fail(ErrorPayload {
        message: format!(
          "expected {} {}, got {actual}: {}",
          negative.phase, negative.typ, payload.message
        ),
        ..payload
      })
    }
    timed_out @ ExecOutcome::TimedOut(_) => timed_out,
  }
}

/// Reconciles an execution result against the lists that expect the test to fail.
pub fn classify(executed: ExecOutcome, lists: Vec<ListId>) -> Outcome {
  match (executed, lists.is_empty()) {
    (ExecOutcome::Pass, true) => Outcome::Pass,
    (ExecOutcome::Pass, false) => Outcome::UnexpectedPass { lists },
    (ExecOutcome::Fail(error), true) => Outcome::Fail { error },
    (ExecOutcome::TimedOut(error), true) => Outcome::TimedOut { error },
    (ExecOutcome::Fail(_) | ExecOutcome::TimedOut(_), false) => Outcome::ExpectedFail,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::executor::{Completion, ExecError, ExecResult, Executor, Program};
  use conformance_harness::ExpectationList;
  use parking_lot::Mutex;
  use std::fs;
  use std::sync::atomic::{AtomicBool, Ordering};
  use tempfile::tempdir;

  /// Fails bodies containing `FAIL`, spins on `HANG`, passes everything else.
  #[derive(Default)]
  struct MarkerExecutor {
    executed: Arc<Mutex<Vec<String>>>,
  }

  impl Executor for MarkerExecutor {
    fn execute(&self, program: &Program, cancel: &Arc<AtomicBool>) -> ExecResult {
      let body = program.units.last().expect("body unit");
      self.executed.lock().push(body.name().to_string());
      if body.source().contains("HANG") {
        while !cancel.load(Ordering::Acquire) {
          std::thread::sleep(Duration::from_millis(1));
        }
        return Err(ExecError::Cancelled);
      }
      if let Some(line) = body.source().lines().find(|l| l.contains("FAIL")) {
        return Err(ExecError::Thrown(ErrorPayload {
          name: Some("Test262Error".to_string()),
          message: line.to_string(),
          output: String::new(),
        }));
      }
      Ok(Completion::default())
    }
  }

  struct Fixture {
    dir: tempfile::TempDir,
    tests: Vec<DiscoveredTest>,
  }

  fn fixture(files: &[(&str, &str)]) -> Fixture {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("harness")).unwrap();
    fs::write(dir.path().join("harness/assert.js"), "").unwrap();
    fs::write(dir.path().join("harness/sta.js"), "").unwrap();
    let mut tests = Vec::new();
    for (id, source) in files {
      let path = dir.path().join("test").join(id);
      fs::create_dir_all(path.parent().unwrap()).unwrap();
      fs::write(&path, source).unwrap();
      tests.push(DiscoveredTest {
        id: id.to_string(),
        path,
      });
    }
    Fixture { dir, tests }
  }

  fn run(
    fixture: &Fixture,
    registry: &ExpectationRegistry,
    options: RunOptions,
  ) -> (RunSummary, Vec<String>) {
    let executor = MarkerExecutor::default();
    let executed = Arc::clone(&executor.executed);
    let sandbox = Sandbox::new(Box::new(executor), fixture.dir.path().join("harness")).unwrap();
    let subject = Script::new("subject.js", "");
    let summary = Runner::new(sandbox, registry, subject, options)
      .run(&fixture.tests)
      .unwrap();
    let executed = executed.lock().clone();
    (summary, executed)
  }

  fn registry(lists: &[(&str, &str)]) -> ExpectationRegistry {
    ExpectationRegistry::from_lists(
      lists
        .iter()
        .map(|(name, raw)| ExpectationList::parse(PathBuf::from(name), raw))
        .collect(),
    )
  }

  #[test]
  fn classification_table() {
    let registry = registry(&[("fails.txt", "listed.js\n")]);
    let listed = registry.relevant_lists("listed.js");
    let table = [
      (ExecOutcome::Pass, vec![], Outcome::Pass),
      (
        ExecOutcome::Pass,
        listed.clone(),
        Outcome::UnexpectedPass {
          lists: listed.clone(),
        },
      ),
      (
        ExecOutcome::Fail(ErrorPayload::new("x")),
        vec![],
        Outcome::Fail {
          error: ErrorPayload::new("x"),
        },
      ),
      (
        ExecOutcome::TimedOut(ErrorPayload::new("t")),
        vec![],
        Outcome::TimedOut {
          error: ErrorPayload::new("t"),
        },
      ),
      (
        ExecOutcome::Fail(ErrorPayload::new("x")),
        listed.clone(),
        Outcome::ExpectedFail,
      ),
      (
        ExecOutcome::TimedOut(ErrorPayload::new("t")),
        listed.clone(),
        Outcome::ExpectedFail,
      ),
    ];
    for (executed, lists, expected) in table {
      assert_eq!(classify(executed, lists), expected);
    }
  }

  #[test]
  fn helpers_respect_raw_flag_and_dedupe() {
    let case = |source: &str| TestCase {
      id: "a.js".to_string(),
      path: PathBuf::from("a.js"),
      source: source.to_string(),
      metadata: extract(source),
    };

    assert_eq!(case("1;").helpers(), vec!["assert.js", "sta.js"]);
    assert_eq!(
      case("/*---\nincludes: [sta.js, compareArray.js]\n---*/").helpers(),
      vec!["assert.js", "sta.js", "compareArray.js"]
    );
    assert_eq!(
      case("/*---\nflags: [raw]\nincludes: [compareArray.js]\n---*/").helpers(),
      vec!["compareArray.js"]
    );
    assert!(case("/*---\nflags: [onlyStrict]\n---*/").strict());

    let async_case = case("/*---\nflags: [async, onlyStrict]\nincludes: [asyncHelpers.js]\n---*/");
    assert_eq!(
      async_case.helpers(),
      vec!["assert.js", "sta.js", "doneprintHandle.js", "asyncHelpers.js"]
    );
    assert_eq!(
      async_case.mode(),
      BodyMode {
        strict: true,
        asynchronous: true
      }
    );
    assert!(!case("1;").mode().asynchronous);
  }

  #[test]
  fn counts_cover_every_test_and_order_is_by_id() {
    let fixture = fixture(&[
      ("c.js", "FAIL c"),
      ("a.js", "pass"),
      ("b.js", "FAIL b"),
      ("d.js", "pass"),
    ]);
    let registry = registry(&[("fails.txt", "b.js\nd.js\n")]);
    let (summary, executed) = run(&fixture, &registry, RunOptions::default());

    assert_eq!(executed, vec!["a.js", "b.js", "c.js", "d.js"]);
    assert_eq!(summary.pass_count, 1);
    assert_eq!(summary.expected_fail_count, 1);
    assert_eq!(summary.fail_count, 1);
    assert_eq!(summary.unexpected_pass_count, 1);
    assert_eq!(summary.total(), fixture.tests.len());
    assert_eq!(summary.failures[0].id, "c.js");
    assert_eq!(summary.failures[0].error.message, "FAIL c");
    assert!(!summary.succeeded());
  }

  #[test]
  fn unexpected_pass_is_recorded_against_every_list() {
    let fixture = fixture(&[("fixed.js", "pass")]);
    let registry = registry(&[
      ("fails-a.txt", "fixed.js\n"),
      ("other.txt", "unrelated.js\n"),
      ("fails-b.txt", "# note\nfixed.js\n"),
    ]);
    let (summary, _) = run(&fixture, &registry, RunOptions::default());

    assert_eq!(summary.unexpected_pass_count, 1);
    let lists: Vec<_> = summary.unexpected_passes.keys().copied().collect();
    assert_eq!(lists, registry.relevant_lists("fixed.js"));
    assert_eq!(lists.len(), 2);
    for ids in summary.unexpected_passes.values() {
      assert!(ids.contains("fixed.js"));
    }
  }

  #[test]
  fn failure_ceiling_skips_remaining_tests_without_running_them() {
    let fixture = fixture(&[
      ("a.js", "FAIL"),
      ("b.js", "pass"),
      ("c.js", "FAIL"),
      ("d.js", "pass"),
      ("e.js", "FAIL"),
    ]);
    let options = RunOptions {
      max_failures: Some(2),
      ..RunOptions::default()
    };
    let (summary, executed) = run(&fixture, &ExpectationRegistry::empty(), options);

    assert_eq!(executed, vec!["a.js", "b.js", "c.js"]);
    assert_eq!(summary.fail_count, 2);
    assert_eq!(summary.skipped_count, 2);
    assert_eq!(summary.total(), 5);
    assert!(summary.results[3..]
      .iter()
      .all(|r| r.outcome == Outcome::Skipped && r.duration.is_none()));
  }

  #[test]
  fn expected_failures_do_not_count_toward_ceiling() {
    let fixture = fixture(&[("a.js", "FAIL"), ("b.js", "FAIL"), ("c.js", "pass")]);
    let registry = registry(&[("fails.txt", "a.js\n")]);
    let options = RunOptions {
      max_failures: Some(1),
      ..RunOptions::default()
    };
    let (summary, executed) = run(&fixture, &registry, options);

    assert_eq!(executed, vec!["a.js", "b.js"]);
    assert_eq!(summary.expected_fail_count, 1);
    assert_eq!(summary.fail_count, 1);
    assert_eq!(summary.skipped_count, 1);
  }

  #[test]
  fn hanging_test_times_out_and_run_continues() {
    let fixture = fixture(&[("a.js", "HANG"), ("b.js", "pass")]);
    let options = RunOptions {
      timeout: Duration::from_millis(30),
      slow_threshold: Duration::from_millis(10),
      ..RunOptions::default()
    };
    let (summary, _) = run(&fixture, &ExpectationRegistry::empty(), options);

    assert_eq!(summary.fail_count, 1);
    assert_eq!(summary.pass_count, 1);
    assert!(summary.failures[0].timed_out);
    assert_eq!(summary.timed_out().count(), 1);
    assert_eq!(summary.slow_tests[0].id, "a.js");
  }

  #[test]
  fn negative_tests_pass_only_on_the_declared_error() {
    let expect_type = |typ: &str| Negative {
      phase: "runtime".to_string(),
      typ: typ.to_string(),
    };
    let thrown = ExecOutcome::Fail(ErrorPayload {
      name: Some("Test262Error".to_string()),
      message: "Test262Error: boom".to_string(),
      output: String::new(),
    });

    assert_eq!(
      apply_negative(Some(&expect_type("Test262Error")), thrown.clone()),
      ExecOutcome::Pass
    );
    let ExecOutcome::Fail(mismatch) = apply_negative(Some(&expect_type("TypeError")), thrown)
    else {
      panic!("expected mismatch failure");
    };
    assert!(mismatch
      .message
      .contains("expected runtime TypeError, got Test262Error"));
    assert!(!apply_negative(Some(&expect_type("TypeError")), ExecOutcome::Pass).is_pass());
  }

  #[test]
  fn unreadable_test_is_a_failure_not_an_abort() {
    let mut fixture = fixture(&[("a.js", "pass")]);
    fixture.tests.push(DiscoveredTest {
      id: "gone.js".to_string(),
      path: fixture.dir.path().join("test/gone.js"),
    });
    let (summary, executed) = run(&fixture, &ExpectationRegistry::empty(), RunOptions::default());

    assert_eq!(executed, vec!["a.js"]);
    assert_eq!(summary.fail_count, 1);
    assert!(summary.failures[0].error.message.contains("gone.js"));
  }
}
