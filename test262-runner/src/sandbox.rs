use crate::executor::{ErrorPayload, ExecError, Executor, Program, Script};
use crate::{HarnessError, Result};
use conformance_harness::Watchdog;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Result of running one test body in its own realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
  Pass,
  Fail(ErrorPayload),
  TimedOut(ErrorPayload),
}

impl ExecOutcome {
  pub fn is_pass(&self) -> bool {
    matches!(self, ExecOutcome::Pass)
  }
}

/// Harness helpers from `<test262>/harness`, each loaded once per run.
#[derive(Debug)]
pub struct HelperCache {
  dir: PathBuf,
  scripts: HashMap<String, Arc<Script>>,
}

impl HelperCache {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      scripts: HashMap::new(),
    }
  }

  pub fn len(&self) -> usize {
    self.scripts.len()
  }

  pub fn is_empty(&self) -> bool {
    self.scripts.is_empty()
  }

  /// Returns the shared unit for `id`, reading it from disk on first use.
  ///
  /// An unreadable helper means the test262 checkout is broken, so the error
  /// is fatal to the run rather than a test failure.
  pub fn get(&mut self, id: &str) -> Result<Arc<Script>> {
    if let Some(script) = self.scripts.get(id) {
      return Ok(Arc::clone(script));
    }

    let path = self.dir.join(id);
    let source = std::fs::read_to_string(&path)
      .map_err(|source| HarnessError::HelperLoad { path, source })?;
    tracing::debug!(helper = id, "loaded harness helper");
    let script = Arc::new(Script::new(id, &source));
    self.scripts.insert(id.to_string(), Arc::clone(&script));
    Ok(script)
  }
}

/// How a test body is evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyMode {
  pub strict: bool,
  /// The body reports completion through `$DONE` rather than by returning.
  pub asynchronous: bool,
}

const ASYNC_COMPLETE: &str = "Test262:AsyncTestComplete";
const ASYNC_FAILURE: &str = "Test262:AsyncTestFailure:";

/// Builds a brand new realm per test and runs the body under a deadline.
pub struct Sandbox {
  executor: Box<dyn Executor>,
  helpers: HelperCache,
  watchdog: Watchdog,
}

impl Sandbox {
  pub fn new(executor: Box<dyn Executor>, harness_dir: impl Into<PathBuf>) -> Result<Self> {
    Ok(Self {
      executor,
      helpers: HelperCache::new(harness_dir),
      watchdog: Watchdog::new()?,
    })
  }

  pub fn helpers(&self) -> &HelperCache {
    &self.helpers
  }

  /// Runs `body` in a fresh realm seeded with `subject` and then each helper in order.
  ///
  /// Only a helper that cannot be read surfaces as `Err`; everything that goes
  /// wrong inside the realm is folded into the returned outcome.
  pub fn execute(
    &mut self,
    subject: &Arc<Script>,
    helpers: &[String],
    body: Script,
    mode: BodyMode,
    timeout: Duration,
  ) -> Result<ExecOutcome> {
    let mut units = Vec::with_capacity(helpers.len() + 1);
    for id in helpers {
      units.push(self.helpers.get(id)?);
    }
    units.push(Arc::new(body));
    let program = Program {
      strict: mode.strict,
      subject: Arc::clone(subject),
      units,
    };

    let guard = self.watchdog.arm(timeout);
    let result = self.executor.execute(&program, guard.cancel_flag());
    let elapsed = guard.elapsed();
    drop(guard);

    Ok(match result {
      Ok(completion) if mode.asynchronous => async_outcome(&completion.stdout),
      Ok(_) => ExecOutcome::Pass,
      Err(ExecError::Thrown(payload)) => ExecOutcome::Fail(payload),
      Err(ExecError::Host(message)) => ExecOutcome::Fail(ErrorPayload::new(message)),
      Err(ExecError::Cancelled) => ExecOutcome::TimedOut(ErrorPayload::new(format!(
        "timed out after {} ms (budget {} ms)",
        elapsed.as_millis(),
        timeout.as_millis()
      ))),
    })
  }
}

/// The first completion signal printed by `doneprintHandle.js` decides the outcome.
fn async_outcome(stdout: &str) -> ExecOutcome {
  let output = stdout.trim_end().to_string();
  for line in stdout.lines().map(str::trim) {
    if line == ASYNC_COMPLETE {
      return ExecOutcome::Pass;
    }
    if let Some(error) = line.strip_prefix(ASYNC_FAILURE) {
      return ExecOutcome::Fail(ErrorPayload {
        output,
        ..ErrorPayload::from_output(None, error)
      });
    }
  }
  ExecOutcome::Fail(ErrorPayload {
    output,
    ..ErrorPayload::new("async test finished without calling $DONE")
  })
}
