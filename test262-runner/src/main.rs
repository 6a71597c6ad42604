use clap::Parser;
use conformance_harness::ExpectationRegistry;
use std::process::ExitCode;
use test262_runner::config::RunArgs;
use test262_runner::{
  discover_tests, report, HarnessError, HostExecutor, ReportOptions, RunConfig, Runner, Sandbox,
  Script,
};
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Exit status when an input path or the test selection is missing.
const EXIT_MISSING_INPUT: u8 = 66;

#[derive(Parser, Debug)]
#[command(
  version,
  about = "Run test262 against a JavaScript subject and reconcile expected failures"
)]
struct Cli {
  #[command(flatten)]
  run: RunArgs,

  /// Emit tracing output to stderr (filtered by RUST_LOG, default info).
  #[arg(long)]
  trace: bool,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.trace);

  match try_main(cli.run) {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::FAILURE,
    Err(err) => {
      eprintln!("error: {err}");
      if err.is_missing_input() {
        ExitCode::from(EXIT_MISSING_INPUT)
      } else {
        ExitCode::FAILURE
      }
    }
  }
}

fn try_main(args: RunArgs) -> Result<bool, HarnessError> {
  let config = RunConfig::resolve(args)?;
  config.check_inputs()?;

  let tests = discover_tests(&config.test262_dir, &config.selectors)?;
  let mut registry = ExpectationRegistry::load(&config.expected_failures)?;
  let subject_source = std::fs::read_to_string(&config.subject)?;
  let subject = Script::new(config.subject.display().to_string(), &subject_source);

  let mut executor = HostExecutor::new(config.host.clone(), config.host_args.clone());
  if let Some(layout) = config.host_layout {
    executor = executor.with_layout(layout);
  }
  if !executor.available() {
    tracing::warn!(host = %executor.command().display(), "host did not answer --version");
    eprintln!(
      "warning: {} did not respond to --version; every test may fail",
      executor.command().display()
    );
  }
  let sandbox = Sandbox::new(Box::new(executor), config.harness_dir())?;

  let summary = Runner::new(sandbox, &registry, subject, config.run_options()).run(&tests)?;

  let options = ReportOptions {
    update_expected_failures: config.update_expected_failures,
    json_out: config.json_out.clone(),
  };
  Ok(report(&summary, &mut registry, &options))
}

fn init_tracing(enable: bool) {
  if !enable {
    return;
  }

  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr);
  if let Err(err) = builder.try_init() {
    eprintln!("failed to install tracing subscriber: {err}");
  }
}
