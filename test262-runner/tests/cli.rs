#![cfg(unix)]

mod common;

use common::{sh_throw, Corpus};
use std::path::Path;
use std::process::{Command, Output};

fn runner(corpus: &Corpus) -> Command {
  let mut cmd = Command::new(env!("CARGO_BIN_EXE_test262-runner"));
  cmd
    .current_dir(corpus.root())
    .arg("--host")
    .arg("sh")
    .arg("--timeout")
    .arg("10000");
  cmd
}

fn corpus() -> Corpus {
  let corpus = Corpus::new();
  corpus.helper("assert.js", ":\n").helper("sta.js", ":\n");
  corpus.file("subject.sh", "answer() { echo 42; }\n");
  corpus
}

fn with_inputs<'a>(cmd: &'a mut Command, corpus: &Corpus) -> &'a mut Command {
  cmd
    .arg("--subject")
    .arg(corpus.root().join("subject.sh"))
    .arg("--test262-dir")
    .arg(corpus.test262_dir())
}

fn stdout(output: &Output) -> String {
  String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
  String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn missing_corpus_exits_with_no_input_status() {
  let corpus = corpus();
  let output = runner(&corpus)
    .arg("--subject")
    .arg(corpus.root().join("subject.sh"))
    .arg("--test262-dir")
    .arg(corpus.root().join("nowhere"))
    .output()
    .expect("run test262-runner");

  assert_eq!(output.status.code(), Some(66), "stderr: {}", stderr(&output));
  assert!(stderr(&output).contains("test262 directory not found"));
}

#[test]
fn empty_selection_exits_with_no_input_status() {
  let corpus = corpus();
  corpus.test("language/a.js", "true");
  let output = with_inputs(&mut runner(&corpus), &corpus)
    .output()
    .expect("run test262-runner");

  assert_eq!(output.status.code(), Some(66), "stderr: {}", stderr(&output));
  assert!(stderr(&output).contains("no tests matched"));
}

#[test]
fn passing_run_exits_zero_and_prints_counts() {
  let corpus = corpus();
  corpus.test("built-ins/answer.js", "[ \"$(answer)\" = 42 ]");
  let output = with_inputs(&mut runner(&corpus), &corpus)
    .output()
    .expect("run test262-runner");

  assert!(output.status.success(), "stdout: {}", stdout(&output));
  assert!(stdout(&output).contains("1 passed, 0 failed"));
}

#[test]
fn unexpected_failure_exits_one() {
  let corpus = corpus();
  corpus.test("built-ins/throws.js", &sh_throw("Test262Error", "nope"));
  let output = with_inputs(&mut runner(&corpus), &corpus)
    .output()
    .expect("run test262-runner");

  assert_eq!(output.status.code(), Some(1));
  let text = stdout(&output);
  assert!(text.contains("FAIL built-ins/throws.js"));
  assert!(text.contains("Test262Error: nope"));
}

#[test]
fn update_flag_removes_unexpected_passes_from_lists() {
  let corpus = corpus();
  corpus.test("built-ins/fixed.js", "true");
  corpus.test("built-ins/broken.js", &sh_throw("Test262Error", "still"));
  let list = corpus.file(
    "expected-failures.txt",
    "# polyfill gaps\nbuilt-ins/broken.js\nbuilt-ins/fixed.js\n",
  );

  let output = with_inputs(&mut runner(&corpus), &corpus)
    .arg("--expected-failures")
    .arg(&list)
    .arg("--update-expected-failures")
    .output()
    .expect("run test262-runner");

  assert_eq!(output.status.code(), Some(1));
  assert!(stdout(&output).contains("updated"));
  assert_eq!(
    corpus.read("expected-failures.txt"),
    "# polyfill gaps\nbuilt-ins/broken.js\n"
  );
}

#[test]
fn config_file_supplies_paths_relative_to_itself() {
  let corpus = corpus();
  corpus.test("built-ins/ok.js", "true");
  corpus.test("intl402/ok.js", "true");
  let config = corpus.file(
    "harness.toml",
    "subject = \"subject.sh\"\ntest262_dir = \"test262\"\nselectors = [\"intl402/**/*.js\"]\njson_out = \"out/report.json\"\n",
  );

  let output = Command::new(env!("CARGO_BIN_EXE_test262-runner"))
    .current_dir(Path::new("/"))
    .arg("--host")
    .arg("sh")
    .arg("--config")
    .arg(&config)
    .output()
    .expect("run test262-runner");

  assert!(output.status.success(), "stderr: {}", stderr(&output));
  assert!(stdout(&output).contains("1 passed"));
  let json: serde_json::Value =
    serde_json::from_str(&corpus.read("out/report.json")).expect("parse report");
  assert_eq!(json["results"][0]["id"], "intl402/ok.js");
}
