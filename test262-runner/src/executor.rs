use once_cell::sync::Lazy;
use regex::Regex;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A prepared unit of source text, ready to be replayed into any realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
  name: String,
  source: Arc<str>,
}

impl Script {
  /// Strips a leading BOM and guarantees a trailing newline so that units can
  /// be concatenated without a trailing line comment swallowing the next one.
  pub fn new(name: impl Into<String>, source: &str) -> Self {
    let source = source.strip_prefix('\u{feff}').unwrap_or(source);
    let mut text = String::with_capacity(source.len() + 1);
    text.push_str(source);
    if !text.ends_with('\n') {
      text.push('\n');
    }
    Self {
      name: name.into(),
      source: Arc::from(text),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn source(&self) -> &str {
    &self.source
  }
}

/// Everything that runs in one fresh realm, in evaluation order.
#[derive(Debug, Clone)]
pub struct Program {
  /// Whether the helpers and body run as strict-mode code. Never applies to the subject.
  pub strict: bool,
  pub subject: Arc<Script>,
  /// Helpers followed by the test body.
  pub units: Vec<Arc<Script>>,
}

impl Program {
  pub fn body(&self) -> Option<&Script> {
    self.units.last().map(|unit| &**unit)
  }

  /// Helpers and body as a single script.
  pub fn test_source(&self) -> String {
    let mut out = String::new();
    if self.strict {
      out.push_str(STRICT_DIRECTIVE);
    }
    for unit in &self.units {
      out.push_str(unit.source());
    }
    out
  }

  /// Subject, helpers and body as one script. A strict directive has to lead
  /// the file, so in strict mode it also covers the subject.
  pub fn concatenate(&self) -> String {
    let mut out = String::new();
    if self.strict {
      out.push_str(STRICT_DIRECTIVE);
    }
    out.push_str(self.subject.source());
    for unit in &self.units {
      out.push_str(unit.source());
    }
    out
  }

  /// A node entry point that evaluates the subject and the test as two
  /// separate scripts of the same realm, so strictness stays per script.
  pub fn node_driver(&self) -> String {
    let body_name = self.body().map(Script::name).unwrap_or("test");
    let mut out = String::from("const vm = require(\"vm\");\n");
    // test262 hosts provide `print`; doneprintHandle.js reports through it.
    out.push_str("if (typeof globalThis.print !== \"function\") globalThis.print = (...args) => console.log(...args);\n");
    for (name, source) in [
      (self.subject.name(), self.subject.source().to_string()),
      (body_name, self.test_source()),
    ] {
      out.push_str(&format!(
        "vm.runInThisContext({}, {{ filename: {} }});\n",
        js_string(&source),
        js_string(name)
      ));
    }
    out
  }
}

const STRICT_DIRECTIVE: &str = "\"use strict\";\n";

fn js_string(text: &str) -> String {
  serde_json::Value::String(text.to_string()).to_string()
}

/// How a host receives the program file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramLayout {
  /// A node driver evaluating the subject and the test as separate scripts.
  Node,
  /// Everything concatenated into one file, for any other host.
  Concatenated,
}

impl ProgramLayout {
  pub fn for_host(command: &Path) -> Self {
    match command.file_stem().and_then(|stem| stem.to_str()) {
      Some("node" | "nodejs") => ProgramLayout::Node,
      _ => ProgramLayout::Concatenated,
    }
  }

  pub fn render(self, program: &Program) -> String {
    match self {
      ProgramLayout::Node => program.node_driver(),
      ProgramLayout::Concatenated => program.concatenate(),
    }
  }
}

/// What a failing test threw, as far as the host let us see it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
  /// Error constructor name such as `Test262Error` or `TypeError`, when recognisable.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  pub message: String,
  #[serde(skip_serializing_if = "String::is_empty")]
  pub output: String,
}

impl ErrorPayload {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      name: None,
      message: message.into(),
      output: String::new(),
    }
  }

  /// Recovers the thrown error from a host's diagnostic output.
  pub fn from_output(status: Option<ExitStatus>, stderr: &str) -> Self {
    static ERROR_LINE: Lazy<Regex> = Lazy::new(|| {
      Regex::new(r"(?m)^\s*(?:Uncaught\s+)?([A-Za-z_$][\w$]*(?:Error|Exception))\b(?::\s*(.*))?$")
        .expect("error line pattern is valid")
    });

    // Node prints thrown non-Error objects through `util.inspect`, which breaks
    // long objects across lines.
    static INSPECTED_ERROR: Lazy<Regex> = Lazy::new(|| {
      Regex::new(
        r#"(?m)^\s*(?:Uncaught\s+)?([A-Za-z_$][\w$]*(?:Error|Exception))\s*\{[^}]*?\bmessage:\s*(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")"#,
      )
      .expect("inspected error pattern is valid")
    });

    let output = stderr.trim_end().to_string();
    let recognised = if let Some(captures) = ERROR_LINE.captures(stderr) {
      let detail = captures.get(2).map(|m| m.as_str().trim().to_string());
      Some((captures[1].to_string(), detail))
    } else if let Some(captures) = INSPECTED_ERROR.captures(stderr) {
      let detail = captures
        .get(2)
        .or_else(|| captures.get(3))
        .map(|m| unescape_js(m.as_str()));
      Some((captures[1].to_string(), detail))
    } else {
      None
    };

    if let Some((name, detail)) = recognised {
      let message = match detail {
        Some(detail) if !detail.is_empty() => format!("{name}: {detail}"),
        _ => name.clone(),
      };
      return Self {
        name: Some(name),
        message,
        output,
      };
    }

    let message = output
      .lines()
      .rev()
      .map(str::trim)
      .find(|line| !line.is_empty() && !line.starts_with("Node.js v"))
      .map(str::to_string)
      .unwrap_or_else(|| match status {
        Some(status) => format!("host exited with {status}"),
        None => "host exited abnormally".to_string(),
      });
    Self {
      name: None,
      message,
      output,
    }
  }
}

/// Undoes the escapes `util.inspect` applies inside a quoted string.
fn unescape_js(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  let mut chars = text.chars();
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

#[derive(Debug, Clone)]
pub enum ExecError {
  /// The program ran and threw.
  Thrown(ErrorPayload),
  /// The cancellation flag was observed and execution was torn down.
  Cancelled,
  /// The realm could not be created at all.
  Host(String),
}

/// A program that ran to completion, with what it printed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
  pub stdout: String,
}

pub type ExecResult = std::result::Result<Completion, ExecError>;

/// Runs a program in a realm that shares no state with any previous call.
pub trait Executor: Send + Sync {
  fn execute(&self, program: &Program, cancel: &Arc<AtomicBool>) -> ExecResult;
}

/// Runs each program in a new JavaScript host process.
///
/// The program is written to a temporary file whose path is passed as the
/// final argument. A process per test gives a fresh global environment and a
/// hard kill when the deadline passes.
#[derive(Debug, Clone)]
pub struct HostExecutor {
  command: PathBuf,
  args: Vec<String>,
  layout: ProgramLayout,
}

impl HostExecutor {
  /// The layout is picked from the command name; see [`HostExecutor::with_layout`].
  pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
    let command = command.into();
    let layout = ProgramLayout::for_host(&command);
    Self {
      command,
      args,
      layout,
    }
  }

  pub fn with_layout(mut self, layout: ProgramLayout) -> Self {
    self.layout = layout;
    self
  }

  pub fn layout(&self) -> ProgramLayout {
    self.layout
  }

  pub fn command(&self) -> &Path {
    &self.command
  }

  pub fn available(&self) -> bool {
    match Command::new(&self.command)
      .arg("--version")
      .stdin(Stdio::null())
      .output()
    {
      Ok(output) => output.status.success(),
      Err(_) => false,
    }
  }
}

impl Executor for HostExecutor {
  fn execute(&self, program: &Program, cancel: &Arc<AtomicBool>) -> ExecResult {
    if cancel.load(Ordering::Acquire) {
      return Err(ExecError::Cancelled);
    }

    let mut file = tempfile::Builder::new()
      .prefix("test262-")
      .suffix(".js")
      .tempfile()
      .map_err(|err| ExecError::Host(format!("create program file: {err}")))?;
    file
      .write_all(self.layout.render(program).as_bytes())
      .and_then(|()| file.flush())
      .map_err(|err| ExecError::Host(format!("write program file: {err}")))?;

    let mut child = Command::new(&self.command)
      .args(&self.args)
      .arg(file.path())
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(|err| ExecError::Host(format!("spawn {}: {err}", self.command.display())))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
      match child.try_wait() {
        Ok(Some(status)) => break status,
        Ok(None) => {
          if cancel.load(Ordering::Acquire) {
            let _ = child.kill();
            let _ = child.wait();
            // Readers may stay blocked on pipes inherited by grandchildren; leave them detached.
            return Err(ExecError::Cancelled);
          }
          std::thread::sleep(POLL_INTERVAL);
        }
        Err(err) => {
          let _ = child.kill();
          let _ = child.wait();
          return Err(ExecError::Host(format!("wait for host: {err}")));
        }
      }
    };

    let stdout = collect(stdout);
    let stderr = collect(stderr);
    if status.success() {
      Ok(Completion { stdout })
    } else {
      Err(ExecError::Thrown(ErrorPayload::from_output(Some(status), &stderr)))
    }
  }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
  std::thread::spawn(move || {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    buf
  })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
  handle
    .and_then(|handle| handle.join().ok())
    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    .unwrap_or_default()
}
