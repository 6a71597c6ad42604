use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use test262_runner::HostExecutor;

/// A throwaway test262 checkout plus subject and expectation lists.
pub struct Corpus {
  pub dir: TempDir,
}

#[allow(dead_code)]
impl Corpus {
  pub fn new() -> Self {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("test262/harness")).expect("create harness dir");
    fs::create_dir_all(dir.path().join("test262/test")).expect("create test dir");
    Self { dir }
  }

  pub fn root(&self) -> &Path {
    self.dir.path()
  }

  pub fn test262_dir(&self) -> PathBuf {
    self.root().join("test262")
  }

  pub fn harness_dir(&self) -> PathBuf {
    self.test262_dir().join("harness")
  }

  pub fn helper(&self, name: &str, source: &str) -> &Self {
    fs::write(self.harness_dir().join(name), source).expect("write helper");
    self
  }

  pub fn test(&self, id: &str, source: &str) -> PathBuf {
    let path = self.test262_dir().join("test").join(id);
    fs::create_dir_all(path.parent().expect("test parent")).expect("create test parent");
    fs::write(&path, source).expect("write test");
    path
  }

  pub fn file(&self, name: &str, contents: &str) -> PathBuf {
    let path = self.root().join(name);
    fs::write(&path, contents).expect("write file");
    path
  }

  pub fn read(&self, name: &str) -> String {
    fs::read_to_string(self.root().join(name)).expect("read file")
  }
}

#[allow(dead_code)]
/// A test file for the `sh` stand-in host.
///
/// The header sits inside a quoted no-op so that the shell never executes it.
pub fn sh_test(header: &str, body: &str) -> String {
  format!(": '\n/*---\n{header}\n---*/\n'\n{body}\n")
}

#[allow(dead_code)]
/// Shell equivalent of a throwing test262 assertion.
pub fn sh_throw(name: &str, message: &str) -> String {
  format!("echo '{name}: {message}' >&2\nexit 1")
}

#[allow(dead_code)]
pub fn node_or_skip(context: &str) -> Option<HostExecutor> {
  let host = HostExecutor::new("node", Vec::new());
  if !host.available() {
    eprintln!("skipping {context}: node not available");
    return None;
  }
  Some(host)
}
