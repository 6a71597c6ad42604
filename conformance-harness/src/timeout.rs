use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Trips a cancellation flag when the currently armed deadline passes.
///
/// Tests run one at a time, so a single slot is enough: arming a new deadline
/// replaces the previous one. The flag is only ever set, never cleared; each
/// arming hands out a fresh flag.
pub struct Watchdog {
  inner: Arc<Inner>,
  thread: Option<JoinHandle<()>>,
}

struct Inner {
  state: Mutex<State>,
  cv: Condvar,
}

#[derive(Default)]
struct State {
  armed: Option<Armed>,
  generation: u64,
  shutdown: bool,
}

struct Armed {
  generation: u64,
  deadline: Instant,
  cancel: Arc<AtomicBool>,
}

/// Keeps a deadline armed until dropped.
pub struct WatchdogGuard {
  generation: u64,
  started: Instant,
  cancel: Arc<AtomicBool>,
  inner: Arc<Inner>,
}

type WatchFn = Box<dyn FnOnce() + Send + 'static>;

impl Watchdog {
  /// Starts the watchdog thread. Without it no deadline could ever fire, so
  /// a spawn failure is an error.
  pub fn new() -> Result<Self> {
    Self::start(|watch| {
      std::thread::Builder::new()
        .name("conformance-watchdog".to_string())
        .spawn(watch)
    })
  }

  fn start(spawn: impl FnOnce(WatchFn) -> io::Result<JoinHandle<()>>) -> Result<Self> {
    let inner = Arc::new(Inner {
      state: Mutex::new(State::default()),
      cv: Condvar::new(),
    });
    let thread_inner = Arc::clone(&inner);
    let thread = spawn(Box::new(move || watch(thread_inner))).context("spawn watchdog thread")?;
    Ok(Self {
      inner,
      thread: Some(thread),
    })
  }

  /// Arms a deadline `budget` from now.
  pub fn arm(&self, budget: Duration) -> WatchdogGuard {
    let started = Instant::now();
    let cancel = Arc::new(AtomicBool::new(false));
    let mut state = self.inner.state.lock();
    state.generation += 1;
    let generation = state.generation;
    state.armed = Some(Armed {
      generation,
      deadline: started + budget,
      cancel: Arc::clone(&cancel),
    });
    self.inner.cv.notify_one();
    WatchdogGuard {
      generation,
      started,
      cancel,
      inner: Arc::clone(&self.inner),
    }
  }
}

impl Drop for Watchdog {
  fn drop(&mut self) {
    {
      let mut state = self.inner.state.lock();
      state.shutdown = true;
      self.inner.cv.notify_one();
    }

    if let Some(handle) = self.thread.take() {
      let _ = handle.join();
    }
  }
}

impl WatchdogGuard {
  /// The flag set once the deadline passes. Executors poll it.
  pub fn cancel_flag(&self) -> &Arc<AtomicBool> {
    &self.cancel
  }

  pub fn fired(&self) -> bool {
    self.cancel.load(Ordering::Acquire)
  }

  pub fn elapsed(&self) -> Duration {
    self.started.elapsed()
  }
}

impl Drop for WatchdogGuard {
  fn drop(&mut self) {
    let mut state = self.inner.state.lock();
    if state
      .armed
      .as_ref()
      .is_some_and(|armed| armed.generation == self.generation)
    {
      state.armed = None;
      self.inner.cv.notify_one();
    }
  }
}

fn watch(inner: Arc<Inner>) {
  let mut state = inner.state.lock();
  loop {
    if state.shutdown {
      return;
    }

    let Some(deadline) = state.armed.as_ref().map(|armed| armed.deadline) else {
      inner.cv.wait(&mut state);
      continue;
    };

    if Instant::now() >= deadline {
      if let Some(armed) = state.armed.take() {
        armed.cancel.store(true, Ordering::Release);
        tracing::debug!(generation = armed.generation, "deadline exceeded");
      }
      continue;
    }

    inner.cv.wait_until(&mut state, deadline);
  }
}
