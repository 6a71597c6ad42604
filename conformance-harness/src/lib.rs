//! Shared utilities for writing deterministic conformance test runners.
//!
//! Runners own their own execution model; this crate only provides the pieces
//! that are independent of it: expected-failure lists that can be reconciled
//! in place, and a watchdog that trips a cancellation flag at a deadline.

mod expectations;
mod timeout;

pub use expectations::{ExpectationList, ExpectationRegistry, ListId, COMMENT_MARKER};
pub use timeout::{Watchdog, WatchdogGuard};
