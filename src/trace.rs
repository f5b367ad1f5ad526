//! Instrumentation hooks for pools and retry loops
//!
//! Every method has a no-op default, so an implementation only overrides
//! the events it cares about.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Pool was constructed
#[derive(Debug, Clone, Copy)]
pub struct NewInfo {
    pub limit: usize,
}

/// A single acquire-and-run attempt finished
#[derive(Debug, Clone, Copy)]
pub struct TryDoneInfo<'a> {
    pub latency: Duration,
    pub error: Option<&'a (dyn StdError + 'static)>,
}

/// A retrying execute call finished
#[derive(Debug, Clone, Copy)]
pub struct WithDoneInfo<'a> {
    pub attempts: usize,
    pub latency: Duration,
    pub error: Option<&'a (dyn StdError + 'static)>,
}

/// Pool close finished
#[derive(Debug, Clone, Copy)]
pub struct CloseDoneInfo<'a> {
    pub closed_items: usize,
    pub error: Option<&'a (dyn StdError + 'static)>,
}

/// Occupancy after a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeInfo {
    pub limit: usize,
    pub index: usize,
    pub idle: usize,
    pub create_in_progress: usize,
    pub waiting: usize,
}

/// Hooks fired by [`Pool`](crate::Pool)
pub trait PoolTrace: Send + Sync + fmt::Debug {
    fn on_new(&self, _info: NewInfo) {}

    fn on_try(&self, _info: TryDoneInfo<'_>) {}

    fn on_with(&self, _info: WithDoneInfo<'_>) {}

    fn on_close(&self, _info: CloseDoneInfo<'_>) {}

    fn on_change(&self, _info: ChangeInfo) {}
}

/// Hooks fired by [`retry`](crate::retry())
pub trait RetryTrace: Send + Sync + fmt::Debug {
    fn on_retry_start(&self, _id: &str, _idempotent: bool) {}

    /// An attempt failed and the loop is about to back off
    fn on_retry_intermediate(&self, _id: &str, _attempt: usize, _error: &dyn fmt::Display) {}

    fn on_retry_done(&self, _id: &str, _attempts: usize, _error: Option<&dyn fmt::Display>) {}
}

/// Trace that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTrace;

impl PoolTrace for NoopTrace {}

impl RetryTrace for NoopTrace {}
