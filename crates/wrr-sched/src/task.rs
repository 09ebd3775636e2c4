//! Resumable calls.
//!
//! A [`Task`] wraps an in-flight sandbox call as an explicit state machine.
//! The call itself is a boxed future supplied by the sandbox; it returns
//! `Pending` exactly when the guest yielded at a checkpoint. Tasks are
//! polled with a waker that does nothing, because nothing ever needs to be
//! woken: the driver simply polls again on its next round.
//!
//! ```text
//! Created -> Running -> Suspended -> Running -> ... -> Completed | Trapped | Failed
//! ```

use crate::error::{Result, SchedError};

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

/// Boxed guest call as produced by the sandbox.
pub type GuestCall<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a>>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Constructed; no guest code has run.
    Created,
    /// Executing guest code inside `poll`.
    Running,
    /// Yielded at a checkpoint; resumes on the next poll.
    Suspended,
    /// Returned normally.
    Completed,
    /// Guest fault or deadline trap.
    Trapped,
    /// Host-side error.
    Failed,
}

impl TaskState {
    /// True once the task can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Trapped | Self::Failed)
    }
}

/// Counters kept for every task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    /// Number of `poll` calls that reached the guest.
    pub polls: u64,
    /// Number of times the guest yielded.
    pub yields: u64,
    /// Time spent inside the guest across all polls.
    pub busy: Duration,
}

/// Health of an execution context, shared between the context and its tasks.
///
/// The first trap observed poisons the context; the reason is kept and later
/// calls on that context are refused.
#[derive(Debug, Clone, Default)]
pub struct ContextHealth {
    poisoned: Arc<OnceLock<String>>,
}

impl ContextHealth {
    /// Create a healthy flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason`; only the first reason is kept.
    pub fn poison(&self, reason: impl Into<String>) {
        let _ = self.poisoned.set(reason.into());
    }

    /// Reason the context was poisoned, if any.
    pub fn reason(&self) -> Option<&str> {
        self.poisoned.get().map(String::as_str)
    }

    /// True once a trap has been recorded.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get().is_some()
    }
}

struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

enum Body<'a, T> {
    Live(GuestCall<'a, T>),
    Rejected(SchedError),
    Finished,
}

/// A pollable, resumable in-flight call.
///
/// The lifetime ties the task to the execution context it runs on. While
/// the task exists the context is mutably borrowed, so a second task cannot
/// be started on it. Dropping an unfinished task cancels the call.
pub struct Task<'a, T> {
    id: TaskId,
    label: String,
    state: TaskState,
    body: Body<'a, T>,
    health: Option<ContextHealth>,
    stats: TaskStats,
    waker: Waker,
}

impl<'a, T> Task<'a, T> {
    /// Wrap a guest call.
    pub fn new(label: impl Into<String>, call: GuestCall<'a, T>) -> Self {
        Self::with_body(label.into(), Body::Live(call))
    }

    /// Build a task that fails on its first poll without running anything.
    pub fn rejected(label: impl Into<String>, error: SchedError) -> Self {
        Self::with_body(label.into(), Body::Rejected(error))
    }

    fn with_body(label: String, body: Body<'a, T>) -> Self {
        Self {
            id: TaskId::next(),
            label,
            state: TaskState::Created,
            body,
            health: None,
            stats: TaskStats::default(),
            waker: Waker::from(Arc::new(NoopWaker)),
        }
    }

    /// Builder: poison `health` if this task traps.
    pub fn watch(mut self, health: ContextHealth) -> Self {
        self.health = Some(health);
        self
    }

    /// Advance the call until it yields or finishes.
    ///
    /// Never blocks. Returns `Pending` when the guest yielded at a checkpoint.
    /// Once a `Ready` has been returned the caller must stop polling; further
    /// polls return [`SchedError::Host`].
    pub fn poll(&mut self) -> Poll<Result<T>> {
        let mut call = match std::mem::replace(&mut self.body, Body::Finished) {
            Body::Live(call) => call,
            Body::Rejected(error) => {
                self.state = TaskState::Failed;
                tracing::warn!(task = %self.id, label = %self.label, error = %error, "task rejected");
                return Poll::Ready(Err(error));
            }
            Body::Finished => {
                return Poll::Ready(Err(SchedError::host(format!(
                    "{} ({}) polled after it finished",
                    self.id, self.label
                ))));
            }
        };

        self.state = TaskState::Running;
        self.stats.polls += 1;
        let started = Instant::now();
        let mut cx = Context::from_waker(&self.waker);
        let outcome = call.as_mut().poll(&mut cx);
        self.stats.busy += started.elapsed();

        match outcome {
            Poll::Pending => {
                self.state = TaskState::Suspended;
                self.stats.yields += 1;
                tracing::debug!(task = %self.id, label = %self.label, yields = self.stats.yields, "task yielded");
                self.body = Body::Live(call);
                Poll::Pending
            }
            Poll::Ready(result) => {
                self.settle(&result);
                Poll::Ready(result)
            }
        }
    }

    fn settle(&mut self, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.state = TaskState::Completed;
                tracing::info!(
                    task = %self.id,
                    label = %self.label,
                    polls = self.stats.polls,
                    yields = self.stats.yields,
                    busy_us = self.stats.busy.as_micros() as u64,
                    "task completed"
                );
            }
            Err(error) if error.is_trap() => {
                self.state = TaskState::Trapped;
                if let Some(health) = &self.health {
                    health.poison(error.to_string());
                }
                tracing::warn!(task = %self.id, label = %self.label, error = %error, "task trapped");
            }
            Err(error) => {
                self.state = TaskState::Failed;
                tracing::warn!(task = %self.id, label = %self.label, error = %error, "task failed");
            }
        }
    }

    /// Task identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Human-readable label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Counters so far.
    pub fn stats(&self) -> TaskStats {
        self.stats
    }

    /// True once a terminal result has been returned.
    pub fn is_finished(&self) -> bool {
        matches!(self.body, Body::Finished)
    }
}

impl<T> Drop for Task<'_, T> {
    fn drop(&mut self) {
        if let Body::Live(_) = self.body {
            tracing::debug!(task = %self.id, label = %self.label, state = ?self.state, "task cancelled");
        }
    }
}

impl<T> fmt::Debug for Task<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}
