//! Await-once wrapper for asynchronous autorun results.
//!
//! A [`OnceTask`] is a small state machine over a future:
//! `Pending(future) → Resolved(value)`, with a terminal `Cancelled` arm.
//! The underlying future is polled until its first completion; every await
//! after that yields a clone of the same value. Resolution is idempotent.
//!
//! Autoruns with await-once semantics cache an `Arc<OnceTask<T>>` as their
//! latest value; when a new run replaces a task that was never awaited, the
//! replaced task is cancelled, dropping its future.

use std::fmt;
use std::future::Future;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::types::BoxFutureOf;

enum TaskState<T> {
    Pending {
        future: BoxFutureOf<T>,
        /// Wakers of waiters other than the one currently driving the poll.
        waiters: Vec<Waker>,
    },
    Resolved(T),
    Cancelled,
}

/// A future wrapper that resolves at most once and caches the result.
pub struct OnceTask<T> {
    state: Mutex<TaskState<T>>,
}

impl<T> OnceTask<T> {
    /// Wrap a future. Nothing is polled until the first [`wait`](Self::wait).
    pub fn new(future: impl Future<Output = T> + Send + 'static) -> Self {
        Self {
            state: Mutex::new(TaskState::Pending {
                future: Box::pin(future),
                waiters: Vec::new(),
            }),
        }
    }

    /// An already-resolved task. Used for default values.
    pub fn ready(value: T) -> Self {
        Self {
            state: Mutex::new(TaskState::Resolved(value)),
        }
    }

    /// Whether the underlying future has completed.
    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.lock(), TaskState::Resolved(_))
    }

    /// Whether the task was cancelled before resolving.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), TaskState::Cancelled)
    }

    /// Drop the pending future. A no-op once resolved.
    ///
    /// Waiters parked on the task are woken and observe `None`.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if let TaskState::Pending { waiters, .. } = &mut *state {
            let waiters = std::mem::take(waiters);
            *state = TaskState::Cancelled;
            drop(state);
            for waker in waiters {
                waker.wake();
            }
        }
    }
}

impl<T: Clone> OnceTask<T> {
    /// The resolved value, if resolution already happened.
    pub fn try_value(&self) -> Option<T> {
        match &*self.state.lock() {
            TaskState::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Await the result.
    ///
    /// The first waiter drives the underlying future; later waiters park
    /// and are woken on resolution, after which every call returns a clone
    /// of the same value. Returns `None` if the task was cancelled.
    pub async fn wait(&self) -> Option<T> {
        std::future::poll_fn(|cx| self.poll_value(cx)).await
    }

    fn poll_value(&self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let mut state = self.state.lock();
        match &mut *state {
            TaskState::Pending { future, waiters } => match future.as_mut().poll(cx) {
                Poll::Ready(value) => {
                    let parked = std::mem::take(waiters);
                    let out = value.clone();
                    *state = TaskState::Resolved(value);
                    drop(state);
                    for waker in parked {
                        waker.wake();
                    }
                    Poll::Ready(Some(out))
                }
                Poll::Pending => {
                    if !waiters.iter().any(|w| w.will_wake(cx.waker())) {
                        waiters.push(cx.waker().clone());
                    }
                    Poll::Pending
                }
            },
            TaskState::Resolved(value) => Poll::Ready(Some(value.clone())),
            TaskState::Cancelled => Poll::Ready(None),
        }
    }
}

// Identity comparison: two tasks are equal only if they are the same task.
// Autoruns use this to detect that a run produced a new task.
impl<T> PartialEq for OnceTask<T> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl<T> fmt::Debug for OnceTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            TaskState::Pending { .. } => "pending",
            TaskState::Resolved(_) => "resolved",
            TaskState::Cancelled => "cancelled",
        };
        f.debug_struct("OnceTask").field("state", &state).finish()
    }
}
