//! Cancellable timers: repeating tasks and one-shot delays.
//!
//! Both kinds run on the Tokio timer, so tests drive them with
//! `#[tokio::test(start_paused = true)]` and `tokio::time::advance`.
//! Dropping the handle cancels the task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A period that can change while tasks are sleeping on it.
///
/// Clones share the same value. A repeating task reads it after every
/// run, so a change applies from the next sleep on.
#[derive(Debug, Clone)]
pub struct Cadence {
    millis: Arc<AtomicU64>,
}

impl Cadence {
    pub fn new(period: Duration) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(period.as_millis() as u64)),
        }
    }

    pub fn set(&self, period: Duration) {
        self.millis.store(period.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::Relaxed))
    }
}

/// Handle to a spawned timer task.
#[derive(Debug)]
struct TaskGuard {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskGuard {
    fn cancel(&self) {
        self.token.cancel();
    }

    fn is_finished(&self) -> bool {
        self.token.is_cancelled() || self.handle.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Runs a closure now and then again after every period.
///
/// The closure returns `false` to stop. [`cancel`](Self::cancel) or
/// dropping the handle stops it before the next run.
#[derive(Debug)]
pub struct RepeatingTask {
    guard: TaskGuard,
}

impl RepeatingTask {
    pub fn spawn<F>(cadence: Cadence, mut run: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                if child.is_cancelled() || !run() {
                    break;
                }
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(cadence.get()) => {}
                }
            }
        });
        Self {
            guard: TaskGuard { token, handle },
        }
    }

    /// Shorthand for a fixed period.
    pub fn every<F>(period: Duration, run: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::spawn(Cadence::new(period), run)
    }

    pub fn cancel(&self) {
        self.guard.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.guard.is_finished()
    }
}

/// Runs a closure once after a delay, unless cancelled first.
#[derive(Debug)]
pub struct DelayedTask {
    guard: TaskGuard,
}

impl DelayedTask {
    pub fn spawn<F>(delay: Duration, run: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(delay) => run(),
            }
        });
        Self {
            guard: TaskGuard { token, handle },
        }
    }

    pub fn cancel(&self) {
        self.guard.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.guard.is_finished()
    }
}
