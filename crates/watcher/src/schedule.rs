//! Single-shot, replace-on-rearm timers
//!
//! A `ScheduledTask` owns at most one pending tokio task. Re-arming aborts
//! the previous one, so timers never stack. Each arming gets a generation
//! number; the fired future calls [`ScheduledTask::claim`] with it before
//! doing work, which detaches the task (a later re-arm will not abort a
//! callback already running) and rejects stale wake-ups.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
    deadline: Option<Instant>,
    generation: u64,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any pending one
    ///
    /// `make` receives the generation to pass to [`claim`](Self::claim).
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&mut self, delay: Duration, make: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let deadline = Instant::now() + delay;
        let fut = make(generation);

        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fut.await;
        }));
        self.deadline = Some(deadline);
        generation
    }

    /// Abort the pending task, if any. Returns true if one was armed.
    pub fn cancel(&mut self) -> bool {
        self.deadline = None;
        match self.handle.take() {
            Some(handle) => {
                let armed = !handle.is_finished();
                handle.abort();
                armed
            }
            None => false,
        }
    }

    /// Take ownership of a firing for `generation`
    ///
    /// Returns false for a stale generation. On success the timer is
    /// disarmed without aborting the running task.
    pub fn claim(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        self.deadline = None;
        true
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn deadline(&self) -> Option<Instant> {
        if self.is_armed() {
            self.deadline
        } else {
            None
        }
    }

    /// Time left before the timer fires, zero when disarmed
    pub fn remaining(&self) -> Duration {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
