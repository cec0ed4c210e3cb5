//! Debounce controller
//!
//! Turns a stream of change events into coalesced retranslation triggers.
//! Pending changes are deduplicated per path (latest timestamp wins) and a
//! single timer is (re)armed according to the active strategy:
//! - simple: fixed quiet period, restarted on every call
//! - adaptive: quiet period stretched under bursty load, shortened after idle
//! - batch: fire as soon as the batch is full, otherwise after the quiet period;
//!   with a rate limit, bursts are sliced into batch-sized chunks
//!
//! Handler invocations are serialized: a trigger that fires while the
//! previous handler is still running waits for it.

use crate::schedule::ScheduledTask;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use relocale_core::{now_ms, DebounceStrategy, FileChangeEvent, PendingChangeSet, StrategyKind};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

const DEFAULT_BATCH_SIZE: usize = 10;

/// Receiver of coalesced change sets
#[async_trait]
pub trait RetranslationHandler: Send + Sync {
    async fn retranslate(&self, changes: Vec<FileChangeEvent>) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a handler
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> RetranslationHandler for FnHandler<F>
where
    F: Fn(Vec<FileChangeEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn retranslate(&self, changes: Vec<FileChangeEvent>) -> anyhow::Result<()> {
        (self.0)(changes).await
    }
}

/// Snapshot of controller state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebounceStatistics {
    pub pending_changes: usize,
    pub is_active: bool,
    pub strategy: StrategyKind,
    /// Unix ms of the last handler invocation
    pub last_execution_time: Option<u64>,
    pub executions: u64,
    pub failures: u64,
}

struct DebounceState {
    strategy: DebounceStrategy,
    pending: PendingChangeSet,
    timer: ScheduledTask,
    last_execution: Option<Instant>,
    last_execution_ms: Option<u64>,
    frequency_window: VecDeque<Instant>,
    rate_queue: VecDeque<FileChangeEvent>,
    queue_task: Option<JoinHandle<()>>,
    executions: u64,
    failures: u64,
}

impl DebounceState {
    fn track_frequency(&mut self, now: Instant) {
        let tuning = self.strategy.tuning;
        let window = Duration::from_millis(tuning.window);
        self.frequency_window.push_back(now);
        while let Some(&front) = self.frequency_window.front() {
            if now.duration_since(front) >= window {
                self.frequency_window.pop_front();
            } else {
                break;
            }
        }
        while self.frequency_window.len() > tuning.window_size {
            self.frequency_window.pop_front();
        }
    }

    /// Changes per second over the trailing window
    fn change_frequency(&self) -> f64 {
        if self.frequency_window.len() < 2 {
            return 0.0;
        }
        let window_secs = self.strategy.tuning.window as f64 / 1000.0;
        self.frequency_window.len() as f64 / window_secs
    }

    fn is_draining(&self) -> bool {
        self.queue_task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Delay chosen by the adaptive strategy
///
/// `since_last` is `None` when nothing has fired yet, which counts as a
/// long idle period.
pub fn adaptive_delay(strategy: &DebounceStrategy, frequency: f64, since_last: Option<Duration>) -> Duration {
    let tuning = strategy.tuning;
    let base = strategy.delay;
    let idle = since_last.unwrap_or(Duration::MAX);
    let mut delay = base;

    if frequency > tuning.frequency_threshold || idle < base.saturating_mul(2) {
        let multiplier = (frequency / tuning.frequency_threshold).min(tuning.max_multiplier);
        let stretched = base.mul_f64(1.0 + multiplier);
        let ceiling = strategy.max_wait.unwrap_or_else(|| base.saturating_mul(4));
        delay = stretched.min(ceiling);
    }

    if idle > base.saturating_mul(5) {
        delay = base.mul_f64(0.5).max(Duration::from_millis(tuning.min_delay));
    }

    delay
}

/// Delay chosen by the batch strategy when the batch is not yet full
pub fn batch_delay(strategy: &DebounceStrategy) -> Duration {
    let max_wait = strategy
        .max_wait
        .unwrap_or_else(|| strategy.delay.saturating_mul(6));
    strategy.delay.min(max_wait)
}

struct Shared {
    state: Mutex<DebounceState>,
    handler: RwLock<Option<Arc<dyn RetranslationHandler>>>,
    in_flight: tokio::sync::Mutex<()>,
}

/// Debounce controller handle; clones share state
#[derive(Clone)]
pub struct DebounceController {
    shared: Arc<Shared>,
}

impl DebounceController {
    pub fn new(strategy: DebounceStrategy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DebounceState {
                    strategy,
                    pending: PendingChangeSet::new(),
                    timer: ScheduledTask::new(),
                    last_execution: None,
                    last_execution_ms: None,
                    frequency_window: VecDeque::new(),
                    rate_queue: VecDeque::new(),
                    queue_task: None,
                    executions: 0,
                    failures: 0,
                }),
                handler: RwLock::new(None),
                in_flight: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn set_handler(&self, handler: Arc<dyn RetranslationHandler>) {
        *self.shared.handler.write() = Some(handler);
    }

    /// Merge `changes` into the pending set and (re)arm the trigger
    pub fn schedule_retranslation(&self, changes: Vec<FileChangeEvent>) {
        let mut state = self.shared.state.lock();

        if state.strategy.kind == StrategyKind::Batch && state.strategy.rate_limit_delay.is_some() {
            state.rate_queue.extend(changes);
            if !state.is_draining() {
                let shared = self.shared.clone();
                state.queue_task = Some(tokio::spawn(drain_rate_queue(shared)));
            }
            return;
        }

        state.track_frequency(Instant::now());
        state.pending.extend(changes);
        state.timer.cancel();
        arm(&self.shared, &mut state);
    }

    /// Discard the timer, the pending set and any rate-limit queue
    pub fn cancel_pending(&self) {
        let mut state = self.shared.state.lock();
        state.timer.cancel();
        state.pending.clear();
        state.rate_queue.clear();
        if let Some(task) = state.queue_task.take() {
            task.abort();
        }
    }

    pub fn is_retranslation_pending(&self) -> bool {
        let state = self.shared.state.lock();
        state.timer.is_armed() || state.is_draining()
    }

    /// Time left before the armed trigger fires
    pub fn time_until_execution(&self) -> Duration {
        self.shared.state.lock().timer.remaining()
    }

    /// Swap the strategy, re-scheduling anything pending under it
    pub fn update_strategy(&self, strategy: DebounceStrategy) {
        let rescheduled = {
            let mut state = self.shared.state.lock();
            debug!("Debounce strategy set to {} ({:?})", strategy.kind, strategy.delay);
            state.strategy = strategy;
            if state.timer.is_armed() && !state.pending.is_empty() {
                state.timer.cancel();
                Some(state.pending.drain())
            } else {
                None
            }
        };

        if let Some(changes) = rescheduled {
            self.schedule_retranslation(changes);
        }
    }

    pub fn strategy(&self) -> DebounceStrategy {
        self.shared.state.lock().strategy.clone()
    }

    pub fn pending_paths(&self) -> Vec<PathBuf> {
        let state = self.shared.state.lock();
        let mut paths = state.pending.paths();
        paths.extend(state.rate_queue.iter().map(|e| e.path.clone()));
        paths
    }

    pub fn statistics(&self) -> DebounceStatistics {
        let state = self.shared.state.lock();
        DebounceStatistics {
            pending_changes: state.pending.len() + state.rate_queue.len(),
            is_active: state.timer.is_armed() || state.is_draining(),
            strategy: state.strategy.kind,
            last_execution_time: state.last_execution_ms,
            executions: state.executions,
            failures: state.failures,
        }
    }
}

/// Arm the timer for the current strategy. Caller has cancelled any old one.
fn arm(shared: &Arc<Shared>, state: &mut DebounceState) {
    let delay = match state.strategy.kind {
        StrategyKind::Simple => state.strategy.delay,
        StrategyKind::Adaptive => {
            let since_last = state.last_execution.map(|t| t.elapsed());
            adaptive_delay(&state.strategy, state.change_frequency(), since_last)
        }
        StrategyKind::Batch => {
            let batch_size = state.strategy.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
            if state.pending.len() >= batch_size {
                Duration::ZERO
            } else {
                batch_delay(&state.strategy)
            }
        }
    };

    let shared = shared.clone();
    state
        .timer
        .schedule(delay, move |generation| fire(shared, generation));
}

async fn fire(shared: Arc<Shared>, generation: u64) {
    let _in_flight = shared.in_flight.lock().await;

    let changes = {
        let mut state = shared.state.lock();
        if !state.timer.claim(generation) {
            return;
        }
        if state.pending.is_empty() {
            return;
        }
        state.pending.drain()
    };
    run_handler(&shared, changes).await;
}

/// Hand one slice to the handler, after any run already in flight
async fn dispatch(shared: &Arc<Shared>, changes: Vec<FileChangeEvent>) {
    let _in_flight = shared.in_flight.lock().await;
    run_handler(shared, changes).await;
}

/// Caller holds `in_flight`
async fn run_handler(shared: &Arc<Shared>, changes: Vec<FileChangeEvent>) {
    {
        let mut state = shared.state.lock();
        state.last_execution = Some(Instant::now());
        state.last_execution_ms = Some(now_ms());
        state.executions += 1;
    }

    let handler = shared.handler.read().clone();
    let Some(handler) = handler else {
        warn!("Debounce fired with {} changes but no handler is set", changes.len());
        return;
    };

    debug!("Debounce firing with {} changes", changes.len());
    let outcome = AssertUnwindSafe(handler.retranslate(changes)).catch_unwind().await;
    let failed = match outcome {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            error!("Retranslation failed: {:#}", e);
            true
        }
        Err(_) => {
            error!("Retranslation handler panicked");
            true
        }
    };
    if failed {
        shared.state.lock().failures += 1;
    }
}

enum DrainStep {
    Wait(Duration),
    Dispatch(Vec<FileChangeEvent>, Duration),
}

/// Run the rate-limit queue as `batchSize` slices separated by `rateLimitDelay`
///
/// Each slice leaves the queue before the handler is awaited, so a slow
/// handler never sees slices merged. A burst smaller than one batch first
/// waits out the batch delay to collect more changes.
async fn drain_rate_queue(shared: Arc<Shared>) {
    let mut in_burst = false;
    loop {
        let step = {
            let mut state = shared.state.lock();
            if state.rate_queue.is_empty() {
                state.queue_task = None;
                return;
            }
            let batch_size = state.strategy.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);
            if !in_burst && state.rate_queue.len() < batch_size {
                DrainStep::Wait(batch_delay(&state.strategy))
            } else {
                let take = batch_size.min(state.rate_queue.len());
                let slice = state
                    .rate_queue
                    .drain(..take)
                    .collect::<PendingChangeSet>()
                    .drain();
                state.track_frequency(Instant::now());
                let pause = state
                    .strategy
                    .rate_limit_delay
                    .unwrap_or(Duration::from_millis(100));
                DrainStep::Dispatch(slice, pause)
            }
        };
        in_burst = true;

        match step {
            DrainStep::Wait(delay) => tokio::time::sleep(delay).await,
            DrainStep::Dispatch(slice, pause) => {
                dispatch(&shared, slice).await;
                tokio::time::sleep(pause).await;
            }
        }
    }
}
