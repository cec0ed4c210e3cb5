//! Resource manager
//!
//! Admission control for downstream work. Operations run immediately while
//! the pool has room, the rate limiter allows a start and memory pressure is
//! below the ceiling; otherwise they wait in a priority queue (lower value is
//! more urgent, FIFO within a priority). A slot is held for the lifetime of
//! the operation and released on completion, cancellation or panic.

use crate::monitor::SystemMetrics;
use parking_lot::{Mutex, RwLock};
use relocale_core::now_ms;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const PUMP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("operation queue cleared")]
    QueueCleared,

    #[error("resource manager is shut down")]
    ShutDown,

    #[error("operation failed: {0:#}")]
    OperationFailed(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionLimits {
    /// Memory fraction above which nothing new starts
    pub max_memory_usage: f64,
    pub max_watched_files: usize,
    pub max_concurrent_operations: usize,
    pub rate_limit_delay: Duration,
    pub batch_size: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_memory_usage: 0.8,
            max_watched_files: 1000,
            max_concurrent_operations: 10,
            rate_limit_delay: Duration::from_millis(100),
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub max_operations_per_second: usize,
    pub max_operations_per_minute: usize,
    /// Starts allowed within `window`
    pub burst_limit: usize,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_operations_per_second: 10,
            max_operations_per_minute: 300,
            burst_limit: 20,
            window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub active_operations: usize,
    pub queued_operations: usize,
    pub total_operations: u64,
    pub memory_usage: f64,
    pub watched_files: usize,
    pub last_operation_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatistics {
    pub queue_size: usize,
    pub active_operations: usize,
    pub total_operations: u64,
    pub average_queue_time: Duration,
    pub operations_per_second: usize,
}

#[derive(Debug, Clone)]
pub enum ResourceEvent {
    OperationQueued { queue_size: usize, priority: u32 },
    OperationStarted { active: usize, total: u64 },
    OperationCompleted { success: bool, active: usize },
    QueueCleared { rejected: usize },
    ResourceUsageUpdated(ResourceUsage),
    LimitsUpdated(AdmissionLimits),
    GarbageCollected { freed: usize },
    Shutdown,
}

type GcHook = Arc<dyn Fn() -> usize + Send + Sync>;

struct Waiter {
    priority: u32,
    seq: u64,
    queued_at: Instant,
    tx: oneshot::Sender<Result<(), ResourceError>>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // BinaryHeap pops the greatest: lowest priority value, then oldest
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ResourceState {
    limits: AdmissionLimits,
    rate: RateLimitConfig,
    usage: ResourceUsage,
    queue: BinaryHeap<Waiter>,
    history: VecDeque<Instant>,
    next_seq: u64,
    queued_total: u64,
    queued_wait: Duration,
    pump_scheduled: bool,
    shut_down: bool,
}

impl ResourceState {
    /// Starts within `span` of `now`
    fn starts_within(&self, now: Instant, span: Duration) -> usize {
        match now.checked_sub(span) {
            Some(since) => self.history.iter().rev().take_while(|t| **t > since).count(),
            None => self.history.len(),
        }
    }

    fn within_rate_limit(&self, now: Instant) -> bool {
        self.starts_within(now, Duration::from_secs(1)) < self.rate.max_operations_per_second
            && self.starts_within(now, Duration::from_secs(60)) < self.rate.max_operations_per_minute
            && self.starts_within(now, self.rate.window) < self.rate.burst_limit
    }

    fn can_start(&self, now: Instant) -> bool {
        !self.shut_down
            && self.usage.active_operations < self.limits.max_concurrent_operations
            && self.usage.memory_usage <= self.limits.max_memory_usage
            && self.within_rate_limit(now)
    }

    fn start(&mut self, now: Instant) {
        self.usage.active_operations += 1;
        self.usage.total_operations += 1;
        self.usage.last_operation_at = Some(now_ms());
        self.history.push_back(now);

        let keep = self.rate.window.max(Duration::from_secs(60));
        while let Some(front) = self.history.front() {
            if now.duration_since(*front) > keep {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }
}

struct Inner {
    state: Mutex<ResourceState>,
    events: broadcast::Sender<ResourceEvent>,
    gc_hooks: RwLock<Vec<GcHook>>,
}

impl Inner {
    fn emit(&self, event: ResourceEvent) {
        let _ = self.events.send(event);
    }
}

/// Handle to the shared resource manager; clones share state
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

/// An admitted operation's slot, released on drop
struct Slot {
    inner: Arc<Inner>,
    success: bool,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let active = {
            let mut state = self.inner.state.lock();
            state.usage.active_operations = state.usage.active_operations.saturating_sub(1);
            state.usage.active_operations
        };
        self.inner.emit(ResourceEvent::OperationCompleted {
            success: self.success,
            active,
        });
        pump(&self.inner);
    }
}

/// Admit as many waiters as the limits allow; re-check later if blocked
fn pump(inner: &Arc<Inner>) {
    let now = Instant::now();
    let mut started = Vec::new();
    let reschedule = {
        let mut state = inner.state.lock();
        while state.can_start(now) {
            let Some(waiter) = state.queue.pop() else {
                break;
            };
            state.start(now);
            if waiter.tx.send(Ok(())).is_err() {
                // Caller went away while queued
                state.usage.active_operations = state.usage.active_operations.saturating_sub(1);
                continue;
            }
            state.queued_wait += now.duration_since(waiter.queued_at);
            started.push((state.usage.active_operations, state.usage.total_operations));
        }
        state.usage.queued_operations = state.queue.len();

        let blocked = !state.queue.is_empty() && !state.shut_down;
        if blocked && !state.pump_scheduled {
            state.pump_scheduled = true;
            true
        } else {
            false
        }
    };

    for (active, total) in started {
        inner.emit(ResourceEvent::OperationStarted { active, total });
    }

    if reschedule {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            inner.state.lock().pump_scheduled = false;
            return;
        };
        let inner = inner.clone();
        handle.spawn(async move {
            tokio::time::sleep(PUMP_INTERVAL).await;
            inner.state.lock().pump_scheduled = false;
            pump(&inner);
        });
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(AdmissionLimits::default(), RateLimitConfig::default())
    }
}

impl ResourceManager {
    pub fn new(limits: AdmissionLimits, rate: RateLimitConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ResourceState {
                    limits,
                    rate,
                    usage: ResourceUsage::default(),
                    queue: BinaryHeap::new(),
                    history: VecDeque::new(),
                    next_seq: 0,
                    queued_total: 0,
                    queued_wait: Duration::ZERO,
                    pump_scheduled: false,
                    shut_down: false,
                }),
                events,
                gc_hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.inner.events.subscribe()
    }

    /// Run `operation` once admitted
    ///
    /// Lower `priority` values are admitted first when queued.
    pub async fn execute_operation<T, F, Fut>(&self, priority: u32, operation: F) -> Result<T, ResourceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut slot = self.admit(priority).await?;
        match operation().await {
            Ok(value) => {
                slot.success = true;
                Ok(value)
            }
            Err(e) => Err(ResourceError::OperationFailed(e)),
        }
    }

    async fn admit(&self, priority: u32) -> Result<Slot, ResourceError> {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(ResourceError::ShutDown);
            }

            let now = Instant::now();
            if state.queue.is_empty() && state.can_start(now) {
                state.start(now);
                let (active, total) = (state.usage.active_operations, state.usage.total_operations);
                drop(state);
                self.inner.emit(ResourceEvent::OperationStarted { active, total });
                return Ok(Slot {
                    inner: self.inner.clone(),
                    success: false,
                });
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queued_total += 1;
            state.queue.push(Waiter {
                priority,
                seq,
                queued_at: now,
                tx,
            });
            state.usage.queued_operations = state.queue.len();
            let queue_size = state.queue.len();
            drop(state);

            debug!("Operation queued (priority {}, queue size {})", priority, queue_size);
            self.inner.emit(ResourceEvent::OperationQueued { queue_size, priority });
            rx
        };

        pump(&self.inner);

        match rx.await {
            Ok(Ok(())) => Ok(Slot {
                inner: self.inner.clone(),
                success: false,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ResourceError::QueueCleared),
        }
    }

    /// Run `operations` in chunks of `batch_size`, pausing by the configured
    /// rate-limit delay between chunks. Results keep input order.
    pub async fn execute_batch<T, F, Fut>(
        &self,
        operations: Vec<F>,
        batch_size: Option<usize>,
    ) -> Result<Vec<T>, ResourceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let (default_size, pause) = {
            let state = self.inner.state.lock();
            (state.limits.batch_size, state.limits.rate_limit_delay)
        };
        let size = batch_size.unwrap_or(default_size).max(1);

        let mut results = Vec::with_capacity(operations.len());
        let mut remaining = operations.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<F> = remaining.by_ref().take(size).collect();
            let outcomes = futures::future::try_join_all(
                chunk.into_iter().map(|op| self.execute_operation(0, op)),
            )
            .await;

            match outcomes {
                Ok(values) => results.extend(values),
                Err(e) => {
                    warn!("Batch execution failed after {} results: {}", results.len(), e);
                    return Err(e);
                }
            }

            if remaining.peek().is_some() && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
        Ok(results)
    }

    /// Fail every queued operation with [`ResourceError::QueueCleared`]
    pub fn clear_queue(&self) -> usize {
        let waiters: Vec<Waiter> = {
            let mut state = self.inner.state.lock();
            state.usage.queued_operations = 0;
            state.queue.drain().collect()
        };
        let rejected = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(ResourceError::QueueCleared));
        }
        if rejected > 0 {
            info!("Cleared {} queued operations", rejected);
        }
        self.inner.emit(ResourceEvent::QueueCleared { rejected });
        rejected
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.inner.state.lock().limits
    }

    pub fn update_resource_limits(&self, limits: AdmissionLimits) {
        self.inner.state.lock().limits = limits;
        self.inner.emit(ResourceEvent::LimitsUpdated(limits));
        pump(&self.inner);
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        self.inner.state.lock().rate
    }

    pub fn update_rate_limit_config(&self, rate: RateLimitConfig) {
        self.inner.state.lock().rate = rate;
        pump(&self.inner);
    }

    /// Fold a host sample into the admission decision
    pub fn update_resource_usage(&self, metrics: &SystemMetrics) {
        let usage = {
            let mut state = self.inner.state.lock();
            state.usage.memory_usage = metrics.memory_usage;
            state.usage.watched_files = metrics.watched_files;
            state.usage.clone()
        };
        self.inner.emit(ResourceEvent::ResourceUsageUpdated(usage));
        pump(&self.inner);
    }

    pub fn set_watched_files(&self, count: usize) {
        self.inner.state.lock().usage.watched_files = count;
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        self.inner.state.lock().usage.clone()
    }

    pub fn queue_statistics(&self) -> QueueStatistics {
        let state = self.inner.state.lock();
        let average_queue_time = if state.queued_total > 0 {
            state.queued_wait / state.queued_total as u32
        } else {
            Duration::ZERO
        };

        QueueStatistics {
            queue_size: state.queue.len(),
            active_operations: state.usage.active_operations,
            total_operations: state.usage.total_operations,
            average_queue_time,
            operations_per_second: state.starts_within(Instant::now(), Duration::from_secs(1)),
        }
    }

    pub fn is_under_resource_pressure(&self) -> bool {
        let state = self.inner.state.lock();
        let limits = &state.limits;
        state.usage.memory_usage > limits.max_memory_usage * 0.8
            || state.usage.active_operations as f64 >= limits.max_concurrent_operations as f64 * 0.8
            || state.queue.len() > 50
            || !state.within_rate_limit(Instant::now())
    }

    /// Register a hook that frees memory and returns how many entries it dropped
    pub fn register_gc_hook<F>(&self, hook: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        self.inner.gc_hooks.write().push(Arc::new(hook));
    }

    pub fn force_garbage_collection(&self) -> usize {
        let hooks: Vec<GcHook> = self.inner.gc_hooks.read().clone();
        let freed: usize = hooks.iter().map(|hook| hook()).sum();
        debug!("Garbage collection freed {} entries", freed);
        self.inner.emit(ResourceEvent::GarbageCollected { freed });
        freed
    }

    /// Reject queued and future work
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.history.clear();
        }
        self.clear_queue();
        self.inner.emit(ResourceEvent::Shutdown);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }
}
