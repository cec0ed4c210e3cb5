//! Signal handling and bounded graceful shutdown

use crate::feedback::Feedback;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use relocale_core::WatchError;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown timed out after {0:?}")]
    TimedOut(Duration),
    #[error("stop failed: {0:#}")]
    StopFailed(anyhow::Error),
}

/// What a coordinator needs from the system it shuts down
#[async_trait]
pub trait Shutdownable: Send + Sync {
    async fn stop(&self) -> anyhow::Result<()>;
    fn is_healthy(&self) -> bool;
    /// Watched file count and error count for the final status line
    fn final_status(&self) -> (usize, usize);
    fn statistics(&self) -> serde_json::Value;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Completed,
    /// Another call already owns the shutdown
    AlreadyInProgress,
    TimedOut,
    Failed(String),
}

impl ShutdownOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownOutcome::Completed | ShutdownOutcome::AlreadyInProgress => 0,
            ShutdownOutcome::TimedOut | ShutdownOutcome::Failed(_) => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub is_shutting_down: bool,
    pub is_healthy: bool,
    pub uptime: Duration,
    pub statistics: serde_json::Value,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        writeln!(f, "Watch status report:")?;
        writeln!(f, "   Healthy: {}", yes_no(self.is_healthy))?;
        writeln!(f, "   Uptime: {}", format_uptime(self.uptime))?;
        writeln!(f, "   Shutting down: {}", yes_no(self.is_shutting_down))?;
        write!(f, "   Statistics: {}", self.statistics)
    }
}

/// `1h 2m 3s`, `4m 5s` or `6s`
pub fn format_uptime(uptime: Duration) -> String {
    let seconds = uptime.as_secs();
    let minutes = seconds / 60;
    let hours = minutes / 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes % 60, seconds % 60)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{seconds}s")
    }
}

type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub struct ShutdownCoordinator {
    target: Weak<dyn Shutdownable>,
    feedback: Arc<dyn Feedback>,
    timeout: Mutex<Duration>,
    shutting_down: AtomicBool,
    outcome: watch::Sender<Option<ShutdownOutcome>>,
    hooks: Mutex<Vec<ShutdownHook>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
    started: Instant,
}

impl ShutdownCoordinator {
    pub fn new(target: Weak<dyn Shutdownable>, feedback: Arc<dyn Feedback>, timeout: Duration) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            target,
            feedback,
            timeout: Mutex::new(clamp_timeout(timeout)),
            shutting_down: AtomicBool::new(false),
            outcome,
            hooks: Mutex::new(Vec::new()),
            health_task: Mutex::new(None),
            signal_task: Mutex::new(None),
            started: Instant::now(),
        }
    }

    /// Clamped to 1..=60 s
    pub fn set_shutdown_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = clamp_timeout(timeout);
    }

    pub fn shutdown_timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    /// Run `hook` after the target stops; hooks run in registration order
    pub fn add_handler<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.lock().push(Box::new(move || Box::pin(hook())));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Interrupt and terminate shut down; USR1 dumps status, USR2 re-checks health
    pub fn install_signal_handlers(self: &Arc<Self>) -> std::io::Result<()> {
        let task = spawn_signal_listener(Arc::downgrade(self))?;
        if let Some(previous) = self.signal_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub fn start_health_monitoring(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                coordinator.health_check();
            }
        });
        if let Some(previous) = self.health_task.lock().replace(task) {
            previous.abort();
        }
        debug!("Health monitoring every {:?}", interval);
    }

    pub fn stop_health_monitoring(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
    }

    /// Report an unhealthy target through the feedback channel
    pub fn health_check(&self) -> bool {
        let healthy = self.target.upgrade().is_some_and(|t| t.is_healthy());
        if !healthy {
            self.feedback
                .error(&WatchError::file_system("Watch manager health check failed"));
        }
        healthy
    }

    pub fn status_report(&self) -> StatusReport {
        let target = self.target.upgrade();
        StatusReport {
            is_shutting_down: self.is_shutting_down(),
            is_healthy: target.as_ref().is_some_and(|t| t.is_healthy()),
            uptime: self.started.elapsed(),
            statistics: target.map(|t| t.statistics()).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Stop the target and run hooks, bounded by the shutdown timeout
    ///
    /// Only the first call does anything; later calls return
    /// [`ShutdownOutcome::AlreadyInProgress`].
    pub async fn graceful_shutdown(&self, reason: &str) -> ShutdownOutcome {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already in progress");
            return ShutdownOutcome::AlreadyInProgress;
        }
        info!("Received {} signal, shutting down gracefully...", reason);

        self.stop_health_monitoring();
        let limit = self.shutdown_timeout();
        let outcome = match tokio::time::timeout(limit, self.perform_shutdown()).await {
            Ok(Ok(())) => {
                info!("Graceful shutdown completed");
                ShutdownOutcome::Completed
            }
            Ok(Err(e)) => {
                error!("Shutdown failed: {}", e);
                ShutdownOutcome::Failed(e.to_string())
            }
            Err(_) => {
                error!("{}, forcing shutdown", ShutdownError::TimedOut(limit));
                ShutdownOutcome::TimedOut
            }
        };

        if let Some(task) = self.signal_task.lock().take() {
            task.abort();
        }
        self.outcome.send_replace(Some(outcome.clone()));
        outcome
    }

    async fn perform_shutdown(&self) -> Result<(), ShutdownError> {
        if let Some(target) = self.target.upgrade() {
            let (watched, errors) = target.final_status();
            info!("Final status: {} files watched, {} errors", watched, errors);

            if let Err(e) = target.stop().await {
                self.feedback.error(
                    &WatchError::file_system(format!("Shutdown error: {e:#}")).unrecoverable(),
                );
                return Err(ShutdownError::StopFailed(e));
            }
        }

        let hooks: Vec<ShutdownHook> = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks {
            if let Err(e) = hook().await {
                warn!("Shutdown handler failed: {:#}", e);
            }
        }
        Ok(())
    }

    /// Resolve once a shutdown has finished
    pub async fn wait(&self) -> ShutdownOutcome {
        let mut rx = self.outcome.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return ShutdownOutcome::Failed("shutdown coordinator dropped".to_string());
            }
        }
    }

    /// Exit code of the finished shutdown, if any
    pub fn exit_code(&self) -> Option<i32> {
        self.outcome.borrow().as_ref().map(ShutdownOutcome::exit_code)
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        self.stop_health_monitoring();
        if let Some(task) = self.signal_task.get_mut().take() {
            task.abort();
        }
    }
}

fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.clamp(MIN_SHUTDOWN_TIMEOUT, MAX_SHUTDOWN_TIMEOUT)
}

#[cfg(unix)]
fn spawn_signal_listener(coordinator: Weak<ShutdownCoordinator>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut status = signal(SignalKind::user_defined1())?;
    let mut health = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        loop {
            let reason = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = status.recv() => {
                    if let Some(c) = coordinator.upgrade() {
                        info!("{}", c.status_report());
                    }
                    continue;
                }
                _ = health.recv() => {
                    if let Some(c) = coordinator.upgrade() {
                        c.health_check();
                    }
                    continue;
                }
            };

            let Some(c) = coordinator.upgrade() else {
                break;
            };
            // The shutdown aborts this listener, so it runs detached
            tokio::spawn(async move {
                c.graceful_shutdown(reason).await;
            });
        }
    }))
}

#[cfg(not(unix))]
fn spawn_signal_listener(coordinator: Weak<ShutdownCoordinator>) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            let Some(c) = coordinator.upgrade() else {
                break;
            };
            tokio::spawn(async move {
                c.graceful_shutdown("ctrl-c").await;
            });
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::{FeedbackSettings, RetranslationResult, TranslationProgress};
    use relocale_core::FileChangeEvent;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    struct Target {
        stops: AtomicUsize,
        stop_delay: Duration,
        healthy: AtomicBool,
    }

    impl Target {
        fn new(stop_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                stops: AtomicUsize::new(0),
                stop_delay,
                healthy: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl Shutdownable for Target {
        async fn stop(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.stop_delay).await;
            Ok(())
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        fn final_status(&self) -> (usize, usize) {
            (3, 0)
        }

        fn statistics(&self) -> serde_json::Value {
            serde_json::json!({ "totalChanges": 7 })
        }
    }

    #[derive(Default)]
    struct Errors(Mutex<Vec<String>>);

    impl Feedback for Errors {
        fn file_changed(&self, _: &FileChangeEvent) {}
        fn retranslation_started(&self, _: &[PathBuf]) {}
        fn progress(&self, _: &TranslationProgress) {}
        fn retranslation_complete(&self, _: &RetranslationResult) {}
        fn error(&self, error: &WatchError) {
            self.0.lock().push(error.message.clone());
        }
        fn update_settings(&self, _: FeedbackSettings) {}
    }

    fn coordinator(target: &Arc<Target>, feedback: Arc<Errors>, timeout: Duration) -> Arc<ShutdownCoordinator> {
        let target: Arc<dyn Shutdownable> = target.clone();
        Arc::new(ShutdownCoordinator::new(Arc::downgrade(&target), feedback, timeout))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_shutdown_runs_once() {
        let target = Target::new(Duration::from_millis(200));
        let coordinator = coordinator(&target, Arc::new(Errors::default()), DEFAULT_SHUTDOWN_TIMEOUT);
        let hooks = Arc::new(AtomicUsize::new(0));
        let counter = hooks.clone();
        coordinator.add_handler(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (first, second) = tokio::join!(
            coordinator.graceful_shutdown("SIGINT"),
            coordinator.graceful_shutdown("SIGTERM")
        );
        assert_eq!(first, ShutdownOutcome::Completed);
        assert_eq!(second, ShutdownOutcome::AlreadyInProgress);
        assert_eq!(target.stops.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.exit_code(), Some(0));
        assert_eq!(coordinator.wait().await, ShutdownOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_forces_failure() {
        let target = Target::new(Duration::from_secs(30));
        let coordinator = coordinator(&target, Arc::new(Errors::default()), Duration::from_millis(10));
        assert_eq!(coordinator.shutdown_timeout(), Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        let outcome = coordinator.graceful_shutdown("SIGTERM").await;
        assert_eq!(outcome, ShutdownOutcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));
        assert_eq!(coordinator.exit_code(), Some(1));
    }

    #[test]
    fn test_timeout_clamp() {
        let target = Target::new(Duration::ZERO);
        let coordinator = coordinator(&target, Arc::new(Errors::default()), Duration::from_secs(600));
        assert_eq!(coordinator.shutdown_timeout(), Duration::from_secs(60));
        coordinator.set_shutdown_timeout(Duration::from_secs(5));
        assert_eq!(coordinator.shutdown_timeout(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_reports_through_feedback() {
        let target = Target::new(Duration::ZERO);
        let errors = Arc::new(Errors::default());
        let coordinator = coordinator(&target, errors.clone(), DEFAULT_SHUTDOWN_TIMEOUT);

        assert!(coordinator.health_check());
        target.healthy.store(false, Ordering::SeqCst);
        coordinator.start_health_monitoring(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(errors.0.lock().len(), 2);
        assert_eq!(errors.0.lock()[0], "Watch manager health check failed");

        coordinator.graceful_shutdown("test").await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(errors.0.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_coordinator_stops_health_checks() {
        let target = Target::new(Duration::ZERO);
        target.healthy.store(false, Ordering::SeqCst);
        let errors = Arc::new(Errors::default());
        let coordinator = coordinator(&target, errors.clone(), DEFAULT_SHUTDOWN_TIMEOUT);

        coordinator.start_health_monitoring(Duration::from_secs(30));
        drop(coordinator);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(errors.0.lock().is_empty());
    }

    #[test]
    fn test_status_report() {
        let target = Target::new(Duration::ZERO);
        let coordinator = coordinator(&target, Arc::new(Errors::default()), DEFAULT_SHUTDOWN_TIMEOUT);
        let report = coordinator.status_report();
        assert!(report.is_healthy);
        assert!(!report.is_shutting_down);
        assert_eq!(report.statistics["totalChanges"], 7);
        assert!(report.to_string().contains("Healthy: yes"));

        assert_eq!(format_uptime(Duration::from_secs(3723)), "1h 2m 3s");
        assert_eq!(format_uptime(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_uptime(Duration::from_secs(9)), "9s");
    }
}
