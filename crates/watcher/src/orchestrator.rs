//! The watch loop
//!
//! [`WatchOrchestrator`] owns every resilience component and wires them
//! together: raw changes flow from the notify source through git-awareness
//! into the debounce controller, whose trigger runs the retranslation
//! pipeline. Every error goes through error recovery first and, when that
//! fails, into degradation evaluation.

use crate::debounce::{DebounceController, DebounceStatistics, RetranslationHandler};
use crate::degradation::{
    degrade_configuration, DegradationLevel, DegradationManager, DegradationStatistics, FeatureFlag,
    HealthStatus, ResourceLimits,
};
use crate::feedback::{Feedback, FeedbackSettings, RetranslationResult};
use crate::git::{FsGitProbe, GitAwareness, GitStatistics, VcsProbe};
use crate::monitor::{
    AlertLevel, HostSampler, MetricsSource, MonitorEvent, PerformanceMonitor, PerformanceSummary,
    PerformanceThresholds, WatchMetrics,
};
use crate::optimizer::{OptimizerConfig, OptimizerStatistics, PerformanceOptimizer};
use crate::patterns::{PatternResolver, WatchFilter};
use crate::pipeline::{run_retranslation, RetranslationPipeline, RunContext};
use crate::recovery::{ErrorContext, ErrorRecoveryManager, ErrorStatistics, RecoverableError, RecoveryContext, RecoveryResult};
use crate::resources::{AdmissionLimits, QueueStatistics, ResourceManager, ResourceUsage};
use crate::schedule::ScheduledTask;
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome, Shutdownable};
use crate::source::{watch_roots, NotifySource, SourceEvent};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use relocale_core::{
    load_configuration, now_ms, FileChangeBatch, FileChangeEvent, PendingChangeSet, WatchConfiguration, WatchError,
    WatchOverrides,
};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Errors beyond this many drop the oldest
const MAX_ACTIVE_ERRORS: usize = 100;
/// Error count at which the orchestrator reports itself unhealthy
const UNHEALTHY_ERROR_COUNT: u64 = 10;
/// Host memory fraction that forces cache trimming
const GC_MEMORY_FRACTION: f64 = 0.9;
const MIN_HEALTH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub root: PathBuf,
    pub config_path: Option<PathBuf>,
    pub overrides: WatchOverrides,
    /// Substituted into `[locale]` placeholders
    pub locales: Vec<String>,
    pub monitor_interval: Duration,
    pub install_signal_handlers: bool,
}

impl WatchOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config_path: None,
            overrides: WatchOverrides::default(),
            locales: Vec::new(),
            monitor_interval: Duration::from_secs(5),
            install_signal_handlers: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchPhase {
    Idle,
    Starting,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchStatistics {
    pub total_changes: u64,
    pub retranslation_count: u64,
    pub failed_retranslations: u64,
    pub error_count: u64,
    pub average_retranslation_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchStatus {
    pub phase: WatchPhase,
    pub is_retranslating: bool,
    pub watched_files: usize,
    pub watch_roots: Vec<PathBuf>,
    pub pending_changes: Vec<PathBuf>,
    /// Unix ms of the last finished retranslation
    pub last_retranslation: Option<u64>,
    pub error_count: u64,
    pub degradation_level: DegradationLevel,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatistics {
    pub watch: WatchStatistics,
    pub uptime_ms: u64,
    pub debounce: DebounceStatistics,
    pub git: Option<GitStatistics>,
    pub optimizer: OptimizerStatistics,
    pub queue: QueueStatistics,
    pub degradation_level: DegradationLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub monitor: PerformanceSummary,
    pub resources: ResourceUsage,
    pub limits: AdmissionLimits,
    pub queue: QueueStatistics,
    pub optimizer: OptimizerStatistics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub recovery: ErrorStatistics,
    /// Unrecovered errors feeding degradation
    pub active_errors: usize,
    pub degradation: DegradationStatistics,
    pub health: HealthStatus,
    pub limits: ResourceLimits,
    pub disabled_features: Vec<&'static str>,
}

type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// What a scheduled retry re-runs
#[derive(Debug, Clone)]
enum RetryPayload {
    Retranslation(Vec<FileChangeEvent>),
    Probe,
}

/// One armed retry per error signature
///
/// Failed runs sharing a signature merge their changes here, so re-arming
/// never drops the changes of an earlier failure.
#[derive(Debug, Default)]
struct PendingRetry {
    task: ScheduledTask,
    changes: PendingChangeSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Completed,
    Failed,
    Requeued,
    Skipped,
}

struct WatchState {
    phase: WatchPhase,
    /// Configuration before degradation
    config: Option<WatchConfiguration>,
    pending: PendingChangeSet,
    watched_files: Vec<PathBuf>,
    watch_roots: Vec<PathBuf>,
    started: Option<Instant>,
    last_retranslation: Option<u64>,
    statistics: WatchStatistics,
    active_errors: Vec<RecoverableError>,
    retries: HashMap<String, PendingRetry>,
}

struct Runtime {
    source: NotifySource,
    filter: WatchFilter,
    git: GitAwareness,
    source_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

struct RetranslationGuard<'a>(&'a AtomicBool);

impl Drop for RetranslationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct WatchOrchestrator {
    options: WatchOptions,
    root: PathBuf,
    pipeline: Arc<dyn RetranslationPipeline>,
    feedback: Arc<dyn Feedback>,
    probe: Arc<dyn VcsProbe>,
    debounce: DebounceController,
    recovery: ErrorRecoveryManager,
    degradation: DegradationManager,
    resources: ResourceManager,
    monitor: Arc<PerformanceMonitor>,
    optimizer: PerformanceOptimizer,
    state: Mutex<WatchState>,
    runtime: Mutex<Option<Runtime>>,
    coordinator: Mutex<Option<Arc<ShutdownCoordinator>>>,
    shutdown_handlers: Mutex<Vec<ShutdownHook>>,
    retranslating: AtomicBool,
    self_ref: Weak<WatchOrchestrator>,
}

impl WatchOrchestrator {
    /// Orchestrator sampling the host and reading `.git` from disk
    pub fn new(
        options: WatchOptions,
        pipeline: Arc<dyn RetranslationPipeline>,
        feedback: Arc<dyn Feedback>,
    ) -> Arc<Self> {
        Self::with_sources(
            options,
            pipeline,
            feedback,
            Box::new(HostSampler::new()),
            Arc::new(FsGitProbe),
        )
    }

    pub fn with_sources(
        options: WatchOptions,
        pipeline: Arc<dyn RetranslationPipeline>,
        feedback: Arc<dyn Feedback>,
        metrics: Box<dyn MetricsSource>,
        probe: Arc<dyn VcsProbe>,
    ) -> Arc<Self> {
        let root = options.root.canonicalize().unwrap_or_else(|_| options.root.clone());
        let defaults = WatchConfiguration::default();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let debounce = DebounceController::new(defaults.debounce_strategy());
            debounce.set_handler(Arc::new(OrchestratorHandler(weak.clone())));

            let recovery = ErrorRecoveryManager::new(&defaults.resilience);
            recovery.set_context(Arc::new(ContextBridge(weak.clone())));

            let resources = ResourceManager::default();
            let gc_target = weak.clone();
            resources.register_gc_hook(move || {
                gc_target
                    .upgrade()
                    .map(|this| this.optimizer.trim_caches())
                    .unwrap_or(0)
            });

            Self {
                optimizer: PerformanceOptimizer::new(root.clone(), OptimizerConfig::default()),
                root,
                options,
                pipeline,
                feedback,
                probe,
                debounce,
                recovery,
                degradation: DegradationManager::new(&defaults.resilience),
                resources,
                monitor: Arc::new(PerformanceMonitor::new(metrics, PerformanceThresholds::default())),
                state: Mutex::new(WatchState {
                    phase: WatchPhase::Idle,
                    config: None,
                    pending: PendingChangeSet::new(),
                    watched_files: Vec::new(),
                    watch_roots: Vec::new(),
                    started: None,
                    last_retranslation: None,
                    statistics: WatchStatistics::default(),
                    active_errors: Vec::new(),
                    retries: HashMap::new(),
                }),
                runtime: Mutex::new(None),
                coordinator: Mutex::new(None),
                shutdown_handlers: Mutex::new(Vec::new()),
                retranslating: AtomicBool::new(false),
                self_ref: weak.clone(),
            }
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Effective base configuration once started
    pub fn config(&self) -> Option<WatchConfiguration> {
        self.state.lock().config.clone()
    }

    fn phase(&self) -> WatchPhase {
        self.state.lock().phase
    }

    /// Load configuration, resolve the watch set and begin watching
    pub async fn start(self: &Arc<Self>) -> Result<(), WatchError> {
        {
            let mut state = self.state.lock();
            match state.phase {
                WatchPhase::Idle => state.phase = WatchPhase::Starting,
                WatchPhase::Stopped => {
                    return Err(WatchError::configuration("Watch manager has been stopped").unrecoverable())
                }
                WatchPhase::Starting | WatchPhase::Running => {
                    return Err(WatchError::configuration("Watch manager is already running").unrecoverable())
                }
            }
        }

        match self.boot().await {
            Ok(()) => {
                let watched = self.state.lock().watched_files.len();
                info!("Watch manager started, {} files in the watch set", watched);
                Ok(())
            }
            Err(mut error) => {
                error.message = format!("Failed to start watch manager: {}", error.message);
                let error = error.unrecoverable();
                {
                    let mut state = self.state.lock();
                    state.phase = WatchPhase::Idle;
                    state.statistics.error_count += 1;
                }
                if let Some(runtime) = self.runtime.lock().take() {
                    runtime.abort();
                }
                self.feedback.error(&error);
                Err(error)
            }
        }
    }

    async fn boot(self: &Arc<Self>) -> Result<(), WatchError> {
        let loaded = load_configuration(self.options.config_path.as_deref(), &self.options.overrides)
            .map_err(|e| WatchError::configuration(e.to_string()))?;
        let config = loaded.config;
        self.state.lock().config = Some(config.clone());
        self.apply_configuration(&config);

        let resolver = PatternResolver::new(&self.root);
        let prepared = resolver.prepare_patterns(&config.patterns, &self.options.locales);
        let filter = WatchFilter::new(&self.root, &prepared.include, &prepared.exclude);

        let files = if prepared.include.is_empty() {
            Vec::new()
        } else {
            let this = Arc::clone(self);
            let include = prepared.include.clone();
            let resolved = tokio::task::spawn_blocking(move || this.optimizer.resolve_watch_patterns(&include))
                .await
                .map_err(|e| WatchError::file_system(format!("Pattern resolution failed: {e}")))?;
            resolved.into_iter().filter(|f| filter.matches(f)).collect()
        };
        let roots = watch_roots(&self.root, &files);
        debug!("Watching {} directories for {} files", roots.len(), files.len());

        let (mut source, changes) = NotifySource::new(filter.clone())?;
        for dir in &roots {
            source.watch(dir)?;
        }

        let (git, batches) = GitAwareness::new(config.git.clone(), &self.root, self.probe.clone());
        let weak = self.self_ref.clone();
        let source_task = spawn_source_loop(weak.clone(), changes);
        let tasks = vec![
            spawn_batch_loop(weak.clone(), batches),
            self.monitor.start(self.options.monitor_interval),
            spawn_monitor_loop(weak, self.monitor.subscribe()),
        ];
        *self.runtime.lock() = Some(Runtime {
            source,
            filter,
            git,
            source_task,
            tasks,
        });

        self.resources.set_watched_files(files.len());
        self.monitor.update_watched_files(files.len());

        let target: Weak<dyn Shutdownable> = self.self_ref.clone();
        let coordinator = Arc::new(ShutdownCoordinator::new(
            target,
            self.feedback.clone(),
            config.shutdown_timeout(),
        ));
        if self.options.install_signal_handlers {
            coordinator
                .install_signal_handlers()
                .map_err(|e| WatchError::file_system(format!("Failed to install signal handlers: {e}")))?;
        }
        let health_interval = Duration::from_millis(config.resilience.health_check_interval).max(MIN_HEALTH_INTERVAL);
        coordinator.start_health_monitoring(health_interval);
        *self.coordinator.lock() = Some(coordinator);

        let mut state = self.state.lock();
        state.watched_files = files;
        state.watch_roots = roots;
        state.started = Some(Instant::now());
        state.phase = WatchPhase::Running;
        Ok(())
    }

    /// Stop watching and release every component; idempotent
    pub async fn stop(&self) -> Result<(), WatchError> {
        {
            let mut state = self.state.lock();
            if state.phase != WatchPhase::Running {
                debug!("Stop requested while {:?}", state.phase);
                return Ok(());
            }
            state.phase = WatchPhase::Stopped;
            state.retries.clear();
        }
        info!("Stopping watch manager...");

        self.debounce.cancel_pending();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.git.destroy();
            runtime.abort();
        }
        if let Some(coordinator) = self.coordinator.lock().as_ref() {
            coordinator.stop_health_monitoring();
        }
        self.resources.shutdown();
        self.optimizer.destroy();

        let handlers: Vec<ShutdownHook> = std::mem::take(&mut *self.shutdown_handlers.lock());
        for handler in handlers {
            if let Err(e) = handler().await {
                warn!("Shutdown handler failed: {:#}", e);
            }
        }
        info!("Watch manager stopped");
        Ok(())
    }

    /// Block until a signal-driven (or explicit) graceful shutdown finishes
    pub async fn run_until_shutdown(&self) -> ShutdownOutcome {
        let coordinator = self.coordinator.lock().clone();
        match coordinator {
            Some(coordinator) => coordinator.wait().await,
            None => ShutdownOutcome::Failed("Watch manager is not running".to_string()),
        }
    }

    pub fn shutdown_coordinator(&self) -> Option<Arc<ShutdownCoordinator>> {
        self.coordinator.lock().clone()
    }

    /// Run `handler` when the orchestrator stops
    pub fn add_shutdown_handler<F, Fut>(&self, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shutdown_handlers.lock().push(Box::new(move || Box::pin(handler())));
    }

    /// Entry point for one raw change
    pub async fn handle_change(&self, event: FileChangeEvent) {
        let git = match self.runtime.lock().as_ref() {
            Some(runtime) => runtime.git.clone(),
            None => {
                debug!("Dropping change to {} while not running", event.path.display());
                return;
            }
        };

        self.state.lock().statistics.total_changes += 1;
        self.monitor.record_file_operation();
        self.feedback.file_changed(&event);

        let path = event.path.clone();
        if let Err(error) = git.process_file_change(event) {
            let mut context = ErrorContext::new();
            context.insert("operation".to_string(), "git_detection".to_string());
            context.insert("path".to_string(), path.display().to_string());
            self.handle_error(error, context).await;
        }
    }

    fn handle_batch(&self, batch: FileChangeBatch) {
        if self.phase() != WatchPhase::Running || batch.is_empty() {
            return;
        }
        if let Some(operation) = &batch.git_operation {
            info!(
                "Git {} touched {} file(s), batching as one change set",
                operation.operation,
                batch.len()
            );
        }

        let changes = self.optimizer.optimize_file_change_detection(batch.changes);
        if changes.is_empty() {
            debug!("Batch {} filtered to nothing", batch.id);
            return;
        }
        self.state.lock().pending.extend(changes.iter().cloned());
        self.debounce.schedule_retranslation(changes);
    }

    /// Run the pipeline for `changes` unless another run is in flight
    ///
    /// A busy orchestrator hands the changes back to the debounce controller.
    pub async fn retranslate(&self, changes: Vec<FileChangeEvent>) -> anyhow::Result<()> {
        match self.run_changes(changes).await {
            RunOutcome::Failed => Err(anyhow::anyhow!("Retranslation failed")),
            _ => Ok(()),
        }
    }

    async fn run_changes(&self, changes: Vec<FileChangeEvent>) -> RunOutcome {
        if changes.is_empty() || self.phase() != WatchPhase::Running {
            return RunOutcome::Skipped;
        }
        if self
            .retranslating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Retranslation in progress, re-queueing {} change(s)", changes.len());
            self.debounce.schedule_retranslation(changes);
            return RunOutcome::Requeued;
        }
        let _guard = RetranslationGuard(&self.retranslating);

        let files: Vec<PathBuf> = changes.iter().map(|c| c.path.clone()).collect();
        let ctx = RunContext::new(self.root.clone(), files);
        let result = run_retranslation(self.pipeline.as_ref(), &self.resources, self.feedback.as_ref(), &ctx).await;
        self.record_retranslation(&ctx, &result);

        if result.success {
            return RunOutcome::Completed;
        }

        let error = result
            .errors
            .first()
            .cloned()
            .unwrap_or_else(|| WatchError::translation("Retranslation failed"));
        let mut context = ErrorContext::new();
        context.insert("operation".to_string(), "retranslation".to_string());
        context.insert("run".to_string(), ctx.run_id.to_string());
        context.insert("changes".to_string(), changes.len().to_string());
        self.handle_error_with(error, context, RetryPayload::Retranslation(changes)).await;
        RunOutcome::Failed
    }

    fn record_retranslation(&self, ctx: &RunContext, result: &RetranslationResult) {
        let metrics = {
            let mut state = self.state.lock();
            let stats = &mut state.statistics;
            stats.retranslation_count += 1;
            if !result.success {
                stats.failed_retranslations += 1;
            }
            let n = stats.retranslation_count as f64;
            let ms = result.duration.as_secs_f64() * 1000.0;
            stats.average_retranslation_ms = (stats.average_retranslation_ms * (n - 1.0) + ms) / n;
            state.last_retranslation = Some(now_ms());

            // Changes that arrived during the run stay pending
            let remaining: Vec<FileChangeEvent> = state
                .pending
                .drain()
                .into_iter()
                .filter(|e| !ctx.changed_files.contains(&e.path) || e.timestamp > ctx.started_at)
                .collect();
            state.pending.extend(remaining);

            let minutes = state
                .started
                .map(|s| s.elapsed().as_secs_f64() / 60.0)
                .unwrap_or(0.0)
                .max(1.0 / 60.0);
            let stats = &state.statistics;
            WatchMetrics {
                total_changes: stats.total_changes,
                changes_per_minute: stats.total_changes as f64 / minutes,
                retranslation_count: stats.retranslation_count,
                average_retranslation_ms: stats.average_retranslation_ms,
                error_rate: stats.failed_retranslations as f64 / stats.retranslation_count as f64,
            }
        };
        self.monitor.update_watch_metrics(metrics);
    }

    /// Route `error` through recovery, then degradation when unrecovered
    pub async fn handle_error(&self, error: WatchError, context: ErrorContext) -> RecoveryResult {
        self.handle_error_with(error, context, RetryPayload::Probe).await
    }

    async fn handle_error_with(&self, error: WatchError, context: ErrorContext, payload: RetryPayload) -> RecoveryResult {
        self.state.lock().statistics.error_count += 1;

        let result = self.recovery.handle_error(&error, context.clone()).await;
        if result.success {
            debug!("{}", result.message);
            return result;
        }

        let classified = RecoverableError::classify(&error, context);
        let signature = classified.signature();
        {
            let mut state = self.state.lock();
            state.active_errors.push(classified);
            if state.active_errors.len() > MAX_ACTIVE_ERRORS {
                state.active_errors.remove(0);
            }
        }
        self.feedback.error(&error);
        self.evaluate_system_degradation();

        match (result.should_retry, result.next_retry_delay) {
            (true, Some(delay)) => self.schedule_retry(signature, error, payload, delay),
            _ => warn!("Giving up on error: {}", result.message),
        }
        result
    }

    fn schedule_retry(&self, signature: String, error: WatchError, payload: RetryPayload, delay: Duration) {
        let mut state = self.state.lock();
        if state.phase != WatchPhase::Running {
            return;
        }
        debug!("Retrying {} in {:?}", signature, delay);
        let weak = self.self_ref.clone();
        let key = signature.clone();
        let retry = state.retries.entry(signature).or_default();
        if let RetryPayload::Retranslation(changes) = payload {
            retry.changes.extend(changes);
        }
        retry.task.schedule(delay, move |generation| async move {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let payload = {
                let mut state = this.state.lock();
                match state.retries.get_mut(&key) {
                    Some(retry) => {
                        if !retry.task.claim(generation) {
                            None
                        } else if retry.changes.is_empty() {
                            Some(RetryPayload::Probe)
                        } else {
                            Some(RetryPayload::Retranslation(retry.changes.drain()))
                        }
                    }
                    None => None,
                }
            };
            if let Some(payload) = payload {
                this.run_retry(&key, &error, payload).await;
            }
        });
    }

    async fn run_retry(&self, signature: &str, error: &WatchError, payload: RetryPayload) {
        let recovered = match payload {
            RetryPayload::Retranslation(changes) => self.run_changes(changes).await == RunOutcome::Completed,
            RetryPayload::Probe => match &error.path {
                Some(path) => tokio::fs::try_exists(self.root.join(path)).await.unwrap_or(false),
                None => true,
            },
        };
        if !recovered {
            return;
        }

        self.state
            .lock()
            .active_errors
            .retain(|e| e.signature() != signature);
        self.recovery.mark_recovered(error);
        info!("Recovered from error: {}", error.message);
    }

    /// Re-check error counts and host metrics against the degradation ladder
    pub fn evaluate_system_degradation(&self) {
        let metrics = self.monitor.current().map(|s| s.system).unwrap_or_default();
        let (errors, base) = {
            let state = self.state.lock();
            (state.active_errors.clone(), state.config.clone())
        };
        let Some(base) = base else {
            return;
        };

        let decision = self.degradation.evaluate_degradation(&errors, &metrics);
        if !decision.should_degrade {
            return;
        }
        let reason = decision
            .reason
            .unwrap_or_else(|| format!("Moving to {} mode", decision.target_level));
        let degraded = self
            .degradation
            .apply_degradation(decision.target_level, &base, &reason, decision.trigger);
        self.apply_effective(&degraded.config, degraded.limits);
    }

    /// Swap debounce and feedback settings without restarting
    ///
    /// While degraded the new configuration is tightened for the current
    /// level before it takes effect.
    pub fn update_configuration(&self, config: WatchConfiguration) -> Result<Vec<String>, WatchError> {
        let warnings = config
            .ensure_valid()
            .map_err(|e| WatchError::configuration(e.to_string()))?;
        self.state.lock().config = Some(config.clone());
        self.apply_configuration(&config);
        info!("Watch configuration updated");
        Ok(warnings)
    }

    fn apply_configuration(&self, config: &WatchConfiguration) {
        let level = self.degradation.current_level();
        if level == DegradationLevel::Normal {
            self.apply_effective(config, ResourceLimits::for_level(level));
        } else {
            let degraded = degrade_configuration(config, level);
            self.apply_effective(&degraded.config, degraded.limits);
        }
    }

    fn apply_effective(&self, config: &WatchConfiguration, limits: ResourceLimits) {
        self.feedback.update_settings(FeedbackSettings::from(&config.monitoring));
        self.debounce.update_strategy(config.debounce_strategy());
        self.recovery.update_circuit_breaker(&config.resilience);
        self.degradation
            .set_safety_margin(config.resilience.degradation_safety_margin);

        let current = self.resources.limits();
        self.resources.update_resource_limits(AdmissionLimits {
            max_concurrent_operations: limits.max_concurrent_operations,
            max_watched_files: limits.max_watched_files,
            batch_size: config.performance.batch_size,
            rate_limit_delay: Duration::from_millis(config.performance.rate_limit_delay),
            ..current
        });

        if let Some(runtime) = self.runtime.lock().as_ref() {
            runtime.git.update_config(config.git.clone());
        }
        if let Some(coordinator) = self.coordinator.lock().as_ref() {
            coordinator.set_shutdown_timeout(config.shutdown_timeout());
        }
    }

    /// Leave degraded mode and drop every tracked error
    pub fn reset_to_normal_operation(&self) {
        self.degradation.reset_to_normal();
        self.recovery.clear_active_errors();
        let config = {
            let mut state = self.state.lock();
            state.active_errors.clear();
            state.config.clone()
        };
        if let Some(config) = config {
            self.apply_configuration(&config);
        }
        info!("Reset to normal operation");
    }

    pub fn is_feature_enabled(&self, flag: FeatureFlag) -> bool {
        self.degradation.is_feature_enabled(flag)
    }

    pub fn degradation_level(&self) -> DegradationLevel {
        self.degradation.current_level()
    }

    pub fn debounce_strategy(&self) -> relocale_core::DebounceStrategy {
        self.debounce.strategy()
    }

    /// Running with fewer than ten errors
    pub fn is_healthy(&self) -> bool {
        let state = self.state.lock();
        state.phase == WatchPhase::Running && state.statistics.error_count < UNHEALTHY_ERROR_COUNT
    }

    pub fn status(&self) -> WatchStatus {
        let state = self.state.lock();
        let mut pending = state.pending.paths();
        for path in self.debounce.pending_paths() {
            if !pending.contains(&path) {
                pending.push(path);
            }
        }
        WatchStatus {
            phase: state.phase,
            is_retranslating: self.retranslating.load(Ordering::Acquire),
            watched_files: state.watched_files.len(),
            watch_roots: state.watch_roots.clone(),
            pending_changes: pending,
            last_retranslation: state.last_retranslation,
            error_count: state.statistics.error_count,
            degradation_level: self.degradation.current_level(),
        }
    }

    pub fn statistics(&self) -> OrchestratorStatistics {
        let (watch, uptime) = {
            let state = self.state.lock();
            (
                state.statistics.clone(),
                state.started.map(|s| s.elapsed()).unwrap_or_default(),
            )
        };
        let git = self.runtime.lock().as_ref().map(|r| r.git.statistics());
        OrchestratorStatistics {
            watch,
            uptime_ms: uptime.as_millis() as u64,
            debounce: self.debounce.statistics(),
            git,
            optimizer: self.optimizer.statistics(),
            queue: self.resources.queue_statistics(),
            degradation_level: self.degradation.current_level(),
        }
    }

    pub fn performance_statistics(&self) -> PerformanceReport {
        PerformanceReport {
            monitor: self.monitor.summary(),
            resources: self.resources.resource_usage(),
            limits: self.resources.limits(),
            queue: self.resources.queue_statistics(),
            optimizer: self.optimizer.statistics(),
        }
    }

    pub fn error_recovery_statistics(&self) -> RecoveryReport {
        let degraded = self.degradation.degraded_configuration();
        RecoveryReport {
            recovery: self.recovery.error_statistics(),
            active_errors: self.state.lock().active_errors.len(),
            degradation: self.degradation.statistics(),
            health: self.degradation.health_status(),
            limits: self.degradation.resource_limits(),
            disabled_features: degraded.map(|d| d.disabled_features).unwrap_or_default(),
        }
    }

    fn on_monitor_event(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::Sample(snapshot) => {
                self.resources.update_resource_usage(&snapshot.system);
                if snapshot.system.memory_usage > GC_MEMORY_FRACTION {
                    let freed = self.resources.force_garbage_collection();
                    debug!("Memory at {:.0}%, freed {} cache entries", snapshot.system.memory_usage * 100.0, freed);
                }
            }
            MonitorEvent::Alert(alert) if alert.level == AlertLevel::Critical => {
                warn!("Critical performance alert: {}", alert.message);
                self.evaluate_system_degradation();
            }
            MonitorEvent::Alert(alert) => debug!("Performance alert: {}", alert.message),
        }
    }

    async fn recreate_watcher(&self) -> anyhow::Result<bool> {
        let (filter, roots) = {
            let runtime = self.runtime.lock();
            let Some(runtime) = runtime.as_ref() else {
                return Ok(false);
            };
            (runtime.filter.clone(), runtime.source.watched_paths().to_vec())
        };

        let (mut source, changes) = NotifySource::new(filter)?;
        for dir in &roots {
            source.watch(dir)?;
        }
        let task = spawn_source_loop(self.self_ref.clone(), changes);

        let mut runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_mut() else {
            task.abort();
            return Ok(false);
        };
        runtime.source = source;
        let previous = std::mem::replace(&mut runtime.source_task, task);
        previous.abort();
        info!("File watcher recreated for {} directories", roots.len());
        Ok(true)
    }

    async fn reload_configuration(&self) -> anyhow::Result<bool> {
        let loaded = load_configuration(self.options.config_path.as_deref(), &self.options.overrides)?;
        self.update_configuration(loaded.config)
            .map_err(|e| anyhow::anyhow!(e.message))?;
        Ok(true)
    }

    fn reset_pipeline(&self) -> bool {
        let mut state = self.state.lock();
        if !self.retranslating.load(Ordering::Acquire) {
            state.pending.clear();
        }
        // A reset alone does not redo the failed work; the retry does
        false
    }

    fn cleanup_resources(&self) -> bool {
        let freed = self.resources.force_garbage_collection();
        freed > 0
    }
}

impl Runtime {
    fn abort(self) {
        self.source_task.abort();
        for task in self.tasks {
            task.abort();
        }
    }
}

fn spawn_source_loop(weak: Weak<WatchOrchestrator>, mut changes: mpsc::UnboundedReceiver<SourceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = changes.recv().await {
            let Some(this) = weak.upgrade() else {
                break;
            };
            match event {
                SourceEvent::Change(change) => this.handle_change(change).await,
                SourceEvent::Error(error) => {
                    // Recovery may replace this loop, so it runs on its own task
                    tokio::spawn(async move {
                        let mut context = ErrorContext::new();
                        context.insert("operation".to_string(), "watch".to_string());
                        this.handle_error(error, context).await;
                    });
                }
            }
        }
    })
}

fn spawn_batch_loop(weak: Weak<WatchOrchestrator>, mut batches: mpsc::UnboundedReceiver<FileChangeBatch>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = batches.recv().await {
            let Some(this) = weak.upgrade() else {
                break;
            };
            this.handle_batch(batch);
        }
    })
}

fn spawn_monitor_loop(weak: Weak<WatchOrchestrator>, mut events: broadcast::Receiver<MonitorEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Monitor loop skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(this) = weak.upgrade() else {
                break;
            };
            this.on_monitor_event(event);
        }
    })
}

/// Debounce trigger that runs the orchestrator's pipeline
struct OrchestratorHandler(Weak<WatchOrchestrator>);

#[async_trait]
impl RetranslationHandler for OrchestratorHandler {
    async fn retranslate(&self, changes: Vec<FileChangeEvent>) -> anyhow::Result<()> {
        match self.0.upgrade() {
            Some(this) => this.retranslate(changes).await,
            None => Ok(()),
        }
    }
}

/// Recovery hooks acting on the orchestrator without owning it
struct ContextBridge(Weak<WatchOrchestrator>);

#[async_trait]
impl RecoveryContext for ContextBridge {
    async fn path_exists(&self, path: &Path) -> bool {
        let target = match self.0.upgrade() {
            Some(this) if path.is_relative() => this.root.join(path),
            _ => path.to_path_buf(),
        };
        tokio::fs::try_exists(target).await.unwrap_or(false)
    }

    async fn recreate_watcher(&self) -> anyhow::Result<bool> {
        match self.0.upgrade() {
            Some(this) => this.recreate_watcher().await,
            None => Ok(false),
        }
    }

    async fn reset_pipeline(&self) -> anyhow::Result<bool> {
        Ok(self.0.upgrade().is_some_and(|this| this.reset_pipeline()))
    }

    async fn reload_configuration(&self) -> anyhow::Result<bool> {
        match self.0.upgrade() {
            Some(this) => this.reload_configuration().await,
            None => Ok(false),
        }
    }

    async fn cleanup_resources(&self) -> anyhow::Result<bool> {
        Ok(self.0.upgrade().is_some_and(|this| this.cleanup_resources()))
    }
}

#[async_trait]
impl Shutdownable for WatchOrchestrator {
    async fn stop(&self) -> anyhow::Result<()> {
        WatchOrchestrator::stop(self)
            .await
            .map_err(|e| anyhow::anyhow!(e.message))
    }

    fn is_healthy(&self) -> bool {
        WatchOrchestrator::is_healthy(self)
    }

    fn final_status(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.watched_files.len(), state.statistics.error_count as usize)
    }

    fn statistics(&self) -> serde_json::Value {
        match serde_json::to_value(WatchOrchestrator::statistics(self)) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to serialize statistics: {}", e);
                serde_json::Value::Null
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::TranslationProgress;
    use crate::git::VcsState;
    use crate::monitor::SystemMetrics;
    use crate::pipeline::{ExecutionReport, Task, TaskOutcome};
    use relocale_core::{ChangeKind, GitConfig};
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakePipeline {
        runs: AtomicUsize,
        started: AtomicUsize,
        failures_left: AtomicUsize,
        failure: Mutex<String>,
        delay: Mutex<Duration>,
        files: Mutex<Vec<Vec<PathBuf>>>,
    }

    impl FakePipeline {
        fn failing(times: usize, message: &str) -> Self {
            let pipeline = Self::default();
            pipeline.failures_left.store(times, Ordering::SeqCst);
            *pipeline.failure.lock() = message.to_string();
            pipeline
        }
    }

    #[async_trait]
    impl RetranslationPipeline for FakePipeline {
        async fn plan(&self, ctx: &RunContext) -> anyhow::Result<Vec<Task>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.files.lock().push(ctx.changed_files.clone());
            Ok(vec![Task {
                id: "sync".into(),
                description: "sync locales".into(),
                files: ctx.changed_files.clone(),
            }])
        }

        async fn execute(&self, _: &RunContext, tasks: Vec<Task>) -> anyhow::Result<ExecutionReport> {
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let error = failed.then(|| self.failure.lock().clone());
            Ok(ExecutionReport {
                outcomes: tasks
                    .into_iter()
                    .map(|t| TaskOutcome {
                        task_id: t.id,
                        success: !failed,
                        error: error.clone(),
                    })
                    .collect(),
            })
        }
    }

    #[derive(Default)]
    struct CountingFeedback {
        errors: AtomicUsize,
        changes: AtomicUsize,
    }

    impl Feedback for CountingFeedback {
        fn file_changed(&self, _: &FileChangeEvent) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
        fn retranslation_started(&self, _: &[PathBuf]) {}
        fn progress(&self, _: &TranslationProgress) {}
        fn retranslation_complete(&self, _: &RetranslationResult) {}
        fn error(&self, _: &WatchError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn update_settings(&self, _: FeedbackSettings) {}
    }

    struct QuietHost;

    impl MetricsSource for QuietHost {
        fn sample(&mut self) -> SystemMetrics {
            SystemMetrics {
                memory_usage: 0.2,
                cpu_usage: 0.1,
                process_rss: 1 << 20,
                watched_files: 0,
            }
        }
    }

    struct NoVcs;

    impl VcsProbe for NoVcs {
        fn detect(&self, _: &Path, _: u64, _: u64) -> Result<Option<VcsState>, WatchError> {
            Ok(None)
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        pipeline: Arc<FakePipeline>,
        feedback: Arc<CountingFeedback>,
        orchestrator: Arc<WatchOrchestrator>,
    }

    fn fixture(pipeline: FakePipeline) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("locales")).unwrap();
        fs::write(root.join("locales/en.json"), "{}").unwrap();
        fs::write(root.join("locales/de.json"), "{}").unwrap();

        let mut options = WatchOptions::new(&root);
        options.install_signal_handlers = false;
        options.overrides.patterns.include = vec!["locales/**/*.json".to_string()];
        options.overrides.debounce.delay = Some(200);
        options.overrides.debounce.max_wait = Some(1000);
        options.overrides.git = Some(GitConfig {
            enabled: false,
            ..GitConfig::default()
        });

        let pipeline = Arc::new(pipeline);
        let feedback = Arc::new(CountingFeedback::default());
        let orchestrator = WatchOrchestrator::with_sources(
            options,
            pipeline.clone(),
            feedback.clone(),
            Box::new(QuietHost),
            Arc::new(NoVcs),
        );
        Fixture {
            _dir: dir,
            root,
            pipeline,
            feedback,
            orchestrator,
        }
    }

    fn change(path: &str) -> FileChangeEvent {
        FileChangeEvent::new(ChangeKind::Change, path)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_resolves_watch_set_and_rejects_second_start() {
        let fx = fixture(FakePipeline::default());
        assert!(!fx.orchestrator.is_healthy());

        fx.orchestrator.start().await.unwrap();
        let status = fx.orchestrator.status();
        assert_eq!(status.phase, WatchPhase::Running);
        assert_eq!(status.watched_files, 2);
        assert_eq!(status.watch_roots, vec![fx.root.join("locales")]);
        assert!(fx.orchestrator.is_healthy());
        assert_eq!(fx.orchestrator.debounce_strategy().delay, Duration::from_millis(200));

        let err = fx.orchestrator.start().await.unwrap_err();
        assert!(err.message.contains("already running"));

        fx.orchestrator.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_configuration_aborts_start() {
        let fx = fixture(FakePipeline::default());
        let config = fx.root.join("relocale.json");
        fs::write(&config, r#"{"watch": {"debounce": {"delay": 10}}}"#).unwrap();

        let mut options = fx.orchestrator.options.clone();
        options.config_path = Some(config);
        options.overrides.debounce.delay = None;
        let orchestrator = WatchOrchestrator::with_sources(
            options,
            fx.pipeline.clone(),
            fx.feedback.clone(),
            Box::new(QuietHost),
            Arc::new(NoVcs),
        );

        let err = orchestrator.start().await.unwrap_err();
        assert!(err.message.starts_with("Failed to start watch manager"));
        assert!(!err.recoverable);
        let status = orchestrator.status();
        assert_eq!(status.phase, WatchPhase::Idle);
        assert_eq!(status.error_count, 1);
        assert_eq!(fx.feedback.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_are_debounced_into_one_run() {
        let fx = fixture(FakePipeline::default());
        fx.orchestrator.start().await.unwrap();

        fx.orchestrator.handle_change(change("locales/en.json")).await;
        fx.orchestrator.handle_change(change("locales/de.json")).await;
        fx.orchestrator.handle_change(change("locales/en.json")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.orchestrator.status().pending_changes.len(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(fx.pipeline.runs.load(Ordering::SeqCst), 1);
        assert_eq!(fx.pipeline.files.lock()[0].len(), 2);
        let stats = fx.orchestrator.statistics();
        assert_eq!(stats.watch.total_changes, 3);
        assert_eq!(stats.watch.retranslation_count, 1);
        assert_eq!(fx.feedback.changes.load(Ordering::SeqCst), 3);

        let status = fx.orchestrator.status();
        assert!(status.pending_changes.is_empty());
        assert!(status.last_retranslation.is_some());
        assert!(!status.is_retranslating);

        fx.orchestrator.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_during_run_is_requeued() {
        let pipeline = FakePipeline::default();
        *pipeline.delay.lock() = Duration::from_secs(2);
        let fx = fixture(pipeline);
        fx.orchestrator.start().await.unwrap();

        let first = {
            let orchestrator = fx.orchestrator.clone();
            tokio::spawn(async move { orchestrator.retranslate(vec![change("locales/en.json")]).await })
        };
        while fx.pipeline.started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        fx.orchestrator.retranslate(vec![change("locales/de.json")]).await.unwrap();
        assert!(fx.orchestrator.status().is_retranslating);
        assert_eq!(fx.orchestrator.debounce.pending_paths(), vec![PathBuf::from("locales/de.json")]);

        first.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(fx.pipeline.runs.load(Ordering::SeqCst), 2);
        assert_eq!(fx.pipeline.files.lock()[1], vec![PathBuf::from("locales/de.json")]);

        fx.orchestrator.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_degrades_then_retry_recovers() {
        let fx = fixture(FakePipeline::failing(1, "authentication failed"));
        fx.orchestrator.start().await.unwrap();

        let outcome = fx.orchestrator.retranslate(vec![change("locales/en.json")]).await;
        assert!(outcome.is_err());

        let report = fx.orchestrator.error_recovery_statistics();
        assert_eq!(report.active_errors, 1);
        assert_eq!(fx.orchestrator.degradation_level(), DegradationLevel::Reduced);
        assert!(!fx.orchestrator.is_feature_enabled(FeatureFlag::Notifications));
        assert!(fx.orchestrator.is_feature_enabled(FeatureFlag::PatternExpansion));
        assert_eq!(fx.feedback.errors.load(Ordering::SeqCst), 1);

        // Critical translation errors back off for 10-11 s
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(fx.pipeline.runs.load(Ordering::SeqCst), 2);
        assert_eq!(fx.orchestrator.error_recovery_statistics().active_errors, 0);
        assert_eq!(fx.orchestrator.error_recovery_statistics().recovery.active_errors, 0);

        fx.orchestrator.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_retry_every_failed_change() {
        let fx = fixture(FakePipeline::failing(2, "authentication failed"));
        fx.orchestrator.start().await.unwrap();

        assert!(fx.orchestrator.retranslate(vec![change("locales/en.json")]).await.is_err());
        assert!(fx.orchestrator.retranslate(vec![change("locales/de.json")]).await.is_err());
        assert_eq!(fx.pipeline.runs.load(Ordering::SeqCst), 2);

        // Second attempt at the same signature backs off for 30-33 s
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(fx.pipeline.runs.load(Ordering::SeqCst), 3);
        assert_eq!(
            fx.pipeline.files.lock()[2],
            vec![PathBuf::from("locales/en.json"), PathBuf::from("locales/de.json")]
        );
        assert_eq!(fx.orchestrator.error_recovery_statistics().active_errors, 0);

        fx.orchestrator.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_to_normal_operation() {
        let fx = fixture(FakePipeline::failing(usize::MAX, "authentication failed"));
        fx.orchestrator.start().await.unwrap();
        let base_delay = fx.orchestrator.debounce_strategy().delay;

        let _ = fx.orchestrator.retranslate(vec![change("locales/en.json")]).await;
        assert_eq!(fx.orchestrator.degradation_level(), DegradationLevel::Reduced);
        assert!(fx.orchestrator.debounce_strategy().delay >= base_delay);

        fx.orchestrator.reset_to_normal_operation();
        assert_eq!(fx.orchestrator.degradation_level(), DegradationLevel::Normal);
        assert_eq!(fx.orchestrator.error_recovery_statistics().active_errors, 0);
        assert_eq!(fx.orchestrator.debounce_strategy().delay, base_delay);
        assert!(FeatureFlag::ALL.iter().all(|f| fx.orchestrator.is_feature_enabled(*f)));

        fx.orchestrator.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_configuration_hot_swaps_debounce() {
        let fx = fixture(FakePipeline::default());
        fx.orchestrator.start().await.unwrap();

        let mut config = fx.orchestrator.config().unwrap();
        config.debounce.delay = 2000;
        config.debounce.max_wait = Some(10_000);
        fx.orchestrator.update_configuration(config).unwrap();
        assert_eq!(fx.orchestrator.debounce_strategy().delay, Duration::from_secs(2));

        let mut invalid = fx.orchestrator.config().unwrap();
        invalid.debounce.delay = 10;
        assert!(fx.orchestrator.update_configuration(invalid).is_err());
        assert_eq!(fx.orchestrator.debounce_strategy().delay, Duration::from_secs(2));

        fx.orchestrator.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_count_drives_health() {
        let fx = fixture(FakePipeline::default());
        fx.orchestrator.start().await.unwrap();

        for i in 0..10 {
            let error = WatchError::file_system(format!("EBUSY {i}")).with_path(format!("locales/{i}.json"));
            fx.orchestrator.handle_error(error, ErrorContext::new()).await;
        }
        assert_eq!(fx.orchestrator.status().error_count, 10);
        assert!(!fx.orchestrator.is_healthy());
        assert!(!Shutdownable::is_healthy(fx.orchestrator.as_ref()));

        fx.orchestrator.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_runs_handlers_and_is_final() {
        let fx = fixture(FakePipeline::default());
        fx.orchestrator.start().await.unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        fx.orchestrator.add_shutdown_handler(move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        fx.orchestrator.handle_change(change("locales/en.json")).await;
        fx.orchestrator.stop().await.unwrap();
        fx.orchestrator.stop().await.unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(fx.orchestrator.status().phase, WatchPhase::Stopped);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.pipeline.runs.load(Ordering::SeqCst), 0);
        assert!(fx.orchestrator.start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown_stops_orchestrator() {
        let fx = fixture(FakePipeline::default());
        fx.orchestrator.start().await.unwrap();

        let coordinator = fx.orchestrator.shutdown_coordinator().unwrap();
        let waiter = {
            let orchestrator = fx.orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_until_shutdown().await })
        };
        assert_eq!(coordinator.graceful_shutdown("test").await, ShutdownOutcome::Completed);
        assert_eq!(waiter.await.unwrap(), ShutdownOutcome::Completed);
        assert_eq!(fx.orchestrator.status().phase, WatchPhase::Stopped);

        let stats = coordinator.status_report().statistics;
        assert_eq!(stats["watch"]["totalChanges"], 0);
    }
}
