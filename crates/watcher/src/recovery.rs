//! Error recovery
//!
//! Every runtime error is classified into a category and severity, tracked
//! per signature (`category:kind:path`) and answered with a retry
//! recommendation using exponential backoff with jitter. Registered recovery
//! actions get a chance to fix the underlying cause first.
//!
//! A rolling-window error counter acts as a circuit breaker: once it trips,
//! every error is refused until the window rolls over.

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use relocale_core::config::ResilienceConfig;
use relocale_core::{now_ms, ErrorKind, WatchError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NETWORK_KEYWORDS: &[&str] = &[
    "network",
    "connection",
    "timeout",
    "dns",
    "resolve",
    "unreachable",
    "refused",
    "reset",
    "socket",
];

const RESOURCE_KEYWORDS: &[&str] = &[
    "memory",
    "disk",
    "space",
    "quota",
    "limit",
    "capacity",
    "too many",
    "exhausted",
    "overflow",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    FileSystem,
    Translation,
    Configuration,
    Network,
    Resource,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        ErrorCategory::FileSystem,
        ErrorCategory::Translation,
        ErrorCategory::Configuration,
        ErrorCategory::Network,
        ErrorCategory::Resource,
    ];

    pub fn retry_policy(self) -> RetryPolicy {
        let (max_retries, backoff_multiplier) = match self {
            ErrorCategory::FileSystem => (5, 2.0),
            ErrorCategory::Translation => (3, 3.0),
            ErrorCategory::Configuration => (1, 1.0),
            ErrorCategory::Network => (7, 2.0),
            ErrorCategory::Resource => (2, 5.0),
        };
        RetryPolicy {
            max_retries,
            backoff_multiplier,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorCategory::FileSystem => "file_system",
            ErrorCategory::Translation => "translation",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Network => "network",
            ErrorCategory::Resource => "resource",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub const ALL: [ErrorSeverity; 4] = [
        ErrorSeverity::Low,
        ErrorSeverity::Medium,
        ErrorSeverity::High,
        ErrorSeverity::Critical,
    ];

    /// First-retry delay before the category multiplier applies
    pub fn base_delay(self) -> Duration {
        Duration::from_millis(match self {
            ErrorSeverity::Low => 1000,
            ErrorSeverity::Medium => 2000,
            ErrorSeverity::High => 5000,
            ErrorSeverity::Critical => 10_000,
        })
    }
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
}

pub type ErrorContext = BTreeMap<String, String>;

/// A classified error with its retry bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoverableError {
    pub error: WatchError,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retry_count: u32,
    /// Unix ms of the last retry recommendation
    pub last_retry_at: Option<u64>,
    /// Unix ms of the last time this signature was reported
    pub last_seen: u64,
    pub context: ErrorContext,
}

impl RecoverableError {
    /// Classify `error` without touching any manager state
    pub fn classify(error: &WatchError, context: ErrorContext) -> Self {
        let lower = error.message.to_lowercase();
        let (mut category, mut severity) = match error.kind {
            ErrorKind::FileSystem => (ErrorCategory::FileSystem, file_system_severity(&lower)),
            ErrorKind::Translation => (ErrorCategory::Translation, translation_severity(&lower)),
            ErrorKind::Configuration => (ErrorCategory::Configuration, ErrorSeverity::High),
        };

        if contains_any(&lower, NETWORK_KEYWORDS) {
            category = ErrorCategory::Network;
            severity = ErrorSeverity::Medium;
        }
        if contains_any(&lower, RESOURCE_KEYWORDS) {
            category = ErrorCategory::Resource;
            severity = severity.max(ErrorSeverity::High);
        }

        Self {
            error: error.clone(),
            category,
            severity,
            retry_count: 0,
            last_retry_at: None,
            last_seen: now_ms(),
            context,
        }
    }

    pub fn signature(&self) -> String {
        let path = self
            .error
            .path
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "global".to_string());
        format!("{}:{}:{}", self.category, self.error.kind, path)
    }

    pub fn message(&self) -> &str {
        &self.error.message
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn file_system_severity(lower: &str) -> ErrorSeverity {
    if lower.contains("permission denied") || lower.contains("access denied") {
        ErrorSeverity::High
    } else if lower.contains("no such file") || lower.contains("not found") {
        ErrorSeverity::Low
    } else if lower.contains("device not ready") || lower.contains("network") {
        ErrorSeverity::Medium
    } else if lower.contains("disk full") || lower.contains("no space") {
        ErrorSeverity::Critical
    } else {
        ErrorSeverity::Medium
    }
}

fn translation_severity(lower: &str) -> ErrorSeverity {
    if lower.contains("api") || lower.contains("network") {
        ErrorSeverity::Medium
    } else if lower.contains("rate limit") || lower.contains("quota") {
        ErrorSeverity::High
    } else if lower.contains("authentication") || lower.contains("unauthorized") {
        ErrorSeverity::Critical
    } else {
        ErrorSeverity::Low
    }
}

/// Outcome of [`ErrorRecoveryManager::handle_error`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub message: String,
    pub should_retry: bool,
    pub next_retry_delay: Option<Duration>,
}

impl RecoveryResult {
    fn refused(message: String) -> Self {
        Self {
            success: false,
            message,
            should_retry: false,
            next_retry_delay: None,
        }
    }
}

/// Hooks recovery actions use to act on the running system
///
/// Each hook returns `Ok(true)` when it fixed the cause, `Ok(false)` when it
/// had nothing to do.
#[async_trait]
pub trait RecoveryContext: Send + Sync {
    async fn path_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn recreate_watcher(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn reset_pipeline(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn reload_configuration(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn check_connectivity(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn cleanup_resources(&self) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Context used until the owner installs its own
pub struct NoopRecoveryContext;

impl RecoveryContext for NoopRecoveryContext {}

type Condition = Arc<dyn Fn(&RecoverableError) -> bool + Send + Sync>;
type ActionFn =
    Arc<dyn Fn(RecoverableError, Arc<dyn RecoveryContext>) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Entry of the recovery action table
#[derive(Clone)]
pub struct RecoveryAction {
    pub name: String,
    pub category: ErrorCategory,
    pub description: String,
    condition: Condition,
    run: ActionFn,
}

impl RecoveryAction {
    pub fn new<C, F, Fut>(
        name: impl Into<String>,
        category: ErrorCategory,
        description: impl Into<String>,
        condition: C,
        run: F,
    ) -> Self
    where
        C: Fn(&RecoverableError) -> bool + Send + Sync + 'static,
        F: Fn(RecoverableError, Arc<dyn RecoveryContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self {
            name: name.into(),
            category,
            description: description.into(),
            condition: Arc::new(condition),
            run: Arc::new(move |err, ctx| Box::pin(run(err, ctx))),
        }
    }

    pub fn applies_to(&self, error: &RecoverableError) -> bool {
        self.category == error.category && (self.condition)(error)
    }
}

impl std::fmt::Debug for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryAction")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("description", &self.description)
            .finish()
    }
}

fn message_has(error: &RecoverableError, needles: &[&str]) -> bool {
    contains_any(&error.message().to_lowercase(), needles)
}

fn wait_and_retry(category: ErrorCategory) -> RecoveryAction {
    RecoveryAction::new(
        "wait_and_retry",
        category,
        "Wait and retry the operation",
        |_| true,
        |_, _| async { Ok(false) },
    )
}

/// The built-in action table, in evaluation order
pub fn default_actions() -> Vec<RecoveryAction> {
    vec![
        wait_and_retry(ErrorCategory::FileSystem),
        RecoveryAction::new(
            "check_file_exists",
            ErrorCategory::FileSystem,
            "Verify file existence before retry",
            |e| message_has(e, &["no such file", "not found"]),
            |e, ctx| async move {
                match e.error.path.as_deref() {
                    Some(path) => Ok(ctx.path_exists(path).await),
                    None => Ok(false),
                }
            },
        ),
        RecoveryAction::new(
            "recreate_watcher",
            ErrorCategory::FileSystem,
            "Recreate file watcher instance",
            |e| message_has(e, &["watcher", "watch"]),
            |_, ctx| async move { ctx.recreate_watcher().await },
        ),
        wait_and_retry(ErrorCategory::Translation),
        RecoveryAction::new(
            "reset_translation_context",
            ErrorCategory::Translation,
            "Reset translation context and state",
            |e| message_has(e, &["translation", "context"]),
            |_, ctx| async move { ctx.reset_pipeline().await },
        ),
        RecoveryAction::new(
            "reload_configuration",
            ErrorCategory::Configuration,
            "Reload configuration from disk",
            |e| message_has(e, &["config"]),
            |_, ctx| async move { ctx.reload_configuration().await },
        ),
        wait_and_retry(ErrorCategory::Network),
        RecoveryAction::new(
            "check_network_connectivity",
            ErrorCategory::Network,
            "Verify network connectivity",
            |e| message_has(e, &["network", "connection"]),
            |_, ctx| async move { ctx.check_connectivity().await },
        ),
        RecoveryAction::new(
            "cleanup_resources",
            ErrorCategory::Resource,
            "Clean up system resources",
            |e| message_has(e, &["memory", "resource"]),
            |_, ctx| async move { ctx.cleanup_resources().await },
        ),
        wait_and_retry(ErrorCategory::Resource),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorStatistics {
    pub active_errors: usize,
    pub total_errors: u64,
    /// Errors counted toward the circuit breaker in the current window
    pub window_errors: u32,
    pub errors_by_category: BTreeMap<ErrorCategory, usize>,
    pub errors_by_severity: BTreeMap<ErrorSeverity, usize>,
}

struct RecoveryState {
    active: HashMap<String, RecoverableError>,
    total_errors: u64,
    window_errors: u32,
    window_start: Instant,
    breaker_threshold: u32,
    breaker_window: Duration,
}

impl RecoveryState {
    fn breaker_tripped(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) > self.breaker_window {
            self.window_errors = 1;
            self.window_start = now;
            return false;
        }
        self.window_errors > self.breaker_threshold
    }
}

pub struct ErrorRecoveryManager {
    state: Mutex<RecoveryState>,
    actions: RwLock<Vec<RecoveryAction>>,
    context: RwLock<Arc<dyn RecoveryContext>>,
}

impl ErrorRecoveryManager {
    pub fn new(resilience: &ResilienceConfig) -> Self {
        Self {
            state: Mutex::new(RecoveryState {
                active: HashMap::new(),
                total_errors: 0,
                window_errors: 0,
                window_start: Instant::now(),
                breaker_threshold: resilience.circuit_breaker_threshold,
                breaker_window: Duration::from_millis(resilience.circuit_breaker_window),
            }),
            actions: RwLock::new(default_actions()),
            context: RwLock::new(Arc::new(NoopRecoveryContext)),
        }
    }

    pub fn set_context(&self, context: Arc<dyn RecoveryContext>) {
        *self.context.write() = context;
    }

    /// Append an action; it runs after the built-in ones of its category
    pub fn register_action(&self, action: RecoveryAction) {
        debug!("Registered recovery action {} for {}", action.name, action.category);
        self.actions.write().push(action);
    }

    pub fn update_circuit_breaker(&self, resilience: &ResilienceConfig) {
        let mut state = self.state.lock();
        state.breaker_threshold = resilience.circuit_breaker_threshold;
        state.breaker_window = Duration::from_millis(resilience.circuit_breaker_window);
    }

    /// Classify, count and try to recover from `error`
    ///
    /// A signature gets `max_retries` retry recommendations; the next report
    /// of the same signature is refused with "Maximum retries".
    pub async fn handle_error(&self, error: &WatchError, context: ErrorContext) -> RecoveryResult {
        let mut classified = RecoverableError::classify(error, context);
        let key = classified.signature();
        let policy = classified.category.retry_policy();

        let (delay, applicable) = {
            let mut state = self.state.lock();
            if let Some(existing) = state.active.get(&key) {
                classified.retry_count = existing.retry_count;
                classified.last_retry_at = existing.last_retry_at;
            }
            state.active.insert(key.clone(), classified.clone());
            state.total_errors += 1;
            state.window_errors += 1;

            if state.breaker_tripped() {
                warn!("Circuit breaker open: {} errors in the current window", state.window_errors);
                return RecoveryResult::refused("Too many errors globally, entering backoff mode".to_string());
            }

            if !error.recoverable {
                return RecoveryResult::refused(format!("Error is not recoverable: {}", error.message));
            }

            if classified.retry_count >= policy.max_retries {
                return RecoveryResult::refused(format!(
                    "Maximum retries ({}) exceeded for error: {}",
                    policy.max_retries, error.message
                ));
            }

            classified.retry_count += 1;
            classified.last_retry_at = Some(now_ms());
            state.active.insert(key.clone(), classified.clone());

            let delay = backoff_delay(classified.severity, policy, classified.retry_count);
            let applicable: Vec<RecoveryAction> = self
                .actions
                .read()
                .iter()
                .filter(|a| a.applies_to(&classified))
                .cloned()
                .collect();
            (delay, applicable)
        };

        let context = self.context.read().clone();
        let mut any_failed = false;
        for action in &applicable {
            match (action.run)(classified.clone(), context.clone()).await {
                Ok(true) => {
                    self.state.lock().active.remove(&key);
                    info!("Recovered from {} error using {}", classified.category, action.name);
                    return RecoveryResult {
                        success: true,
                        message: format!("Recovered using action: {}", action.description),
                        should_retry: false,
                        next_retry_delay: None,
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Recovery action failed: {}: {:#}", action.description, e);
                    any_failed = true;
                }
            }
        }

        let message = if applicable.is_empty() {
            format!("No applicable recovery actions for error: {}", error.message)
        } else if any_failed {
            format!("All recovery actions failed for error: {}", error.message)
        } else {
            format!(
                "Retry {}/{} in {} ms for error: {}",
                classified.retry_count,
                policy.max_retries,
                delay.as_millis(),
                error.message
            )
        };

        RecoveryResult {
            success: false,
            message,
            should_retry: true,
            next_retry_delay: Some(delay),
        }
    }

    /// Drop the signature of `error` after a successful retry
    pub fn mark_recovered(&self, error: &WatchError) -> bool {
        let key = RecoverableError::classify(error, ErrorContext::new()).signature();
        self.state.lock().active.remove(&key).is_some()
    }

    pub fn active_errors(&self) -> Vec<RecoverableError> {
        self.state.lock().active.values().cloned().collect()
    }

    pub fn clear_active_errors(&self) {
        self.state.lock().active.clear();
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        let state = self.state.lock();
        let mut by_category: BTreeMap<ErrorCategory, usize> =
            ErrorCategory::ALL.iter().map(|c| (*c, 0)).collect();
        let mut by_severity: BTreeMap<ErrorSeverity, usize> =
            ErrorSeverity::ALL.iter().map(|s| (*s, 0)).collect();

        for error in state.active.values() {
            *by_category.entry(error.category).or_default() += 1;
            *by_severity.entry(error.severity).or_default() += 1;
        }

        ErrorStatistics {
            active_errors: state.active.len(),
            total_errors: state.total_errors,
            window_errors: state.window_errors,
            errors_by_category: by_category,
            errors_by_severity: by_severity,
        }
    }

    /// Fewer than five active errors and none critical
    pub fn is_healthy(&self) -> bool {
        let stats = self.error_statistics();
        stats.active_errors < 5
            && stats
                .errors_by_severity
                .get(&ErrorSeverity::Critical)
                .copied()
                .unwrap_or(0)
                == 0
    }
}

/// `base(severity) * multiplier^(attempt-1)`, plus up to 10% jitter
pub fn backoff_delay(severity: ErrorSeverity, policy: RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let base = severity.base_delay().as_millis() as f64;
    let backoff = base * policy.backoff_multiplier.powi(exponent);
    let jitter = backoff * rand::thread_rng().gen_range(0.0..=0.1);
    Duration::from_millis((backoff + jitter).floor() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn manager() -> ErrorRecoveryManager {
        ErrorRecoveryManager::new(&ResilienceConfig::default())
    }

    fn within_jitter(actual: Duration, expected_ms: u64) -> bool {
        let ms = actual.as_millis() as u64;
        ms >= expected_ms && ms <= expected_ms + expected_ms / 10
    }

    #[test]
    fn test_classification() {
        let cases = [
            (WatchError::file_system("ENOENT: no such file or directory"), ErrorCategory::FileSystem, ErrorSeverity::Low),
            (WatchError::file_system("Permission denied accessing file"), ErrorCategory::FileSystem, ErrorSeverity::High),
            (WatchError::file_system("CRITICAL: Disk full, cannot continue"), ErrorCategory::Resource, ErrorSeverity::Critical),
            (WatchError::translation("Network timeout occurred"), ErrorCategory::Network, ErrorSeverity::Medium),
            (WatchError::translation("Unauthorized"), ErrorCategory::Translation, ErrorSeverity::Critical),
            (WatchError::translation("bad plural form"), ErrorCategory::Translation, ErrorSeverity::Low),
            (WatchError::configuration("Invalid configuration file"), ErrorCategory::Configuration, ErrorSeverity::High),
            (WatchError::file_system("Too many open files"), ErrorCategory::Resource, ErrorSeverity::High),
            (WatchError::file_system("Connection refused"), ErrorCategory::Network, ErrorSeverity::Medium),
        ];

        for (error, category, severity) in cases {
            let classified = RecoverableError::classify(&error, ErrorContext::new());
            assert_eq!(classified.category, category, "{}", error.message);
            assert_eq!(classified.severity, severity, "{}", error.message);
        }
    }

    #[test]
    fn test_signature_uses_path_or_global() {
        let global = RecoverableError::classify(&WatchError::file_system("boom"), ErrorContext::new());
        assert_eq!(global.signature(), "file_system:file_system:global");

        let scoped = RecoverableError::classify(
            &WatchError::file_system("boom").with_path("locales/en.json"),
            ErrorContext::new(),
        );
        assert_eq!(scoped.signature(), "file_system:file_system:locales/en.json");
    }

    #[tokio::test]
    async fn test_backoff_grows_until_max_retries() {
        let manager = manager();
        let error = WatchError::file_system("Persistent file access error");

        let mut previous = Duration::ZERO;
        for attempt in 1..=5u32 {
            let result = manager.handle_error(&error, ErrorContext::new()).await;
            assert!(!result.success);
            assert!(result.should_retry, "attempt {attempt}");
            let delay = result.next_retry_delay.unwrap();
            assert!(within_jitter(delay, 2000 * 2u64.pow(attempt - 1)), "attempt {attempt}: {delay:?}");
            assert!(delay >= previous);
            previous = delay;
        }

        let last = manager.handle_error(&error, ErrorContext::new()).await;
        assert!(!last.should_retry);
        assert!(last.message.contains("Maximum retries (5)"));
        assert_eq!(manager.error_statistics().active_errors, 1);
    }

    #[tokio::test]
    async fn test_configuration_gets_one_retry() {
        let manager = manager();
        let error = WatchError::configuration("Invalid configuration file");

        let first = manager.handle_error(&error, ErrorContext::new()).await;
        assert!(first.should_retry);
        assert!(within_jitter(first.next_retry_delay.unwrap(), 5000));

        let second = manager.handle_error(&error, ErrorContext::new()).await;
        assert!(!second.should_retry);
        assert!(second.message.contains("Maximum retries (1)"));
    }

    #[tokio::test]
    async fn test_unrecoverable_error_is_not_retried() {
        let manager = manager();
        let result = manager
            .handle_error(&WatchError::file_system("gone").unrecoverable(), ErrorContext::new())
            .await;
        assert!(!result.should_retry);
        assert_eq!(manager.error_statistics().active_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_trips_and_resets() {
        let manager = manager();
        for i in 0..10 {
            let result = manager
                .handle_error(&WatchError::file_system(format!("Error {i}")).with_path(format!("f{i}")), ErrorContext::new())
                .await;
            assert!(result.should_retry);
        }

        let tripped = manager.handle_error(&WatchError::file_system("Final error"), ErrorContext::new()).await;
        assert!(!tripped.success);
        assert!(!tripped.should_retry);
        assert!(tripped.message.contains("Too many errors globally"));

        tokio::time::advance(Duration::from_secs(301)).await;
        let after = manager.handle_error(&WatchError::file_system("Fresh error").with_path("x"), ErrorContext::new()).await;
        assert!(after.should_retry);
        assert_eq!(manager.error_statistics().window_errors, 1);
        assert_eq!(manager.error_statistics().total_errors, 12);
    }

    struct FixingContext {
        recreated: AtomicUsize,
    }

    #[async_trait]
    impl RecoveryContext for FixingContext {
        async fn recreate_watcher(&self) -> anyhow::Result<bool> {
            self.recreated.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn reset_pipeline(&self) -> anyhow::Result<bool> {
            anyhow::bail!("pipeline busy")
        }
    }

    #[tokio::test]
    async fn test_successful_action_clears_signature() {
        let manager = manager();
        let context = Arc::new(FixingContext {
            recreated: AtomicUsize::new(0),
        });
        manager.set_context(context.clone());

        let result = manager
            .handle_error(&WatchError::file_system("watcher crashed"), ErrorContext::new())
            .await;
        assert!(result.success);
        assert!(result.message.contains("Recreate file watcher"));
        assert_eq!(context.recreated.load(Ordering::SeqCst), 1);
        assert_eq!(manager.error_statistics().active_errors, 0);
    }

    #[tokio::test]
    async fn test_failed_action_still_recommends_backoff() {
        let manager = manager();
        manager.set_context(Arc::new(FixingContext {
            recreated: AtomicUsize::new(0),
        }));

        let result = manager
            .handle_error(&WatchError::translation("translation context lost"), ErrorContext::new())
            .await;
        assert!(!result.success);
        assert!(result.should_retry);
        assert!(result.message.contains("All recovery actions failed"));
        assert!(within_jitter(result.next_retry_delay.unwrap(), 1000));
    }

    #[tokio::test]
    async fn test_check_file_exists_recovers_when_path_returns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("en.json");
        let manager = manager();
        let error = WatchError::file_system("no such file or directory").with_path(&path);

        let missing = manager.handle_error(&error, ErrorContext::new()).await;
        assert!(!missing.success);

        std::fs::write(&path, "{}").unwrap();
        let back = manager.handle_error(&error, ErrorContext::new()).await;
        assert!(back.success);
        assert!(manager.active_errors().is_empty());
    }

    #[tokio::test]
    async fn test_registered_action_runs() {
        let manager = manager();
        manager.register_action(RecoveryAction::new(
            "flush_queue",
            ErrorCategory::Resource,
            "Flush the pending queue",
            |e| e.message().contains("queue"),
            |_, _| async { Ok(true) },
        ));

        let result = manager
            .handle_error(&WatchError::file_system("queue overflow"), ErrorContext::new())
            .await;
        assert!(result.success);
        assert!(result.message.contains("Flush the pending queue"));
    }

    #[tokio::test]
    async fn test_statistics_and_health() {
        let manager = manager();
        assert!(manager.is_healthy());

        manager.handle_error(&WatchError::file_system("File error"), ErrorContext::new()).await;
        manager.handle_error(&WatchError::translation("Translation error"), ErrorContext::new()).await;
        manager.handle_error(&WatchError::configuration("Config error"), ErrorContext::new()).await;

        let stats = manager.error_statistics();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.active_errors, 3);
        assert_eq!(stats.errors_by_category[&ErrorCategory::FileSystem], 1);
        assert_eq!(stats.errors_by_category[&ErrorCategory::Translation], 1);
        assert_eq!(stats.errors_by_category[&ErrorCategory::Configuration], 1);
        assert!(manager.is_healthy());

        manager.handle_error(&WatchError::file_system("disk full"), ErrorContext::new()).await;
        assert!(!manager.is_healthy());

        assert!(manager.mark_recovered(&WatchError::file_system("disk full")));
        assert!(manager.is_healthy());

        manager.clear_active_errors();
        assert_eq!(manager.error_statistics().active_errors, 0);
    }
}
