//! Graceful degradation
//!
//! Four operating levels trade functionality for stability. Each level has
//! an error threshold table; exceeding it (or the host memory/cpu ceilings)
//! pushes the system to a worse level. Moving back up requires the error
//! counts to sit well under the better level's thresholds, scaled by a
//! safety margin, so the level does not oscillate.
//!
//! Feature flags and resource limits are a pure function of the level.

use crate::monitor::SystemMetrics;
use crate::recovery::{ErrorSeverity, RecoverableError};
use parking_lot::Mutex;
use relocale_core::config::ResilienceConfig;
use relocale_core::{now_ms, LogLevel, WatchConfiguration};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Errors older than this are ignored by the evaluation
pub const ERROR_WINDOW: Duration = Duration::from_secs(5 * 60);

const MEMORY_CEILING: f64 = 0.9;
const CPU_CEILING: f64 = 0.8;
const MEMORY_RECOVERY: f64 = 0.7;
const CPU_RECOVERY: f64 = 0.6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    #[default]
    Normal,
    Reduced,
    Minimal,
    Emergency,
}

impl DegradationLevel {
    pub fn worse(self) -> Option<Self> {
        match self {
            DegradationLevel::Normal => Some(DegradationLevel::Reduced),
            DegradationLevel::Reduced => Some(DegradationLevel::Minimal),
            DegradationLevel::Minimal => Some(DegradationLevel::Emergency),
            DegradationLevel::Emergency => None,
        }
    }

    pub fn better(self) -> Option<Self> {
        match self {
            DegradationLevel::Normal => None,
            DegradationLevel::Reduced => Some(DegradationLevel::Normal),
            DegradationLevel::Minimal => Some(DegradationLevel::Reduced),
            DegradationLevel::Emergency => Some(DegradationLevel::Minimal),
        }
    }

    pub fn threshold(self) -> ErrorThreshold {
        match self {
            DegradationLevel::Normal => ErrorThreshold::new(0, 2, 5, 10, 15),
            DegradationLevel::Reduced => ErrorThreshold::new(1, 5, 10, 20, 30),
            DegradationLevel::Minimal => ErrorThreshold::new(2, 8, 15, 30, 50),
            DegradationLevel::Emergency => ErrorThreshold::UNBOUNDED,
        }
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DegradationLevel::Normal => "normal",
            DegradationLevel::Reduced => "reduced",
            DegradationLevel::Minimal => "minimal",
            DegradationLevel::Emergency => "emergency",
        })
    }
}

/// Maximum tolerated error count per severity at one level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorThreshold {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub total: usize,
}

impl ErrorThreshold {
    pub const UNBOUNDED: ErrorThreshold = ErrorThreshold::new(usize::MAX, usize::MAX, usize::MAX, usize::MAX, usize::MAX);

    pub const fn new(critical: usize, high: usize, medium: usize, low: usize, total: usize) -> Self {
        Self {
            critical,
            high,
            medium,
            low,
            total,
        }
    }

    fn exceeded_by(&self, counts: &ErrorCounts) -> bool {
        counts.critical > self.critical
            || counts.high > self.high
            || counts.medium > self.medium
            || counts.low > self.low
            || counts.total > self.total
    }

    /// Low counts are not part of the recovery condition
    fn comfortably_under(&self, counts: &ErrorCounts, margin: f64) -> bool {
        let within = |count: usize, max: usize| count as f64 <= max as f64 * margin;
        within(counts.critical, self.critical)
            && within(counts.high, self.high)
            && within(counts.medium, self.medium)
            && within(counts.total, self.total)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub total: usize,
}

impl ErrorCounts {
    /// Count errors seen within [`ERROR_WINDOW`] of `now` (unix ms)
    pub fn recent(errors: &[RecoverableError], now: u64) -> Self {
        let window = ERROR_WINDOW.as_millis() as u64;
        let mut counts = ErrorCounts::default();
        for error in errors.iter().filter(|e| now.saturating_sub(e.last_seen) < window) {
            counts.total += 1;
            match error.severity {
                ErrorSeverity::Critical => counts.critical += 1,
                ErrorSeverity::High => counts.high += 1,
                ErrorSeverity::Medium => counts.medium += 1,
                ErrorSeverity::Low => counts.low += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFlag {
    ProgressIndicators,
    Notifications,
    DetailedLogging,
    PatternExpansion,
    AdvancedDebouncing,
    StatisticsTracking,
    PerformanceMonitoring,
}

impl FeatureFlag {
    pub const ALL: [FeatureFlag; 7] = [
        FeatureFlag::ProgressIndicators,
        FeatureFlag::Notifications,
        FeatureFlag::DetailedLogging,
        FeatureFlag::PatternExpansion,
        FeatureFlag::AdvancedDebouncing,
        FeatureFlag::StatisticsTracking,
        FeatureFlag::PerformanceMonitoring,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FeatureFlag::ProgressIndicators => "progress_indicators",
            FeatureFlag::Notifications => "notifications",
            FeatureFlag::DetailedLogging => "detailed_logging",
            FeatureFlag::PatternExpansion => "pattern_expansion",
            FeatureFlag::AdvancedDebouncing => "advanced_debouncing",
            FeatureFlag::StatisticsTracking => "statistics_tracking",
            FeatureFlag::PerformanceMonitoring => "performance_monitoring",
        }
    }

    /// Whether the flag is on at `level`
    pub fn enabled_at(self, level: DegradationLevel) -> bool {
        match level {
            DegradationLevel::Normal => true,
            DegradationLevel::Reduced => self != FeatureFlag::Notifications,
            DegradationLevel::Minimal => !matches!(
                self,
                FeatureFlag::Notifications | FeatureFlag::ProgressIndicators | FeatureFlag::DetailedLogging
            ),
            DegradationLevel::Emergency => false,
        }
    }
}

/// Resource ceilings derived from the level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub max_concurrent_operations: usize,
    pub batch_size: usize,
    pub rate_limit_delay: u64,
    pub max_watched_files: usize,
    pub max_retries: u32,
}

impl ResourceLimits {
    pub fn for_level(level: DegradationLevel) -> Self {
        let (max_concurrent_operations, batch_size, rate_limit_delay, max_watched_files, max_retries) = match level {
            DegradationLevel::Normal => (10, 50, 100, 1000, 5),
            DegradationLevel::Reduced => (5, 25, 200, 500, 3),
            DegradationLevel::Minimal => (2, 10, 500, 200, 2),
            DegradationLevel::Emergency => (1, 5, 1000, 50, 1),
        };
        Self {
            max_concurrent_operations,
            batch_size,
            rate_limit_delay,
            max_watched_files,
            max_retries,
        }
    }
}

/// A configuration tightened for a degradation level
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedConfiguration {
    pub config: WatchConfiguration,
    pub level: DegradationLevel,
    pub disabled_features: Vec<&'static str>,
    pub limits: ResourceLimits,
}

/// Derive the configuration for `level` from `base`
///
/// Every step is monotone: batch sizes only shrink, delays only grow and
/// monitoring features only switch off.
pub fn degrade_configuration(base: &WatchConfiguration, level: DegradationLevel) -> DegradedConfiguration {
    let mut config = base.clone();
    let limits = ResourceLimits::for_level(level);

    match level {
        DegradationLevel::Normal => {}
        DegradationLevel::Reduced => {
            tighten(&mut config, limits, 3000);
        }
        DegradationLevel::Minimal => {
            tighten(&mut config, limits, 5000);
            config.monitoring.log_level = config.monitoring.log_level.min(LogLevel::Minimal);
        }
        DegradationLevel::Emergency => {
            tighten(&mut config, limits, 10_000);
            config.debounce.max_wait = Some(30_000.max(config.debounce.delay * 3));
            config.monitoring.log_level = LogLevel::Silent;
        }
    }

    if !FeatureFlag::Notifications.enabled_at(level) {
        config.monitoring.enable_notifications = false;
        config.monitoring.enable_sound = false;
    }
    if !FeatureFlag::ProgressIndicators.enabled_at(level) {
        config.monitoring.enable_progress_indicators = false;
    }

    let disabled_features = FeatureFlag::ALL
        .iter()
        .filter(|f| !f.enabled_at(level))
        .map(|f| f.name())
        .collect();

    DegradedConfiguration {
        config,
        level,
        disabled_features,
        limits,
    }
}

fn tighten(config: &mut WatchConfiguration, limits: ResourceLimits, min_delay: u64) {
    config.performance.batch_size = config.performance.batch_size.min(limits.batch_size);
    config.performance.rate_limit_delay = config.performance.rate_limit_delay.max(limits.rate_limit_delay);
    config.debounce.delay = config.debounce.delay.max(min_delay);
    if let Some(max_wait) = config.debounce.max_wait {
        if max_wait <= config.debounce.delay {
            config.debounce.max_wait = Some(config.debounce.delay * 2);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationTrigger {
    ErrorThreshold,
    Manual,
    SystemMetric,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradationDecision {
    pub should_degrade: bool,
    pub target_level: DegradationLevel,
    pub reason: Option<String>,
    pub trigger: DegradationTrigger,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradationEvent {
    pub timestamp: u64,
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub reason: String,
    pub trigger: DegradationTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Impaired,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub message: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradationStatistics {
    pub current_level: DegradationLevel,
    pub transitions: usize,
    pub time_in_current_level: Duration,
}

struct DegradationState {
    level: DegradationLevel,
    original: Option<WatchConfiguration>,
    degraded: Option<DegradedConfiguration>,
    history: Vec<DegradationEvent>,
    level_since: Instant,
    safety_margin: f64,
}

pub struct DegradationManager {
    state: Mutex<DegradationState>,
}

impl DegradationManager {
    pub fn new(resilience: &ResilienceConfig) -> Self {
        Self {
            state: Mutex::new(DegradationState {
                level: DegradationLevel::Normal,
                original: None,
                degraded: None,
                history: Vec::new(),
                level_since: Instant::now(),
                safety_margin: resilience.degradation_safety_margin,
            }),
        }
    }

    pub fn set_safety_margin(&self, margin: f64) {
        self.state.lock().safety_margin = margin;
    }

    /// Recommend a level for the given errors and host metrics
    ///
    /// Escalation skips past every level whose thresholds the current load
    /// would also exceed. Recovery moves one level at a time.
    pub fn evaluate_degradation(&self, errors: &[RecoverableError], metrics: &SystemMetrics) -> DegradationDecision {
        let (current, margin) = {
            let state = self.state.lock();
            (state.level, state.safety_margin)
        };
        let counts = ErrorCounts::recent(errors, now_ms());
        let metrics_hot = metrics.memory_usage > MEMORY_CEILING || metrics.cpu_usage > CPU_CEILING;

        let mut target = current;
        let mut trigger = DegradationTrigger::ErrorThreshold;
        while let Some(next) = target.worse() {
            if target.threshold().exceeded_by(&counts) {
                trigger = DegradationTrigger::ErrorThreshold;
            } else if metrics_hot {
                trigger = DegradationTrigger::SystemMetric;
            } else {
                break;
            }
            target = next;
        }

        if target != current {
            let reason = match trigger {
                DegradationTrigger::SystemMetric => format!(
                    "System metrics exceeded ceilings (memory {:.0}%, cpu {:.0}%)",
                    metrics.memory_usage * 100.0,
                    metrics.cpu_usage * 100.0
                ),
                _ => "Error threshold exceeded".to_string(),
            };
            return DegradationDecision {
                should_degrade: true,
                target_level: target,
                reason: Some(reason),
                trigger,
            };
        }

        if let Some(better) = current.better() {
            let calm = metrics.memory_usage < MEMORY_RECOVERY && metrics.cpu_usage < CPU_RECOVERY;
            if calm && better.threshold().comfortably_under(&counts, margin) {
                return DegradationDecision {
                    should_degrade: true,
                    target_level: better,
                    reason: Some("System stabilized, recovering".to_string()),
                    trigger: DegradationTrigger::ErrorThreshold,
                };
            }
        }

        DegradationDecision {
            should_degrade: false,
            target_level: current,
            reason: None,
            trigger: DegradationTrigger::ErrorThreshold,
        }
    }

    /// Switch to `level`, deriving its configuration from `base`
    pub fn apply_degradation(
        &self,
        level: DegradationLevel,
        base: &WatchConfiguration,
        reason: &str,
        trigger: DegradationTrigger,
    ) -> DegradedConfiguration {
        let mut state = self.state.lock();
        if state.original.is_none() {
            state.original = Some(base.clone());
        }

        let degraded = degrade_configuration(base, level);
        let previous = state.level;
        if previous != level {
            state.history.push(DegradationEvent {
                timestamp: now_ms(),
                from: previous,
                to: level,
                reason: reason.to_string(),
                trigger,
            });
            state.level = level;
            state.level_since = Instant::now();

            if level > previous {
                warn!("System degraded to {} mode: {}", level, reason);
                if !degraded.disabled_features.is_empty() {
                    warn!("Disabled features: {}", degraded.disabled_features.join(", "));
                }
            } else {
                info!("System recovered to {} mode: {}", level, reason);
            }
        }

        state.degraded = Some(degraded.clone());
        degraded
    }

    /// Return to normal, handing back the configuration seen before the
    /// first degradation
    pub fn reset_to_normal(&self) -> Option<WatchConfiguration> {
        let mut state = self.state.lock();
        if state.level == DegradationLevel::Normal {
            return None;
        }

        let previous = state.level;
        state.history.push(DegradationEvent {
            timestamp: now_ms(),
            from: previous,
            to: DegradationLevel::Normal,
            reason: "Manual reset to normal operation".to_string(),
            trigger: DegradationTrigger::Manual,
        });
        state.level = DegradationLevel::Normal;
        state.level_since = Instant::now();
        state.degraded = None;
        info!("System restored to normal operation");
        state.original.take()
    }

    pub fn current_level(&self) -> DegradationLevel {
        self.state.lock().level
    }

    pub fn is_feature_enabled(&self, flag: FeatureFlag) -> bool {
        flag.enabled_at(self.current_level())
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits::for_level(self.current_level())
    }

    pub fn degraded_configuration(&self) -> Option<DegradedConfiguration> {
        self.state.lock().degraded.clone()
    }

    pub fn history(&self) -> Vec<DegradationEvent> {
        self.state.lock().history.clone()
    }

    pub fn health_status(&self) -> HealthStatus {
        match self.current_level() {
            DegradationLevel::Normal => HealthStatus {
                status: HealthState::Healthy,
                message: "All systems operational",
            },
            DegradationLevel::Reduced => HealthStatus {
                status: HealthState::Degraded,
                message: "Operating with reduced functionality",
            },
            DegradationLevel::Minimal => HealthStatus {
                status: HealthState::Impaired,
                message: "Operating with minimal functionality",
            },
            DegradationLevel::Emergency => HealthStatus {
                status: HealthState::Critical,
                message: "Emergency mode - core functionality only",
            },
        }
    }

    pub fn statistics(&self) -> DegradationStatistics {
        let state = self.state.lock();
        DegradationStatistics {
            current_level: state.level,
            transitions: state.history.len(),
            time_in_current_level: state.level_since.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{ErrorCategory, ErrorContext};
    use relocale_core::WatchError;

    fn errors(severity: ErrorSeverity, count: usize) -> Vec<RecoverableError> {
        (0..count)
            .map(|i| {
                let mut e = RecoverableError::classify(&WatchError::file_system(format!("Error {i}")), ErrorContext::new());
                e.category = ErrorCategory::FileSystem;
                e.severity = severity;
                e.retry_count = 1;
                e
            })
            .collect()
    }

    fn metrics(memory_usage: f64, cpu_usage: f64) -> SystemMetrics {
        SystemMetrics {
            memory_usage,
            cpu_usage,
            ..SystemMetrics::default()
        }
    }

    fn manager() -> DegradationManager {
        DegradationManager::new(&ResilienceConfig::default())
    }

    #[test]
    fn test_stays_normal_without_errors() {
        let decision = manager().evaluate_degradation(&[], &metrics(0.5, 0.3));
        assert!(!decision.should_degrade);
        assert_eq!(decision.target_level, DegradationLevel::Normal);
    }

    #[test]
    fn test_three_high_errors_reduce() {
        let decision = manager().evaluate_degradation(&errors(ErrorSeverity::High, 3), &metrics(0.7, 0.6));
        assert!(decision.should_degrade);
        assert_eq!(decision.target_level, DegradationLevel::Reduced);
        assert_eq!(decision.trigger, DegradationTrigger::ErrorThreshold);
    }

    #[test]
    fn test_fifteen_medium_errors_go_minimal() {
        let decision = manager().evaluate_degradation(&errors(ErrorSeverity::Medium, 15), &metrics(0.8, 0.7));
        assert!(decision.should_degrade);
        assert_eq!(decision.target_level, DegradationLevel::Minimal);
    }

    #[test]
    fn test_critical_error_with_memory_pressure_is_emergency() {
        let decision = manager().evaluate_degradation(&errors(ErrorSeverity::Critical, 1), &metrics(0.95, 0.9));
        assert!(decision.should_degrade);
        assert_eq!(decision.target_level, DegradationLevel::Emergency);
        assert_eq!(decision.trigger, DegradationTrigger::SystemMetric);
    }

    #[test]
    fn test_stale_errors_are_ignored() {
        let mut stale = errors(ErrorSeverity::Critical, 3);
        for e in &mut stale {
            e.last_seen = now_ms() - ERROR_WINDOW.as_millis() as u64 - 1000;
        }
        let decision = manager().evaluate_degradation(&stale, &metrics(0.1, 0.1));
        assert!(!decision.should_degrade);
    }

    #[test]
    fn test_recovery_uses_safety_margin() {
        let manager = manager();
        let base = WatchConfiguration::default();
        manager.apply_degradation(DegradationLevel::Minimal, &base, "High error count", DegradationTrigger::ErrorThreshold);

        let decision = manager.evaluate_degradation(&errors(ErrorSeverity::Low, 1), &metrics(0.4, 0.3));
        assert!(decision.should_degrade);
        assert_eq!(decision.target_level, DegradationLevel::Reduced);
        assert!(decision.reason.unwrap().contains("recovering"));

        // 3 high errors exceed 50% of reduced's high threshold (2.5)
        let decision = manager.evaluate_degradation(&errors(ErrorSeverity::High, 3), &metrics(0.4, 0.3));
        assert!(!decision.should_degrade);

        // Memory not below the recovery ceiling
        let decision = manager.evaluate_degradation(&errors(ErrorSeverity::Low, 1), &metrics(0.7, 0.3));
        assert!(!decision.should_degrade);
        assert_eq!(decision.target_level, DegradationLevel::Minimal);
    }

    #[test]
    fn test_configurations_are_monotone() {
        let base = WatchConfiguration::default();
        let levels = [
            DegradationLevel::Normal,
            DegradationLevel::Reduced,
            DegradationLevel::Minimal,
            DegradationLevel::Emergency,
        ];
        let configs: Vec<_> = levels.iter().map(|l| degrade_configuration(&base, *l)).collect();

        for pair in configs.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(b.config.performance.batch_size <= a.config.performance.batch_size);
            assert!(b.config.performance.rate_limit_delay >= a.config.performance.rate_limit_delay);
            assert!(b.config.debounce.delay >= a.config.debounce.delay);
            assert!(b.disabled_features.len() > a.disabled_features.len());
            assert!(b.config.validate().is_valid(), "{:?}", b.config.validate().errors);
        }

        let emergency = &configs[3];
        assert_eq!(emergency.config.performance.batch_size, 5);
        assert_eq!(emergency.config.performance.rate_limit_delay, 1000);
        assert_eq!(emergency.config.debounce.delay, 10_000);
        assert_eq!(emergency.config.debounce.max_wait, Some(30_000));
        assert_eq!(emergency.config.monitoring.log_level, LogLevel::Silent);
        assert!(emergency.disabled_features.contains(&"notifications"));
        assert!(emergency.disabled_features.contains(&"progress_indicators"));

        let minimal = &configs[2];
        assert!(!minimal.config.monitoring.enable_progress_indicators);
        assert_eq!(minimal.config.monitoring.log_level, LogLevel::Minimal);
    }

    #[test]
    fn test_flags_follow_level() {
        let manager = manager();
        let base = WatchConfiguration::default();
        assert!(FeatureFlag::ALL.iter().all(|f| manager.is_feature_enabled(*f)));

        manager.apply_degradation(DegradationLevel::Reduced, &base, "test", DegradationTrigger::Manual);
        assert!(!manager.is_feature_enabled(FeatureFlag::Notifications));
        assert!(manager.is_feature_enabled(FeatureFlag::ProgressIndicators));
        assert_eq!(manager.resource_limits().max_concurrent_operations, 5);

        manager.apply_degradation(DegradationLevel::Emergency, &base, "test", DegradationTrigger::Manual);
        assert!(FeatureFlag::ALL.iter().all(|f| !manager.is_feature_enabled(*f)));
        assert_eq!(manager.health_status().status, HealthState::Critical);
    }

    #[test]
    fn test_history_and_reset() {
        let manager = manager();
        let mut base = WatchConfiguration::default();
        base.debounce.delay = 1200;

        manager.apply_degradation(DegradationLevel::Reduced, &base, "first", DegradationTrigger::ErrorThreshold);
        manager.apply_degradation(DegradationLevel::Minimal, &base, "second", DegradationTrigger::SystemMetric);
        assert_eq!(manager.health_status().status, HealthState::Impaired);

        let restored = manager.reset_to_normal().unwrap();
        assert_eq!(restored.debounce.delay, 1200);
        assert_eq!(manager.current_level(), DegradationLevel::Normal);
        assert!(manager.degraded_configuration().is_none());

        let history = manager.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].to, DegradationLevel::Reduced);
        assert_eq!(history[1].trigger, DegradationTrigger::SystemMetric);
        assert_eq!(history[2].trigger, DegradationTrigger::Manual);
        assert_eq!(manager.statistics().transitions, 3);

        assert!(manager.reset_to_normal().is_none());
    }
}
