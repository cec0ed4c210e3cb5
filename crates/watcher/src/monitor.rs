//! Performance monitoring
//!
//! Periodically samples this process's memory and cpu pressure, merges in watch
//! activity reported by the orchestrator, keeps a bounded history and raises
//! alerts when thresholds are crossed. Samples and alerts are published on a
//! broadcast channel.

use parking_lot::Mutex;
use relocale_core::now_ms;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub const HISTORY_LIMIT: usize = 1000;

/// Process pressure as 0..1 fractions
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub memory_usage: f64,
    pub cpu_usage: f64,
    /// Resident set size of this process in bytes
    pub process_rss: u64,
    pub watched_files: usize,
}

/// Something that can produce [`SystemMetrics`]
pub trait MetricsSource: Send {
    fn sample(&mut self) -> SystemMetrics;
}

/// Resident memory this process may use before it counts as fully loaded
pub const DEFAULT_MEMORY_BUDGET: u64 = 512 * 1024 * 1024;

/// `sysinfo`-backed metrics source
///
/// Measures this process only: resident memory against a budget and cpu
/// time spread over every core. A busy host does not throttle the watcher.
pub struct HostSampler {
    system: System,
    pid: Option<Pid>,
    cpus: usize,
    memory_budget: u64,
}

impl std::fmt::Debug for HostSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSampler")
            .field("pid", &self.pid)
            .field("memory_budget", &self.memory_budget)
            .finish_non_exhaustive()
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler {
    pub fn new() -> Self {
        Self::with_memory_budget(DEFAULT_MEMORY_BUDGET)
    }

    pub fn with_memory_budget(memory_budget: u64) -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot identify own process, metrics will read zero: {}", e);
                None
            }
        };
        let mut sampler = Self {
            cpus: system.cpus().len().max(1),
            system,
            pid,
            memory_budget: memory_budget.max(1),
        };
        // Cpu usage is measured between refreshes
        sampler.refresh();
        sampler
    }

    fn refresh(&mut self) -> Option<(u64, f32)> {
        let pid = self.pid?;
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system
            .process(pid)
            .map(|process| (process.memory(), process.cpu_usage()))
    }
}

impl MetricsSource for HostSampler {
    fn sample(&mut self) -> SystemMetrics {
        let (process_rss, cpu_percent) = self.refresh().unwrap_or((0, 0.0));
        let (memory_usage, cpu_usage) =
            process_fractions(process_rss, self.memory_budget, f64::from(cpu_percent), self.cpus);
        SystemMetrics {
            memory_usage,
            cpu_usage,
            process_rss,
            watched_files: 0,
        }
    }
}

/// Turn raw process readings into 0..1 pressure fractions
///
/// `cpu_percent` is per-core percent as `sysinfo` reports it, so a process
/// saturating two of four cores reads 200.
pub fn process_fractions(rss: u64, memory_budget: u64, cpu_percent: f64, cpus: usize) -> (f64, f64) {
    let memory = rss as f64 / memory_budget.max(1) as f64;
    let cpu = cpu_percent / 100.0 / cpus.max(1) as f64;
    (clamp_fraction(memory), clamp_fraction(cpu))
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Watch activity reported by the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchMetrics {
    pub total_changes: u64,
    pub changes_per_minute: f64,
    pub retranslation_count: u64,
    pub average_retranslation_ms: f64,
    /// Failed retranslations over all retranslations
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub system: SystemMetrics,
    pub watch: WatchMetrics,
    pub file_operations_per_second: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceThresholds {
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub max_watched_files: usize,
    pub max_file_operations_per_second: f64,
    pub max_changes_per_minute: f64,
    pub max_error_rate: f64,
    pub max_retranslation_ms: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            memory_warning: 0.7,
            memory_critical: 0.9,
            cpu_warning: 0.7,
            cpu_critical: 0.9,
            max_watched_files: 1000,
            max_file_operations_per_second: 100.0,
            max_changes_per_minute: 100.0,
            max_error_rate: 0.1,
            max_retranslation_ms: 30_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceAlert {
    pub level: AlertLevel,
    pub category: &'static str,
    pub metric: &'static str,
    pub message: String,
    pub current_value: f64,
    pub threshold: f64,
    pub timestamp: u64,
    pub suggestions: Vec<&'static str>,
}

impl PerformanceAlert {
    pub fn key(&self) -> String {
        format!("{}:{}", self.category, self.metric)
    }
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Sample(PerformanceSnapshot),
    Alert(PerformanceAlert),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub current: Option<PerformanceSnapshot>,
    pub samples: usize,
    pub average_memory_usage: f64,
    pub average_cpu_usage: f64,
    pub alerts: usize,
    pub resource_violations: Vec<String>,
    pub uptime: Duration,
}

struct MonitorState {
    history: VecDeque<PerformanceSnapshot>,
    alerts: HashMap<String, PerformanceAlert>,
    watch: WatchMetrics,
    watched_files: usize,
    file_operations: u64,
    operations_since: Instant,
    max_memory_usage: f64,
}

pub struct PerformanceMonitor {
    source: Mutex<Box<dyn MetricsSource>>,
    state: Mutex<MonitorState>,
    thresholds: PerformanceThresholds,
    events: broadcast::Sender<MonitorEvent>,
    started: Instant,
}

impl PerformanceMonitor {
    pub fn new(source: Box<dyn MetricsSource>, thresholds: PerformanceThresholds) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            source: Mutex::new(source),
            state: Mutex::new(MonitorState {
                history: VecDeque::with_capacity(64),
                alerts: HashMap::new(),
                watch: WatchMetrics::default(),
                watched_files: 0,
                file_operations: 0,
                operations_since: Instant::now(),
                max_memory_usage: 0.8,
            }),
            thresholds,
            events,
            started: Instant::now(),
        }
    }

    pub fn with_host_sampler() -> Self {
        Self::new(Box::new(HostSampler::new()), PerformanceThresholds::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Take one sample, record it and evaluate thresholds
    pub fn collect(&self) -> PerformanceSnapshot {
        let mut system = self.source.lock().sample();

        let (snapshot, raised) = {
            let mut state = self.state.lock();
            system.watched_files = state.watched_files;

            let elapsed = state.operations_since.elapsed().as_secs_f64();
            let file_operations_per_second = if elapsed > 0.0 {
                state.file_operations as f64 / elapsed
            } else {
                0.0
            };
            state.file_operations = 0;
            state.operations_since = Instant::now();

            let snapshot = PerformanceSnapshot {
                system,
                watch: state.watch,
                file_operations_per_second,
                timestamp: now_ms(),
            };
            state.history.push_back(snapshot.clone());
            while state.history.len() > HISTORY_LIMIT {
                state.history.pop_front();
            }

            let mut raised = Vec::new();
            for (key, alert) in self.evaluate(&snapshot) {
                match alert {
                    Some(alert) => {
                        let duplicate = state.alerts.get(&key).is_some_and(|a| a.level == alert.level);
                        if !duplicate {
                            state.alerts.insert(key, alert.clone());
                            raised.push(alert);
                        }
                    }
                    None => {
                        state.alerts.remove(&key);
                    }
                }
            }
            (snapshot, raised)
        };

        for alert in raised {
            match alert.level {
                AlertLevel::Critical => error!("[CRITICAL] {}", alert.message),
                AlertLevel::Warning => warn!("[WARNING] {}", alert.message),
                AlertLevel::Info => debug!("[INFO] {}", alert.message),
            }
            let _ = self.events.send(MonitorEvent::Alert(alert));
        }
        let _ = self.events.send(MonitorEvent::Sample(snapshot.clone()));
        snapshot
    }

    /// Alert (or cleared alert) per metric key
    fn evaluate(&self, snapshot: &PerformanceSnapshot) -> Vec<(String, Option<PerformanceAlert>)> {
        let t = &self.thresholds;
        let timestamp = snapshot.timestamp;
        let mut out = Vec::new();

        let mut check = |category: &'static str,
                         metric: &'static str,
                         value: f64,
                         warning: f64,
                         critical: Option<f64>,
                         message: String,
                         suggestions: Vec<&'static str>| {
            let level = match critical {
                Some(c) if value >= c => Some(AlertLevel::Critical),
                _ if value >= warning => Some(AlertLevel::Warning),
                _ => None,
            };
            let key = format!("{category}:{metric}");
            let alert = level.map(|level| PerformanceAlert {
                level,
                category,
                metric,
                message,
                current_value: value,
                threshold: match (level, critical) {
                    (AlertLevel::Critical, Some(c)) => c,
                    _ => warning,
                },
                timestamp,
                suggestions,
            });
            out.push((key, alert));
        };

        let system = &snapshot.system;
        check(
            "memory",
            "memory.usage",
            system.memory_usage,
            t.memory_warning,
            Some(t.memory_critical),
            format!("High memory usage: {:.1}%", system.memory_usage * 100.0),
            vec!["Reduce watched file count", "Lower batch size", "Restart the watcher"],
        );
        check(
            "cpu",
            "cpu.usage",
            system.cpu_usage,
            t.cpu_warning,
            Some(t.cpu_critical),
            format!("High CPU usage: {:.1}%", system.cpu_usage * 100.0),
            vec!["Increase debounce delay", "Reduce pattern scope"],
        );
        check(
            "filesystem",
            "fileSystem.watchedFiles",
            system.watched_files as f64,
            t.max_watched_files as f64,
            None,
            format!("Too many watched files: {}", system.watched_files),
            vec!["Use more specific include/exclude patterns", "Split into multiple watch processes"],
        );
        check(
            "filesystem",
            "fileSystem.fileOperationsPerSecond",
            snapshot.file_operations_per_second,
            t.max_file_operations_per_second,
            None,
            format!("High file operation rate: {:.1}/sec", snapshot.file_operations_per_second),
            vec!["Increase debounce delay", "Check for file system loops"],
        );
        check(
            "watch",
            "watch.changesPerMinute",
            snapshot.watch.changes_per_minute,
            t.max_changes_per_minute,
            None,
            format!("High change rate: {:.0} changes/min", snapshot.watch.changes_per_minute),
            vec!["Increase debounce delay", "Review file patterns"],
        );
        check(
            "watch",
            "watch.errorRate",
            snapshot.watch.error_rate,
            t.max_error_rate,
            Some(t.max_error_rate),
            format!("High error rate: {:.1}%", snapshot.watch.error_rate * 100.0),
            vec!["Check system resources", "Review error logs"],
        );
        check(
            "watch",
            "watch.averageRetranslationTime",
            snapshot.watch.average_retranslation_ms,
            t.max_retranslation_ms,
            None,
            format!("Slow retranslation: {:.0}ms average", snapshot.watch.average_retranslation_ms),
            vec!["Optimize the pipeline", "Reduce batch size"],
        );

        out
    }

    /// Sample every `interval` until the monitor is dropped
    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        debug!("Performance monitoring started (interval: {:?})", interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.collect();
            }
        })
    }

    pub fn update_watch_metrics(&self, metrics: WatchMetrics) {
        self.state.lock().watch = metrics;
    }

    pub fn update_watched_files(&self, count: usize) {
        self.state.lock().watched_files = count;
    }

    pub fn set_max_memory_usage(&self, fraction: f64) {
        self.state.lock().max_memory_usage = fraction;
    }

    pub fn record_file_operation(&self) {
        self.state.lock().file_operations += 1;
    }

    pub fn current(&self) -> Option<PerformanceSnapshot> {
        self.state.lock().history.back().cloned()
    }

    /// Most recent samples, oldest first
    pub fn history(&self, limit: Option<usize>) -> Vec<PerformanceSnapshot> {
        let state = self.state.lock();
        let skip = limit.map_or(0, |l| state.history.len().saturating_sub(l));
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn active_alerts(&self) -> Vec<PerformanceAlert> {
        self.state.lock().alerts.values().cloned().collect()
    }

    pub fn has_critical_alert(&self) -> bool {
        self.state
            .lock()
            .alerts
            .values()
            .any(|a| a.level == AlertLevel::Critical)
    }

    pub fn clear_alert(&self, category: &str, metric: &str) -> bool {
        self.state.lock().alerts.remove(&format!("{category}:{metric}")).is_some()
    }

    pub fn clear_all_alerts(&self) {
        self.state.lock().alerts.clear();
    }

    /// Violations of the memory and watched-file limits in the latest sample
    pub fn check_resource_limits(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut violations = Vec::new();
        let Some(current) = state.history.back() else {
            return violations;
        };

        if current.system.memory_usage > state.max_memory_usage {
            violations.push(format!(
                "Memory usage ({:.1}%) exceeds limit ({:.1}%)",
                current.system.memory_usage * 100.0,
                state.max_memory_usage * 100.0
            ));
        }
        if current.system.watched_files > self.thresholds.max_watched_files {
            violations.push(format!(
                "Watched files ({}) exceeds limit ({})",
                current.system.watched_files, self.thresholds.max_watched_files
            ));
        }
        violations
    }

    pub fn summary(&self) -> PerformanceSummary {
        let resource_violations = self.check_resource_limits();
        let state = self.state.lock();
        let samples = state.history.len();
        let (memory_sum, cpu_sum) = state
            .history
            .iter()
            .fold((0.0, 0.0), |(m, c), s| (m + s.system.memory_usage, c + s.system.cpu_usage));
        let average = |sum: f64| if samples > 0 { sum / samples as f64 } else { 0.0 };

        PerformanceSummary {
            current: state.history.back().cloned(),
            samples,
            average_memory_usage: average(memory_sum),
            average_cpu_usage: average(cpu_sum),
            alerts: state.alerts.len(),
            resource_violations,
            uptime: self.started.elapsed(),
        }
    }
}
