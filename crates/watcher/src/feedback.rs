//! User-facing progress reporting
//!
//! Messages go out as tracing events on the `relocale::feedback` target so
//! the binary decides where they land.

use parking_lot::RwLock;
use relocale_core::config::MonitoringConfig;
use relocale_core::{ChangeKind, ErrorKind, FileChangeEvent, LogLevel, WatchError};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

const MAX_PATH_WIDTH: usize = 60;
const PROGRESS_WIDTH: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationProgress {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub current_task: Option<String>,
    pub estimated_remaining: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetranslationResult {
    pub success: bool,
    pub duration: Duration,
    pub tasks_completed: usize,
    pub errors: Vec<WatchError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackSettings {
    pub log_level: LogLevel,
    pub enable_progress_indicators: bool,
    pub enable_notifications: bool,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self::from(&MonitoringConfig::default())
    }
}

impl From<&MonitoringConfig> for FeedbackSettings {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            log_level: config.log_level,
            enable_progress_indicators: config.enable_progress_indicators,
            enable_notifications: config.enable_notifications,
        }
    }
}

/// Sink for watch-loop progress
pub trait Feedback: Send + Sync {
    fn file_changed(&self, event: &FileChangeEvent);
    fn retranslation_started(&self, files: &[PathBuf]);
    fn progress(&self, progress: &TranslationProgress);
    fn retranslation_complete(&self, result: &RetranslationResult);
    fn error(&self, error: &WatchError);
    fn update_settings(&self, settings: FeedbackSettings);
}

/// `1.5s`, `250ms`, `2m 5s`
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", duration.as_secs_f64())
    } else {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

pub fn progress_bar(percentage: usize, width: usize) -> String {
    let filled = ((percentage.min(100) * width) as f64 / 100.0).round() as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

/// Keep the tail of long paths
pub fn truncate_path(path: &str) -> String {
    let chars: Vec<char> = path.chars().collect();
    if chars.len() <= MAX_PATH_WIDTH {
        return path.to_string();
    }
    let tail: String = chars[chars.len() - (MAX_PATH_WIDTH - 3)..].iter().collect();
    format!("...{tail}")
}

fn change_tag(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Add => "ADD",
        ChangeKind::Change => "CHG",
        ChangeKind::Unlink => "DEL",
        ChangeKind::AddDir => "ADD_DIR",
        ChangeKind::UnlinkDir => "DEL_DIR",
    }
}

fn error_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::FileSystem => "[fs]",
        ErrorKind::Translation => "[translation]",
        ErrorKind::Configuration => "[config]",
    }
}

/// Renders a progress line, or None when progress output is off
pub fn render_progress(settings: &FeedbackSettings, progress: &TranslationProgress) -> Option<String> {
    if settings.log_level == LogLevel::Silent || !settings.enable_progress_indicators {
        return None;
    }
    let percentage = if progress.total_tasks == 0 {
        100
    } else {
        ((progress.completed_tasks as f64 / progress.total_tasks as f64) * 100.0).round() as usize
    };

    let mut line = format!(
        "{} {}% ({}/{})",
        progress_bar(percentage, PROGRESS_WIDTH),
        percentage,
        progress.completed_tasks,
        progress.total_tasks
    );
    if let Some(task) = &progress.current_task {
        line.push_str(&format!(" - {task}"));
    }
    if let Some(eta) = progress.estimated_remaining {
        line.push_str(&format!(" - ETA: {}", format_duration(eta)));
    }
    Some(line)
}

/// Feedback through `tracing`, gated by log level and monitoring flags
#[derive(Debug, Default)]
pub struct TracingFeedback {
    settings: RwLock<FeedbackSettings>,
}

impl TracingFeedback {
    pub fn new(settings: FeedbackSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn settings(&self) -> FeedbackSettings {
        *self.settings.read()
    }

    fn level(&self) -> LogLevel {
        self.settings.read().log_level
    }

    fn notify(&self, title: &str, message: &str) {
        if self.settings.read().enable_notifications {
            info!(target: "relocale::feedback", "[{}] {}", title, message);
        }
    }
}

impl Feedback for TracingFeedback {
    fn file_changed(&self, event: &FileChangeEvent) {
        let path = truncate_path(&event.path.to_string_lossy());
        match self.level() {
            LogLevel::Silent => {}
            LogLevel::Minimal => info!(target: "relocale::feedback", "File {}: {}", event.kind, path),
            LogLevel::Verbose => info!(
                target: "relocale::feedback",
                "{} {} {}",
                event.timestamp,
                change_tag(event.kind),
                path
            ),
        }
    }

    fn retranslation_started(&self, files: &[PathBuf]) {
        let level = self.level();
        if level == LogLevel::Silent {
            return;
        }
        info!(target: "relocale::feedback", "Triggering retranslation...");
        if files.is_empty() {
            return;
        }
        if level == LogLevel::Verbose {
            let list: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
            info!(target: "relocale::feedback", "Changed files: {}", list.join(", "));
        } else {
            info!(target: "relocale::feedback", "Processing {} changed file(s)", files.len());
        }
    }

    fn progress(&self, progress: &TranslationProgress) {
        if let Some(line) = render_progress(&self.settings(), progress) {
            info!(target: "relocale::feedback", "{}", line);
        }
    }

    fn retranslation_complete(&self, result: &RetranslationResult) {
        let level = self.level();
        if level == LogLevel::Silent {
            return;
        }

        if result.success {
            info!(target: "relocale::feedback", "Retranslation completed");
            if level == LogLevel::Verbose {
                info!(
                    target: "relocale::feedback",
                    "Duration: {}, tasks completed: {}",
                    format_duration(result.duration),
                    result.tasks_completed
                );
            }
            self.notify("relocale", "Retranslation completed");
        } else {
            warn!(target: "relocale::feedback", "Retranslation failed ({} errors)", result.errors.len());
            if level == LogLevel::Verbose {
                for error in &result.errors {
                    self.error(error);
                }
            }
            self.notify("relocale", "Retranslation failed");
        }
        info!(target: "relocale::feedback", "Continuing to watch for changes...");
    }

    fn error(&self, error: &WatchError) {
        let level = self.level();
        if level == LogLevel::Silent {
            return;
        }

        warn!(target: "relocale::feedback", "{} {}", error_label(error.kind), error.message);
        if let (Some(path), LogLevel::Verbose) = (&error.path, level) {
            warn!(target: "relocale::feedback", "   Path: {}", path.display());
        }
        if error.recoverable {
            info!(target: "relocale::feedback", "   Attempting to recover...");
        }
    }

    fn update_settings(&self, settings: FeedbackSettings) {
        *self.settings.write() = settings;
    }
}
