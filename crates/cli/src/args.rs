//! Watch flag surface and its mapping onto configuration overrides

use crate::logging::Verbosity;
use anyhow::{Context, Result};
use clap::Args;
use relocale_core::{StrategyKind, WatchOverrides};
use relocale_watcher::WatchOptions;
use std::path::PathBuf;

#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    /// Workspace to watch (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Config file (JSON, YAML or TOML) with a top-level `watch` section
    #[arg(long, value_name = "PATH")]
    pub watch_config: Option<PathBuf>,

    /// Debounce delay in milliseconds
    #[arg(long, value_name = "MS")]
    pub debounce: Option<u64>,

    /// simple, adaptive or batch
    #[arg(long, value_name = "STRATEGY")]
    pub debounce_strategy: Option<StrategyKind>,

    /// Upper bound on how long changes may wait, in milliseconds
    #[arg(long, value_name = "MS")]
    pub max_wait: Option<u64>,

    /// Glob to watch (repeatable)
    #[arg(long = "watch-include", value_name = "GLOB")]
    pub include: Vec<String>,

    /// Glob to ignore (repeatable)
    #[arg(long = "watch-exclude", value_name = "GLOB")]
    pub exclude: Vec<String>,

    /// Show progress bars
    #[arg(long, overrides_with = "no_progress")]
    pub progress: bool,

    /// Hide progress bars
    #[arg(long)]
    pub no_progress: bool,

    /// Announce finished runs
    #[arg(long)]
    pub notifications: bool,

    /// Ring the bell on finished runs
    #[arg(long)]
    pub sound: bool,

    /// Changes per batch under the batch strategy
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,

    /// Pause between batches, in milliseconds
    #[arg(long, value_name = "MS")]
    pub rate_limit_delay: Option<u64>,

    /// Locale code substituted into `[locale]` patterns (repeatable)
    #[arg(long = "locale", value_name = "CODE")]
    pub locales: Vec<String>,

    /// Shell command run for every batch of changes
    #[arg(long, value_name = "CMD")]
    pub exec: Option<String>,
}

impl WatchArgs {
    pub fn overrides(&self, verbosity: Verbosity) -> WatchOverrides {
        let mut overrides = WatchOverrides::default();
        overrides.patterns.include = self.include.clone();
        overrides.patterns.exclude = self.exclude.clone();

        overrides.debounce.delay = self.debounce;
        overrides.debounce.max_wait = self.max_wait;
        overrides.debounce.strategy = self.debounce_strategy;

        overrides.monitoring.enable_progress_indicators = match (self.progress, self.no_progress) {
            (_, true) => Some(false),
            (true, false) => Some(true),
            (false, false) => None,
        };
        overrides.monitoring.enable_notifications = self.notifications.then_some(true);
        overrides.monitoring.enable_sound = self.sound.then_some(true);
        overrides.monitoring.log_level = verbosity.feedback_level();

        overrides.performance.batch_size = self.batch_size;
        overrides.performance.rate_limit_delay = self.rate_limit_delay;
        overrides
    }

    pub fn root(&self) -> Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => std::env::current_dir().context("Failed to determine current directory"),
        }
    }

    pub fn options(&self, verbosity: Verbosity) -> Result<WatchOptions> {
        let mut options = WatchOptions::new(self.root()?);
        options.config_path = self.watch_config.clone();
        options.overrides = self.overrides(verbosity);
        options.locales = self.locales.clone();
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use relocale_core::LogLevel;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        watch: WatchArgs,
    }

    fn parse(args: &[&str]) -> WatchArgs {
        let mut argv = vec!["relocale"];
        argv.extend_from_slice(args);
        Harness::try_parse_from(argv).unwrap().watch
    }

    #[test]
    fn test_flags_map_to_overrides() {
        let args = parse(&[
            "--debounce",
            "750",
            "--debounce-strategy",
            "adaptive",
            "--max-wait",
            "9000",
            "--watch-include",
            "locales/**/*.json",
            "--watch-include",
            "src/**/*.ts",
            "--watch-exclude",
            "**/fixtures/**",
            "--no-progress",
            "--notifications",
            "--batch-size",
            "20",
            "--rate-limit-delay",
            "250",
            "--locale",
            "de",
        ]);
        let overrides = args.overrides(Verbosity::Quiet);

        assert_eq!(overrides.debounce.delay, Some(750));
        assert_eq!(overrides.debounce.max_wait, Some(9000));
        assert_eq!(overrides.debounce.strategy, Some(StrategyKind::Adaptive));
        assert_eq!(overrides.patterns.include, vec!["locales/**/*.json", "src/**/*.ts"]);
        assert_eq!(overrides.patterns.exclude, vec!["**/fixtures/**"]);
        assert_eq!(overrides.monitoring.enable_progress_indicators, Some(false));
        assert_eq!(overrides.monitoring.enable_notifications, Some(true));
        assert_eq!(overrides.monitoring.enable_sound, None);
        assert_eq!(overrides.monitoring.log_level, Some(LogLevel::Silent));
        assert_eq!(overrides.performance.batch_size, Some(20));
        assert_eq!(overrides.performance.rate_limit_delay, Some(250));
        assert_eq!(args.locales, vec!["de"]);
    }

    #[test]
    fn test_unset_flags_leave_file_values_alone() {
        let overrides = parse(&[]).overrides(Verbosity::Normal);
        assert_eq!(overrides, WatchOverrides::default());
    }

    #[test]
    fn test_progress_flags() {
        let on = parse(&["--progress"]).overrides(Verbosity::Normal);
        assert_eq!(on.monitoring.enable_progress_indicators, Some(true));
        let last_wins = parse(&["--no-progress", "--progress"]);
        assert!(last_wins.progress && !last_wins.no_progress);
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        assert!(Harness::try_parse_from(["relocale", "--debounce-strategy", "eager"]).is_err());
    }
}
