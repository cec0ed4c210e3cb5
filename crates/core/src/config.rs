//! Watch configuration
//!
//! Three layers, highest precedence first:
//! 1. CLI overrides
//! 2. Config file (`watch` key of a JSON, YAML or TOML document)
//! 3. Built-in defaults
//!
//! Include/exclude pattern lists are the exception: file and CLI entries
//! concatenate, and an empty exclude list falls back to the defaults.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Globs excluded from watching unless the user supplies their own
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/node_modules/**",
    "**/.git/**",
    "**/dist/**",
    "**/build/**",
    "**/*.tmp",
    "**/*.temp",
    "**/.DS_Store",
    "**/*.swp",
    "**/*.swo",
    "**/*~",
    "**/.#*",
];

/// Verbosity of user-facing feedback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    #[default]
    Minimal,
    Verbose,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogLevel::Silent => "silent",
            LogLevel::Minimal => "minimal",
            LogLevel::Verbose => "verbose",
        })
    }
}

/// Debounce strategy family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Simple,
    Adaptive,
    Batch,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StrategyKind::Simple => "simple",
            StrategyKind::Adaptive => "adaptive",
            StrategyKind::Batch => "batch",
        })
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Ok(StrategyKind::Simple),
            "adaptive" => Ok(StrategyKind::Adaptive),
            "batch" => Ok(StrategyKind::Batch),
            other => Err(format!("unknown debounce strategy '{other}' (expected simple, adaptive or batch)")),
        }
    }
}

/// Tuning knobs of the adaptive strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdaptiveTuning {
    /// Changes per second above which the delay stretches
    pub frequency_threshold: f64,
    /// Upper bound of the stretch factor added to 1
    pub max_multiplier: f64,
    /// Floor of the shortened delay after long idle periods (ms)
    pub min_delay: u64,
    /// Length of the trailing frequency window (ms)
    pub window: u64,
    /// Maximum timestamps kept in the frequency window
    pub window_size: usize,
}

impl Default for AdaptiveTuning {
    fn default() -> Self {
        Self {
            frequency_threshold: 5.0,
            max_multiplier: 3.0,
            min_delay: 100,
            window: 5000,
            window_size: 10,
        }
    }
}

/// Fully resolved debounce strategy
#[derive(Debug, Clone, PartialEq)]
pub struct DebounceStrategy {
    pub kind: StrategyKind,
    pub delay: Duration,
    pub max_wait: Option<Duration>,
    pub batch_size: Option<usize>,
    pub rate_limit_delay: Option<Duration>,
    pub tuning: AdaptiveTuning,
}

impl DebounceStrategy {
    pub fn simple(delay: Duration) -> Self {
        Self {
            kind: StrategyKind::Simple,
            delay,
            max_wait: None,
            batch_size: None,
            rate_limit_delay: None,
            tuning: AdaptiveTuning::default(),
        }
    }

    pub fn adaptive(delay: Duration, max_wait: Option<Duration>) -> Self {
        Self {
            kind: StrategyKind::Adaptive,
            max_wait,
            ..Self::simple(delay)
        }
    }

    pub fn batch(delay: Duration, batch_size: usize) -> Self {
        Self {
            kind: StrategyKind::Batch,
            batch_size: Some(batch_size),
            ..Self::simple(delay)
        }
    }

    pub fn with_rate_limit(mut self, rate_limit_delay: Duration) -> Self {
        self.rate_limit_delay = Some(rate_limit_delay);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebounceConfig {
    /// Quiet period in milliseconds
    pub delay: u64,
    /// Soft ceiling on how long a change may wait (ms)
    pub max_wait: Option<u64>,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub adaptive: AdaptiveTuning,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            delay: 5000,
            max_wait: Some(30000),
            strategy: StrategyKind::Simple,
            adaptive: AdaptiveTuning::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    pub enable_progress_indicators: bool,
    pub enable_notifications: bool,
    #[serde(default)]
    pub enable_sound: bool,
    pub log_level: LogLevel,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_progress_indicators: true,
            enable_notifications: false,
            enable_sound: false,
            log_level: LogLevel::Minimal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceConfig {
    pub batch_size: usize,
    /// Milliseconds between rate-limited sub-batches
    pub rate_limit_delay: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            rate_limit_delay: 100,
        }
    }
}

/// Version-control awareness settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitConfig {
    pub enabled: bool,
    /// Window in which related changes belong to one operation (ms)
    pub operation_time_window: u64,
    /// Changes after which an operation counts as bulk
    pub bulk_operation_threshold: usize,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            operation_time_window: 2000,
            bulk_operation_threshold: 5,
        }
    }
}

/// Circuit breaker, degradation and shutdown settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceConfig {
    /// Errors tolerated inside the window before the breaker opens
    pub circuit_breaker_threshold: u32,
    /// Rolling window of the global error counter (ms)
    pub circuit_breaker_window: u64,
    /// Fraction of the next-better level's thresholds required to recover
    pub degradation_safety_margin: f64,
    /// Shutdown deadline (ms), clamped to 1s..=60s at use
    pub shutdown_timeout: u64,
    /// Period of the background health probe (ms)
    pub health_check_interval: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: 10,
            circuit_breaker_window: 5 * 60 * 1000,
            degradation_safety_margin: 0.5,
            shutdown_timeout: 10_000,
            health_check_interval: 30_000,
        }
    }
}

/// Complete watch configuration snapshot
///
/// Treated as immutable once built; updates go through validation and
/// replace the whole value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfiguration {
    pub patterns: PatternConfig,
    pub debounce: DebounceConfig,
    pub monitoring: MonitoringConfig,
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

/// Outcome of validating a configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl WatchConfiguration {
    /// Check ranges and collect advisory warnings
    pub fn validate(&self) -> ConfigValidation {
        let mut report = ConfigValidation::default();
        let errors = &mut report.errors;

        let delay = self.debounce.delay;
        if !(100..=60_000).contains(&delay) {
            errors.push(format!(
                "debounce.delay: must be between 100 and 60000 ms (got {delay})"
            ));
        }
        if let Some(max_wait) = self.debounce.max_wait {
            if max_wait <= delay {
                errors.push("debounce.maxWait: maxWait must be greater than delay".to_string());
            }
        }

        let tuning = &self.debounce.adaptive;
        if !(tuning.frequency_threshold > 0.0) {
            errors.push("debounce.adaptive.frequencyThreshold: must be positive".to_string());
        }
        if !(tuning.max_multiplier >= 0.0) {
            errors.push("debounce.adaptive.maxMultiplier: must not be negative".to_string());
        }
        if tuning.window == 0 {
            errors.push("debounce.adaptive.window: must be positive".to_string());
        }
        if tuning.window_size < 2 {
            errors.push("debounce.adaptive.windowSize: must be at least 2".to_string());
        }

        let batch_size = self.performance.batch_size;
        if !(1..=1000).contains(&batch_size) {
            errors.push(format!(
                "performance.batchSize: must be between 1 and 1000 (got {batch_size})"
            ));
        }
        if self.performance.rate_limit_delay > 5000 {
            errors.push(format!(
                "performance.rateLimitDelay: must be between 0 and 5000 ms (got {})",
                self.performance.rate_limit_delay
            ));
        }

        if self.git.operation_time_window == 0 {
            errors.push("git.operationTimeWindow: must be positive".to_string());
        }
        if self.git.bulk_operation_threshold == 0 {
            errors.push("git.bulkOperationThreshold: must be positive".to_string());
        }

        let margin = self.resilience.degradation_safety_margin;
        if !(margin > 0.0 && margin <= 1.0) {
            errors.push(format!(
                "resilience.degradationSafetyMargin: must be in (0, 1] (got {margin})"
            ));
        }
        if self.resilience.circuit_breaker_threshold == 0 {
            errors.push("resilience.circuitBreakerThreshold: must be positive".to_string());
        }
        if self.resilience.circuit_breaker_window == 0 {
            errors.push("resilience.circuitBreakerWindow: must be positive".to_string());
        }

        if !report.errors.is_empty() {
            return report;
        }

        let warnings = &mut report.warnings;
        if self.patterns.include.is_empty() {
            warnings.push("No include patterns specified, will use locale-based defaults".to_string());
        }
        for pattern in self.patterns.include.iter().chain(self.patterns.exclude.iter()) {
            warnings.extend(pattern_warnings(pattern));
        }
        if batch_size > 100 {
            warnings.push("Large batch size may impact performance".to_string());
        }
        if delay < 1000 {
            warnings.push("Short debounce delay may cause excessive retranslations".to_string());
        }

        report
    }

    /// Validate, returning warnings on success
    pub fn ensure_valid(&self) -> Result<Vec<String>, ConfigError> {
        let report = self.validate();
        if report.is_valid() {
            Ok(report.warnings)
        } else {
            Err(ConfigError::Invalid(report.errors))
        }
    }

    /// Build the debounce strategy described by this configuration
    pub fn debounce_strategy(&self) -> DebounceStrategy {
        let rate_limit = self.performance.rate_limit_delay;
        DebounceStrategy {
            kind: self.debounce.strategy,
            delay: Duration::from_millis(self.debounce.delay),
            max_wait: self.debounce.max_wait.map(Duration::from_millis),
            batch_size: Some(self.performance.batch_size),
            rate_limit_delay: (rate_limit > 0).then(|| Duration::from_millis(rate_limit)),
            tuning: self.debounce.adaptive,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.resilience.shutdown_timeout)
    }
}

fn pattern_warnings(pattern: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if pattern.trim().is_empty() {
        warnings.push("Empty pattern found".to_string());
        return warnings;
    }
    if pattern.contains("**/**/**") {
        warnings.push(format!(
            "Pattern '{pattern}' may be overly broad and could impact performance"
        ));
    }
    if pattern.contains("[locale]") {
        warnings.push(format!("Pattern '{pattern}' contains unreplaced [locale] placeholder"));
    }
    if pattern.contains('\\') && !cfg!(windows) {
        warnings.push(format!(
            "Pattern '{pattern}' contains backslashes which may not work on Unix systems"
        ));
    }
    warnings
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatternOverrides {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebounceOverrides {
    pub delay: Option<u64>,
    pub max_wait: Option<u64>,
    pub strategy: Option<StrategyKind>,
    pub adaptive: Option<AdaptiveTuning>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringOverrides {
    pub enable_progress_indicators: Option<bool>,
    pub enable_notifications: Option<bool>,
    pub enable_sound: Option<bool>,
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceOverrides {
    pub batch_size: Option<usize>,
    pub rate_limit_delay: Option<u64>,
}

/// Partial configuration used for both the file layer and the CLI layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchOverrides {
    pub patterns: PatternOverrides,
    pub debounce: DebounceOverrides,
    pub monitoring: MonitoringOverrides,
    pub performance: PerformanceOverrides,
    pub git: Option<GitConfig>,
    pub resilience: Option<ResilienceConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    watch: Option<WatchOverrides>,
}

/// Merge layers into a total configuration
///
/// Scalars: CLI, then file, then default. Pattern lists: file entries
/// followed by CLI entries; an empty exclude list means the defaults.
pub fn merge_with_defaults(file: Option<&WatchOverrides>, cli: &WatchOverrides) -> WatchConfiguration {
    let empty = WatchOverrides::default();
    let file = file.unwrap_or(&empty);
    let defaults = WatchConfiguration::default();

    let include: Vec<String> = file
        .patterns
        .include
        .iter()
        .chain(cli.patterns.include.iter())
        .cloned()
        .collect();
    let mut exclude: Vec<String> = file
        .patterns
        .exclude
        .iter()
        .chain(cli.patterns.exclude.iter())
        .cloned()
        .collect();
    if exclude.is_empty() {
        exclude = defaults.patterns.exclude.clone();
    }

    let pick = |cli: Option<u64>, file: Option<u64>, default: u64| cli.or(file).unwrap_or(default);

    WatchConfiguration {
        patterns: PatternConfig { include, exclude },
        debounce: DebounceConfig {
            delay: pick(cli.debounce.delay, file.debounce.delay, defaults.debounce.delay),
            max_wait: cli
                .debounce
                .max_wait
                .or(file.debounce.max_wait)
                .or(defaults.debounce.max_wait),
            strategy: cli
                .debounce
                .strategy
                .or(file.debounce.strategy)
                .unwrap_or(defaults.debounce.strategy),
            adaptive: cli
                .debounce
                .adaptive
                .or(file.debounce.adaptive)
                .unwrap_or(defaults.debounce.adaptive),
        },
        monitoring: MonitoringConfig {
            enable_progress_indicators: cli
                .monitoring
                .enable_progress_indicators
                .or(file.monitoring.enable_progress_indicators)
                .unwrap_or(defaults.monitoring.enable_progress_indicators),
            enable_notifications: cli
                .monitoring
                .enable_notifications
                .or(file.monitoring.enable_notifications)
                .unwrap_or(defaults.monitoring.enable_notifications),
            enable_sound: cli
                .monitoring
                .enable_sound
                .or(file.monitoring.enable_sound)
                .unwrap_or(defaults.monitoring.enable_sound),
            log_level: cli
                .monitoring
                .log_level
                .or(file.monitoring.log_level)
                .unwrap_or(defaults.monitoring.log_level),
        },
        performance: PerformanceConfig {
            batch_size: cli
                .performance
                .batch_size
                .or(file.performance.batch_size)
                .unwrap_or(defaults.performance.batch_size),
            rate_limit_delay: pick(
                cli.performance.rate_limit_delay,
                file.performance.rate_limit_delay,
                defaults.performance.rate_limit_delay,
            ),
        },
        git: cli.git.clone().or_else(|| file.git.clone()).unwrap_or(defaults.git),
        resilience: cli
            .resilience
            .clone()
            .or_else(|| file.resilience.clone())
            .unwrap_or(defaults.resilience),
    }
}

/// Parse the `watch` section of a config file
///
/// Format follows the extension (`.json`, `.yaml`/`.yml`, `.toml`); other
/// extensions try JSON, then YAML.
pub fn load_config_file(path: &Path) -> Result<WatchOverrides, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(path, &content)
}

fn parse_config(path: &Path, content: &str) -> Result<WatchOverrides, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let file: ConfigFile = match extension.as_deref() {
        Some("json") => serde_json::from_str(content).map_err(|e| parse_err(e.to_string()))?,
        Some("yaml") | Some("yml") => {
            serde_yaml_ng::from_str(content).map_err(|e| parse_err(e.to_string()))?
        }
        Some("toml") => toml::from_str(content).map_err(|e| parse_err(e.to_string()))?,
        _ => match serde_json::from_str(content) {
            Ok(file) => file,
            Err(json_err) => serde_yaml_ng::from_str(content).map_err(|yaml_err| {
                parse_err(format!("not valid JSON ({json_err}) or YAML ({yaml_err})"))
            })?,
        },
    };

    Ok(file.watch.unwrap_or_default())
}

/// Loaded and validated configuration
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: WatchConfiguration,
    pub warnings: Vec<String>,
}

/// Load the optional file, merge with CLI overrides and validate
pub fn load_configuration(
    config_path: Option<&Path>,
    cli: &WatchOverrides,
) -> Result<LoadedConfig, ConfigError> {
    let file = config_path.map(load_config_file).transpose()?;
    let config = merge_with_defaults(file.as_ref(), cli);
    let warnings = config.ensure_valid()?;
    for warning in &warnings {
        tracing::warn!("Watch configuration: {}", warning);
    }
    Ok(LoadedConfig { config, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = WatchConfiguration::default();
        let report = config.validate();
        assert!(report.is_valid(), "{:?}", report.errors);
        assert_eq!(config.debounce.delay, 5000);
        assert_eq!(config.debounce.max_wait, Some(30000));
        assert_eq!(config.monitoring.log_level, LogLevel::Minimal);
        assert_eq!(config.performance.batch_size, 50);
        assert_eq!(config.performance.rate_limit_delay, 100);
        assert!(config.patterns.exclude.contains(&"**/.git/**".to_string()));
        // No include patterns is only a warning
        assert!(report.warnings.iter().any(|w| w.contains("No include patterns")));
    }

    #[test]
    fn test_range_errors() {
        let mut config = WatchConfiguration::default();
        config.debounce.delay = 50;
        config.debounce.max_wait = None;
        config.performance.batch_size = 0;
        config.performance.rate_limit_delay = 6000;

        let report = config.validate();
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors[0].starts_with("debounce.delay"));
        assert!(report.errors[1].starts_with("performance.batchSize"));
        assert!(report.errors[2].starts_with("performance.rateLimitDelay"));
        assert!(matches!(config.ensure_valid(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_max_wait_must_exceed_delay() {
        let mut config = WatchConfiguration::default();
        config.debounce.delay = 2000;
        config.debounce.max_wait = Some(2000);
        let report = config.validate();
        assert_eq!(report.errors, vec!["debounce.maxWait: maxWait must be greater than delay"]);
    }

    #[test]
    fn test_warnings() {
        let mut config = WatchConfiguration::default();
        config.patterns.include = vec!["locales/[locale].json".into(), "a/**/**/**/b".into()];
        config.performance.batch_size = 200;
        config.debounce.delay = 500;

        let warnings = config.ensure_valid().unwrap();
        assert!(warnings.iter().any(|w| w.contains("unreplaced [locale]")));
        assert!(warnings.iter().any(|w| w.contains("overly broad")));
        assert!(warnings.iter().any(|w| w.contains("Large batch size")));
        assert!(warnings.iter().any(|w| w.contains("Short debounce delay")));
    }

    #[test]
    fn test_merge_precedence_cli_over_file_over_defaults() {
        let file = WatchOverrides {
            debounce: DebounceOverrides {
                delay: Some(2000),
                max_wait: Some(9000),
                ..Default::default()
            },
            performance: PerformanceOverrides {
                batch_size: Some(20),
                ..Default::default()
            },
            ..Default::default()
        };
        let cli = WatchOverrides {
            debounce: DebounceOverrides {
                delay: Some(3000),
                strategy: Some(StrategyKind::Batch),
                ..Default::default()
            },
            monitoring: MonitoringOverrides {
                log_level: Some(LogLevel::Silent),
                ..Default::default()
            },
            ..Default::default()
        };

        let config = merge_with_defaults(Some(&file), &cli);
        assert_eq!(config.debounce.delay, 3000);
        assert_eq!(config.debounce.max_wait, Some(9000));
        assert_eq!(config.debounce.strategy, StrategyKind::Batch);
        assert_eq!(config.performance.batch_size, 20);
        assert_eq!(config.performance.rate_limit_delay, 100);
        assert_eq!(config.monitoring.log_level, LogLevel::Silent);
        assert!(config.monitoring.enable_progress_indicators);
    }

    #[test]
    fn test_merge_concatenates_patterns() {
        let file = WatchOverrides {
            patterns: PatternOverrides {
                include: vec!["locales/en.json".into()],
                exclude: vec![],
            },
            ..Default::default()
        };
        let cli = WatchOverrides {
            patterns: PatternOverrides {
                include: vec!["i18n/*.yml".into()],
                exclude: vec!["**/vendor/**".into()],
            },
            ..Default::default()
        };

        let config = merge_with_defaults(Some(&file), &cli);
        assert_eq!(config.patterns.include, vec!["locales/en.json", "i18n/*.yml"]);
        assert_eq!(config.patterns.exclude, vec!["**/vendor/**"]);

        let config = merge_with_defaults(None, &WatchOverrides::default());
        assert_eq!(config.patterns.exclude.len(), DEFAULT_EXCLUDES.len());
    }

    #[test]
    fn test_zero_rate_limit_is_honoured() {
        let cli = WatchOverrides {
            performance: PerformanceOverrides {
                rate_limit_delay: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = merge_with_defaults(None, &cli);
        assert_eq!(config.performance.rate_limit_delay, 0);
        assert_eq!(config.debounce_strategy().rate_limit_delay, None);
    }

    #[test]
    fn test_load_json_yaml_and_toml() {
        let temp_dir = TempDir::new().unwrap();

        let json = temp_dir.path().join("relocale.json");
        fs::write(
            &json,
            r#"{"version": 1, "watch": {"debounce": {"delay": 1500}, "monitoring": {"logLevel": "verbose"}}}"#,
        )
        .unwrap();
        let overrides = load_config_file(&json).unwrap();
        assert_eq!(overrides.debounce.delay, Some(1500));
        assert_eq!(overrides.monitoring.log_level, Some(LogLevel::Verbose));

        let yaml = temp_dir.path().join("relocale.yaml");
        fs::write(
            &yaml,
            "watch:\n  patterns:\n    include:\n      - locales/*.json\n  performance:\n    batchSize: 10\n",
        )
        .unwrap();
        let overrides = load_config_file(&yaml).unwrap();
        assert_eq!(overrides.patterns.include, vec!["locales/*.json"]);
        assert_eq!(overrides.performance.batch_size, Some(10));

        let toml_path = temp_dir.path().join("relocale.toml");
        fs::write(&toml_path, "[watch.debounce]\ndelay = 800\nstrategy = \"adaptive\"\n").unwrap();
        let overrides = load_config_file(&toml_path).unwrap();
        assert_eq!(overrides.debounce.delay, Some(800));
        assert_eq!(overrides.debounce.strategy, Some(StrategyKind::Adaptive));
    }

    #[test]
    fn test_unknown_extension_falls_back_to_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("relocalerc");
        fs::write(&path, "watch:\n  debounce:\n    delay: 1200\n").unwrap();
        assert_eq!(load_config_file(&path).unwrap().debounce.delay, Some(1200));
    }

    #[test]
    fn test_file_without_watch_key_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{"buckets": {}}"#).unwrap();
        assert_eq!(load_config_file(&path).unwrap(), WatchOverrides::default());
    }

    #[test]
    fn test_load_configuration_rejects_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        fs::write(&path, r#"{"watch": {"debounce": {"delay": 10}}}"#).unwrap();

        let err = load_configuration(Some(&path), &WatchOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("debounce.delay"));

        let missing = load_configuration(Some(&temp_dir.path().join("nope.json")), &WatchOverrides::default());
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Adaptive".parse::<StrategyKind>().unwrap(), StrategyKind::Adaptive);
        assert!("eager".parse::<StrategyKind>().is_err());
    }
}
