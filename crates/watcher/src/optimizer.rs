//! Watch-set optimisation for large workspaces
//!
//! The workspace file count is sampled once. Above the configured threshold
//! the optimizer enters large-repository mode: shorter cache lifetimes, a
//! lower watched-file cap, and filtering of oversized or obviously
//! non-translation files.

use crate::patterns::PatternResolver;
use ahash::AHashMap;
use parking_lot::Mutex;
use relocale_core::{digest_strings, now_ms, BatchPriority, Cache, CacheConfig, CacheStatistics, FileChangeEvent};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const RESCAN_INTERVAL: Duration = Duration::from_secs(300);
const LARGE_FILE_BYTES: u64 = 1024 * 1024;
const MAX_CHANGES_PER_DIR: usize = 5;
const MIN_CHANGES_TO_OPTIMIZE: usize = 10;

const TRANSLATION_EXTENSIONS: &[&str] = &["json", "yaml", "yml", "po", "pot", "xliff", "properties"];
const TRANSLATION_DIRS: &[&str] = &["locales", "translations", "i18n", "lang", "languages"];
const NON_TRANSLATION_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "svg", "ico", "mp4", "avi", "mov", "mp3", "wav", "pdf", "doc",
    "docx", "xls", "xlsx", "zip", "tar", "gz", "rar", "exe", "dll", "so", "dylib",
];
const SCAN_SKIP_DIRS: &[&str] = &["node_modules", ".git", "dist", "build", "coverage"];
const SCAN_SKIP_EXTENSIONS: &[&str] = &["log", "tmp"];

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub enable_intelligent_filtering: bool,
    pub enable_pattern_caching: bool,
    pub enable_metadata_caching: bool,
    pub max_watched_files: usize,
    pub cache_ttl: Duration,
    pub enable_adaptive_filtering: bool,
    /// File count above which large-repository mode kicks in
    pub large_repository_threshold: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enable_intelligent_filtering: true,
            enable_pattern_caching: true,
            enable_metadata_caching: true,
            max_watched_files: 1000,
            cache_ttl: Duration::from_secs(300),
            enable_adaptive_filtering: true,
            large_repository_threshold: 5000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteringStatistics {
    pub total_files_scanned: u64,
    pub filtered_files: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub average_filter_time_ms: f64,
    pub large_repository_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerStatistics {
    pub filtering: FilteringStatistics,
    pub pattern_cache: CacheStatistics,
    pub metadata_cache: CacheStatistics,
    pub repository_size: usize,
    pub is_large_repository: bool,
    pub last_scan: Option<u64>,
}

/// Why a file was kept or dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDecision {
    pub should_watch: bool,
    pub reason: &'static str,
    pub priority: BatchPriority,
}

impl FilterDecision {
    fn keep(reason: &'static str, priority: BatchPriority) -> Self {
        Self {
            should_watch: true,
            reason,
            priority,
        }
    }

    fn drop(reason: &'static str) -> Self {
        Self {
            should_watch: false,
            reason,
            priority: BatchPriority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct FileMetadata {
    size: u64,
    is_dir: bool,
    exists: bool,
}

fn extension(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

fn in_translation_dir(path: &Path) -> bool {
    path.components().any(|c| {
        let name = c.as_os_str().to_string_lossy().to_lowercase();
        TRANSLATION_DIRS.iter().any(|dir| name.contains(dir))
    })
}

/// Translation file extension, or anywhere below a translation directory
pub fn is_translation_related(path: &Path) -> bool {
    let by_extension = extension(path).is_some_and(|ext| TRANSLATION_EXTENSIONS.contains(&ext.as_str()));
    by_extension || path.parent().is_some_and(in_translation_dir)
}

pub fn is_non_translation(path: &Path) -> bool {
    extension(path).is_some_and(|ext| NON_TRANSLATION_EXTENSIONS.contains(&ext.as_str()))
}

/// Count workspace files, skipping dependency and build output
///
/// Stops once the count exceeds `limit`.
pub fn count_repository_files(root: &Path, limit: usize) -> usize {
    let mut count = 0;
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && SCAN_SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping entry during repository scan: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if extension(entry.path()).is_some_and(|ext| SCAN_SKIP_EXTENSIONS.contains(&ext.as_str())) {
            continue;
        }
        count += 1;
        if count > limit {
            break;
        }
    }
    count
}

struct OptimizerState {
    config: OptimizerConfig,
    stats: FilteringStatistics,
    repository_size: usize,
    large: bool,
    last_scan: Option<(Instant, u64)>,
    filter_runs: u64,
}

/// Caches pattern expansion and trims the watch set for large workspaces
pub struct PerformanceOptimizer {
    resolver: PatternResolver,
    state: Mutex<OptimizerState>,
    pattern_cache: Cache<Vec<PathBuf>>,
    metadata_cache: Cache<FileMetadata>,
}

impl PerformanceOptimizer {
    pub fn new(root: impl Into<PathBuf>, config: OptimizerConfig) -> Self {
        let cache_config = CacheConfig {
            max_entries: config.max_watched_files,
            default_ttl: config.cache_ttl,
            max_size: 10 * 1024 * 1024,
            ..CacheConfig::default()
        };
        Self {
            resolver: PatternResolver::new(root),
            pattern_cache: Cache::new(cache_config.clone()),
            metadata_cache: Cache::new(CacheConfig {
                default_ttl: config.cache_ttl.min(Duration::from_secs(60)),
                ..cache_config
            }),
            state: Mutex::new(OptimizerState {
                config,
                stats: FilteringStatistics::default(),
                repository_size: 0,
                large: false,
                last_scan: None,
                filter_runs: 0,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    /// Sample the workspace size unless a recent sample exists
    pub fn analyze_repository(&self) -> usize {
        let threshold = {
            let state = self.state.lock();
            if !state.config.enable_adaptive_filtering {
                return state.repository_size;
            }
            if let Some((at, _)) = state.last_scan {
                if at.elapsed() < RESCAN_INTERVAL {
                    return state.repository_size;
                }
            }
            state.config.large_repository_threshold
        };

        let started = Instant::now();
        let size = count_repository_files(self.root(), threshold.saturating_mul(2));
        info!(
            "Repository analysis: {} files ({} ms)",
            size,
            started.elapsed().as_millis()
        );

        let mut state = self.state.lock();
        state.repository_size = size;
        state.last_scan = Some((Instant::now(), now_ms()));
        state.large = size > threshold;
        state.stats.large_repository_mode = state.large;
        if state.large {
            info!("Large repository detected, enabling performance optimizations");
            state.config.cache_ttl = state.config.cache_ttl.min(Duration::from_secs(180));
            state.config.max_watched_files = state.config.max_watched_files.min(500);
            state.config.enable_pattern_caching = true;
            state.config.enable_metadata_caching = true;
            state.config.enable_intelligent_filtering = true;
        }
        size
    }

    pub fn is_large_repository(&self) -> bool {
        self.state.lock().large
    }

    pub fn max_watched_files(&self) -> usize {
        self.state.lock().config.max_watched_files
    }

    /// Expand `patterns` to workspace-relative files, cached and filtered
    pub fn resolve_watch_patterns(&self, patterns: &[String]) -> Vec<PathBuf> {
        let started = Instant::now();
        if self.state.lock().last_scan.is_none() {
            self.analyze_repository();
        }
        let config = self.state.lock().config.clone();

        let mut sorted: Vec<&String> = patterns.iter().collect();
        sorted.sort();
        let set_key = format!("patterns:{}", digest_strings(sorted).short());

        if config.enable_pattern_caching {
            if let Some(cached) = self.pattern_cache.get(&set_key) {
                self.record(|stats| stats.cache_hits += 1);
                self.record_filter(cached.len(), cached.len(), started.elapsed());
                return cached;
            }
        }
        self.record(|stats| stats.cache_misses += 1);

        let mut resolved = Vec::new();
        for pattern in patterns {
            let key = format!("pattern:{pattern}");
            let cached = if config.enable_pattern_caching {
                self.pattern_cache.get(&key)
            } else {
                None
            };
            match cached {
                Some(files) => {
                    self.record(|stats| stats.cache_hits += 1);
                    resolved.extend(files);
                }
                None => {
                    self.record(|stats| stats.cache_misses += 1);
                    let files: Vec<PathBuf> =
                        self.resolver.expand_pattern(pattern).into_iter().map(PathBuf::from).collect();
                    if config.enable_pattern_caching {
                        self.store(&key, files.clone(), config.cache_ttl);
                    }
                    resolved.extend(files);
                }
            }
        }
        resolved.sort();
        resolved.dedup();

        let filtered = if config.enable_intelligent_filtering {
            self.apply_intelligent_filtering(&resolved, config.max_watched_files)
        } else {
            resolved.clone()
        };

        if config.enable_pattern_caching {
            self.store(&set_key, filtered.clone(), config.cache_ttl);
        }
        self.record_filter(resolved.len(), filtered.len(), started.elapsed());
        filtered
    }

    fn store(&self, key: &str, files: Vec<PathBuf>, ttl: Duration) {
        if let Err(e) = self.pattern_cache.set_with_ttl(key, files, Some(ttl)) {
            warn!("Failed to cache pattern result {}: {}", key, e);
        }
    }

    fn apply_intelligent_filtering(&self, files: &[PathBuf], max_watched: usize) -> Vec<PathBuf> {
        let mut kept = Vec::new();
        for file in files {
            if self.should_watch_file(file).should_watch {
                kept.push(file.clone());
            }
            if kept.len() >= max_watched {
                warn!("Reached maximum watched files limit ({})", max_watched);
                break;
            }
        }
        kept
    }

    fn metadata(&self, relative: &Path) -> FileMetadata {
        let key = format!("metadata:{}", relative.display());
        let caching = self.state.lock().config.enable_metadata_caching;
        if caching {
            if let Some(cached) = self.metadata_cache.get(&key) {
                return cached;
            }
        }

        let metadata = match std::fs::metadata(self.root().join(relative)) {
            Ok(m) => FileMetadata {
                size: m.len(),
                is_dir: m.is_dir(),
                exists: true,
            },
            Err(_) => FileMetadata::default(),
        };
        if caching {
            if let Err(e) = self.metadata_cache.set(key, metadata) {
                debug!("Failed to cache metadata: {}", e);
            }
        }
        metadata
    }

    /// Decide whether a workspace-relative file belongs in the watch set
    pub fn should_watch_file(&self, relative: &Path) -> FilterDecision {
        let metadata = self.metadata(relative);
        let large = self.is_large_repository();

        if !metadata.exists {
            return FilterDecision::drop("File does not exist");
        }
        if metadata.is_dir {
            return FilterDecision::drop("Is directory");
        }
        if large && metadata.size > LARGE_FILE_BYTES {
            return FilterDecision::drop("File too large for large repository mode");
        }
        if is_translation_related(relative) {
            return FilterDecision::keep("Translation-related file", BatchPriority::High);
        }
        if large && is_non_translation(relative) {
            return FilterDecision::drop("Non-translation file in large repository mode");
        }
        FilterDecision::keep("Default inclusion", BatchPriority::Medium)
    }

    /// Thin out a large burst: translation directories keep every change,
    /// other directories keep their first few
    pub fn optimize_file_change_detection(&self, changes: Vec<FileChangeEvent>) -> Vec<FileChangeEvent> {
        if !self.is_large_repository() || changes.len() < MIN_CHANGES_TO_OPTIMIZE {
            return changes;
        }

        let before = changes.len();
        let mut order: Vec<PathBuf> = Vec::new();
        let mut by_dir: AHashMap<PathBuf, Vec<FileChangeEvent>> = AHashMap::new();
        for change in changes {
            let dir = change.path.parent().map(Path::to_path_buf).unwrap_or_default();
            by_dir
                .entry(dir.clone())
                .or_insert_with(|| {
                    order.push(dir);
                    Vec::new()
                })
                .push(change);
        }

        let mut optimized = Vec::with_capacity(before);
        for dir in order {
            let Some(mut dir_changes) = by_dir.remove(&dir) else {
                continue;
            };
            let relative = dir.strip_prefix(self.root()).unwrap_or(&dir);
            if !in_translation_dir(relative) {
                dir_changes.truncate(MAX_CHANGES_PER_DIR);
            }
            optimized.extend(dir_changes);
        }

        if optimized.len() < before {
            debug!("Change detection reduced {} changes to {}", before, optimized.len());
        }
        optimized
    }

    fn record(&self, update: impl FnOnce(&mut FilteringStatistics)) {
        update(&mut self.state.lock().stats);
    }

    fn record_filter(&self, scanned: usize, kept: usize, elapsed: Duration) {
        let mut state = self.state.lock();
        state.filter_runs += 1;
        let runs = state.filter_runs as f64;
        let stats = &mut state.stats;
        stats.total_files_scanned += scanned as u64;
        stats.filtered_files += kept as u64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        stats.average_filter_time_ms = (stats.average_filter_time_ms * (runs - 1.0) + ms) / runs;
    }

    pub fn statistics(&self) -> OptimizerStatistics {
        let state = self.state.lock();
        OptimizerStatistics {
            filtering: state.stats.clone(),
            pattern_cache: self.pattern_cache.statistics(),
            metadata_cache: self.metadata_cache.statistics(),
            repository_size: state.repository_size,
            is_large_repository: state.large,
            last_scan: state.last_scan.map(|(_, ms)| ms),
        }
    }

    pub fn update_config(&self, config: OptimizerConfig) {
        let rescan = {
            let mut state = self.state.lock();
            let rescan = config.enable_adaptive_filtering != state.config.enable_adaptive_filtering;
            state.config = config;
            if rescan {
                state.last_scan = None;
            }
            rescan
        };
        if rescan {
            self.analyze_repository();
        }
    }

    /// Drop expired cache entries; returns how many went
    pub fn trim_caches(&self) -> usize {
        self.pattern_cache.cleanup() + self.metadata_cache.cleanup()
    }

    pub fn clear_caches(&self) {
        self.pattern_cache.clear();
        self.metadata_cache.clear();
        info!("Performance optimizer caches cleared");
    }

    pub fn destroy(&self) {
        self.pattern_cache.destroy();
        self.metadata_cache.destroy();
    }
}
