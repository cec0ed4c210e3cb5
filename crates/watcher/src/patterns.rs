//! Watch pattern resolution
//!
//! Turns configured include/exclude globs into the concrete set of files to
//! watch. Globs use gitignore syntax: a pattern containing `/` is anchored at
//! the workspace root, one without matches at any depth.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use relocale_core::config::{ConfigValidation, PatternConfig, DEFAULT_EXCLUDES};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MAX_DEPTH: usize = 10;

/// Include and exclude patterns after substitution, with the files they matched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedPatterns {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Workspace-relative, `/`-separated, sorted
    pub resolved: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternStatistics {
    pub total_include_patterns: usize,
    pub total_exclude_patterns: usize,
    pub resolved_file_count: usize,
    pub average_files_per_pattern: usize,
    pub broad_pattern_count: usize,
}

/// Substitute every locale placeholder in `pattern`
///
/// `en-US` yields `en-US` for `[locale]`, `en_US` for `[locale_underscore]`
/// and `en` for `[locale_base]`.
pub fn replace_locale_placeholders(pattern: &str, locale: &str) -> String {
    let underscore = locale.replace('-', "_");
    let base = locale.split('-').next().unwrap_or(locale);

    pattern
        .replace("[locale_underscore]", &underscore)
        .replace("{locale_underscore}", &underscore)
        .replace("[locale_base]", base)
        .replace("{locale_base}", base)
        .replace("[locale]", locale)
        .replace("${locale}", locale)
        .replace("{locale}", locale)
}

fn has_locale_placeholder(pattern: &str) -> bool {
    ["[locale", "{locale", "${locale"]
        .iter()
        .any(|marker| pattern.contains(marker))
}

/// Forward slashes, no duplicate or trailing `/`, no leading `./`
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    for c in path.chars() {
        let c = if c == '\\' { '/' } else { c };
        if c == '/' && normalized.ends_with('/') {
            continue;
        }
        normalized.push(c);
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    match normalized.strip_prefix("./") {
        Some(rest) => rest.to_string(),
        None => normalized,
    }
}

/// Whether `pattern` is likely to match a large part of the tree
pub fn is_pattern_broad(pattern: &str) -> bool {
    pattern.starts_with("**") || pattern.matches("**").count() > 1 || pattern.matches('*').count() > 3
}

/// Check patterns for syntax errors and risky shapes
pub fn validate_patterns<S: AsRef<str>>(patterns: &[S]) -> ConfigValidation {
    let mut report = ConfigValidation::default();

    for pattern in patterns {
        let pattern = pattern.as_ref();
        if pattern.trim().is_empty() {
            report.errors.push("Empty pattern found".to_string());
            continue;
        }

        if let Err(e) = GitignoreBuilder::new("").add_line(None, pattern) {
            report
                .errors
                .push(format!("Invalid glob pattern '{pattern}': {e}"));
            continue;
        }

        let warnings = &mut report.warnings;
        if pattern.contains("**/**/**") {
            warnings.push(format!(
                "Pattern '{pattern}' may be overly broad and could impact performance"
            ));
        }
        if pattern.starts_with('/') && cfg!(windows) {
            warnings.push(format!(
                "Pattern '{pattern}' uses absolute path which may not work on Windows"
            ));
        }
        if pattern.contains('\\') && !cfg!(windows) {
            warnings.push(format!(
                "Pattern '{pattern}' contains backslashes which may not work on Unix systems"
            ));
        }
        if has_locale_placeholder(pattern) {
            warnings.push(format!("Pattern '{pattern}' contains unreplaced locale placeholder"));
        }
        if pattern.contains("..") {
            warnings.push(format!(
                "Pattern '{pattern}' contains parent directory references which may be unsafe"
            ));
        }
        if pattern.starts_with("**") && !pattern.contains('/') {
            warnings.push(format!(
                "Pattern '{pattern}' starts with ** without path separator, may match too broadly"
            ));
        }
        if pattern.ends_with('/') {
            warnings.push(format!(
                "Pattern '{pattern}' ends with slash, may not match files as expected"
            ));
        }
        let globstars = pattern.matches("**").count();
        if globstars > 2 {
            warnings.push(format!(
                "Pattern '{pattern}' has many recursive wildcards ({globstars}), may impact performance"
            ));
        }
    }

    report
}

fn compile(root: &Path, patterns: &[String]) -> Option<Gitignore> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GitignoreBuilder::new(root);
    builder.case_insensitive(cfg!(windows)).ok()?;
    for pattern in patterns {
        if let Err(e) = builder.add_line(None, pattern) {
            warn!("Skipping invalid pattern '{}': {}", pattern, e);
        }
    }
    match builder.build() {
        Ok(matcher) => Some(matcher),
        Err(e) => {
            warn!("Failed to compile watch patterns: {}", e);
            None
        }
    }
}

/// Compiled include/exclude matcher for hot-path filtering
#[derive(Debug, Clone)]
pub struct WatchFilter {
    root: PathBuf,
    include: Option<Gitignore>,
    exclude: Option<Gitignore>,
}

impl WatchFilter {
    pub fn new(root: &Path, include: &[String], exclude: &[String]) -> Self {
        let include: Vec<String> = include.iter().map(|p| normalize_path(p)).collect();
        let exclude: Vec<String> = exclude.iter().map(|p| normalize_path(p)).collect();
        Self {
            root: root.to_path_buf(),
            include: compile(root, &include),
            exclude: compile(root, &exclude),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        self.exclude
            .as_ref()
            .is_some_and(|m| hits(m, self.relative(path), is_dir))
    }

    /// Excludes win; with no include patterns every other file matches
    pub fn matches(&self, path: &Path) -> bool {
        if self.is_excluded(path, false) {
            return false;
        }
        match &self.include {
            Some(include) => hits(include, self.relative(path), false),
            None => true,
        }
    }
}

/// Match `path` or any of its parent directories
fn hits(matcher: &Gitignore, path: &Path, is_dir: bool) -> bool {
    if path.has_root() {
        // Outside the matcher root; parent walking would panic
        matcher.matched(path, is_dir).is_ignore()
    } else {
        matcher.matched_path_or_any_parents(path, is_dir).is_ignore()
    }
}

/// Expands watch patterns against a workspace root
#[derive(Debug, Clone)]
pub struct PatternResolver {
    root: PathBuf,
}

impl PatternResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Substitute locales, normalise, then expand and filter
    ///
    /// Every include pattern with a placeholder is expanded once per locale.
    /// The default excludes always apply on top of the configured ones.
    pub fn resolve_watch_patterns(&self, config: &PatternConfig, locales: &[String]) -> ResolvedPatterns {
        let mut prepared = self.prepare_patterns(config, locales);
        let expanded = self.expand_glob_patterns(&prepared.include);
        prepared.resolved = self.apply_filters(&expanded, &[], &prepared.exclude);
        debug!(
            "Resolved {} include patterns to {} files",
            prepared.include.len(),
            prepared.resolved.len()
        );
        prepared
    }

    /// Substitution and normalisation only; `resolved` stays empty
    pub fn prepare_patterns(&self, config: &PatternConfig, locales: &[String]) -> ResolvedPatterns {
        let mut include = Vec::new();
        for pattern in &config.include {
            if has_locale_placeholder(pattern) && !locales.is_empty() {
                for locale in locales {
                    include.push(normalize_path(&replace_locale_placeholders(pattern, locale)));
                }
            } else {
                include.push(normalize_path(pattern));
            }
        }
        dedup_in_place(&mut include);

        let mut exclude: Vec<String> = config.exclude.iter().map(|p| normalize_path(p)).collect();
        exclude.extend(DEFAULT_EXCLUDES.iter().map(|p| p.to_string()));
        dedup_in_place(&mut exclude);

        let all: Vec<&String> = include.iter().chain(exclude.iter()).collect();
        let validation = validate_patterns(&all);
        if !validation.is_valid() {
            warn!("Pattern validation errors: {}", validation.errors.join(", "));
        }

        ResolvedPatterns {
            include,
            exclude,
            resolved: Vec::new(),
        }
    }

    /// Files matched by one pattern, workspace-relative and sorted
    pub fn expand_pattern(&self, pattern: &str) -> Vec<String> {
        let pattern = normalize_path(pattern);
        let mut overrides = OverrideBuilder::new(&self.root);
        if let Err(e) = overrides.add(&pattern) {
            warn!("Failed to expand pattern '{}': {}", pattern, e);
            return Vec::new();
        }
        for exclude in DEFAULT_EXCLUDES {
            if let Err(e) = overrides.add(&format!("!{exclude}")) {
                debug!("Skipping walk exclude {}: {}", exclude, e);
            }
        }
        let overrides = match overrides.build() {
            Ok(o) => o,
            Err(e) => {
                warn!("Failed to expand pattern '{}': {}", pattern, e);
                return Vec::new();
            }
        };

        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .hidden(true)
            .max_depth(Some(MAX_DEPTH))
            .overrides(overrides)
            .build();

        let mut files: Vec<String> = walker
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Skipping unreadable entry while expanding '{}': {}", pattern, e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .ok()
                    .map(|p| normalize_path(&p.to_string_lossy()))
            })
            .collect();
        files.sort();
        files
    }

    /// Union of every pattern's expansion, deduplicated and sorted
    pub fn expand_glob_patterns(&self, patterns: &[String]) -> Vec<String> {
        patterns
            .iter()
            .flat_map(|p| self.expand_pattern(p))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn apply_filters(&self, files: &[String], include: &[String], exclude: &[String]) -> Vec<String> {
        let filter = WatchFilter::new(&self.root, include, exclude);
        files
            .iter()
            .map(|f| normalize_path(f))
            .filter(|f| filter.matches(Path::new(f)))
            .collect()
    }

    pub fn should_watch_file(&self, path: &Path, include: &[String], exclude: &[String]) -> bool {
        WatchFilter::new(&self.root, include, exclude).matches(path)
    }

    pub fn statistics(&self, resolved: &ResolvedPatterns) -> PatternStatistics {
        let includes = resolved.include.len();
        let average = if includes > 0 {
            (resolved.resolved.len() as f64 / includes as f64).round() as usize
        } else {
            0
        };
        PatternStatistics {
            total_include_patterns: includes,
            total_exclude_patterns: resolved.exclude.len(),
            resolved_file_count: resolved.resolved.len(),
            average_files_per_pattern: average,
            broad_pattern_count: resolved.include.iter().filter(|p| is_pattern_broad(p)).count(),
        }
    }
}

fn dedup_in_place(patterns: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    patterns.retain(|p| seen.insert(p.clone()));
}
