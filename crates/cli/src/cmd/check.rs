//! Dry run: resolve patterns and report what `watch` would observe

use crate::args::WatchArgs;
use crate::logging::Verbosity;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use relocale_core::load_configuration;
use relocale_watcher::optimizer::OptimizerConfig;
use relocale_watcher::patterns::{is_pattern_broad, validate_patterns};
use relocale_watcher::source::watch_roots;
use relocale_watcher::{PatternResolver, PerformanceOptimizer};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Files listed before the rest is summarised
const LISTED_FILES: usize = 20;

pub async fn run(args: WatchArgs, verbosity: Verbosity) -> Result<ExitCode> {
    let root = args.root()?;
    let root = root
        .canonicalize()
        .with_context(|| format!("Workspace {} does not exist", root.display()))?;
    let loaded = load_configuration(args.watch_config.as_deref(), &args.overrides(verbosity))?;
    let patterns = loaded.config.patterns.clone();

    let resolver = PatternResolver::new(&root);
    let locales = args.locales.clone();
    let resolved = tokio::task::spawn_blocking(move || resolver.resolve_watch_patterns(&patterns, &locales))
        .await
        .context("Pattern resolution panicked")?;

    println!("{}", "Watch check".bold());
    println!("Workspace:  {}", root.display().to_string().cyan());
    println!();

    println!("Include patterns:");
    if resolved.include.is_empty() {
        println!("  {}", "(none, the whole workspace is watched)".dimmed());
    }
    for pattern in &resolved.include {
        if is_pattern_broad(pattern) {
            println!("  {} {}", pattern, "(broad)".yellow());
        } else {
            println!("  {pattern}");
        }
    }
    for warning in validate_patterns(&resolved.include).warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }
    println!();

    let optimizer = Arc::new(PerformanceOptimizer::new(&root, OptimizerConfig::default()));
    let repository_size = {
        let optimizer = Arc::clone(&optimizer);
        tokio::task::spawn_blocking(move || optimizer.analyze_repository())
            .await
            .context("Repository analysis panicked")?
    };
    let files: Vec<PathBuf> = resolved.resolved.iter().map(PathBuf::from).collect();
    let roots = watch_roots(&root, &files);

    println!(
        "Matched files: {} of {} in the repository{}",
        files.len(),
        repository_size,
        if optimizer.is_large_repository() {
            " (large repository mode)".yellow().to_string()
        } else {
            String::new()
        }
    );
    for file in files.iter().take(LISTED_FILES) {
        println!("  {}", file.display());
    }
    if files.len() > LISTED_FILES {
        println!("  {}", format!("... and {} more", files.len() - LISTED_FILES).dimmed());
    }
    println!();

    println!("Watch locations:");
    for dir in &roots {
        println!("  {}", dir.display().to_string().cyan());
    }
    for warning in &loaded.warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }
    Ok(ExitCode::SUCCESS)
}
