//! Show or validate the merged watch configuration

use crate::args::WatchArgs;
use crate::logging::Verbosity;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use relocale_core::{load_config_file, merge_with_defaults, ConfigError};
use std::process::ExitCode;

/// Print the configuration that `watch` would run with
pub fn run_show(args: WatchArgs, verbosity: Verbosity) -> Result<ExitCode> {
    let file = args
        .watch_config
        .as_deref()
        .map(load_config_file)
        .transpose()?;
    let config = merge_with_defaults(file.as_ref(), &args.overrides(verbosity));

    let rendered = serde_json::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{rendered}");

    let report = config.validate();
    for error in &report.errors {
        eprintln!("{} {}", "error:".red().bold(), error);
    }
    for warning in &report.warnings {
        eprintln!("{} {}", "warning:".yellow().bold(), warning);
    }
    Ok(ExitCode::SUCCESS)
}

pub fn run_validate(args: WatchArgs, verbosity: Verbosity) -> Result<ExitCode> {
    let file = match args.watch_config.as_deref().map(load_config_file).transpose() {
        Ok(file) => file,
        Err(e @ (ConfigError::Io { .. } | ConfigError::Parse { .. })) => {
            eprintln!("{} {}", "✗".red(), e);
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };
    let config = merge_with_defaults(file.as_ref(), &args.overrides(verbosity));
    let report = config.validate();

    for warning in &report.warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }
    if !report.is_valid() {
        for error in &report.errors {
            println!("{} {}", "✗".red(), error);
        }
        return Ok(ExitCode::FAILURE);
    }

    match &args.watch_config {
        Some(path) => println!("{} {} is valid", "✓".green(), path.display()),
        None => println!("{} Configuration is valid", "✓".green()),
    }
    Ok(ExitCode::SUCCESS)
}
