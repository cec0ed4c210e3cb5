//! relocale CLI - re-run localization when sources change

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod args;
mod cmd;
mod exec;
mod logging;

use args::WatchArgs;
use logging::Verbosity;

/// relocale - keep translations in step with your sources
#[derive(Parser)]
#[command(name = "relocale")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Debug logging and verbose feedback
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Errors only, no feedback output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the workspace and re-run the pipeline on changes
    Watch(WatchArgs),
    /// Inspect the merged watch configuration
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Resolve watch patterns and show what would be watched
    Check(WatchArgs),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the merged configuration
    Show(WatchArgs),
    /// Validate the configuration and report problems
    Validate(WatchArgs),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let verbosity = Verbosity::from_flags(cli.verbose, cli.quiet);

    // Keeps the non-blocking log writer flushing until exit
    let _guard = logging::init(verbosity, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Watch(args) => cmd::watch::run(args, verbosity).await,
        Commands::Config(ConfigCommands::Show(args)) => cmd::config::run_show(args, verbosity),
        Commands::Config(ConfigCommands::Validate(args)) => cmd::config::run_validate(args, verbosity),
        Commands::Check(args) => cmd::check::run(args, verbosity).await,
    }
}
