//! Run the watch loop until a signal stops it

use crate::args::WatchArgs;
use crate::exec::CommandPipeline;
use crate::logging::Verbosity;
use anyhow::{bail, Result};
use chrono::Local;
use owo_colors::OwoColorize;
use relocale_watcher::{ShutdownOutcome, TracingFeedback, WatchOrchestrator};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn run(args: WatchArgs, verbosity: Verbosity) -> Result<ExitCode> {
    let options = args.options(verbosity)?;
    if args.exec.is_none() {
        warn!("No --exec command given; changes will be reported but nothing runs");
    }

    let pipeline = Arc::new(CommandPipeline::new(args.exec.clone()));
    let feedback = Arc::new(TracingFeedback::default());
    let orchestrator = WatchOrchestrator::new(options, pipeline, feedback);

    if let Err(e) = orchestrator.start().await {
        bail!("{}", e.message);
    }

    let status = orchestrator.status();
    if verbosity != Verbosity::Quiet {
        println!(
            "{} {} ({} file(s) in {} location(s))",
            "Watching".green().bold(),
            orchestrator.root().display().to_string().cyan(),
            status.watched_files,
            status.watch_roots.len()
        );
        println!(
            "  {}",
            format!("Started {}, press Ctrl+C to stop", Local::now().format("%H:%M:%S")).dimmed()
        );
    }

    let outcome = orchestrator.run_until_shutdown().await;
    match &outcome {
        ShutdownOutcome::Completed | ShutdownOutcome::AlreadyInProgress => info!("Watch stopped"),
        ShutdownOutcome::TimedOut => eprintln!("{}", "Shutdown timed out".red()),
        ShutdownOutcome::Failed(reason) => eprintln!("{} {}", "Shutdown failed:".red(), reason),
    }

    Ok(ExitCode::from(outcome.exit_code() as u8))
}
