//! Shell-command retranslation pipeline
//!
//! `--exec` names a command that does the actual translation work. It runs
//! once per debounced batch in the workspace root and learns what changed
//! from `RELOCALE_CHANGED_FILES` (newline-separated, workspace-relative).

use anyhow::{Context, Result};
use async_trait::async_trait;
use relocale_watcher::{ExecutionReport, RetranslationPipeline, RunContext, Task, TaskOutcome};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Lines of stderr kept in a failure message
const STDERR_TAIL_LINES: usize = 5;

pub struct CommandPipeline {
    command: Option<String>,
}

impl CommandPipeline {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }

    fn shell(command: &str) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
    }

    async fn run(&self, command: &str, ctx: &RunContext, task: &Task) -> Result<TaskOutcome> {
        let changed = task
            .files
            .iter()
            .map(|p| relative(&ctx.root, p).to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("\n");

        debug!("Run {}: executing `{}`", ctx.run_id, command);
        let output = Self::shell(command)
            .current_dir(&ctx.root)
            .env("RELOCALE_CHANGED_FILES", changed)
            .env("RELOCALE_RUN_ID", ctx.run_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn `{command}`"))?;

        if output.status.success() {
            return Ok(TaskOutcome {
                task_id: task.id.clone(),
                success: true,
                error: None,
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let tail = tail[tail.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
        let error = if tail.is_empty() {
            match output.status.code() {
                Some(code) => format!("`{command}` exited with status {code}"),
                None => format!("`{command}` was terminated by a signal"),
            }
        } else {
            tail
        };

        Ok(TaskOutcome {
            task_id: task.id.clone(),
            success: false,
            error: Some(error),
        })
    }
}

fn relative<'a>(root: &Path, path: &'a Path) -> &'a Path {
    path.strip_prefix(root).unwrap_or(path)
}

#[async_trait]
impl RetranslationPipeline for CommandPipeline {
    async fn plan(&self, ctx: &RunContext) -> Result<Vec<Task>> {
        let Some(command) = &self.command else {
            return Ok(Vec::new());
        };
        Ok(vec![Task {
            id: "exec".to_string(),
            description: command.clone(),
            files: ctx.changed_files.clone(),
        }])
    }

    async fn execute(&self, ctx: &RunContext, tasks: Vec<Task>) -> Result<ExecutionReport> {
        let Some(command) = &self.command else {
            return Ok(ExecutionReport::default());
        };
        let mut report = ExecutionReport::default();
        for task in &tasks {
            report.outcomes.push(self.run(command, ctx, task).await?);
        }
        Ok(report)
    }
}
