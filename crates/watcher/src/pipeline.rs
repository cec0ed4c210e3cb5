//! Downstream retranslation pipeline
//!
//! A run has two phases: `plan` turns the changed files into tasks and
//! `execute` carries them out. Both phases pass through the resource
//! manager so downstream work is admission-controlled.

use crate::feedback::{Feedback, RetranslationResult, TranslationProgress};
use crate::resources::{ResourceError, ResourceManager};
use async_trait::async_trait;
use relocale_core::{now_ms, WatchError};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};
use ulid::Ulid;

/// Admission priority of pipeline phases
pub const PIPELINE_PRIORITY: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: Ulid,
    pub root: PathBuf,
    pub changed_files: Vec<PathBuf>,
    pub started_at: u64,
}

impl RunContext {
    pub fn new(root: impl Into<PathBuf>, changed_files: Vec<PathBuf>) -> Self {
        Self {
            run_id: Ulid::new(),
            root: root.into(),
            changed_files,
            started_at: now_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl ExecutionReport {
    pub fn tasks_completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    pub fn errors(&self) -> Vec<WatchError> {
        self.outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| {
                WatchError::translation(format!(
                    "Task {} failed: {}",
                    o.task_id,
                    o.error.as_deref().unwrap_or("unknown error")
                ))
            })
            .collect()
    }
}

#[async_trait]
pub trait RetranslationPipeline: Send + Sync {
    async fn plan(&self, ctx: &RunContext) -> anyhow::Result<Vec<Task>>;
    async fn execute(&self, ctx: &RunContext, tasks: Vec<Task>) -> anyhow::Result<ExecutionReport>;
}

fn pipeline_failure(phase: &str, err: ResourceError) -> WatchError {
    let message = match err {
        ResourceError::OperationFailed(e) => format!("Pipeline {phase} failed: {e:#}"),
        other => format!("Pipeline {phase} failed: {other}"),
    };
    WatchError::translation(message)
}

/// Plan and execute one run, reporting progress along the way
///
/// Never fails: pipeline errors come back inside the result.
pub async fn run_retranslation(
    pipeline: &dyn RetranslationPipeline,
    resources: &ResourceManager,
    feedback: &dyn Feedback,
    ctx: &RunContext,
) -> RetranslationResult {
    let started = Instant::now();
    feedback.retranslation_started(&ctx.changed_files);
    feedback.progress(&TranslationProgress {
        total_tasks: 2,
        completed_tasks: 0,
        current_task: Some("Planning translation tasks...".to_string()),
        estimated_remaining: None,
    });

    let planned = resources
        .execute_operation(PIPELINE_PRIORITY, || pipeline.plan(ctx))
        .await;
    let tasks = match planned {
        Ok(tasks) => tasks,
        Err(e) => {
            let result = RetranslationResult {
                success: false,
                duration: started.elapsed(),
                tasks_completed: 0,
                errors: vec![pipeline_failure("planning", e)],
            };
            feedback.retranslation_complete(&result);
            return result;
        }
    };

    if tasks.is_empty() {
        debug!("Run {} planned no tasks", ctx.run_id);
        let result = RetranslationResult {
            success: true,
            duration: started.elapsed(),
            tasks_completed: 0,
            errors: Vec::new(),
        };
        feedback.retranslation_complete(&result);
        return result;
    }

    let task_count = tasks.len();
    feedback.progress(&TranslationProgress {
        total_tasks: 2,
        completed_tasks: 1,
        current_task: Some(format!("Executing {task_count} translation task(s)...")),
        estimated_remaining: None,
    });

    let executed = resources
        .execute_operation(PIPELINE_PRIORITY, || pipeline.execute(ctx, tasks))
        .await;
    let result = match executed {
        Ok(report) => RetranslationResult {
            success: report.is_success(),
            duration: started.elapsed(),
            tasks_completed: report.tasks_completed(),
            errors: report.errors(),
        },
        Err(e) => RetranslationResult {
            success: false,
            duration: started.elapsed(),
            tasks_completed: 0,
            errors: vec![pipeline_failure("execution", e)],
        },
    };

    feedback.progress(&TranslationProgress {
        total_tasks: 2,
        completed_tasks: 2,
        current_task: None,
        estimated_remaining: None,
    });
    info!(
        "Run {} finished: {}/{} tasks in {:?}",
        ctx.run_id, result.tasks_completed, task_count, result.duration
    );
    feedback.retranslation_complete(&result);
    result
}
