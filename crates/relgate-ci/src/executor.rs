//! Job execution: steps of one job instance, strictly in order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relgate_core::{
    Action, ArtifactStore, ConcreteJob, ConditionContext, FailureReason, JobStatus, PackageMetadata,
    SecretScope, StepSpec, TriggerEvent,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::actions;
use crate::publish::{PackageIndex, ReleaseStore};
use crate::runner::{CiRunner, StepCommand, StepResult, StepStatus};
use crate::workspace::JobWorkspace;

/// Everything a job may touch while it runs. Cheap to clone.
#[derive(Clone)]
pub struct JobContext {
    pub run_id: String,
    pub trigger: TriggerEvent,
    /// Secrets bound for this job only.
    pub secrets: SecretScope,
    /// Source checkout handed to the executor. [`LocalExecutor`] swaps it
    /// for the job's private copy before any step runs.
    pub workspace: PathBuf,
    /// Run state root. Job workspaces live under `<state_dir>/<run_id>/jobs/`.
    pub state_dir: PathBuf,
    /// Orchestrator variables the steps inherit, secrets withheld.
    pub base_env: Arc<BTreeMap<String, String>>,
    /// Ceiling used when the job declares no `timeout_minutes`.
    pub default_timeout_minutes: u64,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub package_index: Arc<dyn PackageIndex>,
    pub release_store: Arc<dyn ReleaseStore>,
    pub package: Option<PackageMetadata>,
}

/// Outcome of one job instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobExecution {
    pub status: JobStatus,
    pub steps: Vec<StepResult>,
}

impl JobExecution {
    pub fn failed(reason: FailureReason) -> Self {
        Self {
            status: JobStatus::failed(reason),
            steps: Vec::new(),
        }
    }
}

/// Runs the steps of a job whose needs, condition and gate have cleared.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &ConcreteJob, ctx: JobContext) -> JobExecution;
}

/// Executes command steps as local child processes and builtin actions
/// in-process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

#[async_trait]
impl JobExecutor for LocalExecutor {
    async fn execute(&self, job: &ConcreteJob, ctx: JobContext) -> JobExecution {
        let workspace = match provision(job, &ctx).await {
            Ok(workspace) => workspace,
            Err(detail) => {
                warn!(job = %job.id, error = %detail, "job workspace not provisioned");
                return JobExecution::failed(FailureReason::ProvisionFailed { detail });
            }
        };
        let ctx = JobContext {
            workspace: workspace.path().to_path_buf(),
            ..ctx
        };
        let execution = run_job(job, &ctx).await;
        if let Err(e) = tokio::fs::remove_dir_all(workspace.path()).await {
            warn!(job = %job.id, error = %e, "could not remove job workspace");
        }
        execution
    }
}

async fn provision(job: &ConcreteJob, ctx: &JobContext) -> Result<JobWorkspace, String> {
    let source = ctx.workspace.clone();
    let state_dir = ctx.state_dir.clone();
    let run_id = ctx.run_id.clone();
    let job_id = job.id.clone();
    tokio::task::spawn_blocking(move || {
        JobWorkspace::provision(&source, &state_dir, &run_id, &job_id)
    })
    .await
    .map_err(|e| format!("provisioning task aborted: {e}"))?
    .map_err(|e| format!("could not copy checkout {}: {e}", ctx.workspace.display()))
}

/// Run the steps under the job's wall-clock ceiling.
async fn run_job(job: &ConcreteJob, ctx: &JobContext) -> JobExecution {
    let timeout_minutes = job.timeout_minutes.unwrap_or(ctx.default_timeout_minutes);
    let limit = Duration::from_secs(timeout_minutes.saturating_mul(60));

    let mut steps = Vec::with_capacity(job.steps.len());
    let outcome = tokio::time::timeout(limit, run_steps(job, ctx, &mut steps)).await;
    let status = match outcome {
        Ok(None) => JobStatus::Succeeded,
        Ok(Some(reason)) => JobStatus::failed(reason),
        Err(_) => {
            warn!(job = %job.id, timeout_minutes, "job timed out");
            for step in job.steps.iter().skip(steps.len()) {
                steps.push(StepResult::skipped(&step.name));
            }
            JobStatus::failed(FailureReason::JobTimedOut { timeout_minutes })
        }
    };
    JobExecution { status, steps }
}

/// Run every step, appending results. Returns the first failure.
async fn run_steps(
    job: &ConcreteJob,
    ctx: &JobContext,
    results: &mut Vec<StepResult>,
) -> Option<FailureReason> {
    let mut failure = None;
    for step in &job.steps {
        if failure.is_some() {
            results.push(StepResult::skipped(&step.name));
            continue;
        }
        let cond_ctx = ConditionContext {
            trigger: &ctx.trigger,
            matrix: &job.matrix,
        };
        if let Some(condition) = &step.condition {
            if !condition.evaluate(&cond_ctx) {
                debug!(job = %job.id, step = %step.name, "step condition not met");
                results.push(StepResult::skipped(&step.name));
                continue;
            }
        }

        let (result, reason) = if let Some(argv) = &step.run {
            run_command(job, step, argv, ctx).await
        } else if let Some(action) = &step.uses {
            run_builtin(job, step, action, ctx).await
        } else {
            let detail = "step has neither run nor uses".to_string();
            (
                failed_result(&step.name, detail.clone(), 0),
                Some(FailureReason::ActionFailed {
                    step: step.name.clone(),
                    detail,
                }),
            )
        };
        results.push(result);
        failure = reason;
    }
    failure
}

fn step_timeout(step: &StepSpec) -> Option<Duration> {
    step.timeout_secs.map(Duration::from_secs)
}

fn failed_result(step_name: &str, stderr: String, duration_ms: u64) -> StepResult {
    StepResult {
        step_name: step_name.to_string(),
        status: StepStatus::Failed,
        exit_code: None,
        stdout: String::new(),
        stderr,
        duration_ms,
    }
}

async fn run_command(
    job: &ConcreteJob,
    step: &StepSpec,
    argv: &[String],
    ctx: &JobContext,
) -> (StepResult, Option<FailureReason>) {
    let mut env: BTreeMap<String, String> = job
        .env
        .iter()
        .map(|(k, v)| (k.clone(), ctx.trigger.render(v)))
        .collect();
    env.extend(
        step.env
            .iter()
            .map(|(k, v)| (k.clone(), ctx.trigger.render(v))),
    );
    let command = StepCommand {
        name: step.name.clone(),
        argv: argv.iter().map(|a| ctx.trigger.render(a)).collect(),
        base_env: ctx.base_env.as_ref().clone(),
        env,
        cwd: ctx.workspace.clone(),
        timeout: step_timeout(step),
    };

    let result = match CiRunner::execute(&command, &ctx.secrets).await {
        Ok(result) => result,
        Err(e) => {
            warn!(job = %job.id, step = %step.name, error = %e, "step could not start");
            let result = failed_result(&step.name, ctx.secrets.redact(&e.to_string()), 0);
            let reason = FailureReason::StepFailed {
                step: step.name.clone(),
                exit_code: -1,
            };
            return (result, Some(reason));
        }
    };

    let reason = match result.status {
        StepStatus::Succeeded | StepStatus::Skipped => None,
        StepStatus::TimedOut => Some(FailureReason::StepTimedOut {
            step: step.name.clone(),
            timeout_secs: step.timeout_secs.unwrap_or_default(),
        }),
        StepStatus::Failed => Some(FailureReason::StepFailed {
            step: step.name.clone(),
            exit_code: result.exit_code.unwrap_or(-1),
        }),
    };
    if reason.is_some() {
        warn!(job = %job.id, step = %step.name, status = ?result.status, "step failed");
    }
    (result, reason)
}

async fn run_builtin(
    job: &ConcreteJob,
    step: &StepSpec,
    action: &Action,
    ctx: &JobContext,
) -> (StepResult, Option<FailureReason>) {
    let start = Instant::now();
    // Matrix placeholders were substituted at expansion; only the trigger
    // scope is left.
    let action = action
        .map_parameters(|p| Ok(ctx.trigger.render(p)))
        .unwrap_or_else(|_| action.clone());

    let outcome = match step_timeout(step) {
        Some(limit) => tokio::time::timeout(limit, actions::run_action(&action, &job.id, ctx))
            .await
            .ok(),
        None => Some(actions::run_action(&action, &job.id, ctx).await),
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Some(Ok(output)) => (
            StepResult {
                step_name: step.name.clone(),
                status: StepStatus::Succeeded,
                exit_code: None,
                stdout: ctx.secrets.redact(&output),
                stderr: String::new(),
                duration_ms,
            },
            None,
        ),
        Some(Err(e)) => {
            let detail = ctx.secrets.redact(&e.to_string());
            warn!(job = %job.id, step = %step.name, action = action.name(), error = %detail, "action failed");
            (
                failed_result(&step.name, detail.clone(), duration_ms),
                Some(FailureReason::ActionFailed {
                    step: step.name.clone(),
                    detail,
                }),
            )
        }
        None => {
            let timeout_secs = step.timeout_secs.unwrap_or_default();
            (
                StepResult {
                    step_name: step.name.clone(),
                    status: StepStatus::TimedOut,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("timed out after {timeout_secs}s"),
                    duration_ms,
                },
                Some(FailureReason::StepTimedOut {
                    step: step.name.clone(),
                    timeout_secs,
                }),
            )
        }
    }
}
