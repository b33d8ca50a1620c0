//! Pipeline orchestration: schedules the job graph of one run.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use relgate_core::obs;
use relgate_core::{
    evaluate_release_gate, ArtifactStore, ConcreteJob, ConditionContext, FailureReason,
    FsArtifactStore, GateCandidate, GateRuleSet, GraphEvaluation, JobGraph, JobRole, JobStatus,
    Readiness, SecretError, SecretInjector, SecretStore, SkipReason, TriggerEvent, UpstreamStatus,
    Workflow,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::executor::{JobContext, JobExecution, JobExecutor, LocalExecutor};
use crate::publish::{GitHubReleaseStore, HttpPackageIndex, PackageIndex, ReleaseStore};
use crate::runner::{inherited_env, StepResult};

/// Record of one job instance within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub id: String,
    pub template: String,
    pub matrix: BTreeMap<String, String>,
    pub role: Option<JobRole>,
    /// Instance ids this job waited for.
    pub needs: Vec<String>,
    pub status: JobStatus,
    /// Sequence number at start; `None` when the job never ran.
    pub start_seq: Option<u64>,
    pub finish_seq: u64,
    pub steps: Vec<StepResult>,
    pub duration_ms: u64,
}

impl JobRecord {
    pub fn ran(&self) -> bool {
        self.start_seq.is_some()
    }
}

/// Result of a complete pipeline run. Serialized as the run report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineResult {
    pub run_id: String,
    pub workflow: String,
    /// Digest of the workflow definition.
    pub workflow_digest: String,
    pub trigger: TriggerEvent,
    /// `false` when the trigger filter rejected the event; no job ran.
    pub triggered: bool,
    /// No job failed.
    pub success: bool,
    /// Jobs in topological order.
    pub jobs: Vec<JobRecord>,
    pub duration_ms: u64,
    pub relgate_version: String,
}

impl PipelineResult {
    pub fn job(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Every instance of a template.
    pub fn instances(&self, template: &str) -> Vec<&JobRecord> {
        self.jobs.iter().filter(|j| j.template == template).collect()
    }

    pub fn passed_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.status.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.status.is_failure()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.status.is_skipped()).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Pipeline orchestrator.
///
/// Jobs whose needs are satisfied run concurrently as tokio tasks, up to
/// `max_parallel`; steps within a job run in order.
pub struct CiPipeline {
    config: PipelineConfig,
    secrets: Arc<dyn SecretStore>,
    executor: Arc<dyn JobExecutor>,
    package_index: Arc<dyn PackageIndex>,
    release_store: Arc<dyn ReleaseStore>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
}

/// What to do with a ready job before it is handed to the executor.
enum Admission {
    Start(JobContext),
    Finish(JobStatus),
}

impl CiPipeline {
    /// Local execution against the HTTP package index and release store
    /// named in `config`.
    pub fn new(config: PipelineConfig, secrets: Arc<dyn SecretStore>) -> Self {
        let package_index = Arc::new(HttpPackageIndex::new(config.package_index_url.clone()));
        let release_store = Arc::new(match &config.repository {
            Some(repo) => GitHubReleaseStore::new(config.release_api_url.clone(), repo.clone()),
            None => GitHubReleaseStore::unconfigured(config.release_api_url.clone()),
        });
        Self {
            config,
            secrets,
            executor: Arc::new(LocalExecutor),
            package_index,
            release_store,
            artifacts: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_package_index(mut self, index: Arc<dyn PackageIndex>) -> Self {
        self.package_index = index;
        self
    }

    pub fn with_release_store(mut self, store: Arc<dyn ReleaseStore>) -> Self {
        self.release_store = store;
        self
    }

    /// Share one artifact store across runs instead of a fresh
    /// `<artifact_dir>/<run_id>` per run.
    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute `workflow` for `trigger`.
    ///
    /// Configuration errors abort before any job runs. Job failures do not
    /// produce `Err`; they are reported in the result.
    pub async fn run(
        &self,
        workflow: &Workflow,
        trigger: TriggerEvent,
    ) -> anyhow::Result<PipelineResult> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id, &workflow.name);
        self.run_inner(run_id, workflow, trigger)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: String,
        workflow: &Workflow,
        trigger: TriggerEvent,
    ) -> anyhow::Result<PipelineResult> {
        let start = Instant::now();

        workflow.validate()?;
        let graph = workflow.plan()?;
        let workflow_digest = workflow.digest()?;
        let filter = workflow.on.compile()?;

        let mut result = PipelineResult {
            run_id: run_id.clone(),
            workflow: workflow.name.clone(),
            workflow_digest,
            trigger: trigger.clone(),
            triggered: false,
            success: true,
            jobs: Vec::new(),
            duration_ms: 0,
            relgate_version: relgate_core::VERSION.to_string(),
        };

        if !filter.matches(&trigger) {
            info!(trigger = %trigger, "trigger filter rejected event; nothing to run");
            result.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(result);
        }
        result.triggered = true;

        let package_version = match &workflow.package {
            Some(package) => match package.resolve_version(&self.config.workspace) {
                Ok(version) => Ok(Some(version)),
                Err(e) => {
                    warn!(error = %e, "package version could not be read");
                    Err(e.to_string())
                }
            },
            None => Ok(None),
        };

        let artifacts: Arc<dyn ArtifactStore> = match &self.artifacts {
            Some(store) => store.clone(),
            None => Arc::new(FsArtifactStore::new(
                self.config.artifact_dir.join(&run_id),
            )?),
        };

        let base_env = Arc::new(inherited_env(
            &self.config.env_passthrough,
            &self.secret_vars(&graph),
        ));

        obs::emit_run_started(&run_id, &workflow.name, &trigger.to_string(), graph.len());

        let run = RunState {
            run_id: &run_id,
            trigger: &trigger,
            graph: &graph,
            workflow,
            package_version: &package_version,
            artifacts: &artifacts,
            base_env: &base_env,
        };
        let records = self.schedule(&run).await;

        result.jobs = graph
            .topological_order()
            .into_iter()
            .filter_map(|id| records.get(&id).cloned())
            .collect();
        result.success = !result.jobs.iter().any(|j| j.status.is_failure());
        result.duration_ms = start.elapsed().as_millis() as u64;

        obs::emit_run_finished(&run_id, result.duration_ms, result.jobs.len(), result.success);
        Ok(result)
    }

    /// Every variable that may carry a secret of this workflow: declared
    /// names, their env aliases and whatever the store reads them from.
    fn secret_vars(&self, graph: &JobGraph) -> BTreeSet<String> {
        let mut vars = BTreeSet::new();
        for job in graph.jobs() {
            for secret in &job.secrets {
                vars.insert(secret.name.clone());
                vars.insert(secret.env_name().to_string());
                vars.extend(self.secrets.source_vars(&secret.name));
            }
            for name in job
                .steps
                .iter()
                .filter_map(|step| step.uses.as_ref())
                .flat_map(|action| action.required_secrets())
            {
                vars.insert(name.to_string());
                vars.extend(self.secrets.source_vars(name));
            }
        }
        vars
    }

    async fn schedule(&self, run: &RunState<'_>) -> BTreeMap<String, JobRecord> {
        let cap = self.config.max_parallel.unwrap_or(usize::MAX).max(1);
        let mut eval = GraphEvaluation::new(run.graph);
        let mut records: BTreeMap<String, JobRecord> = BTreeMap::new();
        let mut ready: VecDeque<String> = VecDeque::new();
        let mut in_flight = FuturesUnordered::new();
        let mut starts: BTreeMap<String, (u64, Instant)> = BTreeMap::new();
        let mut seq = 0u64;

        loop {
            let mut progressed = false;
            for readiness in eval.advance() {
                match readiness {
                    Readiness::Run(id) => ready.push_back(id),
                    Readiness::Skip { id, reason } => {
                        obs::emit_job_skipped(&id, &reason);
                        seq += 1;
                        let status = JobStatus::skipped(reason);
                        records.insert(id.clone(), record(run.graph, &id, status, None, seq));
                        progressed = true;
                    }
                }
            }

            while in_flight.len() < cap {
                let Some(id) = ready.pop_front() else { break };
                let Some(job) = run.graph.job(&id) else { continue };
                match self.admit(run, job, &records) {
                    Admission::Finish(status) => {
                        if let JobStatus::Skipped { reason } = &status {
                            obs::emit_job_skipped(&id, reason);
                        } else {
                            obs::emit_job_finished(&id, &status, 0);
                        }
                        seq += 1;
                        eval.complete(&id, status.clone());
                        records.insert(id.clone(), record(run.graph, &id, status, None, seq));
                        progressed = true;
                    }
                    Admission::Start(ctx) => {
                        seq += 1;
                        obs::emit_job_started(&id, &job.runs_on, seq);
                        starts.insert(id.clone(), (seq, Instant::now()));
                        let executor = self.executor.clone();
                        let job = job.clone();
                        let task = async move { executor.execute(&job, ctx).await };
                        let handle = tokio::spawn(task.in_current_span());
                        in_flight.push(async move { (id, handle.await) });
                    }
                }
            }

            if eval.is_finished() {
                break;
            }
            if in_flight.is_empty() {
                if progressed || !ready.is_empty() {
                    continue;
                }
                warn!(run_id = %run.run_id, "no runnable jobs left before the graph finished");
                break;
            }

            let Some((id, joined)) = in_flight.next().await else { break };
            let execution = joined.unwrap_or_else(|e| {
                JobExecution::failed(FailureReason::ProvisionFailed {
                    detail: format!("job task aborted: {e}"),
                })
            });
            let (start_seq, started) = starts.remove(&id).unwrap_or((seq, Instant::now()));
            let duration_ms = started.elapsed().as_millis() as u64;
            obs::emit_job_finished(&id, &execution.status, duration_ms);

            if execution.status.is_failure() {
                // Outputs of a failed job must not reach its consumers.
                if let Err(e) = run.artifacts.mark_unusable(&id) {
                    warn!(job = %id, error = %e, "could not mark artifacts unusable");
                }
            }
            seq += 1;
            eval.complete(&id, execution.status.clone());
            let mut finished = record(run.graph, &id, execution.status, Some(start_seq), seq);
            finished.steps = execution.steps;
            finished.duration_ms = duration_ms;
            records.insert(id, finished);
        }
        records
    }

    /// Evaluate the job's own condition, the release gate and its secrets.
    fn admit(
        &self,
        run: &RunState<'_>,
        job: &ConcreteJob,
        records: &BTreeMap<String, JobRecord>,
    ) -> Admission {
        let cond_ctx = ConditionContext {
            trigger: run.trigger,
            matrix: &job.matrix,
        };
        if let Some(condition) = &job.condition {
            if !condition.evaluate(&cond_ctx) {
                return Admission::Finish(JobStatus::skipped(SkipReason::ConditionNotMet));
            }
        }

        if let Some(role) = job.role {
            let upstream = run
                .graph
                .dependencies_of(&job.id)
                .unwrap_or_default()
                .into_iter()
                .map(|dep| UpstreamStatus {
                    job: dep.id.clone(),
                    role: dep.role,
                    status: records
                        .get(&dep.id)
                        .map(|r| r.status.clone())
                        .unwrap_or(JobStatus::Succeeded),
                })
                .collect();
            let candidate = GateCandidate {
                trigger: run.trigger.clone(),
                upstream,
                package_version: run.package_version.clone().ok().flatten(),
            };
            let verdict = evaluate_release_gate(&GateRuleSet::for_role(role), &candidate);
            obs::emit_gate_evaluated(&job.id, &verdict);
            if verdict.blocked_by_trigger_only() {
                return Admission::Finish(JobStatus::skipped(SkipReason::ConditionNotMet));
            }
            let mut violations = verdict.reasons();
            if role == JobRole::Publish {
                if let Err(e) = run.package_version {
                    violations.push(format!("package version could not be read: {e}"));
                }
            }
            if !violations.is_empty() {
                return Admission::Finish(JobStatus::failed(FailureReason::GateRejected {
                    violations,
                }));
            }
        }

        let secrets = match SecretInjector::bind(&job.id, &job.secrets, self.secrets.as_ref()) {
            Ok(scope) => scope,
            Err(e) => {
                let name = match e {
                    SecretError::Undefined { name } => name,
                    other => other.to_string(),
                };
                return Admission::Finish(JobStatus::failed(FailureReason::SecretUnresolved {
                    name,
                }));
            }
        };

        Admission::Start(JobContext {
            run_id: run.run_id.to_string(),
            trigger: run.trigger.clone(),
            secrets,
            workspace: self.config.workspace.clone(),
            state_dir: self.config.artifact_dir.clone(),
            base_env: run.base_env.clone(),
            default_timeout_minutes: self.config.job_timeout_minutes,
            artifacts: run.artifacts.clone(),
            package_index: self.package_index.clone(),
            release_store: self.release_store.clone(),
            package: run.workflow.package.clone(),
        })
    }
}

/// Borrowed state shared by the scheduling loop of one run.
struct RunState<'a> {
    run_id: &'a str,
    trigger: &'a TriggerEvent,
    graph: &'a JobGraph,
    workflow: &'a Workflow,
    package_version: &'a Result<Option<String>, String>,
    artifacts: &'a Arc<dyn ArtifactStore>,
    base_env: &'a Arc<BTreeMap<String, String>>,
}

fn record(
    graph: &JobGraph,
    id: &str,
    status: JobStatus,
    start_seq: Option<u64>,
    finish_seq: u64,
) -> JobRecord {
    let job = graph.job(id);
    JobRecord {
        id: id.to_string(),
        template: job.map(|j| j.template.clone()).unwrap_or_default(),
        matrix: job.map(|j| j.matrix.clone()).unwrap_or_default(),
        role: job.and_then(|j| j.role),
        needs: graph
            .dependencies_of(id)
            .unwrap_or_default()
            .into_iter()
            .map(|d| d.id.clone())
            .collect(),
        status,
        start_seq,
        finish_seq,
        steps: Vec::new(),
        duration_ms: 0,
    }
}
