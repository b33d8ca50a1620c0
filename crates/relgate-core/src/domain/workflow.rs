//! Workflow definitions: trigger filter, package metadata and job templates.
//!
//! Every configuration error is reported by [`Workflow::validate`], which
//! runs before any job executes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::condition::Condition;
use crate::domain::error::{Result, WorkflowError};
use crate::domain::job::{ConcreteJob, JobRole, JobSpec, StepSpec};
use crate::domain::trigger::TriggerFilter;
use crate::graph::{ExecutionPlan, JobGraph};
use crate::matrix::{Matrix, MatrixError, MatrixExpander};
use crate::package::PackageMetadata;
use crate::template;

/// Keys accepted in `${{ trigger.<key> }}`.
const TRIGGER_KEYS: [&str; 2] = ["ref", "sha"];

fn default_name() -> String {
    "workflow".to_string()
}

/// A parsed workflow document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workflow {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub on: TriggerFilter,

    #[serde(default)]
    pub package: Option<PackageMetadata>,

    /// Job templates keyed by id.
    #[serde(default)]
    pub jobs: BTreeMap<String, JobSpec>,
}

impl Workflow {
    /// Parse and validate a TOML workflow.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let workflow: Workflow = toml::from_str(input)?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Read, parse and validate a workflow file.
    pub fn load(path: &Path) -> Result<Self> {
        let input = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Check the whole definition. Nothing may run unless this passes.
    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(WorkflowError::NoJobs);
        }
        self.on.compile()?;
        if let Some(package) = &self.package {
            package.validate()?;
        }
        for (id, job) in &self.jobs {
            self.validate_job(id, job)?;
        }
        self.plan()?;
        Ok(())
    }

    fn validate_job(&self, id: &str, job: &JobSpec) -> Result<()> {
        let invalid = |reason: String| WorkflowError::InvalidJob {
            job: id.to_string(),
            reason,
        };

        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("job ids may only contain letters, digits, '-' and '_'".into()));
        }
        if job.steps.is_empty() {
            return Err(invalid("job has no steps".into()));
        }
        if job.timeout_minutes == Some(0) {
            return Err(invalid("timeout_minutes must be positive".into()));
        }

        let matrix = Matrix::from_table(&job.matrix).map_err(|source| WorkflowError::Matrix {
            job: id.to_string(),
            source,
        })?;

        if let Some(condition) = &job.condition {
            check_condition(condition, &matrix).map_err(invalid)?;
        }

        let mut templated: Vec<&str> = vec![job.runs_on.as_str()];
        templated.extend(job.env.values().map(String::as_str));
        self.check_placeholders(id, None, &templated, &matrix)?;

        let mut env_names = BTreeSet::new();
        for secret in &job.secrets {
            if secret.name.trim().is_empty() {
                return Err(invalid("secret reference with empty name".into()));
            }
            if !env_names.insert(secret.env_name()) {
                return Err(invalid(format!(
                    "environment variable '{}' bound by more than one secret",
                    secret.env_name()
                )));
            }
        }

        let mut step_names = BTreeSet::new();
        for step in &job.steps {
            if !step_names.insert(step.name.as_str()) {
                return Err(invalid(format!("duplicate step name '{}'", step.name)));
            }
            self.validate_step(id, job, step, &matrix)?;
        }

        if job.role == Some(JobRole::Release) {
            let needs_publisher = job.needs.iter().any(|need| {
                self.jobs
                    .get(need)
                    .is_some_and(|j| j.role == Some(JobRole::Publish))
            });
            if !needs_publisher {
                return Err(invalid("a release job must need a publish job".into()));
            }
        }

        if let Some(package) = &self.package {
            if let Some(values) = job.matrix.get(&package.runtime_axis) {
                for value in values {
                    if !package.supports_runtime(value)? {
                        return Err(invalid(format!(
                            "{} {} is below python_requires {}",
                            package.runtime_axis,
                            value,
                            package.python_requires.as_deref().unwrap_or_default()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_step(&self, id: &str, job: &JobSpec, step: &StepSpec, matrix: &Matrix) -> Result<()> {
        let invalid = |reason: String| WorkflowError::InvalidStep {
            job: id.to_string(),
            step: step.name.clone(),
            reason,
        };

        if step.name.trim().is_empty() {
            return Err(invalid("step name must not be empty".into()));
        }
        match (&step.run, &step.uses) {
            (Some(argv), None) => {
                if argv.first().map_or(true, |program| program.trim().is_empty()) {
                    return Err(invalid("run argv must name a program".into()));
                }
            }
            (None, Some(action)) => {
                for secret in action.required_secrets() {
                    if !job.secrets.iter().any(|s| s.name == secret) {
                        return Err(invalid(format!(
                            "{} needs secret '{secret}', which the job does not declare",
                            action.name()
                        )));
                    }
                }
            }
            (Some(_), Some(_)) => {
                return Err(invalid("step has both 'run' and 'uses'".into()));
            }
            (None, None) => {
                return Err(invalid("step needs either 'run' or 'uses'".into()));
            }
        }
        if step.timeout_secs == Some(0) {
            return Err(invalid("timeout_secs must be positive".into()));
        }
        if let Some(condition) = &step.condition {
            check_condition(condition, matrix).map_err(invalid)?;
        }
        self.check_placeholders(id, Some(&step.name), &step.templated_strings(), matrix)
    }

    fn check_placeholders(
        &self,
        id: &str,
        step: Option<&str>,
        strings: &[&str],
        matrix: &Matrix,
    ) -> Result<()> {
        for input in strings {
            for (scope, key) in template::placeholders(input) {
                let reason = match scope.as_str() {
                    "matrix" if matrix.has_axis(&key) => continue,
                    "matrix" => {
                        return Err(WorkflowError::Matrix {
                            job: id.to_string(),
                            source: MatrixError::UnknownAxis { axis: key },
                        })
                    }
                    "trigger" if TRIGGER_KEYS.contains(&key.as_str()) => continue,
                    "trigger" => format!("unknown trigger key '{key}'"),
                    other => format!("unknown placeholder scope '{other}'"),
                };
                return Err(match step {
                    Some(step) => WorkflowError::InvalidStep {
                        job: id.to_string(),
                        step: step.to_string(),
                        reason,
                    },
                    None => WorkflowError::InvalidJob {
                        job: id.to_string(),
                        reason,
                    },
                });
            }
        }
        Ok(())
    }

    /// Expand every template into concrete job instances.
    pub fn expand(&self) -> Result<Vec<ConcreteJob>> {
        let mut out = Vec::new();
        for (id, job) in &self.jobs {
            let instances =
                MatrixExpander::expand(id, job).map_err(|source| WorkflowError::Matrix {
                    job: id.clone(),
                    source,
                })?;
            out.extend(instances);
        }
        Ok(out)
    }

    /// Expand and build the dependency graph.
    pub fn plan(&self) -> Result<JobGraph> {
        Ok(JobGraph::build(self.expand()?)?)
    }

    /// Levelled execution plan, titled with the workflow name.
    pub fn execution_plan(&self) -> Result<ExecutionPlan> {
        Ok(self.plan()?.to_execution_plan(&self.name)?)
    }

    /// SHA-256 of the canonical JSON encoding (deterministic: all maps are
    /// ordered).
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

fn check_condition(condition: &Condition, matrix: &Matrix) -> std::result::Result<(), String> {
    condition.validate()?;
    for axis in condition.referenced_axes() {
        if !matrix.has_axis(axis) {
            return Err(format!("condition references unknown matrix axis '{axis}'"));
        }
    }
    Ok(())
}
