//! Terminal job outcomes.

use serde::{Deserialize, Serialize};

/// Why a job failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A command step exited non-zero.
    StepFailed { step: String, exit_code: i32 },
    /// A step hit its wall-clock ceiling.
    StepTimedOut { step: String, timeout_secs: u64 },
    /// The whole job hit its wall-clock ceiling.
    JobTimedOut { timeout_minutes: u64 },
    /// A required secret was not defined; no step ran.
    SecretUnresolved { name: String },
    /// The runner environment could not be prepared; no step ran.
    ProvisionFailed { detail: String },
    /// The publish/release gate refused the job.
    GateRejected { violations: Vec<String> },
    /// A builtin action reported an error.
    ActionFailed { step: String, detail: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::StepFailed { step, exit_code } => {
                write!(f, "step '{step}' exited with code {exit_code}")
            }
            FailureReason::StepTimedOut { step, timeout_secs } => {
                write!(f, "step '{step}' timed out after {timeout_secs}s")
            }
            FailureReason::JobTimedOut { timeout_minutes } => {
                write!(f, "job timed out after {timeout_minutes} minutes")
            }
            FailureReason::SecretUnresolved { name } => {
                write!(f, "secret '{name}' is not defined")
            }
            FailureReason::ProvisionFailed { detail } => {
                write!(f, "runner provisioning failed: {detail}")
            }
            FailureReason::GateRejected { violations } => {
                write!(f, "release gate rejected: {}", violations.join("; "))
            }
            FailureReason::ActionFailed { step, detail } => {
                write!(f, "step '{step}' failed: {detail}")
            }
        }
    }
}

/// Why a job did not run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// The job's own `if` (or the trigger-kind gate) excluded it.
    ConditionNotMet,
    /// A needed job failed.
    UpstreamFailed { job: String },
    /// A needed job was itself skipped.
    UpstreamSkipped { job: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::ConditionNotMet => write!(f, "condition not met"),
            SkipReason::UpstreamFailed { job } => write!(f, "needed job '{job}' failed"),
            SkipReason::UpstreamSkipped { job } => write!(f, "needed job '{job}' was skipped"),
        }
    }
}

/// Terminal status of a job instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed { reason: FailureReason },
    Skipped { reason: SkipReason },
}

impl JobStatus {
    pub fn failed(reason: FailureReason) -> Self {
        JobStatus::Failed { reason }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        JobStatus::Skipped { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, JobStatus::Skipped { .. })
    }

    /// Short label for terminal output.
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed { .. } => "failed",
            JobStatus::Skipped { .. } => "skipped",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed { reason } => write!(f, "failed ({reason})"),
            JobStatus::Skipped { reason } => write!(f, "skipped ({reason})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(JobStatus::Succeeded.is_success());
        let failed = JobStatus::failed(FailureReason::StepFailed {
            step: "pytest".to_string(),
            exit_code: 1,
        });
        assert!(failed.is_failure());
        assert!(!failed.is_skipped());
        let skipped = JobStatus::skipped(SkipReason::ConditionNotMet);
        assert!(skipped.is_skipped());
        assert_eq!(skipped.label(), "skipped");
    }

    #[test]
    fn test_display_mentions_cause() {
        let failed = JobStatus::failed(FailureReason::SecretUnresolved {
            name: "PYPI_API_TOKEN".to_string(),
        });
        assert!(failed.to_string().contains("PYPI_API_TOKEN"));

        let skipped = JobStatus::skipped(SkipReason::UpstreamFailed {
            job: "lint".to_string(),
        });
        assert!(skipped.to_string().contains("lint"));
    }

    #[test]
    fn test_serde_shape() {
        let status = JobStatus::skipped(SkipReason::UpstreamSkipped {
            job: "publish".to_string(),
        });
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"]["kind"], "upstream_skipped");
    }
}
