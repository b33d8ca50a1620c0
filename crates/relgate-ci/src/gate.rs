//! Run verdict: pass/fail criteria over a finished pipeline run.

use relgate_core::{JobRole, JobStatus};
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineResult;

/// Verdict over a finished run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunVerdict {
    /// Whether the run passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// A `publish`-role job succeeded.
    pub published: bool,

    /// A `release`-role job succeeded.
    pub released: bool,

    /// Summary message.
    pub message: String,
}

/// Run gate evaluation rules.
pub struct CiGate;

impl CiGate {
    /// Evaluate a finished run.
    ///
    /// Gate rules:
    /// - No job instance may have failed (skips are not failures)
    /// - A job that ran must have started after every job it needs finished
    /// - Nothing may be released unless something was published
    pub fn evaluate(result: &PipelineResult) -> RunVerdict {
        let mut violations = Vec::new();

        for job in &result.jobs {
            if let JobStatus::Failed { reason } = &job.status {
                violations.push(format!("Job '{}' failed: {}", job.id, reason));
            }
        }

        for job in &result.jobs {
            let Some(start) = job.start_seq else { continue };
            for need in &job.needs {
                match result.job(need) {
                    Some(dep) if dep.finish_seq < start => {}
                    Some(_) => violations.push(format!(
                        "Job '{}' started before its need '{}' finished",
                        job.id, need
                    )),
                    None => violations.push(format!(
                        "Job '{}' needs '{}', which has no record",
                        job.id, need
                    )),
                }
            }
        }

        let succeeded_with = |role: JobRole| {
            result
                .jobs
                .iter()
                .any(|j| j.role == Some(role) && j.status.is_success())
        };
        let published = succeeded_with(JobRole::Publish);
        let released = succeeded_with(JobRole::Release);
        if released && !published {
            violations.push("A release was created without a successful publish".to_string());
        }

        let passed = violations.is_empty();
        let message = if !result.triggered {
            "Trigger filtered out; nothing ran".to_string()
        } else if passed {
            match (published, released) {
                (true, true) => "All jobs passed; published and released".to_string(),
                (true, false) => "All jobs passed; published".to_string(),
                _ => "All jobs passed".to_string(),
            }
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        RunVerdict {
            passed,
            violations,
            published,
            released,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JobRecord;
    use relgate_core::{FailureReason, SkipReason, TriggerEvent};
    use std::collections::BTreeMap;

    fn job(id: &str, needs: &[&str], status: JobStatus, seqs: (Option<u64>, u64)) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            template: id.to_string(),
            matrix: BTreeMap::new(),
            role: None,
            needs: needs.iter().map(|s| s.to_string()).collect(),
            status,
            start_seq: seqs.0,
            finish_seq: seqs.1,
            steps: Vec::new(),
            duration_ms: 0,
        }
    }

    fn run(jobs: Vec<JobRecord>) -> PipelineResult {
        PipelineResult {
            run_id: "run".to_string(),
            workflow: "release".to_string(),
            workflow_digest: "d".to_string(),
            trigger: TriggerEvent::tag("v3.10.0"),
            triggered: true,
            success: !jobs.iter().any(|j| j.status.is_failure()),
            jobs,
            duration_ms: 0,
            relgate_version: relgate_core::VERSION.to_string(),
        }
    }

    #[test]
    fn test_empty_run_passes() {
        let verdict = CiGate::evaluate(&run(vec![]));
        assert!(verdict.passed);
        assert!(!verdict.published);
    }

    #[test]
    fn test_publish_and_release() {
        let mut publish = job("publish", &["build"], JobStatus::Succeeded, (Some(3), 4));
        publish.role = Some(JobRole::Publish);
        let mut release = job("gh-release", &["publish"], JobStatus::Succeeded, (Some(5), 6));
        release.role = Some(JobRole::Release);
        let verdict = CiGate::evaluate(&run(vec![
            job("build", &[], JobStatus::Succeeded, (Some(1), 2)),
            publish,
            release,
        ]));
        assert!(verdict.passed, "{:?}", verdict.violations);
        assert!(verdict.published);
        assert!(verdict.released);
    }

    #[test]
    fn test_failed_job_is_violation_but_skip_is_not() {
        let verdict = CiGate::evaluate(&run(vec![
            job(
                "lint",
                &[],
                JobStatus::failed(FailureReason::StepFailed {
                    step: "black".to_string(),
                    exit_code: 1,
                }),
                (Some(1), 2),
            ),
            job(
                "build",
                &["lint"],
                JobStatus::skipped(SkipReason::UpstreamFailed {
                    job: "lint".to_string(),
                }),
                (None, 3),
            ),
        ]));
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].contains("lint"));
    }

    #[test]
    fn test_order_violation_detected() {
        let verdict = CiGate::evaluate(&run(vec![
            job("lint", &[], JobStatus::Succeeded, (Some(1), 4)),
            job("build", &["lint"], JobStatus::Succeeded, (Some(2), 3)),
        ]));
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("before its need"));
    }

    #[test]
    fn test_release_without_publish() {
        let mut release = job("gh-release", &[], JobStatus::Succeeded, (Some(1), 2));
        release.role = Some(JobRole::Release);
        let verdict = CiGate::evaluate(&run(vec![release]));
        assert!(!verdict.passed);
    }
}
