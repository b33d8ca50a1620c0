//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - A run-scoped span, either as an RAII guard ([`RunSpan`]) for synchronous
//!   callers or as a [`tracing::Span`] to instrument async work
//! - Emission functions for lifecycle events: run start and finish, job
//!   start, finish and skip, gate evaluation
//!
//! Events are emitted at `info!` level (`warn!` for failures and rejected
//! gates). Secret values never pass through these functions.

use tracing::{info, warn};

use crate::domain::status::{JobStatus, SkipReason};
use crate::release_gate::GateVerdict;

/// RAII guard that enters a run-scoped span for its lifetime.
///
/// ```ignore
/// let _span = RunSpan::enter("3f2c...", "release");
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str, workflow: &str) -> Self {
        Self {
            _span: run_span(run_id, workflow).entered(),
        }
    }
}

/// The run-scoped span, for `Instrument::instrument` on async work.
pub fn run_span(run_id: &str, workflow: &str) -> tracing::Span {
    tracing::info_span!("relgate.run", run_id = %run_id, workflow = %workflow)
}

/// Emit event: run started for a trigger.
pub fn emit_run_started(run_id: &str, workflow: &str, trigger: &str, jobs: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        workflow = %workflow,
        trigger = %trigger,
        jobs = jobs,
    );
}

/// Emit event: run finished.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, jobs: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        jobs = jobs,
        success = success,
    );
}

/// Emit event: a job instance started.
pub fn emit_job_started(job_id: &str, runs_on: &str, seq: u64) {
    info!(event = "job.started", job = %job_id, runs_on = %runs_on, seq = seq);
}

/// Emit event: a job instance reached a terminal status after running.
pub fn emit_job_finished(job_id: &str, status: &JobStatus, duration_ms: u64) {
    if status.is_failure() {
        warn!(
            event = "job.finished",
            job = %job_id,
            status = %status,
            duration_ms = duration_ms,
        );
    } else {
        info!(
            event = "job.finished",
            job = %job_id,
            status = %status,
            duration_ms = duration_ms,
        );
    }
}

/// Emit event: a job instance was skipped without running.
pub fn emit_job_skipped(job_id: &str, reason: &SkipReason) {
    info!(event = "job.skipped", job = %job_id, reason = %reason);
}

/// Emit event: publish/release gate evaluated for a job.
pub fn emit_gate_evaluated(job_id: &str, verdict: &GateVerdict) {
    if verdict.passed {
        info!(event = "gate.evaluated", job = %job_id, passed = true);
    } else {
        warn!(
            event = "gate.evaluated",
            job = %job_id,
            passed = false,
            violations = ?verdict.reasons(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id", "release");
    }

    #[test]
    fn test_emitters_do_not_panic() {
        emit_run_started("r", "release", "tag v1.0.0", 3);
        emit_job_started("lint", "ubuntu-latest", 1);
        emit_job_finished("lint", &JobStatus::Succeeded, 12);
        emit_job_skipped("publish", &SkipReason::ConditionNotMet);
        emit_run_finished("r", 40, 3, true);
    }
}
