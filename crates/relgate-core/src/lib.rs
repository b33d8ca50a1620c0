//! relgate Core Library
//!
//! Workflow model and release-gating logic: job graph evaluation, matrix
//! expansion, secret binding, the publish/release gate, artifact storage and
//! package metadata. Process execution lives in `relgate-ci`.

pub mod artifacts;
pub mod domain;
pub mod evaluator;
pub mod graph;
pub mod matrix;
pub mod obs;
pub mod package;
pub mod release_gate;
pub mod secrets;
pub mod telemetry;
mod template;

pub use artifacts::{
    collect_files, ArtifactError, ArtifactManifest, ArtifactStore, FsArtifactStore, UploadRequest,
};
pub use domain::{
    Action, Condition, ConditionContext, ConcreteJob, EventKind, FailureReason, JobRole, JobSpec,
    JobStatus, Result, SecretRef, SkipReason, StepSpec, TriggerEvent, TriggerFilter, TriggerKind,
    Workflow, WorkflowError,
};
pub use evaluator::{GraphEvaluation, Readiness};
pub use graph::{ExecutionPlan, GraphError, JobGraph, PlanStep};
pub use matrix::{Matrix, MatrixAxis, MatrixError, MatrixExpander};
pub use package::{DependencyConstraint, PackageError, PackageMetadata};
pub use release_gate::{
    evaluate_release_gate, GateCandidate, GateRule, GateRuleSet, GateVerdict, GateViolation,
    ReleaseVersion, UpstreamStatus,
};
pub use secrets::{
    EnvSecretStore, MemorySecretStore, SecretError, SecretInjector, SecretScope, SecretStore,
    SecretValue,
};

/// Crate version, reported in run records.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
