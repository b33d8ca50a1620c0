//! relgate CI - pipeline execution
//!
//! Provides the pipeline orchestrator that:
//! - Schedules expanded job instances concurrently as their needs resolve
//! - Runs every job in its own copy of the checkout
//! - Runs command steps as child processes and builtin actions in-process
//! - Applies the publish/release gate before gated jobs start
//! - Reports every run as a serializable [`PipelineResult`]

pub mod actions;
pub mod bundled;
pub mod config;
pub mod executor;
pub mod fakes;
pub mod gate;
pub mod pipeline;
pub mod publish;
pub mod runner;
pub mod workspace;

// Re-export key types
pub use actions::{run_action, ActionError};
pub use bundled::{bundled_workflow, RELEASE_WORKFLOW};
pub use config::{ConfigError, PipelineConfig};
pub use executor::{JobContext, JobExecution, JobExecutor, LocalExecutor};
pub use gate::{CiGate, RunVerdict};
pub use pipeline::{CiPipeline, JobRecord, PipelineResult};
pub use publish::{
    CreatedRelease, DistributionFile, GitHubReleaseStore, HttpPackageIndex, PackageIndex,
    PublishError, ReleaseRequest, ReleaseStore,
};
pub use runner::{
    inherited_env, CiRunner, StepCommand, StepResult, StepStatus, DEFAULT_ENV_PASSTHROUGH,
};
pub use workspace::JobWorkspace;
