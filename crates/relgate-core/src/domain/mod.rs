//! Domain models for relgate.
//!
//! Canonical definitions for the core entities:
//! - `Workflow`: trigger filter, package metadata and job templates
//! - `JobSpec` / `ConcreteJob`: job templates and their matrix instances
//! - `TriggerEvent`: the reason a run started
//! - `JobStatus`: terminal job outcomes

pub mod condition;
pub mod error;
pub mod job;
pub mod status;
pub mod trigger;
pub mod workflow;

// Re-export main types and errors
pub use condition::{Condition, ConditionContext};
pub use error::{Result, WorkflowError};
pub use job::{Action, ConcreteJob, JobRole, JobSpec, SecretRef, StepSpec, DEFAULT_RUNNER};
pub use status::{FailureReason, JobStatus, SkipReason};
pub use trigger::{CompiledTrigger, EventKind, TriggerEvent, TriggerFilter, TriggerKind};
pub use workflow::Workflow;
