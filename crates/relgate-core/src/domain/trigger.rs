//! Trigger events and the workflow `[on]` filter.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, WorkflowError};
use crate::template;

/// Coarse classification of a trigger, used by conditions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    Tag,
    PullRequest,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Push => write!(f, "push"),
            EventKind::Tag => write!(f, "tag"),
            EventKind::PullRequest => write!(f, "pull_request"),
        }
    }
}

/// What happened in the repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Commits pushed to a branch.
    Push { branch: String },
    /// A tag pushed (e.g. `v3.10.0`).
    Tag { name: String },
    /// A pull request opened or updated against `base`.
    PullRequest { base: String, head: String },
}

/// The classified reason a pipeline run started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerEvent {
    #[serde(flatten)]
    pub kind: TriggerKind,

    /// Paths touched by the change. Empty means "unknown" and never
    /// suppresses a run.
    #[serde(default)]
    pub changed_paths: Vec<String>,

    /// Commit SHA the run is evaluated at.
    #[serde(default)]
    pub sha: Option<String>,
}

impl TriggerEvent {
    pub fn push(branch: impl Into<String>) -> Self {
        Self::from_kind(TriggerKind::Push {
            branch: branch.into(),
        })
    }

    pub fn tag(name: impl Into<String>) -> Self {
        Self::from_kind(TriggerKind::Tag { name: name.into() })
    }

    pub fn pull_request(base: impl Into<String>, head: impl Into<String>) -> Self {
        Self::from_kind(TriggerKind::PullRequest {
            base: base.into(),
            head: head.into(),
        })
    }

    fn from_kind(kind: TriggerKind) -> Self {
        Self {
            kind,
            changed_paths: Vec::new(),
            sha: None,
        }
    }

    /// Attach the list of changed paths.
    pub fn with_changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Attach the commit SHA.
    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    pub fn event_kind(&self) -> EventKind {
        match self.kind {
            TriggerKind::Push { .. } => EventKind::Push,
            TriggerKind::Tag { .. } => EventKind::Tag,
            TriggerKind::PullRequest { .. } => EventKind::PullRequest,
        }
    }

    /// Branch name, tag name, or pull-request head branch.
    pub fn ref_name(&self) -> &str {
        match &self.kind {
            TriggerKind::Push { branch } => branch,
            TriggerKind::Tag { name } => name,
            TriggerKind::PullRequest { head, .. } => head,
        }
    }

    /// Branch the run executes on; `None` for tag pushes.
    pub fn branch(&self) -> Option<&str> {
        match &self.kind {
            TriggerKind::Push { branch } => Some(branch),
            TriggerKind::PullRequest { head, .. } => Some(head),
            TriggerKind::Tag { .. } => None,
        }
    }

    pub fn tag_name(&self) -> Option<&str> {
        match &self.kind {
            TriggerKind::Tag { name } => Some(name),
            _ => None,
        }
    }

    pub fn is_tag(&self) -> bool {
        matches!(self.kind, TriggerKind::Tag { .. })
    }

    /// Replace `${{ trigger.ref }}` and `${{ trigger.sha }}` placeholders.
    ///
    /// Placeholders of other scopes are left untouched.
    pub fn render(&self, input: &str) -> String {
        template::replace_scope(input, "trigger", |key| match key {
            "ref" => Some(self.ref_name().to_string()),
            "sha" => Some(self.sha.clone().unwrap_or_default()),
            _ => None,
        })
        .unwrap_or_else(|_| input.to_string())
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TriggerKind::Push { branch } => write!(f, "push to {branch}"),
            TriggerKind::Tag { name } => write!(f, "tag {name}"),
            TriggerKind::PullRequest { base, head } => write!(f, "pull request {head} -> {base}"),
        }
    }
}

/// The `[on]` table of a workflow: which events start a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerFilter {
    /// Branch patterns whose pushes trigger the workflow.
    #[serde(default)]
    pub push_branches: Vec<String>,

    /// Tag patterns whose pushes trigger the workflow.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Whether pull requests trigger the workflow.
    #[serde(default)]
    pub pull_request: bool,

    /// Base-branch patterns for pull requests; empty accepts any base.
    #[serde(default)]
    pub pull_request_branches: Vec<String>,

    /// Changes that touch only these paths do not trigger a run.
    /// Applies to branch pushes and pull requests, never to tags.
    #[serde(default)]
    pub paths_ignore: Vec<String>,
}

impl TriggerFilter {
    /// Compile all patterns. Invalid patterns are configuration errors.
    pub fn compile(&self) -> Result<CompiledTrigger> {
        Ok(CompiledTrigger {
            push_branches: build_set("push_branches", &self.push_branches)?,
            tags: build_set("tags", &self.tags)?,
            pull_request: self.pull_request,
            pull_request_branches: build_set(
                "pull_request_branches",
                &self.pull_request_branches,
            )?,
            paths_ignore: build_set("paths_ignore", &self.paths_ignore)?,
        })
    }
}

fn build_set(field: &str, patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| WorkflowError::InvalidTrigger {
            field: field.to_string(),
            reason: e.to_string(),
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|e| WorkflowError::InvalidTrigger {
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Some(set))
}

/// A [`TriggerFilter`] with its glob patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledTrigger {
    push_branches: Option<GlobSet>,
    tags: Option<GlobSet>,
    pull_request: bool,
    pull_request_branches: Option<GlobSet>,
    paths_ignore: Option<GlobSet>,
}

impl CompiledTrigger {
    /// Whether `event` starts a run of the workflow.
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match &event.kind {
            TriggerKind::Push { branch } => {
                matches_set(&self.push_branches, branch) && !self.only_ignored(event)
            }
            TriggerKind::Tag { name } => matches_set(&self.tags, name),
            TriggerKind::PullRequest { base, .. } => {
                self.pull_request
                    && self
                        .pull_request_branches
                        .as_ref()
                        .map_or(true, |set| set.is_match(base))
                    && !self.only_ignored(event)
            }
        }
    }

    /// True when every changed path matches `paths_ignore`.
    fn only_ignored(&self, event: &TriggerEvent) -> bool {
        match &self.paths_ignore {
            Some(set) if !event.changed_paths.is_empty() => {
                event.changed_paths.iter().all(|p| set.is_match(p))
            }
            _ => false,
        }
    }
}

fn matches_set(set: &Option<GlobSet>, value: &str) -> bool {
    set.as_ref().is_some_and(|s| s.is_match(value))
}
