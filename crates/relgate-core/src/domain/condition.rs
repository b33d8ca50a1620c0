//! Run conditions for jobs and steps (`if = ...` in workflow files).

use std::collections::BTreeMap;

use globset::Glob;
use serde::{Deserialize, Serialize};

use crate::domain::trigger::{EventKind, TriggerEvent};

/// A boolean guard over the trigger and the matrix combination.
///
/// In TOML:
///
/// ```toml
/// if = { event = "tag" }
/// if = { all = [ { matrix = { axis = "python", equals = "3.10" } },
///                { not = { branch = "main" } } ] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Always,
    Event(EventKind),
    /// Trigger is a tag matching the glob.
    TagMatches(String),
    /// The run's branch equals this name (never true for tags).
    Branch(String),
    Matrix { axis: String, equals: String },
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

/// Inputs a condition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    pub trigger: &'a TriggerEvent,
    pub matrix: &'a BTreeMap<String, String>,
}

impl Condition {
    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> bool {
        match self {
            Condition::Always => true,
            Condition::Event(kind) => ctx.trigger.event_kind() == *kind,
            Condition::TagMatches(pattern) => match ctx.trigger.tag_name() {
                Some(tag) => Glob::new(pattern)
                    .map(|g| g.compile_matcher().is_match(tag))
                    .unwrap_or(false),
                None => false,
            },
            Condition::Branch(name) => ctx.trigger.branch() == Some(name.as_str()),
            Condition::Matrix { axis, equals } => {
                ctx.matrix.get(axis).map(String::as_str) == Some(equals.as_str())
            }
            Condition::All(conds) => conds.iter().all(|c| c.evaluate(ctx)),
            Condition::Any(conds) => conds.iter().any(|c| c.evaluate(ctx)),
            Condition::Not(inner) => !inner.evaluate(ctx),
        }
    }

    /// Matrix axes this condition reads.
    pub fn referenced_axes(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_axes(&mut out);
        out
    }

    fn collect_axes<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Matrix { axis, .. } => out.push(axis),
            Condition::All(conds) | Condition::Any(conds) => {
                conds.iter().for_each(|c| c.collect_axes(out))
            }
            Condition::Not(inner) => inner.collect_axes(out),
            _ => {}
        }
    }

    /// Check glob patterns; returns the first invalid pattern's error.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Condition::TagMatches(pattern) => Glob::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("invalid tag pattern '{pattern}': {e}")),
            Condition::All(conds) | Condition::Any(conds) => {
                conds.iter().try_for_each(Condition::validate)
            }
            Condition::Not(inner) => inner.validate(),
            _ => Ok(()),
        }
    }
}
