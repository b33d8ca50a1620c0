//! Publish/release gate rules engine.
//!
//! Evaluates a [`GateCandidate`] against a [`GateRuleSet`] to produce a
//! [`GateVerdict`], checked immediately before a `publish`- or `release`-role
//! job starts. A non-tag trigger only blocks (the job is skipped, not
//! failed); every other violation rejects the job.
//!
//! The gate cannot make a re-run on an already published tag idempotent.
//! Between a successful index upload and the release draft, a second run of
//! the same tag will attempt the upload again; only the index's own
//! duplicate-version rejection stops a double publish.

use serde::{Deserialize, Serialize};

use crate::domain::job::JobRole;
use crate::domain::status::JobStatus;
use crate::domain::trigger::TriggerEvent;

// ---------------------------------------------------------------------------
// Version helpers (manual, no external dep)
// ---------------------------------------------------------------------------

/// MAJOR.MINOR.PATCH with an optional pre/dev suffix (`-rc.1`, `dev.0`, `b2`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub suffix: Option<String>,
}

impl ReleaseVersion {
    /// Parse a version, ignoring a leading `v`.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.strip_prefix('v').unwrap_or(input);
        let mut parts = input.splitn(3, '.');
        let major = parts.next()?.parse::<u64>().ok()?;
        let minor = parts.next()?.parse::<u64>().ok()?;
        let rest = parts.next()?;

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let patch = rest[..digits].parse::<u64>().ok()?;

        let suffix = rest[digits..].trim_start_matches(['-', '.', '+']);
        let suffix = if suffix.is_empty() {
            if rest.len() > digits {
                return None;
            }
            None
        } else {
            if !suffix
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'+'))
            {
                return None;
            }
            Some(suffix.to_string())
        };

        Some(Self {
            major,
            minor,
            patch,
            suffix,
        })
    }
}

impl std::fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "{suffix}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gate candidate (input to the gate)
// ---------------------------------------------------------------------------

/// Terminal status of one job the gated job needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpstreamStatus {
    pub job: String,
    pub role: Option<JobRole>,
    pub status: JobStatus,
}

/// The job about to start, as seen by the gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateCandidate {
    pub trigger: TriggerEvent,
    /// Every job instance the gated job needs, with its terminal status.
    pub upstream: Vec<UpstreamStatus>,
    /// Version attribute read from source, when package metadata exists.
    pub package_version: Option<String>,
}

// ---------------------------------------------------------------------------
// Gate rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateRule {
    /// The trigger must be a tag push.
    TagTrigger,
    /// Every needed job instance succeeded.
    UpstreamGreen,
    /// The tag, minus a leading `v`, parses as a version.
    SemverTag,
    /// The tag version equals the version attribute in source.
    TagMatchesPackageVersion,
    /// A `publish`-role job among the needs succeeded.
    PublisherSucceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateRuleSet {
    pub rules: Vec<GateRule>,
    pub fail_fast: bool,
}

impl GateRuleSet {
    /// Rules for a `publish`-role job.
    pub fn publish() -> Self {
        Self {
            rules: vec![
                GateRule::TagTrigger,
                GateRule::UpstreamGreen,
                GateRule::SemverTag,
                GateRule::TagMatchesPackageVersion,
            ],
            fail_fast: false,
        }
    }

    /// Rules for a `release`-role job.
    pub fn release() -> Self {
        Self {
            rules: vec![
                GateRule::TagTrigger,
                GateRule::UpstreamGreen,
                GateRule::PublisherSucceeded,
            ],
            fail_fast: false,
        }
    }

    pub fn for_role(role: JobRole) -> Self {
        match role {
            JobRole::Publish => Self::publish(),
            JobRole::Release => Self::release(),
        }
    }

    pub fn with_rule(mut self, rule: GateRule) -> Self {
        self.rules.push(rule);
        self
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateViolation {
    pub rule: GateRule,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    pub passed: bool,
    pub violations: Vec<GateViolation>,
}

impl GateVerdict {
    fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn fail(violations: Vec<GateViolation>) -> Self {
        Self {
            passed: false,
            violations,
        }
    }

    /// The only violation is a non-tag trigger: skip rather than fail.
    pub fn blocked_by_trigger_only(&self) -> bool {
        !self.passed
            && self
                .violations
                .iter()
                .all(|v| v.rule == GateRule::TagTrigger)
    }

    pub fn reasons(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.reason.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Evaluate `candidate` against `rule_set`. With `fail_fast`, evaluation
/// stops at the first violation.
pub fn evaluate_release_gate(rule_set: &GateRuleSet, candidate: &GateCandidate) -> GateVerdict {
    let mut violations = Vec::new();

    for rule in &rule_set.rules {
        if let Some(v) = check_rule(*rule, candidate) {
            violations.push(v);
            if rule_set.fail_fast {
                return GateVerdict::fail(violations);
            }
        }
    }

    if violations.is_empty() {
        GateVerdict::pass()
    } else {
        GateVerdict::fail(violations)
    }
}

fn violation(rule: GateRule, reason: String) -> Option<GateViolation> {
    Some(GateViolation { rule, reason })
}

fn check_rule(rule: GateRule, candidate: &GateCandidate) -> Option<GateViolation> {
    match rule {
        GateRule::TagTrigger => {
            if candidate.trigger.is_tag() {
                None
            } else {
                violation(rule, format!("trigger is {}, not a tag push", candidate.trigger))
            }
        }

        GateRule::UpstreamGreen => {
            let red: Vec<String> = candidate
                .upstream
                .iter()
                .filter(|u| !u.status.is_success())
                .map(|u| format!("{} {}", u.job, u.status.label()))
                .collect();
            if red.is_empty() {
                None
            } else {
                violation(rule, format!("needed jobs not green: {}", red.join(", ")))
            }
        }

        GateRule::SemverTag => {
            let tag = candidate.trigger.tag_name()?;
            match ReleaseVersion::parse(tag) {
                Some(_) => None,
                None => violation(
                    rule,
                    format!("tag '{tag}' is not a version (expected vMAJOR.MINOR.PATCH)"),
                ),
            }
        }

        GateRule::TagMatchesPackageVersion => {
            let tag = candidate.trigger.tag_name()?;
            let package_version = candidate.package_version.as_deref()?;
            // An unparsable tag is reported by SemverTag.
            let tag_version = ReleaseVersion::parse(tag)?;
            if ReleaseVersion::parse(package_version).as_ref() == Some(&tag_version) {
                None
            } else {
                violation(
                    rule,
                    format!(
                        "tag '{tag}' does not match package version '{package_version}'"
                    ),
                )
            }
        }

        GateRule::PublisherSucceeded => {
            let published = candidate
                .upstream
                .iter()
                .any(|u| u.role == Some(JobRole::Publish) && u.status.is_success());
            if published {
                None
            } else {
                violation(rule, "no publish job succeeded".to_string())
            }
        }
    }
}
