//! Command step execution.
//!
//! Steps run as child processes with an explicit argv; no shell is involved.
//! The child starts from a cleared environment: only the passthrough
//! variables of the orchestrator, the step's own variables and the job's
//! bound secrets reach it. Captured output is redacted before it is stored.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use relgate_core::SecretScope;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// Terminal state of a single step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Condition false, or an earlier step failed.
    Skipped,
    TimedOut,
}

/// Result of a step execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,

    /// Process exit code; `None` for builtin actions, skipped steps and
    /// killed processes.
    pub exit_code: Option<i32>,

    /// Captured stdout, secrets redacted.
    pub stdout: String,

    /// Captured stderr (or action error detail), secrets redacted.
    pub stderr: String,

    pub duration_ms: u64,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    pub fn skipped(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
        }
    }
}

/// Orchestrator variables a step inherits unless configured otherwise.
pub const DEFAULT_ENV_PASSTHROUGH: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "LANG", "LC_ALL", "TERM", "TMPDIR", "TZ",
];

/// Snapshot the `passthrough` variables set in this process, leaving out
/// every name in `withheld`.
pub fn inherited_env<S: AsRef<str>>(
    passthrough: &[S],
    withheld: &BTreeSet<String>,
) -> BTreeMap<String, String> {
    passthrough
        .iter()
        .map(|name| name.as_ref())
        .filter(|name| !withheld.contains(*name))
        .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
        .collect()
}

/// A fully resolved command step.
#[derive(Debug, Clone)]
pub struct StepCommand {
    pub name: String,
    /// First element is the executable.
    pub argv: Vec<String>,
    /// Inherited orchestrator variables; nothing else of the parent
    /// environment reaches the child.
    pub base_env: BTreeMap<String, String>,
    /// Job and step environment (non-secret).
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub timeout: Option<Duration>,
}

/// Step runner that executes one command and captures its output.
pub struct CiRunner;

impl CiRunner {
    /// Execute `command` with `secrets` bound into its environment.
    ///
    /// Non-zero exit and timeout are reported in the [`StepResult`]; an
    /// `Err` means the process could not be started.
    pub async fn execute(command: &StepCommand, secrets: &SecretScope) -> anyhow::Result<StepResult> {
        let start = Instant::now();

        let (exe, args) = command
            .argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("step {} has empty argv", command.name))?;

        debug!(step = %command.name, program = %exe, "spawning step");
        let child = Command::new(exe)
            .args(args)
            .env_clear()
            .envs(&command.base_env)
            .envs(&command.env)
            .envs(secrets.env_vars())
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to start {exe}: {e}"))?;

        let output = match command.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    return Ok(StepResult {
                        step_name: command.name.clone(),
                        status: StepStatus::TimedOut,
                        exit_code: None,
                        stdout: String::new(),
                        stderr: format!("timed out after {}s", limit.as_secs()),
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
            },
            None => child.wait_with_output().await?,
        };

        let status = if output.status.success() {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };

        Ok(StepResult {
            step_name: command.name.clone(),
            status,
            exit_code: output.status.code(),
            stdout: secrets.redact(&String::from_utf8_lossy(&output.stdout)),
            stderr: secrets.redact(&String::from_utf8_lossy(&output.stderr)),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_core::{MemorySecretStore, SecretInjector, SecretRef};

    fn command(name: &str, argv: &[&str]) -> StepCommand {
        StepCommand {
            name: name.to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            base_env: inherited_env(DEFAULT_ENV_PASSTHROUGH, &BTreeSet::new()),
            env: BTreeMap::new(),
            cwd: std::env::temp_dir(),
            timeout: Some(Duration::from_secs(60)),
        }
    }

    #[test]
    fn test_step_result_passed() {
        let result = StepResult {
            step_name: "flake8".to_string(),
            status: StepStatus::Succeeded,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 100,
        };
        assert!(result.passed());
        assert!(!StepResult::skipped("codecov").passed());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let result = CiRunner::execute(&command("echo", &["echo", "hello"]), &SecretScope::empty())
            .await
            .expect("execute failed");
        assert!(result.passed());
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let result = CiRunner::execute(&command("false", &["false"]), &SecretScope::empty())
            .await
            .expect("execute failed");
        assert_eq!(result.status, StepStatus::Failed);
        assert_ne!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_timeout_reported() {
        let mut cmd = command("sleep", &["sleep", "10"]);
        cmd.timeout = Some(Duration::from_millis(200));
        let result = CiRunner::execute(&cmd, &SecretScope::empty()).await.unwrap();
        assert_eq!(result.status, StepStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_env_and_secret_binding_redacted() {
        let store = MemorySecretStore::new().with("PYPI_API_TOKEN", "pypi-secret-value");
        let secrets =
            SecretInjector::bind("publish", &[SecretRef::required("PYPI_API_TOKEN")], &store)
                .unwrap();
        let mut cmd = command(
            "print",
            &["sh", "-c", "echo $GREETING $PYPI_API_TOKEN"],
        );
        cmd.env.insert("GREETING".to_string(), "hi".to_string());
        let result = CiRunner::execute(&cmd, &secrets).await.unwrap();
        assert!(result.passed());
        assert_eq!(result.stdout.trim(), "hi ***");
    }

    #[tokio::test]
    async fn test_parent_environment_not_inherited() {
        std::env::set_var("RELGATE_RUNNER_LEAK_TOKEN", "pypi-leaked-value");
        let cmd = command(
            "print",
            &["sh", "-c", "echo token=$RELGATE_RUNNER_LEAK_TOKEN"],
        );
        let result = CiRunner::execute(&cmd, &SecretScope::empty()).await.unwrap();
        assert!(result.passed());
        assert_eq!(result.stdout.trim(), "token=");
    }

    #[test]
    fn test_inherited_env_drops_withheld_names() {
        std::env::set_var("RELGATE_RUNNER_PASSTHROUGH", "kept");
        std::env::set_var("RELGATE_RUNNER_WITHHELD", "secret");
        let withheld = BTreeSet::from(["RELGATE_RUNNER_WITHHELD".to_string()]);
        let env = inherited_env(
            &["RELGATE_RUNNER_PASSTHROUGH", "RELGATE_RUNNER_WITHHELD", "RELGATE_RUNNER_UNSET"],
            &withheld,
        );
        assert_eq!(
            env,
            BTreeMap::from([("RELGATE_RUNNER_PASSTHROUGH".to_string(), "kept".to_string())])
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_error() {
        let result = CiRunner::execute(
            &command("nope", &["relgate-definitely-missing-binary"]),
            &SecretScope::empty(),
        )
        .await;
        assert!(result.is_err());
    }
}
