//! relgate - release-gating pipeline orchestrator CLI
//!
//! ## Commands
//!
//! - `validate`: Check a workflow definition without running anything
//! - `plan`: Show the expanded job instances grouped by execution level
//! - `run`: Execute the workflow for a trigger event
//! - `metadata`: Show the package metadata and the version read from source
//! - `artifacts`: Inspect or sweep stored artifacts
//!
//! Without `--workflow`, the bundled release workflow is used.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use relgate_ci::{bundled_workflow, CiGate, CiPipeline, PipelineConfig, PipelineResult};
use relgate_core::{ArtifactStore, EnvSecretStore, FsArtifactStore, TriggerEvent, Workflow};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "relgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Release-gating pipeline orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Workflow file (default: bundled release workflow)
    #[arg(short, long, global = true, env = "RELGATE_WORKFLOW")]
    workflow: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Event {
    Push,
    Tag,
    #[value(name = "pr", alias = "pull-request")]
    PullRequest,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the workflow definition
    Validate,

    /// Show the execution plan
    Plan {
        /// Print the plan as JSON
        #[arg(long)]
        as_json: bool,
    },

    /// Run the workflow for a trigger event
    Run {
        /// Trigger event kind
        #[arg(long, value_enum, default_value = "push")]
        event: Event,

        /// Branch name (push), tag name (tag) or head branch (pr)
        #[arg(long = "ref", default_value = "main")]
        reference: String,

        /// Pull-request base branch
        #[arg(long, default_value = "main")]
        base: String,

        /// Changed paths (repeatable or comma-separated)
        #[arg(long, value_delimiter = ',')]
        changed: Vec<String>,

        /// Commit SHA the run is evaluated at
        #[arg(long)]
        sha: Option<String>,

        /// Source tree to run in (overrides RELGATE_WORKSPACE)
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Artifact store root (overrides RELGATE_ARTIFACT_DIR)
        #[arg(long)]
        artifact_dir: Option<PathBuf>,

        /// Maximum concurrently running jobs (overrides RELGATE_MAX_PARALLEL)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Read secrets from environment variables with this prefix
        #[arg(long, env = "RELGATE_SECRET_PREFIX", default_value = "")]
        secret_prefix: String,

        /// Write the run report (JSON) to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show package metadata
    Metadata {
        /// Source tree holding the version file
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },

    /// Artifact store operations
    Artifacts {
        /// Artifact store root (default: RELGATE_ARTIFACT_DIR or .relgate)
        #[arg(long)]
        artifact_dir: Option<PathBuf>,

        #[command(subcommand)]
        action: ArtifactsAction,
    },
}

#[derive(Subcommand)]
enum ArtifactsAction {
    /// List artifacts of every stored run
    List,

    /// Delete artifacts past their retention
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    relgate_core::telemetry::init_tracing(cli.json, level);

    let workflow_path = cli.workflow.as_deref();
    match cli.command {
        Commands::Validate => cmd_validate(workflow_path),
        Commands::Plan { as_json } => cmd_plan(workflow_path, as_json),
        Commands::Run {
            event,
            reference,
            base,
            changed,
            sha,
            workspace,
            artifact_dir,
            max_parallel,
            secret_prefix,
            report,
        } => {
            let trigger = build_trigger(event, &reference, &base, changed, sha);
            let mut config = PipelineConfig::from_env()?;
            if let Some(workspace) = workspace {
                config = config.with_workspace(workspace);
            }
            if let Some(dir) = artifact_dir {
                config = config.with_artifact_dir(dir);
            }
            if let Some(n) = max_parallel {
                config = config.with_max_parallel(n);
            }
            cmd_run(
                workflow_path,
                trigger,
                config,
                &secret_prefix,
                report.as_deref(),
            )
            .await
        }
        Commands::Metadata { workspace } => cmd_metadata(workflow_path, &workspace),
        Commands::Artifacts {
            artifact_dir,
            action,
        } => {
            let root = match artifact_dir {
                Some(dir) => dir,
                None => PipelineConfig::from_env()?.artifact_dir,
            };
            match action {
                ArtifactsAction::List => cmd_artifacts_list(&root),
                ArtifactsAction::Sweep => cmd_artifacts_sweep(&root),
            }
        }
    }
}

fn load_workflow(path: Option<&Path>) -> Result<Workflow> {
    match path {
        Some(path) => Workflow::load(path)
            .with_context(|| format!("Failed to load workflow {}", path.display())),
        None => bundled_workflow().context("Bundled workflow is invalid"),
    }
}

fn build_trigger(
    event: Event,
    reference: &str,
    base: &str,
    changed: Vec<String>,
    sha: Option<String>,
) -> TriggerEvent {
    let trigger = match event {
        Event::Push => TriggerEvent::push(reference),
        Event::Tag => TriggerEvent::tag(reference),
        Event::PullRequest => TriggerEvent::pull_request(base, reference),
    };
    let trigger = trigger.with_changed_paths(changed);
    match sha {
        Some(sha) => trigger.with_sha(sha),
        None => trigger,
    }
}

fn cmd_validate(path: Option<&Path>) -> Result<()> {
    let workflow = load_workflow(path)?;
    let graph = workflow.plan()?;
    println!("✓ Workflow '{}' is valid", workflow.name);
    println!("  Templates: {}", workflow.jobs.len());
    println!("  Job instances: {}", graph.len());
    println!("  Digest: {}", workflow.digest()?);
    Ok(())
}

fn cmd_plan(path: Option<&Path>, as_json: bool) -> Result<()> {
    let workflow = load_workflow(path)?;
    let plan = workflow.execution_plan()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Plan: {}", plan.title);
    for (level, group) in plan.parallel_groups().iter().enumerate() {
        println!();
        println!("Level {} ({} job(s)):", level, group.len());
        for step in group {
            if step.depends_on.is_empty() {
                println!("  {}", step.job_id);
            } else {
                println!("  {}  (needs {})", step.job_id, step.depends_on.len());
            }
        }
    }
    Ok(())
}

async fn cmd_run(
    path: Option<&Path>,
    trigger: TriggerEvent,
    config: PipelineConfig,
    secret_prefix: &str,
    report: Option<&Path>,
) -> Result<()> {
    let workflow = load_workflow(path)?;

    println!("Running workflow '{}' for {}", workflow.name, trigger);
    println!("Workspace: {}", config.workspace.display());
    println!();

    let secrets = Arc::new(EnvSecretStore::with_prefix(secret_prefix));
    let pipeline = CiPipeline::new(config, secrets);
    let result = pipeline
        .run(&workflow, trigger)
        .await
        .context("Pipeline failed to run")?;

    if let Some(report) = report {
        std::fs::write(report, result.to_json()?)
            .with_context(|| format!("Failed to write report {}", report.display()))?;
        info!(report = %report.display(), "run report written");
    }

    print_result(&result);

    let verdict = CiGate::evaluate(&result);
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    println!("{}", verdict.message);
    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {}", violation);
        }
    }

    if result.success && verdict.passed {
        Ok(())
    } else {
        anyhow::bail!("Pipeline failed")
    }
}

fn print_result(result: &PipelineResult) {
    println!("Run ID: {}", result.run_id);
    if !result.triggered {
        println!("Trigger filtered out; no jobs ran.");
        return;
    }
    println!("Status: {}", if result.success { "✓ PASSED" } else { "✗ FAILED" });
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for job in &result.jobs {
        let mark = if job.status.is_success() {
            "✓"
        } else if job.status.is_failure() {
            "✗"
        } else {
            "-"
        };
        println!("  {} {} ({}, {}ms)", mark, job.id, job.status, job.duration_ms);
    }

    println!();
    println!(
        "Summary: {} passed, {} failed, {} skipped",
        result.passed_count(),
        result.failed_count(),
        result.skipped_count()
    );
}

fn cmd_metadata(path: Option<&Path>, workspace: &Path) -> Result<()> {
    let workflow = load_workflow(path)?;
    let package = workflow
        .package
        .as_ref()
        .context("Workflow declares no [package] table")?;
    let version = package.resolve_version(workspace).ok();
    let dependencies = package.dependency_constraints()?;
    let out = json!({
        "name": package.name,
        "version": version,
        "description": package.description,
        "author": package.author,
        "license": package.license,
        "urls": package.urls,
        "packages": package.packages,
        "dependencies": dependencies,
        "python_requires": package.python_requires,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Per-run artifact stores under `root`.
fn run_stores(root: &Path) -> Result<Vec<(String, FsArtifactStore)>> {
    let mut stores = Vec::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stores),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", root.display())),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let run_id = entry.file_name().to_string_lossy().into_owned();
            stores.push((run_id, FsArtifactStore::new(entry.path())?));
        }
    }
    stores.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(stores)
}

fn cmd_artifacts_list(root: &Path) -> Result<()> {
    for (run_id, store) in run_stores(root)? {
        for manifest in store.list()? {
            println!(
                "{}  {}  {} file(s)  {} bytes  expires {}{}",
                run_id,
                manifest.name,
                manifest.files.len(),
                manifest.total_size(),
                manifest.expires_at.to_rfc3339(),
                if manifest.usable { "" } else { "  (unusable)" }
            );
        }
    }
    Ok(())
}

fn sweep(root: &Path) -> Result<usize> {
    let now = Utc::now();
    let mut removed = 0;
    for (run_id, store) in run_stores(root)? {
        for name in store.sweep_expired(now)? {
            println!("Removed {} from run {}", name, run_id);
            removed += 1;
        }
    }
    Ok(removed)
}

fn cmd_artifacts_sweep(root: &Path) -> Result<()> {
    let removed = sweep(root)?;
    println!("✓ {} expired artifact(s) removed", removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_core::{EventKind, UploadRequest};

    #[test]
    fn test_build_trigger() {
        let trigger = build_trigger(Event::Tag, "v3.10.0", "main", vec![], None);
        assert_eq!(trigger.tag_name(), Some("v3.10.0"));

        let trigger = build_trigger(
            Event::PullRequest,
            "feature/x",
            "main",
            vec!["README.md".to_string()],
            Some("abc123".to_string()),
        );
        assert_eq!(trigger.event_kind(), EventKind::PullRequest);
        assert_eq!(trigger.branch(), Some("feature/x"));
        assert_eq!(trigger.sha.as_deref(), Some("abc123"));
        assert_eq!(trigger.changed_paths, vec!["README.md".to_string()]);
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from([
            "relgate",
            "run",
            "--event",
            "pr",
            "--ref",
            "feature/x",
            "--changed",
            "a.py,b.py",
            "--max-parallel",
            "2",
        ]);
        match cli.command {
            Commands::Run {
                event,
                changed,
                max_parallel,
                ..
            } => {
                assert_eq!(event, Event::PullRequest);
                assert_eq!(changed, vec!["a.py".to_string(), "b.py".to_string()]);
                assert_eq!(max_parallel, Some(2));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_default_workflow_is_bundled() {
        let workflow = load_workflow(None).unwrap();
        assert_eq!(workflow.name, "release");
        assert!(workflow.jobs.contains_key("gh-release"));
    }

    #[test]
    fn test_sweep_removes_expired_runs() {
        let root = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.whl"), b"x").unwrap();

        let store = FsArtifactStore::new(root.path().join("run-1")).unwrap();
        store
            .upload(UploadRequest {
                name: "dist".to_string(),
                producer: "build".to_string(),
                root: source.path().to_path_buf(),
                files: vec![PathBuf::from("a.whl")],
                retention_days: 5,
                now: Utc::now() - chrono::Duration::days(6),
            })
            .unwrap();

        assert_eq!(sweep(root.path()).unwrap(), 1);
        assert!(store.list().unwrap().is_empty());
        assert_eq!(sweep(root.path()).unwrap(), 0);
    }
}
