use std::collections::BTreeMap;

use relgate_core::{
    ConditionContext, FailureReason, GraphEvaluation, JobStatus, Readiness, SkipReason,
    TriggerEvent, Workflow,
};

const WORKFLOW: &str = r#"
name = "release"

[on]
push_branches = ["main"]
tags = ["v*"]
pull_request = true
paths_ignore = ["*.md", "docs/**", "LICENSE"]

[jobs.lint]
steps = [{ name = "black", run = ["black", "--check", "."] }]

[jobs.unit-tests]
matrix = { python = ["3.7", "3.8", "3.9", "3.10"], group = ["test", "mock_tests"] }
steps = [
  { name = "pytest", run = ["pytest", "${{ matrix.group }}"] },
  { name = "codecov", run = ["codecov"], if = { all = [ { matrix = { axis = "python", equals = "3.10" } }, { not = { branch = "main" } } ] } },
]

[jobs.integration-tests]
matrix = { python = ["3.7", "3.8", "3.9", "3.10"] }
steps = [{ name = "pytest", run = ["pytest", "integration"] }]

[jobs.build]
needs = ["lint", "unit-tests", "integration-tests"]
steps = [{ name = "build", run = ["python", "-m", "build"] }]

[jobs.publish]
role = "publish"
needs = ["build"]
if = { event = "tag" }
secrets = [{ name = "PYPI_API_TOKEN" }]
steps = [{ name = "upload", uses = { publish_package = { path = "dist/*", token_secret = "PYPI_API_TOKEN" } } }]

[jobs.gh-release]
role = "release"
needs = ["publish"]
secrets = [{ name = "GITHUB_TOKEN" }]
steps = [{ name = "draft", uses = { create_release = { path = "dist/*.whl" } } }]
"#;

fn failed() -> JobStatus {
    JobStatus::failed(FailureReason::StepFailed {
        step: "black".to_string(),
        exit_code: 1,
    })
}

/// Drive the evaluation to completion, failing `failing` and treating every
/// other job whose `if` holds as successful.
fn simulate(workflow: &Workflow, trigger: &TriggerEvent, failing: &str) -> BTreeMap<String, JobStatus> {
    let graph = workflow.plan().unwrap();
    let mut eval = GraphEvaluation::new(&graph);
    let mut order = Vec::new();
    loop {
        let ready = eval.advance();
        if ready.is_empty() {
            break;
        }
        for item in ready {
            if let Readiness::Run(id) = item {
                let job = graph.job(&id).unwrap();
                let ctx = ConditionContext {
                    trigger,
                    matrix: &job.matrix,
                };
                let status = match &job.condition {
                    Some(c) if !c.evaluate(&ctx) => JobStatus::skipped(SkipReason::ConditionNotMet),
                    _ if job.template == failing => failed(),
                    _ => JobStatus::Succeeded,
                };
                order.push(id.clone());
                eval.complete(&id, status);
            }
        }
    }
    assert!(eval.is_finished());

    // Every job ran only after all of its dependencies had finished.
    for (pos, id) in order.iter().enumerate() {
        for dep in graph.dependencies_of(id).unwrap() {
            if let Some(dep_pos) = order.iter().position(|o| *o == dep.id) {
                assert!(dep_pos < pos, "{} ran before its need {}", id, dep.id);
            }
        }
    }
    eval.statuses().into_iter().collect()
}

#[test]
fn bundled_shape_expands_to_expected_instances() {
    let wf = Workflow::from_toml_str(WORKFLOW).unwrap();
    let graph = wf.plan().unwrap();
    // lint + 8 unit + 4 integration + build + publish + release
    assert_eq!(graph.len(), 16);
    let build_deps = graph.dependencies_of("build").unwrap();
    assert_eq!(build_deps.len(), 13);
}

#[test]
fn lint_failure_prunes_publish_but_not_tests() {
    let wf = Workflow::from_toml_str(WORKFLOW).unwrap();
    let statuses = simulate(&wf, &TriggerEvent::tag("v3.10.0"), "lint");

    assert!(statuses["lint"].is_failure());
    assert!(statuses["unit-tests (test, 3.10)"].is_success());
    assert!(statuses["integration-tests (3.7)"].is_success());
    assert_eq!(
        statuses["build"],
        JobStatus::skipped(SkipReason::UpstreamFailed {
            job: "lint".to_string()
        })
    );
    assert!(statuses["publish"].is_skipped());
    assert!(statuses["gh-release"].is_skipped());
}

#[test]
fn push_to_main_skips_publish_and_release() {
    let wf = Workflow::from_toml_str(WORKFLOW).unwrap();
    let statuses = simulate(&wf, &TriggerEvent::push("main"), "");
    assert!(statuses["build"].is_success());
    assert_eq!(
        statuses["publish"],
        JobStatus::skipped(SkipReason::ConditionNotMet)
    );
    assert_eq!(
        statuses["gh-release"],
        JobStatus::skipped(SkipReason::UpstreamSkipped {
            job: "publish".to_string()
        })
    );
    assert!(statuses.values().all(|s| !s.is_failure()));
}

#[test]
fn tag_all_green_reaches_release() {
    let wf = Workflow::from_toml_str(WORKFLOW).unwrap();
    let statuses = simulate(&wf, &TriggerEvent::tag("v3.10.0"), "");
    assert!(statuses["publish"].is_success());
    assert!(statuses["gh-release"].is_success());
}

#[test]
fn trigger_filter_ignores_docs_only_push() {
    let wf = Workflow::from_toml_str(WORKFLOW).unwrap();
    let filter = wf.on.compile().unwrap();
    assert!(!filter.matches(&TriggerEvent::push("main").with_changed_paths(["README.md"])));
    assert!(filter.matches(&TriggerEvent::push("main").with_changed_paths(["weaviate/client.py"])));
    assert!(filter.matches(&TriggerEvent::tag("v3.10.0").with_changed_paths(["README.md"])));
}
