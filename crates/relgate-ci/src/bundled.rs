//! The bundled release workflow of the Python client library.

use relgate_core::Workflow;

/// Source of the bundled workflow.
pub const RELEASE_WORKFLOW: &str = include_str!("../workflows/release.toml");

/// Parse and validate the bundled workflow.
pub fn bundled_workflow() -> relgate_core::Result<Workflow> {
    Workflow::from_toml_str(RELEASE_WORKFLOW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_core::JobRole;

    #[test]
    fn test_bundled_workflow_is_valid() {
        let workflow = bundled_workflow().unwrap();
        assert_eq!(workflow.name, "release");
        assert_eq!(workflow.jobs["publish"].role, Some(JobRole::Publish));
        assert_eq!(workflow.jobs["gh-release"].role, Some(JobRole::Release));
        let package = workflow.package.as_ref().unwrap();
        assert_eq!(package.runtime_floor().unwrap().as_deref(), Some("3.7"));
    }

    #[test]
    fn test_bundled_plan_shape() {
        let plan = bundled_workflow().unwrap().execution_plan().unwrap();
        // lint + 8 unit + 4 integration + build + publish + release
        assert_eq!(plan.steps.len(), 16);
        let groups = plan.parallel_groups();
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[0].len(), 13);
        assert_eq!(groups[3][0].job_id, "gh-release");
    }

    #[test]
    fn test_integration_secrets_are_optional() {
        let workflow = bundled_workflow().unwrap();
        let secrets = &workflow.jobs["integration-tests"].secrets;
        assert_eq!(secrets.len(), 4);
        assert!(secrets.iter().all(|s| s.optional));
        assert!(workflow.jobs["unit-tests"].secrets.is_empty());
    }
}
