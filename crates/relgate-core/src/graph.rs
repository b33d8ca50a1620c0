//! Job dependency graph and topological execution planning.
//!
//! Nodes are concrete job instances. An edge `A → B` means "B needs A": A
//! must finish successfully before B may start. A `needs` entry names a job
//! template, so a dependent waits for every matrix instance of that template.
//!
//! Ordering uses Kahn's algorithm; when it cannot drain the graph a DFS
//! recovers one concrete cycle path for the error message.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::job::ConcreteJob;

/// Structural errors in the job graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle detected: {}", jobs.join(" -> "))]
    DependencyCycle { jobs: Vec<String> },

    #[error("job '{job}' needs unknown job '{need}'")]
    UnknownNeed { job: String, need: String },

    #[error("duplicate job id '{job}'")]
    DuplicateJob { job: String },

    #[error("job '{job}' needs itself")]
    SelfDependency { job: String },

    #[error("job not found: {job}")]
    JobNotFound { job: String },
}

/// A step in a job execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// 0-indexed position in the plan.
    pub position: usize,
    pub job_id: String,
    /// Kahn wave the job belongs to; jobs of one level are independent.
    pub level: usize,
    /// Jobs whose completion this step waits for.
    pub depends_on: Vec<String>,
    /// True when other jobs share this step's level.
    pub parallelizable: bool,
}

/// An ordered execution plan for one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub title: String,
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Partition steps into levels: each group may run concurrently.
    pub fn parallel_groups(&self) -> Vec<Vec<&PlanStep>> {
        let mut groups: Vec<Vec<&PlanStep>> = Vec::new();
        for step in &self.steps {
            match groups.last_mut() {
                Some(group) if group[0].level == step.level => group.push(step),
                _ => groups.push(vec![step]),
            }
        }
        groups
    }
}

/// Directed dependency graph over [`ConcreteJob`]s.
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    jobs: BTreeMap<String, ConcreteJob>,
    /// `dependency_id → {dependent_id, ...}`
    downstream: BTreeMap<String, BTreeSet<String>>,
    /// `dependent_id → {dependency_id, ...}`
    upstream: BTreeMap<String, BTreeSet<String>>,
}

impl JobGraph {
    /// Build the graph from expanded job instances.
    ///
    /// Fails on duplicate instance ids, needs naming unknown or own templates,
    /// and dependency cycles.
    pub fn build(jobs: Vec<ConcreteJob>) -> Result<Self, GraphError> {
        let mut graph = JobGraph::default();
        let mut instances: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for job in jobs {
            if graph.jobs.contains_key(&job.id) {
                return Err(GraphError::DuplicateJob { job: job.id });
            }
            instances
                .entry(job.template.clone())
                .or_default()
                .push(job.id.clone());
            graph.downstream.entry(job.id.clone()).or_default();
            graph.upstream.entry(job.id.clone()).or_default();
            graph.jobs.insert(job.id.clone(), job);
        }

        let mut edges: Vec<(String, String)> = Vec::new();
        for job in graph.jobs.values() {
            for need in &job.needs {
                if *need == job.template {
                    return Err(GraphError::SelfDependency {
                        job: job.template.clone(),
                    });
                }
                let providers = instances.get(need).ok_or_else(|| GraphError::UnknownNeed {
                    job: job.template.clone(),
                    need: need.clone(),
                })?;
                for provider in providers {
                    edges.push((provider.clone(), job.id.clone()));
                }
            }
        }
        for (dependency, dependent) in edges {
            graph
                .downstream
                .entry(dependency.clone())
                .or_default()
                .insert(dependent.clone());
            graph.upstream.entry(dependent).or_default().insert(dependency);
        }

        graph.kahn_levels()?;
        Ok(graph)
    }

    pub fn job(&self, id: &str) -> Option<&ConcreteJob> {
        self.jobs.get(id)
    }

    /// All jobs in id order.
    pub fn jobs(&self) -> impl Iterator<Item = &ConcreteJob> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Direct dependencies of `id` (jobs it needs).
    pub fn dependencies_of(&self, id: &str) -> Result<Vec<&ConcreteJob>, GraphError> {
        let ids = self.upstream.get(id).ok_or_else(|| GraphError::JobNotFound {
            job: id.to_string(),
        })?;
        Ok(ids.iter().filter_map(|i| self.jobs.get(i)).collect())
    }

    /// Direct dependents of `id` (jobs that need it).
    pub fn dependents_of(&self, id: &str) -> Result<Vec<&ConcreteJob>, GraphError> {
        let ids = self
            .downstream
            .get(id)
            .ok_or_else(|| GraphError::JobNotFound {
                job: id.to_string(),
            })?;
        Ok(ids.iter().filter_map(|i| self.jobs.get(i)).collect())
    }

    /// All transitive dependents of `id` (BFS over downstream edges).
    pub fn transitive_dependents_of(&self, id: &str) -> Result<Vec<String>, GraphError> {
        if !self.jobs.contains_key(id) {
            return Err(GraphError::JobNotFound {
                job: id.to_string(),
            });
        }

        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(id.to_string());

        while let Some(current) = queue.pop_front() {
            if let Some(deps) = self.downstream.get(&current) {
                for dep in deps {
                    if visited.insert(dep.clone()) {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }

        Ok(visited.into_iter().collect())
    }

    /// Job ids in topological order (dependencies first). Deterministic:
    /// ties within a level are broken by id.
    pub fn topological_order(&self) -> Vec<String> {
        // Cycles were rejected in `build`.
        self.kahn_levels()
            .map(|levels| levels.into_iter().map(|(id, _)| id).collect())
            .unwrap_or_default()
    }

    /// Convert to an [`ExecutionPlan`] with Kahn levels.
    pub fn to_execution_plan(&self, title: &str) -> Result<ExecutionPlan, GraphError> {
        let levels = self.kahn_levels()?;

        let mut level_counts: BTreeMap<usize, usize> = BTreeMap::new();
        for (_, level) in &levels {
            *level_counts.entry(*level).or_default() += 1;
        }

        let steps = levels
            .into_iter()
            .enumerate()
            .map(|(position, (id, level))| PlanStep {
                position,
                depends_on: self
                    .upstream
                    .get(&id)
                    .into_iter()
                    .flatten()
                    .cloned()
                    .collect(),
                parallelizable: level_counts.get(&level).copied().unwrap_or(1) > 1,
                job_id: id,
                level,
            })
            .collect();

        Ok(ExecutionPlan {
            title: title.to_string(),
            steps,
        })
    }

    /// Kahn's algorithm with level tracking. Output is sorted by
    /// `(level, id)`.
    fn kahn_levels(&self) -> Result<Vec<(String, usize)>, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .jobs
            .keys()
            .map(|id| (id.as_str(), self.upstream.get(id).map_or(0, BTreeSet::len)))
            .collect();

        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut sorted: Vec<(String, usize)> = Vec::with_capacity(self.jobs.len());
        let mut level = 0usize;

        while !current.is_empty() {
            let mut next: Vec<&str> = Vec::new();
            for id in &current {
                sorted.push((id.to_string(), level));
                for dependent in self.downstream.get(*id).into_iter().flatten() {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push(dependent.as_str());
                        }
                    }
                }
            }
            next.sort_unstable();
            current = next;
            level += 1;
        }

        if sorted.len() != self.jobs.len() {
            let done: BTreeSet<&str> = sorted.iter().map(|(id, _)| id.as_str()).collect();
            let remaining: Vec<&str> = self
                .jobs
                .keys()
                .map(String::as_str)
                .filter(|id| !done.contains(id))
                .collect();
            let jobs = self
                .find_cycle(&remaining)
                .unwrap_or_else(|| remaining.iter().map(|s| s.to_string()).collect());
            return Err(GraphError::DependencyCycle { jobs });
        }

        Ok(sorted)
    }

    /// DFS over the undrained nodes; returns the first cycle path found.
    fn find_cycle(&self, candidates: &[&str]) -> Option<Vec<String>> {
        let mut visited = BTreeSet::new();
        for start in candidates {
            let mut path = Vec::new();
            if self.dfs_cycle(start, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut BTreeSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        if let Some(pos) = path.iter().position(|p| p == node) {
            path.drain(..pos);
            path.push(node.to_string());
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        visited.insert(node.to_string());
        path.push(node.to_string());

        if let Some(dependents) = self.downstream.get(node) {
            for dep in dependents {
                if self.dfs_cycle(dep, visited, path) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::{JobSpec, StepSpec};
    use crate::matrix::MatrixExpander;

    fn spec(needs: &[&str]) -> JobSpec {
        JobSpec::new(vec![StepSpec::run("noop", ["true"])]).with_needs(needs.iter().copied())
    }

    fn build(jobs: &[(&str, JobSpec)]) -> Result<JobGraph, GraphError> {
        let mut concrete = Vec::new();
        for (id, job) in jobs {
            concrete.extend(MatrixExpander::expand(id, job).unwrap());
        }
        JobGraph::build(concrete)
    }

    #[test]
    fn test_topological_order_respects_needs() {
        let g = build(&[
            ("publish", spec(&["build"])),
            ("build", spec(&["lint"])),
            ("lint", spec(&[])),
        ])
        .unwrap();
        assert_eq!(g.topological_order(), vec!["lint", "build", "publish"]);
    }

    #[test]
    fn test_need_on_matrix_template_waits_for_every_instance() {
        let tests = spec(&[]).with_axis("python", ["3.9", "3.10"]);
        let g = build(&[("tests", tests), ("publish", spec(&["tests"]))]).unwrap();
        let deps: Vec<&str> = g
            .dependencies_of("publish")
            .unwrap()
            .into_iter()
            .map(|j| j.id.as_str())
            .collect();
        assert_eq!(deps, vec!["tests (3.10)", "tests (3.9)"]);
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = build(&[
            ("a", spec(&["c"])),
            ("b", spec(&["a"])),
            ("c", spec(&["b"])),
        ])
        .unwrap_err();
        match err {
            GraphError::DependencyCycle { jobs } => {
                assert_eq!(jobs.first(), jobs.last());
                assert_eq!(jobs.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_and_self_needs_rejected() {
        assert_eq!(
            build(&[("a", spec(&["missing"]))]).unwrap_err(),
            GraphError::UnknownNeed {
                job: "a".to_string(),
                need: "missing".to_string()
            }
        );
        assert_eq!(
            build(&[("a", spec(&["a"]))]).unwrap_err(),
            GraphError::SelfDependency {
                job: "a".to_string()
            }
        );
    }

    #[test]
    fn test_execution_plan_levels_and_groups() {
        let g = build(&[
            ("lint", spec(&[])),
            ("tests", spec(&[]).with_axis("python", ["3.9", "3.10"])),
            ("build", spec(&["lint", "tests"])),
            ("publish", spec(&["build"])),
        ])
        .unwrap();
        let plan = g.to_execution_plan("release").unwrap();
        assert_eq!(plan.title, "release");
        let groups = plan.parallel_groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 3);
        assert!(groups[0].iter().all(|s| s.parallelizable));
        assert_eq!(groups[1][0].job_id, "build");
        assert!(!groups[1][0].parallelizable);
        assert_eq!(groups[1][0].depends_on.len(), 3);
    }

    #[test]
    fn test_transitive_dependents_covers_chain() {
        let g = build(&[
            ("lint", spec(&[])),
            ("build", spec(&["lint"])),
            ("publish", spec(&["build"])),
            ("docs", spec(&[])),
        ])
        .unwrap();
        let trans = g.transitive_dependents_of("lint").unwrap();
        assert_eq!(trans, vec!["build".to_string(), "publish".to_string()]);
        assert!(matches!(
            g.transitive_dependents_of("nope"),
            Err(GraphError::JobNotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let job = MatrixExpander::expand("lint", &spec(&[])).unwrap();
        let mut jobs = job.clone();
        jobs.extend(job);
        assert!(matches!(
            JobGraph::build(jobs),
            Err(GraphError::DuplicateJob { .. })
        ));
    }
}
