//! Run-time readiness tracking over a [`JobGraph`].
//!
//! A job is resolved only once every dependency is done. If any dependency
//! failed or was skipped, the job is skipped instead and never runs; the
//! skip cascades to its own dependents. Failure of one job never affects
//! jobs that do not depend on it.

use std::collections::BTreeMap;

use crate::domain::status::{JobStatus, SkipReason};
use crate::graph::JobGraph;

/// What the scheduler should do with a job whose dependencies are done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// All dependencies succeeded; the job may start.
    Run(String),
    /// A dependency failed or was skipped; record the job as skipped.
    Skip { id: String, reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Done(JobStatus),
}

/// Mutable per-run state of every job in a graph.
#[derive(Debug)]
pub struct GraphEvaluation<'g> {
    graph: &'g JobGraph,
    order: Vec<String>,
    states: BTreeMap<String, NodeState>,
}

impl<'g> GraphEvaluation<'g> {
    pub fn new(graph: &'g JobGraph) -> Self {
        let order = graph.topological_order();
        let states = order
            .iter()
            .map(|id| (id.clone(), NodeState::Pending))
            .collect();
        Self {
            graph,
            order,
            states,
        }
    }

    /// Collect every pending job whose dependencies are all done.
    ///
    /// Upstream-caused skips are applied immediately and cascade, so a
    /// single call reaches a fixpoint. Returned in topological order.
    pub fn advance(&mut self) -> Vec<Readiness> {
        let mut out = Vec::new();
        loop {
            let mut changed = false;
            for id in &self.order {
                if self.states.get(id) != Some(&NodeState::Pending) {
                    continue;
                }
                match self.blocking(id) {
                    Blocking::Waiting => {}
                    Blocking::Clear => {
                        self.states.insert(id.clone(), NodeState::Running);
                        out.push(Readiness::Run(id.clone()));
                    }
                    Blocking::Skip(reason) => {
                        self.states
                            .insert(id.clone(), NodeState::Done(JobStatus::skipped(reason.clone())));
                        out.push(Readiness::Skip {
                            id: id.clone(),
                            reason,
                        });
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        out
    }

    fn blocking(&self, id: &str) -> Blocking {
        let deps = match self.graph.dependencies_of(id) {
            Ok(deps) => deps,
            Err(_) => return Blocking::Clear,
        };
        let mut failed_by: Option<String> = None;
        let mut skipped_by: Option<String> = None;
        for dep in deps {
            match self.states.get(&dep.id) {
                Some(NodeState::Done(JobStatus::Failed { .. })) => {
                    failed_by.get_or_insert_with(|| dep.id.clone());
                }
                Some(NodeState::Done(JobStatus::Skipped { .. })) => {
                    skipped_by.get_or_insert_with(|| dep.id.clone());
                }
                Some(NodeState::Done(JobStatus::Succeeded)) => {}
                // Unresolved until every need is terminal.
                _ => return Blocking::Waiting,
            }
        }
        match (failed_by, skipped_by) {
            (Some(job), _) => Blocking::Skip(SkipReason::UpstreamFailed { job }),
            (None, Some(job)) => Blocking::Skip(SkipReason::UpstreamSkipped { job }),
            (None, None) => Blocking::Clear,
        }
    }

    /// Record the terminal status of a job previously returned as ready.
    /// Callers may also record a skip for a job whose own condition failed.
    pub fn complete(&mut self, id: &str, status: JobStatus) {
        if let Some(state) = self.states.get_mut(id) {
            *state = NodeState::Done(status);
        }
    }

    /// Every job has a terminal status.
    pub fn is_finished(&self) -> bool {
        self.states
            .values()
            .all(|s| matches!(s, NodeState::Done(_)))
    }

    pub fn running(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, NodeState::Running))
            .count()
    }

    /// Terminal statuses recorded so far, in topological order.
    pub fn statuses(&self) -> Vec<(String, JobStatus)> {
        self.order
            .iter()
            .filter_map(|id| match self.states.get(id) {
                Some(NodeState::Done(status)) => Some((id.clone(), status.clone())),
                _ => None,
            })
            .collect()
    }
}

enum Blocking {
    Waiting,
    Clear,
    Skip(SkipReason),
}
