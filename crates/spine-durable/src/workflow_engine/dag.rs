//! Topological ordering of a [`Workflow`]'s steps, grouped into waves of
//! mutually-independent steps (spec.md §4.9). Kahn's algorithm, grounded in
//! the teacher's `workflow::graph` dependency-layering pass.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::Workflow;

#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("step {0:?} depends on unknown step {1:?}")]
    UnknownDependency(String, String),

    #[error("workflow has a dependency cycle involving step {0:?}")]
    Cycle(String),

    #[error("duplicate step name {0:?}")]
    DuplicateStep(String),
}

/// Group `workflow`'s steps into waves: each wave's steps depend only on
/// steps in earlier waves, and within a wave no step depends on another.
/// `Sequential`/`Adaptive` policies flatten the waves back into a single
/// order; `Parallel` runs each wave's steps concurrently (bounded by
/// `max_concurrency`).
pub fn topological_order(workflow: &Workflow) -> Result<Vec<Vec<String>>, DagError> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut seen = HashSet::new();

    for step in &workflow.steps {
        if !seen.insert(step.name.as_str()) {
            return Err(DagError::DuplicateStep(step.name.clone()));
        }
        indegree.entry(step.name.as_str()).or_insert(0);
    }

    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(DagError::UnknownDependency(step.name.clone(), dep.clone()));
            }
            dependents.entry(dep.as_str()).or_default().push(step.name.as_str());
            *indegree.get_mut(step.name.as_str()).unwrap() += 1;
        }
    }

    let mut waves = Vec::new();
    let mut ready: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&name, _)| name)
        .collect();
    // Deterministic ordering within a wave.
    let mut ready_vec: Vec<&str> = ready.drain(..).collect();
    ready_vec.sort_unstable();
    let mut remaining = indegree.clone();
    let mut processed = 0usize;

    let mut frontier = ready_vec;
    while !frontier.is_empty() {
        processed += frontier.len();
        waves.push(frontier.iter().map(|s| s.to_string()).collect());

        let mut next = Vec::new();
        for name in &frontier {
            if let Some(children) = dependents.get(name) {
                for child in children {
                    let deg = remaining.get_mut(child).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(*child);
                    }
                }
            }
        }
        next.sort_unstable();
        frontier = next;
    }

    if processed != workflow.steps.len() {
        let stuck = workflow
            .steps
            .iter()
            .find(|s| *remaining.get(s.name.as_str()).unwrap_or(&0) > 0)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        return Err(DagError::Cycle(stuck));
    }

    Ok(waves)
}
