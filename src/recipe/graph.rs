//! Step dependency graph: validation, ordering and eligibility

use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;

use super::interactive::InteractiveStepState;
use super::types::{Operation, Step, StepStatus};
use crate::error::AppError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate step ID: {0}")]
    DuplicateStep(String),
    #[error("Step '{step}' depends on unknown step '{missing}'")]
    MissingDependency { step: String, missing: String },
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

impl From<GraphError> for AppError {
    fn from(value: GraphError) -> Self {
        AppError::validation(value.to_string())
    }
}

/// Topological order of a validated step list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPlan {
    order: Vec<String>,
    position: HashMap<String, usize>,
}

impl OrderPlan {
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.position.get(step_id).copied()
    }

    /// Steps ordered strictly before `step_id`.
    pub fn before(&self, step_id: &str) -> Option<&[String]> {
        self.position(step_id).map(|i| &self.order[..i])
    }
}

/// Validate ids and dependencies, then order the steps.
pub fn resolve(steps: &[Step]) -> Result<OrderPlan, GraphError> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        if index.insert(step.id.as_str(), i).is_some() {
            return Err(GraphError::DuplicateStep(step.id.clone()));
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if !index.contains_key(dep.as_str()) {
                return Err(GraphError::MissingDependency {
                    step: step.id.clone(),
                    missing: dep.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(steps) {
        return Err(GraphError::Cycle(cycle));
    }

    // Kahn's algorithm; the ready set is keyed by declaration index so ties
    // come out in the order the steps were written.
    let mut in_degree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        let deps: HashSet<&str> = step.depends_on.iter().map(String::as_str).collect();
        for dep in deps {
            let d = index[dep];
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = ready.pop_first() {
        order.push(steps[i].id.clone());
        for &j in &dependents[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.insert(j);
            }
        }
    }

    let position = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i))
        .collect();
    Ok(OrderPlan { order, position })
}

/// Find circular dependencies using DFS
pub fn find_cycle(steps: &[Step]) -> Option<Vec<String>> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        adj.insert(
            &step.id,
            step.depends_on.iter().map(|s| s.as_str()).collect(),
        );
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    fn dfs<'a>(
        node: &'a str,
        adj: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        if let Some(deps) = adj.get(node) {
            for &dep in deps {
                if rec_stack.contains(dep) {
                    let mut cycle: Vec<String> = path
                        .iter()
                        .skip_while(|&&n| n != dep)
                        .map(|&s| s.to_string())
                        .collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                if !visited.contains(dep) {
                    if let Some(cycle) = dfs(dep, adj, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }

    for step in steps {
        if !visited.contains(step.id.as_str()) {
            if let Some(cycle) = dfs(&step.id, &adj, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }

    None
}

/// Where a step's dependencies stand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    /// Every dependency finished in a way that lets this step run
    Satisfied,
    /// At least one dependency has not finished yet
    Pending,
    /// A dependency failed (without `continue_on_failure`) or was cancelled
    Blocked,
}

/// A finished dependency lets dependents run when it succeeded, was skipped,
/// or failed while tolerating failure.
pub fn dependency_state(steps: &[Step], states: &[InteractiveStepState], step: &Step) -> DependencyState {
    let mut pending = false;
    for dep in &step.depends_on {
        let status = states
            .iter()
            .find(|s| &s.step_id == dep)
            .map(|s| s.status)
            .unwrap_or(StepStatus::Pending);
        match status {
            StepStatus::Success | StepStatus::Skipped => {}
            StepStatus::Failed => {
                let tolerated = steps
                    .iter()
                    .find(|s| &s.id == dep)
                    .map(|s| s.continue_on_failure)
                    .unwrap_or(false);
                if !tolerated {
                    return DependencyState::Blocked;
                }
            }
            StepStatus::Cancelled => return DependencyState::Blocked,
            StepStatus::Pending
            | StepStatus::Waiting
            | StepStatus::Running
            | StepStatus::Retrying => pending = true,
        }
    }
    if pending {
        DependencyState::Pending
    } else {
        DependencyState::Satisfied
    }
}

/// Recompute `pending`/`waiting` for steps that have not started.
pub fn refresh_waiting(steps: &[Step], states: &mut [InteractiveStepState]) {
    let snapshot: Vec<InteractiveStepState> = states.to_vec();
    for state in states.iter_mut() {
        if !state.status.is_unstarted() {
            continue;
        }
        let Some(step) = steps.iter().find(|s| s.id == state.step_id) else {
            continue;
        };
        state.status = match dependency_state(steps, &snapshot, step) {
            DependencyState::Satisfied => StepStatus::Pending,
            DependencyState::Pending | DependencyState::Blocked => StepStatus::Waiting,
        };
    }
}

/// Ids listed as children of some `group` step.
pub fn group_children(steps: &[Step]) -> HashSet<String> {
    steps
        .iter()
        .filter_map(|s| match &s.operation {
            Operation::Group(group) => Some(group.steps.iter().cloned()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Next unstarted top-level step, in plan order, whose dependencies are satisfied.
pub fn next_eligible<'a>(
    plan: &'a OrderPlan,
    steps: &[Step],
    states: &[InteractiveStepState],
    excluded: &HashSet<String>,
) -> Option<&'a str> {
    plan.order().iter().map(String::as_str).find(|id| {
        if excluded.contains(*id) {
            return false;
        }
        let Some(state) = states.iter().find(|s| s.step_id == *id) else {
            return false;
        };
        if !state.status.is_unstarted() {
            return false;
        }
        steps
            .iter()
            .find(|s| s.id == *id)
            .map(|step| dependency_state(steps, states, step) == DependencyState::Satisfied)
            .unwrap_or(false)
    })
}

/// Every step that depends on `step_id`, directly or transitively.
pub fn transitive_dependents(steps: &[Step], step_id: &str) -> HashSet<String> {
    let mut found: HashSet<String> = HashSet::new();
    let mut frontier = vec![step_id.to_string()];
    while let Some(current) = frontier.pop() {
        for step in steps {
            if step.depends_on.iter().any(|d| d == &current) && found.insert(step.id.clone()) {
                frontier.push(step.id.clone());
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::types::SleepOp;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::new(id, Operation::Sleep(SleepOp { duration_secs: 0 })).depends_on(deps.iter().copied())
    }

    fn states(steps: &[Step]) -> Vec<InteractiveStepState> {
        steps.iter().map(InteractiveStepState::from_step).collect()
    }

    fn set(states: &mut [InteractiveStepState], id: &str, status: StepStatus) {
        if let Some(s) = states.iter_mut().find(|s| s.step_id == id) {
            s.status = status;
        }
    }

    #[test]
    fn test_order_is_topological_with_declaration_ties() {
        let steps = vec![
            step("c", &["a"]),
            step("a", &[]),
            step("b", &[]),
            step("d", &["b", "c"]),
        ];
        // `c` is declared first, so it goes as soon as `a` has.
        let plan = resolve(&steps).unwrap();
        assert_eq!(plan.order(), ["a", "c", "b", "d"]);
        assert_eq!(plan.before("c").unwrap(), ["a"]);
        assert_eq!(plan.before("d").unwrap(), ["a", "c", "b"]);
    }

    #[test]
    fn test_missing_dependency_reports_step_and_id() {
        let steps = vec![step("a", &["ghost"])];
        assert_eq!(
            resolve(&steps).unwrap_err(),
            GraphError::MissingDependency {
                step: "a".to_string(),
                missing: "ghost".to_string()
            }
        );
    }

    #[test]
    fn test_cycle_reports_participants() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        let GraphError::Cycle(ids) = resolve(&steps).unwrap_err() else {
            panic!("expected cycle");
        };
        assert_eq!(ids.first(), ids.last());
        for id in ["a", "b", "c"] {
            assert!(ids.iter().any(|x| x == id));
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let steps = vec![step("a", &["a"])];
        assert_eq!(
            resolve(&steps).unwrap_err(),
            GraphError::Cycle(vec!["a".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn test_resolve_succeeds_iff_acyclic_with_existing_deps() {
        let ok = vec![step("a", &[]), step("b", &["a"]), step("c", &["a", "b"])];
        assert!(resolve(&ok).is_ok());
        let dup = vec![step("a", &[]), step("a", &[])];
        assert_eq!(resolve(&dup).unwrap_err(), GraphError::DuplicateStep("a".to_string()));
    }

    #[test]
    fn test_failed_dependency_blocks_unless_tolerated() {
        let mut steps = vec![step("a", &[]), step("b", &["a"])];
        let mut st = states(&steps);
        set(&mut st, "a", StepStatus::Failed);
        assert_eq!(dependency_state(&steps, &st, &steps[1]), DependencyState::Blocked);

        steps[0].continue_on_failure = true;
        assert_eq!(dependency_state(&steps, &st, &steps[1]), DependencyState::Satisfied);
    }

    #[test]
    fn test_refresh_waiting_and_next_eligible() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("g", &[])];
        let plan = resolve(&steps).unwrap();
        let mut st = states(&steps);
        refresh_waiting(&steps, &mut st);
        assert_eq!(st[1].status, StepStatus::Waiting);

        let excluded: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(next_eligible(&plan, &steps, &st, &excluded), Some("g"));

        set(&mut st, "a", StepStatus::Skipped);
        refresh_waiting(&steps, &mut st);
        assert_eq!(st[1].status, StepStatus::Pending);
        assert_eq!(next_eligible(&plan, &steps, &st, &HashSet::new()), Some("b"));
    }

    #[test]
    fn test_transitive_dependents() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &[]),
        ];
        let deps = transitive_dependents(&steps, "a");
        assert_eq!(deps.len(), 2);
        assert!(deps.contains("c"));
        assert!(!deps.contains("d"));
    }
}
