//! Execution planner - orders steps by their dependencies
//!
//! Planning is pure graph computation: no step is probed or applied here.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::step::SharedStep;

/// Steps in an order where every step follows all of its dependencies
pub struct ExecutionPlan {
    steps: Vec<SharedStep>,
    positions: HashMap<String, usize>,
}

impl ExecutionPlan {
    fn from_ordered(steps: Vec<SharedStep>) -> Self {
        let positions = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name().to_string(), i))
            .collect();
        Self { steps, positions }
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[SharedStep] {
        &self.steps
    }

    /// Step names in execution order
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&SharedStep> {
        self.positions.get(name).map(|&i| &self.steps[i])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Partition the plan into waves
    ///
    /// Every step's dependencies lie in strictly earlier waves, so the steps
    /// of one wave share no dependency relation and may run concurrently.
    /// Within a wave, steps keep plan order.
    pub fn waves(&self) -> Vec<Vec<SharedStep>> {
        let mut level: HashMap<&str, usize> = HashMap::new();
        let mut waves: Vec<Vec<SharedStep>> = Vec::new();

        for step in &self.steps {
            let depth = step
                .header()
                .all_dependencies()
                .iter()
                .filter_map(|d| level.get(d).map(|l| l + 1))
                .max()
                .unwrap_or(0);
            level.insert(step.name(), depth);
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(step.clone());
        }

        waves
    }

    /// Restrict the plan to `targets` and everything they transitively
    /// depend on, keeping plan order
    pub fn restrict(&self, targets: &[String]) -> Result<Self> {
        let mut keep: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();

        for target in targets {
            let step = self
                .get(target)
                .ok_or_else(|| Error::UnknownStep { name: target.clone() })?;
            stack.push(step.name());
        }

        while let Some(name) = stack.pop() {
            if !keep.insert(name) {
                continue;
            }
            if let Some(step) = self.get(name) {
                stack.extend(step.header().all_dependencies());
            }
        }

        let steps = self
            .steps
            .iter()
            .filter(|s| keep.contains(s.name()))
            .cloned()
            .collect();
        Ok(Self::from_ordered(steps))
    }
}

/// Build a deterministic execution plan
///
/// Uses Kahn's algorithm with the ready set ordered by declaration index, so
/// steps with no ordering constraint between them keep declaration order.
///
/// # Errors
/// - [`Error::DuplicateStep`] if two steps share a name
/// - [`Error::UnknownDependency`] if a step references an undeclared name
/// - [`Error::CyclicDependency`] naming the members of one cycle
pub fn plan(steps: Vec<SharedStep>) -> Result<ExecutionPlan> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if index.insert(step.name(), i).is_some() {
            return Err(Error::DuplicateStep {
                name: step.name().to_string(),
            });
        }
    }

    // deps[i]: declaration indices step i depends on
    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        let mut resolved = Vec::new();
        for dep in step.header().all_dependencies() {
            let &j = index.get(dep).ok_or_else(|| Error::UnknownDependency {
                step: step.name().to_string(),
                dependency: dep.to_string(),
            })?;
            resolved.push(j);
            dependents[j].push(i);
        }
        deps.push(resolved);
    }

    let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|&(_, &n)| n == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order: Vec<usize> = Vec::with_capacity(steps.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &d in &dependents[i] {
            pending[d] -= 1;
            if pending[d] == 0 {
                ready.push(Reverse(d));
            }
        }
    }

    if order.len() < steps.len() {
        let members = find_cycle(&deps, &pending)
            .into_iter()
            .map(|i| steps[i].name().to_string())
            .collect();
        return Err(Error::CyclicDependency { members });
    }

    log::debug!(
        "Planned {} steps: {}",
        order.len(),
        order
            .iter()
            .map(|&i| steps[i].name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut slots: Vec<Option<SharedStep>> = steps.into_iter().map(Some).collect();
    let ordered = order.into_iter().filter_map(|i| slots[i].take()).collect();
    Ok(ExecutionPlan::from_ordered(ordered))
}

/// Plan only `targets` and the steps they transitively depend on
///
/// The whole graph is validated first, so an invalid manifest is rejected
/// even if the broken part lies outside the subset.
pub fn plan_subset(steps: Vec<SharedStep>, targets: &[String]) -> Result<ExecutionPlan> {
    plan(steps)?.restrict(targets)
}

/// Walk unsorted dependencies until a step repeats
///
/// Every step left unsorted by Kahn's algorithm still waits on at least one
/// other unsorted step, so following those edges must close a loop.
fn find_cycle(deps: &[Vec<usize>], pending: &[usize]) -> Vec<usize> {
    let unsorted = |i: usize| pending[i] > 0;
    let Some(start) = (0..deps.len()).find(|&i| unsorted(i)) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = vec![start];
    let mut seen_at: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let Some(&next) = deps[current].iter().find(|&&d| unsorted(d)) else {
            return path;
        };
        if let Some(&pos) = seen_at.get(&next) {
            return path.split_off(pos);
        }
        seen_at.insert(next, path.len());
        path.push(next);
        current = next;
    }
}
