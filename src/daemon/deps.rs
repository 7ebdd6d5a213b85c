//! Service dependency resolution.
//!
//! `requires`, `before` and `after` form a directed graph over the plan's
//! services. Ordering is a topological sort that breaks ties by declaration
//! order, so the same plan always produces the same sequence.

use crate::error::PlanError;
use crate::plan::Plan;
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Start,
    Stop,
}

/// Order `names` for starting or stopping.
///
/// Starting pulls in everything the named services require, transitively.
/// Stopping pulls in everything that requires the named services, and runs in
/// the reverse of start order.
pub fn order(plan: &Plan, names: &[String], direction: Direction) -> Result<Vec<String>, PlanError> {
    for name in names {
        if !plan.services.contains(name) {
            return Err(PlanError::UnknownService(name.clone()));
        }
    }

    let included = match direction {
        Direction::Start => closure(names, |name| requirements(plan, name)),
        Direction::Stop => {
            let dependents = dependents(plan);
            closure(names, |name| {
                dependents.get(name).cloned().unwrap_or_default()
            })
        }
    };

    let mut sorted = start_order(plan, &included)?;
    if direction == Direction::Stop {
        sorted.reverse();
    }
    Ok(sorted)
}

/// Order exactly `names`, without pulling in requirements or dependents.
pub fn sort(plan: &Plan, names: &[String], direction: Direction) -> Result<Vec<String>, PlanError> {
    for name in names {
        if !plan.services.contains(name) {
            return Err(PlanError::UnknownService(name.clone()));
        }
    }
    let included: HashSet<String> = names.iter().cloned().collect();
    let mut sorted = start_order(plan, &included)?;
    if direction == Direction::Stop {
        sorted.reverse();
    }
    Ok(sorted)
}

fn requirements(plan: &Plan, name: &str) -> Vec<String> {
    plan.service(name)
        .map(|s| s.requires.clone())
        .unwrap_or_default()
}

/// Map from a service to the services that require it.
fn dependents(plan: &Plan) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for service in plan.services.iter() {
        for required in &service.requires {
            map.entry(required.clone())
                .or_default()
                .push(service.name.clone());
        }
    }
    map
}

fn closure<F>(roots: &[String], next: F) -> HashSet<String>
where
    F: Fn(&str) -> Vec<String>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = roots.to_vec();
    while let Some(name) = stack.pop() {
        if seen.insert(name.clone()) {
            stack.extend(next(&name));
        }
    }
    seen
}

/// Kahn's algorithm over the included services, always taking the earliest
/// declared service among those with no pending predecessor.
fn start_order(plan: &Plan, included: &HashSet<String>) -> Result<Vec<String>, PlanError> {
    // Declaration index -> name, restricted to the included set.
    let nodes: Vec<&str> = plan
        .services
        .names()
        .filter(|n| included.contains(*n))
        .collect();
    let index: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    // successors[i] must come after i.
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
    for (i, name) in nodes.iter().enumerate() {
        let Some(service) = plan.service(name) else {
            continue;
        };
        for prior in service.requires.iter().chain(service.after.iter()) {
            if let Some(&p) = index.get(prior.as_str()) {
                successors[p].insert(i);
            }
        }
        for later in &service.before {
            if let Some(&l) = index.get(later.as_str()) {
                successors[i].insert(l);
            }
        }
    }

    let mut indegree = vec![0usize; nodes.len()];
    for succ in &successors {
        for &s in succ {
            indegree[s] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.pop_first() {
        sorted.push(nodes[next].to_string());
        for &s in &successors[next] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                ready.insert(s);
            }
        }
    }

    if sorted.len() < nodes.len() {
        let remaining: Vec<usize> = (0..nodes.len()).filter(|&i| indegree[i] > 0).collect();
        let cycle = find_cycle(&successors, &remaining);
        return Err(PlanError::Cycle(
            cycle.into_iter().map(|i| nodes[i].to_string()).collect(),
        ));
    }
    Ok(sorted)
}

/// Walk predecessors among the unsorted nodes until one repeats; the nodes
/// between the two visits form a cycle. Returned in declaration order.
fn find_cycle(successors: &[BTreeSet<usize>], remaining: &[usize]) -> Vec<usize> {
    let in_remaining: HashSet<usize> = remaining.iter().copied().collect();
    let predecessor = |node: usize| -> Option<usize> {
        remaining
            .iter()
            .copied()
            .find(|&p| in_remaining.contains(&p) && successors[p].contains(&node))
    };

    let Some(&start) = remaining.first() else {
        return Vec::new();
    };
    let mut path: Vec<usize> = vec![start];
    let mut current = start;
    while let Some(prev) = predecessor(current) {
        if let Some(pos) = path.iter().position(|&n| n == prev) {
            let mut cycle = path.split_off(pos);
            cycle.sort_unstable();
            return cycle;
        }
        path.push(prev);
        current = prev;
    }
    // Every unsorted node has an unsorted predecessor, so the walk above
    // always closes a loop.
    path.sort_unstable();
    path
}
