//! Dependency ordering for single-parent step graphs.
//!
//! Every step names at most one predecessor (`dependsOn`). A predecessor
//! that is not part of the plan is ignored.

use std::collections::{HashMap, HashSet, VecDeque};

use stepwise_core::types::Step;

use crate::error::EngineError;

/// Map each tool name to the index of its first occurrence.
fn index_by_name(steps: &[Step]) -> HashMap<&str, usize> {
    let mut index = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        index.entry(step.tool_name.as_str()).or_insert(i);
    }
    index
}

/// Depth-first order: each step after its dependency, ties kept in input order.
///
/// Never fails. On a cyclic `dependsOn` chain the visited set stops the walk
/// and the cycle members come out in first-seen order; use
/// [`checked_order`] to reject such plans instead.
pub fn execution_order(steps: &[Step]) -> Vec<String> {
    let index = index_by_name(steps);
    let mut visited = HashSet::with_capacity(steps.len());
    let mut order = Vec::with_capacity(steps.len());

    for i in 0..steps.len() {
        visit(i, steps, &index, &mut visited, &mut order);
    }
    order
}

/// Push the not-yet-visited ancestor chain of step `i`, oldest first.
fn visit(
    i: usize,
    steps: &[Step],
    index: &HashMap<&str, usize>,
    visited: &mut HashSet<usize>,
    order: &mut Vec<String>,
) {
    let mut chain = Vec::new();
    let mut current = Some(i);

    while let Some(j) = current {
        if !visited.insert(j) {
            break;
        }
        chain.push(j);
        current = steps[j]
            .depends_on
            .as_deref()
            .and_then(|dep| index.get(dep).copied());
    }
    order.extend(chain.into_iter().rev().map(|j| steps[j].tool_name.clone()));
}

/// Find a cyclic `dependsOn` chain, returned as the tool names along the cycle
/// with the first name repeated at the end.
pub fn find_cycle(steps: &[Step]) -> Option<Vec<String>> {
    let index = index_by_name(steps);
    let mut acyclic: HashSet<usize> = HashSet::new();

    for start in 0..steps.len() {
        let mut path: Vec<usize> = Vec::new();
        let mut on_path: HashMap<usize, usize> = HashMap::new();
        let mut current = Some(start);

        while let Some(i) = current {
            if acyclic.contains(&i) {
                break;
            }
            if let Some(&pos) = on_path.get(&i) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&p| steps[p].tool_name.clone())
                    .collect();
                cycle.push(steps[i].tool_name.clone());
                return Some(cycle);
            }
            on_path.insert(i, path.len());
            path.push(i);
            current = steps[i]
                .depends_on
                .as_deref()
                .and_then(|dep| index.get(dep).copied());
        }
        acyclic.extend(path);
    }
    None
}

/// Like [`execution_order`] but rejects cyclic plans.
pub fn checked_order(steps: &[Step]) -> Result<Vec<String>, EngineError> {
    if let Some(cycle) = find_cycle(steps) {
        return Err(EngineError::CyclicDependency(cycle));
    }
    Ok(execution_order(steps))
}

/// Reorder steps to follow `order`. Steps the order does not mention keep
/// their relative input order after the ordered ones.
pub fn sort_steps(steps: &[Step], order: &[String]) -> Vec<Step> {
    let mut by_name: HashMap<&str, VecDeque<usize>> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        by_name.entry(step.tool_name.as_str()).or_default().push_back(i);
    }

    let mut taken = vec![false; steps.len()];
    let mut sorted = Vec::with_capacity(steps.len());

    for name in order {
        if let Some(i) = by_name.get_mut(name.as_str()).and_then(VecDeque::pop_front) {
            taken[i] = true;
            sorted.push(steps[i].clone());
        }
    }
    sorted.extend(
        steps
            .iter()
            .zip(&taken)
            .filter(|&(_, &t)| !t)
            .map(|(s, _)| s.clone()),
    );
    sorted
}
