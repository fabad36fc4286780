//! Cycle detection over any labelled directed graph.
//!
//! Shared verbatim by the Queue Manager (integer job ids) and the
//! Orchestrator (string workflow step names) — see spec.md §4.2.

use crate::error::CoreError;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;

/// Depth-first search with an active ("grey") set and a visited ("black")
/// set. When a back-edge into the grey set is found, the recursion stack is
/// unwound to produce the concrete cycle for the error message.
///
/// O(V + E).
pub fn assert_acyclic<N>(
    adjacency: &HashMap<N, Vec<N>>,
    context: &str,
) -> Result<(), CoreError>
where
    N: Eq + Hash + Clone + Display,
{
    let mut black: HashSet<N> = HashSet::new();
    let mut grey: HashSet<N> = HashSet::new();
    let mut stack: Vec<N> = Vec::new();

    for start in adjacency.keys() {
        if black.contains(start) {
            continue;
        }
        if let Some(cycle) = visit(start, adjacency, &mut grey, &mut black, &mut stack) {
            return Err(CoreError::CircularDependency {
                cycle_path: cycle.iter().map(|n| n.to_string()).collect(),
                context: context.to_string(),
            });
        }
    }
    Ok(())
}

fn visit<N>(
    node: &N,
    adjacency: &HashMap<N, Vec<N>>,
    grey: &mut HashSet<N>,
    black: &mut HashSet<N>,
    stack: &mut Vec<N>,
) -> Option<Vec<N>>
where
    N: Eq + Hash + Clone + Display,
{
    grey.insert(node.clone());
    stack.push(node.clone());

    if let Some(neighbors) = adjacency.get(node) {
        for next in neighbors {
            if grey.contains(next) {
                // Back-edge found: unwind the stack to the first occurrence
                // of `next` to produce the concrete cycle, closing the loop
                // by repeating `next` at the end.
                let start = stack.iter().position(|n| n == next).unwrap_or(0);
                let mut cycle: Vec<N> = stack[start..].to_vec();
                cycle.push(next.clone());
                return Some(cycle);
            }
            if !black.contains(next) {
                if let Some(cycle) = visit(next, adjacency, grey, black, stack) {
                    return Some(cycle);
                }
            }
        }
    }

    stack.pop();
    grey.remove(node);
    black.insert(node.clone());
    None
}
