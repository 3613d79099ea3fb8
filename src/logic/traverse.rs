//! Visited-set graph walks shared by the resolver and the hierarchy queries.
//!
//! Both walks are iterative, so depth is bounded by heap rather than stack,
//! and both visit every node at most once regardless of how many paths lead
//! to it.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// A path that returns to one of its own nodes. `chain` starts and ends with
/// the repeated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle<N> {
    pub chain: Vec<N>,
}

/// Depth-first post-order over everything reachable from `roots`: every node
/// appears after all nodes it points at. Successors are visited in the order
/// `next` yields them, which makes the result deterministic.
pub fn post_order<N, I, F>(roots: I, mut next: F) -> Result<Vec<N>, Cycle<N>>
where
    N: Clone + Eq + Hash,
    I: IntoIterator<Item = N>,
    F: FnMut(&N) -> Vec<N>,
{
    let mut order = Vec::new();
    let mut done: HashSet<N> = HashSet::new();
    let mut on_path: HashSet<N> = HashSet::new();
    let mut stack: Vec<(N, std::vec::IntoIter<N>)> = Vec::new();

    for root in roots {
        if done.contains(&root) {
            continue;
        }
        on_path.insert(root.clone());
        let successors = next(&root).into_iter();
        stack.push((root, successors));

        loop {
            let step = match stack.last_mut() {
                Some((_, successors)) => successors.next(),
                None => break,
            };
            match step {
                Some(succ) => {
                    if done.contains(&succ) {
                        continue;
                    }
                    if on_path.contains(&succ) {
                        let start = stack.iter().position(|(n, _)| *n == succ).unwrap_or(0);
                        let mut chain: Vec<N> =
                            stack[start..].iter().map(|(n, _)| n.clone()).collect();
                        chain.push(succ);
                        return Err(Cycle { chain });
                    }
                    on_path.insert(succ.clone());
                    let successors = next(&succ).into_iter();
                    stack.push((succ, successors));
                }
                None => {
                    if let Some((node, _)) = stack.pop() {
                        on_path.remove(&node);
                        done.insert(node.clone());
                        order.push(node);
                    }
                }
            }
        }
    }

    Ok(order)
}

/// Breadth-first set of nodes reachable from `roots`, roots excluded unless
/// reachable through some path. Cycles terminate naturally.
pub fn reachable<N, I, F>(roots: I, mut next: F) -> Vec<N>
where
    N: Clone + Eq + Hash,
    I: IntoIterator<Item = N>,
    F: FnMut(&N) -> Vec<N>,
{
    let mut seen: HashSet<N> = HashSet::new();
    let mut found = Vec::new();
    let mut queue: VecDeque<N> = roots.into_iter().collect();

    while let Some(node) = queue.pop_front() {
        for succ in next(&node) {
            if seen.insert(succ.clone()) {
                found.push(succ.clone());
                queue.push_back(succ);
            }
        }
    }

    found
}
