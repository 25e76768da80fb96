//! Cycle detection over the scoped dependency graph.
//!
//! Iterative depth-first search with a tri-state mark per node, so graphs
//! with thousands of instances terminate in linear time.

use crate::types::IdentityKey;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

enum Step<'a> {
    Finish(&'a IdentityKey),
    Descend(&'a IdentityKey),
    BackEdge(&'a IdentityKey),
    Skip,
}

/// Find a cycle, if any, in `children` (key → child keys).
///
/// Returns the cycle as a path whose first and last element are equal.
pub fn find_cycle(
    nodes: &[IdentityKey],
    children: &HashMap<IdentityKey, Vec<IdentityKey>>,
) -> Option<Vec<IdentityKey>> {
    let mut marks: HashMap<&IdentityKey, Mark> =
        nodes.iter().map(|key| (key, Mark::Unvisited)).collect();

    for root in nodes {
        if marks.get(root) != Some(&Mark::Unvisited) {
            continue;
        }

        // Explicit stack of (node, next-child-index); `path` mirrors the
        // chain of InProgress nodes.
        let mut stack: Vec<(&IdentityKey, usize)> = vec![(root, 0)];
        let mut path: Vec<IdentityKey> = vec![root.clone()];
        marks.insert(root, Mark::InProgress);

        while !stack.is_empty() {
            let step = {
                let Some((node, child_idx)) = stack.last_mut() else {
                    break;
                };
                let node: &IdentityKey = *node;
                let node_children = children.get(node).map(Vec::as_slice).unwrap_or(&[]);

                if *child_idx >= node_children.len() {
                    Step::Finish(node)
                } else {
                    let child = &node_children[*child_idx];
                    *child_idx += 1;
                    match marks.get(child).copied().unwrap_or(Mark::Done) {
                        Mark::Unvisited => Step::Descend(child),
                        Mark::InProgress => Step::BackEdge(child),
                        Mark::Done => Step::Skip,
                    }
                }
            };

            match step {
                Step::Finish(node) => {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    path.pop();
                }
                Step::Descend(child) => {
                    marks.insert(child, Mark::InProgress);
                    stack.push((child, 0));
                    path.push(child.clone());
                }
                Step::BackEdge(child) => {
                    // Slice the path from the child's first occurrence
                    // and close the loop.
                    let start = path.iter().position(|key| key == child).unwrap_or(0);
                    let mut cycle: Vec<IdentityKey> = path[start..].to_vec();
                    cycle.push(child.clone());
                    return Some(cycle);
                }
                Step::Skip => {}
            }
        }
    }

    None
}
