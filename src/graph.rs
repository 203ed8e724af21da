//! Engine-agnostic commit DAG traversal
//!
//! Adapters whose engine has no native graph queries implement
//! [`CommitDag`] over their commit index and get the Graph layer's
//! algorithms from here: ancestors, strict ancestry, merge base and
//! newest-first topological history.

use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::error::{ProtocolError, Result};
use crate::types::SnapshotId;

/// Read access to a commit DAG.
pub trait CommitDag {
    /// Recency key. Larger is newer; used to order history and pick the
    /// most recent merge base.
    type Key: Ord + Clone;

    /// Parents of `id`, or `None` if the id is unknown.
    fn parents_of(&self, id: &str) -> Option<&[SnapshotId]>;

    /// Recency of `id`. Only called for known ids.
    fn recency(&self, id: &str) -> Self::Key;

    fn contains(&self, id: &str) -> bool {
        self.parents_of(id).is_some()
    }
}

fn require<D: CommitDag + ?Sized>(dag: &D, id: &str) -> Result<()> {
    if dag.contains(id) {
        Ok(())
    } else {
        Err(ProtocolError::not_found(id))
    }
}

/// All transitive parents of `id`, excluding `id` itself.
pub fn ancestors<D: CommitDag + ?Sized>(dag: &D, id: &str) -> Result<BTreeSet<SnapshotId>> {
    require(dag, id)?;
    Ok(mark(dag, id, false))
}

/// Reachable set from `start` following parent links.
fn mark<D: CommitDag + ?Sized>(dag: &D, start: &str, inclusive: bool) -> BTreeSet<SnapshotId> {
    let mut reachable = BTreeSet::new();
    let mut queue: Vec<&str> = vec![start];
    if inclusive {
        reachable.insert(start.to_owned());
    }

    while let Some(id) = queue.pop() {
        if let Some(parents) = dag.parents_of(id) {
            for parent in parents {
                if dag.contains(parent) && reachable.insert(parent.clone()) {
                    queue.push(parent);
                }
            }
        }
    }

    reachable
}

/// Strict ancestry: `a` is a proper ancestor of `b`. A node is not its own
/// ancestor.
pub fn is_ancestor<D: CommitDag + ?Sized>(dag: &D, a: &str, b: &str) -> Result<bool> {
    require(dag, a)?;
    require(dag, b)?;
    if a == b {
        return Ok(false);
    }
    Ok(mark(dag, b, false).contains(a))
}

/// Most recent snapshot reachable from both `a` and `b` (each counts as
/// reachable from itself). `NotFound` when the histories are disjoint.
pub fn common_ancestor<D: CommitDag + ?Sized>(dag: &D, a: &str, b: &str) -> Result<SnapshotId> {
    require(dag, a)?;
    require(dag, b)?;

    let from_a = mark(dag, a, true);
    let from_b = mark(dag, b, true);
    let candidates: BTreeSet<&SnapshotId> = from_a.intersection(&from_b).collect();

    // A candidate that is an ancestor of another candidate is never the best base.
    let mut dominated = BTreeSet::new();
    for candidate in &candidates {
        dominated.extend(mark(dag, candidate, false));
    }

    candidates
        .into_iter()
        .filter(|c| !dominated.contains(*c))
        .max_by_key(|c| (dag.recency(c), (*c).clone()))
        .cloned()
        .ok_or_else(|| ProtocolError::not_found(format!("common ancestor of {a} and {b}")))
}

/// History from `head`, newest first, in topological order (a snapshot is
/// always listed before its parents).
///
/// `since` excludes that snapshot and all of its ancestors; `limit`
/// truncates the result to the first N entries.
pub fn history<D: CommitDag + ?Sized>(
    dag: &D,
    head: &str,
    limit: Option<usize>,
    since: Option<&str>,
) -> Result<Vec<SnapshotId>> {
    require(dag, head)?;
    let excluded = match since {
        Some(since) => {
            require(dag, since)?;
            mark(dag, since, true)
        }
        None => BTreeSet::new(),
    };

    let reachable: BTreeSet<SnapshotId> = mark(dag, head, true)
        .into_iter()
        .filter(|id| !excluded.contains(id))
        .collect();

    // Unvisited children per node, restricted to the reachable set.
    let mut pending: BTreeMap<&str, usize> = reachable.iter().map(|id| (id.as_str(), 0)).collect();
    for id in &reachable {
        for parent in dag.parents_of(id).unwrap_or_default() {
            if let Some(count) = pending.get_mut(parent.as_str()) {
                *count += 1;
            }
        }
    }

    let cap = limit.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    let mut ready = BinaryHeap::new();
    if reachable.contains(head) {
        ready.push((dag.recency(head), head.to_owned()));
    }

    while let Some((_, id)) = ready.pop() {
        if out.len() >= cap {
            break;
        }
        for parent in dag.parents_of(&id).unwrap_or_default() {
            if let Some(count) = pending.get_mut(parent.as_str()) {
                *count -= 1;
                if *count == 0 {
                    ready.push((dag.recency(parent), parent.clone()));
                }
            }
        }
        out.push(id);
    }

    Ok(out)
}
