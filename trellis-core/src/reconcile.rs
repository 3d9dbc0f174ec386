//! Structural reconciler.
//!
//! The edge table is the source of truth. The root list and the per-parent
//! child lists are redundant indexes that concurrent merges can leave with
//! orphans, duplicates or missing entries; this pass repairs them, and also
//! settles which placement of a node is the primary one.
//!
//! Concurrent moves can also merge into a parent loop (A under B on one
//! replica, B under A on another). Every loop is broken by moving its
//! lowest-id edge to the root list, so all replicas pick the same edge.
//!
//! ```text
//!   edges ──► break parent loops
//!         ──► target list per edge ──► drop from other lists
//!                                  ──► dedup in target list
//!                                  ──► insert at position hint / append
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use log::{debug, error, warn};

use crate::error::{OutlineError, Result};
use crate::model::{Edge, EdgeId, NodeId};
use crate::transaction::Transaction;

/// Which edges a reconciliation pass looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileScope {
    /// Every edge and every list entry.
    Full,
    /// Only the listed edge ids; everything else is assumed consistent.
    Edges(BTreeSet<EdgeId>),
}

impl ReconcileScope {
    pub fn len(&self) -> Option<usize> {
        match self {
            ReconcileScope::Full => None,
            ReconcileScope::Edges(ids) => Some(ids.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ReconcileScope::Edges(ids) if ids.is_empty())
    }
}

/// Repair indexes for `scope`. Returns the number of repairs made; zero
/// means nothing diverged. Running the same scope twice yields zero.
pub(crate) fn reconcile(tx: &mut Transaction<'_>, scope: &ReconcileScope) -> Result<usize> {
    if scope.is_empty() {
        return Ok(0);
    }

    let mut edges: BTreeMap<EdgeId, Edge> =
        tx.edges()?.into_iter().map(|e| (e.id.clone(), e)).collect();
    let original = tx.child_lists()?;

    let touched: BTreeSet<EdgeId> = match scope {
        ReconcileScope::Full => edges
            .keys()
            .cloned()
            .chain(original.values().flatten().cloned())
            .collect(),
        ReconcileScope::Edges(ids) => ids.clone(),
    };

    for id in &touched {
        if let Some(edge) = edges.get(id) {
            check_endpoints(tx, edge)?;
        }
    }

    let moved = break_cycles(tx, &mut edges, &touched)?;
    let mut repairs = moved.len();
    let touched: BTreeSet<EdgeId> = touched.into_iter().chain(moved).collect();

    let mut lists = original.clone();
    for id in &touched {
        let target = edges.get(id).map(|e| e.parent_node_id.clone());
        for (key, list) in lists.iter_mut() {
            if target.as_ref() == Some(key) {
                repairs += dedup_entry(list, id);
            } else {
                repairs += remove_entry(list, id);
            }
        }
        if let Some(edge) = edges.get(id) {
            let list = lists.entry(edge.parent_node_id.clone()).or_default();
            if !list.contains(id) {
                let at = edge.position.map_or(list.len(), |p| (p as usize).min(list.len()));
                list.insert(at, id.clone());
                repairs += 1;
            }
        }
    }

    for (key, list) in &lists {
        let changed = match original.get(key) {
            Some(before) => before != list,
            None => !list.is_empty(),
        };
        if changed {
            tx.put_child_list(key.as_ref(), list)?;
        }
    }

    repairs += repair_canonical(tx, &edges, &touched, scope)?;

    if repairs > 0 {
        debug!("Reconciliation repaired {} entries ({:?} scope)", repairs, scope.len());
    }
    Ok(repairs)
}

fn check_endpoints(tx: &Transaction<'_>, edge: &Edge) -> Result<()> {
    let endpoints = std::iter::once(&edge.child_node_id).chain(edge.parent_node_id.as_ref());
    for node in endpoints {
        if tx.node(node)?.is_none() {
            error!("Edge {} references missing node {}", edge.id, node);
            return Err(OutlineError::ReconciliationCorruption {
                edge_id: edge.id.to_string(),
                node_id: node.to_string(),
            });
        }
    }
    Ok(())
}

/// Detach every parent loop reachable from `candidates`. Returns the edges
/// that were moved to the root list.
fn break_cycles(
    tx: &mut Transaction<'_>,
    edges: &mut BTreeMap<EdgeId, Edge>,
    candidates: &BTreeSet<EdgeId>,
) -> Result<Vec<EdgeId>> {
    let mut moved = Vec::new();
    // Each round roots one edge, so this ends after at most `edges.len()` rounds.
    while let Some(id) = find_cycle_edge(edges, candidates) {
        let Some(edge) = edges.get_mut(&id) else { break };
        warn!(
            "Edge {} closes a parent loop through node {}; moving it to the root list",
            id, edge.child_node_id
        );
        edge.parent_node_id = None;
        tx.put_edge(edge)?;
        moved.push(id);
    }
    Ok(moved)
}

/// The lowest-id edge of the first loop found through a candidate edge.
///
/// The loop is taken as the whole strongly connected set of nodes around the
/// candidate's child, so the choice does not depend on which candidate found it.
fn find_cycle_edge(
    edges: &BTreeMap<EdgeId, Edge>,
    candidates: &BTreeSet<EdgeId>,
) -> Option<EdgeId> {
    let mut up: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    let mut down: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for edge in edges.values() {
        if let Some(parent) = &edge.parent_node_id {
            up.entry(&edge.child_node_id).or_default().push(parent);
            down.entry(parent).or_default().push(&edge.child_node_id);
        }
    }

    for id in candidates {
        let Some(edge) = edges.get(id) else { continue };
        let Some(parent) = &edge.parent_node_id else { continue };
        let child = &edge.child_node_id;
        if !reachable(&up, parent).contains(child) {
            continue;
        }

        let above = reachable(&up, child);
        let below = reachable(&down, child);
        let in_loop = |node: &NodeId| above.contains(node) && below.contains(node);
        // BTreeMap iteration yields the lowest id first.
        return edges
            .values()
            .find(|e| {
                e.parent_node_id.as_ref().is_some_and(in_loop) && in_loop(&e.child_node_id)
            })
            .map(|e| e.id.clone());
    }
    None
}

/// `start` plus everything reachable from it.
fn reachable<'a>(
    graph: &HashMap<&'a NodeId, Vec<&'a NodeId>>,
    start: &'a NodeId,
) -> HashSet<&'a NodeId> {
    let mut seen = HashSet::from([start]);
    let mut stack = vec![start];
    while let Some(current) = stack.pop() {
        for next in graph.get(current).into_iter().flatten() {
            if seen.insert(*next) {
                stack.push(*next);
            }
        }
    }
    seen
}

/// Keep the first occurrence of `id`; returns how many copies were dropped.
fn dedup_entry(list: &mut Vec<EdgeId>, id: &EdgeId) -> usize {
    let mut seen = false;
    let before = list.len();
    list.retain(|entry| {
        if entry != id {
            return true;
        }
        let keep = !seen;
        seen = true;
        keep
    });
    before - list.len()
}

fn remove_entry(list: &mut Vec<EdgeId>, id: &EdgeId) -> usize {
    let before = list.len();
    list.retain(|entry| entry != id);
    before - list.len()
}

/// Every placed node ends up with exactly one primary edge, lowest id wins
/// when there is no surviving primary or when a merge produced two.
fn repair_canonical(
    tx: &mut Transaction<'_>,
    edges: &BTreeMap<EdgeId, Edge>,
    touched: &BTreeSet<EdgeId>,
    scope: &ReconcileScope,
) -> Result<usize> {
    let nodes: BTreeSet<&NodeId> = match scope {
        ReconcileScope::Full => edges.values().map(|e| &e.child_node_id).collect(),
        ReconcileScope::Edges(_) => edges
            .values()
            .filter(|e| touched.contains(&e.id) || touched.contains(&e.canonical_edge_id))
            .map(|e| &e.child_node_id)
            .collect(),
    };

    let mut placements: BTreeMap<&NodeId, Vec<&Edge>> = BTreeMap::new();
    for edge in edges.values() {
        if nodes.contains(&edge.child_node_id) {
            placements.entry(&edge.child_node_id).or_default().push(edge);
        }
    }

    let mut repairs = 0;
    for (node, group) in placements {
        let primary_id = group
            .iter()
            .find(|e| !e.is_mirror())
            .or_else(|| group.first())
            .map(|e| e.id.clone());
        let Some(primary_id) = primary_id else { continue };

        for edge in group {
            let mut fixed = edge.clone();
            if fixed.id == primary_id {
                fixed.promote();
            } else {
                fixed.canonical_edge_id = primary_id.clone();
                fixed.mirror_of_node_id = Some(node.clone());
            }
            if &fixed != edge {
                tx.put_edge(&fixed)?;
                repairs += 1;
            }
        }
    }
    Ok(repairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<EdgeId> {
        list.iter().map(|s| EdgeId::new(*s)).collect()
    }

    #[test]
    fn test_dedup_keeps_first() {
        let mut list = ids(&["a", "b", "a", "c", "a"]);
        assert_eq!(dedup_entry(&mut list, &EdgeId::new("a")), 2);
        assert_eq!(list, ids(&["a", "b", "c"]));
        assert_eq!(dedup_entry(&mut list, &EdgeId::new("a")), 0);
    }

    #[test]
    fn test_remove_entry_counts() {
        let mut list = ids(&["a", "b", "a"]);
        assert_eq!(remove_entry(&mut list, &EdgeId::new("a")), 2);
        assert_eq!(list, ids(&["b"]));
    }

    fn edge_map(links: &[(&str, Option<&str>, &str)]) -> BTreeMap<EdgeId, Edge> {
        links
            .iter()
            .map(|(id, parent, child)| {
                let parent = parent.map(NodeId::new);
                let edge = Edge::primary(EdgeId::new(*id), parent, NodeId::new(*child));
                (edge.id.clone(), edge)
            })
            .collect()
    }

    #[test]
    fn test_cycle_edge_is_lowest_on_loop() {
        // a -> b -> c -> a, with d hanging off c outside the loop.
        let edges = edge_map(&[
            ("e3", Some("c"), "a"),
            ("e1", Some("a"), "b"),
            ("e2", Some("b"), "c"),
            ("e0", Some("c"), "d"),
        ]);
        for start in ["e1", "e2", "e3"] {
            let candidates = BTreeSet::from([EdgeId::new(start)]);
            assert_eq!(find_cycle_edge(&edges, &candidates), Some(EdgeId::new("e1")));
        }
        assert_eq!(find_cycle_edge(&edges, &BTreeSet::from([EdgeId::new("e0")])), None);
    }

    #[test]
    fn test_no_cycle_in_tree() {
        let edges = edge_map(&[("e1", None, "a"), ("e2", Some("a"), "b"), ("e3", Some("b"), "c")]);
        let all: BTreeSet<EdgeId> = edges.keys().cloned().collect();
        assert_eq!(find_cycle_edge(&edges, &all), None);
    }

    #[test]
    fn test_empty_scope() {
        assert!(ReconcileScope::Edges(BTreeSet::new()).is_empty());
        assert!(!ReconcileScope::Full.is_empty());
        assert_eq!(ReconcileScope::Full.len(), None);
    }
}
