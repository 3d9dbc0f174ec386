//! Structural helpers shared by edge operations and mirror operations.
//!
//! All helpers run inside an open transaction. Callers validate first and
//! only then call the writing helpers, because a yrs transaction cannot be
//! rolled back.

use std::collections::{BTreeSet, HashMap, VecDeque};

use log::debug;

use crate::error::Result;
use crate::model::{Edge, EdgeId, NodeId};
use crate::transaction::Transaction;

/// Result of a structural edit that may be refused without being an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralOutcome<T = ()> {
    Applied(T),
    /// Applying the edit would make a node its own ancestor.
    CycleRejected,
}

impl<T> StructuralOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, StructuralOutcome::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            StructuralOutcome::Applied(value) => Some(value),
            StructuralOutcome::CycleRejected => None,
        }
    }
}

/// What `remove_edge` took out of the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub removed_edges: Vec<EdgeId>,
    pub removed_nodes: Vec<NodeId>,
    /// Mirrors that became the primary placement of a surviving node.
    pub promoted: Vec<EdgeId>,
}

/// True when placing `child` under `parent` would close a loop: `parent` is
/// `child` itself or sits anywhere below it, following every placement.
pub(crate) fn creates_cycle(tx: &Transaction<'_>, parent: &NodeId, child: &NodeId) -> Result<bool> {
    if parent == child {
        return Ok(true);
    }

    let mut parents_of: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for edge in tx.edges()? {
        if let Some(p) = edge.parent_node_id {
            parents_of.entry(edge.child_node_id).or_default().push(p);
        }
    }

    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from([parent.clone()]);
    while let Some(current) = queue.pop_front() {
        if &current == child {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        if let Some(ups) = parents_of.get(&current) {
            queue.extend(ups.iter().cloned());
        }
    }
    Ok(false)
}

/// The non-mirror placement of `node`, lowest id first if a merge left several.
pub(crate) fn primary_placement(tx: &Transaction<'_>, node: &NodeId) -> Result<Option<Edge>> {
    Ok(tx.placements(node)?.into_iter().find(|e| !e.is_mirror()))
}

/// Build a new placement of `child`: a mirror when the node is already placed.
pub(crate) fn new_placement(
    tx: &Transaction<'_>,
    id: EdgeId,
    parent: Option<NodeId>,
    child: &NodeId,
) -> Result<Edge> {
    Ok(match primary_placement(tx, child)? {
        Some(primary) => Edge::mirror(id, parent, child.clone(), primary.id),
        None => Edge::primary(id, parent, child.clone()),
    })
}

/// Insert `edge` into its parent's list at `index` (clamped, `None` appends)
/// and store it with the resulting position hint.
pub(crate) fn place_edge(
    tx: &mut Transaction<'_>,
    mut edge: Edge,
    index: Option<usize>,
) -> Result<EdgeId> {
    let parent = edge.parent_node_id.clone();
    let mut list = tx.child_list(parent.as_ref())?;
    list.retain(|id| id != &edge.id);
    let at = index.map_or(list.len(), |i| i.min(list.len()));
    list.insert(at, edge.id.clone());
    edge.position = Some(at as u32);

    tx.put_edge(&edge)?;
    tx.put_child_list(parent.as_ref(), &list)?;
    Ok(edge.id)
}

/// Remove `edge` from the list it is in.
pub(crate) fn unlink_edge(tx: &mut Transaction<'_>, edge: &Edge) -> Result<()> {
    let parent = edge.parent_node_id.as_ref();
    let mut list = tx.child_list(parent)?;
    let before = list.len();
    list.retain(|id| id != &edge.id);
    if list.len() != before {
        tx.put_child_list(parent, &list)?;
    }
    Ok(())
}

/// Index of `edge` among its siblings, if listed.
pub(crate) fn sibling_index(tx: &Transaction<'_>, edge: &Edge) -> Result<Option<usize>> {
    Ok(tx
        .child_list(edge.parent_node_id.as_ref())?
        .iter()
        .position(|id| id == &edge.id))
}

/// Make every remaining placement of `node` agree on one primary edge after
/// the former primary went away. Returns the promoted edge, if any.
pub(crate) fn promote_remaining(tx: &mut Transaction<'_>, node: &NodeId) -> Result<Option<EdgeId>> {
    let remaining = tx.placements(node)?;
    let Some(first) = remaining.first() else {
        return Ok(None);
    };
    let primary_id = first.id.clone();

    for mut edge in remaining {
        if edge.id == primary_id {
            edge.promote();
        } else {
            edge.canonical_edge_id = primary_id.clone();
            edge.mirror_of_node_id = Some(node.clone());
        }
        tx.put_edge(&edge)?;
    }
    debug!("Promoted edge {} to primary of node {}", primary_id, node);
    Ok(Some(primary_id))
}

/// Remove an edge. A node that loses its last placement is deleted together
/// with its own child edges; a surviving node whose primary edge went away
/// gets one of its mirrors promoted.
pub(crate) fn remove_edge_cascade(
    tx: &mut Transaction<'_>,
    edge_id: &EdgeId,
    report: &mut RemovalReport,
) -> Result<()> {
    let Some(edge) = tx.edge(edge_id)? else {
        return Ok(());
    };
    unlink_edge(tx, &edge)?;
    tx.delete_edge(&edge.id);
    report.removed_edges.push(edge.id.clone());

    let node = edge.child_node_id.clone();
    if tx.placements(&node)?.is_empty() {
        let mut children: BTreeSet<EdgeId> = tx.child_list(Some(&node))?.into_iter().collect();
        children.extend(tx.child_edges(&node)?.into_iter().map(|e| e.id));

        tx.delete_node(&node);
        report.removed_nodes.push(node.clone());
        for child in &children {
            remove_edge_cascade(tx, child, report)?;
        }
        tx.put_child_list(Some(&node), &[])?;
    } else if !edge.is_mirror() {
        report.promoted.extend(promote_remaining(tx, &node)?);
    }
    Ok(())
}
