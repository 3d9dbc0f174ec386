//! Mirror operations: placing an existing node at another tree location.
//!
//! Three ways to land a mirror:
//! - convert: the target edge points at a blank node, so the edge itself is
//!   repointed at the source node and the blank node is dropped;
//! - insert-sibling: a new mirror edge right after the target edge;
//! - explicit position: a new mirror edge at `(parent, index)`.

use log::debug;

use crate::error::Result;
use crate::model::{Edge, EdgeId, NodeId};
use crate::structure::{self, creates_cycle};
use crate::transaction::Transaction;

/// Where a mirror should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorTarget {
    /// Convert or insert next to an existing edge.
    Edge(EdgeId),
    /// Insert under `parent` (`None` = root level) at `index`.
    Position { parent: Option<NodeId>, index: usize },
}

/// The route a placement took. It does not say whether the edge ended up a
/// mirror: a source with no primary placement yet receives an ordinary
/// primary edge on every route, `Converted` included. Check
/// [`Edge::is_mirror`] on the resulting edge when that matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorMode {
    Converted,
    InsertedSibling,
    ExplicitPosition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Created { edge_id: EdgeId, mode: MirrorMode },
    /// Source node, target edge or explicit parent no longer exists.
    Unavailable,
    /// The insertion point lies inside the source node's own subtree.
    CycleRejected,
}

/// Validate every precondition, then write. `new_edge_id` is only used when a
/// fresh edge is created.
pub(crate) fn create_mirror_edge(
    tx: &mut Transaction<'_>,
    target: &MirrorTarget,
    source: &NodeId,
    new_edge_id: EdgeId,
) -> Result<MirrorOutcome> {
    if tx.node(source)?.is_none() {
        debug!("Mirror source {} is gone", source);
        return Ok(MirrorOutcome::Unavailable);
    }

    match target {
        MirrorTarget::Edge(target_id) => {
            let Some(target_edge) = tx.edge(target_id)? else {
                return Ok(MirrorOutcome::Unavailable);
            };
            let Some(target_node) = tx.node(&target_edge.child_node_id)? else {
                return Ok(MirrorOutcome::Unavailable);
            };
            if let Some(parent) = &target_edge.parent_node_id {
                if creates_cycle(tx, parent, source)? {
                    return Ok(MirrorOutcome::CycleRejected);
                }
            }

            let convertible = target_node.content.is_blank()
                && &target_node.id != source
                && tx.child_list(Some(&target_node.id))?.is_empty()
                && tx.child_edges(&target_node.id)?.is_empty();

            if convertible {
                convert(tx, target_edge, source)
            } else {
                let index = structure::sibling_index(tx, &target_edge)?.map(|i| i + 1);
                let parent = target_edge.parent_node_id.clone();
                let edge = structure::new_placement(tx, new_edge_id, parent, source)?;
                let edge_id = structure::place_edge(tx, edge, index)?;
                Ok(MirrorOutcome::Created { edge_id, mode: MirrorMode::InsertedSibling })
            }
        }
        MirrorTarget::Position { parent, index } => {
            if let Some(parent) = parent {
                if tx.node(parent)?.is_none() {
                    return Ok(MirrorOutcome::Unavailable);
                }
                if creates_cycle(tx, parent, source)? {
                    return Ok(MirrorOutcome::CycleRejected);
                }
            }
            let edge = structure::new_placement(tx, new_edge_id, parent.clone(), source)?;
            let edge_id = structure::place_edge(tx, edge, Some(*index))?;
            Ok(MirrorOutcome::Created { edge_id, mode: MirrorMode::ExplicitPosition })
        }
    }
}

/// Repoint `edge` at `source` in place and drop the blank node it placed.
fn convert(tx: &mut Transaction<'_>, edge: Edge, source: &NodeId) -> Result<MirrorOutcome> {
    let old_node = edge.child_node_id.clone();
    let was_primary = !edge.is_mirror();

    let parent = edge.parent_node_id.clone();
    let mut repointed = structure::new_placement(tx, edge.id.clone(), parent, source)?;
    repointed.collapsed = edge.collapsed;
    repointed.position = edge.position;
    tx.put_edge(&repointed)?;

    if tx.placements(&old_node)?.is_empty() {
        tx.delete_node(&old_node);
        debug!("Converted edge {}: dropped blank node {}", edge.id, old_node);
    } else if was_primary {
        structure::promote_remaining(tx, &old_node)?;
    }

    Ok(MirrorOutcome::Created { edge_id: edge.id, mode: MirrorMode::Converted })
}
