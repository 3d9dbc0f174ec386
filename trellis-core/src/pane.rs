//! Pane projection: snapshot → flat, renderable rows.
//!
//! ```text
//!   PaneState { focus | root edge | whole outline, collapse overrides }
//!        │
//!        ▼
//!   pre-order DFS over child lists ──► Vec<PaneRow>
//! ```
//!
//! Pure functions over an `OutlineSnapshot`; nothing here touches the CRDT.

use std::collections::HashSet;

use log::debug;

use crate::model::{EdgeId, NodeId};
use crate::snapshot::OutlineSnapshot;

/// A focused edge plus the root-to-focus path seen last time it resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneFocus {
    pub edge_id: EdgeId,
    pub path_hint: Vec<EdgeId>,
}

/// View state of one pane. Collapse overrides are local to the pane and
/// never written to the document.
#[derive(Debug, Clone, Default)]
pub struct PaneState {
    pub focus: Option<PaneFocus>,
    pub root_edge_id: Option<EdgeId>,
    pub collapsed_overrides: HashSet<EdgeId>,
}

impl PaneState {
    pub fn focused(edge_id: EdgeId) -> Self {
        Self {
            focus: Some(PaneFocus { edge_id, path_hint: Vec::new() }),
            ..Default::default()
        }
    }

    pub fn rooted_at(edge_id: EdgeId) -> Self {
        Self { root_edge_id: Some(edge_id), ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneRow {
    pub edge_id: EdgeId,
    pub node_id: NodeId,
    /// Indentation inside this pane.
    pub display_depth: usize,
    /// Depth from the document root.
    pub tree_depth: usize,
    pub parent_node_id: Option<NodeId>,
    pub has_children: bool,
    /// Pane override or the edge's own flag.
    pub collapsed: bool,
    pub is_mirror: bool,
    pub ancestor_edge_ids: Vec<EdgeId>,
    pub ancestor_node_ids: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreadcrumbSegment {
    pub edge_id: EdgeId,
    pub node_id: NodeId,
    pub label: String,
}

/// Rows plus the focus information a pane header needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaneView {
    pub rows: Vec<PaneRow>,
    /// Resolved root-to-focus path; feed it back as the next `path_hint`.
    pub focus_path: Option<Vec<EdgeId>>,
    /// The focused edge no longer exists in the tree.
    pub focus_lost: bool,
    pub breadcrumbs: Vec<BreadcrumbSegment>,
}

struct Frame {
    edge_id: EdgeId,
    display_depth: usize,
    tree_depth: usize,
    ancestor_edges: Vec<EdgeId>,
    ancestor_nodes: Vec<NodeId>,
}

/// Project the rows a pane shows, in document order.
pub fn build_pane_rows(snapshot: &OutlineSnapshot, state: &PaneState) -> Vec<PaneRow> {
    project_pane(snapshot, state).rows
}

pub fn project_pane(snapshot: &OutlineSnapshot, state: &PaneState) -> PaneView {
    if let Some(focus) = &state.focus {
        let Some(path) = resolve_focus_path(snapshot, &focus.edge_id, &focus.path_hint) else {
            debug!("Focused edge {} is no longer in the tree", focus.edge_id);
            return PaneView { focus_lost: true, ..Default::default() };
        };
        let Some(focus_edge) = snapshot.edge(&focus.edge_id) else {
            return PaneView { focus_lost: true, ..Default::default() };
        };

        let ancestor_nodes = path_nodes(snapshot, &path);
        let start = snapshot
            .child_edges(&focus_edge.child_node_id)
            .iter()
            .map(|child| Frame {
                edge_id: child.clone(),
                display_depth: 0,
                tree_depth: path.len(),
                ancestor_edges: path.clone(),
                ancestor_nodes: ancestor_nodes.clone(),
            })
            .collect();

        let mut rows = Vec::new();
        walk(snapshot, state, start, &mut rows);
        return PaneView {
            rows,
            breadcrumbs: breadcrumb_segments(snapshot, &path),
            focus_path: Some(path),
            focus_lost: false,
        };
    }

    let start = match &state.root_edge_id {
        Some(root) => {
            if snapshot.edge(root).is_none() {
                return PaneView::default();
            }
            let mut ancestors = resolve_focus_path(snapshot, root, &[]).unwrap_or_default();
            ancestors.pop();
            let ancestor_nodes = path_nodes(snapshot, &ancestors);
            vec![Frame {
                edge_id: root.clone(),
                display_depth: 0,
                tree_depth: ancestors.len(),
                ancestor_edges: ancestors,
                ancestor_nodes,
            }]
        }
        None => snapshot
            .root_edges()
            .iter()
            .map(|edge| Frame {
                edge_id: edge.clone(),
                display_depth: 0,
                tree_depth: 0,
                ancestor_edges: Vec::new(),
                ancestor_nodes: Vec::new(),
            })
            .collect(),
    };

    let mut rows = Vec::new();
    walk(snapshot, state, start, &mut rows);
    PaneView { rows, ..Default::default() }
}

fn path_nodes(snapshot: &OutlineSnapshot, path: &[EdgeId]) -> Vec<NodeId> {
    path.iter()
        .filter_map(|id| snapshot.edge(id))
        .map(|edge| edge.child_node_id.clone())
        .collect()
}

fn walk(snapshot: &OutlineSnapshot, state: &PaneState, start: Vec<Frame>, rows: &mut Vec<PaneRow>) {
    let mut stack: Vec<Frame> = start.into_iter().rev().collect();

    while let Some(frame) = stack.pop() {
        // An edge repeating in its own chain means the graph has a loop
        if frame.ancestor_edges.contains(&frame.edge_id) {
            continue;
        }
        let Some(edge) = snapshot.edge(&frame.edge_id) else { continue };
        if snapshot.node(&edge.child_node_id).is_none() {
            continue;
        }

        let children = snapshot.child_edges(&edge.child_node_id);
        let has_children = children.iter().any(|child| snapshot.edge(child).is_some());
        let collapsed = state.collapsed_overrides.contains(&edge.id) || edge.collapsed;

        if has_children && !collapsed {
            let mut ancestor_edges = frame.ancestor_edges.clone();
            ancestor_edges.push(edge.id.clone());
            let mut ancestor_nodes = frame.ancestor_nodes.clone();
            ancestor_nodes.push(edge.child_node_id.clone());

            for child in children.iter().rev() {
                stack.push(Frame {
                    edge_id: child.clone(),
                    display_depth: frame.display_depth + 1,
                    tree_depth: frame.tree_depth + 1,
                    ancestor_edges: ancestor_edges.clone(),
                    ancestor_nodes: ancestor_nodes.clone(),
                });
            }
        }

        rows.push(PaneRow {
            edge_id: edge.id.clone(),
            node_id: edge.child_node_id.clone(),
            display_depth: frame.display_depth,
            tree_depth: frame.tree_depth,
            parent_node_id: edge.parent_node_id.clone(),
            has_children,
            collapsed,
            is_mirror: edge.is_mirror(),
            ancestor_edge_ids: frame.ancestor_edges,
            ancestor_node_ids: frame.ancestor_nodes,
        });
    }
}

/// Root-to-focus edge path. A still-valid hint is returned as is; otherwise
/// the tree is searched from every root edge. `None` once the edge is gone.
pub fn resolve_focus_path(
    snapshot: &OutlineSnapshot,
    focus: &EdgeId,
    hint: &[EdgeId],
) -> Option<Vec<EdgeId>> {
    snapshot.edge(focus)?;
    if hint_is_valid(snapshot, focus, hint) {
        return Some(hint.to_vec());
    }

    let mut stack: Vec<(EdgeId, usize)> =
        snapshot.root_edges().iter().rev().map(|e| (e.clone(), 0)).collect();
    let mut path: Vec<EdgeId> = Vec::new();
    while let Some((id, depth)) = stack.pop() {
        path.truncate(depth);
        if path.contains(&id) {
            continue;
        }
        let Some(edge) = snapshot.edge(&id) else { continue };
        path.push(id.clone());
        if &id == focus {
            return Some(path);
        }
        for child in snapshot.child_edges(&edge.child_node_id).iter().rev() {
            stack.push((child.clone(), depth + 1));
        }
    }
    None
}

fn hint_is_valid(snapshot: &OutlineSnapshot, focus: &EdgeId, hint: &[EdgeId]) -> bool {
    let (Some(first), Some(last)) = (hint.first(), hint.last()) else {
        return false;
    };
    if last != focus || !snapshot.root_edges().contains(first) {
        return false;
    }
    if !matches!(snapshot.edge(first), Some(edge) if edge.parent_node_id.is_none()) {
        return false;
    }

    let mut seen = HashSet::new();
    if !hint.iter().all(|id| seen.insert(id)) {
        return false;
    }

    hint.windows(2).all(|pair| {
        let (Some(parent), Some(child)) = (snapshot.edge(&pair[0]), snapshot.edge(&pair[1])) else {
            return false;
        };
        child.parent_node_id.as_ref() == Some(&parent.child_node_id)
            && snapshot.child_edges(&parent.child_node_id).contains(&child.id)
    })
}

/// Labels for every edge of a focus path, root first.
pub fn breadcrumb_segments(snapshot: &OutlineSnapshot, path: &[EdgeId]) -> Vec<BreadcrumbSegment> {
    path.iter()
        .filter_map(|id| {
            let edge = snapshot.edge(id)?;
            let node = snapshot.node(&edge.child_node_id)?;
            Some(BreadcrumbSegment {
                edge_id: edge.id.clone(),
                node_id: node.id.clone(),
                label: node.content.text.clone(),
            })
        })
        .collect()
}
