//! Immutable read view of a committed document state.

use std::collections::HashMap;

use yrs::ReadTxn;

use crate::error::Result;
use crate::model::{Edge, EdgeId, Node, NodeId};
use crate::transaction::Tables;

/// Copy-out of every table, cheap to share behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct OutlineSnapshot {
    pub version: u64,
    nodes: HashMap<NodeId, Node>,
    edges: HashMap<EdgeId, Edge>,
    root_edges: Vec<EdgeId>,
    children: HashMap<NodeId, Vec<EdgeId>>,
}

impl OutlineSnapshot {
    pub(crate) fn read<T: ReadTxn>(tables: &Tables, txn: &T, version: u64) -> Result<Self> {
        let nodes = tables.nodes(txn)?.into_iter().map(|n| (n.id.clone(), n)).collect();
        let edges = tables.edges(txn)?.into_iter().map(|e| (e.id.clone(), e)).collect();

        let mut root_edges = Vec::new();
        let mut children = HashMap::new();
        for (parent, list) in tables.child_lists(txn)? {
            match parent {
                Some(parent) => {
                    children.insert(parent, list);
                }
                None => root_edges = list,
            }
        }

        Ok(Self { version, nodes, edges, root_edges, children })
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn root_edges(&self) -> &[EdgeId] {
        &self.root_edges
    }

    /// Ordered child edges of `node`; empty when it has none.
    pub fn child_edges(&self, node: &NodeId) -> &[EdgeId] {
        self.children.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Child edges of `parent`, or the root list for `None`.
    pub fn list(&self, parent: Option<&NodeId>) -> &[EdgeId] {
        match parent {
            Some(parent) => self.child_edges(parent),
            None => self.root_edges(),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Placements of `node`, sorted by edge id.
    pub fn placements(&self, node: &NodeId) -> Vec<&Edge> {
        let mut found: Vec<&Edge> =
            self.edges.values().filter(|e| &e.child_node_id == node).collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Plain text of the node an edge places.
    pub fn label(&self, edge: &EdgeId) -> Option<&str> {
        let edge = self.edges.get(edge)?;
        self.nodes.get(&edge.child_node_id).map(|n| n.content.text.as_str())
    }

    /// Every parent → list pair including the root list, sorted by parent.
    pub fn lists(&self) -> Vec<(Option<&NodeId>, &[EdgeId])> {
        let mut lists: Vec<(Option<&NodeId>, &[EdgeId])> =
            self.children.iter().map(|(k, v)| (Some(k), v.as_slice())).collect();
        lists.sort_by(|a, b| a.0.cmp(&b.0));
        lists.insert(0, (None, self.root_edges.as_slice()));
        lists
    }
}
