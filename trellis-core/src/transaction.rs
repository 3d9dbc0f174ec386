//! Transaction boundary over the replicated tables.
//!
//! ```text
//!   OutlineDoc::transact(origin, |tx| ...)
//!        │
//!        ▼
//!   yrs TransactionMut ── commit ──► map observers ──► RecordChange log
//!                                                         │
//!                          ChangeSet { (table, key, before, after) }
//!                                │            │             │
//!                           undo stack   ChangeEvent    reconcile scope
//! ```
//!
//! Every record is a JSON string stored under one key, so concurrent writers
//! to the same record resolve last-writer-wins inside yrs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use yrs::types::EntryChange;
use yrs::{Doc, Map, MapRef, Observable, ReadTxn, TransactionMut, Update};

use crate::error::{OutlineError, Result};
use crate::model::{Edge, EdgeId, Node, NodeId};

pub(crate) const ROOT_ORDER_KEY: &str = "order";

/// Who caused a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A local user edit (undo/redo replays are reported as local too).
    Local,
    /// A delta received from another replica.
    Remote,
    /// Index repair performed by the reconciler.
    Reconciliation,
    /// State replayed from persistence at startup.
    Restore,
}

/// The four replicated maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Nodes,
    Edges,
    Children,
    Roots,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Nodes => "nodes",
            Table::Edges => "edges",
            Table::Children => "children",
            Table::Roots => "roots",
        }
    }
}

/// One record-level change observed at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub table: Table,
    pub key: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// All record changes of one committed transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub records: Vec<RecordChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn touched_nodes(&self) -> BTreeSet<NodeId> {
        self.records
            .iter()
            .filter(|r| r.table == Table::Nodes)
            .map(|r| NodeId::new(r.key.clone()))
            .collect()
    }

    /// Edge records that changed plus every id that entered or left a list.
    pub fn touched_edges(&self) -> BTreeSet<EdgeId> {
        let mut touched = BTreeSet::new();
        for record in &self.records {
            match record.table {
                Table::Edges => {
                    touched.insert(EdgeId::new(record.key.clone()));
                }
                Table::Children | Table::Roots => {
                    for side in [&record.before, &record.after].into_iter().flatten() {
                        touched.extend(parse_list(side));
                    }
                }
                Table::Nodes => {}
            }
        }
        touched
    }

    /// Nodes whose record disappeared in this transaction.
    pub fn removed_nodes(&self) -> BTreeSet<NodeId> {
        self.records
            .iter()
            .filter(|r| r.table == Table::Nodes && r.after.is_none())
            .map(|r| NodeId::new(r.key.clone()))
            .collect()
    }
}

/// A list value that fails to parse contributes no ids.
fn parse_list(json: &str) -> Vec<EdgeId> {
    serde_json::from_str(json).unwrap_or_default()
}

/// Delivered to subscribers after each committed transaction.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub origin: Origin,
    /// Binary yrs v1 delta against the state before the transaction.
    pub update: Vec<u8>,
    pub touched_nodes: BTreeSet<NodeId>,
    pub touched_edges: BTreeSet<EdgeId>,
    /// Document version after the transaction.
    pub version: u64,
}

// ─── Subscriptions ──────────────────────────────────────────────────────────

type Callback = Box<dyn FnMut(&ChangeEvent) + Send>;

#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

impl Subscribers {
    pub(crate) fn register(registry: &Arc<Mutex<Subscribers>>, callback: Callback) -> Subscription {
        let id = match registry.lock() {
            Ok(mut subs) => {
                subs.next_id += 1;
                let id = subs.next_id;
                subs.callbacks.insert(id, callback);
                id
            }
            Err(_) => 0,
        };
        Subscription { id, registry: Arc::downgrade(registry) }
    }

    /// Callbacks run with the registry locked and must not unsubscribe themselves.
    pub(crate) fn notify(registry: &Arc<Mutex<Subscribers>>, event: &ChangeEvent) {
        if let Ok(mut subs) = registry.lock() {
            for callback in subs.callbacks.values_mut() {
                callback(event);
            }
        }
    }

    pub(crate) fn len(registry: &Arc<Mutex<Subscribers>>) -> usize {
        registry.lock().map(|subs| subs.callbacks.len()).unwrap_or(0)
    }
}

/// Handle returned by `OutlineDoc::subscribe`. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Safe to call any number of times, also after the document is gone.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut subs) = registry.lock() {
                subs.callbacks.remove(&self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// ─── Undo ───────────────────────────────────────────────────────────────────

/// Bounded history of local record changes.
#[derive(Debug, Default)]
pub(crate) struct UndoStack {
    undo: VecDeque<Vec<RecordChange>>,
    redo: Vec<Vec<RecordChange>>,
    depth: usize,
}

impl UndoStack {
    pub(crate) fn new(depth: usize) -> Self {
        Self { undo: VecDeque::new(), redo: Vec::new(), depth }
    }

    /// A fresh local edit invalidates everything that could be redone.
    pub(crate) fn record(&mut self, records: Vec<RecordChange>) {
        self.push_undo(records);
        self.redo.clear();
    }

    pub(crate) fn push_undo(&mut self, records: Vec<RecordChange>) {
        if self.depth == 0 {
            return;
        }
        self.undo.push_back(records);
        while self.undo.len() > self.depth {
            self.undo.pop_front();
        }
    }

    pub(crate) fn push_redo(&mut self, records: Vec<RecordChange>) {
        self.redo.push(records);
    }

    pub(crate) fn pop_undo(&mut self) -> Option<Vec<RecordChange>> {
        self.undo.pop_back()
    }

    pub(crate) fn pop_redo(&mut self) -> Option<Vec<RecordChange>> {
        self.redo.pop()
    }

    pub(crate) fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub(crate) fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }
}

// ─── Tables ─────────────────────────────────────────────────────────────────

/// Handles to the four maps plus typed readers over any read transaction.
pub(crate) struct Tables {
    nodes: MapRef,
    edges: MapRef,
    children: MapRef,
    roots: MapRef,
}

impl Tables {
    pub(crate) fn new(doc: &Doc) -> Self {
        Self {
            nodes: doc.get_or_insert_map(Table::Nodes.name()),
            edges: doc.get_or_insert_map(Table::Edges.name()),
            children: doc.get_or_insert_map(Table::Children.name()),
            roots: doc.get_or_insert_map(Table::Roots.name()),
        }
    }

    fn map(&self, table: Table) -> &MapRef {
        match table {
            Table::Nodes => &self.nodes,
            Table::Edges => &self.edges,
            Table::Children => &self.children,
            Table::Roots => &self.roots,
        }
    }

    /// Install one observer per map that appends committed changes to `sink`.
    pub(crate) fn observe(&self, sink: &Arc<Mutex<Vec<RecordChange>>>) -> Vec<yrs::Subscription> {
        [Table::Nodes, Table::Edges, Table::Children, Table::Roots]
            .into_iter()
            .map(|table| {
                let sink = Arc::clone(sink);
                self.map(table).observe(move |txn, event| {
                    let Ok(mut log) = sink.lock() else { return };
                    for (key, change) in event.keys(txn).iter() {
                        let (before, after) = match change {
                            EntryChange::Inserted(new) => (None, new.clone().cast::<String>().ok()),
                            EntryChange::Updated(old, new) => (
                                old.clone().cast::<String>().ok(),
                                new.clone().cast::<String>().ok(),
                            ),
                            EntryChange::Removed(old) => (old.clone().cast::<String>().ok(), None),
                        };
                        if before != after {
                            log.push(RecordChange { table, key: key.to_string(), before, after });
                        }
                    }
                })
            })
            .collect()
    }

    pub(crate) fn raw<T: ReadTxn>(&self, txn: &T, table: Table, key: &str) -> Option<String> {
        self.map(table).get(txn, key).map(|value| value.to_string(txn))
    }

    fn raw_entries<T: ReadTxn>(&self, txn: &T, table: Table) -> Vec<(String, String)> {
        self.map(table)
            .iter(txn)
            .map(|(key, value)| (key.to_string(), value.to_string(txn)))
            .collect()
    }

    pub(crate) fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        self.nodes.len(txn) == 0 && self.edges.len(txn) == 0
    }

    pub(crate) fn node<T: ReadTxn>(&self, txn: &T, id: &NodeId) -> Result<Option<Node>> {
        self.raw(txn, Table::Nodes, id.as_str())
            .map(|json| serde_json::from_str(&json).map_err(OutlineError::from))
            .transpose()
    }

    pub(crate) fn edge<T: ReadTxn>(&self, txn: &T, id: &EdgeId) -> Result<Option<Edge>> {
        self.raw(txn, Table::Edges, id.as_str())
            .map(|json| serde_json::from_str(&json).map_err(OutlineError::from))
            .transpose()
    }

    pub(crate) fn nodes<T: ReadTxn>(&self, txn: &T) -> Result<Vec<Node>> {
        let mut nodes = self
            .raw_entries(txn, Table::Nodes)
            .into_iter()
            .map(|(_, json)| serde_json::from_str::<Node>(&json).map_err(OutlineError::from))
            .collect::<Result<Vec<_>>>()?;
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    pub(crate) fn edges<T: ReadTxn>(&self, txn: &T) -> Result<Vec<Edge>> {
        let mut edges = self
            .raw_entries(txn, Table::Edges)
            .into_iter()
            .map(|(_, json)| serde_json::from_str::<Edge>(&json).map_err(OutlineError::from))
            .collect::<Result<Vec<_>>>()?;
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(edges)
    }

    pub(crate) fn child_list<T: ReadTxn>(
        &self,
        txn: &T,
        parent: Option<&NodeId>,
    ) -> Result<Vec<EdgeId>> {
        let raw = match parent {
            Some(parent) => self.raw(txn, Table::Children, parent.as_str()),
            None => self.raw(txn, Table::Roots, ROOT_ORDER_KEY),
        };
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Every stored list keyed by parent; the root list sits under `None`.
    pub(crate) fn child_lists<T: ReadTxn>(
        &self,
        txn: &T,
    ) -> Result<BTreeMap<Option<NodeId>, Vec<EdgeId>>> {
        let mut lists = BTreeMap::new();
        if let Some(json) = self.raw(txn, Table::Roots, ROOT_ORDER_KEY) {
            lists.insert(None, serde_json::from_str(&json)?);
        }
        for (key, json) in self.raw_entries(txn, Table::Children) {
            lists.insert(Some(NodeId::new(key)), serde_json::from_str(&json)?);
        }
        Ok(lists)
    }
}

// ─── Transaction ────────────────────────────────────────────────────────────

/// Typed access to the tables inside one yrs transaction.
///
/// Writes that would store an identical value are skipped, so a transaction
/// that changes nothing commits no records and produces no event.
pub struct Transaction<'doc> {
    txn: TransactionMut<'doc>,
    tables: &'doc Tables,
    origin: Origin,
}

impl<'doc> Transaction<'doc> {
    pub(crate) fn new(txn: TransactionMut<'doc>, tables: &'doc Tables, origin: Origin) -> Self {
        Self { txn, tables, origin }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn node(&self, id: &NodeId) -> Result<Option<Node>> {
        self.tables.node(&self.txn, id)
    }

    pub fn require_node(&self, id: &NodeId) -> Result<Node> {
        self.node(id)?.ok_or_else(|| OutlineError::missing_node(id))
    }

    pub fn edge(&self, id: &EdgeId) -> Result<Option<Edge>> {
        self.tables.edge(&self.txn, id)
    }

    pub fn require_edge(&self, id: &EdgeId) -> Result<Edge> {
        self.edge(id)?.ok_or_else(|| OutlineError::missing_edge(id))
    }

    pub fn nodes(&self) -> Result<Vec<Node>> {
        self.tables.nodes(&self.txn)
    }

    /// All edges sorted by id.
    pub fn edges(&self) -> Result<Vec<Edge>> {
        self.tables.edges(&self.txn)
    }

    pub fn child_list(&self, parent: Option<&NodeId>) -> Result<Vec<EdgeId>> {
        self.tables.child_list(&self.txn, parent)
    }

    pub fn child_lists(&self) -> Result<BTreeMap<Option<NodeId>, Vec<EdgeId>>> {
        self.tables.child_lists(&self.txn)
    }

    /// Every edge that places `node`, sorted by edge id.
    pub fn placements(&self, node: &NodeId) -> Result<Vec<Edge>> {
        Ok(self.edges()?.into_iter().filter(|e| &e.child_node_id == node).collect())
    }

    /// Edges whose parent is `node`, whether or not they are listed.
    pub fn child_edges(&self, node: &NodeId) -> Result<Vec<Edge>> {
        Ok(self
            .edges()?
            .into_iter()
            .filter(|e| e.parent_node_id.as_ref() == Some(node))
            .collect())
    }

    pub fn put_node(&mut self, node: &Node) -> Result<()> {
        let json = serde_json::to_string(node)?;
        self.write_raw(Table::Nodes, node.id.as_str(), Some(&json));
        Ok(())
    }

    pub fn delete_node(&mut self, id: &NodeId) {
        self.write_raw(Table::Nodes, id.as_str(), None);
    }

    pub fn put_edge(&mut self, edge: &Edge) -> Result<()> {
        let json = serde_json::to_string(edge)?;
        self.write_raw(Table::Edges, edge.id.as_str(), Some(&json));
        Ok(())
    }

    pub fn delete_edge(&mut self, id: &EdgeId) {
        self.write_raw(Table::Edges, id.as_str(), None);
    }

    /// An empty child list removes the parent's key; the root list is always kept.
    pub(crate) fn put_child_list(
        &mut self,
        parent: Option<&NodeId>,
        list: &[EdgeId],
    ) -> Result<()> {
        match parent {
            Some(parent) if list.is_empty() => {
                self.write_raw(Table::Children, parent.as_str(), None);
            }
            Some(parent) => {
                let json = serde_json::to_string(list)?;
                self.write_raw(Table::Children, parent.as_str(), Some(&json));
            }
            None => {
                let json = serde_json::to_string(list)?;
                self.write_raw(Table::Roots, ROOT_ORDER_KEY, Some(&json));
            }
        }
        Ok(())
    }

    pub(crate) fn write_raw(&mut self, table: Table, key: &str, value: Option<&str>) {
        let current = self.tables.raw(&self.txn, table, key);
        if current.as_deref() == value {
            return;
        }
        let map = self.tables.map(table);
        match value {
            Some(value) => {
                map.insert(&mut self.txn, key.to_string(), value.to_string());
            }
            None => {
                map.remove(&mut self.txn, key);
            }
        }
    }

    pub(crate) fn apply_update(&mut self, update: Update) -> Result<()> {
        self.txn
            .apply_update(update)
            .map_err(|e| OutlineError::Crdt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(table: Table, key: &str, before: Option<&str>, after: Option<&str>) -> RecordChange {
        RecordChange {
            table,
            key: key.into(),
            before: before.map(str::to_string),
            after: after.map(str::to_string),
        }
    }

    #[test]
    fn test_touched_edges_include_list_members() {
        let changes = ChangeSet {
            records: vec![
                record(Table::Edges, "e1", None, Some("{}")),
                record(Table::Children, "p", Some(r#"["e2"]"#), Some(r#"["e2","e3"]"#)),
                record(Table::Roots, ROOT_ORDER_KEY, Some(r#"["e4"]"#), None),
                record(Table::Nodes, "n1", Some("{}"), None),
            ],
        };
        let touched: Vec<_> = changes.touched_edges().into_iter().map(|e| e.to_string()).collect();
        assert_eq!(touched, vec!["e1", "e2", "e3", "e4"]);
        assert_eq!(changes.removed_nodes().len(), 1);
        assert_eq!(changes.touched_nodes().len(), 1);
    }

    #[test]
    fn test_undo_stack_is_bounded() {
        let mut stack = UndoStack::new(2);
        for key in ["a", "b", "c"] {
            stack.record(vec![record(Table::Nodes, key, None, Some("{}"))]);
        }
        assert_eq!(stack.pop_undo().unwrap()[0].key, "c");
        assert_eq!(stack.pop_undo().unwrap()[0].key, "b");
        assert!(stack.pop_undo().is_none());
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let mut stack = UndoStack::new(4);
        stack.push_redo(vec![record(Table::Nodes, "x", None, None)]);
        assert!(stack.can_redo());
        stack.record(vec![record(Table::Nodes, "y", None, Some("{}"))]);
        assert!(!stack.can_redo());
        assert!(stack.can_undo());
    }

    #[test]
    fn test_subscription_unsubscribe_is_idempotent() {
        let registry = Arc::new(Mutex::new(Subscribers::default()));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = Subscribers::register(
            &registry,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let event = ChangeEvent {
            origin: Origin::Local,
            update: Vec::new(),
            touched_nodes: BTreeSet::new(),
            touched_edges: BTreeSet::new(),
            version: 1,
        };
        Subscribers::notify(&registry, &event);
        sub.unsubscribe();
        sub.unsubscribe();
        Subscribers::notify(&registry, &event);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(Subscribers::len(&registry), 0);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let registry = Arc::new(Mutex::new(Subscribers::default()));
        {
            let _sub = Subscribers::register(&registry, Box::new(|_| {}));
            assert_eq!(Subscribers::len(&registry), 1);
        }
        assert_eq!(Subscribers::len(&registry), 0);
    }
}
