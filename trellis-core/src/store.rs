//! `OutlineDoc`: the replicated entity store and its operations.
//!
//! ```text
//!  local op ─┐                        ┌─► undo stack (local only)
//!            ├─► transact(origin) ────┼─► ChangeEvent ─► subscribers
//!  remote ───┘        │               └─► reconcile (Origin::Reconciliation)
//!                     ▼
//!               yrs::Doc maps ──► snapshot() (cached until next change)
//! ```

use std::sync::{Arc, Mutex};

use log::{debug, info};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::config::{DocConfig, IdSource};
use crate::error::Result;
use crate::mirror::{self, MirrorOutcome, MirrorTarget};
use crate::model::{now_millis, Edge, EdgeId, Node, NodeContent, NodeId, NodeMetadata};
use crate::reconcile::{self, ReconcileScope};
use crate::snapshot::OutlineSnapshot;
use crate::structure::{self, RemovalReport, StructuralOutcome};
use crate::transaction::{
    ChangeEvent, ChangeSet, Origin, RecordChange, Subscribers, Subscription, Tables, Transaction,
    UndoStack,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recording {
    Normal,
    Undo,
    Redo,
}

/// Main entry point for all document operations.
pub struct OutlineDoc {
    doc: Doc,
    tables: Tables,
    config: DocConfig,

    // Filled by the map observers at commit, drained after each transaction
    changes: Arc<Mutex<Vec<RecordChange>>>,
    _observers: Vec<yrs::Subscription>,

    subscribers: Arc<Mutex<Subscribers>>,
    undo: UndoStack,

    snapshot: Option<Arc<OutlineSnapshot>>,
    version: u64,
    next_id: u64,
    full_rebuild_pending: bool,
}

impl OutlineDoc {
    pub fn new(config: DocConfig) -> Self {
        let doc = Doc::new();
        let tables = Tables::new(&doc);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let observers = tables.observe(&changes);

        Self {
            doc,
            tables,
            undo: UndoStack::new(config.undo_depth),
            config,
            changes,
            _observers: observers,
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            snapshot: None,
            version: 0,
            next_id: 0,
            full_rebuild_pending: false,
        }
    }

    /// Build a document from a full-state update, rebuilding every index.
    pub fn load(update: &[u8], config: DocConfig) -> Result<Self> {
        let mut doc = Self::new(config);
        doc.apply_update(update, Origin::Restore)?;
        Ok(doc)
    }

    pub fn config(&self) -> &DocConfig {
        &self.config
    }

    /// Bumped by every transaction that changed at least one record.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.tables.is_empty(&txn)
    }

    // ==================== Transactions ====================

    /// Run `f` as one atomic transaction tagged with `origin`.
    ///
    /// On commit the snapshot cache is dropped, subscribers receive a
    /// `ChangeEvent`, and non-reconciliation transactions are followed by a
    /// reconciliation pass.
    pub fn transact<T, F>(&mut self, origin: Origin, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        self.run(origin, Recording::Normal, f)
    }

    fn run<T, F>(&mut self, origin: Origin, recording: Recording, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        self.drain_changes();
        let before = self.doc.transact().state_vector();
        let result = {
            let mut tx = Transaction::new(self.doc.transact_mut(), &self.tables, origin);
            f(&mut tx)
        };

        let records = self.drain_changes();
        let committed = if records.is_empty() {
            Ok(())
        } else {
            let update = self.doc.transact().encode_state_as_update_v1(&before);
            self.commit(origin, recording, ChangeSet { records }, update)
        };

        let value = result?;
        committed?;
        Ok(value)
    }

    fn drain_changes(&self) -> Vec<RecordChange> {
        match self.changes.lock() {
            Ok(mut log) => std::mem::take(&mut *log),
            Err(_) => Vec::new(),
        }
    }

    fn commit(
        &mut self,
        origin: Origin,
        recording: Recording,
        changes: ChangeSet,
        update: Vec<u8>,
    ) -> Result<()> {
        self.version += 1;
        self.snapshot = None;

        match recording {
            Recording::Normal if origin == Origin::Local => {
                self.undo.record(changes.records.clone())
            }
            Recording::Normal => {}
            Recording::Undo => self.undo.push_redo(changes.records.clone()),
            Recording::Redo => self.undo.push_undo(changes.records.clone()),
        }

        let event = ChangeEvent {
            origin,
            update,
            touched_nodes: changes.touched_nodes(),
            touched_edges: changes.touched_edges(),
            version: self.version,
        };
        Subscribers::notify(&self.subscribers, &event);

        if origin == Origin::Reconciliation {
            return Ok(());
        }
        let scope = self.scope_for(&changes)?;
        self.reconcile(scope)?;
        Ok(())
    }

    /// Touched edges plus every edge still pointing at a removed node.
    fn scope_for(&mut self, changes: &ChangeSet) -> Result<ReconcileScope> {
        if std::mem::take(&mut self.full_rebuild_pending) {
            return Ok(ReconcileScope::Full);
        }

        let mut touched = changes.touched_edges();
        let removed = changes.removed_nodes();
        if !removed.is_empty() {
            let txn = self.doc.transact();
            for edge in self.tables.edges(&txn)? {
                let parent_gone = edge.parent_node_id.as_ref().is_some_and(|p| removed.contains(p));
                if parent_gone || removed.contains(&edge.child_node_id) {
                    touched.insert(edge.id);
                }
            }
        }

        if touched.len() > self.config.full_rebuild_threshold {
            debug!("{} touched edges, falling back to a full rebuild", touched.len());
            return Ok(ReconcileScope::Full);
        }
        Ok(ReconcileScope::Edges(touched))
    }

    /// Run a reconciliation pass now. Returns the number of repairs.
    pub fn reconcile(&mut self, scope: ReconcileScope) -> Result<usize> {
        self.run(Origin::Reconciliation, Recording::Normal, |tx| reconcile::reconcile(tx, &scope))
    }

    /// Register a change callback. Keep the returned handle alive.
    pub fn subscribe<F>(&mut self, callback: F) -> Subscription
    where
        F: FnMut(&ChangeEvent) + Send + 'static,
    {
        Subscribers::register(&self.subscribers, Box::new(callback))
    }

    pub fn subscriber_count(&self) -> usize {
        Subscribers::len(&self.subscribers)
    }

    // ==================== Replication ====================

    /// Apply a delta from another replica.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<()> {
        self.apply_update(update, Origin::Remote)
    }

    /// Apply a yrs v1 update under `origin`. An update landing in an empty
    /// store triggers a full rebuild.
    pub fn apply_update(&mut self, update: &[u8], origin: Origin) -> Result<()> {
        let decoded = Update::decode_v1(update)?;
        if self.is_empty() {
            self.full_rebuild_pending = true;
        }
        let result = self.run(origin, Recording::Normal, |tx| tx.apply_update(decoded));
        self.full_rebuild_pending = false;
        result
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the holder of `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    // ==================== Reads ====================

    /// Cached immutable view; rebuilt lazily after a committed change.
    pub fn snapshot(&mut self) -> Result<Arc<OutlineSnapshot>> {
        if let Some(snapshot) = &self.snapshot {
            return Ok(Arc::clone(snapshot));
        }
        let snapshot = {
            let txn = self.doc.transact();
            Arc::new(OutlineSnapshot::read(&self.tables, &txn, self.version)?)
        };
        self.snapshot = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn node(&self, id: &NodeId) -> Result<Option<Node>> {
        let txn = self.doc.transact();
        self.tables.node(&txn, id)
    }

    pub fn edge(&self, id: &EdgeId) -> Result<Option<Edge>> {
        let txn = self.doc.transact();
        self.tables.edge(&txn, id)
    }

    // ==================== Node operations ====================

    /// Create a standalone node; place it with `add_edge`.
    pub fn create_node(&mut self, content: NodeContent) -> Result<NodeId> {
        let id = self.mint_node_id();
        let node = Node::new(id.clone(), content, now_millis());
        self.transact(Origin::Local, |tx| tx.put_node(&node))?;
        Ok(id)
    }

    pub fn update_node_content(&mut self, id: &NodeId, content: NodeContent) -> Result<()> {
        self.transact(Origin::Local, |tx| {
            let mut node = tx.require_node(id)?;
            node.content = content;
            node.updated_at = now_millis();
            tx.put_node(&node)
        })
    }

    pub fn set_node_metadata(&mut self, id: &NodeId, metadata: NodeMetadata) -> Result<()> {
        self.transact(Origin::Local, |tx| {
            let mut node = tx.require_node(id)?;
            node.metadata = metadata.normalized();
            node.updated_at = now_millis();
            tx.put_node(&node)
        })
    }

    // ==================== Edge operations ====================

    /// Place `child` under `parent` (`None` = root level) at `index`
    /// (clamped; `None` appends). A node that is already placed gets a
    /// mirror edge.
    pub fn add_edge(
        &mut self,
        parent: Option<&NodeId>,
        child: &NodeId,
        index: Option<usize>,
    ) -> Result<StructuralOutcome<EdgeId>> {
        let edge_id = self.mint_edge_id();
        self.transact(Origin::Local, |tx| {
            tx.require_node(child)?;
            if let Some(parent) = parent {
                tx.require_node(parent)?;
                if structure::creates_cycle(tx, parent, child)? {
                    return Ok(StructuralOutcome::CycleRejected);
                }
            }
            let edge = structure::new_placement(tx, edge_id, parent.cloned(), child)?;
            Ok(StructuralOutcome::Applied(structure::place_edge(tx, edge, index)?))
        })
    }

    /// Reparent an edge. `index` is counted after the edge has left its old
    /// list, so moving within one parent works as expected.
    pub fn move_edge(
        &mut self,
        edge_id: &EdgeId,
        new_parent: Option<&NodeId>,
        index: Option<usize>,
    ) -> Result<StructuralOutcome> {
        self.transact(Origin::Local, |tx| {
            let mut edge = tx.require_edge(edge_id)?;
            if let Some(parent) = new_parent {
                tx.require_node(parent)?;
                if structure::creates_cycle(tx, parent, &edge.child_node_id)? {
                    return Ok(StructuralOutcome::CycleRejected);
                }
            }
            structure::unlink_edge(tx, &edge)?;
            edge.parent_node_id = new_parent.cloned();
            structure::place_edge(tx, edge, index)?;
            Ok(StructuralOutcome::Applied(()))
        })
    }

    /// Collapse state is per placement; mirrors keep their own flag.
    pub fn set_collapsed(&mut self, edge_id: &EdgeId, collapsed: bool) -> Result<()> {
        self.transact(Origin::Local, |tx| {
            let mut edge = tx.require_edge(edge_id)?;
            edge.collapsed = collapsed;
            tx.put_edge(&edge)
        })
    }

    /// Remove a placement, cascading through nodes that lose their last one.
    pub fn remove_edge(&mut self, edge_id: &EdgeId) -> Result<RemovalReport> {
        self.transact(Origin::Local, |tx| {
            tx.require_edge(edge_id)?;
            let mut report = RemovalReport::default();
            structure::remove_edge_cascade(tx, edge_id, &mut report)?;
            Ok(report)
        })
    }

    pub fn create_mirror_edge(
        &mut self,
        target: &MirrorTarget,
        source: &NodeId,
    ) -> Result<MirrorOutcome> {
        let edge_id = self.mint_edge_id();
        let outcome = self.transact(Origin::Local, |tx| {
            mirror::create_mirror_edge(tx, target, source, edge_id)
        })?;
        if let MirrorOutcome::Created { edge_id, mode } = &outcome {
            info!("Placed node {} as edge {} ({:?})", source, edge_id, mode);
        }
        Ok(outcome)
    }

    // ==================== Undo ====================

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    /// Restore the records touched by the last local transaction.
    /// Returns false when there is nothing to undo.
    pub fn undo(&mut self) -> Result<bool> {
        let Some(records) = self.undo.pop_undo() else {
            return Ok(false);
        };
        self.replay(records, Recording::Undo)?;
        Ok(true)
    }

    pub fn redo(&mut self) -> Result<bool> {
        let Some(records) = self.undo.pop_redo() else {
            return Ok(false);
        };
        self.replay(records, Recording::Redo)?;
        Ok(true)
    }

    fn replay(&mut self, records: Vec<RecordChange>, recording: Recording) -> Result<()> {
        // Both stacks hold the records of the transaction to invert: an undo
        // pushes what it wrote onto the redo stack, so redo restores `before` too.
        self.run(Origin::Local, recording, |tx| {
            for record in records.iter().rev() {
                tx.write_raw(record.table, &record.key, record.before.as_deref());
            }
            Ok(())
        })
    }

    // ==================== Ids ====================

    fn mint_node_id(&mut self) -> NodeId {
        match &self.config.id_source {
            IdSource::Random => NodeId::generate(),
            IdSource::Sequential { prefix } => {
                self.next_id += 1;
                NodeId::new(format!("{prefix}n{}", self.next_id))
            }
        }
    }

    fn mint_edge_id(&mut self) -> EdgeId {
        match &self.config.id_source {
            IdSource::Random => EdgeId::generate(),
            IdSource::Sequential { prefix } => {
                self.next_id += 1;
                EdgeId::new(format!("{prefix}e{}", self.next_id))
            }
        }
    }
}

impl Default for OutlineDoc {
    fn default() -> Self {
        Self::new(DocConfig::default())
    }
}

impl std::fmt::Debug for OutlineDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutlineDoc")
            .field("version", &self.version)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
