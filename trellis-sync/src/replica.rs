//! The document seam the sync manager drives.

use std::sync::{Arc, Mutex};

use trellis_core::{Origin, OutlineDoc, OutlineError, Subscription};

/// Receives the origin and binary delta of every committed transaction.
pub type UpdateSink = Box<dyn FnMut(Origin, &[u8]) + Send>;

pub trait ReplicaDocument: Send + 'static {
    /// Full state as one update, pushed to the transport after connecting.
    fn encode_state(&self) -> Vec<u8>;

    fn apply_update(&mut self, update: &[u8], origin: Origin) -> Result<(), OutlineError>;

    /// Forward every committed delta to `sink` until the handle is dropped.
    fn watch_updates(&mut self, sink: UpdateSink) -> Subscription;
}

/// A document shared between the editor and the sync driver. The lock is
/// never held across an `.await`.
pub type SharedReplica = Arc<Mutex<dyn ReplicaDocument>>;

impl ReplicaDocument for OutlineDoc {
    fn encode_state(&self) -> Vec<u8> {
        OutlineDoc::encode_state(self)
    }

    fn apply_update(&mut self, update: &[u8], origin: Origin) -> Result<(), OutlineError> {
        OutlineDoc::apply_update(self, update, origin)
    }

    fn watch_updates(&mut self, mut sink: UpdateSink) -> Subscription {
        self.subscribe(move |event| sink(event.origin, &event.update))
    }
}
