//! Local persistence contract and the in-memory backing.

use std::sync::Mutex;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::error::PersistenceError;

pub trait Persistence: Send + Sync + 'static {
    /// Open the store and return previously stored updates, oldest first.
    fn start(&self) -> BoxFuture<'_, Result<Vec<Vec<u8>>, PersistenceError>>;

    /// Append one document delta.
    fn store_update(&self, update: &[u8]) -> Result<(), PersistenceError>;

    /// Make buffered writes durable.
    fn flush(&self) -> BoxFuture<'_, Result<(), PersistenceError>> {
        async { Ok::<(), PersistenceError>(()) }.boxed()
    }

    fn destroy(&self) -> BoxFuture<'_, Result<(), PersistenceError>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    updates: Vec<Vec<u8>>,
    destroyed: bool,
}

/// Keeps every update in memory; the default when the host has no storage.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded store, as if a previous session had written `updates`.
    pub fn with_updates(updates: Vec<Vec<u8>>) -> Self {
        Self { state: Mutex::new(MemoryState { updates, destroyed: false }) }
    }

    pub fn updates(&self) -> Vec<Vec<u8>> {
        self.state.lock().map(|s| s.updates.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.updates.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.updates.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> Result<T, PersistenceError>,
    ) -> Result<T, PersistenceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| PersistenceError::Io(e.to_string()))?;
        if state.destroyed {
            return Err(PersistenceError::Destroyed);
        }
        f(&mut state)
    }
}

impl Persistence for MemoryPersistence {
    fn start(&self) -> BoxFuture<'_, Result<Vec<Vec<u8>>, PersistenceError>> {
        let result = self.with_state(|s| Ok(s.updates.clone()));
        async move { result }.boxed()
    }

    fn store_update(&self, update: &[u8]) -> Result<(), PersistenceError> {
        self.with_state(|s| {
            s.updates.push(update.to_vec());
            Ok(())
        })
    }

    fn destroy(&self) -> BoxFuture<'_, Result<(), PersistenceError>> {
        let result = self
            .state
            .lock()
            .map(|mut s| {
                s.destroyed = true;
                s.updates.clear();
            })
            .map_err(|e| PersistenceError::Io(e.to_string()));
        async move { result }.boxed()
    }
}
