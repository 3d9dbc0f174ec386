use thiserror::Error;

/// Failure reported by a transport adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("transport error {code}: {message}")]
pub struct TransportError {
    pub code: String,
    pub message: String,
    /// Retrying may succeed (network blip, server restart).
    pub recoverable: bool,
}

impl TransportError {
    pub fn recoverable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), recoverable: true }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), recoverable: false }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Storage failure: {0}")]
    Io(String),
    #[error("Persistence already destroyed")]
    Destroyed,
}

/// Readiness failure, shared with every caller waiting on `ready()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceStartError {
    #[error("Persistence failed to start: {0}")]
    Start(#[from] PersistenceError),
    #[error("Persisted state could not be applied: {0}")]
    Replay(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("Presence encode failed: {0}")]
    Encode(String),
    #[error("Presence decode failed: {0}")]
    Decode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Persistence(#[from] PersistenceStartError),
    #[error("Transport event stream was already taken")]
    EventsTaken,
    #[error("Sync manager has been destroyed")]
    Destroyed,
    #[error("Sync driver stopped")]
    DriverStopped,
    #[error("Document lock poisoned")]
    DocumentPoisoned,
}
