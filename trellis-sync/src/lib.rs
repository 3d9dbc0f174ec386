//! # trellis-sync — Replica connection management for trellis outlines
//!
//! Keeps one [`trellis_core::OutlineDoc`] replica connected to its peers:
//! connection state machine, exponential reconnect backoff, network
//! awareness, presence merging and orderly teardown.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  commands   ┌──────────────────────┐  connect/send  ┌───────────┐
//! │ SyncManager  │ ──────────► │ driver task          │ ─────────────► │ Transport │
//! │ (handle)     │ ◄────────── │  status, backoff,    │ ◄───────────── │ (adapter) │
//! └──────────────┘  watch /    │  presence room       │  events        └───────────┘
//!                   broadcast  └───┬──────────────┬───┘
//!                                  │ deltas       │ store_update
//!                                  ▼              ▼
//!                         ┌──────────────┐  ┌─────────────┐
//!                         │ OutlineDoc   │  │ Persistence │
//!                         │ (replica)    │  │ (adapter)   │
//!                         └──────────────┘  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`manager`] — `SyncManager` handle and its driver task
//! - [`backoff`] — reconnect delay policy
//! - [`presence`] — peer presence payloads and the merged room
//! - [`transport`] / [`persistence`] — adapter contracts
//! - [`replica`] — the document seam, implemented for `OutlineDoc`

pub mod backoff;
pub mod error;
pub mod manager;
pub mod persistence;
pub mod presence;
pub mod replica;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use error::{PersistenceError, PersistenceStartError, PresenceError, SyncError, TransportError};
pub use manager::{SyncConfig, SyncEvent, SyncManager, SyncStatus, TeardownFailure, TeardownStep};
pub use persistence::{MemoryPersistence, Persistence};
pub use presence::{
    PeerColor, PeerIdentity, PresenceRoom, PresenceSnapshot, PresenceState, RemotePeer,
    SelectionRange,
};
pub use replica::{ReplicaDocument, SharedReplica, UpdateSink};
pub use transport::{Transport, TransportEvent, TransportStatus};
