//! Contract between the sync manager and a concrete network transport.
//!
//! Adapters (WebSocket, WebRTC, in-process loopback) live outside this
//! crate. They push everything they observe into one event channel and are
//! driven through the async methods below.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(TransportStatus),
    /// Document delta from a remote replica.
    Update(Vec<u8>),
    /// Presence payload from one remote connection.
    Presence { connection_id: String, payload: Vec<u8> },
    /// A remote connection went away.
    PresenceRemoved { connection_id: String },
    Error(TransportError),
}

pub trait Transport: Send + Sync + 'static {
    /// Start a connection attempt. Resolves once the handshake finished or
    /// failed; the `Connected` status is reported through the event channel.
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Release every resource; the transport is not used afterwards.
    fn destroy(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    fn status(&self) -> TransportStatus;

    fn send_update(&self, update: &[u8]) -> Result<(), TransportError>;

    fn broadcast_presence(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Take the event receiver (can only be called once).
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}
