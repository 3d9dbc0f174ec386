//! Connection state machine for one replica.
//!
//! A single driver task owns every piece of mutable state: status, retry
//! counter, the pending reconnect deadline, the presence room. The public
//! [`SyncManager`] handle only sends commands to it and reads the watch /
//! broadcast channels it publishes on.
//!
//! ```text
//!             connect()              transport Connected
//!  Offline ─────────────► Connecting ───────────────────► Connected
//!     ▲                       ▲                              │
//!     │ fatal error /         │ timer fires                  │ recoverable error /
//!     │ network offline /     │                              │ unexpected disconnect
//!     │ disconnect()          │                              ▼
//!     └──────────────────── Recovering ◄────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use trellis_core::{EdgeId, Origin, OutlineError, Subscription};

use crate::backoff::ReconnectPolicy;
use crate::error::{PersistenceStartError, SyncError, TransportError};
use crate::persistence::Persistence;
use crate::presence::{PeerIdentity, PresenceRoom, PresenceSnapshot, SelectionRange};
use crate::replica::SharedReplica;
use crate::transport::{Transport, TransportEvent, TransportStatus};

/// Sync manager configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub reconnect: ReconnectPolicy,
    /// Capacity of the `events()` broadcast channel; slow receivers lag.
    pub event_capacity: usize,
    pub presence_idle_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            event_capacity: 256,
            presence_idle_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Short deterministic delays for tests.
    pub fn for_testing() -> Self {
        Self {
            reconnect: ReconnectPolicy::for_testing(),
            event_capacity: 64,
            presence_idle_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Offline,
    Connecting,
    Connected,
    /// Lost the connection; a reconnect is scheduled or in flight.
    Recovering,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged { from: SyncStatus, to: SyncStatus },
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectAttempt { attempt: u32 },
    /// A remote delta was merged into the document.
    RemoteUpdateApplied { bytes: usize },
    PresenceChanged,
    TransportError(TransportError),
    /// A remote delta could not be applied.
    DocumentError(String),
}

/// The teardown step that failed during [`SyncManager::destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    StopDriver,
    DisconnectTransport,
    DestroyTransport,
    FlushPersistence,
    DestroyPersistence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub step: TeardownStep,
    pub message: String,
}

impl TeardownFailure {
    fn new(step: TeardownStep, message: impl Into<String>) -> Self {
        Self { step, message: message.into() }
    }
}

enum Command {
    Connect { started: oneshot::Sender<()> },
    Disconnect { done: oneshot::Sender<()> },
    NetworkChanged { online: bool },
    SetPresence {
        identity: PeerIdentity,
        focused_edge_id: Option<EdgeId>,
        selection: Option<SelectionRange>,
    },
    Shutdown { done: oneshot::Sender<()> },
}

/// A committed document delta observed through the replica subscription.
struct LocalUpdate {
    origin: Origin,
    bytes: Vec<u8>,
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
    presence: watch::Receiver<PresenceSnapshot>,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn Persistence>,
    document: SharedReplica,
    ready: OnceCell<Result<(), PersistenceStartError>>,
    destroyed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap-to-clone handle on a running sync driver.
#[derive(Clone)]
pub struct SyncManager {
    shared: Arc<Shared>,
}

impl SyncManager {
    /// Spawn the driver task. Must be called inside a tokio runtime.
    ///
    /// Nothing connects until [`connect`](Self::connect) is called.
    pub fn start(
        config: SyncConfig,
        document: SharedReplica,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self, SyncError> {
        let transport_events = transport.take_events().ok_or(SyncError::EventsTaken)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (attempt_tx, attempt_rx) = mpsc::unbounded_channel();
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SyncStatus::Offline);
        let (presence_tx, presence_rx) = watch::channel(PresenceSnapshot::default());
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let subscription = {
            let mut doc = document.lock().map_err(|_| SyncError::DocumentPoisoned)?;
            doc.watch_updates(Box::new(move |origin, bytes| {
                let _ = local_tx.send(LocalUpdate { origin, bytes: bytes.to_vec() });
            }))
        };

        let idle_timeout = Duration::from_millis(config.presence_idle_timeout_ms);
        let mut cleanup = interval((idle_timeout / 2).max(Duration::from_millis(10)));
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let driver = Driver {
            policy: config.reconnect,
            commands: command_rx,
            attempt_tx,
            attempt_results: attempt_rx,
            transport_events,
            transport_open: true,
            local_updates: local_rx,
            local_open: true,
            _subscription: subscription,
            status: status_tx,
            events: events_tx.clone(),
            presence_tx,
            presence: PresenceRoom::new(idle_timeout),
            cleanup,
            transport: Arc::clone(&transport),
            persistence: Arc::clone(&persistence),
            document: Arc::clone(&document),
            rng: StdRng::from_entropy(),
            attempts: 0,
            reconnect_at: None,
            attempt_in_flight: false,
            wants_connection: false,
            halted: false,
            network_online: true,
        };
        let handle = tokio::spawn(driver.run());

        Ok(Self {
            shared: Arc::new(Shared {
                commands: command_tx,
                status: status_rx,
                events: events_tx,
                presence: presence_rx,
                transport,
                persistence,
                document,
                ready: OnceCell::new(),
                destroyed: AtomicBool::new(false),
                driver: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Start persistence once and replay what it stored into the document.
    ///
    /// Every caller awaits the same attempt and sees the same outcome.
    pub async fn ready(&self) -> Result<(), PersistenceStartError> {
        let shared = Arc::clone(&self.shared);
        self.shared
            .ready
            .get_or_init(|| async move {
                let updates = shared.persistence.start().await.map_err(|e| {
                    error!("Persistence failed to start: {}", e);
                    PersistenceStartError::Start(e)
                })?;

                let mut doc = shared
                    .document
                    .lock()
                    .map_err(|_| PersistenceStartError::Replay("document lock poisoned".into()))?;
                for update in &updates {
                    doc.apply_update(update, Origin::Restore)
                        .map_err(|e| PersistenceStartError::Replay(e.to_string()))?;
                }
                info!("Persistence ready ({} stored updates replayed)", updates.len());
                Ok(())
            })
            .await
            .clone()
    }

    /// Wait for persistence, then start a connection attempt.
    ///
    /// Resolves once the attempt has been started, not when it succeeds;
    /// watch [`status`](Self::status) for `Connected`. Calling it while an
    /// attempt is in flight or already connected is a no-op.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.ensure_alive()?;
        self.ready().await?;
        self.ensure_alive()?;

        let (started, ack) = oneshot::channel();
        self.send(Command::Connect { started })?;
        ack.await.map_err(|_| SyncError::DriverStopped)
    }

    /// Close the connection and suppress reconnects until the next `connect()`.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.ensure_alive()?;
        let (done, ack) = oneshot::channel();
        self.send(Command::Disconnect { done })?;
        ack.await.map_err(|_| SyncError::DriverStopped)
    }

    /// Report a host network change.
    pub fn set_network_online(&self, online: bool) -> Result<(), SyncError> {
        self.ensure_alive()?;
        self.send(Command::NetworkChanged { online })
    }

    /// Replace local presence; broadcast immediately when connected.
    pub fn set_local_presence(
        &self,
        identity: PeerIdentity,
        focused_edge_id: Option<EdgeId>,
        selection: Option<SelectionRange>,
    ) -> Result<(), SyncError> {
        self.ensure_alive()?;
        self.send(Command::SetPresence { identity, focused_edge_id, selection })
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.clone()
    }

    pub fn current_status(&self) -> SyncStatus {
        *self.shared.status.borrow()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub fn presence(&self) -> watch::Receiver<PresenceSnapshot> {
        self.shared.presence.clone()
    }

    pub fn document(&self) -> SharedReplica {
        Arc::clone(&self.shared.document)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Wait until the status equals `target`. Returns `false` on timeout.
    pub async fn wait_for_status(&self, target: SyncStatus, timeout: Duration) -> bool {
        let mut status = self.status();
        let reached = match tokio::time::timeout(timeout, status.wait_for(|s| *s == target)).await {
            Ok(result) => result.is_ok(),
            Err(_) => false,
        };
        reached
    }

    /// Tear everything down. Idempotent; never fails.
    ///
    /// Every step runs even when an earlier one failed. Failures are logged
    /// and returned; a second call returns an empty list.
    pub async fn destroy(&self) -> Vec<TeardownFailure> {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let mut failures = Vec::new();

        let (done, ack) = oneshot::channel();
        let stopped =
            self.shared.commands.send(Command::Shutdown { done }).is_ok() && ack.await.is_ok();
        if !stopped {
            failures.push(TeardownFailure::new(TeardownStep::StopDriver, "driver already stopped"));
        }
        let handle = self.shared.driver.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                failures.push(TeardownFailure::new(TeardownStep::StopDriver, e.to_string()));
            }
        }

        if let Err(e) = self.shared.transport.disconnect().await {
            failures.push(TeardownFailure::new(TeardownStep::DisconnectTransport, e.to_string()));
        }
        if let Err(e) = self.shared.transport.destroy().await {
            failures.push(TeardownFailure::new(TeardownStep::DestroyTransport, e.to_string()));
        }
        if let Err(e) = self.shared.persistence.flush().await {
            failures.push(TeardownFailure::new(TeardownStep::FlushPersistence, e.to_string()));
        }
        if let Err(e) = self.shared.persistence.destroy().await {
            failures.push(TeardownFailure::new(TeardownStep::DestroyPersistence, e.to_string()));
        }

        for failure in &failures {
            warn!("Teardown step {:?} failed: {}", failure.step, failure.message);
        }
        info!("Sync manager destroyed");
        failures
    }

    fn ensure_alive(&self) -> Result<(), SyncError> {
        if self.is_destroyed() {
            Err(SyncError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.shared.commands.send(command).map_err(|_| SyncError::DriverStopped)
    }
}

struct Driver {
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    attempt_tx: mpsc::UnboundedSender<Result<(), TransportError>>,
    attempt_results: mpsc::UnboundedReceiver<Result<(), TransportError>>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    transport_open: bool,
    local_updates: mpsc::UnboundedReceiver<LocalUpdate>,
    local_open: bool,
    _subscription: Subscription,
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
    presence_tx: watch::Sender<PresenceSnapshot>,
    presence: PresenceRoom,
    /// Prunes silent peers even when no presence traffic arrives.
    cleanup: Interval,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn Persistence>,
    document: SharedReplica,
    rng: StdRng,
    attempts: u32,
    reconnect_at: Option<Instant>,
    attempt_in_flight: bool,
    /// Cleared by `disconnect()`; reconnects only happen while set.
    wants_connection: bool,
    /// Set by a non-recoverable error.
    halted: bool,
    network_online: bool,
}

impl Driver {
    async fn run(mut self) {
        debug!("Sync driver started");
        loop {
            let deadline = self.reconnect_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(result) = self.attempt_results.recv() => self.attempt_finished(result),
                event = self.transport_events.recv(), if self.transport_open => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        warn!("Transport event stream closed");
                        self.transport_open = false;
                    }
                },
                update = self.local_updates.recv(), if self.local_open => match update {
                    Some(update) => self.handle_local_update(update),
                    None => self.local_open = false,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_reconnect();
                }
                _ = self.cleanup.tick() => self.prune_idle_peers(),
            }
        }
        debug!("Sync driver stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { started } => {
                self.wants_connection = true;
                self.halted = false;
                if self.network_online {
                    self.start_attempt();
                } else {
                    debug!("Network offline; connecting once it returns");
                }
                let _ = started.send(());
            }
            Command::Disconnect { done } => {
                self.wants_connection = false;
                self.reconnect_at = None;
                if let Err(e) = self.transport.disconnect().await {
                    warn!("Transport disconnect failed: {}", e);
                    self.emit(SyncEvent::TransportError(e));
                }
                self.presence.clear_remote();
                self.publish_presence();
                self.set_status(SyncStatus::Offline);
                let _ = done.send(());
            }
            Command::NetworkChanged { online } => self.network_changed(online),
            Command::SetPresence { identity, focused_edge_id, selection } => {
                self.presence.set_local(identity, focused_edge_id, selection);
                self.publish_presence();
                if self.current() == SyncStatus::Connected {
                    self.broadcast_local_presence();
                }
            }
            // Handled in `run`.
            Command::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    fn network_changed(&mut self, online: bool) {
        if online == self.network_online {
            return;
        }
        self.network_online = online;
        if online {
            info!("Network online");
            self.attempts = 0;
            self.halted = false;
            if self.wants_connection {
                self.start_attempt();
            }
        } else {
            info!("Network offline; reconnects suspended");
            self.reconnect_at = None;
            self.set_status(SyncStatus::Offline);
        }
    }

    fn start_attempt(&mut self) {
        if self.attempt_in_flight || self.current() == SyncStatus::Connected {
            return;
        }
        self.reconnect_at = None;
        self.attempt_in_flight = true;
        self.set_status(SyncStatus::Connecting);

        let transport = Arc::clone(&self.transport);
        let results = self.attempt_tx.clone();
        tokio::spawn(async move {
            let result = transport.connect().await;
            let _ = results.send(result);
        });
    }

    fn attempt_finished(&mut self, result: Result<(), TransportError>) {
        self.attempt_in_flight = false;
        if !self.wants_connection || !self.network_online || self.halted {
            debug!("Ignoring connection attempt result; no longer connecting");
            if let Err(e) = result {
                self.emit(SyncEvent::TransportError(e));
            }
            return;
        }
        match result {
            Ok(()) => {
                if self.transport.status() == TransportStatus::Connected {
                    self.on_connected();
                }
            }
            Err(e) => self.handle_error(e),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(TransportStatus::Connected) => {
                if self.wants_connection && self.network_online && !self.halted {
                    self.on_connected();
                } else {
                    debug!("Ignoring transport connect while disconnected");
                }
            }
            TransportEvent::Status(TransportStatus::Connecting) => {
                if self.wants_connection && self.current() != SyncStatus::Connected {
                    self.set_status(SyncStatus::Connecting);
                }
            }
            TransportEvent::Status(TransportStatus::Disconnected) => self.on_disconnected(),
            TransportEvent::Update(bytes) => self.apply_remote(&bytes),
            TransportEvent::Presence { connection_id, payload } => {
                match self.presence.handle_remote(&connection_id, &payload) {
                    Ok(true) => self.publish_presence(),
                    Ok(false) => {}
                    Err(e) => warn!("Bad presence payload from {}: {}", connection_id, e),
                }
            }
            TransportEvent::PresenceRemoved { connection_id } => {
                if self.presence.remove(&connection_id) {
                    self.publish_presence();
                }
            }
            TransportEvent::Error(e) => self.handle_error(e),
        }
    }

    fn on_connected(&mut self) {
        self.attempts = 0;
        self.reconnect_at = None;
        if self.current() == SyncStatus::Connected {
            return;
        }
        self.set_status(SyncStatus::Connected);

        let state = match self.document.lock() {
            Ok(doc) => doc.encode_state(),
            Err(_) => {
                error!("Document lock poisoned; full state not sent");
                return;
            }
        };
        if let Err(e) = self.transport.send_update(&state) {
            self.handle_error(e);
            return;
        }
        self.broadcast_local_presence();
    }

    fn on_disconnected(&mut self) {
        if self.presence.peer_count() > 0 {
            self.presence.clear_remote();
            self.publish_presence();
        }
        if !self.wants_connection || !self.network_online || self.halted {
            self.set_status(SyncStatus::Offline);
            return;
        }
        warn!("Transport disconnected unexpectedly");
        self.set_status(SyncStatus::Recovering);
        self.schedule_reconnect();
    }

    fn handle_error(&mut self, error: TransportError) {
        warn!("Transport error: {}", error);
        self.emit(SyncEvent::TransportError(error.clone()));
        if !self.wants_connection {
            return;
        }
        if !self.network_online {
            self.set_status(SyncStatus::Offline);
        } else if error.recoverable {
            self.set_status(SyncStatus::Recovering);
            self.schedule_reconnect();
        } else {
            error!("Non-recoverable transport error; retries stopped");
            self.halted = true;
            self.reconnect_at = None;
            self.set_status(SyncStatus::Offline);
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some()
            || self.attempt_in_flight
            || self.halted
            || !self.network_online
            || !self.wants_connection
        {
            return;
        }
        self.attempts = self.attempts.saturating_add(1);
        let delay = self.policy.delay(self.attempts, &mut self.rng);
        self.reconnect_at = Some(Instant::now() + delay);
        info!("Reconnecting in {:?} (attempt {})", delay, self.attempts);
        self.emit(SyncEvent::ReconnectScheduled { attempt: self.attempts, delay });
    }

    fn fire_reconnect(&mut self) {
        self.reconnect_at = None;
        if !self.wants_connection || !self.network_online || self.halted {
            return;
        }
        self.emit(SyncEvent::ReconnectAttempt { attempt: self.attempts });
        self.start_attempt();
    }

    fn handle_local_update(&mut self, update: LocalUpdate) {
        if update.origin == Origin::Restore {
            return;
        }
        if let Err(e) = self.persistence.store_update(&update.bytes) {
            warn!("Failed to persist update: {}", e);
        }
        if update.origin == Origin::Remote || self.current() != SyncStatus::Connected {
            return;
        }
        if let Err(e) = self.transport.send_update(&update.bytes) {
            self.handle_error(e);
        }
    }

    fn apply_remote(&mut self, bytes: &[u8]) {
        let result = match self.document.lock() {
            Ok(mut doc) => doc.apply_update(bytes, Origin::Remote),
            Err(_) => Err(OutlineError::Crdt("document lock poisoned".into())),
        };
        match result {
            Ok(()) => self.emit(SyncEvent::RemoteUpdateApplied { bytes: bytes.len() }),
            Err(e) => {
                error!("Failed to apply remote update: {}", e);
                self.emit(SyncEvent::DocumentError(e.to_string()));
            }
        }
    }

    fn prune_idle_peers(&mut self) {
        let idle = self.presence.cleanup_idle_peers();
        if !idle.is_empty() {
            debug!("Dropped {} idle presence peers", idle.len());
            self.publish_presence();
        }
    }

    fn broadcast_local_presence(&mut self) {
        match self.presence.encode_local() {
            Ok(Some(payload)) => {
                if let Err(e) = self.transport.broadcast_presence(&payload) {
                    self.handle_error(e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Local presence not broadcast: {}", e),
        }
    }

    fn shutdown(&mut self) {
        self.wants_connection = false;
        self.reconnect_at = None;
        self.presence.clear();
        self.publish_presence();
        self.set_status(SyncStatus::Offline);
    }

    fn current(&self) -> SyncStatus {
        *self.status.borrow()
    }

    fn set_status(&mut self, to: SyncStatus) {
        let from = self.current();
        if from == to {
            return;
        }
        self.status.send_replace(to);
        info!("Sync status {:?} -> {:?}", from, to);
        self.emit(SyncEvent::StatusChanged { from, to });
    }

    fn publish_presence(&mut self) {
        self.presence_tx.send_replace(self.presence.snapshot());
        self.emit(SyncEvent::PresenceChanged);
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.presence_idle_timeout_ms, 30_000);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_config_partial_json() {
        let config: SyncConfig = serde_json::from_str(r#"{"event_capacity": 8}"#).unwrap();
        assert_eq!(config.event_capacity, 8);
        assert_eq!(config.presence_idle_timeout_ms, 30_000);
    }

    #[test]
    fn test_teardown_failure_message() {
        let failure = TeardownFailure::new(TeardownStep::FlushPersistence, "disk full");
        assert_eq!(failure.step, TeardownStep::FlushPersistence);
        assert_eq!(failure.message, "disk full");
    }
}
