//! Presence: who is looking at which part of the outline.
//!
//! ## Architecture
//!
//! ```text
//! Local focus / selection change
//!       │
//!       ▼
//! PresenceRoom::set_local()   (clock += 1)
//!       │
//!       ▼   bincode payload, broadcast while connected
//! Remote PresenceRoom::handle_remote(connection_id, bytes)
//!       │   (stale clocks dropped)
//!       ▼
//! PresenceSnapshot { peers, by_edge }  ──► UI avatars per row
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use trellis_core::EdgeId;

use crate::error::PresenceError;

// ─── Core types ─────────────────────────────────────────────────────────────

/// RGB color for avatars and selection highlights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PeerColor {
    /// Stable, vivid color derived from any string id.
    pub fn from_seed(seed: &str) -> Self {
        // FNV-1a keeps the hue stable across processes and platforms
        let hash = seed
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
        let hue = (hash % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self {
            r: (r * 255.0).round() as u8,
            g: (g * 255.0).round() as u8,
            b: (b * 255.0).round() as u8,
        }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Default for PeerColor {
    fn default() -> Self {
        Self { r: 66, g: 133, b: 245 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (hue_to_rgb(p, q, h + 1.0 / 3.0), hue_to_rgb(p, q, h), hue_to_rgb(p, q, h - 1.0 / 3.0))
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub user_id: String,
    pub display_name: String,
    pub color: PeerColor,
}

impl PeerIdentity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self { color: PeerColor::from_seed(&user_id), user_id, display_name: display_name.into() }
    }
}

/// Text selection inside the focused node, in chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: u32,
    pub head: u32,
}

impl SelectionRange {
    pub fn caret(at: u32) -> Self {
        Self { anchor: at, head: at }
    }

    pub fn is_caret(&self) -> bool {
        self.anchor == self.head
    }
}

// ─── Wire payload ───────────────────────────────────────────────────────────

/// One peer's presence as broadcast to everyone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub identity: PeerIdentity,
    pub focused_edge_id: Option<EdgeId>,
    pub selection: Option<SelectionRange>,
    /// Monotonic per sender; lower or equal clocks are stale.
    pub clock: u64,
}

impl PresenceState {
    pub fn encode(&self) -> Result<Vec<u8>, PresenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PresenceError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PresenceError> {
        let (state, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PresenceError::Decode(e.to_string()))?;
        Ok(state)
    }
}

// ─── Room ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub connection_id: String,
    pub state: PresenceState,
    pub last_seen: Instant,
}

/// Everything a UI needs to draw presence, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub local: Option<PresenceState>,
    /// Remote peers keyed by connection id.
    pub peers: BTreeMap<String, PresenceState>,
    /// Connection ids of the peers focused on each edge.
    pub by_edge: BTreeMap<EdgeId, Vec<String>>,
}

impl PresenceSnapshot {
    pub fn peers_on(&self, edge: &EdgeId) -> &[String] {
        self.by_edge.get(edge).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Local presence plus the merged presence of every remote connection.
pub struct PresenceRoom {
    local: Option<PresenceState>,
    clock: u64,
    peers: HashMap<String, RemotePeer>,
    idle_timeout: Duration,
}

impl PresenceRoom {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { local: None, clock: 0, peers: HashMap::new(), idle_timeout }
    }

    /// Replace the local state; the clock advances on every call.
    pub fn set_local(
        &mut self,
        identity: PeerIdentity,
        focused_edge_id: Option<EdgeId>,
        selection: Option<SelectionRange>,
    ) -> &PresenceState {
        self.clock += 1;
        self.local.insert(PresenceState { identity, focused_edge_id, selection, clock: self.clock })
    }

    pub fn local(&self) -> Option<&PresenceState> {
        self.local.as_ref()
    }

    pub fn encode_local(&self) -> Result<Option<Vec<u8>>, PresenceError> {
        self.local.as_ref().map(PresenceState::encode).transpose()
    }

    /// Merge a payload from `connection_id`. Returns whether anything changed.
    pub fn handle_remote(
        &mut self,
        connection_id: &str,
        payload: &[u8],
    ) -> Result<bool, PresenceError> {
        let state = PresenceState::decode(payload)?;
        Ok(self.merge(connection_id, state))
    }

    pub fn merge(&mut self, connection_id: &str, state: PresenceState) -> bool {
        if let Some(existing) = self.peers.get(connection_id) {
            if state.clock <= existing.state.clock {
                log::debug!(
                    "Dropping stale presence from {} (clock {} <= {})",
                    connection_id,
                    state.clock,
                    existing.state.clock
                );
                return false;
            }
        }
        self.peers.insert(
            connection_id.to_string(),
            RemotePeer {
                connection_id: connection_id.to_string(),
                state,
                last_seen: Instant::now(),
            },
        );
        true
    }

    pub fn remove(&mut self, connection_id: &str) -> bool {
        self.peers.remove(connection_id).is_some()
    }

    /// Drop peers silent for longer than the idle timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<String> {
        let timeout = self.idle_timeout;
        let idle: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.last_seen.elapsed() > timeout)
            .map(|p| p.connection_id.clone())
            .collect();
        for id in &idle {
            self.peers.remove(id);
        }
        idle
    }

    pub fn peer(&self, connection_id: &str) -> Option<&RemotePeer> {
        self.peers.get(connection_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Remote peers grouped by the edge they focus, connection ids sorted.
    pub fn by_focused_edge(&self) -> BTreeMap<EdgeId, Vec<String>> {
        let mut index: BTreeMap<EdgeId, Vec<String>> = BTreeMap::new();
        for peer in self.peers.values() {
            if let Some(edge) = &peer.state.focused_edge_id {
                index.entry(edge.clone()).or_default().push(peer.connection_id.clone());
            }
        }
        for ids in index.values_mut() {
            ids.sort();
        }
        index
    }

    /// Forget remote peers; the local state survives.
    pub fn clear_remote(&mut self) {
        self.peers.clear();
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.local = None;
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            local: self.local.clone(),
            peers: self.peers.iter().map(|(id, p)| (id.clone(), p.state.clone())).collect(),
            by_edge: self.by_focused_edge(),
        }
    }
}
