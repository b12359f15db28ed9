//! Player records and the peer registry
//!
//! A `Player` exists for every peer ever seen (including the local device)
//! and is never removed, so stable identity survives session resets. Only
//! the session-scoped handle, connection state and heartbeat timestamps are
//! reset on disconnect.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timesync::RoundTripSample;
use crate::transport::PeerHandle;

/// Stable player identity, valid for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerId(Uuid);

impl PlayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of a single peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// The peer has been discovered but is not yet connected
    Discovered,
    /// The invitation was sent
    Invited,
    /// The invitation was accepted
    InviteAccepted,
    /// The invitation was declined
    InviteDeclined,
    /// The time sync process is in progress
    SyncingTime,
    /// Connected to the session
    Connected,
    /// A heartbeat was missed; restored to Connected on the next message
    Stale,
    /// Previously connected peer is no longer connected
    Disconnected,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Discovered => "discovered",
            PeerState::Invited => "invited",
            PeerState::InviteAccepted => "invite accepted",
            PeerState::InviteDeclined => "invite declined",
            PeerState::SyncingTime => "syncing time",
            PeerState::Connected => "connected",
            PeerState::Stale => "stale",
            PeerState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One known peer (or the local device)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    /// Stable identity, survives session resets
    pub player_id: PlayerId,
    /// User-facing name; mutable
    pub display_name: String,
    /// Session-scoped transport handle; cleared on disconnect
    pub peer_handle: Option<PeerHandle>,
    /// Mutated only by the session controller
    pub state: PeerState,
    /// Timestamp carried inside the last heartbeat received from this peer
    pub last_heartbeat_sent_from_peer_at: Option<f64>,
    /// Local timestamp of when that heartbeat arrived; the difference of
    /// the two approximates current latency between the devices
    pub last_heartbeat_received_from_peer_at: Option<f64>,
    /// Local timestamp of the last heartbeat sent to this peer
    pub last_heartbeat_sent_to_peer_at: Option<f64>,
    /// Round-trip samples captured while this peer acted as time server
    pub time_latency_samples: Vec<RoundTripSample>,
}

impl Player {
    pub fn new(display_name: &str) -> Self {
        Self::with_id(PlayerId::new(), display_name)
    }

    pub fn with_id(player_id: PlayerId, display_name: &str) -> Self {
        Self {
            player_id,
            display_name: display_name.to_string(),
            peer_handle: None,
            state: PeerState::Discovered,
            last_heartbeat_sent_from_peer_at: None,
            last_heartbeat_received_from_peer_at: None,
            last_heartbeat_sent_to_peer_at: None,
            time_latency_samples: Vec::new(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    players: HashMap<PlayerId, Player>,
    local_id: Option<PlayerId>,
}

/// Thread-safe store of known players
///
/// Holds unique-key storage and consistent snapshots for UI collaborators;
/// transition validity is the session controller's job, and only the
/// controller writes `state`.
#[derive(Clone, Default)]
pub struct PlayerRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the local device's player; idempotent, at most one local
    /// player ever exists
    pub fn register_local(&self, display_name: &str) -> PlayerId {
        let mut inner = self.inner.write();
        if let Some(id) = inner.local_id {
            return id;
        }
        let player = Player::new(display_name);
        let id = player.player_id;
        inner.local_id = Some(id);
        inner.players.insert(id, player);
        id
    }

    pub fn local_id(&self) -> Option<PlayerId> {
        self.inner.read().local_id
    }

    /// Create-or-fetch by stable identity; updates the display name on fetch
    pub fn upsert(&self, player_id: PlayerId, display_name: &str) -> Player {
        let mut inner = self.inner.write();
        let player = inner
            .players
            .entry(player_id)
            .or_insert_with(|| Player::with_id(player_id, display_name));
        player.display_name = display_name.to_string();
        player.clone()
    }

    /// Create-or-fetch by display name
    ///
    /// Discovery only surfaces a transport handle plus a display name; the
    /// stable identity is minted on first sight and found again by name
    /// when the peer reconnects with a fresh handle.
    pub fn upsert_by_name(&self, display_name: &str) -> Player {
        let mut inner = self.inner.write();
        let local_id = inner.local_id;
        if let Some(player) = inner
            .players
            .values()
            .find(|p| Some(p.player_id) != local_id && p.display_name == display_name)
        {
            return player.clone();
        }
        let player = Player::new(display_name);
        inner.players.insert(player.player_id, player.clone());
        player
    }

    pub fn get(&self, player_id: PlayerId) -> Option<Player> {
        self.inner.read().players.get(&player_id).cloned()
    }

    /// Look a player up by its current session handle
    pub fn find_by_handle(&self, handle: &PeerHandle) -> Option<Player> {
        self.inner
            .read()
            .players
            .values()
            .find(|p| p.peer_handle.as_ref() == Some(handle))
            .cloned()
    }

    pub fn set_state(&self, player_id: PlayerId, state: PeerState) {
        if let Some(player) = self.inner.write().players.get_mut(&player_id) {
            player.state = state;
        }
    }

    pub fn set_handle(&self, player_id: PlayerId, handle: Option<PeerHandle>) {
        if let Some(player) = self.inner.write().players.get_mut(&player_id) {
            player.peer_handle = handle;
        }
    }

    pub fn record_heartbeat_sent(&self, player_id: PlayerId, at: f64) {
        if let Some(player) = self.inner.write().players.get_mut(&player_id) {
            player.last_heartbeat_sent_to_peer_at = Some(at);
        }
    }

    pub fn record_heartbeat_received(
        &self,
        player_id: PlayerId,
        sent_from_peer_at: f64,
        received_at: f64,
    ) {
        if let Some(player) = self.inner.write().players.get_mut(&player_id) {
            player.last_heartbeat_sent_from_peer_at = Some(sent_from_peer_at);
            player.last_heartbeat_received_from_peer_at = Some(received_at);
        }
    }

    /// Bump the liveness baseline without a heartbeat payload
    ///
    /// Used when a peer connects or comes back from `Stale` on a
    /// non-heartbeat message, so staleness is measured from now.
    pub fn touch_liveness(&self, player_id: PlayerId, at: f64) {
        if let Some(player) = self.inner.write().players.get_mut(&player_id) {
            player.last_heartbeat_received_from_peer_at = Some(at);
        }
    }

    pub fn push_latency_sample(&self, player_id: PlayerId, sample: RoundTripSample) {
        if let Some(player) = self.inner.write().players.get_mut(&player_id) {
            player.time_latency_samples.push(sample);
        }
    }

    pub fn clear_latency_samples(&self, player_id: PlayerId) {
        if let Some(player) = self.inner.write().players.get_mut(&player_id) {
            player.time_latency_samples.clear();
        }
    }

    /// Snapshot of every known player
    pub fn all(&self) -> Vec<Player> {
        self.inner.read().players.values().cloned().collect()
    }

    /// Snapshot of every known player except the local device
    pub fn remote_peers(&self) -> Vec<Player> {
        let inner = self.inner.read();
        inner
            .players
            .values()
            .filter(|p| Some(p.player_id) != inner.local_id)
            .cloned()
            .collect()
    }

    /// Reset every remote peer to its pre-session state, keeping identity
    /// and display name
    pub fn reset_sessions(&self) {
        let mut inner = self.inner.write();
        let local_id = inner.local_id;
        for player in inner.players.values_mut() {
            if Some(player.player_id) == local_id {
                continue;
            }
            player.peer_handle = None;
            player.state = PeerState::Discovered;
            player.last_heartbeat_sent_from_peer_at = None;
            player.last_heartbeat_received_from_peer_at = None;
            player.last_heartbeat_sent_to_peer_at = None;
            player.time_latency_samples.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_local_is_idempotent() {
        let registry = PlayerRegistry::new();
        let a = registry.register_local("me");
        let b = registry.register_local("me");
        assert_eq!(a, b);
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_upsert_by_name_reuses_identity() {
        let registry = PlayerRegistry::new();
        registry.register_local("me");

        let first = registry.upsert_by_name("alice");
        let second = registry.upsert_by_name("alice");
        assert_eq!(first.player_id, second.player_id);

        // The local player is never matched by name
        let local = registry.upsert_by_name("me");
        assert_ne!(Some(local.player_id), registry.local_id());
    }

    #[test]
    fn test_find_by_handle() {
        let registry = PlayerRegistry::new();
        let player = registry.upsert_by_name("bob");
        let handle = PeerHandle::from("session-7");

        assert!(registry.find_by_handle(&handle).is_none());
        registry.set_handle(player.player_id, Some(handle.clone()));
        let found = registry.find_by_handle(&handle).unwrap();
        assert_eq!(found.player_id, player.player_id);
    }

    #[test]
    fn test_reset_sessions_preserves_identity() {
        let registry = PlayerRegistry::new();
        registry.register_local("me");
        let player = registry.upsert_by_name("carol");
        registry.set_handle(player.player_id, Some(PeerHandle::from("h1")));
        registry.set_state(player.player_id, PeerState::Connected);
        registry.record_heartbeat_sent(player.player_id, 42.0);

        registry.reset_sessions();

        let after = registry.get(player.player_id).unwrap();
        assert_eq!(after.display_name, "carol");
        assert_eq!(after.state, PeerState::Discovered);
        assert!(after.peer_handle.is_none());
        assert!(after.last_heartbeat_sent_to_peer_at.is_none());
    }
}
