//! Transport substrate interface
//!
//! The core never talks to a concrete network. A discovery/connect/send/
//! stream substrate delivers inbound events on a single channel and accepts
//! outbound calls through the [`Transport`] trait. Transport callbacks may
//! originate on arbitrary worker contexts; funneling them through one
//! channel is what serializes them before any session state is touched.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SessionError;

/// Opaque session-scoped connection handle for a peer
///
/// Valid only for the lifetime of the current transport session; reset on
/// disconnect/reconnect. Stable identity lives in
/// [`PlayerId`](crate::player::PlayerId).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerHandle(pub String);

impl PeerHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerHandle {
    fn from(s: &str) -> Self {
        PeerHandle(s.to_string())
    }
}

/// Peer connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPeerState {
    /// An invitation is in flight
    Connecting,
    /// The peer accepted and the link is up
    Connected,
    /// Declined, failed, or dropped
    NotConnected,
}

/// Inbound events delivered by the transport substrate
///
/// All variants arrive on a single channel consumed by the session loop,
/// so state transitions are never applied concurrently.
#[derive(Debug)]
pub enum TransportEvent {
    /// A nearby peer was discovered (advertising its display name)
    PeerFound {
        handle: PeerHandle,
        display_name: String,
    },
    /// The connection state of a peer changed
    PeerStateChanged {
        handle: PeerHandle,
        state: TransportPeerState,
    },
    /// A message payload arrived from a peer
    DataReceived { handle: PeerHandle, bytes: Vec<u8> },
    /// A named byte stream was opened by a peer
    StreamReceived {
        handle: PeerHandle,
        name: String,
        chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    },
}

/// Outbound calls into the transport substrate
///
/// Implemented by the concrete networking layer (and by mocks in tests).
/// `send` is fire-and-forget: the single returned result is the only
/// delivery feedback the core ever gets.
pub trait Transport: Send + 'static {
    /// Invite a discovered peer into the session
    fn invite(&mut self, peer: &PeerHandle) -> Result<(), SessionError>;

    /// Send a message payload to one or more peers
    fn send(
        &mut self,
        bytes: &[u8],
        peers: &[PeerHandle],
        reliable: bool,
    ) -> Result<(), SessionError>;

    /// Open a named outbound byte stream to a peer
    fn open_output_stream(
        &mut self,
        peer: &PeerHandle,
        name: &str,
    ) -> Result<mpsc::UnboundedSender<Vec<u8>>, SessionError>;

    fn start_advertising(&mut self) -> Result<(), SessionError>;
    fn stop_advertising(&mut self);
    fn start_browsing(&mut self) -> Result<(), SessionError>;
    fn stop_browsing(&mut self);
}
