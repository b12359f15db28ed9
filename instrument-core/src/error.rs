//! Error types for the session core
//!
//! No error here is fatal to the process; each is scoped to a single peer
//! or a single operation. The local session state machine has no error
//! state - a failure simply leaves the current state in place.

use thiserror::Error;

/// Errors surfaced by the session core
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Invite to peer {0} failed: {1}")]
    InviteFailed(String, String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Time sync with peer {0} timed out")]
    SyncTimeout(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Session task closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
