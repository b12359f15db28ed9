//! Instrument Core Library
//!
//! Peer session and synchronization layer for an ad-hoc group of devices
//! acting as one distributed instrument: peer discovery and invitation,
//! a shared time base estimated against an elected reference peer,
//! heartbeat-driven liveness, and a small JSON message protocol. The
//! concrete network lives behind the [`Transport`](transport::Transport)
//! trait.

use std::sync::Once;

pub mod error;
pub mod heartbeat;
pub mod player;
pub mod protocol;
pub mod session;
pub mod timesync;
pub mod transport;

// Re-exports for convenience
pub use error::SessionError;
pub use player::{PeerState, Player, PlayerId, PlayerRegistry};
pub use protocol::Message;
pub use session::{
    LocalSessionState, SessionConfig, SessionController, SessionEvent, SessionHandle,
    SessionPhase, TimeServerPolicy,
};
pub use transport::{PeerHandle, Transport, TransportEvent, TransportPeerState};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing output; safe to call more than once
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_target(false)
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("instrument_core=debug".parse().unwrap()),
            )
            .init();
    });
}
