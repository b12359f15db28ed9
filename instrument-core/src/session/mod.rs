//! Session lifecycle management
//!
//! Owns the local session state machine and every peer's connection state,
//! orchestrating the registry, clock sync, heartbeat policy and transport.

mod controller;
mod state;

pub use controller::*;
pub use state::*;
