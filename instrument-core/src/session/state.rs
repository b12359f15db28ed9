//! Local session state machine

use std::fmt;

/// Lifecycle phase of the local session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No session exists yet (or it was shut down)
    NotCreated,
    /// Session exists; may be advertising and/or browsing
    Created,
    /// At least one peer is connected
    Connected,
}

/// Composite local session state
///
/// Advertising and browsing are independent axes, not mutually exclusive
/// sub-states. The `Connected` phase is entered when the first peer
/// connects and reverts to `Created` when the last one leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSessionState {
    pub phase: SessionPhase,
    pub advertising: bool,
    pub browsing: bool,
}

impl LocalSessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::NotCreated,
            advertising: false,
            browsing: false,
        }
    }

    pub fn is_created(&self) -> bool {
        self.phase != SessionPhase::NotCreated
    }

    pub fn is_connected(&self) -> bool {
        self.phase == SessionPhase::Connected
    }
}

impl Default for LocalSessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self.phase {
            SessionPhase::NotCreated => "not created",
            SessionPhase::Connected => "connected",
            SessionPhase::Created => match (self.advertising, self.browsing) {
                (true, true) => "advertising+browsing",
                (true, false) => "advertising",
                (false, true) => "browsing",
                (false, false) => "created",
            },
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_text() {
        let mut state = LocalSessionState::new();
        assert_eq!(state.to_string(), "not created");

        state.phase = SessionPhase::Created;
        assert_eq!(state.to_string(), "created");

        state.advertising = true;
        assert_eq!(state.to_string(), "advertising");

        state.browsing = true;
        assert_eq!(state.to_string(), "advertising+browsing");

        state.phase = SessionPhase::Connected;
        assert_eq!(state.to_string(), "connected");
    }
}
