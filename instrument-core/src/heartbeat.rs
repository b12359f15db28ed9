//! Heartbeat policy for connected peers
//!
//! The session loop calls [`HeartbeatMonitor::tick`] on a fixed interval.
//! The monitor decides who gets a heartbeat and which peers have gone
//! quiet; the controller performs the sends and applies the transitions,
//! so the policy here stays pure and testable.

use std::time::Duration;

use crate::player::{PeerState, Player, PlayerId};

/// Outcome of a single tick
#[derive(Debug, Default)]
pub struct HeartbeatTick {
    /// Peers that should receive a heartbeat now
    pub send_to: Vec<PlayerId>,
    /// Connected peers that missed the staleness window
    pub stale: Vec<PlayerId>,
    /// Stale peers that missed a further window and are gone
    pub disconnect: Vec<PlayerId>,
}

/// Liveness policy over per-peer heartbeat timestamps
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    /// Connected -> Stale after this long without a received heartbeat
    stale_after: f64,
    /// Stale -> Disconnected after this much additional silence
    disconnect_after: f64,
}

impl HeartbeatMonitor {
    /// Staleness at 2x the interval, disconnect one interval later
    pub fn new(interval: Duration) -> Self {
        let secs = interval.as_secs_f64();
        Self {
            interval,
            stale_after: 2.0 * secs,
            disconnect_after: secs,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stale_after(&self) -> f64 {
        self.stale_after
    }

    /// Inspect every peer and report who to probe and who has gone quiet
    ///
    /// Staleness is measured from `last_heartbeat_received_from_peer_at`;
    /// the controller stamps that field when a peer first connects, so a
    /// peer that never answers is measured from connection time.
    pub fn tick(&self, players: &[Player], now: f64) -> HeartbeatTick {
        let mut outcome = HeartbeatTick::default();

        for player in players {
            match player.state {
                PeerState::Connected => {
                    outcome.send_to.push(player.player_id);
                    if let Some(last) = player.last_heartbeat_received_from_peer_at {
                        if now - last > self.stale_after {
                            outcome.stale.push(player.player_id);
                        }
                    }
                }
                PeerState::Stale => {
                    outcome.send_to.push(player.player_id);
                    if let Some(last) = player.last_heartbeat_received_from_peer_at {
                        if now - last > self.stale_after + self.disconnect_after {
                            outcome.disconnect.push(player.player_id);
                        }
                    }
                }
                _ => {}
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::Player;

    fn connected(received_at: Option<f64>, sent_at: Option<f64>) -> Player {
        let mut player = Player::new("peer");
        player.state = PeerState::Connected;
        player.last_heartbeat_received_from_peer_at = received_at;
        player.last_heartbeat_sent_to_peer_at = sent_at;
        player
    }

    #[test]
    fn test_fresh_peer_gets_heartbeat_but_not_stale() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(2));
        let player = connected(None, None);

        let tick = monitor.tick(&[player.clone()], 100.0);
        assert_eq!(tick.send_to, vec![player.player_id]);
        assert!(tick.stale.is_empty());
        assert!(tick.disconnect.is_empty());
    }

    #[test]
    fn test_silent_peer_goes_stale_after_two_intervals() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(2));
        let player = connected(Some(100.0), None);

        // Inside the window: still fine
        let tick = monitor.tick(&[player.clone()], 103.9);
        assert!(tick.stale.is_empty());

        // Past 2x interval: stale
        let tick = monitor.tick(&[player.clone()], 104.1);
        assert_eq!(tick.stale, vec![player.player_id]);
    }

    #[test]
    fn test_stale_peer_disconnects_after_one_more_interval() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(2));
        let mut player = connected(Some(100.0), None);
        player.state = PeerState::Stale;

        let tick = monitor.tick(&[player.clone()], 105.9);
        assert!(tick.disconnect.is_empty());

        let tick = monitor.tick(&[player.clone()], 106.1);
        assert_eq!(tick.disconnect, vec![player.player_id]);
        // Still probed while stale, in case it comes back
        assert_eq!(tick.send_to, vec![player.player_id]);
    }

    #[test]
    fn test_peer_without_baseline_is_only_probed() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(2));
        let player = connected(None, Some(100.0));

        let tick = monitor.tick(&[player.clone()], 104.5);
        assert_eq!(tick.send_to, vec![player.player_id]);
        assert!(tick.stale.is_empty());
    }

    #[test]
    fn test_disconnected_peers_are_ignored() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(2));
        let mut player = connected(Some(0.0), None);
        player.state = PeerState::Disconnected;

        let tick = monitor.tick(&[player], 100.0);
        assert!(tick.send_to.is_empty());
        assert!(tick.stale.is_empty());
        assert!(tick.disconnect.is_empty());
    }
}
