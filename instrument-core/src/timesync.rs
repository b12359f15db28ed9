//! Clock-offset estimation against an elected reference peer
//!
//! Devices carry independent clocks; to share a time base, one peer is
//! elected as "time server" and the local device runs a ping-style exchange
//! against it: send the current local timestamp, the reference echoes it
//! back unchanged, record the round trip. Once enough samples are in, the
//! one-way delay estimate (round trip / 2, outliers dropped) is frozen as
//! the clock delta and applied to local wall-clock reads.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::player::PlayerId;

/// Round-trip samples required before the delta is frozen
pub const DEFAULT_REQUIRED_SAMPLES: usize = 5;

/// Samples with a round trip above this multiple of the median are dropped
/// before averaging, to keep wireless jitter out of the estimate
pub const DEFAULT_OUTLIER_FACTOR: f64 = 2.0;

/// Sync fails if fewer than 2 samples arrive within this many seconds
pub const DEFAULT_SYNC_TIMEOUT_SECS: f64 = 10.0;

/// One round trip of the timestamp exchange, both ends in local
/// epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoundTripSample {
    /// Local time the timestamp probe was sent
    pub sent_at: f64,
    /// Local time the echo came back
    pub received_at: f64,
}

impl RoundTripSample {
    pub fn round_trip(&self) -> f64 {
        self.received_at - self.sent_at
    }
}

#[derive(Debug)]
struct SyncWindow {
    reference: PlayerId,
    started_at: f64,
    samples: Vec<RoundTripSample>,
    /// Probe values sent and not yet echoed back
    pending: Vec<f64>,
}

/// Estimates the clock delta between the local device and the reference peer
///
/// The delta survives later failed resyncs: a stale delta is preferred
/// over no delta.
#[derive(Debug)]
pub struct TimeSyncEngine {
    required_samples: usize,
    outlier_factor: f64,
    timeout_secs: f64,
    window: Option<SyncWindow>,
    delta: Option<f64>,
}

impl TimeSyncEngine {
    pub fn new(required_samples: usize, outlier_factor: f64, timeout_secs: f64) -> Self {
        Self {
            required_samples: required_samples.max(2),
            outlier_factor,
            timeout_secs,
            window: None,
            delta: None,
        }
    }

    /// Open a sampling window against the given reference peer
    ///
    /// Replaces any window already in progress.
    pub fn begin(&mut self, reference: PlayerId, now: f64) {
        debug!("Time sync started against reference {}", reference);
        self.window = Some(SyncWindow {
            reference,
            started_at: now,
            samples: Vec::with_capacity(self.required_samples),
            pending: Vec::new(),
        });
    }

    /// Note a probe value sent to the reference, awaiting its echo
    pub fn note_probe(&mut self, value: f64) {
        if let Some(window) = self.window.as_mut() {
            window.pending.push(value);
        }
    }

    /// Claim a pending probe matching the echoed value
    ///
    /// The reference echoes our value bit-for-bit, so exact comparison
    /// distinguishes our echoes from the peer's own probes when both
    /// sides run an exchange at once.
    pub fn take_pending(&mut self, value: f64) -> bool {
        let Some(window) = self.window.as_mut() else {
            return false;
        };
        match window.pending.iter().position(|v| *v == value) {
            Some(i) => {
                window.pending.remove(i);
                true
            }
            None => false,
        }
    }

    /// The peer currently (or last) used as reference, if a window is open
    pub fn reference(&self) -> Option<PlayerId> {
        self.window.as_ref().map(|w| w.reference)
    }

    pub fn in_progress(&self) -> bool {
        self.window.is_some()
    }

    /// Record one echoed timestamp
    ///
    /// Returns `true` when sampling is complete (the delta is now frozen)
    /// and `false` when the caller should request another round.
    pub fn record_echo(&mut self, sent_at: f64, received_at: f64) -> bool {
        let Some(window) = self.window.as_mut() else {
            warn!("Echo received with no sync window open; ignoring");
            return self.delta.is_some();
        };

        let sample = RoundTripSample {
            sent_at,
            received_at,
        };
        debug!(
            "Time sync sample {}/{}: rtt={:.4}s",
            window.samples.len() + 1,
            self.required_samples,
            sample.round_trip()
        );
        window.samples.push(sample);

        if window.samples.len() < self.required_samples {
            return false;
        }

        let delta = compute_delta(&window.samples, self.outlier_factor);
        debug!(
            "Time sync complete against {}: delta={:.4}s",
            window.reference, delta
        );
        self.delta = Some(delta);
        self.window = None;
        true
    }

    /// Whether the open window has gone too long without enough samples
    pub fn is_timed_out(&self, now: f64) -> bool {
        match &self.window {
            Some(w) => w.samples.len() < 2 && now - w.started_at > self.timeout_secs,
            None => false,
        }
    }

    /// Abandon the open window, keeping any previously frozen delta
    pub fn cancel(&mut self) {
        if self.window.take().is_some() {
            debug!("Time sync window cancelled");
        }
    }

    /// The frozen clock delta in seconds, if a sync ever completed
    pub fn delta(&self) -> Option<f64> {
        self.delta
    }

    /// Local wall-clock time adjusted by the frozen delta
    ///
    /// Valid even when no sync has completed (delta 0) or a later resync
    /// failed.
    pub fn current_time(&self, now: f64) -> f64 {
        now + self.delta.unwrap_or(0.0)
    }

    /// Samples collected so far in the open window
    pub fn samples(&self) -> &[RoundTripSample] {
        self.window.as_ref().map(|w| w.samples.as_slice()).unwrap_or(&[])
    }
}

impl Default for TimeSyncEngine {
    fn default() -> Self {
        Self::new(
            DEFAULT_REQUIRED_SAMPLES,
            DEFAULT_OUTLIER_FACTOR,
            DEFAULT_SYNC_TIMEOUT_SECS,
        )
    }
}

/// Symmetric-delay estimate: drop round trips above `outlier_factor` times
/// the median, then take half the mean of what remains
fn compute_delta(samples: &[RoundTripSample], outlier_factor: f64) -> f64 {
    let mut rtts: Vec<f64> = samples.iter().map(|s| s.round_trip()).collect();
    rtts.sort_by(f64::total_cmp);

    let median = if rtts.len() % 2 == 1 {
        rtts[rtts.len() / 2]
    } else {
        (rtts[rtts.len() / 2 - 1] + rtts[rtts.len() / 2]) / 2.0
    };

    let kept: Vec<f64> = rtts
        .iter()
        .copied()
        .filter(|rtt| *rtt <= outlier_factor * median)
        .collect();

    // At least half the samples sit at or below the median, so kept is
    // never empty
    let mean = kept.iter().sum::<f64>() / kept.len() as f64;
    mean / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(required: usize) -> TimeSyncEngine {
        TimeSyncEngine::new(required, DEFAULT_OUTLIER_FACTOR, DEFAULT_SYNC_TIMEOUT_SECS)
    }

    #[test]
    fn test_delta_from_two_samples() {
        let reference = PlayerId::new();
        let mut sync = engine(2);
        sync.begin(reference, 0.0);

        assert!(!sync.record_echo(100.0, 108.0));
        assert!(sync.record_echo(200.0, 206.0));

        // Round trips 8 and 6, mean 7, one-way 3.5
        assert_eq!(sync.delta(), Some(3.5));
        assert!(!sync.in_progress());
    }

    #[test]
    fn test_outlier_round_trip_excluded() {
        let mut sync = engine(3);
        sync.begin(PlayerId::new(), 0.0);

        assert!(!sync.record_echo(0.0, 8.0));
        assert!(!sync.record_echo(100.0, 106.0));
        // A 500-unit round trip against a median of 8 is dropped
        assert!(sync.record_echo(200.0, 700.0));

        assert_eq!(sync.delta(), Some(3.5));
    }

    #[test]
    fn test_current_time_applies_delta() {
        let mut sync = engine(2);
        assert_eq!(sync.current_time(1000.0), 1000.0);

        sync.begin(PlayerId::new(), 0.0);
        sync.record_echo(0.0, 4.0);
        sync.record_echo(10.0, 14.0);

        assert_eq!(sync.delta(), Some(2.0));
        assert_eq!(sync.current_time(1000.0), 1002.0);
    }

    #[test]
    fn test_timeout_requires_open_window() {
        let mut sync = engine(5);
        assert!(!sync.is_timed_out(100.0));

        sync.begin(PlayerId::new(), 100.0);
        assert!(!sync.is_timed_out(105.0));
        assert!(sync.is_timed_out(100.0 + DEFAULT_SYNC_TIMEOUT_SECS + 1.0));

        // Two samples in (of the five required): the window is still open
        // but no longer a timeout candidate
        sync.record_echo(100.0, 100.5);
        sync.record_echo(101.0, 101.5);
        assert!(sync.in_progress());
        assert!(!sync.is_timed_out(100.0 + DEFAULT_SYNC_TIMEOUT_SECS + 1.0));
    }

    #[test]
    fn test_cancel_keeps_frozen_delta() {
        let mut sync = engine(2);
        sync.begin(PlayerId::new(), 0.0);
        sync.record_echo(0.0, 4.0);
        sync.record_echo(10.0, 14.0);
        assert_eq!(sync.delta(), Some(2.0));

        // A later failed resync leaves the old delta usable
        sync.begin(PlayerId::new(), 50.0);
        sync.cancel();
        assert_eq!(sync.delta(), Some(2.0));
        assert!(!sync.in_progress());
    }

    #[test]
    fn test_echo_without_window_is_ignored() {
        let mut sync = engine(2);
        assert!(!sync.record_echo(0.0, 1.0));
        assert_eq!(sync.delta(), None);
    }
}
