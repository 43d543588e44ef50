//! Per-peer rate bookkeeping: transmit hold-off and observed RX health.

use std::time::Duration;

use web_time::Instant;

use super::rtt::RttEstimator;

/// Per-remote-address bookkeeping on one link. Created lazily on first
/// send/receive to a given address and persists for the link's life.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Current assumed transmit rate to this peer, in bits/s.
    rate_bps: f64,
    last_activity: Instant,
    hold_off_until: Option<Instant>,
    rtt: RttEstimator,
}

impl PeerState {
    pub(super) fn new(initial_rate_bps: f64, now: Instant) -> Self {
        Self {
            rate_bps: initial_rate_bps.max(1.0),
            last_activity: now,
            hold_off_until: None,
            rtt: RttEstimator::default(),
        }
    }

    /// Current assumed rate in bits/s.
    #[must_use]
    pub fn rate_bps(&self) -> f64 {
        self.rate_bps
    }

    /// The RTT estimator for this peer, sampled on bordering-fragment
    /// responses.
    #[must_use]
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Last time this peer sent or received anything.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// True if this peer's transmit hold-off has elapsed.
    #[must_use]
    pub fn is_ready(&self, now: Instant) -> bool {
        self.hold_off_until.is_none_or(|deadline| now >= deadline)
    }

    pub(super) fn mark_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Sets the hold-off until another send to this peer is allowed,
    /// proportional to the bits just sent at the current rate.
    pub(super) fn hold_off_for(&mut self, fragment_bits: f64, multiplier: f64, now: Instant) {
        let seconds = fragment_bits / self.rate_bps * multiplier;
        self.hold_off_until = Some(now + Duration::from_secs_f64(seconds.max(0.0)));
    }

    /// A favourable completion: increase the rate.
    pub(super) fn on_favourable(&mut self, tr_increase: f64) {
        self.rate_bps *= tr_increase;
    }

    /// An unfavourable signal (missing ACK, REQ on a bordering fragment):
    /// back off the rate.
    pub(super) fn on_unfavourable(&mut self, tr_decrease: f64) {
        self.rate_bps = (self.rate_bps / tr_decrease).max(1.0);
    }

    pub(super) fn sample_rtt(&mut self, rtt: Duration) {
        self.rtt.update(rtt);
    }
}

/// Lazily-created per-peer state, keyed by peer address.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: std::collections::HashMap<u8, PeerState>,
}

impl PeerTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets or lazily creates the state for `peer`.
    pub fn entry(&mut self, peer: u8, initial_rate_bps: f64, now: Instant) -> &mut PeerState {
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerState::new(initial_rate_bps, now))
    }

    /// Looks up a peer without creating it.
    #[must_use]
    pub fn get(&self, peer: u8) -> Option<&PeerState> {
        self.peers.get(&peer)
    }
}
