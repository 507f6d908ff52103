//! Remote endpoints.
//!
//! Every connection to the same address shares one [`Peer`], so RTT
//! estimates, window ceilings and the burst budget are learned once per
//! host rather than once per connection.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::RxConfig;
use crate::core::constants::MAX_PACKET_SIZE;
use crate::core::lock;
use crate::transport::{ClockTime, RttEstimator};

use super::call::Call;

/// Mutable per-peer state, guarded by the peer lock.
#[derive(Debug)]
pub(crate) struct PeerState {
    pub(crate) rtt: RttEstimator,
    /// Transmit window ceiling derived from the RTT estimate.
    pub(crate) max_window: u32,
    /// Largest datagram we send to this peer.
    pub(crate) packet_size: usize,
    pub(crate) burst_size: u32,
    /// Remaining burst budget.
    pub(crate) burst: u32,
    pub(crate) burst_wait: Duration,
    pub(crate) decongest_pending: bool,
    /// Calls waiting for the burst budget to come back.
    pub(crate) congestion_queue: VecDeque<Arc<Call>>,
    /// Largest serial reordering seen from this peer.
    pub(crate) in_packet_skew: u32,
    /// The peer's own reordering estimate, from its acks.
    pub(crate) out_packet_skew: u32,
    pub(crate) rtt_min: Option<Duration>,
    pub(crate) rtt_max: Duration,
    pub(crate) n_sent: u64,
    pub(crate) resends: u64,
    /// Connections referencing this peer.
    pub(crate) ref_count: u32,
    /// Set when the last reference went away.
    pub(crate) idle_since: Option<ClockTime>,
}

/// A remote host and port.
#[derive(Debug)]
pub struct Peer {
    addr: SocketAddr,
    pub(crate) state: Mutex<PeerState>,
}

/// Snapshot of a peer's congestion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    /// Remote address.
    pub addr: SocketAddr,
    /// Smoothed RTT.
    pub srtt: Duration,
    /// Smoothed deviation.
    pub mdev: Duration,
    /// Current retransmit timeout.
    pub timeout: Duration,
    /// Transmit window ceiling.
    pub max_window: u32,
    /// Largest datagram sent to the peer.
    pub packet_size: usize,
    /// Data packets sent.
    pub n_sent: u64,
    /// Data packets retransmitted.
    pub resends: u64,
    /// Connections referencing the peer.
    pub ref_count: u32,
}

impl Peer {
    pub(crate) fn new(addr: SocketAddr, config: &RxConfig) -> Self {
        let rtt = RttEstimator::new(config.initial_timeout);
        let max_window = rtt.window(config.window);
        Self {
            addr,
            state: Mutex::new(PeerState {
                rtt,
                max_window,
                packet_size: MAX_PACKET_SIZE,
                burst_size: config.burst_size,
                burst: config.burst_size,
                burst_wait: config.burst_wait,
                decongest_pending: false,
                congestion_queue: VecDeque::new(),
                in_packet_skew: 0,
                out_packet_skew: 0,
                rtt_min: None,
                rtt_max: Duration::ZERO,
                n_sent: 0,
                resends: 0,
                ref_count: 0,
                idle_since: None,
            }),
        }
    }

    /// Remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current retransmit timeout.
    pub fn timeout(&self) -> Duration {
        lock(&self.state).rtt.timeout()
    }

    /// Snapshot of the peer's state.
    pub fn info(&self) -> PeerInfo {
        let state = lock(&self.state);
        PeerInfo {
            addr: self.addr,
            srtt: state.rtt.srtt(),
            mdev: state.rtt.mdev(),
            timeout: state.rtt.timeout(),
            max_window: state.max_window,
            packet_size: state.packet_size,
            n_sent: state.n_sent,
            resends: state.resends,
            ref_count: state.ref_count,
        }
    }
}

impl PeerState {
    /// Absorb an RTT sample and resize the window ceiling.
    pub(crate) fn sample_rtt(&mut self, sample: Duration, ceiling: u32) {
        self.rtt.update(sample);
        self.max_window = self.rtt.window(ceiling);
        self.rtt_min = Some(self.rtt_min.map_or(sample, |min| min.min(sample)));
        self.rtt_max = self.rtt_max.max(sample);
    }

    /// Take one reference.
    pub(crate) fn hold(&mut self) {
        self.ref_count += 1;
        self.idle_since = None;
    }

    /// Drop one reference, remembering when the peer went idle.
    pub(crate) fn release(&mut self, now: ClockTime) {
        self.ref_count = self.ref_count.saturating_sub(1);
        if self.ref_count == 0 {
            self.idle_since = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new("127.0.0.1:7000".parse().unwrap(), &RxConfig::default())
    }

    #[test]
    fn test_new_peer_defaults() {
        let info = peer().info();
        assert_eq!(info.timeout, Duration::from_secs(2));
        assert_eq!(info.max_window, 15);
        assert_eq!(info.packet_size, MAX_PACKET_SIZE);
        assert_eq!(info.ref_count, 0);
    }

    #[test]
    fn test_sample_rtt_shrinks_window() {
        let peer = peer();
        let mut state = lock(&peer.state);
        state.sample_rtt(Duration::from_millis(10), 15);
        assert_eq!(state.max_window, 6);
        assert_eq!(state.rtt_min, Some(Duration::from_millis(10)));

        state.sample_rtt(Duration::from_millis(30), 15);
        assert_eq!(state.rtt_min, Some(Duration::from_millis(10)));
        assert_eq!(state.rtt_max, Duration::from_millis(30));
    }

    #[test]
    fn test_reference_counting() {
        let peer = peer();
        let mut state = lock(&peer.state);
        state.hold();
        state.hold();
        state.release(ClockTime::from_micros(5));
        assert_eq!(state.idle_since, None);
        state.release(ClockTime::from_micros(9));
        assert_eq!(state.ref_count, 0);
        assert_eq!(state.idle_since, Some(ClockTime::from_micros(9)));
    }
}
