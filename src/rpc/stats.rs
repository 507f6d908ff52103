//! Runtime statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::core::constants::*;
use crate::transport::PacketType;

/// Number of distinct packet types counted.
pub const PACKET_TYPE_COUNT: usize = 10;

/// Live counters, updated without locks.
#[derive(Debug)]
pub(crate) struct RxStats {
    pub(crate) packets_read: [AtomicU64; PACKET_TYPE_COUNT],
    pub(crate) packets_sent: [AtomicU64; PACKET_TYPE_COUNT],
    pub(crate) data_packets_read: AtomicU64,
    pub(crate) ack_packets_read: AtomicU64,
    pub(crate) dup_packets_read: AtomicU64,
    pub(crate) spurious_packets_read: AtomicU64,
    pub(crate) bogus_packets_read: AtomicU64,
    pub(crate) no_buffers_on_read: AtomicU64,
    pub(crate) no_buffers_on_send: AtomicU64,
    pub(crate) data_packets_sent: AtomicU64,
    pub(crate) data_packets_resent: AtomicU64,
    pub(crate) data_packets_pushed: AtomicU64,
    pub(crate) ack_packets_sent: AtomicU64,
    pub(crate) busy_packets_sent: AtomicU64,
    pub(crate) send_errors: AtomicU64,
    pub(crate) rtt_samples: AtomicU64,
    pub(crate) rtt_total_micros: AtomicU64,
    pub(crate) rtt_min_micros: AtomicU64,
    pub(crate) rtt_max_micros: AtomicU64,
    pub(crate) client_conns_created: AtomicU64,
    pub(crate) server_conns_created: AtomicU64,
    pub(crate) calls_created: AtomicU64,
    pub(crate) calls_freed: AtomicU64,
    pub(crate) fatal_errors: AtomicU64,
}

impl Default for RxStats {
    fn default() -> Self {
        Self {
            packets_read: Default::default(),
            packets_sent: Default::default(),
            data_packets_read: AtomicU64::new(0),
            ack_packets_read: AtomicU64::new(0),
            dup_packets_read: AtomicU64::new(0),
            spurious_packets_read: AtomicU64::new(0),
            bogus_packets_read: AtomicU64::new(0),
            no_buffers_on_read: AtomicU64::new(0),
            no_buffers_on_send: AtomicU64::new(0),
            data_packets_sent: AtomicU64::new(0),
            data_packets_resent: AtomicU64::new(0),
            data_packets_pushed: AtomicU64::new(0),
            ack_packets_sent: AtomicU64::new(0),
            busy_packets_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            rtt_samples: AtomicU64::new(0),
            rtt_total_micros: AtomicU64::new(0),
            rtt_min_micros: AtomicU64::new(u64::MAX),
            rtt_max_micros: AtomicU64::new(0),
            client_conns_created: AtomicU64::new(0),
            server_conns_created: AtomicU64::new(0),
            calls_created: AtomicU64::new(0),
            calls_freed: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl RxStats {
    pub(crate) fn packet_read(&self, packet_type: PacketType) {
        bump(&self.packets_read[packet_type.stat_index()]);
    }

    pub(crate) fn packet_sent(&self, packet_type: PacketType) {
        bump(&self.packets_sent[packet_type.stat_index()]);
    }

    pub(crate) fn rtt_sample(&self, sample: Duration) {
        let micros = u64::try_from(sample.as_micros()).unwrap_or(u64::MAX);
        bump(&self.rtt_samples);
        self.rtt_total_micros.fetch_add(micros, Ordering::Relaxed);
        self.rtt_min_micros.fetch_min(micros, Ordering::Relaxed);
        self.rtt_max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, tables: TableCounts) -> StatsSnapshot {
        let samples = get(&self.rtt_samples);
        let min = get(&self.rtt_min_micros);
        StatsSnapshot {
            packets_read: std::array::from_fn(|i| get(&self.packets_read[i])),
            packets_sent: std::array::from_fn(|i| get(&self.packets_sent[i])),
            data_packets_read: get(&self.data_packets_read),
            ack_packets_read: get(&self.ack_packets_read),
            dup_packets_read: get(&self.dup_packets_read),
            spurious_packets_read: get(&self.spurious_packets_read),
            bogus_packets_read: get(&self.bogus_packets_read),
            no_buffers_on_read: get(&self.no_buffers_on_read),
            no_buffers_on_send: get(&self.no_buffers_on_send),
            data_packets_sent: get(&self.data_packets_sent),
            data_packets_resent: get(&self.data_packets_resent),
            data_packets_pushed: get(&self.data_packets_pushed),
            ack_packets_sent: get(&self.ack_packets_sent),
            busy_packets_sent: get(&self.busy_packets_sent),
            send_errors: get(&self.send_errors),
            rtt_samples: samples,
            rtt_total: Duration::from_micros(get(&self.rtt_total_micros)),
            rtt_min: (samples > 0).then(|| Duration::from_micros(min)),
            rtt_max: Duration::from_micros(get(&self.rtt_max_micros)),
            client_conns_created: get(&self.client_conns_created),
            server_conns_created: get(&self.server_conns_created),
            calls_created: get(&self.calls_created),
            calls_freed: get(&self.calls_freed),
            fatal_errors: get(&self.fatal_errors),
            connections: tables.connections,
            peers: tables.peers,
            free_packets: tables.free_packets,
            total_packets: tables.total_packets,
        }
    }
}

/// Table sizes sampled alongside the counters.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TableCounts {
    pub(crate) connections: usize,
    pub(crate) peers: usize,
    pub(crate) free_packets: usize,
    pub(crate) total_packets: usize,
}

/// Point-in-time copy of the runtime counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Packets read, indexed by type (DATA first, VERSION last).
    pub packets_read: [u64; PACKET_TYPE_COUNT],
    /// Packets sent, indexed like `packets_read`.
    pub packets_sent: [u64; PACKET_TYPE_COUNT],
    /// Data packets accepted for a call.
    pub data_packets_read: u64,
    /// Ack packets processed.
    pub ack_packets_read: u64,
    /// Duplicate data packets.
    pub dup_packets_read: u64,
    /// Packets for unknown or stale calls.
    pub spurious_packets_read: u64,
    /// Datagrams that failed to parse.
    pub bogus_packets_read: u64,
    /// Packets dropped for lack of buffers on receive.
    pub no_buffers_on_read: u64,
    /// Control packets not sent for lack of buffers.
    pub no_buffers_on_send: u64,
    /// Data packets sent for the first time.
    pub data_packets_sent: u64,
    /// Data packets retransmitted.
    pub data_packets_resent: u64,
    /// Data packets pulled forward by a negative ack.
    pub data_packets_pushed: u64,
    /// Ack packets sent.
    pub ack_packets_sent: u64,
    /// BUSY packets sent.
    pub busy_packets_sent: u64,
    /// Socket send failures.
    pub send_errors: u64,
    /// RTT samples taken.
    pub rtt_samples: u64,
    /// Sum of all RTT samples.
    pub rtt_total: Duration,
    /// Smallest RTT sample.
    pub rtt_min: Option<Duration>,
    /// Largest RTT sample.
    pub rtt_max: Duration,
    /// Client connections created.
    pub client_conns_created: u64,
    /// Server connections created.
    pub server_conns_created: u64,
    /// Calls created.
    pub calls_created: u64,
    /// Calls freed.
    pub calls_freed: u64,
    /// Connection-fatal errors.
    pub fatal_errors: u64,
    /// Live connections.
    pub connections: usize,
    /// Live peers.
    pub peers: usize,
    /// Free packets in the pool.
    pub free_packets: usize,
    /// Packets in the pool.
    pub total_packets: usize,
}

impl StatsSnapshot {
    /// Packets read of one type.
    pub fn read_of(&self, packet_type: PacketType) -> u64 {
        self.packets_read[packet_type.stat_index()]
    }

    /// Packets sent of one type.
    pub fn sent_of(&self, packet_type: PacketType) -> u64 {
        self.packets_sent[packet_type.stat_index()]
    }

    /// Words answered to a DEBUG stats query, in wire order.
    pub(crate) fn debug_words(&self) -> Vec<u32> {
        let clamp = |v: u64| u32::try_from(v).unwrap_or(u32::MAX);
        let clamp_usize = |v: usize| u32::try_from(v).unwrap_or(u32::MAX);
        vec![
            DEBUG_GET_STATS,
            clamp_usize(self.free_packets),
            clamp_usize(self.total_packets),
            clamp_usize(self.connections),
            clamp_usize(self.peers),
            clamp(self.calls_created),
            clamp(self.data_packets_read),
            clamp(self.data_packets_sent),
            clamp(self.data_packets_resent),
            clamp(self.no_buffers_on_read),
        ]
    }
}
