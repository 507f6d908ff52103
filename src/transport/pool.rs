//! Packet buffer pool.
//!
//! Packets are handed out as owned [`Packet`] values and return to the pool
//! when dropped, so a buffer can never be touched after release. Each
//! allocation class keeps a reserve of free packets that other classes may
//! not dip into.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::trace;

use crate::core::constants::*;
use crate::core::{PacketError, PoolError, lock};

use super::packet::Packet;

/// What a packet is allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketClass {
    /// Incoming datagrams.
    Receive,
    /// Outgoing call data.
    Send,
    /// Acks, aborts, challenges and other control packets.
    Special,
}

impl PacketClass {
    fn index(self) -> usize {
        match self {
            Self::Receive => 0,
            Self::Send => 1,
            Self::Special => 2,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    free_packets: Vec<Box<[u8]>>,
    free_cbufs: Vec<Box<[u8]>>,
    total_packets: usize,
    quotas: [usize; 3],
    data_quota: usize,
    refusals: [u64; 3],
}

impl PoolState {
    fn over_quota(&self, class: PacketClass) -> bool {
        self.free_packets.len() < self.quotas[class.index()] + 1
    }
}

#[derive(Debug)]
pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    available: Notify,
}

impl PoolShared {
    pub(crate) fn give_back(&self, fragments: Vec<Box<[u8]>>) {
        let mut state = lock(&self.state);
        let mut fragments = fragments.into_iter();
        if let Some(inline) = fragments.next() {
            state.free_packets.push(inline);
        }
        state.free_cbufs.extend(fragments);
        drop(state);
        self.available.notify_one();
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Packets currently free.
    pub free: usize,
    /// Packets ever allocated into the pool.
    pub total: usize,
    /// Continuation buffers currently free.
    pub free_cbufs: usize,
    /// Refused allocations per class (receive, send, special).
    pub refusals: [u64; 3],
}

/// Shared packet pool.
#[derive(Debug, Clone)]
pub struct PacketPool {
    shared: Arc<PoolShared>,
}

impl PacketPool {
    /// Create a pool of `packets` packets with per-class reserves.
    pub fn new(packets: usize, quotas: [usize; 3], data_quota: usize) -> Self {
        let pool = Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    free_packets: Vec::with_capacity(packets),
                    free_cbufs: Vec::with_capacity(packets),
                    total_packets: 0,
                    quotas,
                    data_quota,
                    refusals: [0; 3],
                }),
                available: Notify::new(),
            }),
        };
        pool.add_packets(packets);
        pool
    }

    /// Grow the pool by `count` packets and as many continuation buffers.
    pub fn add_packets(&self, count: usize) {
        let mut state = lock(&self.shared.state);
        for _ in 0..count {
            state.free_packets.push(vec![0u8; FIRST_BUFFER_SIZE].into_boxed_slice());
            state.free_cbufs.push(vec![0u8; CBUF_SIZE].into_boxed_slice());
        }
        state.total_packets += count;
        drop(state);
        self.shared.available.notify_waiters();
    }

    /// Grow the pool and the data quota together, for a new worker.
    pub fn reserve(&self, count: usize) {
        lock(&self.shared.state).data_quota += count;
        self.add_packets(count);
    }

    /// Take a packet for `class`, refusing if that would eat into another
    /// class's reserve.
    pub fn allocate(&self, class: PacketClass) -> Result<Packet, PoolError> {
        let mut state = lock(&self.shared.state);
        if state.over_quota(class) {
            state.refusals[class.index()] += 1;
            trace!(?class, free = state.free_packets.len(), "packet pool refused allocation");
            return Err(PoolError::Exhausted);
        }
        let inline = state.free_packets.pop().ok_or(PoolError::Exhausted)?;
        drop(state);
        Ok(Packet::from_parts(inline, Some(Arc::clone(&self.shared))))
    }

    /// Take a packet for `class`, waiting for a release if none is free.
    pub async fn allocate_wait(&self, class: PacketClass) -> Packet {
        loop {
            if let Ok(packet) = self.allocate(class) {
                return packet;
            }
            self.shared.available.notified().await;
        }
    }

    /// Attach continuation fragments until `packet` can hold `n_bytes` of
    /// payload. Returns the new capacity.
    ///
    /// Asking for more than the fragment ceiling allows is a sizing bug in
    /// the caller and is reported as [`PacketError::FragmentCeiling`].
    pub fn grow_data(&self, packet: &mut Packet, n_bytes: usize) -> Result<usize, PacketError> {
        if n_bytes > MAX_PAYLOAD_SIZE {
            return Err(PacketError::FragmentCeiling(n_bytes));
        }
        let mut capacity = packet.capacity();
        if capacity >= n_bytes {
            return Ok(capacity);
        }
        let mut state = lock(&self.shared.state);
        while capacity < n_bytes && packet.fragment_count() < MAX_FRAGMENTS {
            let cbuf = state
                .free_cbufs
                .pop()
                .unwrap_or_else(|| vec![0u8; CBUF_SIZE].into_boxed_slice());
            capacity += cbuf.len();
            packet.push_fragment(cbuf);
        }
        Ok(capacity)
    }

    /// Return a packet to the pool.
    pub fn release(&self, packet: Packet) {
        drop(packet);
    }

    /// Whether an allocation for `class` would be refused right now.
    pub fn over_quota(&self, class: PacketClass) -> bool {
        lock(&self.shared.state).over_quota(class)
    }

    /// Whether the pool is below the data quota plus a small margin.
    pub fn too_low(&self) -> bool {
        let state = lock(&self.shared.state);
        state.free_packets.len() < state.data_quota + 2
    }

    /// Free packet count.
    pub fn free_count(&self) -> usize {
        lock(&self.shared.state).free_packets.len()
    }

    /// Snapshot of pool counters.
    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.shared.state);
        PoolStats {
            free: state.free_packets.len(),
            total: state.total_packets,
            free_cbufs: state.free_cbufs.len(),
            refusals: state.refusals,
        }
    }

    /// Wake every task waiting for a packet.
    pub fn wake_waiters(&self) {
        self.shared.available.notify_waiters();
    }
}
