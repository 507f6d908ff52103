//! Packet framing.
//!
//! Wire format (28-byte header, network byte order, then payload):
//! ```text
//! 0        4        8        12       16       20
//! +--------+--------+--------+--------+--------+
//! | epoch  |  cid   | callno |  seq   | serial |
//! +--+--+--+--+-----+--------+--------+--------+
//! |ty|fl|us|si|svc  |spare|  payload ...
//! +--+--+--+--+-----+-----+
//! ```
//!
//! A [`Packet`] owns its payload as an inline fragment plus zero or more
//! continuation fragments. Packets come only from a
//! [`PacketPool`](super::PacketPool) and go back to it when dropped.

use std::fmt;
use std::sync::Arc;

use crate::core::PacketError;
use crate::core::constants::*;

use super::clock::ClockTime;
use super::pool::PoolShared;

/// Packet type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Call data.
    Data = PACKET_TYPE_DATA,
    /// Acknowledgement.
    Ack = PACKET_TYPE_ACK,
    /// Channel still busy with a previous call.
    Busy = PACKET_TYPE_BUSY,
    /// Call or connection abort.
    Abort = PACKET_TYPE_ABORT,
    /// Acknowledge everything.
    AckAll = PACKET_TYPE_ACKALL,
    /// Security challenge.
    Challenge = PACKET_TYPE_CHALLENGE,
    /// Security response.
    Response = PACKET_TYPE_RESPONSE,
    /// Debug query.
    Debug = PACKET_TYPE_DEBUG,
    /// Parameter negotiation.
    Params = PACKET_TYPE_PARAMS,
    /// Version query.
    Version = PACKET_TYPE_VERSION,
}

impl PacketType {
    /// Parse a packet type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            PACKET_TYPE_DATA => Some(Self::Data),
            PACKET_TYPE_ACK => Some(Self::Ack),
            PACKET_TYPE_BUSY => Some(Self::Busy),
            PACKET_TYPE_ABORT => Some(Self::Abort),
            PACKET_TYPE_ACKALL => Some(Self::AckAll),
            PACKET_TYPE_CHALLENGE => Some(Self::Challenge),
            PACKET_TYPE_RESPONSE => Some(Self::Response),
            PACKET_TYPE_DEBUG => Some(Self::Debug),
            PACKET_TYPE_PARAMS => Some(Self::Params),
            PACKET_TYPE_VERSION => Some(Self::Version),
            _ => None,
        }
    }

    /// Byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Index used for per-type statistics.
    pub(crate) fn stat_index(self) -> usize {
        match self {
            Self::Version => 9,
            other => other.as_byte() as usize - 1,
        }
    }
}

/// Header flag bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Sent by the client side of the connection.
    pub const CLIENT_INITIATED: Self = Self(FLAG_CLIENT_INITIATED);
    /// Explicit ack requested.
    pub const REQUEST_ACK: Self = Self(FLAG_REQUEST_ACK);
    /// Last packet of this direction of the call.
    pub const LAST_PACKET: Self = Self(FLAG_LAST_PACKET);
    /// More packets follow immediately.
    pub const MORE_PACKETS: Self = Self(FLAG_MORE_PACKETS);
    /// Sender does its own slow start.
    pub const SLOW_START_OK: Self = Self(FLAG_SLOW_START_OK);

    /// Create flags from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Whether every flag in `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the flags in `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Keep only the flags in `mask`.
    pub fn retain(&mut self, mask: u8) {
        self.0 &= mask;
    }

    /// Copy with the flags in `other` set.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether CLIENT_INITIATED is set.
    pub fn is_client_initiated(self) -> bool {
        self.contains(Self::CLIENT_INITIATED)
    }

    /// Whether REQUEST_ACK is set.
    pub fn is_request_ack(self) -> bool {
        self.contains(Self::REQUEST_ACK)
    }

    /// Whether LAST_PACKET is set.
    pub fn is_last_packet(self) -> bool {
        self.contains(Self::LAST_PACKET)
    }

    /// Whether MORE_PACKETS is set.
    pub fn has_more_packets(self) -> bool {
        self.contains(Self::MORE_PACKETS)
    }

    /// Whether SLOW_START_OK is set.
    pub fn is_slow_start_ok(self) -> bool {
        self.contains(Self::SLOW_START_OK)
    }
}

/// Fixed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Process instance of the connection's client.
    pub epoch: u32,
    /// Connection id; the low two bits are the channel.
    pub cid: u32,
    /// Call number on the channel; zero for connection level packets.
    pub call_number: u32,
    /// Data sequence number within the call.
    pub seq: u32,
    /// Per-connection transmission serial.
    pub serial: u32,
    /// Packet type.
    pub packet_type: PacketType,
    /// Flag bitset.
    pub flags: PacketFlags,
    /// Status byte owned by the application.
    pub user_status: u8,
    /// Security class index of the connection.
    pub security_index: u8,
    /// Service the connection talks to.
    pub service_id: u16,
    /// Unused, carried for alignment.
    pub spare: u16,
}

impl Header {
    /// A zeroed header of the given type.
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            epoch: 0,
            cid: 0,
            call_number: 0,
            seq: 0,
            serial: 0,
            packet_type,
            flags: PacketFlags::NONE,
            user_status: 0,
            security_index: 0,
            service_id: 0,
            spare: 0,
        }
    }

    /// Channel the packet belongs to.
    pub fn channel(&self) -> usize {
        (self.cid & CHANNEL_MASK) as usize
    }

    /// Connection id without the channel bits.
    pub fn conn_id(&self) -> u32 {
        self.cid & CID_MASK
    }

    /// Encode into the first [`HEADER_SIZE`] bytes of `out`.
    pub fn encode(&self, out: &mut [u8; HEADER_SIZE]) {
        out[0..4].copy_from_slice(&self.epoch.to_be_bytes());
        out[4..8].copy_from_slice(&self.cid.to_be_bytes());
        out[8..12].copy_from_slice(&self.call_number.to_be_bytes());
        out[12..16].copy_from_slice(&self.seq.to_be_bytes());
        out[16..20].copy_from_slice(&self.serial.to_be_bytes());
        out[20] = self.packet_type.as_byte();
        out[21] = self.flags.as_byte();
        out[22] = self.user_status;
        out[23] = self.security_index;
        out[24..26].copy_from_slice(&self.service_id.to_be_bytes());
        out[26..28].copy_from_slice(&self.spare.to_be_bytes());
    }

    /// Encode into a fresh array.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        self.encode(&mut out);
        out
    }

    /// Decode from the start of a datagram.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let u32_at = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let u16_at = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);

        let packet_type = PacketType::from_byte(data[20]).ok_or(PacketError::UnknownType(data[20]))?;
        Ok(Self {
            epoch: u32_at(0),
            cid: u32_at(4),
            call_number: u32_at(8),
            seq: u32_at(12),
            serial: u32_at(16),
            packet_type,
            flags: PacketFlags::from_byte(data[21]),
            user_status: data[22],
            security_index: data[23],
            service_id: u16_at(24),
            spare: u16_at(26),
        })
    }
}

/// A pooled packet: header, payload fragments, and transmit bookkeeping.
pub struct Packet {
    /// Packet header.
    pub header: Header,
    fragments: Vec<Box<[u8]>>,
    length: usize,
    /// When the packet is next due for retransmission; unset until first sent.
    pub(crate) retry_time: Option<ClockTime>,
    /// Time of the most recent transmission.
    pub(crate) time_sent: Option<ClockTime>,
    /// Time of the first transmission.
    pub(crate) first_sent: Option<ClockTime>,
    /// Serial of the first transmission.
    pub(crate) first_serial: u32,
    /// Retransmission backoff counter.
    pub(crate) backoff: u32,
    /// A later serial was acked while this one was not: resend without
    /// waiting for the RTT-adjusted deadline.
    pub(crate) fast_retry: bool,
    pool: Option<Arc<PoolShared>>,
}

impl Packet {
    pub(crate) fn from_parts(inline: Box<[u8]>, pool: Option<Arc<PoolShared>>) -> Self {
        Self {
            header: Header::new(PacketType::Data),
            fragments: vec![inline],
            length: 0,
            retry_time: None,
            time_sent: None,
            first_sent: None,
            first_serial: 0,
            backoff: 0,
            fast_retry: false,
            pool,
        }
    }

    /// A packet that does not belong to any pool.
    pub fn standalone() -> Self {
        Self::from_parts(vec![0u8; FIRST_BUFFER_SIZE].into_boxed_slice(), None)
    }

    pub(crate) fn push_fragment(&mut self, fragment: Box<[u8]>) {
        self.fragments.push(fragment);
    }

    pub(crate) fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub(crate) fn take_fragments(&mut self) -> Vec<Box<[u8]>> {
        self.length = 0;
        std::mem::take(&mut self.fragments)
    }

    /// Sequence number shorthand.
    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Payload bytes the current fragments can hold.
    pub fn capacity(&self) -> usize {
        self.fragments.iter().map(|f| f.len()).sum()
    }

    /// Set the payload length.
    pub fn set_len(&mut self, length: usize) -> Result<(), PacketError> {
        if length > self.capacity() {
            return Err(PacketError::FragmentCeiling(length));
        }
        self.length = length;
        Ok(())
    }

    /// Copy `data` into the payload at `offset`, growing the length as
    /// needed. Returns the number of bytes copied, bounded by capacity.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> usize {
        let mut skip = offset;
        let mut copied = 0;
        for fragment in self.fragments.iter_mut() {
            if copied == data.len() {
                break;
            }
            if skip >= fragment.len() {
                skip -= fragment.len();
                continue;
            }
            let n = (fragment.len() - skip).min(data.len() - copied);
            fragment[skip..skip + n].copy_from_slice(&data[copied..copied + n]);
            copied += n;
            skip = 0;
        }
        self.length = self.length.max(offset + copied);
        copied
    }

    /// Append to the payload. Returns the number of bytes copied.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let offset = self.length;
        self.write_at(offset, data)
    }

    /// Copy payload bytes starting at `offset` into `out`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> usize {
        let end = self.length.min(offset.saturating_add(out.len()));
        if offset >= end {
            return 0;
        }
        let mut skip = offset;
        let mut copied = 0;
        let wanted = end - offset;
        for fragment in &self.fragments {
            if copied == wanted {
                break;
            }
            if skip >= fragment.len() {
                skip -= fragment.len();
                continue;
            }
            let n = (fragment.len() - skip).min(wanted - copied);
            out[copied..copied + n].copy_from_slice(&fragment[skip..skip + n]);
            copied += n;
            skip = 0;
        }
        copied
    }

    /// Read a big-endian u32 from the payload.
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let mut word = [0u8; 4];
        (self.read_at(offset, &mut word) == 4).then(|| u32::from_be_bytes(word))
    }

    /// The payload as a contiguous vector.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.length];
        self.read_at(0, &mut out);
        out
    }

    /// Encode header and payload for the wire.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(HEADER_SIZE + self.length);
        out.extend_from_slice(&self.header.to_bytes());
        let mut remaining = self.length;
        for fragment in &self.fragments {
            if remaining == 0 {
                break;
            }
            let n = remaining.min(fragment.len());
            out.extend_from_slice(&fragment[..n]);
            remaining -= n;
        }
    }

    /// Reset transmit bookkeeping, keeping header and payload.
    pub(crate) fn reset_transmit_state(&mut self) {
        self.retry_time = None;
        self.time_sent = None;
        self.first_sent = None;
        self.first_serial = 0;
        self.backoff = 0;
        self.fast_retry = false;
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header)
            .field("length", &self.length)
            .field("fragments", &self.fragments.len())
            .field("retry_time", &self.retry_time)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let fragments = self.take_fragments();
            pool.give_back(fragments);
        }
    }
}
