//! Protocol constants for the Rx transport.
//!
//! Wire values are fixed by the protocol and MUST NOT be changed. Timing
//! values are defaults; most of them can be overridden through
//! [`RxConfig`](super::RxConfig).

use std::time::Duration;

// =============================================================================
// WIRE HEADER
// =============================================================================

/// Fixed packet header size in bytes.
pub const HEADER_SIZE: usize = 28;

/// Maximum number of concurrent calls on one connection.
pub const MAX_CALLS: usize = 4;

/// Mask selecting the channel bits of a connection id.
pub const CHANNEL_MASK: u32 = (MAX_CALLS as u32) - 1;

/// Shift between consecutive connection ids.
pub const CID_SHIFT: u32 = 2;

/// Mask selecting the connection bits of a connection id.
pub const CID_MASK: u32 = !CHANNEL_MASK;

// =============================================================================
// PACKET TYPES
// =============================================================================

/// Data packet.
pub const PACKET_TYPE_DATA: u8 = 1;

/// Acknowledgement packet.
pub const PACKET_TYPE_ACK: u8 = 2;

/// Server busy, channel still occupied.
pub const PACKET_TYPE_BUSY: u8 = 3;

/// Call or connection abort.
pub const PACKET_TYPE_ABORT: u8 = 4;

/// Acknowledge every outstanding packet of a call.
pub const PACKET_TYPE_ACKALL: u8 = 5;

/// Security challenge, server to client.
pub const PACKET_TYPE_CHALLENGE: u8 = 6;

/// Security response, client to server.
pub const PACKET_TYPE_RESPONSE: u8 = 7;

/// Administrative debug query.
pub const PACKET_TYPE_DEBUG: u8 = 8;

/// Connection parameter negotiation (ignored).
pub const PACKET_TYPE_PARAMS: u8 = 9;

/// Version query.
pub const PACKET_TYPE_VERSION: u8 = 13;

// =============================================================================
// HEADER FLAGS
// =============================================================================

/// Packet was sent by the client side of the connection.
pub const FLAG_CLIENT_INITIATED: u8 = 0x01;

/// Sender asks for an explicit acknowledgement.
pub const FLAG_REQUEST_ACK: u8 = 0x02;

/// Last data packet of a call direction.
pub const FLAG_LAST_PACKET: u8 = 0x04;

/// More data packets follow immediately.
pub const FLAG_MORE_PACKETS: u8 = 0x08;

/// Sender is doing its own slow start.
pub const FLAG_SLOW_START_OK: u8 = 0x20;

/// Flags preserved across retransmissions.
pub const FLAG_PRESET: u8 = FLAG_CLIENT_INITIATED | FLAG_LAST_PACKET;

// =============================================================================
// ACK REASONS
// =============================================================================

/// Peer asked for the ack.
pub const ACK_REQUESTED: u8 = 1;

/// Duplicate packet received.
pub const ACK_DUPLICATE: u8 = 2;

/// Packet received out of sequence.
pub const ACK_OUT_OF_SEQUENCE: u8 = 3;

/// Packet beyond the receive window.
pub const ACK_EXCEEDS_WINDOW: u8 = 4;

/// No buffer space at the receiver.
pub const ACK_NOSPACE: u8 = 5;

/// Keep-alive ping, peer must answer.
pub const ACK_PING: u8 = 6;

/// Answer to a keep-alive ping.
pub const ACK_PING_RESPONSE: u8 = 7;

/// Delayed acknowledgement.
pub const ACK_DELAY: u8 = 8;

/// Unsolicited acknowledgement from an idle receiver.
pub const ACK_IDLE: u8 = 9;

/// Fixed part of an ack body, before the ack vector.
pub const ACK_BODY_SIZE: usize = 18;

/// Padding between the ack vector and the trailer.
pub const ACK_PAD_SIZE: usize = 3;

/// Maximum entries in one ack vector.
pub const MAX_ACKS: usize = 255;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Peer stopped responding.
pub const RX_CALL_DEAD: i32 = -1;

/// Operation not valid in the call's current mode.
pub const RX_INVALID_OPERATION: i32 = -2;

/// Call exceeded its idle or hard time limit.
pub const RX_CALL_TIMEOUT: i32 = -3;

/// End of data.
pub const RX_EOF: i32 = -4;

/// Peer violated the protocol.
pub const RX_PROTOCOL_ERROR: i32 = -5;

/// Call aborted locally.
pub const RX_USER_ABORT: i32 = -6;

/// Local port already in use.
pub const RX_ADDRINUSE: i32 = -7;

/// Unknown debug request type.
pub const RX_DEBUGI_BADTYPE: i32 = -8;

// =============================================================================
// BUFFERS AND QUOTAS
// =============================================================================

/// Payload bytes carried by the inline fragment of every packet.
pub const FIRST_BUFFER_SIZE: usize = 1416;

/// Payload bytes carried by each continuation fragment.
pub const CBUF_SIZE: usize = 1024;

/// Fragment ceiling per packet, inline fragment included.
pub const MAX_FRAGMENTS: usize = 8;

/// Largest payload a packet can ever hold.
pub const MAX_PAYLOAD_SIZE: usize = FIRST_BUFFER_SIZE + (MAX_FRAGMENTS - 1) * CBUF_SIZE;

/// Largest datagram this implementation accepts.
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Packet size every Rx implementation understands.
pub const OLD_MAX_PACKET_SIZE: usize = HEADER_SIZE + FIRST_BUFFER_SIZE;

/// Reserved free packets per class: receive, send, special.
pub const PACKET_QUOTAS: [usize; 3] = [1, 10, 0];

/// Packets reserved for active calls.
pub const MAX_QUOTA: usize = 15;

/// Initial packet pool size.
pub const DEFAULT_PACKETS: usize = 64;

// =============================================================================
// WINDOWS
// =============================================================================

/// Receive window and transmit window ceiling.
pub const DEFAULT_WINDOW: u32 = 15;

/// Transmit window a new call starts with.
pub const INITIAL_WINDOW: u32 = 2;

/// Exponential backoff cap for retransmissions.
pub const MAX_BACKOFF: u32 = 7;

// =============================================================================
// TIMING
// =============================================================================

/// Retransmit timeout before any RTT sample.
pub const INITIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Fixed guard added to every computed retransmit timeout.
pub const TIMEOUT_GUARD: Duration = Duration::from_millis(100);

/// Delay before acknowledging the last packet of a call.
pub const LAST_ACK_DELAY: Duration = Duration::from_millis(400);

/// Delay before acknowledging the end of a burst.
pub const SOFT_ACK_DELAY: Duration = Duration::from_millis(100);

/// Interval between repeated security challenges.
pub const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between reaper passes.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Server connection idle lifetime.
pub const IDLE_CONNECTION_TIME: Duration = Duration::from_secs(700);

/// Peer idle lifetime once unreferenced.
pub const IDLE_PEER_TIME: Duration = Duration::from_secs(60);

/// Seconds without traffic before a call is declared dead.
pub const DEFAULT_CONN_DEAD_TIME: u32 = 12;

/// Seconds a server call may wait for its request.
pub const DEFAULT_IDLE_DEAD_TIME: u32 = 60;

/// Delay before a burst budget is restored.
pub const DEFAULT_BURST_WAIT: Duration = Duration::from_millis(100);

// =============================================================================
// ADMINISTRATIVE CHANNEL
// =============================================================================

/// Size of the version string answered to VERSION packets.
pub const VERSION_STRING_SIZE: usize = 65;

/// Debug request: runtime statistics.
pub const DEBUG_GET_STATS: u32 = 1;
