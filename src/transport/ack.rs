//! Acknowledgement packet body.
//!
//! Wire format (after the common header):
//! ```text
//! bufferSpace:u16 maxSkew:u16 firstPacket:u32 previousPacket:u32
//! serial:u32 reason:u8 nAcks:u8 acks[nAcks]:u8 pad[3]
//! [maxReceiveSize:u32]
//! ```

use crate::core::PacketError;
use crate::core::constants::*;

use super::packet::Packet;

/// Why an ack was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AckReason {
    /// Peer asked for it.
    Requested = ACK_REQUESTED,
    /// Duplicate data packet.
    Duplicate = ACK_DUPLICATE,
    /// Data packet out of sequence.
    OutOfSequence = ACK_OUT_OF_SEQUENCE,
    /// Data packet beyond the window.
    ExceedsWindow = ACK_EXCEEDS_WINDOW,
    /// No buffer space.
    NoSpace = ACK_NOSPACE,
    /// Keep-alive ping.
    Ping = ACK_PING,
    /// Keep-alive answer.
    PingResponse = ACK_PING_RESPONSE,
    /// Delayed ack timer fired.
    Delay = ACK_DELAY,
    /// Unsolicited ack.
    Idle = ACK_IDLE,
}

impl AckReason {
    /// Parse from a byte; unknown reasons read as `Idle`.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            ACK_REQUESTED => Self::Requested,
            ACK_DUPLICATE => Self::Duplicate,
            ACK_OUT_OF_SEQUENCE => Self::OutOfSequence,
            ACK_EXCEEDS_WINDOW => Self::ExceedsWindow,
            ACK_NOSPACE => Self::NoSpace,
            ACK_PING => Self::Ping,
            ACK_PING_RESPONSE => Self::PingResponse,
            ACK_DELAY => Self::Delay,
            _ => Self::Idle,
        }
    }

    /// Byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Decoded ack body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    /// Receive buffers the peer has free.
    pub buffer_space: u16,
    /// Largest serial reordering the peer has seen.
    pub max_skew: u16,
    /// First sequence number not yet received in order.
    pub first_packet: u32,
    /// Sequence number of the packet that triggered this ack.
    pub previous_packet: u32,
    /// Serial of the packet that triggered this ack.
    pub serial: u32,
    /// Why the ack was sent.
    pub reason: AckReason,
    /// Receipt state of `first_packet + i`; `true` is ACK, `false` is NACK.
    pub acks: Vec<bool>,
    /// Largest datagram the peer accepts, if advertised.
    pub max_receive_size: Option<u32>,
}

impl AckPacket {
    /// Encoded body length.
    pub fn encoded_len(&self) -> usize {
        ACK_BODY_SIZE
            + self.acks.len()
            + ACK_PAD_SIZE
            + if self.max_receive_size.is_some() { 4 } else { 0 }
    }

    /// Encode as the payload of `packet`.
    pub fn encode_into(&self, packet: &mut Packet) -> Result<(), PacketError> {
        let n_acks = self.acks.len().min(MAX_ACKS);
        let mut body = Vec::with_capacity(self.encoded_len());
        body.extend_from_slice(&self.buffer_space.to_be_bytes());
        body.extend_from_slice(&self.max_skew.to_be_bytes());
        body.extend_from_slice(&self.first_packet.to_be_bytes());
        body.extend_from_slice(&self.previous_packet.to_be_bytes());
        body.extend_from_slice(&self.serial.to_be_bytes());
        body.push(self.reason.as_byte());
        body.push(n_acks as u8);
        body.extend(self.acks[..n_acks].iter().map(|&acked| u8::from(acked)));
        body.extend_from_slice(&[0u8; ACK_PAD_SIZE]);
        if let Some(size) = self.max_receive_size {
            body.extend_from_slice(&size.to_be_bytes());
        }

        if body.len() > packet.capacity() {
            return Err(PacketError::FragmentCeiling(body.len()));
        }
        packet.set_len(0)?;
        packet.append(&body);
        Ok(())
    }

    /// Decode from the payload of `packet`.
    pub fn decode(packet: &Packet) -> Result<Self, PacketError> {
        let body = packet.payload();
        if body.len() < ACK_BODY_SIZE {
            return Err(PacketError::TooShort {
                expected: ACK_BODY_SIZE,
                actual: body.len(),
            });
        }
        let u16_at = |i: usize| u16::from_be_bytes([body[i], body[i + 1]]);
        let u32_at = |i: usize| u32::from_be_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);

        let n_acks = body[17] as usize;
        let acks_end = ACK_BODY_SIZE + n_acks;
        if body.len() < acks_end {
            return Err(PacketError::TooShort {
                expected: acks_end,
                actual: body.len(),
            });
        }
        let acks = body[ACK_BODY_SIZE..acks_end].iter().map(|&b| b != 0).collect();

        let trailer = acks_end + ACK_PAD_SIZE;
        let max_receive_size = (body.len() >= trailer + 4).then(|| u32_at(trailer));

        Ok(Self {
            buffer_space: u16_at(0),
            max_skew: u16_at(2),
            first_packet: u32_at(4),
            previous_packet: u32_at(8),
            serial: u32_at(12),
            reason: AckReason::from_byte(body[16]),
            acks,
            max_receive_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AckPacket {
        AckPacket {
            buffer_space: 0,
            max_skew: 1,
            first_packet: 5,
            previous_packet: 7,
            serial: 12,
            reason: AckReason::Requested,
            acks: vec![true, false, true],
            max_receive_size: Some(MAX_PACKET_SIZE as u32),
        }
    }

    #[test]
    fn test_ack_wire_layout() {
        let mut packet = Packet::standalone();
        sample().encode_into(&mut packet).unwrap();
        let body = packet.payload();
        assert_eq!(body.len(), ACK_BODY_SIZE + 3 + ACK_PAD_SIZE + 4);
        assert_eq!(&body[4..8], &5u32.to_be_bytes());
        assert_eq!(body[16], ACK_REQUESTED);
        assert_eq!(body[17], 3);
        assert_eq!(&body[18..21], &[1, 0, 1]);
    }

    #[test]
    fn test_ack_decode() {
        let mut packet = Packet::standalone();
        sample().encode_into(&mut packet).unwrap();
        assert_eq!(AckPacket::decode(&packet).unwrap(), sample());
    }

    #[test]
    fn test_ack_without_trailer() {
        let mut ack = sample();
        ack.max_receive_size = None;
        let mut packet = Packet::standalone();
        ack.encode_into(&mut packet).unwrap();
        assert_eq!(AckPacket::decode(&packet).unwrap().max_receive_size, None);
    }

    #[test]
    fn test_truncated_ack_vector() {
        let mut packet = Packet::standalone();
        sample().encode_into(&mut packet).unwrap();
        packet.set_len(ACK_BODY_SIZE + 1).unwrap();
        assert!(matches!(AckPacket::decode(&packet), Err(PacketError::TooShort { .. })));
    }

    #[test]
    fn test_unknown_reason() {
        assert_eq!(AckReason::from_byte(200), AckReason::Idle);
        assert_eq!(AckReason::from_byte(ACK_PING), AckReason::Ping);
    }
}
