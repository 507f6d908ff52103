//! Sending.
//!
//! Data packets are protected once when they are queued and then
//! (re)transmitted by [`start_transmission`](RuntimeInner::start_transmission)
//! until an ack releases them. Every other packet type goes out through
//! [`send_special`](RuntimeInner::send_special).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::core::constants::*;
use crate::core::lock;
use crate::security::SecurityError;
use crate::transport::{AckPacket, AckReason, Header, Packet, PacketClass, PacketFlags, PacketType};

use super::call::{Call, CallInner};
use super::connection::Connection;
use super::peer::Peer;
use super::runtime::{RuntimeInner, Task};
use super::stats::bump;

/// Header for a packet of `conn`'s call on `channel`.
pub(crate) fn call_header(
    conn: &Connection,
    channel: usize,
    call_number: u32,
    packet_type: PacketType,
) -> Header {
    let mut header = Header::new(packet_type);
    header.epoch = conn.epoch();
    header.cid = conn.cid() | (channel as u32 & CHANNEL_MASK);
    header.call_number = call_number;
    header.security_index = conn.security_index();
    header.service_id = conn.service_id();
    if conn.is_client() {
        header.flags.insert(PacketFlags::CLIENT_INITIATED);
    }
    header
}

/// Extra retransmit delay for a backoff counter.
fn backoff_delay(backoff: u32) -> Duration {
    Duration::from_millis(u64::from(backoff) << 8)
}

/// Take one packet from the peer's burst budget. Always succeeds when
/// burst control is off.
fn take_burst(peer: &Peer) -> bool {
    let mut state = lock(&peer.state);
    if state.burst_size == 0 {
        return true;
    }
    if state.burst == 0 {
        return false;
    }
    state.burst -= 1;
    true
}

pub(crate) fn security_code(err: SecurityError) -> i32 {
    match err {
        SecurityError::Fatal(code) if code != 0 => code,
        _ => RX_PROTOCOL_ERROR,
    }
}

impl RuntimeInner {
    /// Encode `packet` and hand it to the transport.
    pub(crate) fn send_to_addr(&self, packet: &Packet, addr: SocketAddr) {
        let mut wire = Vec::new();
        packet.encode(&mut wire);
        self.stats.packet_sent(packet.header.packet_type);
        trace!(
            %addr,
            packet_type = ?packet.header.packet_type,
            call_number = packet.header.call_number,
            seq = packet.header.seq,
            serial = packet.header.serial,
            flags = packet.header.flags.as_byte(),
            len = packet.len(),
            "send"
        );
        if let Err(err) = self.transport.send_to(&wire, addr) {
            bump(&self.stats.send_errors);
            warn!(%addr, %err, "datagram send failed");
        }
    }

    /// Stamp the next connection serial on `packet` and send it to the
    /// connection's peer. Returns the serial used.
    pub(crate) fn transmit(&self, conn: &Connection, packet: &mut Packet) -> u32 {
        let now = self.clock.now();
        let (serial, addr) = {
            let mut inner = lock(&conn.inner);
            let serial = inner.serial;
            inner.serial = inner.serial.wrapping_add(1).max(1);
            inner.last_send_time = now;
            (serial, inner.peer.addr())
        };
        packet.header.serial = serial;
        self.send_to_addr(packet, addr);
        serial
    }

    /// Protect and send a control packet.
    pub(crate) fn send_special(&self, conn: &Connection, packet: &mut Packet) {
        if let Err(err) = conn.with_security(|security, view| security.prepare_outgoing(view, packet)) {
            warn!(
                cid = format_args!("{:#x}", conn.cid()),
                packet_type = ?packet.header.packet_type,
                ?err,
                "security refused control packet"
            );
            return;
        }
        self.transmit(conn, packet);
    }

    /// Allocate a control packet carrying `header`.
    pub(crate) fn special_packet(&self, header: Header) -> Option<Packet> {
        match self.pool.allocate(PacketClass::Special) {
            Ok(mut packet) => {
                packet.header = header;
                Some(packet)
            }
            Err(_) => {
                bump(&self.stats.no_buffers_on_send);
                trace!(packet_type = ?header.packet_type, "no buffer for control packet");
                None
            }
        }
    }

    /// Assign the next sequence number to a filled data packet, protect
    /// it and start sending it.
    pub(crate) fn queue_packet(&self, call: &Arc<Call>, c: &mut CallInner, mut packet: Packet, last: bool) {
        self.clock.invalidate();
        let call_number = lock(&call.conn.inner).call_numbers[call.channel];
        packet.header = call_header(&call.conn, call.channel, call_number, PacketType::Data);
        packet.header.seq = c.tnext;
        packet.header.user_status = c.local_status;
        if last {
            packet.header.flags.insert(PacketFlags::LAST_PACKET);
        }
        c.tnext += 1;

        if let Err(err) = call
            .conn
            .with_security(|security, view| security.prepare_outgoing(view, &mut packet))
        {
            self.call_error(call, c, security_code(err));
            return;
        }

        packet.reset_transmit_state();
        c.tq.push_back(packet);
        // The data itself acknowledges whatever we received.
        self.cancel_event(&mut c.delayed_ack_event);
        if !c.congested {
            self.start_transmission(call, c);
        }
    }

    /// Send every queued packet that is inside the window and either new or
    /// due for retransmission, then re-arm the resend timer.
    pub(crate) fn start_transmission(&self, call: &Arc<Call>, c: &mut CallInner) {
        if c.error != 0 || c.tq.is_empty() {
            self.cancel_event(&mut c.resend_event);
            return;
        }

        let now = self.clock.now();
        let peer = call.conn.peer();
        let (timeout, rtt_known) = {
            let state = lock(&peer.state);
            (state.rtt.timeout(), state.rtt.has_sample())
        };
        let first_call = lock(&call.conn.inner).call_numbers[call.channel] == 1;
        let window_end = c.tfirst.saturating_add(c.twind);
        c.flags.wait_window_send = false;

        let mut chosen: Vec<(usize, bool)> = Vec::new();
        let mut congested = false;
        for (index, packet) in c.tq.iter_mut().enumerate() {
            if packet.seq() >= window_end {
                c.flags.wait_window_send = true;
                break;
            }
            let resend = match packet.time_sent {
                None => false,
                Some(sent) => {
                    if packet.retry_time.is_some_and(|retry| now < retry) {
                        continue;
                    }
                    if !packet.fast_retry && now < sent + timeout {
                        packet.retry_time = Some(sent + timeout);
                        continue;
                    }
                    true
                }
            };
            if !take_burst(&peer) {
                congested = true;
                break;
            }
            if resend {
                if !packet.fast_retry {
                    lock(&peer.state).rtt.dubious_timeout();
                }
                packet.fast_retry = false;
                packet.backoff = (packet.backoff * 2 + 1).min(MAX_BACKOFF);
                packet.retry_time = Some(now + timeout + backoff_delay(packet.backoff));
            } else {
                packet.first_sent = Some(now);
                packet.retry_time = Some(now + timeout);
            }
            chosen.push((index, resend));
        }

        let count = chosen.len();
        let mut resent = 0u64;
        for (n, &(index, resend)) in chosen.iter().enumerate() {
            let Some(packet) = c.tq.get_mut(index) else {
                continue;
            };
            let flags = &mut packet.header.flags;
            flags.retain(FLAG_PRESET);
            // Seq 1 asks for an ack on a channel's first call, and on any
            // call while the peer has no RTT sample yet.
            if resend || (packet.header.seq == 1 && (first_call || !rtt_known)) {
                flags.insert(PacketFlags::REQUEST_ACK);
            }
            if n + 1 < count {
                flags.insert(PacketFlags::MORE_PACKETS);
            } else if !flags.is_last_packet() {
                if packet.header.seq & 1 == 1 {
                    flags.insert(PacketFlags::REQUEST_ACK);
                }
            } else if !call.conn.is_client() {
                // The client delays its ack of our last packet.
                packet.retry_time = packet.retry_time.map(|retry| retry + self.config.last_ack_delay);
            }

            let serial = self.transmit(&call.conn, packet);
            packet.time_sent = Some(now);
            if packet.first_serial == 0 {
                packet.first_serial = serial;
            }
            if resend {
                resent += 1;
                bump(&self.stats.data_packets_resent);
            } else {
                bump(&self.stats.data_packets_sent);
            }
        }

        if count > 0 {
            c.last_send_time = now;
            let mut state = lock(&peer.state);
            state.n_sent += count as u64;
            state.resends += resent;
        }

        if congested {
            self.congestion_wait(call, c, &peer);
            return;
        }
        self.schedule_resend(call, c, window_end);
    }

    /// Park a call until the peer's burst budget is restored.
    fn congestion_wait(&self, call: &Arc<Call>, c: &mut CallInner, peer: &Arc<Peer>) {
        let mut state = lock(&peer.state);
        if !c.congested {
            c.congested = true;
            state.congestion_queue.push_back(Arc::clone(call));
        }
        if state.decongest_pending {
            return;
        }
        state.decongest_pending = true;
        let at = self.clock.now() + state.burst_wait;
        let count = state.burst_size;
        drop(state);
        trace!(peer = %peer.addr(), "burst exhausted, transmission paused");
        self.post_event(at, Task::Decongest(Arc::clone(peer), count));
    }

    /// Restore `count` packets of burst budget and restart every call
    /// waiting on it.
    pub(crate) fn decongest(&self, peer: &Arc<Peer>, count: u32) {
        let waiting = {
            let mut state = lock(&peer.state);
            state.decongest_pending = false;
            state.burst = state.burst.saturating_add(count).min(state.burst_size);
            std::mem::take(&mut state.congestion_queue)
        };
        for call in waiting {
            let mut c = lock(&call.inner);
            c.congested = false;
            self.start_transmission(&call, &mut c);
        }
    }

    /// Keep the resend timer at the earliest retry time of a sent packet.
    fn schedule_resend(&self, call: &Arc<Call>, c: &mut CallInner, window_end: u32) {
        let next = c
            .tq
            .iter()
            .take_while(|packet| packet.seq() < window_end)
            .filter(|packet| packet.time_sent.is_some())
            .filter_map(|packet| packet.retry_time)
            .min();
        let Some(at) = next else {
            self.cancel_event(&mut c.resend_event);
            return;
        };
        if let Some(handle) = c.resend_event {
            if handle.time() <= at && self.event_pending(&handle) {
                return;
            }
        }
        self.cancel_event(&mut c.resend_event);
        c.resend_event = Some(self.post_event(at, Task::Resend(Arc::clone(call))));
    }

    /// Acknowledge the receive queue.
    ///
    /// `serial` is the serial of the packet that provoked the ack; without
    /// one the highest serial received is reported.
    pub(crate) fn send_ack(&self, call: &Arc<Call>, c: &mut CallInner, serial: Option<u32>, reason: AckReason) {
        let (call_number, max_serial, peer) = {
            let inner = lock(&call.conn.inner);
            (inner.call_numbers[call.channel], inner.max_serial, Arc::clone(&inner.peer))
        };
        let in_skew = lock(&peer.state).in_packet_skew;

        let first = c.rnext;
        let mut acks = Vec::new();
        let mut expected = first;
        for packet in c.rq.iter().filter(|packet| packet.seq() >= first) {
            while expected < packet.seq() && acks.len() < MAX_ACKS {
                acks.push(false);
                expected += 1;
            }
            if acks.len() >= MAX_ACKS {
                break;
            }
            acks.push(true);
            expected = packet.seq() + 1;
        }

        let body = AckPacket {
            buffer_space: u16::try_from(self.pool.free_count()).unwrap_or(u16::MAX),
            max_skew: u16::try_from(in_skew).unwrap_or(u16::MAX),
            first_packet: first,
            previous_packet: c.rprev,
            serial: serial.unwrap_or(max_serial),
            reason,
            acks,
            max_receive_size: Some(u32::try_from(self.config.max_receive_size).unwrap_or(u32::MAX)),
        };

        let mut header = call_header(&call.conn, call.channel, call_number, PacketType::Ack);
        header.user_status = c.local_status;
        if reason == AckReason::Ping {
            header.flags.insert(PacketFlags::REQUEST_ACK);
        }
        let Some(mut packet) = self.special_packet(header) else {
            return;
        };
        if let Err(err) = body.encode_into(&mut packet) {
            warn!(%err, "cannot encode ack");
            return;
        }

        c.n_soft_acks = 0;
        self.cancel_event(&mut c.delayed_ack_event);
        trace!(
            channel = call.channel,
            call_number,
            first,
            n_acks = body.acks.len(),
            ?reason,
            "ack"
        );
        self.send_special(&call.conn, &mut packet);
        c.last_send_time = self.clock.now();
        bump(&self.stats.ack_packets_sent);
    }

    /// Make sure an ack goes out within `delay`, keeping an earlier pending
    /// one.
    pub(crate) fn delay_ack(&self, call: &Arc<Call>, c: &mut CallInner, delay: Duration) {
        let at = self.clock.now() + delay;
        if let Some(handle) = c.delayed_ack_event {
            if handle.time() <= at && self.event_pending(&handle) {
                return;
            }
        }
        self.cancel_event(&mut c.delayed_ack_event);
        c.delayed_ack_event = Some(self.post_event(at, Task::DelayedAck(Arc::clone(call))));
    }

    /// Tell the peer the call failed with its current error.
    pub(crate) fn send_call_abort(&self, call: &Arc<Call>, c: &mut CallInner) {
        if c.error == 0 {
            return;
        }
        let call_number = lock(&call.conn.inner).call_numbers[call.channel];
        let header = call_header(&call.conn, call.channel, call_number, PacketType::Abort);
        let Some(mut packet) = self.special_packet(header) else {
            return;
        };
        packet.append(&c.error.to_be_bytes());
        debug!(channel = call.channel, call_number, code = c.error, "sending call abort");
        self.send_special(&call.conn, &mut packet);
        c.last_send_time = self.clock.now();
    }

    /// Tell the peer the whole connection failed.
    pub(crate) fn send_connection_abort(&self, conn: &Connection) {
        let error = conn.error();
        if error == 0 {
            return;
        }
        let header = call_header(conn, 0, 0, PacketType::Abort);
        let Some(mut packet) = self.special_packet(header) else {
            return;
        };
        packet.append(&error.to_be_bytes());
        debug!(cid = format_args!("{:#x}", conn.cid()), code = error, "sending connection abort");
        self.send_special(conn, &mut packet);
    }

    /// Refuse a new call on a channel that is still busy.
    pub(crate) fn send_busy(&self, conn: &Connection, channel: usize, call_number: u32) {
        let header = call_header(conn, channel, call_number, PacketType::Busy);
        if let Some(mut packet) = self.special_packet(header) {
            self.send_special(conn, &mut packet);
            bump(&self.stats.busy_packets_sent);
        }
    }

    /// Acknowledge everything received on the call at once.
    pub(crate) fn send_ack_all(&self, call: &Arc<Call>, c: &mut CallInner) {
        let call_number = lock(&call.conn.inner).call_numbers[call.channel];
        let mut header = call_header(&call.conn, call.channel, call_number, PacketType::AckAll);
        header.user_status = c.local_status;
        if let Some(mut packet) = self.special_packet(header) {
            self.send_special(&call.conn, &mut packet);
        }
    }
}
