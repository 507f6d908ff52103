//! Receiving.
//!
//! Every datagram read by the listener goes through
//! [`receive_datagram`](RuntimeInner::receive_datagram): it is matched to a
//! connection and call (creating server ones on demand), run through the
//! connection's security object and then handled by type.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::core::constants::*;
use crate::core::lock;
use crate::security::SecurityError;
use crate::transport::{AckPacket, AckReason, Header, Packet, PacketClass, PacketFlags, PacketType};

use super::call::{Call, CallInner, CallMode, CallState};
use super::connection::{ConnKey, ConnParams, ConnType, Connection};
use super::runtime::{RuntimeInner, Task};
use super::stats::bump;
use super::transmit::{call_header, security_code};

/// Version banner answered to VERSION queries.
const VERSION_BANNER: &str = concat!("rx-protocol ", env!("CARGO_PKG_VERSION"));

fn abort_code(packet: &Packet) -> i32 {
    match packet.read_u32(0).map(|code| code as i32) {
        Some(code) if code != 0 => code,
        _ => RX_PROTOCOL_ERROR,
    }
}

impl RuntimeInner {
    /// Parse one datagram and process it.
    pub(crate) fn receive_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let header = match Header::from_bytes(bytes) {
            Ok(header) => header,
            Err(err) => {
                bump(&self.stats.bogus_packets_read);
                trace!(%from, %err, "bogus datagram");
                return;
            }
        };
        let payload = &bytes[HEADER_SIZE..];
        if payload.len() > MAX_PAYLOAD_SIZE {
            bump(&self.stats.bogus_packets_read);
            trace!(%from, len = payload.len(), "oversized datagram");
            return;
        }

        let mut packet = match self.pool.allocate(PacketClass::Receive) {
            Ok(packet) => packet,
            Err(_) => {
                bump(&self.stats.no_buffers_on_read);
                trace!(%from, "no buffer for incoming datagram");
                return;
            }
        };
        if let Err(err) = self.pool.grow_data(&mut packet, payload.len()) {
            bump(&self.stats.bogus_packets_read);
            trace!(%from, %err, "cannot hold datagram");
            return;
        }
        packet.header = header;
        packet.append(payload);
        self.receive_packet(packet, from);
    }

    /// Process one parsed packet from `from`.
    pub(crate) fn receive_packet(&self, mut packet: Packet, from: SocketAddr) {
        let header = packet.header;
        self.stats.packet_read(header.packet_type);
        trace!(
            %from,
            packet_type = ?header.packet_type,
            cid = format_args!("{:#x}", header.cid),
            call_number = header.call_number,
            seq = header.seq,
            serial = header.serial,
            flags = header.flags.as_byte(),
            len = packet.len(),
            "recv"
        );

        match header.packet_type {
            PacketType::Version => return self.answer_version(packet, from),
            PacketType::Debug => return self.answer_debug(packet, from),
            _ => {}
        }

        let Some(conn) = self.find_connection(&header, from) else {
            bump(&self.stats.spurious_packets_read);
            trace!(%from, cid = format_args!("{:#x}", header.cid), "no connection for packet");
            return;
        };

        let conn_error = {
            let mut inner = lock(&conn.inner);
            inner.max_serial = inner.max_serial.max(header.serial);
            let skew = inner.last_serial.saturating_sub(header.serial);
            inner.last_serial = header.serial;
            if skew > 0 {
                let mut peer = lock(&inner.peer.state);
                peer.in_packet_skew = peer.in_packet_skew.max(skew);
            }
            inner.error
        };
        if conn_error != 0 {
            if header.packet_type != PacketType::Abort {
                self.send_connection_abort(&conn);
            }
            return;
        }

        if header.call_number == 0 {
            match header.packet_type {
                PacketType::Abort => self.connection_error(&conn, abort_code(&packet)),
                PacketType::Challenge => self.receive_challenge(&conn, &packet),
                PacketType::Response => self.receive_response(&conn, &packet),
                PacketType::Params => {}
                _ => {
                    self.connection_error(&conn, RX_PROTOCOL_ERROR);
                    self.send_connection_abort(&conn);
                }
            }
            return;
        }

        let call = match conn.kind() {
            ConnType::Server => self.server_call_for(&conn, &header),
            ConnType::Client => self.client_call_for(&conn, &header),
        };
        let Some(call) = call else {
            bump(&self.stats.spurious_packets_read);
            return;
        };

        let mut c = lock(&call.inner);
        if conn.is_client() {
            match header.packet_type {
                // The reply implicitly acknowledges the whole request.
                PacketType::Data => self.clear_transmit_queue(&call, &mut c),
                PacketType::Ack => {
                    if packet.read_u32(4).is_some_and(|first| first < c.tfirst) {
                        bump(&self.stats.spurious_packets_read);
                        trace!(channel = call.channel, "stale ack");
                        return;
                    }
                }
                _ => {}
            }
        }

        if let Err(err) = conn.with_security(|security, view| security.check_incoming(view, &mut packet)) {
            match err {
                SecurityError::Retry => {
                    trace!(channel = call.channel, "security dropped packet");
                }
                SecurityError::Fatal(_) => {
                    drop(c);
                    warn!(cid = format_args!("{:#x}", conn.cid()), ?err, "security check failed");
                    self.connection_error(&conn, security_code(err));
                    self.send_connection_abort(&conn);
                }
            }
            return;
        }

        c.remote_status = header.user_status;
        c.last_receive_time = self.clock.now();

        match header.packet_type {
            PacketType::Data => self.receive_data_packet(&call, &mut c, packet),
            PacketType::Ack => {
                if header.flags.is_request_ack() {
                    if c.error != 0 {
                        self.send_call_abort(&call, &mut c);
                    } else {
                        self.send_ack(&call, &mut c, Some(header.serial), AckReason::PingResponse);
                    }
                }
                self.receive_ack_packet(&call, &mut c, &packet);
            }
            PacketType::Abort => {
                let code = abort_code(&packet);
                debug!(channel = call.channel, code, "call aborted by peer");
                self.call_error(&call, &mut c, code);
            }
            PacketType::Busy => {}
            PacketType::AckAll => self.clear_transmit_queue(&call, &mut c),
            _ => {
                self.call_error(&call, &mut c, RX_PROTOCOL_ERROR);
                self.send_call_abort(&call, &mut c);
            }
        }
    }

    fn answer_version(&self, mut packet: Packet, from: SocketAddr) {
        if !packet.header.flags.is_client_initiated() {
            return;
        }
        packet.header.flags.remove(PacketFlags::CLIENT_INITIATED);
        let mut banner = [0u8; VERSION_STRING_SIZE];
        let n = VERSION_BANNER.len().min(VERSION_STRING_SIZE - 1);
        banner[..n].copy_from_slice(&VERSION_BANNER.as_bytes()[..n]);
        if packet.set_len(0).is_err() {
            return;
        }
        packet.append(&banner);
        self.send_to_addr(&packet, from);
    }

    fn answer_debug(&self, mut packet: Packet, from: SocketAddr) {
        if !packet.header.flags.is_client_initiated() {
            return;
        }
        let request = packet.read_u32(0);
        packet.header.flags.remove(PacketFlags::CLIENT_INITIATED);
        if packet.set_len(0).is_err() {
            return;
        }
        match request {
            Some(DEBUG_GET_STATS) => {
                let words = self.snapshot().debug_words();
                if self.pool.grow_data(&mut packet, words.len() * 4).is_err() {
                    return;
                }
                for word in words {
                    packet.append(&word.to_be_bytes());
                }
            }
            other => {
                trace!(%from, request = ?other, "unknown debug request");
                packet.append(&RX_DEBUGI_BADTYPE.to_be_bytes());
            }
        }
        self.send_to_addr(&packet, from);
    }

    /// Find the connection a packet belongs to, creating server connections
    /// for known services.
    fn find_connection(&self, header: &Header, from: SocketAddr) -> Option<Arc<Connection>> {
        let kind = if header.flags.is_client_initiated() {
            ConnType::Server
        } else {
            ConnType::Client
        };
        let key = ConnKey::new(header.epoch, header.cid, kind);

        let existing = lock(&self.conns).get(&key).cloned();
        if let Some(conn) = existing {
            if conn.security_index() != header.security_index {
                return None;
            }
            if conn.peer_addr() != from {
                let peer = self.find_peer(from);
                let old = std::mem::replace(&mut lock(&conn.inner).peer, peer);
                debug!(cid = format_args!("{:#x}", conn.cid()), old = %old.addr(), new = %from, "peer moved");
                self.release_peer(&old);
            }
            return Some(conn);
        }

        if kind == ConnType::Client {
            return None;
        }
        let service = lock(&self.services).get(&header.service_id).cloned()?;
        let security = service.security_object(header.security_index)?;
        let peer = self.find_peer(from);
        let conn = Arc::new(Connection::new(
            ConnParams {
                key,
                service_id: header.service_id,
                security_index: header.security_index,
                security,
                service: Some(service),
                peer,
            },
            &self.config,
            self.clock.now(),
        ));
        if let Err(err) = conn.with_security(|security, view| security.new_connection(view)) {
            warn!(%from, ?err, "security refused new connection");
            self.release_peer(&conn.peer());
            return None;
        }

        let conn = {
            let mut conns = lock(&self.conns);
            Arc::clone(conns.entry(key).or_insert(conn))
        };
        bump(&self.stats.server_conns_created);
        debug!(
            %from,
            epoch = key.epoch,
            cid = format_args!("{:#x}", key.cid),
            service_id = header.service_id,
            "new server connection"
        );
        Some(conn)
    }

    /// The server call a client packet is addressed to, starting a new one
    /// on the channel if the call number moved on.
    fn server_call_for(&self, conn: &Arc<Connection>, header: &Header) -> Option<Arc<Call>> {
        let channel = header.channel();
        let (installed, current) = {
            let inner = lock(&conn.inner);
            (inner.calls[channel].clone(), inner.call_numbers[channel])
        };
        if header.call_number < current {
            trace!(channel, call_number = header.call_number, current, "packet for old call");
            return None;
        }

        let Some(call) = installed else {
            // Only the first packet of a call may open it.
            if header.packet_type != PacketType::Data {
                return None;
            }
            let call = Arc::new(Call::new(Arc::clone(conn), channel, &self.config, self.clock.now()));
            {
                let mut c = lock(&call.inner);
                {
                    let mut inner = lock(&conn.inner);
                    if inner.calls[channel].is_some() {
                        return None;
                    }
                    inner.calls[channel] = Some(Arc::clone(&call));
                    inner.call_numbers[channel] = header.call_number;
                }
                self.start_server_call(&call, &mut c);
            }
            bump(&self.stats.calls_created);
            return Some(call);
        };

        if header.call_number == current {
            return Some(call);
        }
        if header.packet_type != PacketType::Data {
            return None;
        }

        let mut c = lock(&call.inner);
        if c.state == CallState::Active {
            // The client gave up on the old call without telling us.
            self.call_error(&call, &mut c, RX_CALL_DEAD);
            drop(c);
            self.send_busy(conn, channel, header.call_number);
            return None;
        }
        self.reset_call(&call, &mut c);
        self.dispatcher.remove(&call);
        lock(&conn.inner).call_numbers[channel] = header.call_number;
        self.start_server_call(&call, &mut c);
        drop(c);
        Some(call)
    }

    fn start_server_call(&self, call: &Arc<Call>, c: &mut CallInner) {
        c.state = CallState::PreCall;
        c.mode = CallMode::Receiving;
        c.start_time = self.clock.now();
        c.last_receive_time = c.start_time;
        self.keepalive_on(call, c);
    }

    /// The client call a server packet answers, if it is still current.
    fn client_call_for(&self, conn: &Arc<Connection>, header: &Header) -> Option<Arc<Call>> {
        let inner = lock(&conn.inner);
        let channel = header.channel();
        let call = inner.calls[channel].clone()?;
        if header.call_number != inner.call_numbers[channel] || header.security_index != conn.security_index() {
            return None;
        }
        Some(call)
    }

    fn receive_data_packet(&self, call: &Arc<Call>, c: &mut CallInner, packet: Packet) {
        bump(&self.stats.data_packets_read);
        if c.error != 0 {
            self.send_call_abort(call, c);
            return;
        }

        let seq = packet.seq();
        let serial = packet.header.serial;
        let flags = packet.header.flags;

        if self.pool.over_quota(PacketClass::Receive)
            || (self.pool.too_low() && !(seq == c.rnext && c.flags.reader_waiting))
        {
            bump(&self.stats.no_buffers_on_read);
            trace!(channel = call.channel, seq, "receive pool low, packet dropped");
            c.rprev = seq;
            self.try_attach(call, c);
            return;
        }

        if seq < c.rnext {
            bump(&self.stats.dup_packets_read);
            c.rprev = seq;
            self.send_ack(call, c, Some(serial), AckReason::Duplicate);
            return;
        }
        if seq >= c.rnext.saturating_add(c.rwind) {
            c.rprev = seq;
            self.send_ack(call, c, Some(serial), AckReason::ExceedsWindow);
            return;
        }
        let position = match c.rq.binary_search_by_key(&seq, Packet::seq) {
            Ok(_) => {
                bump(&self.stats.dup_packets_read);
                c.rprev = seq;
                self.send_ack(call, c, Some(serial), AckReason::Duplicate);
                return;
            }
            Err(position) => position,
        };

        let in_order = seq == c.rnext;
        c.rq.insert(position, packet);
        c.rprev = seq;
        c.n_soft_acks += 1;

        let mut ack_done = false;
        if in_order {
            let mut next = c.rnext;
            for queued in c.rq.iter().skip(position) {
                if queued.seq() != next {
                    break;
                }
                next += 1;
            }
            c.rnext = next;
            if c.flags.reader_waiting {
                c.flags.reader_waiting = false;
                call.data_ready.notify_one();
            }
            if !flags.is_request_ack() && flags.is_last_packet() {
                self.delay_ack(call, c, self.config.last_ack_delay);
                ack_done = true;
            }
        } else {
            trace!(channel = call.channel, seq, expected = c.rnext, "out of order");
        }

        if !ack_done {
            if flags.is_request_ack() {
                let reason = if in_order {
                    AckReason::Requested
                } else {
                    AckReason::OutOfSequence
                };
                self.send_ack(call, c, Some(serial), reason);
            } else if c.n_soft_acks >= (c.rwind / 2).max(1) {
                self.send_ack(call, c, Some(serial), AckReason::Idle);
            } else {
                self.delay_ack(call, c, self.config.soft_ack_delay);
            }
        }

        self.try_attach(call, c);
    }

    /// Hand a waiting server call to a worker, or challenge the client
    /// first if it has not authenticated yet.
    fn try_attach(&self, call: &Arc<Call>, c: &mut CallInner) {
        if c.state != CallState::PreCall || call.conn.is_client() {
            return;
        }
        if call.conn.with_security(|security, view| security.check_authentication(view)) {
            self.dispatcher.offer(call);
        } else {
            self.challenge_on(&call.conn);
        }
    }

    fn receive_ack_packet(&self, call: &Arc<Call>, c: &mut CallInner, packet: &Packet) {
        bump(&self.stats.ack_packets_read);
        let ack = match AckPacket::decode(packet) {
            Ok(ack) => ack,
            Err(err) => {
                trace!(%err, "undecodable ack");
                return;
            }
        };
        let now = self.clock.now();

        let peer = {
            let mut inner = lock(&call.conn.inner);
            if !call.conn.is_client() && inner.serial < ack.serial {
                inner.serial = ack.serial.wrapping_add(1);
            }
            Arc::clone(&inner.peer)
        };
        let skew = u32::from(ack.max_skew);

        if ack.reason != AckReason::Delay {
            let sample = c.tq.iter().find_map(|queued| {
                if queued.header.serial == ack.serial {
                    queued.time_sent.map(|sent| now.saturating_since(sent))
                } else if queued.first_serial == ack.serial {
                    queued.first_sent.map(|sent| now.saturating_since(sent))
                } else {
                    None
                }
            });
            if let Some(sample) = sample {
                lock(&peer.state).sample_rtt(sample, self.config.window);
                self.stats.rtt_sample(sample);
            }
        }
        let timeout = {
            let mut state = lock(&peer.state);
            state.out_packet_skew = skew;
            state.rtt.timeout()
        };

        let first = ack.first_packet;
        while c.tq.front().is_some_and(|queued| queued.seq() < first) {
            if let Some(released) = c.tq.pop_front() {
                c.tfirst = c.tfirst.max(released.seq() + 1);
            }
        }

        let acked = |seq: u32| {
            seq.checked_sub(first)
                .and_then(|offset| ack.acks.get(offset as usize))
                .copied()
                .unwrap_or(false)
        };
        let mut pushed = 0u64;
        c.tq.retain_mut(|queued| {
            if acked(queued.seq()) {
                return false;
            }
            if let Some(sent) = queued.time_sent {
                queued.retry_time = Some(sent + timeout + Duration::from_millis(u64::from(queued.backoff) << 8));
                // Packets sent well before one the peer has seen are lost.
                if u64::from(queued.header.serial) + u64::from(skew) <= u64::from(ack.serial) {
                    queued.retry_time = Some(now);
                    queued.fast_retry = true;
                    pushed += 1;
                }
            }
            true
        });
        for _ in 0..pushed {
            bump(&self.stats.data_packets_pushed);
        }

        let front = c.tq.front().map_or(c.tnext, Packet::seq);
        c.tfirst = c.tfirst.max(front);

        let max_window = {
            let mut state = lock(&peer.state);
            if ack.reason == AckReason::Duplicate {
                state.rtt.dubious_timeout();
            }
            state.max_window
        };
        if c.twind < max_window {
            c.twind += 1;
        }
        if c.window_open() && c.flags.wait_window_alloc {
            c.flags.wait_window_alloc = false;
            call.window_open.notify_one();
        }

        if let Some(size) = ack.max_receive_size {
            let size = size as usize;
            if size >= OLD_MAX_PACKET_SIZE {
                let peer_size = lock(&peer.state).packet_size;
                lock(&call.conn.inner).max_packet_size = size.min(peer_size);
            }
        }

        self.start_transmission(call, c);
    }

    /// Start challenging a server connection's client unless a challenge
    /// is already outstanding.
    pub(crate) fn challenge_on(&self, conn: &Arc<Connection>) {
        {
            let inner = lock(&conn.inner);
            if inner.challenge_event.is_some_and(|handle| self.event_pending(&handle)) {
                return;
            }
        }
        if let Err(err) = conn.with_security(|security, view| security.create_challenge(view)) {
            warn!(cid = format_args!("{:#x}", conn.cid()), ?err, "cannot create challenge");
            return;
        }
        self.send_challenge(conn);
    }

    /// Send a CHALLENGE and re-arm its timer, until the client is
    /// authenticated.
    pub(crate) fn send_challenge(&self, conn: &Arc<Connection>) {
        if conn.error() != 0 || conn.with_security(|security, view| security.check_authentication(view)) {
            return;
        }

        let header = call_header(conn, 0, 0, PacketType::Challenge);
        if let Some(mut packet) = self.special_packet(header) {
            match conn.with_security(|security, view| security.get_challenge(view, &mut packet)) {
                Ok(()) => {
                    trace!(cid = format_args!("{:#x}", conn.cid()), "challenge");
                    self.send_special(conn, &mut packet);
                }
                Err(err) => warn!(cid = format_args!("{:#x}", conn.cid()), ?err, "cannot fill challenge"),
            }
        }

        let at = self.clock.now() + self.config.challenge_timeout;
        let mut handle = Some(self.post_event(at, Task::Challenge(Arc::clone(conn))));
        let mut inner = lock(&conn.inner);
        if inner.destroyed {
            self.cancel_event(&mut handle);
            return;
        }
        self.cancel_event(&mut inner.challenge_event);
        inner.challenge_event = handle;
    }

    fn receive_challenge(&self, conn: &Arc<Connection>, challenge: &Packet) {
        if !conn.is_client() {
            return;
        }
        let calls = lock(&conn.inner).installed_calls();
        if !calls.iter().any(|call| call.state() == CallState::Active) {
            trace!(cid = format_args!("{:#x}", conn.cid()), "challenge without active calls");
            return;
        }

        let header = call_header(conn, 0, 0, PacketType::Response);
        let Some(mut response) = self.special_packet(header) else {
            return;
        };
        match conn.with_security(|security, view| security.get_response(view, challenge, &mut response)) {
            Ok(()) => self.send_special(conn, &mut response),
            Err(err) => {
                warn!(cid = format_args!("{:#x}", conn.cid()), ?err, "cannot answer challenge");
                self.connection_error(conn, security_code(err));
                self.send_connection_abort(conn);
            }
        }
    }

    fn receive_response(&self, conn: &Arc<Connection>, response: &Packet) {
        if conn.is_client() || conn.with_security(|security, view| security.check_authentication(view)) {
            return;
        }
        match conn.with_security(|security, view| security.check_response(view, response)) {
            Ok(()) => {
                let calls = {
                    let mut inner = lock(&conn.inner);
                    self.cancel_event(&mut inner.challenge_event);
                    inner.installed_calls()
                };
                debug!(cid = format_args!("{:#x}", conn.cid()), "client authenticated");
                for call in calls {
                    let mut c = lock(&call.inner);
                    self.try_attach(&call, &mut c);
                }
            }
            Err(SecurityError::Retry) => self.send_challenge(conn),
            Err(err) => {
                warn!(cid = format_args!("{:#x}", conn.cid()), ?err, "response rejected");
                self.connection_error(conn, security_code(err));
                self.send_connection_abort(conn);
            }
        }
    }

    /// Put the whole connection into a permanent error state, failing
    /// every call on it. Must not be called with a call lock held.
    pub(crate) fn connection_error(&self, conn: &Arc<Connection>, code: i32) {
        if code == 0 {
            return;
        }
        let calls = {
            let mut inner = lock(&conn.inner);
            if inner.error != 0 {
                return;
            }
            inner.error = code;
            self.cancel_event(&mut inner.challenge_event);
            inner.installed_calls()
        };
        bump(&self.stats.fatal_errors);
        warn!(cid = format_args!("{:#x}", conn.cid()), code, "connection error");
        for call in calls {
            let mut c = lock(&call.inner);
            self.call_error(&call, &mut c, code);
        }
        conn.channel_free.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use proptest::prelude::*;

    use super::*;
    use crate::core::RxConfigBuilder;
    use crate::rpc::runtime::tests::TestRuntime;
    use crate::security::{SecurityConn, SecurityObject};

    const SERVICE: u16 = 1;
    const EPOCH: u32 = 0x5151;
    const CID: u32 = 0x4000;

    /// Header of a packet a remote client sends to us.
    fn client_header(packet_type: PacketType, call_number: u32, seq: u32, serial: u32) -> Header {
        let mut header = Header::new(packet_type);
        header.epoch = EPOCH;
        header.cid = CID;
        header.call_number = call_number;
        header.seq = seq;
        header.serial = serial;
        header.service_id = SERVICE;
        header.flags.insert(PacketFlags::CLIENT_INITIATED);
        header
    }

    fn data(seq: u32, serial: u32, last: bool) -> Header {
        let mut header = client_header(PacketType::Data, 1, seq, serial);
        if last {
            header.flags.insert(PacketFlags::LAST_PACKET);
        }
        header
    }

    /// Header of a connection-level packet the remote server sends us.
    fn from_server(conn: &Connection, packet_type: PacketType) -> Header {
        let mut header = call_header(conn, 0, 0, packet_type);
        header.flags.remove(PacketFlags::CLIENT_INITIATED);
        header.serial = 1;
        header
    }

    fn server_call(t: &TestRuntime) -> Arc<Call> {
        let conn = lock(&t.rt.conns)
            .get(&ConnKey::new(EPOCH, CID, ConnType::Server))
            .cloned()
            .expect("server connection");
        let call = lock(&conn.inner).calls[0].clone();
        call.expect("server call")
    }

    fn read_all(call: &Arc<Call>) -> Vec<u8> {
        let mut out = vec![0u8; 256];
        let n = lock(&call.inner).copy_out(&mut out);
        out.truncate(n);
        out
    }

    #[test]
    fn test_version_query_is_answered() {
        let t = TestRuntime::server(SERVICE);
        let mut header = Header::new(PacketType::Version);
        header.flags.insert(PacketFlags::CLIENT_INITIATED);
        t.inject(header, &[]);

        let replies = t.wire.take_headers();
        assert_eq!(replies.len(), 1);
        let (reply, payload) = &replies[0];
        assert_eq!(reply.packet_type, PacketType::Version);
        assert!(!reply.flags.is_client_initiated());
        assert_eq!(payload.len(), VERSION_STRING_SIZE);
        assert!(payload.starts_with(b"rx-protocol "));
        assert_eq!(payload[VERSION_STRING_SIZE - 1], 0);
    }

    #[test]
    fn test_debug_stats_and_bad_type() {
        let t = TestRuntime::server(SERVICE);
        let mut header = Header::new(PacketType::Debug);
        header.flags.insert(PacketFlags::CLIENT_INITIATED);

        t.inject(header, &DEBUG_GET_STATS.to_be_bytes());
        let replies = t.wire.take_headers();
        assert_eq!(replies.len(), 1);
        let payload = &replies[0].1;
        assert_eq!(payload[..4], DEBUG_GET_STATS.to_be_bytes());
        assert_eq!(payload.len() % 4, 0);

        t.inject(header, &99u32.to_be_bytes());
        let replies = t.wire.take_headers();
        assert_eq!(replies[0].1, RX_DEBUGI_BADTYPE.to_be_bytes());
    }

    #[test]
    fn test_truncated_datagram_is_bogus() {
        let t = TestRuntime::server(SERVICE);
        t.rt.receive_datagram(&[0u8; 10], t.remote);
        assert_eq!(t.stats().bogus_packets_read, 1);
        assert!(t.wire.take().is_empty());
    }

    #[test]
    fn test_unknown_service_is_spurious() {
        let t = TestRuntime::server(SERVICE);
        let mut header = data(1, 1, true);
        header.service_id = 77;
        t.inject(header, b"x");
        assert_eq!(t.stats().spurious_packets_read, 1);
        assert_eq!(t.stats().server_conns_created, 0);
    }

    #[test]
    fn test_first_packet_creates_precall() {
        let t = TestRuntime::server(SERVICE);
        t.inject(data(1, 1, true), b"hello");

        let call = server_call(&t);
        assert_eq!(call.state(), CallState::PreCall);
        assert_eq!(t.rt.dispatcher.queued_calls(), 1);
        assert_eq!(t.stats().server_conns_created, 1);
        assert_eq!(read_all(&call), b"hello");
        assert_eq!(call.mode(), CallMode::Eof);
    }

    #[test]
    fn test_duplicates_are_delivered_once() {
        let t = TestRuntime::server(SERVICE);
        for serial in 1..=3 {
            t.inject(data(1, serial, true), b"once");
        }

        let call = server_call(&t);
        assert_eq!(read_all(&call), b"once");
        assert_eq!(t.stats().dup_packets_read, 2);
        let dups = t
            .sent_acks()
            .into_iter()
            .filter(|(_, ack)| ack.reason == AckReason::Duplicate)
            .count();
        assert_eq!(dups, 2);
        assert_eq!(t.rt.dispatcher.queued_calls(), 1);
    }

    #[test]
    fn test_request_ack_is_answered_with_gaps() {
        let t = TestRuntime::server(SERVICE);
        t.inject(data(1, 1, false), b"a");
        let mut third = data(3, 2, false);
        third.flags.insert(PacketFlags::REQUEST_ACK);
        t.inject(third, b"c");

        let acks = t.sent_acks();
        let (_, ack) = acks.last().expect("ack");
        assert_eq!(ack.reason, AckReason::OutOfSequence);
        assert_eq!(ack.first_packet, 2);
        assert_eq!(ack.acks, vec![false, true]);
        assert_eq!(ack.serial, 2);
    }

    #[test]
    fn test_packet_beyond_window_is_refused() {
        let t = TestRuntime::server(SERVICE);
        t.inject(data(1, 1, false), b"a");
        t.inject(data(40, 2, false), b"z");

        let call = server_call(&t);
        assert_eq!(lock(&call.inner).rq.len(), 1);
        assert!(t
            .sent_acks()
            .iter()
            .any(|(_, ack)| ack.reason == AckReason::ExceedsWindow));
    }

    #[test]
    fn test_low_pool_drops_then_accepts_retransmission() {
        let t = TestRuntime::with_server_config(
            SERVICE,
            RxConfigBuilder::new().packets(24).data_quota(15).build().unwrap(),
        );
        let held: Vec<_> = (0..8)
            .map(|_| t.rt.pool.allocate(PacketClass::Special).unwrap())
            .collect();
        t.inject(data(1, 1, true), b"later");
        assert_eq!(t.stats().no_buffers_on_read, 1);
        let call = server_call(&t);
        assert!(lock(&call.inner).rq.is_empty());

        drop(held);
        t.inject(data(1, 2, true), b"later");
        assert_eq!(read_all(&call), b"later");
    }

    #[test]
    fn test_new_call_number_on_active_channel_is_busy() {
        let t = TestRuntime::server(SERVICE);
        t.inject(data(1, 1, false), b"first");
        let call = server_call(&t);
        lock(&call.inner).state = CallState::Active;
        t.wire.take();

        let mut next = client_header(PacketType::Data, 2, 1, 2);
        next.flags.insert(PacketFlags::LAST_PACKET);
        t.inject(next, b"second");

        assert_eq!(call.error(), Some(crate::core::RxError::CallDead));
        assert_eq!(t.sent_of(PacketType::Busy).len(), 1);
        assert_eq!(t.stats().busy_packets_sent, 1);
    }

    #[test]
    fn test_new_call_number_reuses_dallying_channel() {
        let t = TestRuntime::server(SERVICE);
        t.inject(data(1, 1, true), b"first");
        let call = server_call(&t);
        lock(&call.inner).state = CallState::Dally;

        let mut next = client_header(PacketType::Data, 2, 1, 2);
        next.flags.insert(PacketFlags::LAST_PACKET);
        t.inject(next, b"second");

        assert_eq!(call.state(), CallState::PreCall);
        assert_eq!(read_all(&call), b"second");
        assert_eq!(lock(&call.conn.inner).call_numbers[0], 2);
    }

    #[test]
    fn test_connection_abort_fails_calls() {
        let t = TestRuntime::server(SERVICE);
        t.inject(data(1, 1, false), b"x");
        let call = server_call(&t);

        t.inject(client_header(PacketType::Abort, 0, 0, 2), &(-7i32).to_be_bytes());
        assert_eq!(call.error(), Some(crate::core::RxError::Abort(-7)));
        assert_eq!(t.stats().fatal_errors, 1);

        t.wire.take();
        t.inject(data(2, 3, false), b"y");
        let aborts = t.sent_of(PacketType::Abort);
        assert_eq!(aborts.len(), 1);
        assert_eq!(aborts[0].call_number, 0);
    }

    #[tokio::test]
    async fn test_ack_pushes_lost_packets() {
        let t = TestRuntime::with_config(RxConfigBuilder::new().initial_window(15).build().unwrap());
        let (conn, call) = t.client_call().await;
        {
            let mut c = lock(&call.inner);
            for _ in 0..8 {
                let mut packet = t.rt.pool.allocate(PacketClass::Send).unwrap();
                packet.append(b"p");
                t.rt.queue_packet(&call, &mut c, packet, false);
            }
        }
        let sent = t.sent_of(PacketType::Data);
        assert_eq!(sent.len(), 8);
        let serial_of = |seq: u32| sent.iter().find(|h| h.seq == seq).map(|h| h.serial).unwrap();

        // The peer has 1-4, 6 and 7 but not 5.
        t.inject_ack(
            &conn,
            &call,
            AckPacket {
                buffer_space: 32,
                max_skew: 0,
                first_packet: 5,
                previous_packet: 7,
                serial: serial_of(7),
                reason: AckReason::OutOfSequence,
                acks: vec![false, true, true],
                max_receive_size: None,
            },
        );

        let resent = t.sent_of(PacketType::Data);
        assert_eq!(resent.iter().map(|h| h.seq).collect::<Vec<_>>(), vec![5]);
        assert_eq!(t.stats().data_packets_pushed, 1);
        let c = lock(&call.inner);
        assert_eq!(c.tfirst, 5);
        assert_eq!(c.tq.iter().map(Packet::seq).collect::<Vec<_>>(), vec![5, 8]);
    }

    #[tokio::test]
    async fn test_stale_ack_is_ignored() {
        let t = TestRuntime::with_config(RxConfigBuilder::new().initial_window(8).build().unwrap());
        let (conn, call) = t.client_call().await;
        {
            let mut c = lock(&call.inner);
            for _ in 0..4 {
                let packet = t.rt.pool.allocate(PacketClass::Send).unwrap();
                t.rt.queue_packet(&call, &mut c, packet, false);
            }
        }
        let ack = |first: u32, serial: u32| AckPacket {
            buffer_space: 32,
            max_skew: 0,
            first_packet: first,
            previous_packet: first,
            serial,
            reason: AckReason::Delay,
            acks: Vec::new(),
            max_receive_size: None,
        };
        t.inject_ack(&conn, &call, ack(3, 2));
        assert_eq!(lock(&call.inner).tfirst, 3);

        t.inject_ack(&conn, &call, ack(2, 1));
        assert_eq!(lock(&call.inner).tfirst, 3);
        assert_eq!(t.stats().spurious_packets_read, 1);
    }

    #[tokio::test]
    async fn test_ack_samples_rtt_and_raises_packet_size() {
        let t = TestRuntime::new();
        let (conn, call) = t.client_call().await;
        {
            let mut c = lock(&call.inner);
            let packet = t.rt.pool.allocate(PacketClass::Send).unwrap();
            t.rt.queue_packet(&call, &mut c, packet, true);
        }
        let serial = t.sent_of(PacketType::Data)[0].serial;
        t.rt.clock.advance(Duration::from_millis(40));
        t.inject_ack(
            &conn,
            &call,
            AckPacket {
                buffer_space: 32,
                max_skew: 0,
                first_packet: 2,
                previous_packet: 1,
                serial,
                reason: AckReason::Requested,
                acks: Vec::new(),
                max_receive_size: Some(MAX_PACKET_SIZE as u32),
            },
        );

        let stats = t.stats();
        assert_eq!(stats.rtt_samples, 1);
        assert_eq!(stats.rtt_min, Some(Duration::from_millis(40)));
        assert_eq!(lock(&conn.inner).max_packet_size, MAX_PACKET_SIZE);
        let c = lock(&call.inner);
        assert!(c.tq.is_empty());
        assert!(c.resend_event.is_none());
    }

    #[tokio::test]
    async fn test_reply_data_clears_transmit_queue() {
        let t = TestRuntime::new();
        let (conn, call) = t.client_call().await;
        {
            let mut c = lock(&call.inner);
            let packet = t.rt.pool.allocate(PacketClass::Send).unwrap();
            t.rt.queue_packet(&call, &mut c, packet, true);
            c.mode = CallMode::Receiving;
        }
        let mut reply = call_header(&conn, 0, 1, PacketType::Data);
        reply.flags = PacketFlags::LAST_PACKET;
        reply.seq = 1;
        reply.serial = 1;
        t.inject(reply, b"pong");

        assert!(lock(&call.inner).tq.is_empty());
        assert_eq!(read_all(&call), b"pong");
    }

    /// Security class that wants the client to echo `nonce` back.
    #[derive(Debug, Default)]
    struct EchoNonce {
        refuse: AtomicBool,
    }

    fn authenticated(view: &mut SecurityConn<'_>) -> bool {
        view.data.as_ref().and_then(|d| d.downcast_ref::<bool>()).copied().unwrap_or(false)
    }

    impl SecurityObject for EchoNonce {
        fn name(&self) -> &'static str {
            "echo-nonce"
        }

        fn check_authentication(&self, conn: &mut SecurityConn<'_>) -> bool {
            authenticated(conn)
        }

        fn get_challenge(&self, _conn: &mut SecurityConn<'_>, challenge: &mut Packet) -> Result<(), SecurityError> {
            challenge.append(b"nonce");
            Ok(())
        }

        fn get_response(
            &self,
            _conn: &mut SecurityConn<'_>,
            challenge: &Packet,
            response: &mut Packet,
        ) -> Result<(), SecurityError> {
            if self.refuse.load(Ordering::Relaxed) {
                return Err(SecurityError::Fatal(-99));
            }
            response.append(&challenge.payload());
            Ok(())
        }

        fn check_response(&self, conn: &mut SecurityConn<'_>, response: &Packet) -> Result<(), SecurityError> {
            match response.payload().as_slice() {
                b"nonce" => {
                    *conn.data = Some(Box::new(true));
                    Ok(())
                }
                b"" => Err(SecurityError::Retry),
                _ => Err(SecurityError::Fatal(-50)),
            }
        }
    }

    #[test]
    fn test_challenge_gates_dispatch() {
        let t = TestRuntime::server_with_security(SERVICE, Arc::new(EchoNonce::default()));
        t.inject(data(1, 1, true), b"secret");

        assert_eq!(t.rt.dispatcher.queued_calls(), 0);
        let challenges = t.wire.take_headers();
        let challenge: Vec<_> = challenges
            .iter()
            .filter(|(h, _)| h.packet_type == PacketType::Challenge)
            .collect();
        assert_eq!(challenge.len(), 1);
        assert_eq!(challenge[0].0.call_number, 0);
        assert_eq!(challenge[0].1, b"nonce");

        // Unanswered challenges are repeated.
        t.advance(CHALLENGE_TIMEOUT);
        assert_eq!(t.sent_of(PacketType::Challenge).len(), 1);

        // An empty response asks for another round.
        t.inject(client_header(PacketType::Response, 0, 0, 2), b"");
        assert_eq!(t.sent_of(PacketType::Challenge).len(), 1);

        t.inject(client_header(PacketType::Response, 0, 0, 3), b"nonce");
        assert_eq!(t.rt.dispatcher.queued_calls(), 1);
        let conn = server_call(&t).conn.clone();
        assert!(lock(&conn.inner).challenge_event.is_none());

        t.advance(CHALLENGE_TIMEOUT);
        assert!(t.sent_of(PacketType::Challenge).is_empty());
    }

    #[test]
    fn test_bad_response_fails_connection() {
        let t = TestRuntime::server_with_security(SERVICE, Arc::new(EchoNonce::default()));
        t.inject(data(1, 1, true), b"secret");
        t.wire.take();

        t.inject(client_header(PacketType::Response, 0, 0, 2), b"wrong");
        let call = server_call(&t);
        assert_eq!(call.error(), Some(crate::core::RxError::Abort(-50)));
        assert_eq!(t.sent_of(PacketType::Abort).len(), 1);
    }

    #[tokio::test]
    async fn test_client_answers_challenge() {
        let t = TestRuntime::new();
        let (conn, _call) = t.client_call_with_security(Arc::new(EchoNonce::default())).await;

        t.inject(from_server(&conn, PacketType::Challenge), b"nonce");
        let responses: Vec<_> = t
            .wire
            .take_headers()
            .into_iter()
            .filter(|(h, _)| h.packet_type == PacketType::Response)
            .collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1, b"nonce");
        assert!(responses[0].0.flags.is_client_initiated());
    }

    #[tokio::test]
    async fn test_client_refusing_challenge_fails_calls() {
        let security = Arc::new(EchoNonce::default());
        security.refuse.store(true, Ordering::Relaxed);
        let t = TestRuntime::new();
        let (conn, call) = t.client_call_with_security(security).await;

        t.inject(from_server(&conn, PacketType::Challenge), b"nonce");
        assert_eq!(conn.error(), -99);
        assert_eq!(call.error(), Some(crate::core::RxError::Abort(-99)));
    }

    proptest! {
        #[test]
        fn test_any_arrival_order_reassembles(order in (1u32..=12).prop_flat_map(|n| Just((1..=n).collect::<Vec<_>>()).prop_shuffle())) {
            let t = TestRuntime::server(SERVICE);
            let n = order.len() as u32;
            for (i, &seq) in order.iter().enumerate() {
                t.inject(data(seq, i as u32 + 1, seq == n), &[seq as u8; 3]);
            }

            let call = server_call(&t);
            let expected: Vec<u8> = (1..=n).flat_map(|seq| [seq as u8; 3]).collect();
            prop_assert_eq!(lock(&call.inner).rnext, n + 1);
            prop_assert_eq!(read_all(&call), expected);
            prop_assert_eq!(call.mode(), CallMode::Eof);
        }
    }
}
