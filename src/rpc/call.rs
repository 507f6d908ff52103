//! Calls.
//!
//! A call is one request/response exchange on one channel of a
//! connection. [`RxCall`] is the application's handle; the engine works on
//! the shared [`Call`] under its lock.
//!
//! ```text
//!            client                         server
//! NOT_INIT ──new_call──► ACTIVE   NOT_INIT ──first packet──► PRECALL
//!                          │                                   │ worker
//!                       end_call                            ACTIVE
//!                          ▼                                   │ end_call
//!                        DALLY ◄──────── reuse / free ──────  DALLY
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::core::constants::*;
use crate::core::{RxConfig, RxError, RxResult, lock};
use crate::transport::{ClockTime, EventHandle, Packet, PacketClass};

use super::connection::Connection;
use super::runtime::RuntimeInner;

/// Call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Slot allocated, no call yet.
    NotInit,
    /// Server call waiting for a worker.
    PreCall,
    /// In progress.
    Active,
    /// Finished; kept to absorb late packets and for reuse.
    Dally,
}

/// Which direction a call is moving data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallMode {
    /// Writing.
    Sending,
    /// Reading.
    Receiving,
    /// The call failed; see its error.
    Error,
    /// All incoming data has been read.
    Eof,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CallFlags {
    /// A reader is parked on `data_ready`.
    pub(crate) reader_waiting: bool,
    /// A writer is parked on `window_open`.
    pub(crate) wait_window_alloc: bool,
    /// Queued packets are held back by the transmit window.
    pub(crate) wait_window_send: bool,
}

/// Mutable call state, guarded by the call lock.
#[derive(Debug)]
pub(crate) struct CallInner {
    pub(crate) state: CallState,
    pub(crate) mode: CallMode,
    /// Non-zero once the call has failed.
    pub(crate) error: i32,
    pub(crate) flags: CallFlags,
    /// Sent but unacknowledged packets, by sequence.
    pub(crate) tq: VecDeque<Packet>,
    /// Received packets, by sequence; those below `rnext` are readable.
    pub(crate) rq: VecDeque<Packet>,
    /// First unacknowledged sequence.
    pub(crate) tfirst: u32,
    /// Next sequence to assign.
    pub(crate) tnext: u32,
    /// Next sequence expected in order.
    pub(crate) rnext: u32,
    /// Sequence of the last data packet received.
    pub(crate) rprev: u32,
    pub(crate) twind: u32,
    pub(crate) rwind: u32,
    /// Packets received since the last ack went out.
    pub(crate) n_soft_acks: u32,
    pub(crate) local_status: u8,
    pub(crate) remote_status: u8,
    pub(crate) resend_event: Option<EventHandle>,
    pub(crate) keepalive_event: Option<EventHandle>,
    pub(crate) delayed_ack_event: Option<EventHandle>,
    pub(crate) last_receive_time: ClockTime,
    pub(crate) last_send_time: ClockTime,
    pub(crate) start_time: ClockTime,
    /// Set while a server call waits for request data.
    pub(crate) start_wait: Option<ClockTime>,
    /// Packet being read and the read offset into it.
    pub(crate) cur_read: Option<(Packet, usize)>,
    /// Packet being filled and its payload limit.
    pub(crate) cur_write: Option<(Packet, usize)>,
    /// Sitting in the peer's congestion queue.
    pub(crate) congested: bool,
    /// Our side's last packet has been queued.
    pub(crate) sent_last: bool,
}

impl CallInner {
    fn new(config: &RxConfig, now: ClockTime) -> Self {
        Self {
            state: CallState::NotInit,
            mode: CallMode::Sending,
            error: 0,
            flags: CallFlags::default(),
            tq: VecDeque::new(),
            rq: VecDeque::new(),
            tfirst: 1,
            tnext: 1,
            rnext: 1,
            rprev: 0,
            twind: config.initial_window,
            rwind: config.window,
            n_soft_acks: 0,
            local_status: 0,
            remote_status: 0,
            resend_event: None,
            keepalive_event: None,
            delayed_ack_event: None,
            last_receive_time: now,
            last_send_time: now,
            start_time: now,
            start_wait: None,
            cur_read: None,
            cur_write: None,
            congested: false,
            sent_last: false,
        }
    }

    /// Copy readable bytes into `out`, switching to EOF after the last
    /// packet is drained.
    pub(crate) fn copy_out(&mut self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < out.len() {
            if self.cur_read.is_none() {
                match self.rq.front() {
                    Some(packet) if packet.seq() < self.rnext => {
                        self.cur_read = self.rq.pop_front().map(|packet| (packet, 0));
                    }
                    _ => break,
                }
            }
            let Some((packet, offset)) = self.cur_read.as_mut() else {
                break;
            };
            let n = packet.read_at(*offset, &mut out[copied..]);
            *offset += n;
            copied += n;
            if *offset >= packet.len() {
                let last = packet.header.flags.is_last_packet();
                self.cur_read = None;
                if last {
                    self.mode = CallMode::Eof;
                    break;
                }
            }
        }
        copied
    }

    /// Whether a new packet may be queued without exceeding the window.
    pub(crate) fn window_open(&self) -> bool {
        self.tnext < self.tfirst.saturating_add(self.twind)
    }
}

/// One call slot of a connection.
pub struct Call {
    pub(crate) conn: Arc<Connection>,
    pub(crate) channel: usize,
    pub(crate) inner: Mutex<CallInner>,
    /// Wakes the reader.
    pub(crate) data_ready: Notify,
    /// Wakes a writer waiting for transmit window.
    pub(crate) window_open: Notify,
    /// Handed to a server worker; changed under the dispatch lock.
    pub(crate) claimed: AtomicBool,
}

impl Call {
    pub(crate) fn new(conn: Arc<Connection>, channel: usize, config: &RxConfig, now: ClockTime) -> Self {
        Self {
            conn,
            channel,
            inner: Mutex::new(CallInner::new(config, now)),
            data_ready: Notify::new(),
            window_open: Notify::new(),
            claimed: AtomicBool::new(false),
        }
    }

    /// Channel within the connection.
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CallState {
        lock(&self.inner).state
    }

    /// Current data direction.
    pub fn mode(&self) -> CallMode {
        lock(&self.inner).mode
    }

    /// Error the call failed with, if any.
    pub fn error(&self) -> Option<RxError> {
        RxError::from_code(lock(&self.inner).error)
    }

    /// Whether this call currently occupies `conn`'s slot for its channel.
    pub(crate) fn is_installed(self: &Arc<Self>) -> bool {
        lock(&self.conn.inner).calls[self.channel]
            .as_ref()
            .is_some_and(|installed| Arc::ptr_eq(installed, self))
    }

    fn call_number(&self) -> u32 {
        lock(&self.conn.inner).call_numbers[self.channel]
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("conn", &self.conn)
            .field("channel", &self.channel)
            .field("claimed", &self.claimed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Counts a task parked in `new_call`, also when its future is dropped.
struct ChannelWaiter<'a>(&'a Connection);

impl Drop for ChannelWaiter<'_> {
    fn drop(&mut self) {
        let mut inner = lock(&self.0.inner);
        inner.makecall_waiting = inner.makecall_waiting.saturating_sub(1);
    }
}

impl RuntimeInner {
    /// Put a call into its permanent error state and wake everyone parked
    /// on it. The first error wins.
    pub(crate) fn call_error(&self, call: &Arc<Call>, c: &mut CallInner, code: i32) {
        if code == 0 || c.error != 0 {
            return;
        }
        debug!(
            cid = format_args!("{:#x}", call.conn.cid()),
            channel = call.channel,
            code,
            "call error"
        );
        c.error = code;
        c.mode = CallMode::Error;
        self.clear_transmit_queue(call, c);
        c.rq.clear();
        c.cur_read = None;
        c.cur_write = None;
        self.cancel_event(&mut c.keepalive_event);
        self.cancel_event(&mut c.delayed_ack_event);
        c.flags = CallFlags::default();
        call.data_ready.notify_one();
        call.window_open.notify_one();
    }

    /// Drop every queued outgoing packet.
    pub(crate) fn clear_transmit_queue(&self, call: &Arc<Call>, c: &mut CallInner) {
        if c.tq.is_empty() && c.resend_event.is_none() {
            return;
        }
        c.tfirst = c.tnext;
        c.tq.clear();
        self.cancel_event(&mut c.resend_event);
        if c.flags.wait_window_alloc {
            c.flags.wait_window_alloc = false;
            call.window_open.notify_one();
        }
    }

    /// Return a call to its initial state, keeping its slot.
    pub(crate) fn reset_call(&self, call: &Arc<Call>, c: &mut CallInner) {
        self.cancel_event(&mut c.resend_event);
        self.cancel_event(&mut c.keepalive_event);
        self.cancel_event(&mut c.delayed_ack_event);
        let now = self.clock.now();
        let reader_waiting = c.flags.reader_waiting;
        *c = CallInner::new(&self.config, now);
        if !call.conn.is_client() {
            c.mode = CallMode::Receiving;
        }
        if reader_waiting {
            call.data_ready.notify_one();
        }
    }

    /// Release a call's slot.
    pub(crate) fn free_call(&self, call: &Arc<Call>, c: &mut CallInner) {
        let was_dallying = c.state == CallState::Dally;
        {
            let mut conn = lock(&call.conn.inner);
            let slot = &mut conn.calls[call.channel];
            if slot.as_ref().is_some_and(|installed| Arc::ptr_eq(installed, call)) {
                *slot = None;
                // Late packets of the finished call must now look stale.
                if was_dallying {
                    conn.call_numbers[call.channel] += 1;
                }
            }
            if conn.makecall_waiting > 0 {
                call.conn.channel_free.notify_one();
            }
        }
        self.reset_call(call, c);
        self.dispatcher.remove(call);
        super::stats::bump(&self.stats.calls_freed);
        trace!(channel = call.channel, "call freed");
    }

    /// Claim a free channel on a client connection, waiting if all are busy.
    pub(crate) async fn new_call(&self, conn: &Arc<Connection>) -> RxResult<Arc<Call>> {
        loop {
            self.clock.invalidate();
            let slots = {
                let inner = lock(&conn.inner);
                RxError::check(inner.error)?;
                inner.calls.clone()
            };

            for (channel, slot) in slots.iter().enumerate() {
                let call = match slot {
                    Some(call) => {
                        let mut c = lock(&call.inner);
                        if c.state != CallState::Dally || !call.is_installed() {
                            continue;
                        }
                        self.reset_call(call, &mut c);
                        self.activate_client_call(call, &mut c);
                        Arc::clone(call)
                    }
                    None => {
                        let call = Arc::new(Call::new(
                            Arc::clone(conn),
                            channel,
                            &self.config,
                            self.clock.now(),
                        ));
                        let mut c = lock(&call.inner);
                        {
                            let mut inner = lock(&conn.inner);
                            if inner.calls[channel].is_some() {
                                continue;
                            }
                            inner.calls[channel] = Some(Arc::clone(&call));
                        }
                        super::stats::bump(&self.stats.calls_created);
                        self.activate_client_call(&call, &mut c);
                        drop(c);
                        call
                    }
                };
                return Ok(call);
            }

            lock(&conn.inner).makecall_waiting += 1;
            let _waiting = ChannelWaiter(conn);
            trace!(cid = format_args!("{:#x}", conn.cid()), "all channels busy, waiting");
            conn.channel_free.notified().await;
        }
    }

    fn activate_client_call(&self, call: &Arc<Call>, c: &mut CallInner) {
        let call_number = {
            let mut inner = lock(&call.conn.inner);
            inner.call_numbers[call.channel] += 1;
            inner.call_numbers[call.channel]
        };
        let now = self.clock.now();
        c.state = CallState::Active;
        c.mode = CallMode::Sending;
        c.start_time = now;
        c.last_receive_time = now;
        self.keepalive_on(call, c);
        debug!(
            cid = format_args!("{:#x}", call.conn.cid()),
            channel = call.channel,
            call_number,
            "call started"
        );
    }

    /// Turn a dispatched PRECALL call into an active one. `false` if the
    /// call went away while it was queued.
    pub(crate) fn begin_server_call(&self, call: &Arc<Call>) -> bool {
        let mut c = lock(&call.inner);
        if c.state != CallState::PreCall || !call.is_installed() {
            drop(c);
            self.dispatcher.release(call);
            return false;
        }
        c.state = CallState::Active;
        c.start_time = self.clock.invalidate();
        true
    }

    /// Move a call to DALLY after its owner is done with it. Returns the
    /// call's final error code.
    pub(crate) fn finish_call(&self, call: &Arc<Call>) -> i32 {
        let error = {
            let mut c = lock(&call.inner);
            c.cur_read = None;
            c.cur_write = None;
            c.rq.clear();
            c.flags.reader_waiting = false;
            c.start_wait = None;
            c.state = CallState::Dally;
            c.error
        };

        if call.conn.is_client() {
            let destroy = {
                let inner = lock(&call.conn.inner);
                if inner.makecall_waiting > 0 {
                    call.conn.channel_free.notify_one();
                }
                inner.destroy_me
            };
            if destroy {
                self.destroy_client_connection(&call.conn);
            }
        } else {
            self.dispatcher.release(call);
        }
        error
    }

    /// Abort a call whose handle was dropped without `end`.
    fn abandon_call(&self, call: &Arc<Call>) {
        {
            let mut c = lock(&call.inner);
            if c.state == CallState::Dally || c.state == CallState::NotInit {
                return;
            }
            if c.error == 0 {
                self.call_error(call, &mut c, RX_USER_ABORT);
                self.send_call_abort(call, &mut c);
            }
        }
        self.finish_call(call);
    }
}

/// Application handle to one call.
///
/// Client calls come from
/// [`RxConnection::new_call`](crate::client::RxConnection::new_call);
/// server calls are handed to a [`CallHandler`](super::CallHandler).
/// Dropping a handle without [`end`](Self::end) aborts the call with
/// [`RxError::UserAbort`].
#[derive(Debug)]
pub struct RxCall {
    rt: Arc<RuntimeInner>,
    call: Arc<Call>,
    ended: bool,
}

impl RxCall {
    pub(crate) fn new(rt: Arc<RuntimeInner>, call: Arc<Call>) -> Self {
        Self {
            rt,
            call,
            ended: false,
        }
    }

    /// Channel the call runs on.
    pub fn channel(&self) -> usize {
        self.call.channel
    }

    /// Call number on the channel.
    pub fn call_number(&self) -> u32 {
        self.call.call_number()
    }

    /// Service the call belongs to.
    pub fn service_id(&self) -> u16 {
        self.call.conn.service_id()
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.call.conn.peer_addr()
    }

    /// Data attached to the call's service, if it is a `T`.
    pub fn service_data<T: std::any::Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.call.conn.service.as_ref()?.data::<T>()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CallState {
        self.call.state()
    }

    /// Current data direction.
    pub fn mode(&self) -> CallMode {
        self.call.mode()
    }

    /// Error the call failed with, if any.
    pub fn error(&self) -> Option<RxError> {
        self.call.error()
    }

    /// Status byte carried in every packet we send from now on.
    pub fn set_local_status(&self, status: u8) {
        lock(&self.call.inner).local_status = status;
    }

    /// Status byte of the last packet received.
    pub fn remote_status(&self) -> u8 {
        lock(&self.call.inner).remote_status
    }

    /// Read up to `buf.len()` bytes. Blocks until the buffer is full or the
    /// peer's data ends; returns the number of bytes read, zero at EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> RxResult<usize> {
        self.rt.clock.invalidate();
        if lock(&self.call.inner).mode == CallMode::Sending {
            self.flush().await?;
        }

        let mut filled = 0;
        loop {
            {
                let mut c = lock(&self.call.inner);
                RxError::check(c.error)?;
                c.start_wait = None;
                filled += c.copy_out(&mut buf[filled..]);
                if filled == buf.len() || c.mode == CallMode::Eof {
                    return Ok(filled);
                }
                c.flags.reader_waiting = true;
                if !self.call.conn.is_client() {
                    c.start_wait = Some(self.rt.clock.now());
                }
            }
            self.call.data_ready.notified().await;
        }
    }

    /// Read everything up to EOF, appending to `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> RxResult<usize> {
        let mut chunk = vec![0u8; FIRST_BUFFER_SIZE];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            out.extend_from_slice(&chunk[..n]);
            total += n;
            if n < chunk.len() {
                return Ok(total);
            }
        }
    }

    /// Write `data` into the call, transmitting full packets as they fill.
    pub async fn write(&mut self, data: &[u8]) -> RxResult<usize> {
        self.rt.clock.invalidate();
        {
            let mut c = lock(&self.call.inner);
            RxError::check(c.error)?;
            match c.mode {
                CallMode::Sending => {}
                CallMode::Receiving | CallMode::Eof
                    if !self.call.conn.is_client() && !c.sent_last =>
                {
                    c.mode = CallMode::Sending;
                    c.rq.clear();
                    c.cur_read = None;
                }
                _ => return Err(RxError::InvalidOperation),
            }
        }

        let mut written = 0;
        while written < data.len() {
            let needs_packet = lock(&self.call.inner).cur_write.is_none();
            if needs_packet {
                let packet = self.alloc_send_packet().await?;
                lock(&self.call.inner).cur_write = Some(packet);
            }

            let mut c = lock(&self.call.inner);
            RxError::check(c.error)?;
            let Some((packet, limit)) = c.cur_write.as_mut() else {
                continue;
            };
            let room = limit.saturating_sub(packet.len());
            let n = room.min(data.len() - written);
            packet.append(&data[written..written + n]);
            written += n;
            if packet.len() >= *limit {
                if let Some((packet, _)) = c.cur_write.take() {
                    self.rt.queue_packet(&self.call, &mut c, packet, false);
                }
            }
        }
        Ok(written)
    }

    /// Send whatever is buffered as the last packet of this direction.
    pub async fn flush(&mut self) -> RxResult<()> {
        self.rt.clock.invalidate();
        let has_packet = {
            let c = lock(&self.call.inner);
            RxError::check(c.error)?;
            if c.mode != CallMode::Sending {
                return Ok(());
            }
            c.cur_write.is_some()
        };
        let spare = if has_packet {
            None
        } else {
            Some(self.alloc_send_packet().await?)
        };

        let mut c = lock(&self.call.inner);
        RxError::check(c.error)?;
        if let Some((packet, _)) = c.cur_write.take().or(spare) {
            self.rt.queue_packet(&self.call, &mut c, packet, true);
        }
        c.sent_last = true;
        c.mode = if self.call.conn.is_client() {
            CallMode::Receiving
        } else {
            CallMode::Eof
        };
        Ok(())
    }

    /// Finish the call with status `rc`. A non-zero `rc` aborts it.
    ///
    /// Returns the call's final error, if any.
    pub async fn end(mut self, rc: i32) -> RxResult<()> {
        self.ended = true;
        {
            let mut c = lock(&self.call.inner);
            if rc != 0 && c.error == 0 {
                self.rt.call_error(&self.call, &mut c, rc);
                self.rt.send_call_abort(&self.call, &mut c);
            }
        }

        let (mode, sent_last) = {
            let c = lock(&self.call.inner);
            (c.mode, c.sent_last)
        };
        if self.call.conn.is_client() {
            if mode == CallMode::Sending {
                let mut dummy = [0u8; 1];
                if let Err(err) = self.read(&mut dummy).await {
                    trace!(%err, "call failed while draining reply");
                }
            }
        } else {
            let outcome = match mode {
                _ if sent_last => Ok(()),
                CallMode::Sending => self.flush().await,
                CallMode::Receiving | CallMode::Eof => match self.write(&[]).await {
                    Ok(_) => self.flush().await,
                    Err(err) => Err(err),
                },
                CallMode::Error => Ok(()),
            };
            if let Err(err) = outcome {
                trace!(%err, "call failed while sending reply");
            }
        }

        RxError::check(self.rt.finish_call(&self.call))
    }

    /// Wait for transmit window, then take a send packet sized for the
    /// connection's current packet size.
    async fn alloc_send_packet(&self) -> RxResult<(Packet, usize)> {
        loop {
            {
                let mut c = lock(&self.call.inner);
                RxError::check(c.error)?;
                if c.window_open() {
                    break;
                }
                c.flags.wait_window_alloc = true;
            }
            self.call.window_open.notified().await;
        }

        let mut packet = self.rt.pool.allocate_wait(PacketClass::Send).await;
        let limit = lock(&self.call.conn.inner)
            .max_packet_size
            .saturating_sub(HEADER_SIZE);
        match self.rt.pool.grow_data(&mut packet, limit) {
            Ok(_) => Ok((packet, limit)),
            Err(err) => {
                warn!(%err, limit, "cannot size send packet");
                Ok((packet, FIRST_BUFFER_SIZE.min(limit)))
            }
        }
    }
}

impl Drop for RxCall {
    fn drop(&mut self) {
        if !self.ended {
            self.rt.abandon_call(&self.call);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PacketFlags, PacketPool};

    fn data_packet(pool: &PacketPool, seq: u32, body: &[u8], last: bool) -> Packet {
        let mut packet = pool.allocate(PacketClass::Receive).unwrap();
        packet.header.seq = seq;
        if last {
            packet.header.flags.insert(PacketFlags::LAST_PACKET);
        }
        packet.append(body);
        packet
    }

    #[test]
    fn test_copy_out_stops_at_gap() {
        let pool = PacketPool::new(8, [0, 0, 0], 0);
        let mut c = CallInner::new(&RxConfig::default(), ClockTime::ZERO);
        c.rq.push_back(data_packet(&pool, 1, b"hello ", false));
        c.rq.push_back(data_packet(&pool, 3, b"!", true));
        c.rnext = 2;

        let mut out = [0u8; 16];
        let n = c.copy_out(&mut out);
        assert_eq!(&out[..n], b"hello ");
        assert_eq!(c.mode, CallMode::Sending);
        assert_eq!(c.rq.len(), 1);
    }

    #[test]
    fn test_copy_out_reaches_eof() {
        let pool = PacketPool::new(8, [0, 0, 0], 0);
        let mut c = CallInner::new(&RxConfig::default(), ClockTime::ZERO);
        c.mode = CallMode::Receiving;
        c.rq.push_back(data_packet(&pool, 1, b"ab", false));
        c.rq.push_back(data_packet(&pool, 2, b"cd", true));
        c.rnext = 3;

        let mut out = [0u8; 3];
        assert_eq!(c.copy_out(&mut out), 3);
        assert_eq!(&out, b"abc");
        assert_eq!(c.mode, CallMode::Receiving);

        let mut rest = [0u8; 8];
        assert_eq!(c.copy_out(&mut rest), 1);
        assert_eq!(rest[0], b'd');
        assert_eq!(c.mode, CallMode::Eof);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn test_copy_out_empty_last_packet() {
        let pool = PacketPool::new(4, [0, 0, 0], 0);
        let mut c = CallInner::new(&RxConfig::default(), ClockTime::ZERO);
        c.rq.push_back(data_packet(&pool, 1, b"", true));
        c.rnext = 2;

        let mut out = [0u8; 1];
        assert_eq!(c.copy_out(&mut out), 0);
        assert_eq!(c.mode, CallMode::Eof);
    }

    #[test]
    fn test_window_open() {
        let mut c = CallInner::new(&RxConfig::default(), ClockTime::ZERO);
        assert!(c.window_open());
        c.tnext = 3;
        assert!(!c.window_open());
        c.tfirst = 2;
        assert!(c.window_open());
    }
}
