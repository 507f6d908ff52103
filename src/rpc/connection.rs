//! Connections.
//!
//! A connection is identified by `(epoch, cid, side)` and multiplexes up to
//! [`MAX_CALLS`] concurrent calls, one per channel. Serial numbers are
//! per connection and strictly increasing across all of its packets.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::core::constants::*;
use crate::core::{RxConfig, lock};
use crate::security::{SecurityConn, SecurityObject};
use crate::transport::{ClockTime, EventHandle};

use super::call::Call;
use super::peer::Peer;
use super::service::Service;

/// Which side of a connection this runtime is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    /// We initiate calls.
    Client,
    /// We answer calls.
    Server,
}

/// Connection table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub(crate) epoch: u32,
    pub(crate) cid: u32,
    pub(crate) kind: ConnType,
}

impl ConnKey {
    pub(crate) fn new(epoch: u32, cid: u32, kind: ConnType) -> Self {
        Self {
            epoch,
            cid: cid & CID_MASK,
            kind,
        }
    }
}

/// Mutable connection state, guarded by the connection lock.
pub(crate) struct ConnInner {
    pub(crate) peer: Arc<Peer>,
    pub(crate) calls: [Option<Arc<Call>>; MAX_CALLS],
    /// Current call number per channel.
    pub(crate) call_numbers: [u32; MAX_CALLS],
    /// Next serial to send.
    pub(crate) serial: u32,
    /// Serial of the most recent packet received.
    pub(crate) last_serial: u32,
    /// Highest serial received.
    pub(crate) max_serial: u32,
    /// Connection-wide error; non-zero is permanent.
    pub(crate) error: i32,
    /// Tasks waiting in `new_call` for a free channel.
    pub(crate) makecall_waiting: u32,
    pub(crate) destroy_me: bool,
    pub(crate) destroyed: bool,
    /// Outstanding handles on a client connection.
    pub(crate) ref_count: u32,
    /// Largest datagram we currently send on this connection.
    pub(crate) max_packet_size: usize,
    pub(crate) seconds_until_dead: u32,
    pub(crate) seconds_until_ping: u32,
    /// Zero disables the hard limit.
    pub(crate) hard_dead_time: u32,
    /// Zero disables the idle limit.
    pub(crate) idle_dead_time: u32,
    pub(crate) last_send_time: ClockTime,
    pub(crate) challenge_event: Option<EventHandle>,
    pub(crate) security_data: Option<Box<dyn Any + Send>>,
}

impl ConnInner {
    pub(crate) fn set_dead_time(&mut self, seconds: u32) {
        self.seconds_until_dead = seconds;
        self.seconds_until_ping = RxConfig::ping_interval(seconds);
    }

    /// Calls currently installed on any channel.
    pub(crate) fn installed_calls(&self) -> Vec<Arc<Call>> {
        self.calls.iter().flatten().cloned().collect()
    }
}

/// One connection.
pub struct Connection {
    pub(crate) key: ConnKey,
    pub(crate) service_id: u16,
    pub(crate) security_index: u8,
    pub(crate) security: Arc<dyn SecurityObject>,
    pub(crate) service: Option<Arc<Service>>,
    pub(crate) inner: Mutex<ConnInner>,
    /// Wakes one `new_call` waiter when a channel frees up.
    pub(crate) channel_free: Notify,
}

/// Parameters of a new connection.
pub(crate) struct ConnParams {
    pub(crate) key: ConnKey,
    pub(crate) service_id: u16,
    pub(crate) security_index: u8,
    pub(crate) security: Arc<dyn SecurityObject>,
    pub(crate) service: Option<Arc<Service>>,
    pub(crate) peer: Arc<Peer>,
}

impl Connection {
    pub(crate) fn new(params: ConnParams, config: &RxConfig, now: ClockTime) -> Self {
        let ConnParams {
            key,
            service_id,
            security_index,
            security,
            service,
            peer,
        } = params;

        let peer_packet_size = lock(&peer.state).packet_size;
        let (dead_time, idle_dead_time) = match &service {
            Some(service) => (service.conn_dead_time, service.idle_dead_time),
            None => (config.conn_dead_time, 0),
        };

        let mut inner = ConnInner {
            peer,
            calls: Default::default(),
            call_numbers: [0; MAX_CALLS],
            serial: 1,
            last_serial: 0,
            max_serial: 0,
            error: 0,
            makecall_waiting: 0,
            destroy_me: false,
            destroyed: false,
            ref_count: u32::from(key.kind == ConnType::Client),
            max_packet_size: peer_packet_size.min(OLD_MAX_PACKET_SIZE),
            seconds_until_dead: 0,
            seconds_until_ping: 0,
            hard_dead_time: 0,
            idle_dead_time,
            last_send_time: now,
            challenge_event: None,
            security_data: None,
        };
        inner.set_dead_time(dead_time);

        Self {
            key,
            service_id,
            security_index,
            security,
            service,
            inner: Mutex::new(inner),
            channel_free: Notify::new(),
        }
    }

    /// Which side we are.
    pub fn kind(&self) -> ConnType {
        self.key.kind
    }

    /// Connection epoch.
    pub fn epoch(&self) -> u32 {
        self.key.epoch
    }

    /// Connection id without channel bits.
    pub fn cid(&self) -> u32 {
        self.key.cid
    }

    /// Service id.
    pub fn service_id(&self) -> u16 {
        self.service_id
    }

    /// Security class index.
    pub fn security_index(&self) -> u8 {
        self.security_index
    }

    /// Peer this connection talks to.
    pub fn peer(&self) -> Arc<Peer> {
        Arc::clone(&lock(&self.inner).peer)
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        lock(&self.inner).peer.addr()
    }

    /// Connection-wide error code, zero if healthy.
    pub fn error(&self) -> i32 {
        lock(&self.inner).error
    }

    pub(crate) fn is_client(&self) -> bool {
        self.key.kind == ConnType::Client
    }

    /// Run `f` against the security object with this connection's view.
    pub(crate) fn with_security<R>(
        &self,
        f: impl FnOnce(&dyn SecurityObject, &mut SecurityConn<'_>) -> R,
    ) -> R {
        let mut inner = lock(&self.inner);
        let mut view = SecurityConn {
            epoch: self.key.epoch,
            cid: self.key.cid,
            kind: self.key.kind,
            security_index: self.security_index,
            service_id: self.service_id,
            data: &mut inner.security_data,
        };
        f(self.security.as_ref(), &mut view)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("epoch", &self.key.epoch)
            .field("cid", &format_args!("{:#x}", self.key.cid))
            .field("kind", &self.key.kind)
            .field("service_id", &self.service_id)
            .field("security", &self.security.name())
            .finish()
    }
}
