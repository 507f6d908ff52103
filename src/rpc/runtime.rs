//! The runtime: shared tables, the timer queue and the listener task.
//!
//! All engine state hangs off one [`RuntimeInner`]. The listener task
//! reads datagrams and runs due timer events; application tasks drive
//! their calls directly through the same shared state. Locks are taken in
//! the order call → connection → peer; the event, pool and dispatch locks
//! are leaves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::core::constants::*;
use crate::core::{RuntimeError, RxConfig, RxError, lock};
use crate::security::SecurityObject;
use crate::transport::{
    AckReason, Clock, ClockTime, EventHandle, EventQueue, PacketPool, PoolStats, RxSocket, Transport,
};

use super::call::Call;
use super::connection::{ConnKey, ConnParams, ConnType, Connection};
use super::dispatch::Dispatcher;
use super::peer::{Peer, PeerInfo};
use super::service::Service;
use super::stats::{RxStats, StatsSnapshot, TableCounts, bump};
use super::transmit::security_code;

/// Listener wake-up interval when no timer is pending.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Scheduled engine work.
#[derive(Debug)]
pub(crate) enum Task {
    Resend(Arc<Call>),
    KeepAlive(Arc<Call>),
    DelayedAck(Arc<Call>),
    Challenge(Arc<Connection>),
    /// Restore burst budget.
    Decongest(Arc<Peer>, u32),
    Reap,
}

/// Shared engine state.
#[derive(Debug)]
pub(crate) struct RuntimeInner {
    pub(crate) config: RxConfig,
    pub(crate) clock: Clock,
    pub(crate) pool: PacketPool,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) stats: RxStats,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) conns: Mutex<HashMap<ConnKey, Arc<Connection>>>,
    pub(crate) peers: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
    pub(crate) services: Mutex<HashMap<u16, Arc<Service>>>,
    events: Mutex<EventQueue<Task>>,
    /// Poked when a new earliest event is posted.
    timer_changed: Arc<Notify>,
    shutdown: Notify,
    closed: AtomicBool,
    epoch: u32,
    next_cid: AtomicU32,
}

impl RuntimeInner {
    pub(crate) fn new(config: RxConfig, transport: Arc<dyn Transport>, clock: Clock) -> Arc<Self> {
        let epoch = config.epoch.unwrap_or_else(rand::random);
        let first_cid = (rand::random::<u32>() << CID_SHIFT) & CID_MASK;
        let timer_changed = Arc::new(Notify::new());
        let pool = PacketPool::new(config.packets, config.quotas, config.data_quota);
        clock.invalidate();

        let rt = Arc::new(Self {
            config,
            clock,
            pool,
            transport,
            stats: RxStats::default(),
            dispatcher: Dispatcher::default(),
            conns: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            events: Mutex::new(EventQueue::with_waker(Arc::clone(&timer_changed))),
            timer_changed,
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            epoch,
            next_cid: AtomicU32::new(first_cid),
        });
        rt.post_event(rt.clock.now() + rt.config.reap_interval, Task::Reap);
        rt
    }

    pub(crate) fn epoch(&self) -> u32 {
        self.epoch
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn post_event(&self, at: ClockTime, task: Task) -> EventHandle {
        lock(&self.events).post(at, task)
    }

    /// Cancel the event behind `handle`, if any, and clear it.
    pub(crate) fn cancel_event(&self, handle: &mut Option<EventHandle>) {
        if handle.is_some() {
            let task = lock(&self.events).cancel(handle);
            drop(task);
        }
    }

    pub(crate) fn event_pending(&self, handle: &EventHandle) -> bool {
        lock(&self.events).is_pending(handle)
    }

    /// Fire every due event. Returns the time until the next one.
    pub(crate) fn run_due_events(&self) -> Option<Duration> {
        let now = self.clock.invalidate();
        loop {
            let due = lock(&self.events).pop_due(now);
            let Some((handle, task)) = due else {
                break;
            };
            self.fire(handle, task);
        }
        lock(&self.events).time_until_next(self.clock.now())
    }

    fn fire(&self, handle: EventHandle, task: Task) {
        match task {
            Task::Resend(call) => {
                let mut c = lock(&call.inner);
                if c.resend_event != Some(handle) {
                    return;
                }
                c.resend_event = None;
                self.start_transmission(&call, &mut c);
            }
            Task::KeepAlive(call) => self.keepalive_event(&call, handle),
            Task::DelayedAck(call) => {
                let mut c = lock(&call.inner);
                if c.delayed_ack_event != Some(handle) {
                    return;
                }
                c.delayed_ack_event = None;
                self.send_ack(&call, &mut c, None, AckReason::Delay);
            }
            Task::Challenge(conn) => {
                {
                    let mut inner = lock(&conn.inner);
                    if inner.challenge_event != Some(handle) || inner.destroyed {
                        return;
                    }
                    inner.challenge_event = None;
                }
                self.send_challenge(&conn);
            }
            Task::Decongest(peer, count) => self.decongest(&peer, count),
            Task::Reap => self.reap(),
        }
    }

    /// The peer for `addr`, created on first use, with one more reference.
    pub(crate) fn find_peer(&self, addr: SocketAddr) -> Arc<Peer> {
        let mut peers = lock(&self.peers);
        let peer = peers
            .entry(addr)
            .or_insert_with(|| Arc::new(Peer::new(addr, &self.config)));
        lock(&peer.state).hold();
        Arc::clone(peer)
    }

    pub(crate) fn release_peer(&self, peer: &Peer) {
        lock(&peer.state).release(self.clock.now());
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        let pool = self.pool.stats();
        let tables = TableCounts {
            connections: lock(&self.conns).len(),
            peers: lock(&self.peers).len(),
            free_packets: pool.free,
            total_packets: pool.total,
        };
        self.stats.snapshot(tables)
    }

    pub(crate) fn register_service(&self, service: Service) -> Result<Arc<Service>, RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::Shutdown);
        }
        let service = Arc::new(service);
        {
            let mut services = lock(&self.services);
            if services.contains_key(&service.id) {
                return Err(RuntimeError::ServiceExists(service.id));
            }
            services.insert(service.id, Arc::clone(&service));
        }
        self.dispatcher.register(&service);
        info!(
            service_id = service.id,
            name = %service.name,
            min_procs = service.min_procs,
            max_procs = service.max_procs,
            "service registered"
        );
        Ok(service)
    }

    /// Open a client connection to `addr`.
    pub(crate) fn new_client_connection(
        &self,
        addr: SocketAddr,
        service_id: u16,
        security: Arc<dyn SecurityObject>,
        security_index: u8,
    ) -> Result<Arc<Connection>, RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::Shutdown);
        }
        let cid = self.next_cid.fetch_add(1 << CID_SHIFT, Ordering::Relaxed) & CID_MASK;
        let key = ConnKey::new(self.epoch, cid, ConnType::Client);
        let peer = self.find_peer(addr);
        let conn = Arc::new(Connection::new(
            ConnParams {
                key,
                service_id,
                security_index,
                security,
                service: None,
                peer,
            },
            &self.config,
            self.clock.invalidate(),
        ));
        if let Err(err) = conn.with_security(|security, view| security.new_connection(view)) {
            self.release_peer(&conn.peer());
            let code = security_code(err);
            return Err(RxError::from_code(code).unwrap_or(RxError::ProtocolError).into());
        }

        lock(&self.conns).insert(key, Arc::clone(&conn));
        bump(&self.stats.client_conns_created);
        debug!(%addr, cid = format_args!("{:#x}", cid), service_id, "new client connection");
        Ok(conn)
    }

    /// Read datagrams and run timers until shutdown.
    async fn listen(self: Arc<Self>, socket: RxSocket) {
        let mut buf = vec![0u8; socket.recv_buffer_size()];
        while !self.is_closed() {
            let wait = self.run_due_events().unwrap_or(IDLE_WAIT);
            tokio::select! {
                _ = self.shutdown.notified() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        self.clock.invalidate();
                        self.receive_datagram(&buf[..len], from);
                    }
                    Err(err) => debug!(%err, "receive failed"),
                },
                _ = tokio::time::sleep(wait) => {}
                _ = self.timer_changed.notified() => {}
            }
        }
        debug!("listener stopped");
    }

    /// Fail every call, tear down every connection and stop the listener.
    pub(crate) fn finalize(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.close();
        let conns: Vec<Arc<Connection>> = lock(&self.conns).values().cloned().collect();
        for conn in &conns {
            self.connection_error(conn, RX_CALL_DEAD);
        }
        for conn in &conns {
            self.destroy_connection(conn);
        }
        lock(&self.events).clear();
        lock(&self.peers).clear();
        self.pool.wake_waiters();
        self.shutdown.notify_one();
        info!(epoch = self.epoch, connections = conns.len(), "runtime shut down");
    }
}

/// A running Rx endpoint.
///
/// One runtime owns one UDP socket and serves both directions: it opens
/// client connections and answers calls for registered services. Cloning
/// is cheap; every clone drives the same endpoint. The listener keeps
/// running until [`shutdown`](Self::shutdown).
#[derive(Debug, Clone)]
pub struct RxRuntime {
    inner: Arc<RuntimeInner>,
}

impl RxRuntime {
    /// Bind `config.bind_addr` and start the listener.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(config: RxConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let socket = RxSocket::bind(config.bind_addr).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::AddrInUse {
                RuntimeError::Call(RxError::AddrInUse)
            } else {
                RuntimeError::Io(err)
            }
        })?;
        Self::from_socket(config, socket)
    }

    /// Start the listener on an already bound socket.
    pub fn from_socket(config: RxConfig, socket: RxSocket) -> Result<Self, RuntimeError> {
        config.validate()?;
        let transport: Arc<dyn Transport> = Arc::new(socket.clone());
        let local = transport.local_addr()?;
        let inner = RuntimeInner::new(config, transport, Clock::new());
        info!(
            %local,
            epoch = inner.epoch,
            packets = inner.config.packets,
            window = inner.config.window,
            "rx runtime started"
        );
        tokio::spawn(Arc::clone(&inner).listen(socket));
        Ok(Self { inner })
    }

    /// Local socket address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.transport.local_addr()
    }

    /// Epoch identifying this runtime's client connections.
    pub fn epoch(&self) -> u32 {
        self.inner.epoch
    }

    /// Configuration in effect.
    pub fn config(&self) -> &RxConfig {
        &self.inner.config
    }

    /// Register a service so incoming calls for it are accepted.
    ///
    /// Calls only run once an [`RxServer`](crate::server::RxServer) is
    /// started on this runtime.
    pub fn register_service(&self, service: Service) -> Result<Arc<Service>, RuntimeError> {
        self.inner.register_service(service)
    }

    /// Snapshot of the runtime counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.snapshot()
    }

    /// Snapshot of the packet pool.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Congestion state of every known peer.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let peers: Vec<Arc<Peer>> = lock(&self.inner.peers).values().cloned().collect();
        peers.iter().map(|peer| peer.info()).collect()
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Fail all calls with [`RxError::CallDead`], destroy all connections
    /// and stop the listener. Idempotent.
    pub fn shutdown(&self) {
        self.inner.finalize();
    }

    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }
}
