//! Client connections.
//!
//! An [`RxConnection`] is a virtual connection to one service on one remote
//! runtime. It multiplexes up to four concurrent calls; further calls wait
//! for a channel to free up.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::core::{RuntimeError, RxError, RxResult, lock};
use crate::rpc::{Connection, RuntimeInner, RxCall, RxRuntime};
use crate::security::SecurityObject;

/// Handle to a client connection.
///
/// Clones share the connection. When the last handle is dropped the
/// connection is destroyed as soon as none of its calls is in progress.
#[derive(Debug)]
pub struct RxConnection {
    rt: Arc<RuntimeInner>,
    conn: Arc<Connection>,
}

impl RxRuntime {
    /// Open a connection to `service_id` at `addr`, protected by
    /// `security` under `security_index`.
    ///
    /// No packet is sent until the first call.
    pub fn new_connection(
        &self,
        addr: SocketAddr,
        service_id: u16,
        security: Arc<dyn SecurityObject>,
        security_index: u8,
    ) -> Result<RxConnection, RuntimeError> {
        RxConnection::open(self.inner(), addr, service_id, security, security_index)
    }
}

impl RxConnection {
    pub(crate) fn open(
        rt: &Arc<RuntimeInner>,
        addr: SocketAddr,
        service_id: u16,
        security: Arc<dyn SecurityObject>,
        security_index: u8,
    ) -> Result<Self, RuntimeError> {
        let conn = rt.new_client_connection(addr, service_id, security, security_index)?;
        Ok(Self {
            rt: Arc::clone(rt),
            conn,
        })
    }

    /// Start a call, waiting for a free channel if all four are busy.
    pub async fn new_call(&self) -> RxResult<RxCall> {
        let call = self.rt.new_call(&self.conn).await?;
        Ok(RxCall::new(Arc::clone(&self.rt), call))
    }

    /// Make a whole call: send `request`, return the complete reply.
    pub async fn call(&self, request: &[u8]) -> RxResult<Vec<u8>> {
        let mut call = self.new_call().await?;
        call.write(request).await?;
        let mut reply = Vec::new();
        call.read_to_end(&mut reply).await?;
        call.end(0).await?;
        Ok(reply)
    }

    /// Seconds of silence after which a call is declared dead. The
    /// keep-alive interval follows from it.
    pub fn set_dead_time(&self, seconds: u32) {
        lock(&self.conn.inner).set_dead_time(seconds);
    }

    /// Absolute limit on a call's duration; zero disables it.
    pub fn set_hard_dead_time(&self, seconds: u32) {
        lock(&self.conn.inner).hard_dead_time = seconds;
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    /// Service the connection talks to.
    pub fn service_id(&self) -> u16 {
        self.conn.service_id()
    }

    /// Connection id, without channel bits.
    pub fn cid(&self) -> u32 {
        self.conn.cid()
    }

    /// Epoch of the owning runtime.
    pub fn epoch(&self) -> u32 {
        self.conn.epoch()
    }

    /// Error the connection failed with, if any.
    pub fn error(&self) -> Option<RxError> {
        RxError::from_code(self.conn.error())
    }
}

impl Clone for RxConnection {
    fn clone(&self) -> Self {
        lock(&self.conn.inner).ref_count += 1;
        Self {
            rt: Arc::clone(&self.rt),
            conn: Arc::clone(&self.conn),
        }
    }
}

impl Drop for RxConnection {
    fn drop(&mut self) {
        {
            let mut inner = lock(&self.conn.inner);
            inner.ref_count = inner.ref_count.saturating_sub(1);
            if inner.ref_count > 0 || inner.destroyed {
                return;
            }
            inner.destroy_me = true;
        }
        debug!(cid = format_args!("{:#x}", self.conn.cid()), "connection released");
        self.rt.destroy_client_connection(&self.conn);
    }
}
