//! Rx Protocol - Security Layer
//!
//! A connection binds to one [`SecurityObject`]. The runtime calls it at
//! fixed points (connection setup and teardown, before every send, after
//! every receive, and during the challenge/response handshake) but
//! implements no cryptography itself. Every method has a permissive
//! default, so a class only overrides what it enforces.
//!
//! ```text
//! server                               client
//!   │ first call packet, not authenticated │
//!   │ ── CHALLENGE (get_challenge) ──────► │
//!   │ ◄──────────── RESPONSE (get_response)│
//!   │ check_response                       │
//!   │ waiting calls attach to workers      │
//! ```

mod null;

use std::any::Any;
use std::fmt;

use thiserror::Error;

use crate::rpc::ConnType;
use crate::transport::Packet;

pub use null::{NULL_SECURITY_INDEX, NullSecurity};

/// Errors reported by a security object.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SecurityError {
    /// Soft rejection; the handshake may be repeated.
    #[error("authentication must be retried")]
    Retry,

    /// Hard failure; the connection enters a permanent error state.
    #[error("security failure with code {0}")]
    Fatal(i32),
}

/// Per-connection view handed to a security object.
pub struct SecurityConn<'a> {
    /// Connection epoch.
    pub epoch: u32,
    /// Connection id without channel bits.
    pub cid: u32,
    /// Which side of the connection this is.
    pub kind: ConnType,
    /// Security class index negotiated for the connection.
    pub security_index: u8,
    /// Service the connection talks to.
    pub service_id: u16,
    /// Private per-connection state owned by the security object.
    pub data: &'a mut Option<Box<dyn Any + Send>>,
}

impl fmt::Debug for SecurityConn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConn")
            .field("epoch", &self.epoch)
            .field("cid", &self.cid)
            .field("kind", &self.kind)
            .field("security_index", &self.security_index)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

/// Counters a security object reports for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityStats {
    /// Protection level in effect.
    pub level: u32,
    /// Packets protected on send.
    pub packets_sent: u64,
    /// Packets checked on receive.
    pub packets_received: u64,
    /// Payload bytes protected on send.
    pub bytes_sent: u64,
    /// Payload bytes checked on receive.
    pub bytes_received: u64,
}

/// Pluggable authentication and packet protection.
pub trait SecurityObject: Send + Sync + fmt::Debug {
    /// Short class name for logs.
    fn name(&self) -> &'static str;

    /// A connection bound to this object was created.
    fn new_connection(&self, _conn: &mut SecurityConn<'_>) -> Result<(), SecurityError> {
        Ok(())
    }

    /// A connection bound to this object is being destroyed.
    fn destroy_connection(&self, _conn: &mut SecurityConn<'_>) {}

    /// Protect an outgoing packet in place.
    fn prepare_outgoing(
        &self,
        _conn: &mut SecurityConn<'_>,
        _packet: &mut Packet,
    ) -> Result<(), SecurityError> {
        Ok(())
    }

    /// Verify and unwrap an incoming call packet in place.
    fn check_incoming(
        &self,
        _conn: &mut SecurityConn<'_>,
        _packet: &mut Packet,
    ) -> Result<(), SecurityError> {
        Ok(())
    }

    /// Whether the server side of the connection has authenticated its
    /// client.
    fn check_authentication(&self, _conn: &mut SecurityConn<'_>) -> bool {
        true
    }

    /// Prepare server-side state for a challenge.
    fn create_challenge(&self, _conn: &mut SecurityConn<'_>) -> Result<(), SecurityError> {
        Ok(())
    }

    /// Fill the payload of a CHALLENGE packet.
    fn get_challenge(
        &self,
        _conn: &mut SecurityConn<'_>,
        _challenge: &mut Packet,
    ) -> Result<(), SecurityError> {
        Ok(())
    }

    /// Client side: answer a challenge by filling a RESPONSE packet.
    fn get_response(
        &self,
        _conn: &mut SecurityConn<'_>,
        _challenge: &Packet,
        _response: &mut Packet,
    ) -> Result<(), SecurityError> {
        Ok(())
    }

    /// Server side: verify the client's RESPONSE.
    fn check_response(
        &self,
        _conn: &mut SecurityConn<'_>,
        _response: &Packet,
    ) -> Result<(), SecurityError> {
        Ok(())
    }

    /// Per-connection counters.
    fn stats(&self, _conn: &mut SecurityConn<'_>) -> SecurityStats {
        SecurityStats::default()
    }
}
