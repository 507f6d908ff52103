//! Error types for the Rx transport.

use thiserror::Error;

use super::constants::*;

/// Final status of a call.
///
/// This is the closed set of codes the application ever sees from
/// read/write/end_call. Every variant has a wire code, carried in ABORT
/// packets.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RxError {
    /// Peer stopped responding.
    #[error("call dead: peer stopped responding")]
    CallDead,

    /// Operation not valid in the call's current mode.
    #[error("invalid operation for call mode")]
    InvalidOperation,

    /// Call exceeded its idle or hard time limit.
    #[error("call timed out")]
    CallTimeout,

    /// End of data.
    #[error("end of data")]
    Eof,

    /// Peer violated the protocol.
    #[error("protocol error")]
    ProtocolError,

    /// Call aborted locally.
    #[error("call aborted by user")]
    UserAbort,

    /// Local port already in use.
    #[error("address in use")]
    AddrInUse,

    /// Unknown debug request type.
    #[error("bad debug request type")]
    BadDebugType,

    /// Application or security specific abort code.
    #[error("aborted with code {0}")]
    Abort(i32),
}

impl RxError {
    /// Wire code of this error.
    pub fn code(self) -> i32 {
        match self {
            Self::CallDead => RX_CALL_DEAD,
            Self::InvalidOperation => RX_INVALID_OPERATION,
            Self::CallTimeout => RX_CALL_TIMEOUT,
            Self::Eof => RX_EOF,
            Self::ProtocolError => RX_PROTOCOL_ERROR,
            Self::UserAbort => RX_USER_ABORT,
            Self::AddrInUse => RX_ADDRINUSE,
            Self::BadDebugType => RX_DEBUGI_BADTYPE,
            Self::Abort(code) => code,
        }
    }

    /// Map a wire code back to an error. Zero means success.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            RX_CALL_DEAD => Some(Self::CallDead),
            RX_INVALID_OPERATION => Some(Self::InvalidOperation),
            RX_CALL_TIMEOUT => Some(Self::CallTimeout),
            RX_EOF => Some(Self::Eof),
            RX_PROTOCOL_ERROR => Some(Self::ProtocolError),
            RX_USER_ABORT => Some(Self::UserAbort),
            RX_ADDRINUSE => Some(Self::AddrInUse),
            RX_DEBUGI_BADTYPE => Some(Self::BadDebugType),
            other => Some(Self::Abort(other)),
        }
    }

    /// Turn a wire status into a `Result`.
    pub fn check(code: i32) -> Result<(), Self> {
        match Self::from_code(code) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Errors decoding a packet from the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram shorter than required.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },

    /// Unknown packet type byte.
    #[error("unknown packet type: {0}")]
    UnknownType(u8),

    /// Payload does not fit the packet's fragment ceiling.
    #[error("payload of {0} bytes exceeds the fragment ceiling")]
    FragmentCeiling(usize),
}

/// Packet pool errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// No packet available for the requested class.
    #[error("packet pool exhausted")]
    Exhausted,
}

/// Errors setting up or running an Rx runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A service with this id is already registered.
    #[error("service {0} already registered")]
    ServiceExists(u16),

    /// Runtime has been shut down.
    #[error("runtime shut down")]
    Shutdown,

    /// Call level failure.
    #[error("call failed: {0}")]
    Call(#[from] RxError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for call level results.
pub type RxResult<T> = Result<T, RxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_map_back() {
        for err in [
            RxError::CallDead,
            RxError::InvalidOperation,
            RxError::CallTimeout,
            RxError::Eof,
            RxError::ProtocolError,
            RxError::UserAbort,
            RxError::AddrInUse,
            RxError::BadDebugType,
            RxError::Abort(17),
        ] {
            assert_eq!(RxError::from_code(err.code()), Some(err));
        }
    }

    #[test]
    fn test_zero_is_success() {
        assert_eq!(RxError::from_code(0), None);
        assert!(RxError::check(0).is_ok());
        assert_eq!(RxError::check(-1), Err(RxError::CallDead));
    }
}
