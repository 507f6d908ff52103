//! Rx Protocol - RPC Layer
//!
//! Connections, calls and the engine that moves packets between them.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Application (RxConnection, RxServer)   │
//! ├─────────────────────────────────────────┤
//! │  RPC Layer (calls, flow control)        │  ← This module
//! ├─────────────────────────────────────────┤
//! │  Transport (packets, pool, timers)      │
//! ├─────────────────────────────────────────┤
//! │  UDP                                    │
//! └─────────────────────────────────────────┘
//! ```

mod call;
mod connection;
mod dispatch;
mod liveness;
mod peer;
mod receive;
mod runtime;
mod service;
mod stats;
mod transmit;

pub use call::{Call, CallMode, CallState, RxCall};
pub use connection::{ConnType, Connection};
pub use peer::{Peer, PeerInfo};
pub use runtime::RxRuntime;
pub use service::{CallHandler, Service, ServiceBuilder, ServiceData};
pub use stats::{PACKET_TYPE_COUNT, StatsSnapshot};

pub(crate) use runtime::RuntimeInner;

#[cfg(test)]
pub(crate) use runtime::tests::TestRuntime;
