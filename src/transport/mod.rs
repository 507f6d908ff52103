//! Rx Protocol - Transport Layer
//!
//! The building blocks the call engine is made of:
//!
//! - **Clock**: [`Clock`] cached monotonic time
//! - **Timers**: [`EventQueue`] one-shot, cancellable scheduled tasks
//! - **Framing**: [`Header`], [`Packet`], [`AckPacket`] wire formats
//! - **Buffers**: [`PacketPool`] with per-class reserves
//! - **RTT estimation**: [`RttEstimator`]
//! - **Sockets**: [`Transport`] and the tokio backed [`RxSocket`]
//!
//! Nothing here knows about calls. The `rpc` layer owns the per-call state
//! and drives these pieces from the listener task.

mod ack;
mod clock;
mod event;
mod packet;
mod pool;
mod socket;
mod timing;

pub use ack::*;
pub use clock::*;
pub use event::*;
pub use packet::*;
pub use pool::*;
#[cfg(test)]
pub(crate) use socket::MemoryTransport;
pub use socket::{DEFAULT_RECV_BUFFER_SIZE, RxSocket, RxSocketBuilder, Transport};
pub use timing::RttEstimator;
