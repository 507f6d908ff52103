//! Datagram transport.
//!
//! The engine sends through the [`Transport`] trait; [`RxSocket`] is the
//! tokio UDP implementation and also feeds the listener loop.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::trace;

use crate::core::constants::MAX_PACKET_SIZE;

/// Default receive buffer size.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;

/// Outbound half of a datagram socket.
///
/// Sends never block: a datagram that cannot be queued right now is
/// dropped like any other lost packet.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send one datagram.
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()>;

    /// Local address, if bound.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Async UDP socket shared between the listener and senders.
#[derive(Debug, Clone)]
pub struct RxSocket {
    /// The underlying UDP socket.
    socket: Arc<UdpSocket>,
    /// Receive buffer size the listener should use.
    recv_buffer_size: usize,
}

impl RxSocket {
    /// Create a socket bound to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        RxSocketBuilder::new().bind(addr).await
    }

    /// Wrap an existing UDP socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        RxSocketBuilder::new().from_socket(socket)
    }

    /// Receive buffer size the listener should use.
    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer_size
    }

    /// Receive one datagram into `buf`.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// The tokio socket this wraps.
    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }
}

impl Transport for RxSocket {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        match self.socket.try_send_to(data, addr) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(%addr, len = data.len(), "socket busy, datagram dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Builder for creating Rx sockets with custom options.
#[derive(Debug, Clone)]
pub struct RxSocketBuilder {
    recv_buffer_size: usize,
}

impl Default for RxSocketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RxSocketBuilder {
    /// Create a new socket builder with default options.
    pub fn new() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }

    /// Set the receive buffer size; never below the largest Rx packet.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(MAX_PACKET_SIZE);
        self
    }

    /// Bind to the given address and create a socket.
    pub async fn bind(self, addr: SocketAddr) -> io::Result<RxSocket> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(self.from_socket(socket))
    }

    /// Create a socket from an existing UDP socket.
    pub fn from_socket(self, socket: UdpSocket) -> RxSocket {
        RxSocket {
            socket: Arc::new(socket),
            recv_buffer_size: self.recv_buffer_size,
        }
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryTransport;

#[cfg(test)]
mod memory {
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use super::Transport;
    use crate::core::lock;
    use crate::transport::Header;

    /// Transport that records every datagram instead of sending it.
    #[derive(Debug)]
    pub(crate) struct MemoryTransport {
        local: SocketAddr,
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl MemoryTransport {
        pub(crate) fn new(local: SocketAddr) -> Self {
            Self {
                local,
                sent: Mutex::new(Vec::new()),
            }
        }

        /// Drain recorded datagrams.
        pub(crate) fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
            std::mem::take(&mut *lock(&self.sent))
        }

        /// Drain recorded datagrams, decoding their headers.
        pub(crate) fn take_headers(&self) -> Vec<(Header, Vec<u8>)> {
            self.take()
                .into_iter()
                .filter_map(|(_, bytes)| {
                    let header = Header::from_bytes(&bytes).ok()?;
                    Some((header, bytes[crate::core::constants::HEADER_SIZE..].to_vec()))
                })
                .collect()
        }
    }

    impl Transport for MemoryTransport {
        fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
            lock(&self.sent).push((addr, data.to_vec()));
            Ok(())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local)
        }
    }
}
