//! # Rx Protocol
//!
//! A connection-oriented RPC transport over UDP.
//!
//! Rx multiplexes up to four concurrent calls over one virtual connection
//! between a client and a server. Each call is a two-phase byte stream:
//! the client sends a request, the server answers with a reply. Data
//! travels in sequenced packets with selective acknowledgement, adaptive
//! retransmission, window based flow control and pluggable security.
//!
//! - **Calls**: request and reply streams with read, write and end
//! - **Reliability**: selective acks, RTT driven retransmit timers,
//!   NACK pull-forward and slow start
//! - **Liveness**: keep-alive pings and dead, idle and hard call timeouts
//! - **Security**: a trait the runtime consults around every packet, with
//!   challenge/response authentication
//!
//! ## Feature Flags
//!
//! - `client` (default): [`client::RxConnection`]
//! - `server` (default): [`server::RxServer`] worker pool
//!
//! ## Modules
//!
//! - [`core`]: constants, errors and configuration (always included)
//! - [`transport`]: packets, pool, clock, timers and sockets
//! - [`security`]: the [`SecurityObject`](security::SecurityObject) trait
//! - [`rpc`]: connections, calls and the runtime
//! - [`client`]: client connections (requires `client` feature)
//! - [`server`]: call execution (requires `server` feature)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rx_protocol::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl CallHandler for Echo {
//!     async fn handle(&self, call: &mut RxCall) -> i32 {
//!         let mut request = Vec::new();
//!         if let Err(err) = call.read_to_end(&mut request).await {
//!             return err.code();
//!         }
//!         match call.write(&request).await {
//!             Ok(_) => 0,
//!             Err(err) => err.code(),
//!         }
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RxConfigBuilder::new()
//!     .bind_addr("127.0.0.1:7000".parse()?)
//!     .build()?;
//! let runtime = RxRuntime::bind(config).await?;
//! runtime.register_service(ServiceBuilder::new(1, Arc::new(Echo)).build()?)?;
//! let server = RxServer::start(&runtime)?;
//!
//! let conn = runtime.new_connection(
//!     "127.0.0.1:7000".parse()?,
//!     1,
//!     Arc::new(NullSecurity::new()),
//!     NULL_SECURITY_INDEX,
//! )?;
//! let reply = conn.call(b"ping").await?;
//! assert_eq!(reply, b"ping");
//!
//! runtime.shutdown();
//! server.join().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod rpc;
pub mod security;
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{RuntimeError, RxConfig, RxConfigBuilder, RxError, RxResult};
    pub use crate::rpc::{CallHandler, CallMode, CallState, RxCall, RxRuntime, Service, ServiceBuilder, StatsSnapshot};
    pub use crate::security::{NULL_SECURITY_INDEX, NullSecurity, SecurityError, SecurityObject};

    #[cfg(feature = "client")]
    pub use crate::client::RxConnection;

    #[cfg(feature = "server")]
    pub use crate::server::{RxServer, ServerError};
}

// Re-export commonly used items at crate root
pub use core::{RuntimeError, RxConfig, RxConfigBuilder, RxError, RxResult};
pub use rpc::{RxCall, RxRuntime};
