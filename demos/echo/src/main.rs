//! Rx Echo Example
//!
//! Runs an echo service or a client that calls it.
//!
//! Environment variables:
//! - RX_MODE: "server" (default) or "client"
//! - RX_BIND_ADDR: Rx listener address (server default 0.0.0.0:7000)
//! - RX_SERVER_ADDR: server to call (client only, default 127.0.0.1:7000)
//! - RX_SERVICE_ID: service id (default 1)
//! - RX_HEALTH_ADDR: HTTP health endpoint (server only, default 0.0.0.0:8080)
//! - RX_COUNT: number of calls (client only, default 10)
//! - RX_PAYLOAD_SIZE: request size in bytes (client only, default 64)
//! - RX_LOG: tracing filter, e.g. `info,rx_protocol=debug`

mod client;
mod config;
mod health;
mod server;

use std::process::ExitCode;

use rx_protocol::prelude::*;
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, EchoConfig, Mode};

/// Errors that end the demo.
#[derive(Debug, Error)]
pub enum EchoError {
    /// Bad environment.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Runtime setup failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Server setup failed.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// A call failed.
    #[error("call failed: {0}")]
    Call(#[from] RxError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The reply differed from the request.
    #[error("call {call}: sent {sent} bytes, got {received} back")]
    Mismatch {
        /// Call index.
        call: u32,
        /// Request length.
        sent: usize,
        /// Reply length.
        received: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("RX_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let outcome = match EchoConfig::from_env() {
        Ok(config) => match config.mode {
            Mode::Server => server::run_server(&config).await,
            Mode::Client => client::run_client(&config).await,
        },
        Err(err) => Err(err.into()),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "rx-echo failed");
            ExitCode::FAILURE
        }
    }
}
