//! Echo service.

use std::sync::Arc;

use async_trait::async_trait;
use rx_protocol::prelude::*;
use tracing::{info, warn};

use crate::EchoError;
use crate::config::EchoConfig;
use crate::health::start_health_server;

/// Answers every call with the request bytes.
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl CallHandler for EchoHandler {
    async fn handle(&self, call: &mut RxCall) -> i32 {
        let mut request = Vec::new();
        if let Err(err) = call.read_to_end(&mut request).await {
            return err.code();
        }
        match call.write(&request).await {
            Ok(_) => 0,
            Err(err) => err.code(),
        }
    }
}

/// Serve echo calls until Ctrl-C.
pub async fn run_server(config: &EchoConfig) -> Result<(), EchoError> {
    let runtime = RxRuntime::bind(RxConfigBuilder::new().bind_addr(config.bind_addr).build()?).await?;
    runtime.register_service(
        ServiceBuilder::new(config.service_id, Arc::new(EchoHandler))
            .name("echo")
            .procs(2, 4)
            .build()?,
    )?;
    let server = RxServer::start(&runtime)?;
    info!(addr = %runtime.local_addr()?, service_id = config.service_id, "echo server ready");

    let health = tokio::spawn(start_health_server(config.health_addr, runtime.clone()));
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    runtime.shutdown();
    health.abort();
    server.join().await?;
    let stats = runtime.stats();
    if stats.fatal_errors > 0 {
        warn!(fatal_errors = stats.fatal_errors, "connections failed during the run");
    }
    Ok(())
}
