//! Echo client.

use std::sync::Arc;
use std::time::Instant;

use rx_protocol::prelude::*;
use tracing::info;

use crate::EchoError;
use crate::config::EchoConfig;

/// Request body for call `n`: a repeating pattern tagged with `n`.
pub fn request_body(n: u32, size: usize) -> Vec<u8> {
    let tag = n.to_be_bytes();
    (0..size.max(tag.len()))
        .map(|i| if i < tag.len() { tag[i] } else { (i % 251) as u8 })
        .collect()
}

/// Make `config.count` echo calls and check every reply.
pub async fn run_client(config: &EchoConfig) -> Result<(), EchoError> {
    let runtime = RxRuntime::bind(RxConfigBuilder::new().bind_addr(config.bind_addr).build()?).await?;
    let conn = runtime.new_connection(
        config.server_addr,
        config.service_id,
        Arc::new(NullSecurity::new()),
        NULL_SECURITY_INDEX,
    )?;

    for n in 0..config.count {
        let request = request_body(n, config.payload_size);
        let started = Instant::now();
        let reply = conn.call(&request).await?;
        if reply != request {
            return Err(EchoError::Mismatch {
                call: n,
                sent: request.len(),
                received: reply.len(),
            });
        }
        info!(call = n, bytes = reply.len(), elapsed = ?started.elapsed(), "echo ok");
    }

    let stats = runtime.stats();
    info!(
        calls = stats.calls_created,
        sent = stats.data_packets_sent,
        resent = stats.data_packets_resent,
        rtt_min = ?stats.rtt_min,
        rtt_max = ?stats.rtt_max,
        "done"
    );
    drop(conn);
    runtime.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body() {
        let body = request_body(258, 8);
        assert_eq!(&body[..4], &[0, 0, 1, 2]);
        assert_eq!(body.len(), 8);
        assert_eq!(body[4], 4);
        // Never shorter than the tag.
        assert_eq!(request_body(1, 0).len(), 4);
    }
}
