//! Health check endpoint.
//!
//! Serves the runtime counters as JSON over HTTP.

use std::net::SocketAddr;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use rx_protocol::RxRuntime;
use rx_protocol::rpc::StatsSnapshot;
use tracing::info;

/// Health status.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HealthStatus {
    /// Whether the runtime is still running.
    pub healthy: bool,
    /// Live connections.
    pub connections: usize,
    /// Known peers.
    pub peers: usize,
    /// Calls created so far.
    pub calls: u64,
    /// Data packets sent, first transmissions only.
    pub data_packets_sent: u64,
    /// Data packets retransmitted.
    pub data_packets_resent: u64,
    /// Free packets in the pool.
    pub free_packets: usize,
    /// Mean RTT in microseconds, if sampled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_rtt_us: Option<u64>,
}

impl HealthStatus {
    /// Build from a counters snapshot.
    pub fn from_stats(healthy: bool, stats: &StatsSnapshot) -> Self {
        let mean_rtt_us = (stats.rtt_samples > 0).then(|| {
            let total = u64::try_from(stats.rtt_total.as_micros()).unwrap_or(u64::MAX);
            total / stats.rtt_samples
        });
        Self {
            healthy,
            connections: stats.connections,
            peers: stats.peers,
            calls: stats.calls_created,
            data_packets_sent: stats.data_packets_sent,
            data_packets_resent: stats.data_packets_resent,
            free_packets: stats.free_packets,
            mean_rtt_us,
        }
    }
}

/// Health check handler.
async fn health_handler(State(runtime): State<RxRuntime>) -> impl IntoResponse {
    let status = HealthStatus::from_stats(!runtime.is_closed(), &runtime.stats());
    let code = if status.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

/// Liveness handler (always returns OK if the process is running).
async fn live_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Start the health check server.
pub async fn start_health_server(
    bind_addr: SocketAddr,
    runtime: RxRuntime,
) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/live", get(live_handler))
        .with_state(runtime);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "health server listening");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rx_protocol::RxConfigBuilder;

    #[tokio::test]
    async fn test_status_of_idle_runtime() {
        let config = RxConfigBuilder::new()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap();
        let runtime = RxRuntime::bind(config).await.unwrap();
        let status = HealthStatus::from_stats(true, &runtime.stats());
        assert!(status.healthy);
        assert_eq!(status.connections, 0);
        assert_eq!(status.mean_rtt_us, None);
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_mean_rtt() {
        let config = RxConfigBuilder::new()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap();
        let runtime = RxRuntime::bind(config).await.unwrap();
        let mut stats = runtime.stats();
        stats.rtt_samples = 4;
        stats.rtt_total = Duration::from_millis(10);
        let status = HealthStatus::from_stats(true, &stats);
        assert_eq!(status.mean_rtt_us, Some(2500));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["mean_rtt_us"], 2500);
        runtime.shutdown();
    }
}
