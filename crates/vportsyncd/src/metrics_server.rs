//! HTTP server for the Prometheus metrics endpoint
//!
//! Serves `/metrics` in Prometheus text format and `/health` for liveness
//! probes. Plain HTTP on a local address; put a TLS-terminating proxy in
//! front when exporting off-box.

use crate::error::{Result, VportsyncError};
use crate::metrics::MetricsCollector;
use axum::{Router, routing::get};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Default metrics port
pub const DEFAULT_METRICS_PORT: u16 = 9091;

/// Configuration for the metrics server
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    pub listen_addr: SocketAddr,
}

impl MetricsServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self { listen_addr }
    }
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::LOCALHOST,
            DEFAULT_METRICS_PORT,
            0,
            0,
        )))
    }
}

/// Bound metrics HTTP server
pub struct MetricsServer {
    listener: TcpListener,
    metrics: Arc<MetricsCollector>,
}

impl MetricsServer {
    /// Bind the listen address
    pub async fn bind(config: MetricsServerConfig, metrics: Arc<MetricsCollector>) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await.map_err(|e| {
            VportsyncError::Configuration(format!(
                "Failed to bind metrics server to {}: {}",
                config.listen_addr, e
            ))
        })?;
        Ok(Self { listener, metrics })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until the task is dropped
    pub async fn serve(self) -> Result<()> {
        let metrics = self.metrics.clone();
        let app = Router::new()
            .route(
                "/metrics",
                get(move || {
                    let metrics_text = metrics.gather_metrics();
                    async move { metrics_text }
                }),
            )
            .route("/health", get(|| async { "ok" }));

        info!(addr = %self.local_addr()?, "Metrics server listening");
        axum::serve(self.listener, app).await?;
        Ok(())
    }
}

/// Bind and serve metrics in a background task
pub async fn spawn_metrics_server(
    config: MetricsServerConfig,
    metrics: Arc<MetricsCollector>,
) -> Result<tokio::task::JoinHandle<Result<()>>> {
    let server = MetricsServer::bind(config, metrics).await?;
    Ok(tokio::spawn(server.serve()))
}
