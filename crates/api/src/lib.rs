#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Read-only status surface of the pipeline.
//!
//! Serves three JSON endpoints over HTTP: `/health` (liveness), `/metrics`
//! (totals and per-pipeline buffer counters), and `/status` (topology
//! overview). The server only reads snapshots produced by the engine; it
//! never mutates pipeline state.

use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, routing::get, Json, Router};
use buffer::BufferStatsSnapshot;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use supervisor::SupervisorStats;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// List of errors that can occur with the status surface.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The configured bind address is not parseable.
    #[error("invalid bind address (addr: {addr}, reason: {error})")]
    InvalidBindAddress {
        /// The configured address.
        addr: String,
        /// The error message.
        error: String,
    },

    /// The TCP listener could not be bound.
    #[error("status server bind failed (addr: {addr}, reason: {error})")]
    BindFailed {
        /// The configured address.
        addr: String,
        /// The error message.
        error: String,
    },

    /// The HTTP server failed while running.
    #[error("status server error (reason: {error})")]
    Server {
        /// The error message.
        error: String,
    },
}

/// Configuration of the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Master switch; a disabled surface is never started.
    #[serde(default)]
    pub enabled: bool,

    /// Bind address of the HTTP listener.
    #[serde(default = "default_addr")]
    pub addr: String,
}

fn default_addr() -> String {
    "127.0.0.1:9000".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_addr(),
        }
    }
}

/// Liveness view served by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Whether the engine is running.
    pub running: bool,
    /// Server time, RFC3339.
    pub time: String,
}

/// Per-pipeline counters served by `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    /// The pipeline name.
    pub name: String,
    /// The buffer counters, absent when buffering is disabled.
    pub buffer: Option<BufferStatsSnapshot>,
}

/// Totals served by `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Records the routing task has drained from the ingress channel.
    pub total_records: u64,
    /// Per-pipeline counters.
    pub pipelines: Vec<PipelineMetrics>,
}

/// One input as shown by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct InputStatus {
    /// The source name.
    pub name: String,
    /// The supervisor view, present when the source is supervised.
    pub supervisor: Option<SupervisorStats>,
}

/// One pipeline as shown by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// The pipeline name.
    pub name: String,
    /// Whether the sink is fronted by an output buffer.
    pub buffered: bool,
    /// Number of filters in the chain.
    pub filters: usize,
    /// The source allow-list; empty accepts all sources.
    pub sources: Vec<String>,
}

/// Topology overview served by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Whether the engine is running.
    pub running: bool,
    /// The configured inputs.
    pub inputs: Vec<InputStatus>,
    /// The configured pipelines.
    pub pipelines: Vec<PipelineStatus>,
    /// Whether the write-ahead log is enabled.
    pub wal_enabled: bool,
    /// Summary of the API configuration itself.
    pub api: ApiConfig,
}

/// Read models the engine exposes to the status surface.
pub trait StatusProvider: Send + Sync + 'static {
    /// The liveness view.
    fn health(&self) -> HealthSnapshot;
    /// The counters view.
    fn metrics(&self) -> MetricsSnapshot;
    /// The topology view.
    fn status(&self) -> StatusSnapshot;
}

#[derive(Clone)]
struct AppState {
    provider: Arc<dyn StatusProvider>,
}

/// A running status server.
pub struct StatusServer {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl StatusServer {
    /// Binds the listener and starts serving until the token is cancelled.
    pub async fn start(
        config: &ApiConfig,
        provider: Arc<dyn StatusProvider>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let addr = config
            .addr
            .parse::<SocketAddr>()
            .map_err(|e| Error::InvalidBindAddress {
                addr: config.addr.clone(),
                error: e.to_string(),
            })?;

        let listener = TcpListener::bind(&addr).await.map_err(|e| Error::BindFailed {
            addr: addr.to_string(),
            error: e.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|e| Error::BindFailed {
            addr: addr.to_string(),
            error: e.to_string(),
        })?;

        let app = Router::new()
            .route("/health", get(show_health))
            .route("/metrics", get(show_metrics))
            .route("/status", get(show_status))
            .with_state(AppState { provider });

        info!(addr = %local_addr, "status server listening");
        let handle = tokio::task::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;
            if let Err(error) = served {
                error!(%error, "status server failed");
            }
        });

        Ok(Self {
            addr: local_addr,
            handle,
        })
    }

    /// The address the server actually bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for the server to finish after its token was cancelled.
    pub async fn join(self) {
        if let Err(error) = self.handle.await {
            error!(%error, "status server join failed");
        }
    }
}

async fn show_health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.provider.health())
}

async fn show_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.provider.metrics())
}

async fn show_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.provider.status())
}

/// Builds the liveness view for a running flag.
pub fn health_snapshot(running: bool) -> HealthSnapshot {
    HealthSnapshot {
        running,
        time: Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    struct TestProvider {}

    impl StatusProvider for TestProvider {
        fn health(&self) -> HealthSnapshot {
            health_snapshot(true)
        }

        fn metrics(&self) -> MetricsSnapshot {
            MetricsSnapshot {
                total_records: 42,
                pipelines: vec![PipelineMetrics {
                    name: "console".to_string(),
                    buffer: None,
                }],
            }
        }

        fn status(&self) -> StatusSnapshot {
            StatusSnapshot {
                running: true,
                inputs: vec![],
                pipelines: vec![],
                wal_enabled: false,
                api: ApiConfig::default(),
            }
        }
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect to status server");
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("send request");
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response).await.expect("read response");
        response
    }

    #[tokio::test]
    async fn serves_health_metrics_and_status() {
        let config = ApiConfig {
            enabled: true,
            addr: "127.0.0.1:0".to_string(),
        };
        let cancel = CancellationToken::new();
        let server = StatusServer::start(&config, Arc::new(TestProvider {}), cancel.clone())
            .await
            .expect("server must start");
        let addr = server.addr();

        let health = http_get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains("\"running\":true"));

        let metrics = http_get(addr, "/metrics").await;
        assert!(metrics.contains("\"total_records\":42"));
        assert!(metrics.contains("console"));

        let status = http_get(addr, "/status").await;
        assert!(status.contains("\"wal_enabled\":false"));

        cancel.cancel();
        server.join().await;
    }
}
