//! Logging and the metrics scrape endpoint.

use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// `tracing` env-filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Serve a Prometheus scrape endpoint.
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            log_filter: "info,umbra=debug".to_string(),
            metrics_enabled: false,
            metrics_port: 9099,
        }
    }
}

/// Shuts the scrape endpoint down on drop.
pub struct TelemetryGuard {
    metrics_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.metrics_handle.take() {
            handle.abort();
        }
    }
}

/// Initialise the log subscriber and, if enabled, the scrape endpoint.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let metrics_handle = config
        .metrics_enabled
        .then(|| serve_metrics(config.metrics_port));

    Ok(TelemetryGuard { metrics_handle })
}

/// Start the scrape endpoint on its own. Used by the `metrics` subcommand.
pub fn serve_metrics(port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!(port, "serving metrics on http://{addr}");

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(error = ?e, port, "failed to bind metrics endpoint");
                return;
            }
        };

        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "metrics endpoint error");
        }
    })
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = ?e, "failed to encode metrics");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics",
        )
            .into_response();
    }

    (
        [(
            axum::http::header::CONTENT_TYPE,
            encoder.format_type().to_string(),
        )],
        buffer,
    )
        .into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(HealthResponse { status: "ok" })
}
