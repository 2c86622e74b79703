//! Prometheus endpoint for blobtail.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Routes:
/// - `/metrics`: Prometheus text format
/// - `/health`: always `ok`
///
/// Must be called from within a tokio runtime.
pub fn init(addr: SocketAddr) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    tokio::spawn(serve(addr, handle));

    Ok(())
}

async fn serve(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(health))
        .layer(Extension(handle));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind metrics server");
            return;
        }
    };

    info!(%addr, "Metrics endpoint listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Metrics server error");
    }
}

async fn render_metrics(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health() -> &'static str {
    "ok\n"
}
