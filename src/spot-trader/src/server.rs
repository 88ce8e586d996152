//! Health and metrics HTTP surface.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tracing::info;

use crate::metrics;

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler() -> String {
    metrics::render()
}

/// Bind and serve `/healthz` and `/metrics` until the process exits.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind http listener on {}", addr))?;
    info!("[HTTP] serving /healthz and /metrics on {}", addr);
    axum::serve(listener, app).await.context("http server")?;
    Ok(())
}
