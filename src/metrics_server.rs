//! Prometheus exposition at `GET /metrics`.

use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::selector::SelectorError;

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

pub fn router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

/// Serves `handle` on `listener` until `cancel` fires, draining histograms periodically.
pub fn spawn(
    listener: TcpListener,
    handle: PrometheusHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let upkeep_handle = handle.clone();
    let upkeep_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPKEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = upkeep_cancel.cancelled() => break,
                _ = interval.tick() => upkeep_handle.run_upkeep(),
            }
        }
    });

    tokio::spawn(async move {
        let app = router(handle);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            error!(error = %e, "Metrics server failed.");
        }
    })
}

/// Binds the listener and installs the global recorder. Either failing is fatal.
pub async fn start(port: u16, cancel: CancellationToken) -> Result<JoinHandle<()>, SelectorError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        SelectorError::Metrics(format!("failed to bind metrics listener on {addr}: {e}"))
    })?;
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| SelectorError::Metrics(format!("failed to install Prometheus recorder: {e}")))?;

    info!(%addr, "Metrics server listening.");
    Ok(spawn(listener, handle, cancel))
}
