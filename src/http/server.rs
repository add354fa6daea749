use crate::db::{ConnectionRegistry, Connector};
use crate::error::{PortalError, PortalResult};
use axum::Router;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Requests still in flight this long after a shutdown signal are dropped.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve `app` until SIGINT/SIGTERM, then close every pooled connection.
///
/// A second signal during the drain forces an immediate exit.
pub async fn serve<C: Connector>(
    app: Router,
    bind_addr: &str,
    registry: ConnectionRegistry<C>,
) -> PortalResult<()> {
    let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
        PortalError::internal(format!("Failed to bind to {}: {}", bind_addr, e))
    })?;
    info!(addr = %bind_addr, "HTTP server listening");

    let shutdown_notify = std::sync::Arc::new(tokio::sync::Notify::new());
    let notify = shutdown_notify.clone();
    let shutdown_signal = async move {
        wait_for_signal().await;
        notify.notify_one();
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
                registry.close_all().await;
                return Err(PortalError::internal(format!("HTTP server error: {}", e)));
            }
            info!("HTTP server stopped");
        }
        _ = async {
            shutdown_notify.notified().await;
            info!(
                timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                "Draining in-flight requests (send the signal again to force exit)"
            );
            tokio::select! {
                _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => warn!("Graceful shutdown timed out"),
                _ = wait_for_signal() => warn!("Second signal received, exiting now"),
            }
        } => {}
    }

    info!("Closing database connections");
    registry.close_all().await;
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
