//! Shutdown signal handling.
//!
//! SIGINT (Ctrl-C) and SIGTERM both request a graceful stop: the launcher
//! stops the watchdog, terminates the server and deactivates plugins.

use tokio::signal::unix::{signal, SignalKind};

/// Resolve when the process receives SIGINT or SIGTERM.
///
/// If the SIGTERM handler cannot be installed, only Ctrl-C is awaited.
pub async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("received Ctrl-C, shutting down"),
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
                sigterm.recv().await;
            }
        },
    }
}
