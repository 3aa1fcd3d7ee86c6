//! Graceful shutdown handling for the beacon daemon
//!
//! Listens for SIGINT (Ctrl+C) and SIGTERM and drains the engine before
//! exit.

use crate::backend::Backend;
use tokio::signal;
use tracing::info;

pub struct Handlers;

impl Handlers {
    /// Wait for an OS shutdown signal, then drain the backend.
    pub async fn register_signals(backend: Backend) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl_c");
        }
        Self::handle_shutdown(backend);
    }

    /// Drain queued engine work and stop.
    pub fn handle_shutdown(backend: Backend) {
        info!("shutdown requested, draining engine");
        backend.shutdown();
    }
}
