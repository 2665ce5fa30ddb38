//! Server lifecycle management
//!
//! Starts the heartbeat monitor, the command relay subscriber and the HTTP
//! server, and tears them down in order on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use driftsee_api::{create_router, AppState};
use driftsee_cluster::{Gateway, RedisCommandRelay};
use driftsee_core::Config;

/// Upper bound on waiting for in-flight HTTP requests after shutdown starts
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DriftSeeServer {
    config: Arc<Config>,
    node_id: String,
    gateway: Arc<Gateway>,
    relay: Option<Arc<RedisCommandRelay>>,
}

impl DriftSeeServer {
    pub const fn new(
        config: Arc<Config>,
        node_id: String,
        gateway: Arc<Gateway>,
        relay: Option<Arc<RedisCommandRelay>>,
    ) -> Self {
        Self {
            config,
            node_id,
            gateway,
            relay,
        }
    }

    /// Start all components and wait for shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = self.gateway.heartbeat_monitor();
        let monitor_handle = monitor.start();
        info!("Heartbeat monitor started");

        let relay_handle = self.relay.as_ref().map(|relay| {
            info!("Command relay subscriber started");
            relay.start()
        });

        let mut http_handle = self.start_http_server(shutdown_rx).await?;

        let http_running = tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                false
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                true
            }
        };

        // 1. Stop accepting new requests
        let _ = shutdown_tx.send(true);

        // 2. Close every device connection; pending commands fail fast
        let closed = self.gateway.shutdown().await;
        info!(closed, "Device connections closed");

        // 3. Let in-flight HTTP requests finish
        if http_running
            && tokio::time::timeout(HTTP_DRAIN_TIMEOUT, &mut http_handle)
                .await
                .is_err()
        {
            warn!("HTTP drain timeout reached, proceeding with shutdown");
            http_handle.abort();
        }

        // 4. Background tasks
        monitor.shutdown();
        if let Err(e) = monitor_handle.await {
            error!("Heartbeat monitor task failed: {}", e);
        }
        if let Some(relay) = &self.relay {
            relay.shutdown();
        }
        if let Some(handle) = relay_handle {
            if let Err(e) = handle.await {
                error!("Command relay task failed: {}", e);
            }
        }

        info!("DriftSee gateway stopped");
        Ok(())
    }

    async fn start_http_server(&self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_addr: std::net::SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let state = AppState::new(self.gateway.clone(), self.config.clone(), self.node_id.as_str());
        let http_router = create_router(state);

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, http_router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
