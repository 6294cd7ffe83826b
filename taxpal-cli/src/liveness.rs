use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::GatewayClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Checking,
    Online,
    Offline,
}

impl ServerStatus {
    pub fn label(self) -> &'static str {
        match self {
            ServerStatus::Checking => "Checking...",
            ServerStatus::Online => "Online",
            ServerStatus::Offline => "Offline",
        }
    }
}

/// Tracks whether the gateway answers its health route.
pub struct LivenessProber {
    gateway: GatewayClient,
    status: watch::Sender<ServerStatus>,
}

impl LivenessProber {
    pub fn new(gateway: GatewayClient) -> Self {
        Self {
            gateway,
            status: watch::Sender::new(ServerStatus::Checking),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.borrow()
    }

    /// Records a failure seen outside the health route, waking the monitor.
    pub fn mark_offline(&self) {
        self.status.send_replace(ServerStatus::Offline);
    }

    /// Runs one health check and publishes the result.
    pub async fn probe(&self) -> ServerStatus {
        self.status.send_replace(ServerStatus::Checking);

        let status = match self.gateway.health().await {
            Ok(health) if health.is_ok() => {
                debug!(api_key_configured = health.api_key_configured, "Server is online");
                if !health.api_key_configured {
                    warn!("Server is up but has no API key configured");
                }
                ServerStatus::Online
            }
            Ok(health) => {
                warn!(status = %health.status, "Server reported an unexpected status");
                ServerStatus::Offline
            }
            Err(e) => {
                warn!(error = %e, url = self.gateway.base_url(), "Server check failed");
                ServerStatus::Offline
            }
        };

        self.status.send_replace(status);
        status
    }

    /// Probes once, then keeps re-probing every `interval` for as long as the
    /// server stays offline. While online the monitor idles until something
    /// else publishes `Offline`.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let prober = Arc::clone(self);
        tokio::spawn(async move {
            let mut status_rx = prober.subscribe();
            let mut current = prober.probe().await;

            loop {
                let offline = current == ServerStatus::Offline;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        current = *status_rx.borrow_and_update();
                    }
                    _ = tokio::time::sleep(interval), if offline => {
                        info!("Re-checking offline server");
                        current = prober.probe().await;
                    }
                }
            }
            debug!("Liveness monitor stopped");
        })
    }
}
