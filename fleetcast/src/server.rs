use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use fleetcast_api::create_router;
use fleetcast_cluster::discovery::{KubePodFeed, KubePodFeedConfig};
use fleetcast_cluster::gateway::{ModuleGateway, TargetSource};
use fleetcast_cluster::{InstanceRegistry, Synchronizer};
use fleetcast_core::{Config, DiscoveryMode};

const SYNCHRONIZER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Running instance discovery
pub struct Discovery {
    pub targets: TargetSource,
    synchronizer: Option<(Synchronizer, JoinHandle<()>)>,
}

impl Discovery {
    /// Stop the synchronizer (if any) and wait for its loop to exit.
    pub async fn stop(self) {
        let Some((synchronizer, handle)) = self.synchronizer else {
            return;
        };

        synchronizer.stop();
        match tokio::time::timeout(SYNCHRONIZER_STOP_TIMEOUT, handle).await {
            Ok(Ok(())) => info!("Synchronizer stopped"),
            Ok(Err(e)) => error!(error = %e, "Synchronizer task failed"),
            Err(_) => warn!("Synchronizer did not stop in time"),
        }
    }
}

/// Build the broadcast target source for the configured discovery mode.
pub async fn start_discovery(config: &Config) -> Result<Discovery> {
    match config.discovery.mode {
        DiscoveryMode::Static => {
            info!(
                host = %config.discovery.static_host,
                port = config.discovery.static_port,
                "Using static module endpoint"
            );
            Ok(Discovery {
                targets: TargetSource::fixed(&config.discovery.static_host, config.discovery.static_port),
                synchronizer: None,
            })
        }
        DiscoveryMode::Kubernetes => {
            let feed = KubePodFeed::try_default(KubePodFeedConfig {
                namespace: config.discovery.namespace.clone(),
                label_selector: config.discovery.pod_selector.clone(),
            })
            .await
            .context("Failed to start Kubernetes discovery")?;

            let registry = Arc::new(InstanceRegistry::new());
            let synchronizer = Synchronizer::new(registry.clone());
            let handle = synchronizer.start(feed);

            Ok(Discovery {
                targets: TargetSource::registry(registry, config.gateway.selector.clone()),
                synchronizer: Some((synchronizer, handle)),
            })
        }
    }
}

/// Serve the HTTP API until SIGTERM or Ctrl+C, then end every open stream.
pub async fn serve(address: &str, gateway: Arc<ModuleGateway>) -> Result<()> {
    let router = create_router(gateway.clone());
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {address}"))?;
    info!(address, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing module streams");
            gateway.shutdown();
        })
        .await
        .context("HTTP server error")?;

    info!("HTTP server shut down gracefully");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
