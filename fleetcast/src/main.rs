mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use fleetcast_cluster::gateway::{BroadcastConfig, BroadcastGateway, Correlator, ModuleGateway};
use fleetcast_cluster::grpc::{GrpcCallerConfig, GrpcModuleCaller};
use fleetcast_core::config::{config_file_path, load_config};
use fleetcast_core::logging;

#[derive(Parser, Debug)]
#[command(name = "fleetcast")]
#[command(about = "Fleet-wide gateway for module instances", long_about = None)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, env = "FLEETCAST_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(
        path = config_file_path(args.config.as_deref()).as_deref().unwrap_or("<env>"),
        "Configuration loaded and validated"
    );
    info!(
        http_address = %config.http_address(),
        discovery = ?config.discovery.mode,
        "fleetcast starting"
    );

    // 3. Instance discovery (registry + synchronizer, or a static target)
    let discovery = server::start_discovery(&config).await?;

    // 4. Gateway over the gRPC module caller
    let caller = Arc::new(GrpcModuleCaller::new(GrpcCallerConfig {
        connect_timeout: config.gateway.connect_timeout(),
        call_timeout: config.gateway.per_instance_timeout(),
    }));
    let broadcast = BroadcastGateway::new(
        discovery.targets.clone(),
        BroadcastConfig {
            per_instance_timeout: config.gateway.per_instance_timeout(),
            stream_buffer: config.gateway.stream_buffer,
        },
    );
    let mut gateway = ModuleGateway::new(broadcast, caller);
    if let Some(registry) = discovery.targets.registry_handle() {
        gateway = gateway.with_correlator(Correlator::with_hash_label(
            registry.clone(),
            config.gateway.template_hash_label.clone(),
        ));
    }

    // 5. Serve until a shutdown signal arrives
    let served = server::serve(&config.http_address(), Arc::new(gateway)).await;

    discovery.stop().await;
    info!("fleetcast stopped");
    served
}
