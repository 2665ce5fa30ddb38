mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use driftsee_cluster::{
    CommandRelay, DeviceDirectory, Gateway, LocalDeviceDirectory, RedisCommandRelay,
    RedisDeviceDirectory,
};
use driftsee_core::{bootstrap::load_config, logging};

use server::DriftSeeServer;

#[derive(Debug, Parser)]
#[command(name = "driftsee", version, about = "Device gateway")]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, env = "DRIFTSEE_CONFIG_PATH")]
    config: Option<String>,
}

/// Generate a unique node ID for this server instance
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    // Add random suffix so restarts never reuse an id
    let suffix = nanoid::nanoid!(6);

    format!("{hostname}-{suffix}")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration
    let config = Arc::new(load_config(cli.config.as_deref())?);

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;

    let node_id = generate_node_id();
    info!(node_id = %node_id, "DriftSee gateway starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Device directory and command relay
    let gw = &config.gateway;
    let (directory, relay): (Arc<dyn DeviceDirectory>, Option<Arc<RedisCommandRelay>>) =
        if config.is_clustered() {
            let directory = RedisDeviceDirectory::connect(
                config.redis_url(),
                config.redis.key_prefix.clone(),
                gw.directory_timeout(),
            )
            .await?;
            let relay = RedisCommandRelay::connect(
                config.redis_url(),
                node_id.clone(),
                config.redis.key_prefix.clone(),
                gw.forward_confirm_timeout(),
                gw.directory_timeout(),
            )
            .await?;
            info!("Redis configured, running in cluster mode");
            (Arc::new(directory) as Arc<dyn DeviceDirectory>, Some(Arc::new(relay)))
        } else {
            info!("Redis not configured, running as a single node");
            (Arc::new(LocalDeviceDirectory::new()) as Arc<dyn DeviceDirectory>, None)
        };

    // 4. Gateway
    let shared_relay = relay.clone().map(|r| r as Arc<dyn CommandRelay>);
    let gateway = Arc::new(Gateway::from_config(&node_id, &config, directory, shared_relay));

    // 5. Run until a shutdown signal arrives
    let server = DriftSeeServer::new(config, node_id, gateway, relay);
    server.start().await
}
