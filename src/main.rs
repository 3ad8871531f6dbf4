//! Proof-of-Indexing node - main application

use poi_node::{
    config::Config, crypto::NodeIdentity, utils::init_logging, NodeLauncher, Result, APP_NAME,
    APP_VERSION,
};
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    if config.generate_key {
        generate_and_print_identity();
        return Ok(());
    }

    let config = config.resolve()?;

    if config.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let _log_guard = init_logging(
        config.log_level.as_str(),
        &config.log_format.to_string(),
        config.log_file.as_deref(),
    );

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        "Configuration: gossip={}:{}, mining={}, threads={}, settlement={}",
        config.listen_interface,
        config.gossip_port,
        config.mine,
        config.threads,
        config.settlement_url.as_deref().unwrap_or("none")
    );

    let launcher = NodeLauncher::new();
    let node = launcher.launch(config).await?;
    info!("Node id {}", node.node_id());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");

    node.shutdown().await
}

/// Generate and print a new node identity
fn generate_and_print_identity() {
    let identity = NodeIdentity::generate();
    println!("node id: {}", identity.node_id());
    println!("seed:    {}", identity.seed_hex());
    println!();
    println!("IMPORTANT: Keep the seed secret!");
    println!("Pass it with --identity-seed (or POI_IDENTITY_SEED) for a stable node id.");
}
