//! Relay gateway entry point
//!
//! Run with:
//! ```bash
//! cargo run -p relay-gateway
//! ```
//!
//! Configuration is loaded from environment variables.

use relay_common::{try_init_tracing, GatewayConfig};
use relay_gateway::Server;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = try_init_tracing() {
        eprintln!("Warning: Failed to initialize tracing: {e}");
    }

    if let Err(e) = run().await {
        error!(error = %e, "Gateway failed to start");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting relay gateway...");

    let config = GatewayConfig::from_env();
    info!(
        redis = %config.redis_host,
        addr = %config.address(),
        "Configuration loaded"
    );

    let server = Arc::new(Server::new(config));
    server.run().await?;

    Ok(())
}
