//! Hatch Client - Client side of the reverse tunnel.
//!
//! Runs next to a local HTTP service and exposes it under a public domain
//! through a hatch server.

mod agent;
mod config;
mod health;
mod local;

use anyhow::Result;
use clap::Parser;
use config::ClientConfig;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use agent::{AgentSettings, ClientAgent};
use local::LocalPool;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ClientConfig::parse();

    FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .init();

    info!("Starting hatch-client v{}", env!("CARGO_PKG_VERSION"));
    info!("Server: {}", config.server);
    info!("Domain: {}", config.domain);
    info!("Local service: {}", config.local_addr());

    if config.verify_upstream {
        if let Err(e) = health::verify_upstream(&config.local_addr(), config.connect_timeout()).await {
            warn!("Local service is not reachable: {}", e);
            if config.require_upstream {
                return Err(anyhow::anyhow!(
                    "Upstream service {} is not reachable. \
                     Start the local service first or use --verify-upstream false",
                    config.local_addr()
                ));
            }
        }
    }

    let pool = LocalPool::new(config.local_pool());
    let agent = ClientAgent::new(AgentSettings::from_config(&config), pool);
    agent
        .run_with_reconnect(config.reconnect_delay(), config.max_reconnects)
        .await
}
