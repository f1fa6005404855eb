//! Hatch Server - Public side of the reverse tunnel.
//!
//! Accepts control connections from clients, collects the tunnel sockets
//! they open, and relays public HTTP traffic over them by Host.

mod config;
mod control;
mod pool;
mod proxy;
mod reactor;
mod registry;
mod shutdown;
mod tunnel_accept;

use anyhow::Result;
use clap::Parser;
use config::ServerConfig;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use control::ControlHandler;
use proxy::PublicHandler;
use reactor::Reactor;
use registry::TunnelRegistry;
use shutdown::ShutdownSignal;
use tunnel_accept::TunnelAcceptHandler;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting hatch-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Control port: {}", config.control_port);
    info!("Tunnel port: {}", config.tunnel_port);
    info!("HTTP port: {}", config.http_port);
    info!("Pool size per domain: {}", config.pool_size);

    let registry = Arc::new(TunnelRegistry::new(config.pool()));
    let shutdown = ShutdownSignal::new(config.shutdown_timeout());

    let control = Reactor::bind(
        "control",
        &config.control_addr(),
        Arc::new(ControlHandler::new(registry.clone(), config.control(), shutdown.clone())),
        config.max_tunnels,
        shutdown.clone(),
    )
    .await?
    .with_first_byte_timeout(config.handshake_timeout());

    let tunnel = Reactor::bind(
        "tunnel",
        &config.tunnel_addr(),
        Arc::new(TunnelAcceptHandler::new(
            registry.clone(),
            config.handshake_timeout(),
            config.max_frame_size,
        )),
        config.max_workers,
        shutdown.clone(),
    )
    .await?
    .with_first_byte_timeout(config.handshake_timeout());

    let public = Reactor::bind(
        "public",
        &config.http_addr(),
        Arc::new(PublicHandler::new(registry.clone(), config.relay())),
        config.max_workers,
        shutdown.clone(),
    )
    .await?
    .with_first_byte_timeout(config.keep_alive_timeout());

    let reactors = [
        tokio::spawn(control.run()),
        tokio::spawn(tunnel.run()),
        tokio::spawn(public.run()),
    ];

    info!("Server is ready to accept connections");

    shutdown::wait_for_signal(&shutdown).await;

    for reactor in reactors {
        match reactor.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Listener error: {:#}", e),
            Err(e) => error!("Listener task failed: {}", e),
        }
    }

    if !shutdown.wait_for_drain().await {
        error!("Connections still open after drain timeout");
    }
    info!(domains = registry.domain_count(), "Server stopped");
    Ok(())
}
