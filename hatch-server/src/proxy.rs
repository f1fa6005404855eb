//! Public HTTP listener: routes each request by Host to a pooled tunnel
//! socket and relays it.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::trace;

use hatch_core::{Backend, MessageHead, RelayConfig, RelayEngine, TunnelError, TunnelResult};

use crate::pool::PooledTunnel;
use crate::reactor::Handler;
use crate::registry::TunnelRegistry;

pub struct PublicHandler {
    registry: Arc<TunnelRegistry>,
    relay: RelayConfig,
}

impl PublicHandler {
    pub fn new(registry: Arc<TunnelRegistry>, relay: RelayConfig) -> Self {
        Self { registry, relay }
    }
}

impl Handler for PublicHandler {
    async fn on_readable(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let _ = stream.set_nodelay(true);
        let backend = TunnelBackend::new(self.registry.clone());
        let relayed = RelayEngine::new(stream, backend, self.relay.clone()).run().await?;
        trace!(%peer, relayed, "public connection finished");
        Ok(())
    }
}

/// Hands out tunnel sockets from the pool of the request's domain.
pub struct TunnelBackend {
    registry: Arc<TunnelRegistry>,
}

impl TunnelBackend {
    pub fn new(registry: Arc<TunnelRegistry>) -> Self {
        Self { registry }
    }
}

impl Backend for TunnelBackend {
    type Upstream = PooledTunnel;

    async fn acquire(&mut self, head: &MessageHead) -> TunnelResult<PooledTunnel> {
        let domain = head
            .host()
            .map(normalize_host)
            .ok_or_else(|| TunnelError::malformed_head("request has no Host header"))?;
        let tunnel = self
            .registry
            .acquire(&domain)
            .ok_or_else(|| TunnelError::no_backend(&domain))?;
        trace!(%domain, tunnel = ?tunnel.id(), "tunnel socket bound");
        Ok(tunnel)
    }

    fn accepts(&self, upstream: &PooledTunnel, head: &MessageHead) -> bool {
        upstream.is_current() && head.host().map(normalize_host).as_deref() == Some(upstream.domain())
    }

    fn release(&mut self, upstream: PooledTunnel, reusable: bool) {
        if reusable {
            upstream.release();
        } else {
            upstream.discard();
        }
    }
}

/// Reduce a Host header value to the domain it routes to.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let name = match host.strip_prefix('[') {
        Some(rest) => rest.split(']').next().unwrap_or(rest),
        None => match host.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => host,
        },
    };
    name.trim_end_matches('.').to_ascii_lowercase()
}
