//! Tunnel port: tagged sockets opened by clients in answer to `ADD`.
//!
//! The first frame on a fresh socket must be an `ADD` carrying the id the
//! server issued. It is read exactly, so the bytes after it stay in the
//! socket for the relay. Sockets with any other first frame are dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use hatch_core::codec::read_message;
use hatch_core::{ControlMessage, ErrorCategory, ResultExt, TunnelError, TunnelResult};

use crate::reactor::Handler;
use crate::registry::TunnelRegistry;

pub struct TunnelAcceptHandler {
    registry: Arc<TunnelRegistry>,
    handshake_timeout: Duration,
    max_frame: usize,
}

impl TunnelAcceptHandler {
    pub fn new(registry: Arc<TunnelRegistry>, handshake_timeout: Duration, max_frame: usize) -> Self {
        Self {
            registry,
            handshake_timeout,
            max_frame,
        }
    }

    async fn accept_tagged(&self, mut stream: TcpStream, peer: SocketAddr) -> TunnelResult<String> {
        let tag = tokio::time::timeout(self.handshake_timeout, read_message(&mut stream, self.max_frame))
            .await
            .with_category(ErrorCategory::Timeout)
            .map_err(|e| e.with_context("peer", peer.to_string()))??;

        match tag {
            ControlMessage::AddTunnelRequest { id } => self.registry.claim_socket_for_id(id, stream, peer),
            other => Err(TunnelError::protocol("tunnel socket must start with ADD")
                .with_context("message", other.kind())),
        }
    }
}

impl Handler for TunnelAcceptHandler {
    async fn on_readable(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        match self.accept_tagged(stream, peer).await {
            Ok(domain) => {
                debug!(%peer, %domain, "tunnel socket accepted");
                Ok(())
            }
            Err(e) if e.category == ErrorCategory::UnknownTunnelId => {
                warn!(%peer, "dropping tunnel socket: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use crate::registry::{ControlHandle, PoolSettings};
    use crate::shutdown::ShutdownSignal;
    use hatch_core::codec::write_message;
    use hatch_core::TunnelId;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    async fn start(registry: Arc<TunnelRegistry>) -> (SocketAddr, ShutdownSignal) {
        let shutdown = ShutdownSignal::new(Duration::from_secs(1));
        let handler = Arc::new(TunnelAcceptHandler::new(
            registry,
            Duration::from_secs(1),
            hatch_core::DEFAULT_MAX_FRAME,
        ));
        let reactor = Reactor::bind("tunnel", "127.0.0.1:0", handler, 8, shutdown.clone())
            .await
            .unwrap();
        let addr = reactor.local_addr().unwrap();
        tokio::spawn(reactor.run());
        (addr, shutdown)
    }

    async fn wait_for_idle(registry: &TunnelRegistry, domain: &str, idle: usize) {
        for _ in 0..100 {
            if registry.pool_stats(domain).map(|s| s.idle) == Some(idle) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {} idle sockets", idle);
    }

    #[tokio::test]
    async fn test_tagged_socket_enters_pool() {
        let registry = Arc::new(TunnelRegistry::new(PoolSettings::default()));
        let (tx, mut rx) = mpsc::channel(16);
        registry.register("a.example.com", ControlHandle::new(tx));
        registry.warm("a.example.com", 1);
        let id = match rx.recv().await.unwrap() {
            ControlMessage::AddTunnelRequest { id } => id,
            other => panic!("expected ADD, got {:?}", other),
        };

        let (addr, shutdown) = start(registry.clone()).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        write_message(&mut socket, &ControlMessage::add(id)).await.unwrap();

        wait_for_idle(&registry, "a.example.com", 1).await;
        assert_eq!(registry.pending_count(), 0);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let registry = Arc::new(TunnelRegistry::new(PoolSettings::default()));
        let (tx, _rx) = mpsc::channel(16);
        registry.register("a.example.com", ControlHandle::new(tx));

        let (addr, shutdown) = start(registry.clone()).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        write_message(&mut socket, &ControlMessage::add(TunnelId::new())).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(socket.read(&mut buf).await.unwrap(), 0);
        assert_eq!(registry.pool_stats("a.example.com").unwrap().idle, 0);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_silent_socket_times_out() {
        let registry = Arc::new(TunnelRegistry::new(PoolSettings::default()));
        let handler = TunnelAcceptHandler::new(registry, Duration::from_millis(50), hatch_core::DEFAULT_MAX_FRAME);
        let (server, _client, peer) = crate::pool::tests::tcp_pair().await;

        let err = handler.accept_tagged(server, peer).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert!(err.to_string().contains(&peer.to_string()));
    }

    #[tokio::test]
    async fn test_wrong_first_frame_is_dropped() {
        let registry = Arc::new(TunnelRegistry::new(PoolSettings::default()));
        let (addr, shutdown) = start(registry).await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        write_message(&mut socket, &ControlMessage::hello("a.example.com")).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(socket.read(&mut buf).await.unwrap(), 0);
        shutdown.trigger();
    }
}
