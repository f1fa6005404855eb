//! Control connections from tunnel clients.
//!
//! One task per connection reads frames and drives a [`ControlSession`];
//! a writer task owns the socket's write half and drains an mpsc queue, so
//! the registry can request tunnel sockets from any task without touching
//! the socket. The domain stays registered exactly as long as the
//! connection lives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use hatch_core::codec::write_message;
use hatch_core::protocol::HelloStatus;
use hatch_core::{
    ControlMessage, ControlSession, FrameReader, SessionAction, TunnelError, TunnelResult,
};

use crate::reactor::Handler;
use crate::registry::{ConnectionId, ControlHandle, Registration, TunnelRegistry};
use crate::shutdown::ShutdownSignal;

/// Frames queued per control connection before `ADD`s are refused.
const CONTROL_QUEUE: usize = 100;

#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_frame: usize,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            max_frame: hatch_core::DEFAULT_MAX_FRAME,
        }
    }
}

pub struct ControlHandler {
    registry: Arc<TunnelRegistry>,
    settings: ControlSettings,
    shutdown: ShutdownSignal,
}

impl ControlHandler {
    pub fn new(registry: Arc<TunnelRegistry>, settings: ControlSettings, shutdown: ShutdownSignal) -> Self {
        Self {
            registry,
            settings,
            shutdown,
        }
    }
}

impl Handler for ControlHandler {
    async fn on_readable(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        serve_control(stream, peer, &self.registry, &self.settings, &self.shutdown).await?;
        Ok(())
    }
}

/// Unregisters the domain when the connection ends, on every path.
struct RegistrationGuard<'a> {
    registry: &'a TunnelRegistry,
    domain: String,
    connection: ConnectionId,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.domain, self.connection);
    }
}

/// Serve one control connection until the client leaves, stops answering
/// heartbeats, breaks the protocol or the server shuts down.
pub async fn serve_control(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &TunnelRegistry,
    settings: &ControlSettings,
    shutdown: &ShutdownSignal,
) -> TunnelResult<()> {
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, settings.max_frame);
    let mut session = ControlSession::server();

    let hello = match tokio::time::timeout(settings.handshake_timeout, reader.next()).await {
        Ok(Ok(Some(msg))) => msg,
        Ok(Ok(None)) => return Err(TunnelError::connection("control connection closed before HELLO")),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(TunnelError::timeout("no HELLO within handshake timeout")
                .with_context("peer", peer.to_string()))
        }
    };
    let domain = match session.handle(&hello)? {
        SessionAction::Register { domain } => domain,
        other => return Err(TunnelError::internal(format!("unexpected handshake action {:?}", other))),
    };

    let (tx, mut rx) = mpsc::channel(CONTROL_QUEUE);
    let handle = ControlHandle::new(tx);
    let connection = handle.id;
    let outbound = handle.clone();

    if registry.register(&domain, handle) == Registration::Occupied {
        session.close();
        warn!(%peer, domain = %domain, "domain already registered, refusing HELLO");
        let _ = write_message(
            &mut write_half,
            &ControlMessage::hello_ack(HelloStatus::DomainOccupied),
        )
        .await;
        return Err(TunnelError::domain_conflict(&domain));
    }
    let _registration = RegistrationGuard {
        registry,
        domain: domain.clone(),
        connection,
    };
    session.registered()?;

    // HELLO_ACK goes out before the writer starts, so it precedes every ADD.
    write_message(&mut write_half, &ControlMessage::hello_ack(HelloStatus::Success)).await?;
    info!(%peer, domain = %domain, connection, "control connection registered");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_message(&mut write_half, &msg).await {
                debug!("control writer stopped: {}", e);
                break;
            }
        }
    });

    registry.replenish(&domain);

    let mut ticker = tokio::time::interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();
    let stopped = shutdown.triggered();
    tokio::pin!(stopped);

    let result = loop {
        tokio::select! {
            _ = &mut stopped => {
                debug!(domain = %domain, "closing control connection for shutdown");
                break Ok(());
            }
            _ = ticker.tick() => {
                let silent = last_seen.elapsed();
                if silent > settings.heartbeat_timeout {
                    break Err(TunnelError::heartbeat_timeout(silent).with_context("domain", domain.as_str()));
                }
                if !outbound.send(ControlMessage::Ping) {
                    break Err(TunnelError::connection("control writer closed"));
                }
                let expired = registry.expire_pending(&domain);
                if let Some(stats) = registry.pool_stats(&domain) {
                    trace!(
                        domain = %domain,
                        idle = stats.idle,
                        pending = stats.pending,
                        in_use = stats.in_use,
                        expired,
                        outstanding = registry.pending_count(),
                        "pool status"
                    );
                }
            }
            next = reader.next() => match next {
                Ok(Some(msg)) => {
                    last_seen = Instant::now();
                    match session.handle(&msg) {
                        Ok(SessionAction::TunnelAcked { id, ok: true }) => {
                            trace!(domain = %domain, %id, "tunnel socket on its way");
                        }
                        Ok(SessionAction::TunnelAcked { id, ok: false }) => {
                            debug!(domain = %domain, %id, "client could not open tunnel socket");
                            registry.abandon(id, connection);
                        }
                        Ok(SessionAction::Heartbeat) => trace!(domain = %domain, "heartbeat"),
                        Ok(other) => {
                            break Err(TunnelError::internal(format!("unexpected action {:?}", other)));
                        }
                        Err(e) => break Err(e),
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        }
    };

    session.close();
    writer.abort();
    match &result {
        Ok(()) => info!(%peer, domain = %domain, "control connection closed"),
        Err(e) if e.is_session_fatal() => warn!(%peer, domain = %domain, "control session failed: {}", e),
        Err(e) => info!(%peer, domain = %domain, "control connection dropped: {}", e),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::tcp_pair;
    use crate::registry::PoolSettings;
    use hatch_core::codec::read_message;
    use hatch_core::ErrorCategory;

    fn registry(size: usize) -> Arc<TunnelRegistry> {
        Arc::new(TunnelRegistry::new(PoolSettings {
            size,
            pending_ttl: Duration::from_secs(30),
        }))
    }

    fn spawn_server(
        registry: Arc<TunnelRegistry>,
        settings: ControlSettings,
        shutdown: ShutdownSignal,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> tokio::task::JoinHandle<TunnelResult<()>> {
        tokio::spawn(async move { serve_control(stream, peer, &registry, &settings, &shutdown).await })
    }

    async fn hello(client: &mut TcpStream, domain: &str) -> ControlMessage {
        write_message(client, &ControlMessage::hello(domain)).await.unwrap();
        read_message(client, hatch_core::DEFAULT_MAX_FRAME).await.unwrap()
    }

    #[tokio::test]
    async fn test_registration_warms_pool_and_unregisters_on_close() {
        let registry = registry(3);
        let shutdown = ShutdownSignal::new(Duration::from_secs(1));
        let (server, mut client, peer) = tcp_pair().await;
        let task = spawn_server(registry.clone(), ControlSettings::default(), shutdown, server, peer);

        assert_eq!(
            hello(&mut client, "A.Example.com").await,
            ControlMessage::hello_ack(HelloStatus::Success)
        );
        for _ in 0..3 {
            let msg = read_message(&mut client, hatch_core::DEFAULT_MAX_FRAME).await.unwrap();
            assert!(matches!(msg, ControlMessage::AddTunnelRequest { .. }));
        }
        assert!(registry.is_registered("a.example.com"));
        assert_eq!(registry.pending_count(), 3);

        drop(client);
        task.await.unwrap().unwrap();
        assert!(!registry.is_registered("a.example.com"));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_hello_for_domain_is_refused() {
        let registry = registry(1);
        let shutdown = ShutdownSignal::new(Duration::from_secs(1));

        let (server, mut first, peer) = tcp_pair().await;
        let _owner = spawn_server(registry.clone(), ControlSettings::default(), shutdown.clone(), server, peer);
        assert_eq!(
            hello(&mut first, "a.example.com").await,
            ControlMessage::hello_ack(HelloStatus::Success)
        );

        let (server, mut second, peer) = tcp_pair().await;
        let rival = spawn_server(registry.clone(), ControlSettings::default(), shutdown, server, peer);
        assert_eq!(
            hello(&mut second, "a.example.com").await,
            ControlMessage::hello_ack(HelloStatus::DomainOccupied)
        );
        let err = rival.await.unwrap().unwrap_err();
        assert_eq!(err.category, ErrorCategory::DomainConflict);
        assert!(registry.is_registered("a.example.com"));
    }

    #[tokio::test]
    async fn test_silent_client_hits_heartbeat_timeout() {
        let registry = registry(0);
        let settings = ControlSettings {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(60),
            ..ControlSettings::default()
        };
        let (server, mut client, peer) = tcp_pair().await;
        let task = spawn_server(
            registry.clone(),
            settings,
            ShutdownSignal::new(Duration::from_secs(1)),
            server,
            peer,
        );

        hello(&mut client, "a.example.com").await;
        assert_eq!(
            read_message(&mut client, hatch_core::DEFAULT_MAX_FRAME).await.unwrap(),
            ControlMessage::Ping
        );

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.category, ErrorCategory::HeartbeatTimeout);
        assert!(!registry.is_registered("a.example.com"));
    }

    #[tokio::test]
    async fn test_add_ack_error_requests_replacement() {
        let registry = registry(1);
        let shutdown = ShutdownSignal::new(Duration::from_secs(1));
        let (server, mut client, peer) = tcp_pair().await;
        let _task = spawn_server(registry.clone(), ControlSettings::default(), shutdown, server, peer);

        hello(&mut client, "a.example.com").await;
        let first = match read_message(&mut client, hatch_core::DEFAULT_MAX_FRAME).await.unwrap() {
            ControlMessage::AddTunnelRequest { id } => id,
            other => panic!("expected ADD, got {:?}", other),
        };
        write_message(
            &mut client,
            &ControlMessage::add_ack(first, hatch_core::AddStatus::Error),
        )
        .await
        .unwrap();

        match read_message(&mut client, hatch_core::DEFAULT_MAX_FRAME).await.unwrap() {
            ControlMessage::AddTunnelRequest { id } => assert_ne!(id, first),
            other => panic!("expected ADD, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_message_before_hello_is_rejected() {
        let registry = registry(1);
        let (server, mut client, peer) = tcp_pair().await;
        let task = spawn_server(
            registry.clone(),
            ControlSettings::default(),
            ShutdownSignal::new(Duration::from_secs(1)),
            server,
            peer,
        );

        write_message(&mut client, &ControlMessage::Ping).await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.category, ErrorCategory::Protocol);
        assert_eq!(registry.domain_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let registry = registry(0);
        let shutdown = ShutdownSignal::new(Duration::from_secs(1));
        let (server, mut client, peer) = tcp_pair().await;
        let task = spawn_server(registry.clone(), ControlSettings::default(), shutdown.clone(), server, peer);

        hello(&mut client, "a.example.com").await;
        shutdown.trigger();
        task.await.unwrap().unwrap();
        assert!(!registry.is_registered("a.example.com"));
    }
}
