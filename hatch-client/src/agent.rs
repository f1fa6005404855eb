//! Client agent: control connection and tunnel sockets.
//!
//! The agent claims its domain over the control connection, then answers
//! every `ADD` by opening a socket to the server's tunnel port, tagging it
//! with the request id and relaying whatever arrives on it to the local
//! service.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use hatch_core::codec::write_message;
use hatch_core::{
    AddStatus, ControlMessage, ControlSession, ErrorCategory, FrameReader, RelayConfig, RelayEngine,
    SessionAction, TunnelError, TunnelId, TunnelResult,
};

use crate::config::ClientConfig;
use crate::local::{LocalBackend, LocalPool};

/// Frames queued for the control writer.
const CONTROL_QUEUE: usize = 100;

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub control_addr: String,
    pub tunnel_addr: String,
    pub domain: String,
    pub connect_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub max_frame: usize,
    pub relay: RelayConfig,
}

impl AgentSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            control_addr: config.control_addr(),
            tunnel_addr: config.tunnel_addr(),
            domain: config.domain.clone(),
            connect_timeout: config.connect_timeout(),
            heartbeat_timeout: config.heartbeat_timeout(),
            max_frame: config.max_frame_size,
            relay: config.relay(),
        }
    }
}

pub struct ClientAgent {
    settings: Arc<AgentSettings>,
    pool: Arc<LocalPool>,
}

impl ClientAgent {
    pub fn new(settings: AgentSettings, pool: Arc<LocalPool>) -> Self {
        Self {
            settings: Arc::new(settings),
            pool,
        }
    }

    /// Keep a session up until Ctrl+C, reconnecting after failures.
    /// Losing the domain to another client is fatal.
    pub async fn run_with_reconnect(&self, delay: Duration, max_reconnects: u32) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctrl_c = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    let _ = stop_tx.send(true);
                }
                Err(e) => {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    // Keep the sender alive so the agent runs until killed.
                    std::future::pending::<()>().await;
                }
            }
        });

        let result = self.reconnect_until(delay, max_reconnects, stop_rx).await;
        ctrl_c.abort();
        result
    }

    /// Reconnect loop that ends as soon as `stop` turns true, whether a
    /// session is live, connecting or waiting out the backoff.
    pub async fn reconnect_until(
        &self,
        delay: Duration,
        max_reconnects: u32,
        stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            match self.run_until(stopped(stop.clone())).await {
                Ok(()) => {
                    info!("Tunnel closed gracefully");
                    return Ok(());
                }
                Err(e) if e.category == ErrorCategory::DomainConflict => {
                    error!("{}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Tunnel error: {}", e);

                    if max_reconnects > 0 && attempts >= max_reconnects {
                        error!("Max reconnect attempts ({}) reached", max_reconnects);
                        return Err(e.into());
                    }

                    info!("Reconnecting in {:?}... (attempt {})", delay, attempts + 1);
                    tokio::select! {
                        _ = stopped(stop.clone()) => {
                            info!("Stopped while waiting to reconnect");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Run one control session until `stop` resolves or the session fails.
    pub async fn run_until<F: Future<Output = ()>>(&self, stop: F) -> TunnelResult<()> {
        let settings = &self.settings;
        tokio::pin!(stop);

        let (mut reader, mut write_half, mut session) = tokio::select! {
            _ = &mut stop => {
                info!("Stopped before the tunnel was registered");
                return Ok(());
            }
            registered = self.handshake() => registered?,
        };
        info!("Registered {}", settings.domain);
        info!("Forwarding to {}", self.pool.addr());

        let (tx, mut rx) = mpsc::channel::<ControlMessage>(CONTROL_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write_message(&mut write_half, &msg).await {
                    debug!("control writer stopped: {}", e);
                    break;
                }
            }
        });

        let cleanup = self.pool.start_cleanup_task(Duration::from_secs(30));
        let mut tunnels = JoinSet::new();
        let mut last_seen = Instant::now();
        let mut watchdog = tokio::time::interval(settings.heartbeat_timeout / 2 + Duration::from_millis(1));

        let result = loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("Shutting down tunnel");
                    break Ok(());
                }
                _ = watchdog.tick() => {
                    let silent = last_seen.elapsed();
                    if silent > settings.heartbeat_timeout {
                        break Err(TunnelError::heartbeat_timeout(silent));
                    }
                }
                Some(joined) = tunnels.join_next(), if !tunnels.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("tunnel task panicked: {}", e);
                        }
                    }
                }
                next = reader.next() => match next {
                    Ok(Some(msg)) => {
                        last_seen = Instant::now();
                        match session.handle(&msg) {
                            Ok(SessionAction::OpenTunnel(id)) => {
                                tunnels.spawn(open_tunnel(id, settings.clone(), self.pool.clone(), tx.clone()));
                            }
                            Ok(SessionAction::ReplyPing) => {
                                if tx.try_send(ControlMessage::Ping).is_err() {
                                    break Err(TunnelError::connection("control writer closed"));
                                }
                            }
                            Ok(other) => {
                                break Err(TunnelError::internal(format!("unexpected action {:?}", other)));
                            }
                            Err(e) => break Err(e),
                        }
                    }
                    Ok(None) => break Err(TunnelError::connection("server closed the control connection")),
                    Err(e) => break Err(e.into()),
                }
            }
        };

        session.close();
        writer.abort();
        cleanup.abort();
        tunnels.abort_all();

        let stats = self.pool.stats();
        info!(
            "Connection pool stats: total={}, reused={}, active={}, idle={}, reuse_ratio={:.1}%",
            stats.total_connections,
            stats.reused_connections,
            stats.active_connections,
            self.pool.idle_count(),
            stats.reuse_ratio() * 100.0
        );
        result
    }

    /// Connect and claim the domain.
    async fn handshake(&self) -> TunnelResult<(FrameReader<OwnedReadHalf>, OwnedWriteHalf, ControlSession)> {
        let settings = &self.settings;
        info!("Connecting to {}", settings.control_addr);

        let stream = connect(&settings.control_addr, settings.connect_timeout).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, settings.max_frame);
        let mut session = ControlSession::client(settings.domain.clone());

        write_message(&mut write_half, &session.hello()?).await?;
        let ack = match tokio::time::timeout(settings.connect_timeout, reader.next()).await {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => return Err(TunnelError::connection("server closed before HELLO_ACK")),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TunnelError::timeout("no HELLO_ACK from server")),
        };
        match session.handle(&ack)? {
            SessionAction::Registered => Ok((reader, write_half, session)),
            other => Err(TunnelError::internal(format!("unexpected handshake action {:?}", other))),
        }
    }
}

/// Resolves once `stop` turns true. A dropped sender never stops the agent.
async fn stopped(mut stop: watch::Receiver<bool>) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn connect(addr: &str, timeout: Duration) -> TunnelResult<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::timeout(format!("connecting to {} timed out", addr)))?
        .map_err(|e| TunnelError::connection(format!("cannot connect to {}", addr)).with_cause(e))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Open and tag one tunnel socket, then serve it until either end closes.
async fn open_tunnel(
    id: TunnelId,
    settings: Arc<AgentSettings>,
    pool: Arc<LocalPool>,
    control: mpsc::Sender<ControlMessage>,
) {
    let socket = match tag_socket(id, &settings).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(%id, "cannot open tunnel socket: {}", e);
            let _ = control.send(ControlMessage::add_ack(id, AddStatus::Error)).await;
            return;
        }
    };
    if control.send(ControlMessage::add_ack(id, AddStatus::Success)).await.is_err() {
        debug!(%id, "control connection gone, dropping tunnel socket");
        return;
    }
    trace!(%id, "tunnel socket ready");

    let engine = RelayEngine::new(socket, LocalBackend::new(pool), settings.relay.clone());
    match engine.run().await {
        Ok(relayed) => trace!(%id, relayed, "tunnel socket closed"),
        Err(e) => debug!(%id, "tunnel socket ended: {}", e),
    }
}

async fn tag_socket(id: TunnelId, settings: &AgentSettings) -> TunnelResult<TcpStream> {
    let mut socket = connect(&settings.tunnel_addr, settings.connect_timeout).await?;
    write_message(&mut socket, &ControlMessage::add(id)).await?;
    Ok(socket)
}
