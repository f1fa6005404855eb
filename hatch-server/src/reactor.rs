//! Readiness-driven accept loop, one per listening endpoint.
//!
//! A [`Reactor`] owns one listener. Each accepted connection gets its own
//! task which waits until the socket is readable, takes a worker permit and
//! runs the [`Handler`]. A failing or panicking handler only ends its own
//! connection; the loop keeps accepting until shutdown, then drains the
//! remaining tasks and aborts whatever outlives the drain timeout.

use anyhow::{Context as _, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::shutdown::ShutdownSignal;

/// Per-endpoint connection handler.
pub trait Handler: Send + Sync + 'static {
    /// Decide whether to keep a freshly accepted connection.
    fn on_acceptable(&self, peer: SocketAddr) -> bool {
        let _ = peer;
        true
    }

    /// Serve a connection that has data waiting.
    fn on_readable(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub struct Reactor<H: Handler> {
    name: &'static str,
    listener: TcpListener,
    handler: Arc<H>,
    workers: Arc<Semaphore>,
    first_byte_timeout: Option<Duration>,
    shutdown: ShutdownSignal,
}

impl<H: Handler> Reactor<H> {
    pub async fn bind(
        name: &'static str,
        addr: &str,
        handler: Arc<H>,
        max_workers: usize,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {} listener on {}", name, addr))?;
        Ok(Self::from_listener(name, listener, handler, max_workers, shutdown))
    }

    pub fn from_listener(
        name: &'static str,
        listener: TcpListener,
        handler: Arc<H>,
        max_workers: usize,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            name,
            listener,
            handler,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            first_byte_timeout: None,
            shutdown,
        }
    }

    /// Close connections that stay silent for `timeout` after accept.
    pub fn with_first_byte_timeout(mut self, timeout: Duration) -> Self {
        self.first_byte_timeout = Some(timeout);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<()> {
        let name = self.name;
        info!("{} listener on {}", name, self.local_addr()?);

        let mut tasks = JoinSet::new();
        let mut shutdown = self.shutdown.subscribe();

        while !self.shutdown.is_shutting_down() {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("{} accept failed: {}", name, e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    if !self.handler.on_acceptable(peer) {
                        debug!(endpoint = name, %peer, "connection refused by handler");
                        continue;
                    }
                    trace!(endpoint = name, %peer, "accepted");
                    tasks.spawn(dispatch(
                        name,
                        stream,
                        peer,
                        self.handler.clone(),
                        self.workers.clone(),
                        self.first_byte_timeout,
                        self.shutdown.clone(),
                    ));
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(name, joined);
                }
            }
        }

        drop(self.listener);
        info!("{} listener stopped, draining {} connections", name, tasks.len());

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                log_join(name, joined);
            }
        };
        if tokio::time::timeout(self.shutdown.drain_timeout(), drain)
            .await
            .is_err()
        {
            warn!("{}: aborting {} connections after drain timeout", name, tasks.len());
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        Ok(())
    }
}

async fn dispatch<H: Handler>(
    name: &'static str,
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    workers: Arc<Semaphore>,
    first_byte_timeout: Option<Duration>,
    shutdown: ShutdownSignal,
) {
    let _guard = shutdown.track();

    let readable = stream.readable();
    let ready = match first_byte_timeout {
        Some(limit) => match tokio::time::timeout(limit, readable).await {
            Ok(ready) => ready,
            Err(_) => {
                debug!(endpoint = name, %peer, "no data before timeout, closing");
                return;
            }
        },
        None => readable.await,
    };
    if let Err(e) = ready {
        debug!(endpoint = name, %peer, error = %e, "connection failed before first read");
        return;
    }

    let Ok(_permit) = workers.acquire_owned().await else {
        return;
    };
    if let Err(e) = handler.on_readable(stream, peer).await {
        debug!(endpoint = name, %peer, "connection ended: {:#}", e);
    }
}

fn log_join(name: &str, joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("{} connection handler panicked: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct Echo {
        served: AtomicUsize,
    }

    impl Handler for Echo {
        fn on_acceptable(&self, peer: SocketAddr) -> bool {
            peer.ip().is_loopback()
        }

        async fn on_readable(self: Arc<Self>, mut stream: TcpStream, _peer: SocketAddr) -> Result<()> {
            self.served.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await?;
            match &buf[..n] {
                b"panic" => panic!("handler blew up"),
                b"fail" => anyhow::bail!("handler failed"),
                data => stream.write_all(data).await?,
            }
            Ok(())
        }
    }

    async fn start(handler: Arc<Echo>, shutdown: ShutdownSignal) -> (SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        let reactor = Reactor::bind("test", "127.0.0.1:0", handler, 4, shutdown)
            .await
            .unwrap()
            .with_first_byte_timeout(Duration::from_secs(5));
        let addr = reactor.local_addr().unwrap();
        (addr, tokio::spawn(reactor.run()))
    }

    async fn echo(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_stop_the_loop() {
        let shutdown = ShutdownSignal::new(Duration::from_secs(1));
        let handler = Arc::new(Echo::default());
        let (addr, reactor) = start(handler.clone(), shutdown.clone()).await;

        assert!(echo(addr, b"panic").await.is_empty());
        assert!(echo(addr, b"fail").await.is_empty());
        assert_eq!(echo(addr, b"hello").await, b"hello");
        assert_eq!(handler.served.load(Ordering::SeqCst), 3);

        shutdown.trigger();
        reactor.await.unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_silent_connections_are_dropped() {
        let shutdown = ShutdownSignal::new(Duration::from_secs(1));
        let handler = Arc::new(Echo::default());
        let reactor = Reactor::bind("test", "127.0.0.1:0", handler.clone(), 1, shutdown.clone())
            .await
            .unwrap()
            .with_first_byte_timeout(Duration::from_millis(50));
        let addr = reactor.local_addr().unwrap();
        let running = tokio::spawn(reactor.run());

        let mut silent = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(silent.read(&mut buf).await.unwrap(), 0);
        assert_eq!(handler.served.load(Ordering::SeqCst), 0);

        shutdown.trigger();
        running.await.unwrap().unwrap();
    }
}
