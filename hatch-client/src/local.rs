//! Connection pool for the local service.
//!
//! Each tunnel socket relays requests to the local service through a
//! [`LocalBackend`]. Connections the relay hands back cleanly, between two
//! messages, are kept idle and reused by the next request on any tunnel
//! socket, which saves a TCP handshake per request.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use hatch_core::{Backend, MessageHead, TunnelError, TunnelResult};

/// Configuration for the local connection pool.
#[derive(Debug, Clone)]
pub struct LocalPoolConfig {
    /// Local service address.
    pub addr: String,
    /// Maximum idle connections kept.
    pub max_idle: usize,
    /// Connection idle timeout.
    pub idle_timeout: Duration,
    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
    pub connect_timeout: Duration,
}

impl Default for LocalPoolConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            max_idle: 32,
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// A connection to the local service, bound to one relay at a time.
#[derive(Debug)]
pub struct LocalConnection {
    stream: TcpStream,
    created_at: Instant,
}

impl AsyncRead for LocalConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for LocalConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Entry in the idle list.
struct IdleEntry {
    stream: TcpStream,
    created_at: Instant,
    last_used: Instant,
}

impl IdleEntry {
    fn is_fresh(&self, config: &LocalPoolConfig, now: Instant) -> bool {
        now.duration_since(self.created_at) < config.max_lifetime
            && now.duration_since(self.last_used) < config.idle_timeout
    }

    /// An idle HTTP connection must be silent: EOF or stray bytes mean the
    /// service closed it or broke framing.
    fn is_alive(&self) -> bool {
        let mut peek = [0u8; 1];
        matches!(self.stream.try_read(&mut peek), Err(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

pub struct LocalPool {
    config: LocalPoolConfig,
    idle: Mutex<Vec<IdleEntry>>,
    active_connections: AtomicUsize,
    total_connections: AtomicUsize,
    reused_connections: AtomicUsize,
}

impl LocalPool {
    pub fn new(config: LocalPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            idle: Mutex::new(Vec::new()),
            active_connections: AtomicUsize::new(0),
            total_connections: AtomicUsize::new(0),
            reused_connections: AtomicUsize::new(0),
        })
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    fn lock(&self) -> MutexGuard<'_, Vec<IdleEntry>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reuse an idle connection or open a new one.
    pub async fn get(&self) -> io::Result<LocalConnection> {
        if let Some(entry) = self.try_reuse() {
            self.reused_connections.fetch_add(1, Ordering::Relaxed);
            self.active_connections.fetch_add(1, Ordering::Relaxed);
            debug!("Reusing pooled connection to {}", self.config.addr);
            return Ok(LocalConnection {
                stream: entry.stream,
                created_at: entry.created_at,
            });
        }

        trace!("Creating new connection to {}", self.config.addr);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&self.config.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        let _ = stream.set_nodelay(true);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        Ok(LocalConnection {
            stream,
            created_at: Instant::now(),
        })
    }

    fn try_reuse(&self) -> Option<IdleEntry> {
        let mut idle = self.lock();
        let now = Instant::now();
        while let Some(entry) = idle.pop() {
            if entry.is_fresh(&self.config, now) && entry.is_alive() {
                return Some(entry);
            }
            trace!(
                "Dropping stale connection to {} (age: {:?})",
                self.config.addr,
                now.duration_since(entry.created_at)
            );
        }
        None
    }

    /// Take a connection back. Only `reusable` connections are kept.
    pub fn put_back(&self, conn: LocalConnection, reusable: bool) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        if !reusable || conn.created_at.elapsed() >= self.config.max_lifetime {
            return;
        }

        let mut idle = self.lock();
        if idle.len() >= self.config.max_idle {
            trace!("Pool is full for {}, dropping connection", self.config.addr);
            return;
        }
        idle.push(IdleEntry {
            stream: conn.stream,
            created_at: conn.created_at,
            last_used: Instant::now(),
        });
    }

    /// Drop expired idle connections. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut idle = self.lock();
        let now = Instant::now();
        let before = idle.len();
        idle.retain(|entry| entry.is_fresh(&self.config, now));
        let removed = before - idle.len();
        if removed > 0 {
            debug!("Cleaned up {} expired connections", removed);
        }
        removed
    }

    pub fn idle_count(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> LocalPoolStats {
        LocalPoolStats {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            reused_connections: self.reused_connections.load(Ordering::Relaxed),
        }
    }

    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.cleanup();
            }
        })
    }
}

/// Statistics for the local connection pool.
#[derive(Debug, Clone)]
pub struct LocalPoolStats {
    /// Connections currently bound to a relay.
    pub active_connections: usize,
    /// Connections opened.
    pub total_connections: usize,
    /// Requests served by a reused connection.
    pub reused_connections: usize,
}

impl LocalPoolStats {
    pub fn reuse_ratio(&self) -> f64 {
        let uses = self.total_connections + self.reused_connections;
        if uses == 0 {
            0.0
        } else {
            self.reused_connections as f64 / uses as f64
        }
    }
}

/// Relay backend that forwards tunnel traffic to the local service.
pub struct LocalBackend {
    pool: Arc<LocalPool>,
}

impl LocalBackend {
    pub fn new(pool: Arc<LocalPool>) -> Self {
        Self { pool }
    }
}

impl Backend for LocalBackend {
    type Upstream = LocalConnection;

    async fn acquire(&mut self, _head: &MessageHead) -> TunnelResult<LocalConnection> {
        self.pool.get().await.map_err(|e| {
            TunnelError::connection(format!("local service {} unreachable", self.pool.addr())).with_cause(e)
        })
    }

    fn release(&mut self, upstream: LocalConnection, reusable: bool) {
        self.pool.put_back(upstream, reusable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatch_core::ErrorCategory;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn service() -> (TcpListener, LocalPoolConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = LocalPoolConfig {
            addr: listener.local_addr().unwrap().to_string(),
            ..LocalPoolConfig::default()
        };
        (listener, config)
    }

    #[tokio::test]
    async fn test_reuses_released_connection() {
        let (listener, config) = service().await;
        let pool = LocalPool::new(config);

        let mut conn = pool.get().await.unwrap();
        let (mut served, _) = listener.accept().await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        served.read_exact(&mut buf).await.unwrap();

        pool.put_back(conn, true);
        assert_eq!(pool.idle_count(), 1);

        let _again = pool.get().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.reused_connections, 1);
        assert_eq!(stats.active_connections, 1);
    }

    #[tokio::test]
    async fn test_non_reusable_connection_is_closed() {
        let (listener, config) = service().await;
        let pool = LocalPool::new(config);

        let conn = pool.get().await.unwrap();
        let (mut served, _) = listener.accept().await.unwrap();
        pool.put_back(conn, false);
        assert_eq!(pool.idle_count(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(served.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_reused() {
        let (listener, config) = service().await;
        let pool = LocalPool::new(config);

        let conn = pool.get().await.unwrap();
        let (served, _) = listener.accept().await.unwrap();
        pool.put_back(conn, true);
        drop(served);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let _fresh = pool.get().await.unwrap();
        assert_eq!(pool.stats().total_connections, 2);
        assert_eq!(pool.stats().reused_connections, 0);
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_connections() {
        let (listener, config) = service().await;
        let pool = LocalPool::new(LocalPoolConfig {
            idle_timeout: Duration::ZERO,
            ..config
        });

        let conn = pool.get().await.unwrap();
        let _served = listener.accept().await.unwrap();
        pool.put_back(conn, true);
        assert_eq!(pool.cleanup(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_a_connection_error() {
        let (listener, config) = service().await;
        drop(listener);
        let mut backend = LocalBackend::new(LocalPool::new(config));

        let head = MessageHead::parse_request(b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n")
            .unwrap()
            .unwrap()
            .0;
        let err = backend.acquire(&head).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Connection);
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn test_reuse_ratio() {
        let stats = LocalPoolStats {
            active_connections: 5,
            total_connections: 100,
            reused_connections: 200,
        };
        let ratio = stats.reuse_ratio();
        assert!(ratio > 0.6 && ratio < 0.7);
    }
}
