//! Per-domain pool of pre-warmed tunnel sockets.
//!
//! A [`DomainPool`] tracks the tunnel sockets a client has opened for one
//! domain: the Idle ones ready to relay, the ids requested but not yet
//! fulfilled, and how many are currently bound to a relay. All of it sits
//! behind one lock per domain, so unrelated domains never contend.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::trace;

use hatch_core::TunnelId;

use crate::registry::{DomainEntry, TunnelRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    InUse,
    Closed,
}

/// A client-originated socket dedicated to relaying for one domain.
#[derive(Debug)]
pub struct TunnelSocket {
    pub id: TunnelId,
    pub domain: String,
    pub peer: SocketAddr,
    stream: TcpStream,
    state: SocketState,
    created_at: Instant,
}

impl TunnelSocket {
    pub fn new(id: TunnelId, domain: String, stream: TcpStream, peer: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            id,
            domain,
            peer,
            stream,
            state: SocketState::Idle,
            created_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Idle sockets must be silent; EOF, errors or stray bytes all mean the
    /// socket cannot carry a fresh request.
    fn is_alive(&self) -> bool {
        let mut peek = [0u8; 1];
        match self.stream.try_read(&mut peek) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            _ => false,
        }
    }

    fn close(mut self) {
        self.state = SocketState::Closed;
        trace!(
            id = %self.id,
            domain = %self.domain,
            peer = %self.peer,
            age = ?self.age(),
            "closing tunnel socket"
        );
    }
}

/// Snapshot of one domain pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub pending: usize,
    pub in_use: usize,
}

#[derive(Default)]
struct PoolState {
    closed: bool,
    idle: VecDeque<TunnelSocket>,
    pending: HashMap<TunnelId, Instant>,
    in_use: usize,
}

pub struct DomainPool {
    size: usize,
    state: Mutex<PoolState>,
}

impl DomainPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    pub fn is_pending(&self, id: &TunnelId) -> bool {
        self.lock().pending.contains_key(id)
    }

    /// Reserve up to `max` new pending ids, enough to bring
    /// `idle + pending` back to the pool size.
    pub fn refill(&self, max: usize) -> Vec<TunnelId> {
        let mut state = self.lock();
        if state.closed {
            return Vec::new();
        }
        let deficit = self
            .size
            .saturating_sub(state.idle.len() + state.pending.len())
            .min(max);
        let now = Instant::now();
        (0..deficit)
            .map(|_| {
                let id = TunnelId::new();
                state.pending.insert(id, now);
                id
            })
            .collect()
    }

    /// Move a socket for a pending id into the Idle set. The socket is handed
    /// back if the id is not pending, the pool is closed, or the Idle set is
    /// full.
    pub fn fulfil(&self, mut socket: TunnelSocket) -> Result<(), TunnelSocket> {
        let mut state = self.lock();
        if state.pending.remove(&socket.id).is_none()
            || state.closed
            || state.idle.len() >= self.size
        {
            return Err(socket);
        }
        socket.state = SocketState::Idle;
        state.idle.push_back(socket);
        Ok(())
    }

    /// Forget a pending id without waiting for its socket.
    pub fn abandon(&self, id: &TunnelId) -> bool {
        self.lock().pending.remove(id).is_some()
    }

    /// Take one live Idle socket. Dead sockets found on the way are closed.
    pub fn acquire(&self) -> Option<TunnelSocket> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        while let Some(mut socket) = state.idle.pop_front() {
            if socket.is_alive() {
                socket.state = SocketState::InUse;
                state.in_use += 1;
                return Some(socket);
            }
            socket.close();
        }
        None
    }

    /// Return an InUse socket to the Idle set. Handed back when the pool is
    /// closed or already full.
    pub fn release(&self, mut socket: TunnelSocket) -> Result<(), TunnelSocket> {
        debug_assert_eq!(socket.state(), SocketState::InUse, "released a socket that was not bound");
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if state.closed || state.idle.len() >= self.size {
            return Err(socket);
        }
        socket.state = SocketState::Idle;
        state.idle.push_back(socket);
        Ok(())
    }

    pub fn discard(&self, socket: TunnelSocket) {
        debug_assert_eq!(socket.state(), SocketState::InUse, "discarded a socket that was not bound");
        {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(1);
        }
        socket.close();
    }

    /// Drop pending ids older than `ttl` and return them.
    pub fn expire(&self, ttl: Duration) -> Vec<TunnelId> {
        let mut state = self.lock();
        let now = Instant::now();
        let expired: Vec<TunnelId> = state
            .pending
            .iter()
            .filter(|(_, issued)| now.duration_since(**issued) >= ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            state.pending.remove(id);
        }
        expired
    }

    /// Close the pool for good: no socket is handed out afterwards. Idle
    /// sockets are closed and the pending ids returned.
    pub fn close(&self) -> Vec<TunnelId> {
        let (idle, pending) = {
            let mut state = self.lock();
            state.closed = true;
            let idle: Vec<TunnelSocket> = state.idle.drain(..).collect();
            let pending: Vec<TunnelId> = state.pending.drain().map(|(id, _)| id).collect();
            (idle, pending)
        };
        for socket in idle {
            socket.close();
        }
        pending
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            idle: state.idle.len(),
            pending: state.pending.len(),
            in_use: state.in_use,
        }
    }
}

/// A tunnel socket bound to a relay.
///
/// The socket stays tied to the registration it was taken from: it only
/// ever returns to that registration's pool, and once the domain is
/// unregistered it is closed instead. Dropping it without calling
/// [`PooledTunnel::release`] discards the socket, so a relay that fails on
/// any path never leaks it back into the pool.
pub struct PooledTunnel {
    socket: Option<TunnelSocket>,
    entry: Arc<DomainEntry>,
    registry: Arc<TunnelRegistry>,
}

impl PooledTunnel {
    pub(crate) fn new(socket: TunnelSocket, entry: Arc<DomainEntry>, registry: Arc<TunnelRegistry>) -> Self {
        Self {
            socket: Some(socket),
            entry,
            registry,
        }
    }

    pub fn domain(&self) -> &str {
        self.socket.as_ref().map(|s| s.domain.as_str()).unwrap_or_default()
    }

    pub fn id(&self) -> Option<TunnelId> {
        self.socket.as_ref().map(|s| s.id)
    }

    /// Whether the registration this socket came from is still live.
    pub fn is_current(&self) -> bool {
        !self.entry.pool.is_closed()
    }

    /// Hand the socket back for another relay cycle.
    pub fn release(mut self) {
        if let Some(socket) = self.socket.take() {
            self.registry.release(&self.entry, socket);
        }
    }

    /// Close the socket and let the pool replace it.
    pub fn discard(mut self) {
        if let Some(socket) = self.socket.take() {
            self.registry.discard(&self.entry, socket);
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.socket
            .as_mut()
            .map(|s| &mut s.stream)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "tunnel socket released"))
    }
}

impl Drop for PooledTunnel {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.registry.discard(&self.entry, socket);
        }
    }
}

impl AsyncRead for PooledTunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for PooledTunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
