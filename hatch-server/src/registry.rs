//! Domain registry and tunnel-socket correlation.
//!
//! The registry owns the only mutable state shared between connections:
//! which control connection owns which domain, each domain's socket pool,
//! and the index of outstanding `ADD` ids. Domain ownership and id claims
//! are single atomic operations on sharded maps, so concurrent `HELLO`s for
//! one domain yield exactly one winner and each id is claimed at most once.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use hatch_core::{ControlMessage, TunnelError, TunnelId, TunnelResult};

use crate::pool::{DomainPool, PoolStats, PooledTunnel, TunnelSocket};

/// Pool sizing for every domain.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Target for `idle + pending` sockets per domain.
    pub size: usize,
    /// How long an `ADD` may stay unanswered.
    pub pending_ttl: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 5,
            pending_ttl: Duration::from_secs(30),
        }
    }
}

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle for sending frames to one control connection.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    pub id: ConnectionId,
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlHandle {
    pub fn new(tx: mpsc::Sender<ControlMessage>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Queue a frame without waiting. False if the writer is gone or backed up.
    pub fn send(&self, msg: ControlMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }
}

/// Live registration of one domain.
pub struct DomainEntry {
    pub domain: String,
    pub owner: ControlHandle,
    pub created_at: Instant,
    pub pool: DomainPool,
}

#[derive(Debug, Clone)]
struct PendingTunnelRequest {
    domain: String,
    owner: ConnectionId,
    issued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Success,
    Occupied,
}

pub struct TunnelRegistry {
    domains: DashMap<String, Arc<DomainEntry>>,
    pending: DashMap<TunnelId, PendingTunnelRequest>,
    settings: PoolSettings,
}

impl TunnelRegistry {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            domains: DashMap::new(),
            pending: DashMap::new(),
            settings,
        }
    }

    fn entry(&self, domain: &str) -> Option<Arc<DomainEntry>> {
        self.domains.get(domain).map(|e| e.value().clone())
    }

    /// Claim `domain` for `owner` unless someone already holds it.
    pub fn register(&self, domain: &str, owner: ControlHandle) -> Registration {
        match self.domains.entry(domain.to_string()) {
            Entry::Occupied(_) => Registration::Occupied,
            Entry::Vacant(vacant) => {
                info!(domain, connection = owner.id, "domain registered");
                vacant.insert(Arc::new(DomainEntry {
                    domain: domain.to_string(),
                    owner,
                    created_at: Instant::now(),
                    pool: DomainPool::new(self.settings.size),
                }));
                Registration::Success
            }
        }
    }

    /// Drop the registration of `domain` if `owner` still holds it.
    ///
    /// The pool is closed before the entry leaves the map, so a relay that
    /// already looked the entry up cannot take a socket from it afterwards.
    pub fn unregister(&self, domain: &str, owner: ConnectionId) -> bool {
        let Some(entry) = self.entry(domain).filter(|e| e.owner.id == owner) else {
            return false;
        };
        let evicted = entry.pool.close();
        for id in &evicted {
            self.pending.remove(id);
        }
        if self
            .domains
            .remove_if(domain, |_, e| Arc::ptr_eq(e, &entry))
            .is_none()
        {
            return false;
        }
        info!(
            domain,
            connection = owner,
            evicted = evicted.len(),
            registered_for = ?entry.created_at.elapsed(),
            "domain unregistered"
        );
        true
    }

    #[cfg(test)]
    pub fn is_registered(&self, domain: &str) -> bool {
        self.domains.contains_key(domain)
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pool_stats(&self, domain: &str) -> Option<PoolStats> {
        self.entry(domain).map(|e| e.pool.stats())
    }

    /// Ask the owner of `domain` for up to `count` new tunnel sockets,
    /// never beyond the pool size. Returns how many `ADD`s were sent.
    pub fn warm(&self, domain: &str, count: usize) -> usize {
        match self.entry(domain) {
            Some(entry) => self.warm_entry(&entry, count),
            None => 0,
        }
    }

    /// Top the pool of `domain` back up to its size.
    pub fn replenish(&self, domain: &str) -> usize {
        self.warm(domain, usize::MAX)
    }

    fn warm_entry(&self, entry: &DomainEntry, count: usize) -> usize {
        let ids = entry.pool.refill(count);
        if ids.is_empty() {
            return 0;
        }

        let now = Instant::now();
        for id in &ids {
            self.pending.insert(
                *id,
                PendingTunnelRequest {
                    domain: entry.domain.clone(),
                    owner: entry.owner.id,
                    issued_at: now,
                },
            );
        }
        // A concurrent unregister may have drained the pool before these ids
        // reached the index.
        if entry.pool.is_closed() {
            for id in &ids {
                self.pending.remove(id);
            }
            return 0;
        }

        let mut issued = 0;
        for id in ids {
            if entry.owner.send(ControlMessage::add(id)) {
                issued += 1;
            } else {
                warn!(domain = %entry.domain, %id, "control connection cannot take ADD");
                entry.pool.abandon(&id);
                self.pending.remove(&id);
            }
        }
        debug!(domain = %entry.domain, issued, "requested tunnel sockets");
        issued
    }

    /// Correlate a freshly tagged tunnel socket with its pending request.
    ///
    /// Exactly one caller can claim an id. Unknown, stale or foreign ids are
    /// rejected and the socket is closed.
    pub fn claim_socket_for_id(
        &self,
        id: TunnelId,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> TunnelResult<String> {
        let Some((_, request)) = self.pending.remove(&id) else {
            return Err(TunnelError::unknown_tunnel_id(id).with_context("peer", peer.to_string()));
        };

        let entry = match self.entry(&request.domain) {
            Some(entry) if entry.owner.id == request.owner => entry,
            _ => {
                return Err(TunnelError::unknown_tunnel_id(id)
                    .with_context("domain", request.domain)
                    .with_context("reason", "owner gone"))
            }
        };

        let socket = TunnelSocket::new(id, request.domain.clone(), stream, peer);
        match entry.pool.fulfil(socket) {
            Ok(()) => {
                trace!(
                    domain = %request.domain,
                    %id,
                    waited = ?request.issued_at.elapsed(),
                    "tunnel socket pooled"
                );
                Ok(request.domain)
            }
            Err(_surplus) => Err(TunnelError::unknown_tunnel_id(id)
                .with_context("domain", request.domain)
                .with_context("reason", "pool closed or full")),
        }
    }

    /// The client could not open the socket for `id`.
    pub fn abandon(&self, id: TunnelId, owner: ConnectionId) -> bool {
        let Some((_, request)) = self.pending.remove_if(&id, |_, r| r.owner == owner) else {
            return false;
        };
        if let Some(entry) = self.entry(&request.domain) {
            entry.pool.abandon(&id);
            self.warm_entry(&entry, usize::MAX);
        }
        true
    }

    /// Evict pending ids of `domain` older than the configured TTL, then
    /// request replacements.
    pub fn expire_pending(&self, domain: &str) -> usize {
        let Some(entry) = self.entry(domain) else {
            return 0;
        };
        let expired = entry.pool.expire(self.settings.pending_ttl);
        for id in &expired {
            self.pending.remove(id);
        }
        if !expired.is_empty() {
            debug!(domain, expired = expired.len(), "unanswered ADD requests expired");
        }
        self.warm_entry(&entry, usize::MAX);
        expired.len()
    }

    /// Take an Idle tunnel socket for `domain` and request its replacement.
    pub fn acquire(self: &Arc<Self>, domain: &str) -> Option<PooledTunnel> {
        let entry = self.entry(domain)?;
        let socket = entry.pool.acquire();
        self.warm_entry(&entry, usize::MAX);
        socket.map(|socket| PooledTunnel::new(socket, entry, Arc::clone(self)))
    }

    /// Return a socket to the pool of the registration it was taken from. A
    /// closed pool refuses it, so a socket never outlives its owner.
    pub(crate) fn release(&self, entry: &DomainEntry, socket: TunnelSocket) {
        if let Err(surplus) = entry.pool.release(socket) {
            trace!(domain = %surplus.domain, "pool full or closed, dropping socket");
        }
    }

    pub(crate) fn discard(&self, entry: &DomainEntry, socket: TunnelSocket) {
        entry.pool.discard(socket);
        self.warm_entry(entry, usize::MAX);
    }
}
