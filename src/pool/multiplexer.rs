//! Connection pool keyed by origin.
//!
//! - HTTP/2: several multiplexed connections per key; a new one is dialed
//!   only when every existing one is at its stream ceiling (or, in strict
//!   mode, never while one is open)
//! - HTTP/1.1: idle keep-alive connections parked per key

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, RwLock};
use url::Url;

use crate::error::{Error, Result};
use crate::transport::h1::H1Connection;
use crate::transport::h2::{H2Handle, StreamSlot};

/// Pool key: `scheme://host:port`.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct PoolKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl PoolKey {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Key for the origin of `url`, with the scheme's default port filled in.
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::encoding(format!("URL has no host: {}", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::encoding(format!("URL has no port: {}", url)))?;
        Ok(Self::new(url.scheme(), host.to_ascii_lowercase(), port))
    }

    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Parked HTTP/1.1 connection.
#[derive(Debug)]
pub struct H1PoolEntry {
    pub conn: H1Connection,
    pub last_used: Instant,
}

impl H1PoolEntry {
    pub fn new(conn: H1Connection) -> Self {
        Self {
            conn,
            last_used: Instant::now(),
        }
    }

    pub fn is_expired(&self, max_idle: Option<Duration>) -> bool {
        max_idle.is_some_and(|max| self.last_used.elapsed() >= max)
    }
}

/// Connection pool shared by every request a [`Transport`](crate::Transport)
/// sends.
pub struct ConnectionPool {
    h2: Arc<RwLock<HashMap<PoolKey, Vec<H2Handle>>>>,
    h1_idle: Arc<tokio::sync::Mutex<HashMap<PoolKey, Vec<H1PoolEntry>>>>,
    /// Origins that answered ALPN with `http/1.1`.
    h1_origins: Mutex<HashSet<PoolKey>>,
    dial_locks: Mutex<HashMap<PoolKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Signalled by every connection when a slot frees up or it closes.
    notify: Arc<Notify>,
    max_idle_duration: Option<Duration>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_idle_duration", &self.max_idle_duration)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(max_idle: Option<Duration>) -> Self {
        Self {
            h2: Arc::new(RwLock::new(HashMap::new())),
            h1_idle: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            h1_origins: Mutex::new(HashSet::new()),
            dial_locks: Mutex::new(HashMap::new()),
            notify: Arc::new(Notify::new()),
            max_idle_duration: max_idle,
        }
    }

    /// Notifier to hand to new HTTP/2 connections.
    pub fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Reserve a stream on an existing HTTP/2 connection. Closed connections
    /// are dropped from the pool on the way.
    pub async fn try_reserve_h2(&self, key: &PoolKey) -> Option<(H2Handle, StreamSlot)> {
        let mut pool = self.h2.write().await;
        let conns = pool.get_mut(key)?;
        let before = conns.len();
        conns.retain(|h| !h.is_closed());
        if conns.len() != before {
            tracing::debug!(
                "H2 Pool: dropped {} closed connection(s) for {}",
                before - conns.len(),
                key
            );
        }
        let found = conns
            .iter()
            .find_map(|h| h.try_reserve().map(|slot| (h.clone(), slot)));
        match &found {
            Some((handle, _)) => tracing::debug!(
                "H2 Pool: reusing connection {} for {} (in flight: {})",
                handle.id(),
                key,
                handle.in_flight()
            ),
            None => tracing::debug!(
                "H2 Pool: {} connection(s) for {}, none can take a stream",
                conns.len(),
                key
            ),
        }
        if conns.is_empty() {
            pool.remove(key);
        }
        found
    }

    /// Whether any HTTP/2 connection for `key` is still open (possibly busy).
    pub async fn has_open_h2(&self, key: &PoolKey) -> bool {
        let pool = self.h2.read().await;
        pool.get(key)
            .is_some_and(|conns| conns.iter().any(|h| !h.is_closed()))
    }

    pub async fn insert_h2(&self, key: PoolKey, handle: H2Handle) {
        tracing::debug!("H2 Pool: adding connection {} for {}", handle.id(), key);
        self.h2.write().await.entry(key).or_default().push(handle);
    }

    /// Serializes dials to one origin so concurrent requests share the
    /// first connection instead of each opening their own.
    pub fn dial_lock(&self, key: &PoolKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.dial_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }

    /// Hand back a lock from [`dial_lock`](Self::dial_lock). The entry is
    /// dropped once no other request holds or waits on it.
    pub fn release_dial_lock(&self, key: &PoolKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.dial_locks.lock().unwrap_or_else(PoisonError::into_inner);
        let unused = locks
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &lock) && Arc::strong_count(&lock) == 2);
        if unused {
            locks.remove(key);
        }
    }

    /// Number of origins with a live dial lock.
    pub fn dial_lock_count(&self) -> usize {
        self.dial_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn mark_h1_origin(&self, key: &PoolKey) {
        self.h1_origins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
    }

    /// The origin negotiated `h2` after all.
    pub fn forget_h1_origin(&self, key: &PoolKey) {
        self.h1_origins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn is_h1_origin(&self, key: &PoolKey) -> bool {
        self.h1_origins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Take an idle HTTP/1.1 connection, discarding expired ones.
    pub async fn get_h1(&self, key: &PoolKey) -> Option<H1Connection> {
        let mut pool = self.h1_idle.lock().await;
        let entries = pool.get_mut(key)?;
        let mut found = None;
        while let Some(entry) = entries.pop() {
            if !entry.is_expired(self.max_idle_duration) {
                tracing::debug!(
                    "H1 Pool: reusing connection for {} ({} left idle)",
                    key,
                    entries.len()
                );
                found = Some(entry.conn);
                break;
            }
            tracing::debug!(
                "H1 Pool: connection expired for {} (age: {:?})",
                key,
                entry.last_used.elapsed()
            );
        }
        if entries.is_empty() {
            pool.remove(key);
        }
        found
    }

    /// Park an HTTP/1.1 connection for reuse.
    pub async fn put_h1(&self, key: PoolKey, conn: H1Connection) {
        let mut pool = self.h1_idle.lock().await;
        let entries = pool.entry(key.clone()).or_default();
        entries.retain(|e| !e.is_expired(self.max_idle_duration));
        entries.push(H1PoolEntry::new(conn));
        tracing::debug!("H1 Pool: parked connection for {} (idle: {})", key, entries.len());
    }

    /// Close every connection that has no request in flight.
    pub async fn close_idle_connections(&self) {
        {
            let mut pool = self.h2.write().await;
            for conns in pool.values_mut() {
                for handle in conns.iter() {
                    if handle.close_if_idle() {
                        tracing::debug!("H2 Pool: closed idle connection {}", handle.id());
                    }
                }
                conns.retain(|h| !h.is_closed());
            }
            pool.retain(|_, conns| !conns.is_empty());
        }
        self.h1_idle.lock().await.clear();
        self.h1_origins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Current pool statistics (for debugging/monitoring).
    pub async fn stats(&self) -> PoolStats {
        let h2 = self.h2.read().await;
        let h1_pool = self.h1_idle.lock().await;
        let open: Vec<&H2Handle> = h2.values().flatten().filter(|h| !h.is_closed()).collect();
        PoolStats {
            http2_connections: open.len(),
            active_streams: open.iter().map(|h| h.in_flight()).sum(),
            http1_idle_connections: h1_pool.values().map(Vec::len).sum(),
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub http2_connections: usize,
    pub active_streams: usize,
    pub http1_idle_connections: usize,
}
