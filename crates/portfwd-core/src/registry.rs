//! Live connection tracking
//!
//! The registry never owns the sockets themselves. Each entry carries a
//! cancellation token shared with the relay task that owns the streams;
//! cancelling it makes the relay drop (and therefore close) both ends.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Synthetic, monotonically increasing connection identifier
///
/// Peer addresses are not used as keys: two sessions started back to back
/// may see the same ephemeral port reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte counters shared between a registry entry and its relay
#[derive(Debug, Clone, Default)]
pub struct ByteCounters {
    /// Bytes copied from the source side to the target
    pub to_target: Arc<AtomicU64>,
    /// Bytes copied from the target back to the source side
    pub to_source: Arc<AtomicU64>,
}

/// One active relayed pair
#[derive(Debug)]
pub struct ConnectionEntry {
    id: ConnectionId,
    peer_addr: SocketAddr,
    target_addr: String,
    connected_at: DateTime<Utc>,
    counters: ByteCounters,
    cancel: CancellationToken,
}

impl ConnectionEntry {
    pub fn new(id: ConnectionId, peer_addr: SocketAddr, target_addr: impl Into<String>) -> Self {
        Self {
            id,
            peer_addr,
            target_addr: target_addr.into(),
            connected_at: Utc::now(),
            counters: ByteCounters::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Token the relay watches; cancelling it closes both sockets
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn counters(&self) -> ByteCounters {
        self.counters.clone()
    }

    /// Close both sides of the relayed pair
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer_addr: self.peer_addr,
            target_addr: self.target_addr.clone(),
            connected_at: self.connected_at,
            bytes_to_target: self.counters.to_target.load(Ordering::Relaxed),
            bytes_to_source: self.counters.to_source.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a connection, safe to hand to reporting code
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub target_addr: String,
    pub connected_at: DateTime<Utc>,
    pub bytes_to_target: u64,
    pub bytes_to_source: u64,
}

/// Tracks currently open relayed connections
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next connection id
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionEntry>> {
        // Entries stay consistent even if a holder panicked; no invariant spans the guard.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an entry, replacing any entry with the same id
    ///
    /// A displaced entry is closed so its sockets are not orphaned.
    pub fn insert(&self, entry: ConnectionEntry) {
        let displaced = self.entries().insert(entry.id, entry);
        if let Some(old) = displaced {
            debug!(connection_id = %old.id, "Replaced registry entry, closing previous pair");
            old.close();
        }
    }

    /// Remove an entry; returns false if it was already gone
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.entries().remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Ids of all live connections, in allocation order
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.entries().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Copy of every live connection, in allocation order
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.entries().values().map(ConnectionEntry::info).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Take every entry out of the registry and close it
    ///
    /// The map is swapped out under the lock; closing happens after the lock
    /// is released. Returns the number of connections closed.
    pub fn drain_and_close_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.entries());
        let count = drained.len();
        for (id, entry) in drained {
            debug!(connection_id = %id, peer = %entry.peer_addr, "Closing connection");
            entry.close();
        }
        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_ids_are_monotonic() {
        let registry = ConnectionRegistry::new();
        let first = registry.next_id();
        let second = registry.next_id();
        assert_eq!(first.as_u64(), 1);
        assert_eq!(second.as_u64(), 2);
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = ConnectionRegistry::new();
        let id = registry.next_id();
        registry.insert(ConnectionEntry::new(id, peer(40000), "127.0.0.1:9000"));

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(id));

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_insert_same_id_closes_displaced_entry() {
        let registry = ConnectionRegistry::new();
        let id = registry.next_id();
        let first = ConnectionEntry::new(id, peer(40000), "127.0.0.1:9000");
        let first_token = first.cancel_token();
        registry.insert(first);
        registry.insert(ConnectionEntry::new(id, peer(40001), "127.0.0.1:9000"));

        assert_eq!(registry.len(), 1);
        assert!(first_token.is_cancelled());
        assert_eq!(registry.snapshot()[0].peer_addr, peer(40001));
    }

    #[test]
    fn test_drain_closes_every_entry() {
        let registry = ConnectionRegistry::new();
        let mut tokens = Vec::new();
        for port in 40000..40003 {
            let entry = ConnectionEntry::new(registry.next_id(), peer(port), "127.0.0.1:9000");
            tokens.push(entry.cancel_token());
            registry.insert(entry);
        }

        assert_eq!(registry.drain_and_close_all(), 3);
        assert!(registry.is_empty());
        assert!(tokens.iter().all(|t| t.is_cancelled()));

        // Draining an empty registry is a no-op
        assert_eq!(registry.drain_and_close_all(), 0);
    }

    #[test]
    fn test_snapshot_reports_counters_in_order() {
        let registry = ConnectionRegistry::new();
        let a = ConnectionEntry::new(registry.next_id(), peer(40000), "127.0.0.1:9000");
        let b = ConnectionEntry::new(registry.next_id(), peer(40001), "127.0.0.1:9000");
        a.counters().to_target.fetch_add(4, Ordering::Relaxed);
        b.counters().to_source.fetch_add(7, Ordering::Relaxed);
        registry.insert(b);
        registry.insert(a);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id.as_u64(), 1);
        assert_eq!(snapshot[0].bytes_to_target, 4);
        assert_eq!(snapshot[1].bytes_to_source, 7);
        assert_eq!(registry.ids().len(), 2);
    }

    #[test]
    fn test_concurrent_insert_and_drain() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut handles = Vec::new();
        for t in 0..4u16 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100u16 {
                    let id = registry.next_id();
                    registry.insert(ConnectionEntry::new(id, peer(t * 1000 + i), "x:1"));
                    if i % 10 == 0 {
                        registry.drain_and_close_all();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        registry.drain_and_close_all();
        assert!(registry.is_empty());
    }
}
