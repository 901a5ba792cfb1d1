//! Peer identifiers, peer handles, and shared peer-manager state.
//!
//! The dispatch core does not establish or tear down connections. It sees
//! peers through two injected collaborators owned by the surrounding peer
//! manager:
//!
//! - [`PeerDirectory`]: the shared map from [`PeerId`] to a live
//!   [`PeerLink`] handle. The core only reads it (lookups and id
//!   snapshots); connection management mutates it.
//! - [`ConnectionRegistry`]: pending-connection and connection-attempt
//!   bookkeeping that the connection-rejection handler clears on behalf of
//!   the peer manager.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Opaque peer identifier, carried on the wire as a plain JSON string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty id is never a valid peer; it is the decode default for
    /// messages missing an id field.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A live transport handle to a directly-connected peer.
///
/// Implemented by the transport layer. `send` is expected to be
/// non-blocking from the router's perspective; queuing and backpressure
/// are the transport's concern.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Whether the underlying connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Send a serialized message to the peer.
    async fn send(&self, payload: Vec<u8>) -> Result<()>;
}

/// Shared directory of connected peers.
///
/// Cheap to clone. The dispatch core performs lookups and id snapshots
/// only; `insert`/`remove` exist for the connection manager that owns the
/// peer lifecycle.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<RwLock<HashMap<PeerId, Arc<dyn PeerLink>>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &PeerId) -> Option<Arc<dyn PeerLink>> {
        self.inner.read().await.get(id).cloned()
    }

    /// Snapshot of every known peer id. Iteration order is unspecified.
    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn insert(&self, id: PeerId, link: Arc<dyn PeerLink>) {
        self.inner.write().await.insert(id, link);
    }

    pub async fn remove(&self, id: &PeerId) {
        self.inner.write().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl fmt::Debug for PeerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerDirectory").finish_non_exhaustive()
    }
}

/// Pending-connection and connection-attempt state owned by the
/// surrounding peer manager, injected so the connection-rejection handler
/// can clear it.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    pending: Arc<Mutex<HashSet<PeerId>>>,
    attempts: Arc<Mutex<HashMap<PeerId, u32>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pending(&self, peer: PeerId) {
        self.pending.lock().expect("lock poisoned").insert(peer);
    }

    pub fn record_attempt(&self, peer: PeerId) {
        *self
            .attempts
            .lock()
            .expect("lock poisoned")
            .entry(peer)
            .or_insert(0) += 1;
    }

    /// Drop every trace of the peer from both tables. Idempotent.
    pub fn discard(&self, peer: &PeerId) {
        self.pending.lock().expect("lock poisoned").remove(peer);
        self.attempts.lock().expect("lock poisoned").remove(peer);
    }

    pub fn has_pending(&self, peer: &PeerId) -> bool {
        self.pending.lock().expect("lock poisoned").contains(peer)
    }

    pub fn attempts_for(&self, peer: &PeerId) -> u32 {
        self.attempts
            .lock()
            .expect("lock poisoned")
            .get(peer)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubLink {
        connected: bool,
    }

    #[async_trait]
    impl PeerLink for StubLink {
        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn send(&self, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn directory_lookup_and_snapshot() {
        let peers = PeerDirectory::new();
        assert!(peers.is_empty().await);

        peers
            .insert("peer-a".into(), Arc::new(StubLink { connected: true }))
            .await;
        peers
            .insert("peer-b".into(), Arc::new(StubLink { connected: false }))
            .await;

        assert_eq!(peers.len().await, 2);
        assert!(peers.get(&"peer-a".into()).await.is_some());
        assert!(peers.get(&"peer-c".into()).await.is_none());

        let mut ids = peers.peer_ids().await;
        ids.sort();
        assert_eq!(ids, vec![PeerId::from("peer-a"), PeerId::from("peer-b")]);

        peers.remove(&"peer-a".into()).await;
        assert!(peers.get(&"peer-a".into()).await.is_none());
    }

    #[test]
    fn registry_discard_clears_both_tables() {
        let registry = ConnectionRegistry::new();
        let peer = PeerId::from("peer-a");

        registry.record_pending(peer.clone());
        registry.record_attempt(peer.clone());
        registry.record_attempt(peer.clone());
        assert!(registry.has_pending(&peer));
        assert_eq!(registry.attempts_for(&peer), 2);

        registry.discard(&peer);
        assert!(!registry.has_pending(&peer));
        assert_eq!(registry.attempts_for(&peer), 0);

        // discarding again is a no-op
        registry.discard(&peer);
    }

    #[test]
    fn peer_id_wire_representation_is_a_plain_string() {
        let id = PeerId::from("peer-a");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"peer-a\"");

        let back: PeerId = serde_json::from_str("\"peer-b\"").unwrap();
        assert_eq!(back.as_str(), "peer-b");
        assert!(PeerId::default().is_empty());
    }
}
