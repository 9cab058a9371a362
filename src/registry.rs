//! Group registry
//!
//! Maps a group name (the database name from the request path) to its live
//! peers, in insertion order. Peer ids are unique within a group at every
//! instant: admitting a peer whose id is already present evicts the
//! incumbent under the group's entry lock before the newcomer is appended.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::session::PeerSession;

/// Registry of live peers, partitioned by group
pub struct GroupRegistry {
    groups: DashMap<String, Vec<Arc<PeerSession>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
        }
    }

    /// Make sure a group entry exists
    pub fn ensure(&self, group: &str) {
        self.groups.entry(group.to_string()).or_default();
    }

    /// Append a peer to its group.
    ///
    /// If a peer with the same id is already present it is removed and its
    /// transport closed; the evicted session is returned so the caller can
    /// announce the disconnect. The incumbent's own close event will no
    /// longer find it here and becomes a no-op.
    pub fn add(&self, group: &str, peer: Arc<PeerSession>) -> Option<Arc<PeerSession>> {
        let mut peers = self.groups.entry(group.to_string()).or_default();

        let evicted = peers
            .iter()
            .position(|p| p.id() == peer.id())
            .map(|i| peers.remove(i));
        if let Some(ref incumbent) = evicted {
            debug!(
                "Evicting duplicate peer id {} from group {}",
                incumbent.id(),
                group
            );
            incumbent.close();
        }

        peers.push(peer);
        evicted
    }

    /// Remove a peer, matched by session identity rather than id so a close
    /// event for an evicted session cannot remove its successor. Returns
    /// whether anything was removed.
    pub fn remove(&self, group: &str, peer: &Arc<PeerSession>) -> bool {
        match self.groups.get_mut(group) {
            Some(mut peers) => match peers.iter().position(|p| Arc::ptr_eq(p, peer)) {
                Some(i) => {
                    peers.remove(i);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Whether this exact session is registered
    pub fn contains(&self, group: &str, peer: &Arc<PeerSession>) -> bool {
        self.groups
            .get(group)
            .map(|peers| peers.iter().any(|p| Arc::ptr_eq(p, peer)))
            .unwrap_or(false)
    }

    /// Look a peer up by id
    pub fn find_by_id(&self, group: &str, id: &str) -> Option<Arc<PeerSession>> {
        self.groups
            .get(group)?
            .iter()
            .find(|p| p.id() == id)
            .cloned()
    }

    /// Snapshot of a group's peers, in insertion order
    pub fn list(&self, group: &str) -> Vec<Arc<PeerSession>> {
        self.groups
            .get(group)
            .map(|peers| peers.clone())
            .unwrap_or_default()
    }

    /// Snapshot of every peer across all groups
    pub fn all(&self) -> Vec<Arc<PeerSession>> {
        self.groups
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of groups (empty entries included)
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of connected peers across all groups
    pub fn peer_count(&self) -> usize {
        self.groups.iter().map(|entry| entry.value().len()).sum()
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}
