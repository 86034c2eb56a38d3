//! Peer connection tracking for the P2P backend.
//!
//! The gossip session counts as connected while at least one peer is; the
//! tracker is what decides when the last one has gone.

use std::collections::HashMap;

use libp2p::{Multiaddr, PeerId};
use tracing::debug;

/// Connected peers and the address each one was reached on.
#[derive(Debug, Clone, Default)]
pub struct PeerTracker {
    peers: HashMap<PeerId, Multiaddr>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connected peer. Returns true if no peer was connected before.
    pub fn on_connected(&mut self, peer_id: PeerId, address: Multiaddr) -> bool {
        debug!(peer = %peer_id, addr = %address, "Tracking peer");
        let was_empty = self.peers.is_empty();
        self.peers.insert(peer_id, address);
        was_empty
    }

    /// Forget a peer that has fully disconnected. Returns how many remain.
    pub fn on_disconnected(&mut self, peer_id: &PeerId) -> usize {
        if self.peers.remove(peer_id).is_some() {
            debug!(peer = %peer_id, remaining = self.peers.len(), "Peer untracked");
        }
        self.peers.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
