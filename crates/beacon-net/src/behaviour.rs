//! Composed libp2p `NetworkBehaviour` for the P2P backend.
//!
//! Combines GossipSub (channel topics), Kademlia (DHT peer discovery) and
//! Identify (protocol negotiation and address exchange).

use libp2p::{
    gossipsub, identify,
    kad::{self, store::MemoryStore},
    swarm::NetworkBehaviour,
};

/// Composed network behaviour for gateway nodes.
///
/// All sub-behaviours are driven by the single swarm event loop.
/// Construction is handled by [`super::transport::build_swarm`].
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "BeaconEvent")]
pub struct BeaconBehaviour {
    /// Pub/sub messaging, one topic per channel
    pub gossipsub: gossipsub::Behaviour,
    /// Distributed hash table for peer discovery
    pub kademlia: kad::Behaviour<MemoryStore>,
    /// Protocol identification and listen address exchange
    pub identify: identify::Behaviour,
}

/// Events emitted by the composed behaviour, one variant per sub-behaviour.
#[derive(Debug)]
pub enum BeaconEvent {
    Gossipsub(gossipsub::Event),
    Kademlia(kad::Event),
    Identify(identify::Event),
}

impl From<gossipsub::Event> for BeaconEvent {
    fn from(event: gossipsub::Event) -> Self {
        BeaconEvent::Gossipsub(event)
    }
}

impl From<kad::Event> for BeaconEvent {
    fn from(event: kad::Event) -> Self {
        BeaconEvent::Kademlia(event)
    }
}

impl From<identify::Event> for BeaconEvent {
    fn from(event: identify::Event) -> Self {
        BeaconEvent::Identify(event)
    }
}
