//! Bootstrap endpoint parsing and Kademlia discovery helpers.

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId, Swarm};
use tracing::{debug, info, warn};

use crate::backend::BackendError;
use crate::behaviour::BeaconBehaviour;

/// Parse configured endpoints into multiaddrs.
///
/// Unlike a config file, endpoints handed to `connect` are authoritative: one
/// malformed entry fails the whole call so the caller sees the typo.
///
/// ```text
/// /ip4/198.51.100.10/udp/4011/quic-v1/p2p/12D3KooW...
/// ```
pub fn parse_endpoints(endpoints: &[String]) -> Result<Vec<Multiaddr>, BackendError> {
    endpoints
        .iter()
        .map(|raw| {
            raw.trim()
                .parse::<Multiaddr>()
                .map_err(|e| BackendError::InvalidEndpoint(format!("{raw}: {e}")))
        })
        .collect()
}

/// Dial every bootstrap address and seed the Kademlia routing table.
///
/// Returns how many dials were started.
pub fn dial_bootstrap(swarm: &mut Swarm<BeaconBehaviour>, addrs: &[Multiaddr]) -> usize {
    let mut dialed = 0;
    for addr in addrs {
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
            continue;
        }
        dialed += 1;
        if let Some(peer_id) = extract_peer_id(addr) {
            swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer_id, addr.clone());
        }
        debug!(addr = %addr, "Dialing bootstrap peer");
    }

    if dialed > 0 {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            // No known peer id among the addresses; gossip still works
            debug!(error = %e, "Kademlia bootstrap not started");
        }
    }

    info!(count = dialed, "Bootstrap dials started");
    dialed
}

/// Extract a `PeerId` from a multiaddr, if one is present.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| {
        if let Protocol::P2p(peer_id) = p {
            Some(peer_id)
        } else {
            None
        }
    })
}
