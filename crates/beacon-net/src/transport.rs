use libp2p::identity::Keypair;
use tracing::info;

use beacon_shared::constants::{GOSSIPSUB_HEARTBEAT_SECS, MAX_FRAME_SIZE, PROTOCOL_VERSION};

use crate::behaviour::BeaconBehaviour;

/// Build the libp2p Ed25519 keypair from a 32-byte seed.
pub fn keypair_from_seed(seed: [u8; 32]) -> anyhow::Result<Keypair> {
    Keypair::ed25519_from_bytes(seed)
        .map_err(|e| anyhow::anyhow!("Failed to create libp2p keypair: {e}"))
}

pub fn build_swarm(keypair: Keypair) -> anyhow::Result<libp2p::Swarm<BeaconBehaviour>> {
    use std::time::Duration;

    use libp2p::gossipsub::{self, MessageAuthenticity, MessageId, ValidationMode};
    use libp2p::kad::{self, store::MemoryStore};
    use libp2p::{identify, SwarmBuilder};

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_behaviour(|key| -> std::result::Result<BeaconBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            let local_peer_id = key.public().to_peer_id();

            // Content addressed: a re-published envelope keeps its id, so
            // gossip never delivers the same bytes twice.
            let message_id_fn = |message: &gossipsub::Message| {
                MessageId::from(blake3::hash(&message.data).to_hex().to_string())
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
                .validation_mode(ValidationMode::Strict)
                .max_transmit_size(MAX_FRAME_SIZE)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                    format!("GossipSub config: {e}").into()
                })?;

            let gossipsub = gossipsub::Behaviour::new(
                MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                format!("GossipSub init: {e}").into()
            })?;

            let store = MemoryStore::new(local_peer_id);
            let mut kademlia = kad::Behaviour::new(local_peer_id, store);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify_config =
                identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                    .with_push_listen_addr_updates(true)
                    .with_interval(Duration::from_secs(60));
            let identify = identify::Behaviour::new(identify_config);

            Ok(BeaconBehaviour {
                gossipsub,
                kademlia,
                identify,
            })
        })?
        .with_swarm_config(|cfg| {
            cfg.with_idle_connection_timeout(Duration::from_secs(60))
        })
        .build();

    info!(
        peer_id = %swarm.local_peer_id(),
        "Built gateway swarm with QUIC transport"
    );

    Ok(swarm)
}
