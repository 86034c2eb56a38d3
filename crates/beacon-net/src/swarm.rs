//! The libp2p swarm task behind [`SwarmClient`](crate::SwarmClient).
//!
//! Commands go in over an mpsc channel with oneshot replies for the ones
//! the caller waits on; peer and gossip activity comes back as
//! [`SwarmNotification`]s.

use futures::StreamExt;
use libp2p::{gossipsub, identify, kad, swarm::SwarmEvent, Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use beacon_shared::constants::DEFAULT_QUIC_PORT;

use crate::backend::BackendError;
use crate::behaviour::BeaconEvent;
use crate::discovery::dial_bootstrap;
use crate::peers::PeerTracker;
use crate::transport::build_swarm;

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    /// Publish on a GossipSub topic and report the outcome.
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), BackendError>>,
    },
    /// Subscribe to a GossipSub topic.
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), BackendError>>,
    },
    /// Leave a GossipSub topic.
    Unsubscribe(String),
    /// Gracefully shut down the swarm.
    Shutdown,
}

/// Notifications sent *from* the swarm task to the application.
#[derive(Debug, Clone)]
pub enum SwarmNotification {
    /// A new peer connected. `first` is set when no peer was connected before.
    PeerConnected {
        peer_id: PeerId,
        address: Multiaddr,
        first: bool,
    },
    /// A peer disconnected.
    PeerDisconnected { peer_id: PeerId, remaining: usize },
    /// A GossipSub message was received.
    MessageReceived {
        source: Option<PeerId>,
        topic: String,
        data: Vec<u8>,
    },
}

/// Configuration for spawning the swarm.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Port to listen on (defaults to `DEFAULT_QUIC_PORT`).
    pub listen_port: u16,
    /// Multiaddrs dialed on startup.
    pub bootstrap: Vec<Multiaddr>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_QUIC_PORT,
            bootstrap: Vec::new(),
        }
    }
}

/// Spawn the libp2p swarm in a background tokio task.
///
/// Returns `(command_tx, notification_rx, local_peer_id)`. The task stops
/// when every command sender is dropped or on [`SwarmCommand::Shutdown`].
pub async fn spawn_swarm(
    keypair: libp2p::identity::Keypair,
    config: SwarmConfig,
) -> anyhow::Result<(
    mpsc::Sender<SwarmCommand>,
    mpsc::Receiver<SwarmNotification>,
    PeerId,
)> {
    let mut swarm = build_swarm(keypair)?;
    let local_peer_id = *swarm.local_peer_id();

    // Listening is optional: an outbound-only node still gossips
    let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port).parse()?;
    match swarm.listen_on(listen_addr) {
        Ok(_) => info!(peer_id = %local_peer_id, port = config.listen_port, "Swarm listening"),
        Err(e) => warn!(port = config.listen_port, error = %e, "Swarm not listening, outbound only"),
    }

    dial_bootstrap(&mut swarm, &config.bootstrap);

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SwarmNotification>(256);

    tokio::spawn(async move {
        let mut peer_tracker = PeerTracker::new();

        loop {
            tokio::select! {
                // --- Incoming commands ---
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SwarmCommand::Publish { topic, data, reply }) => {
                            let gossipsub_topic = gossipsub::IdentTopic::new(&topic);
                            let result = match swarm
                                .behaviour_mut()
                                .gossipsub
                                .publish(gossipsub_topic, data)
                            {
                                Ok(_) => Ok(()),
                                // Content-addressed ids: the same bytes are already out
                                Err(gossipsub::PublishError::Duplicate) => Ok(()),
                                Err(gossipsub::PublishError::InsufficientPeers) => {
                                    Err(BackendError::NotConnected)
                                }
                                Err(e) => {
                                    error!(topic = %topic, error = %e, "Publish failed");
                                    Err(BackendError::Rejected(e.to_string()))
                                }
                            };
                            let _ = reply.send(result);
                        }
                        Some(SwarmCommand::Subscribe { topic, reply }) => {
                            let gossipsub_topic = gossipsub::IdentTopic::new(&topic);
                            let result = swarm
                                .behaviour_mut()
                                .gossipsub
                                .subscribe(&gossipsub_topic)
                                .map(|_| ())
                                .map_err(|e| {
                                    error!(topic = %topic, error = %e, "Subscribe failed");
                                    BackendError::Rejected(e.to_string())
                                });
                            let _ = reply.send(result);
                        }
                        Some(SwarmCommand::Unsubscribe(topic)) => {
                            let gossipsub_topic = gossipsub::IdentTopic::new(&topic);
                            let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&gossipsub_topic);
                        }
                        Some(SwarmCommand::Shutdown) => {
                            info!("Swarm shutdown requested");
                            break;
                        }
                        None => {
                            info!("Command channel closed, shutting down swarm");
                            break;
                        }
                    }
                }

                // --- Swarm events ---
                event = swarm.select_next_some() => {
                    let notification = match event {
                        SwarmEvent::Behaviour(BeaconEvent::Gossipsub(
                            gossipsub::Event::Message { message, .. },
                        )) => {
                            let topic = message.topic.to_string();
                            debug!(
                                topic = %topic,
                                source = ?message.source,
                                len = message.data.len(),
                                "GossipSub message received"
                            );
                            Some(SwarmNotification::MessageReceived {
                                source: message.source,
                                topic,
                                data: message.data,
                            })
                        }

                        SwarmEvent::Behaviour(BeaconEvent::Kademlia(
                            kad::Event::OutboundQueryProgressed { result, .. },
                        )) => {
                            debug!(result = ?result, "Kademlia query progressed");
                            None
                        }

                        SwarmEvent::Behaviour(BeaconEvent::Identify(
                            identify::Event::Received { peer_id, info, .. },
                        )) => {
                            debug!(
                                peer = %peer_id,
                                protocol = ?info.protocol_version,
                                "Identify: received info from peer"
                            );
                            for addr in &info.listen_addrs {
                                swarm
                                    .behaviour_mut()
                                    .kademlia
                                    .add_address(&peer_id, addr.clone());
                            }
                            None
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            let addr = endpoint.get_remote_address().clone();
                            let first = peer_tracker.on_connected(peer_id, addr.clone());
                            info!(peer = %peer_id, addr = %addr, peers = peer_tracker.peer_count(), "Peer connected");
                            Some(SwarmNotification::PeerConnected {
                                peer_id,
                                address: addr,
                                first,
                            })
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. }
                            if num_established == 0 =>
                        {
                            let remaining = peer_tracker.on_disconnected(&peer_id);
                            info!(peer = %peer_id, remaining, "Peer disconnected");
                            Some(SwarmNotification::PeerDisconnected { peer_id, remaining })
                        }

                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "Listening on new address");
                            None
                        }

                        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                            warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
                            None
                        }

                        SwarmEvent::IncomingConnectionError { error, .. } => {
                            warn!(error = %error, "Incoming connection error");
                            None
                        }

                        _ => None,
                    };

                    if let Some(notification) = notification {
                        if notif_tx.send(notification).await.is_err() {
                            info!("Notification receiver dropped, shutting down swarm");
                            break;
                        }
                    }
                }
            }
        }

        info!("Swarm event loop terminated");
    });

    Ok((cmd_tx, notif_rx, local_peer_id))
}
