//! [`BackendClient`] over the libp2p gossip swarm.

use std::sync::Mutex;

use async_trait::async_trait;
use libp2p::identity::Keypair;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, BackendError, BackendNotification, NOTIFICATION_BUFFER};
use crate::discovery::parse_endpoints;
use crate::swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmNotification};
use crate::transport::keypair_from_seed;

/// P2P backend: one swarm per session, connected once the first peer is.
pub struct SwarmClient {
    keypair: Keypair,
    listen_port: u16,
    session: Mutex<Option<mpsc::Sender<SwarmCommand>>>,
}

impl SwarmClient {
    pub fn new(seed: [u8; 32], listen_port: u16) -> anyhow::Result<Self> {
        Ok(Self {
            keypair: keypair_from_seed(seed)?,
            listen_port,
            session: Mutex::new(None),
        })
    }

    pub fn local_peer_id(&self) -> libp2p::PeerId {
        self.keypair.public().to_peer_id()
    }

    fn command_tx(&self) -> Result<mpsc::Sender<SwarmCommand>, BackendError> {
        self.session
            .lock()
            .map_err(|_| BackendError::Closed)?
            .clone()
            .ok_or(BackendError::NotConnected)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, BackendError>>) -> SwarmCommand,
    ) -> Result<T, BackendError> {
        let cmd_tx = self.command_tx()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| BackendError::NotConnected)?;
        reply_rx.await.map_err(|_| BackendError::NotConnected)?
    }
}

#[async_trait]
impl BackendClient for SwarmClient {
    fn name(&self) -> &'static str {
        "libp2p"
    }

    async fn connect(
        &self,
        endpoints: &[String],
    ) -> Result<mpsc::Receiver<BackendNotification>, BackendError> {
        let bootstrap = parse_endpoints(endpoints)?;
        if bootstrap.is_empty() {
            return Err(BackendError::NoEndpoints);
        }
        self.disconnect();

        let config = SwarmConfig {
            listen_port: self.listen_port,
            bootstrap,
        };
        let (cmd_tx, mut notif_rx, local_peer_id) = spawn_swarm(self.keypair.clone(), config)
            .await
            .map_err(|e| BackendError::Handshake(e.to_string()))?;

        // Handshake is complete once any peer connection is established.
        // If the caller gives up first, dropping `cmd_tx` stops the swarm.
        let first_peer = loop {
            match notif_rx.recv().await {
                Some(SwarmNotification::PeerConnected { peer_id, .. }) => break peer_id,
                Some(other) => debug!(event = ?other, "Ignoring swarm event before first peer"),
                None => {
                    return Err(BackendError::Unreachable(
                        "swarm stopped before any peer connected".into(),
                    ))
                }
            }
        };
        info!(peer_id = %local_peer_id, first_peer = %first_peer, "P2P session established");

        let (out_tx, out_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let _ = out_tx
            .send(BackendNotification::PeerJoined {
                peer: first_peer.to_string(),
            })
            .await;

        *self.session.lock().map_err(|_| BackendError::Closed)? = Some(cmd_tx);

        tokio::spawn(async move {
            while let Some(notification) = notif_rx.recv().await {
                let forwarded = match notification {
                    SwarmNotification::MessageReceived { source, topic, data } => {
                        BackendNotification::Envelope {
                            topic,
                            source: source.map(|p| p.to_string()),
                            data,
                        }
                    }
                    SwarmNotification::PeerConnected { peer_id, .. } => {
                        BackendNotification::PeerJoined {
                            peer: peer_id.to_string(),
                        }
                    }
                    SwarmNotification::PeerDisconnected { peer_id, remaining } => {
                        let _ = out_tx
                            .send(BackendNotification::PeerLeft {
                                peer: peer_id.to_string(),
                            })
                            .await;
                        if remaining > 0 {
                            continue;
                        }
                        let _ = out_tx
                            .send(BackendNotification::ConnectionLost {
                                reason: "last peer disconnected".into(),
                            })
                            .await;
                        return;
                    }
                };
                if out_tx.send(forwarded).await.is_err() {
                    return;
                }
            }
            let _ = out_tx
                .send(BackendNotification::ConnectionLost {
                    reason: "swarm stopped".into(),
                })
                .await;
        });

        Ok(out_rx)
    }

    fn disconnect(&self) {
        let previous = match self.session.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(cmd_tx) = previous {
            if cmd_tx.try_send(SwarmCommand::Shutdown).is_err() {
                warn!("Swarm command queue full on disconnect, dropping sender instead");
            }
        }
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), BackendError> {
        let topic = topic.to_string();
        self.request(|reply| SwarmCommand::Publish { topic, data, reply })
            .await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BackendError> {
        let topic = topic.to_string();
        self.request(|reply| SwarmCommand::Subscribe { topic, reply })
            .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BackendError> {
        self.command_tx()?
            .send(SwarmCommand::Unsubscribe(topic.to_string()))
            .await
            .map_err(|_| BackendError::NotConnected)
    }
}
