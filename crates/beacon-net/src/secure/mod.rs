//! PQ-hybrid secure backend: Noise_XXpsk3 over TCP with an ML-KEM-768 PSK.

pub mod handshake;
pub mod hub;

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beacon_shared::protocol::SecureFrame;

use crate::backend::{BackendClient, BackendError, BackendNotification, NOTIFICATION_BUFFER};

pub use handshake::{initiate, respond, SecureChannel};
pub use hub::SecureHub;

struct SecureCommand {
    frame: SecureFrame,
    reply: oneshot::Sender<Result<(), BackendError>>,
}

#[derive(Clone)]
struct SecureSession {
    cmd_tx: mpsc::Sender<SecureCommand>,
    cancel: CancellationToken,
}

/// Client of a secure hub at `host:port`.
pub struct SecureClient {
    static_key: [u8; 32],
    session: Mutex<Option<SecureSession>>,
}

impl SecureClient {
    pub fn new(static_key: [u8; 32]) -> Self {
        Self {
            static_key,
            session: Mutex::new(None),
        }
    }

    async fn send_frame(&self, frame: SecureFrame) -> Result<(), BackendError> {
        let session = self
            .session
            .lock()
            .map_err(|_| BackendError::Closed)?
            .clone()
            .ok_or(BackendError::NotConnected)?;
        let (reply, reply_rx) = oneshot::channel();
        session
            .cmd_tx
            .send(SecureCommand { frame, reply })
            .await
            .map_err(|_| BackendError::NotConnected)?;
        reply_rx.await.map_err(|_| BackendError::NotConnected)?
    }
}

#[async_trait]
impl BackendClient for SecureClient {
    fn name(&self) -> &'static str {
        "pq-noise"
    }

    async fn connect(
        &self,
        endpoints: &[String],
    ) -> Result<mpsc::Receiver<BackendNotification>, BackendError> {
        if endpoints.is_empty() {
            return Err(BackendError::NoEndpoints);
        }
        if let Some(bad) = endpoints.iter().find(|e| e.contains("://") || !e.contains(':')) {
            return Err(BackendError::InvalidEndpoint(bad.clone()));
        }
        self.disconnect();

        let mut failures = Vec::new();
        for endpoint in endpoints {
            let stream = match TcpStream::connect(endpoint.as_str()).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Secure endpoint unreachable");
                    failures.push(format!("{endpoint}: {e}"));
                    continue;
                }
            };
            // A reachable endpoint that fails the handshake is not retried
            // on the next endpoint: the failure is about our keys, not routing.
            let chan = initiate(stream, &self.static_key).await?;
            info!(endpoint = %endpoint, remote = %chan.remote_static_hex(), "Secure session established");

            let (cmd_tx, cmd_rx) = mpsc::channel(256);
            let (notif_tx, notif_rx) = mpsc::channel(NOTIFICATION_BUFFER);
            let cancel = CancellationToken::new();
            *self.session.lock().map_err(|_| BackendError::Closed)? = Some(SecureSession {
                cmd_tx,
                cancel: cancel.clone(),
            });

            tokio::spawn(run_session(chan, cmd_rx, notif_tx, cancel));
            return Ok(notif_rx);
        }

        Err(BackendError::Unreachable(failures.join("; ")))
    }

    fn disconnect(&self) {
        let previous = match self.session.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(session) = previous {
            session.cancel.cancel();
        }
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), BackendError> {
        self.send_frame(SecureFrame::Publish {
            topic: topic.to_string(),
            data,
        })
        .await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BackendError> {
        self.send_frame(SecureFrame::Subscribe {
            topic: topic.to_string(),
        })
        .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BackendError> {
        self.send_frame(SecureFrame::Unsubscribe {
            topic: topic.to_string(),
        })
        .await
    }
}

async fn run_session(
    mut chan: SecureChannel<TcpStream>,
    mut cmd_rx: mpsc::Receiver<SecureCommand>,
    notif_tx: mpsc::Sender<BackendNotification>,
    cancel: CancellationToken,
) {
    let lost_reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,

            cmd = cmd_rx.recv() => {
                let Some(SecureCommand { frame, reply }) = cmd else { break None };
                let result = chan.send(&frame).await;
                let closed = result == Err(BackendError::Closed);
                let _ = reply.send(result);
                if closed {
                    break Some("write failed".to_string());
                }
            }

            incoming = chan.recv() => {
                match incoming {
                    Some(Ok(SecureFrame::Deliver { topic, source, data })) => {
                        let _ = notif_tx
                            .send(BackendNotification::Envelope { topic, source, data })
                            .await;
                    }
                    Some(Ok(other)) => debug!(frame = ?other, "Ignoring unexpected frame from hub"),
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("hub closed the connection".to_string()),
                }
            }
        }
    };

    if let Some(reason) = lost_reason {
        warn!(reason = %reason, "Secure session lost");
        let _ = notif_tx
            .send(BackendNotification::ConnectionLost { reason })
            .await;
    }
}
