//! NIP-01 relay client over WebSocket.
//!
//! Relays give at-most-once delivery: an `EVENT` is either acknowledged with
//! `OK`, rejected, or silently lost. A missing acknowledgement within the
//! bound counts as accepted, since waiting longer would not make delivery
//! any more certain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beacon_shared::error::CryptoError;
use beacon_shared::identity::{verify_signature_hex, NodeKeys};

use crate::backend::{BackendClient, BackendError, BackendNotification, NOTIFICATION_BUFFER};

/// Default bound on waiting for an `OK` after publishing.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A signed relay event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NostrEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl NostrEvent {
    /// Build and sign an event with the node key.
    pub fn sign(keys: &NodeKeys, kind: u16, tags: Vec<Vec<String>>, content: String) -> Self {
        let pubkey = keys.public_key_hex();
        let created_at = chrono::Utc::now().timestamp();
        let id = compute_id(&pubkey, created_at, kind, &tags, &content);
        let sig = hex::encode(keys.sign(id.as_bytes()).to_bytes());
        Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        }
    }

    /// Check that the id matches the content and the signature matches the id.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let expected = compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if expected != self.id {
            return Err(CryptoError::InvalidSignature);
        }
        verify_signature_hex(&self.pubkey, self.id.as_bytes(), &self.sig)
    }

    /// Value of the first tag named `name`.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }
}

/// BLAKE3 over the canonical `[0, pubkey, created_at, kind, tags, content]`.
fn compute_id(pubkey: &str, created_at: i64, kind: u16, tags: &[Vec<String>], content: &str) -> String {
    let canonical = json!([0, pubkey, created_at, kind, tags, content]).to_string();
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

type AckSender = oneshot::Sender<Result<(), String>>;

#[derive(Default)]
struct SessionShared {
    /// topic -> subscription id
    subs: Mutex<HashMap<String, String>>,
    /// event id -> waiter for `OK`
    pending: Mutex<HashMap<String, AckSender>>,
}

impl SessionShared {
    fn topic_for(&self, sub_id: &str) -> Option<String> {
        let subs = self.subs.lock().ok()?;
        subs.iter()
            .find(|(_, id)| id.as_str() == sub_id)
            .map(|(topic, _)| topic.clone())
    }

    fn complete(&self, event_id: &str, outcome: Result<(), String>) {
        let waiter = self.pending.lock().ok().and_then(|mut p| p.remove(event_id));
        if let Some(waiter) = waiter {
            let _ = waiter.send(outcome);
        }
    }
}

#[derive(Clone)]
struct RelaySession {
    out_tx: mpsc::UnboundedSender<String>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
}

pub struct RelayClient {
    ack_timeout: Duration,
    session: Mutex<Option<RelaySession>>,
}

impl RelayClient {
    pub fn new() -> Self {
        Self::with_ack_timeout(DEFAULT_ACK_TIMEOUT)
    }

    pub fn with_ack_timeout(ack_timeout: Duration) -> Self {
        Self {
            ack_timeout,
            session: Mutex::new(None),
        }
    }

    fn current(&self) -> Result<RelaySession, BackendError> {
        self.session
            .lock()
            .map_err(|_| BackendError::Closed)?
            .clone()
            .ok_or(BackendError::NotConnected)
    }
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendClient for RelayClient {
    fn name(&self) -> &'static str {
        "nostr-relay"
    }

    async fn connect(
        &self,
        endpoints: &[String],
    ) -> Result<mpsc::Receiver<BackendNotification>, BackendError> {
        if endpoints.is_empty() {
            return Err(BackendError::NoEndpoints);
        }
        for endpoint in endpoints {
            if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
                return Err(BackendError::InvalidEndpoint(endpoint.clone()));
            }
        }
        self.disconnect();

        let mut failures = Vec::new();
        for endpoint in endpoints {
            let ws = match connect_async(endpoint.as_str()).await {
                Ok((ws, _response)) => ws,
                Err(e) => {
                    warn!(relay = %endpoint, error = %e, "Relay connection failed");
                    failures.push(format!("{endpoint}: {e}"));
                    continue;
                }
            };
            info!(relay = %endpoint, "Relay session established");

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (notif_tx, notif_rx) = mpsc::channel(NOTIFICATION_BUFFER);
            let session = RelaySession {
                out_tx,
                shared: Arc::new(SessionShared::default()),
                cancel: CancellationToken::new(),
            };
            *self.session.lock().map_err(|_| BackendError::Closed)? = Some(session.clone());

            tokio::spawn(run_session(
                endpoint.clone(),
                ws,
                out_rx,
                notif_tx,
                session.shared,
                session.cancel,
            ));
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

    async fn publish(&self, _topic: &str, data: Vec<u8>) -> Result<(), BackendError> {
        let event: NostrEvent = serde_json::from_slice(&data)
            .map_err(|e| BackendError::Rejected(format!("malformed event: {e}")))?;
        let session = self.current()?;

        let (ack_tx, ack_rx) = oneshot::channel();
        session
            .shared
            .pending
            .lock()
            .map_err(|_| BackendError::Closed)?
            .insert(event.id.clone(), ack_tx);

        session
            .out_tx
            .send(json!(["EVENT", event]).to_string())
            .map_err(|_| BackendError::NotConnected)?;

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(BackendError::Rejected(reason)),
            Ok(Err(_)) => Err(BackendError::NotConnected),
            Err(_) => {
                if let Ok(mut pending) = session.shared.pending.lock() {
                    pending.remove(&event.id);
                }
                debug!(event_id = %event.id, "No OK from relay within bound, treating as accepted");
                Ok(())
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BackendError> {
        let session = self.current()?;
        let sub_id = {
            let mut subs = session.shared.subs.lock().map_err(|_| BackendError::Closed)?;
            if subs.contains_key(topic) {
                return Ok(());
            }
            let sub_id = hex::encode(rand::random::<[u8; 8]>());
            subs.insert(topic.to_string(), sub_id.clone());
            sub_id
        };

        let filter = json!({ "#t": [topic], "since": chrono::Utc::now().timestamp() });
        session
            .out_tx
            .send(json!(["REQ", sub_id, filter]).to_string())
            .map_err(|_| BackendError::NotConnected)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BackendError> {
        let session = self.current()?;
        let removed = session
            .shared
            .subs
            .lock()
            .map_err(|_| BackendError::Closed)?
            .remove(topic);
        match removed {
            Some(sub_id) => session
                .out_tx
                .send(json!(["CLOSE", sub_id]).to_string())
                .map_err(|_| BackendError::NotConnected),
            None => Ok(()),
        }
    }
}

async fn run_session<S>(
    relay: String,
    mut ws: S,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    notif_tx: mpsc::Sender<BackendNotification>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
) where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let lost_reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close().await;
                break None;
            }

            frame = out_rx.recv() => {
                let Some(text) = frame else { break None };
                if let Err(e) = ws.send(Message::Text(text.into())).await {
                    break Some(format!("send failed: {e}"));
                }
            }

            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_relay_message(&relay, text.as_str(), &shared, &notif_tx).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = ws.send(Message::Pong(payload)).await {
                            break Some(format!("pong failed: {e}"));
                        }
                    }
                    Some(Ok(Message::Close(_))) => break Some("closed by relay".into()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("stream ended".into()),
                }
            }
        }
    };

    // Wake every publisher still waiting for an OK
    if let Ok(mut pending) = shared.pending.lock() {
        pending.clear();
    }

    if let Some(reason) = lost_reason {
        warn!(relay = %relay, reason = %reason, "Relay session lost");
        let _ = notif_tx
            .send(BackendNotification::ConnectionLost { reason })
            .await;
    } else {
        debug!(relay = %relay, "Relay session closed");
    }
}

async fn handle_relay_message(
    relay: &str,
    text: &str,
    shared: &SessionShared,
    notif_tx: &mpsc::Sender<BackendNotification>,
) {
    let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(text) else {
        warn!(relay = %relay, "Ignoring non-array relay message");
        return;
    };

    match frame.first().and_then(Value::as_str) {
        Some("EVENT") => {
            let sub_id = frame.get(1).and_then(Value::as_str).unwrap_or_default();
            let Some(topic) = shared.topic_for(sub_id) else {
                debug!(sub_id, "Event for unknown subscription");
                return;
            };
            let event: NostrEvent = match frame.get(2).cloned().map(serde_json::from_value) {
                Some(Ok(event)) => event,
                _ => {
                    warn!(relay = %relay, "Malformed EVENT from relay");
                    return;
                }
            };
            let source = Some(event.pubkey.clone());
            match serde_json::to_vec(&event) {
                Ok(data) => {
                    let _ = notif_tx
                        .send(BackendNotification::Envelope { topic, source, data })
                        .await;
                }
                Err(e) => warn!(error = %e, "Failed to re-encode relay event"),
            }
        }
        Some("OK") => {
            let event_id = frame.get(1).and_then(Value::as_str).unwrap_or_default();
            let accepted = frame.get(2).and_then(Value::as_bool).unwrap_or(false);
            let reason = frame.get(3).and_then(Value::as_str).unwrap_or_default();
            // A duplicate is already stored on the relay
            let outcome = if accepted || reason.starts_with("duplicate:") {
                Ok(())
            } else {
                Err(reason.to_string())
            };
            shared.complete(event_id, outcome);
        }
        Some("EOSE") => debug!(relay = %relay, "End of stored events"),
        Some("NOTICE") => {
            let notice = frame.get(1).and_then(Value::as_str).unwrap_or_default();
            warn!(relay = %relay, notice, "Relay notice");
        }
        Some("CLOSED") => {
            let reason = frame.get(2).and_then(Value::as_str).unwrap_or_default();
            warn!(relay = %relay, reason, "Relay closed subscription");
        }
        other => debug!(relay = %relay, kind = ?other, "Unhandled relay message"),
    }
}
