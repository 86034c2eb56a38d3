//! Protocol adapters: one generic core, parameterised by a per-backend
//! [`EnvelopeCodec`], turning a [`BackendClient`] into a [`ChatProvider`].
//!
//! Each live backend session gets one worker task that pumps notifications
//! in the order the backend produced them. Sessions are numbered; anything a
//! stale worker reports after a disconnect or reconnect is ignored.

pub mod codec;
pub mod p2p;
pub mod relay;
pub mod secure;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beacon_net::{BackendClient, BackendError, BackendNotification};
use beacon_shared::crypto::{self, derive_channel_key};
use beacon_shared::protocol::{
    ChatBody, ChatEnvelope, PresenceEnvelope, ReceiptEnvelope, WireEnvelope,
};
use beacon_shared::{
    Attachment, Capabilities, Channel, ChannelDescriptor, ChannelError, ChannelId,
    ConnectionError, ConnectionState, Identity, InboundEvent, Message, MessageId, MessageStatus,
    MonotonicClock, PresenceEvent, PresenceStatus, ProviderKind, Receipt, ReceiptKind,
    SecurityFlags, SendError,
};

use crate::events::SubscriptionId;
use crate::provider::{ChatProvider, EventHandler};

pub use codec::EnvelopeCodec;
pub use p2p::P2pCodec;
pub use relay::RelayCodec;
pub use secure::SecureCodec;

pub type P2pAdapter = Adapter<P2pCodec>;
pub type RelayAdapter = Adapter<RelayCodec>;
pub type SecureAdapter = Adapter<SecureCodec>;

/// Settings shared by every adapter.
#[derive(Clone)]
pub struct AdapterConfig {
    pub connect_timeout: Duration,
    pub default_max_message_size: usize,
    pub network_secret: [u8; 32],
}

struct Session {
    epoch: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    identity: Option<Identity>,
    /// Bumped by every new session and every disconnect.
    epoch: u64,
    session: Option<Session>,
    /// Channels subscribed on the current session.
    channels: HashMap<ChannelId, Channel>,
    handlers: HashMap<ChannelId, Vec<(SubscriptionId, EventHandler)>>,
    completed_attempts: u64,
    last_outcome: Option<Result<ConnectionState, ConnectionError>>,
}

struct Shared<C> {
    codec: C,
    backend: Arc<dyn BackendClient>,
    config: AdapterConfig,
    clock: MonotonicClock,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    connect_gate: tokio::sync::Mutex<()>,
}

/// A backend client wrapped in the uniform chat contract.
pub struct Adapter<C: EnvelopeCodec> {
    shared: Arc<Shared<C>>,
}

impl<C: EnvelopeCodec> Adapter<C> {
    pub fn new(codec: C, backend: Arc<dyn BackendClient>, config: AdapterConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                codec,
                backend,
                config,
                clock: MonotonicClock::new(),
                inner: Mutex::new(Inner::default()),
                state_tx,
                connect_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Channels subscribed on the current session.
    pub fn joined_channels(&self) -> Vec<ChannelId> {
        self.shared.inner().channels.keys().cloned().collect()
    }

    fn require_session(&self) -> Option<(Identity, u64)> {
        let inner = self.shared.inner();
        let session = inner.session.as_ref()?;
        Some((inner.identity.clone()?, session.epoch))
    }
}

impl<C: EnvelopeCodec> Shared<C> {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(provider = %C::KIND, state = %next, "Adapter state changed");
        }
    }

    fn handlers_for(&self, channel_id: &ChannelId) -> Vec<EventHandler> {
        self.inner()
            .handlers
            .get(channel_id)
            .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    fn dispatch(&self, channel_id: &ChannelId, events: &[InboundEvent]) {
        let handlers = self.handlers_for(channel_id);
        for event in events {
            for handler in &handlers {
                handler(event);
            }
        }
    }

    async fn publish_envelope(&self, envelope: &WireEnvelope) -> Result<(), BackendError> {
        let bytes = self
            .codec
            .seal(envelope)
            .map_err(|e| BackendError::Rejected(e.to_string()))?;
        self.backend
            .publish(&envelope.channel_id().to_topic(), bytes)
            .await
    }

    async fn publish_presence(&self, identity: &Identity, channel_id: &ChannelId, status: PresenceStatus) {
        let envelope = WireEnvelope::Presence(PresenceEnvelope {
            channel_id: channel_id.clone(),
            member_id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            status,
            at: Utc::now(),
        });
        if let Err(e) = self.publish_envelope(&envelope).await {
            debug!(provider = %C::KIND, channel = %channel_id, error = %e, "Presence not published");
        }
    }

    fn session_lost(&self, epoch: u64, reason: &str) {
        {
            let mut inner = self.inner();
            match &inner.session {
                Some(session) if session.epoch == epoch => {}
                _ => return,
            }
            inner.session = None;
            inner.channels.clear();
        }
        warn!(provider = %C::KIND, reason = %reason, "Backend session lost");
        self.set_state(ConnectionState::Error);
    }

    fn handle_envelope(self: &Arc<Self>, epoch: u64, topic: &str, data: &[u8]) {
        let envelope = match self.codec.open(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(provider = %C::KIND, topic = %topic, error = %e, "Dropping undecodable envelope");
                return;
            }
        };
        let channel_id = envelope.channel_id().clone();
        if ChannelId::from_topic(topic).as_ref() != Some(&channel_id) {
            warn!(provider = %C::KIND, topic = %topic, channel = %channel_id, "Envelope channel does not match topic");
            return;
        }

        let (identity, channel) = {
            let inner = self.inner();
            match &inner.session {
                Some(session) if session.epoch == epoch => {}
                _ => return,
            }
            let Some(identity) = inner.identity.clone() else {
                return;
            };
            let Some(channel) = inner.channels.get(&channel_id).cloned() else {
                debug!(provider = %C::KIND, channel = %channel_id, "Envelope for a channel we have not joined");
                return;
            };
            (identity, channel)
        };
        if envelope.origin() == identity.id {
            return;
        }

        let events = match envelope {
            WireEnvelope::Chat(chat) => {
                if !self.codec.accept_inbound(&chat) {
                    debug!(provider = %C::KIND, message_id = %chat.message_id, "Duplicate message dropped");
                    return;
                }
                let message_id = chat.message_id;
                let Some(message) = self.open_chat(&channel, chat) else {
                    return;
                };
                if self.codec.capabilities().delivery_receipts {
                    let shared = self.clone();
                    let receipt = WireEnvelope::Receipt(ReceiptEnvelope {
                        channel_id: channel_id.clone(),
                        message_ids: vec![message_id],
                        kind: ReceiptKind::Delivered,
                        from: identity.id.clone(),
                    });
                    tokio::spawn(async move {
                        if let Err(e) = shared.publish_envelope(&receipt).await {
                            debug!(error = %e, "Delivery receipt not published");
                        }
                    });
                }
                vec![InboundEvent::Message(message)]
            }
            WireEnvelope::Receipt(receipt) => receipt
                .message_ids
                .into_iter()
                .map(|message_id| {
                    InboundEvent::Receipt(Receipt {
                        channel_id: channel_id.clone(),
                        message_id,
                        kind: receipt.kind,
                        from: receipt.from.clone(),
                    })
                })
                .collect(),
            WireEnvelope::Presence(p) => vec![InboundEvent::Presence(PresenceEvent {
                channel_id: p.channel_id,
                member_id: p.member_id,
                display_name: p.display_name,
                status: p.status,
                at: p.at,
            })],
        };

        self.dispatch(&channel_id, &events);
    }

    fn open_chat(&self, channel: &Channel, chat: ChatEnvelope) -> Option<Message> {
        let plaintext = if chat.encrypted {
            let key = derive_channel_key(&self.config.network_secret, channel.id());
            match crypto::decrypt(&key, &chat.body) {
                Ok(p) => p,
                Err(e) => {
                    warn!(provider = %C::KIND, channel = %channel.id(), error = %e, "Cannot open sealed message");
                    return None;
                }
            }
        } else {
            chat.body
        };
        let body = match ChatBody::from_bytes(&plaintext) {
            Ok(body) => body,
            Err(e) => {
                warn!(provider = %C::KIND, error = %e, "Malformed chat body");
                return None;
            }
        };

        let sender = Identity::new(chat.sender_id, chat.sender_display_name);
        let mut message = Message::draft(
            chat.message_id,
            chat.channel_id,
            &sender,
            body.content,
            body.attachments,
            chat.timestamp,
        )
        .received();
        message.security = SecurityFlags {
            encrypted: chat.encrypted,
            pqc_encrypted: self.codec.pqc_transport(),
        };
        message.causal_stamp = chat.causal_stamp;
        Some(message)
    }
}

async fn run_worker<C: EnvelopeCodec>(
    shared: Arc<Shared<C>>,
    mut notifications: mpsc::Receiver<BackendNotification>,
    epoch: u64,
    cancel: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => return,
            n = notifications.recv() => n,
        };
        match notification {
            Some(BackendNotification::Envelope { topic, source, data }) => {
                debug!(provider = %C::KIND, topic = %topic, source = ?source, len = data.len(), "Envelope received");
                shared.handle_envelope(epoch, &topic, &data);
            }
            Some(BackendNotification::PeerJoined { peer }) => {
                debug!(provider = %C::KIND, peer = %peer, "Peer joined");
            }
            Some(BackendNotification::PeerLeft { peer }) => {
                debug!(provider = %C::KIND, peer = %peer, "Peer left");
            }
            Some(BackendNotification::ConnectionLost { reason }) => {
                shared.session_lost(epoch, &reason);
                return;
            }
            None => {
                shared.session_lost(epoch, "backend stream closed");
                return;
            }
        }
    }
}

#[async_trait]
impl<C: EnvelopeCodec> ChatProvider for Adapter<C> {
    fn kind(&self) -> ProviderKind {
        C::KIND
    }

    fn capabilities(&self) -> Capabilities {
        self.shared.codec.capabilities()
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    async fn connect(
        &self,
        identity: &Identity,
        endpoints: &[String],
    ) -> Result<ConnectionState, ConnectionError> {
        identity.validate()?;

        let seen = self.shared.inner().completed_attempts;
        let _gate = self.shared.connect_gate.lock().await;
        let epoch = {
            let inner = self.shared.inner();
            // Another caller's handshake finished while we waited
            if inner.completed_attempts != seen {
                if let Some(outcome) = inner.last_outcome.clone() {
                    return outcome;
                }
            }
            if inner.session.is_some() {
                return Ok(ConnectionState::Connected);
            }
            inner.epoch
        };

        let shared = &self.shared;
        shared.set_state(ConnectionState::Connecting);
        info!(provider = %C::KIND, backend = shared.backend.name(), endpoints = endpoints.len(), "Connecting");

        let timeout = shared.config.connect_timeout;
        let timeout_ms = timeout.as_millis() as u64;
        let outcome = match tokio::time::timeout(timeout, shared.backend.connect(endpoints)).await {
            Ok(Ok(notifications)) => {
                let mut inner = shared.inner();
                if inner.epoch != epoch {
                    drop(inner);
                    shared.backend.disconnect();
                    Err(ConnectionError::Aborted)
                } else {
                    inner.epoch += 1;
                    let session_epoch = inner.epoch;
                    let cancel = CancellationToken::new();
                    inner.identity = Some(identity.clone());
                    inner.channels.clear();
                    inner.session = Some(Session {
                        epoch: session_epoch,
                        cancel: cancel.clone(),
                    });
                    drop(inner);

                    shared.set_state(ConnectionState::Connected);
                    tokio::spawn(run_worker(shared.clone(), notifications, session_epoch, cancel));
                    info!(provider = %C::KIND, "Connected");
                    Ok(ConnectionState::Connected)
                }
            }
            Ok(Err(e)) => Err(codec::connect_error(e, timeout_ms)),
            Err(_) => {
                shared.backend.disconnect();
                Err(ConnectionError::Timeout(timeout_ms))
            }
        };

        let mut inner = shared.inner();
        if let Err(e) = &outcome {
            // An explicit disconnect already moved us to Disconnected
            if inner.epoch == epoch {
                shared.set_state(ConnectionState::Error);
            }
            warn!(provider = %C::KIND, error = %e, "Connect failed");
        }
        inner.completed_attempts += 1;
        inner.last_outcome = Some(outcome.clone());
        outcome
    }

    fn disconnect(&self) {
        let session = {
            let mut inner = self.shared.inner();
            inner.epoch += 1;
            inner.channels.clear();
            inner.session.take()
        };
        if let Some(session) = session {
            session.cancel.cancel();
        }
        self.shared.backend.disconnect();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    async fn join_channel(&self, id: &ChannelId) -> Result<Channel, ChannelError> {
        if let Some(channel) = self.shared.inner().channels.get(id).cloned() {
            return Ok(channel);
        }
        let channel = Channel::joined(id.clone(), self.shared.config.default_max_message_size);
        self.rejoin(&channel).await?;
        Ok(channel)
    }

    async fn create_channel(&self, descriptor: ChannelDescriptor) -> Result<Channel, ChannelError> {
        descriptor.validate()?;
        if self.require_session().is_none() {
            return Err(ChannelError::NotConnected);
        }
        if self.shared.inner().channels.contains_key(&descriptor.id) {
            return Err(ChannelError::Duplicate(descriptor.id));
        }
        let channel = Channel::from_descriptor(descriptor, self.shared.config.default_max_message_size);
        self.rejoin(&channel).await?;
        Ok(channel)
    }

    async fn rejoin(&self, channel: &Channel) -> Result<(), ChannelError> {
        let max = self.capabilities().max_encryption;
        if channel.encryption_level() > max {
            return Err(ChannelError::UnsupportedEncryption {
                requested: channel.encryption_level(),
                max,
            });
        }
        let (identity, epoch) = self.require_session().ok_or(ChannelError::NotConnected)?;
        if self.shared.inner().channels.contains_key(channel.id()) {
            return Ok(());
        }

        self.shared
            .backend
            .subscribe(&channel.id().to_topic())
            .await
            .map_err(codec::channel_error)?;

        {
            let mut inner = self.shared.inner();
            match &inner.session {
                Some(session) if session.epoch == epoch => {}
                _ => return Err(ChannelError::NotConnected),
            }
            inner.channels.insert(channel.id().clone(), channel.clone());
        }
        debug!(provider = %C::KIND, channel = %channel.id(), "Channel joined");

        self.shared
            .publish_presence(&identity, channel.id(), PresenceStatus::Online)
            .await;
        Ok(())
    }

    async fn leave_channel(&self, id: &ChannelId) -> Result<(), ChannelError> {
        let identity = {
            let mut inner = self.shared.inner();
            if inner.channels.remove(id).is_none() {
                return Err(ChannelError::Unknown(id.clone()));
            }
            inner.identity.clone()
        };
        self.shared.codec.forget_channel(id);
        if let Some(identity) = identity {
            self.shared
                .publish_presence(&identity, id, PresenceStatus::Offline)
                .await;
        }
        if let Err(e) = self.shared.backend.unsubscribe(&id.to_topic()).await {
            debug!(provider = %C::KIND, channel = %id, error = %e, "Unsubscribe failed");
        }
        Ok(())
    }

    fn prepare(
        &self,
        sender: &Identity,
        channel: &Channel,
        content: String,
        attachments: Vec<Attachment>,
        timestamp: DateTime<Utc>,
    ) -> Result<Message, SendError> {
        if content.len() > channel.max_message_size {
            return Err(SendError::TooLarge {
                size: content.len(),
                max: channel.max_message_size,
            });
        }
        Ok(Message::draft(
            MessageId::new(),
            channel.id().clone(),
            sender,
            content,
            attachments,
            timestamp,
        ))
    }

    async fn transmit(&self, mut message: Message) -> Result<Message, SendError> {
        let shared = &self.shared;
        let (identity, channel) = {
            let inner = shared.inner();
            if inner.session.is_none() {
                return Err(SendError::NotConnected);
            }
            let channel = inner
                .channels
                .get(&message.channel_id)
                .cloned()
                .ok_or_else(|| SendError::UnknownChannel(message.channel_id.clone()))?;
            (inner.identity.clone().ok_or(SendError::NotConnected)?, channel)
        };
        if message.payload_size() > channel.max_message_size {
            return Err(SendError::TooLarge {
                size: message.payload_size(),
                max: channel.max_message_size,
            });
        }

        let body = ChatBody {
            content: message.content.clone(),
            attachments: message.attachments.clone(),
        }
        .to_bytes()
        .map_err(|e| SendError::Encoding(e.to_string()))?;
        let encrypted = channel.is_encrypted();
        let body = if encrypted {
            let key = derive_channel_key(&shared.config.network_secret, channel.id());
            crypto::encrypt(&key, &body).map_err(|e| SendError::Encoding(e.to_string()))?
        } else {
            body
        };

        let mut chat = ChatEnvelope {
            message_id: message.id,
            channel_id: message.channel_id.clone(),
            sender_id: message.sender_id.clone(),
            sender_display_name: message.sender_display_name.clone(),
            timestamp: message.timestamp,
            body,
            encrypted,
            causal_stamp: None,
        };
        shared.codec.stamp_outbound(&mut chat);
        let causal_stamp = chat.causal_stamp;

        shared
            .publish_envelope(&WireEnvelope::Chat(chat))
            .await
            .map_err(codec::send_error)?;

        message.security = SecurityFlags {
            encrypted,
            pqc_encrypted: shared.codec.pqc_transport(),
        };
        message.causal_stamp = causal_stamp;
        message.advance(MessageStatus::Sent);
        debug!(provider = %C::KIND, channel = %message.channel_id, message_id = %message.id, "Message sent");

        if self.capabilities().implicit_delivery {
            shared.dispatch(
                &message.channel_id,
                &[InboundEvent::Receipt(Receipt {
                    channel_id: message.channel_id.clone(),
                    message_id: message.id,
                    kind: ReceiptKind::Delivered,
                    from: identity.id,
                })],
            );
        }
        Ok(message)
    }

    async fn send(
        &self,
        channel_id: &ChannelId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<Message, SendError> {
        let (identity, channel) = {
            let inner = self.shared.inner();
            if inner.session.is_none() {
                return Err(SendError::NotConnected);
            }
            let identity = inner.identity.clone().ok_or(SendError::NotConnected)?;
            let channel = inner
                .channels
                .get(channel_id)
                .cloned()
                .ok_or_else(|| SendError::UnknownChannel(channel_id.clone()))?;
            (identity, channel)
        };
        let message = self.prepare(
            &identity,
            &channel,
            content,
            attachments,
            self.shared.clock.next(),
        )?;
        self.transmit(message).await
    }

    fn subscribe(&self, channel_id: &ChannelId, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.shared
            .inner()
            .handlers
            .entry(channel_id.clone())
            .or_default()
            .push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.shared.inner();
        let mut removed = false;
        inner.handlers.retain(|_, hs| {
            let before = hs.len();
            hs.retain(|(sub, _)| *sub != id);
            removed |= hs.len() != before;
            !hs.is_empty()
        });
        removed
    }

    async fn mark_read(&self, channel_id: &ChannelId, ids: &[MessageId]) -> Result<(), SendError> {
        if !self.capabilities().read_receipts || ids.is_empty() {
            return Ok(());
        }
        let (identity, _) = self.require_session().ok_or(SendError::NotConnected)?;
        if !self.shared.inner().channels.contains_key(channel_id) {
            return Err(SendError::UnknownChannel(channel_id.clone()));
        }
        let receipt = WireEnvelope::Receipt(ReceiptEnvelope {
            channel_id: channel_id.clone(),
            message_ids: ids.to_vec(),
            kind: ReceiptKind::Read,
            from: identity.id,
        });
        self.shared
            .publish_envelope(&receipt)
            .await
            .map_err(codec::send_error)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use beacon_net::{MemoryBackend, MemoryHub};
    use beacon_shared::constants::DEV_NETWORK_SECRET;
    use beacon_shared::ChannelKind;

    use super::*;

    pub(crate) fn config() -> AdapterConfig {
        AdapterConfig {
            connect_timeout: Duration::from_secs(2),
            default_max_message_size: 1024,
            network_secret: DEV_NETWORK_SECRET,
        }
    }

    pub(crate) fn collector() -> (EventHandler, Arc<StdMutex<Vec<InboundEvent>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: EventHandler = Arc::new(move |e: &InboundEvent| {
            sink.lock().unwrap().push(e.clone());
        });
        (handler, seen)
    }

    pub(crate) async fn wait_for<T>(
        seen: &Arc<StdMutex<Vec<T>>>,
        pred: impl Fn(&[T]) -> bool,
    ) -> bool {
        for _ in 0..200 {
            if pred(&seen.lock().unwrap()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn p2p(hub: &MemoryHub, peer: &str) -> (P2pAdapter, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new(hub, peer));
        (Adapter::new(P2pCodec::new(), backend.clone(), config()), backend)
    }

    fn ops() -> ChannelDescriptor {
        ChannelDescriptor::named("ops", ChannelKind::Team, Vec::<String>::new()).unwrap()
    }

    #[tokio::test]
    async fn test_send_reaches_peer_sealed() {
        let hub = MemoryHub::new();
        let (alice, alice_backend) = p2p(&hub, "alice");
        let (bob, _) = p2p(&hub, "bob");
        alice.connect(&Identity::new("alice", "Alice"), &[]).await.unwrap();
        bob.connect(&Identity::new("bob", "Bob"), &[]).await.unwrap();

        let channel = alice.create_channel(ops()).await.unwrap();
        bob.join_channel(channel.id()).await.unwrap();
        let (handler, seen) = collector();
        bob.subscribe(channel.id(), handler);

        let sent = alice.send(channel.id(), "hello".into(), vec![]).await.unwrap();
        assert_eq!(sent.status(), MessageStatus::Sent);
        assert!(sent.security.encrypted);
        assert!(!sent.security.pqc_encrypted);
        assert!(sent.causal_stamp.is_some());

        assert!(wait_for(&seen, |evs| evs.iter().any(|e| matches!(e, InboundEvent::Message(_)))).await);
        let received = seen
            .lock()
            .unwrap()
            .iter()
            .find_map(|e| match e {
                InboundEvent::Message(m) => Some(m.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(received.id, sent.id);
        assert_eq!(received.content, "hello");
        assert_eq!(received.status(), MessageStatus::Sent);
        assert!(received.security.encrypted);

        // Content never crosses the hub in clear text
        let (_, wire) = alice_backend.published().last().cloned().unwrap();
        assert!(!wire.windows(5).any(|w| w == b"hello"));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_while_connecting() {
        let hub = MemoryHub::new();
        let (alice, backend) = p2p(&hub, "alice");
        backend.set_connect_delay(Duration::from_millis(50));
        let me = Identity::new("alice", "Alice");

        let (a, b) = tokio::join!(alice.connect(&me, &[]), alice.connect(&me, &[]));
        assert_eq!(a, Ok(ConnectionState::Connected));
        assert_eq!(b, Ok(ConnectionState::Connected));
        assert_eq!(backend.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_shared_by_waiting_caller() {
        let hub = MemoryHub::new();
        let (alice, backend) = p2p(&hub, "alice");
        backend.set_unreachable(true);
        backend.set_connect_delay(Duration::from_millis(20));
        let me = Identity::new("alice", "Alice");

        let (a, b) = tokio::join!(alice.connect(&me, &[]), alice.connect(&me, &[]));
        assert!(matches!(a, Err(ConnectionError::Unreachable(_))));
        assert_eq!(a, b);
        assert_eq!(backend.connect_attempts(), 1);
        assert_eq!(alice.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_malformed_identity_and_disconnect() {
        let hub = MemoryHub::new();
        let (alice, backend) = p2p(&hub, "alice");
        assert!(matches!(
            alice.connect(&Identity::new("has space", "A"), &[]).await,
            Err(ConnectionError::MalformedIdentity(_))
        ));
        assert_eq!(backend.connect_attempts(), 0);

        alice.connect(&Identity::new("alice", "Alice"), &[]).await.unwrap();
        alice.disconnect();
        assert_eq!(alice.state(), ConnectionState::Disconnected);
        assert!(!backend.is_connected());
        assert_eq!(
            alice.join_channel(&ChannelId::new("team:ops").unwrap()).await,
            Err(ChannelError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_aborts() {
        let hub = MemoryHub::new();
        let (alice, backend) = p2p(&hub, "alice");
        let alice = Arc::new(alice);
        backend.set_connect_delay(Duration::from_millis(50));

        let connecting = alice.clone();
        let handle = tokio::spawn(async move {
            connecting.connect(&Identity::new("alice", "Alice"), &[]).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        alice.disconnect();

        assert_eq!(handle.await.unwrap(), Err(ConnectionError::Aborted));
        assert_eq!(alice.state(), ConnectionState::Disconnected);
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_link_loss_reports_error() {
        let hub = MemoryHub::new();
        let (alice, backend) = p2p(&hub, "alice");
        let mut state = alice.watch_state();
        alice.connect(&Identity::new("alice", "Alice"), &[]).await.unwrap();

        backend.drop_link();
        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| *s == ConnectionState::Error))
            .await
            .unwrap()
            .unwrap();
        assert!(alice.joined_channels().is_empty());
    }

    #[tokio::test]
    async fn test_send_validation() {
        let hub = MemoryHub::new();
        let (alice, backend) = p2p(&hub, "alice");
        alice.connect(&Identity::new("alice", "Alice"), &[]).await.unwrap();
        let channel = alice.create_channel(ops()).await.unwrap();

        assert!(matches!(
            alice.send(channel.id(), "x".repeat(2000), vec![]).await,
            Err(SendError::TooLarge { size: 2000, max: 1024 })
        ));
        let unknown = ChannelId::new("team:nowhere").unwrap();
        assert_eq!(
            alice.send(&unknown, "hi".into(), vec![]).await,
            Err(SendError::UnknownChannel(unknown))
        );
        assert_eq!(
            alice.create_channel(ops()).await,
            Err(ChannelError::Duplicate(channel.id().clone()))
        );

        backend.fail_publishes(Some(BackendError::Rejected("channel full".into())));
        assert_eq!(
            alice.send(channel.id(), "hi".into(), vec![]).await,
            Err(SendError::Rejected("channel full".into()))
        );
        backend.drop_link();
        assert_eq!(
            alice.send(channel.id(), "hi".into(), vec![]).await,
            Err(SendError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_unsupported_encryption_rejected() {
        let hub = MemoryHub::new();
        let (alice, _) = p2p(&hub, "alice");
        alice.connect(&Identity::new("alice", "Alice"), &[]).await.unwrap();

        let pq = ops().with_encryption(beacon_shared::EncryptionLevel::PostQuantum);
        assert!(matches!(
            alice.create_channel(pq).await,
            Err(ChannelError::UnsupportedEncryption { .. })
        ));
    }

    #[tokio::test]
    async fn test_presence_and_self_echo() {
        let hub = MemoryHub::new();
        let (alice, _) = p2p(&hub, "alice");
        let (bob, _) = p2p(&hub, "bob");
        alice.connect(&Identity::new("alice", "Alice"), &[]).await.unwrap();
        bob.connect(&Identity::new("bob", "Bob"), &[]).await.unwrap();
        let channel = alice.create_channel(ops()).await.unwrap();
        let (handler, seen) = collector();
        alice.subscribe(channel.id(), handler);

        bob.join_channel(channel.id()).await.unwrap();
        assert!(wait_for(&seen, |evs| evs.iter().any(|e| matches!(
            e,
            InboundEvent::Presence(p) if p.member_id == "bob" && p.status == PresenceStatus::Online
        )))
        .await);

        // A replayed envelope carrying our own identity is dropped
        let before = seen.lock().unwrap().len();
        let echo = WireEnvelope::Presence(PresenceEnvelope {
            channel_id: channel.id().clone(),
            member_id: "alice".into(),
            display_name: "Alice".into(),
            status: PresenceStatus::Online,
            at: Utc::now(),
        });
        hub.inject(&channel.id().to_topic(), "mallory", echo.to_bytes().unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), before);
    }
}
