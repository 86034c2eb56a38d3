//! The uniform chat contract every protocol adapter implements, and the
//! tagged `Provider` the router holds.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use beacon_shared::{
    Attachment, Capabilities, Channel, ChannelDescriptor, ChannelError, ChannelId, ConnectionError,
    ConnectionState, Identity, InboundEvent, Message, MessageId, ProviderKind, SendError,
};

use crate::adapters::{P2pAdapter, RelayAdapter, SecureAdapter};
use crate::events::SubscriptionId;

/// Receives normalized inbound events for one channel.
pub type EventHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// Last known state, without a network round-trip.
    fn state(&self) -> ConnectionState;

    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Idempotent: while a handshake is in progress, later callers wait for
    /// its outcome instead of starting another one.
    async fn connect(
        &self,
        identity: &Identity,
        endpoints: &[String],
    ) -> Result<ConnectionState, ConnectionError>;

    /// Moves to `Disconnected` before returning; socket teardown may still
    /// be in flight.
    fn disconnect(&self);

    async fn join_channel(&self, id: &ChannelId) -> Result<Channel, ChannelError>;

    async fn create_channel(&self, descriptor: ChannelDescriptor) -> Result<Channel, ChannelError>;

    /// Re-subscribe a channel already known to the caller on the current
    /// backend session.
    async fn rejoin(&self, channel: &Channel) -> Result<(), ChannelError>;

    async fn leave_channel(&self, id: &ChannelId) -> Result<(), ChannelError>;

    /// Validate a draft against `channel` and assign its id.
    fn prepare(
        &self,
        sender: &Identity,
        channel: &Channel,
        content: String,
        attachments: Vec<Attachment>,
        timestamp: DateTime<Utc>,
    ) -> Result<Message, SendError>;

    /// Publish a prepared message. Returns it as `sent`.
    async fn transmit(&self, message: Message) -> Result<Message, SendError>;

    /// `prepare` then `transmit` with the adapter's own identity and clock.
    async fn send(
        &self,
        channel_id: &ChannelId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<Message, SendError>;

    fn subscribe(&self, channel_id: &ChannelId, handler: EventHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// No-op on backends without read receipts.
    async fn mark_read(&self, channel_id: &ChannelId, ids: &[MessageId]) -> Result<(), SendError>;
}

/// One adapter per backend family.
pub enum Provider {
    P2p(P2pAdapter),
    Relay(RelayAdapter),
    Secure(SecureAdapter),
}

macro_rules! dispatch {
    ($self:ident, $a:ident => $body:expr) => {
        match $self {
            Provider::P2p($a) => $body,
            Provider::Relay($a) => $body,
            Provider::Secure($a) => $body,
        }
    };
}

#[async_trait]
impl ChatProvider for Provider {
    fn kind(&self) -> ProviderKind {
        dispatch!(self, a => a.kind())
    }

    fn capabilities(&self) -> Capabilities {
        dispatch!(self, a => a.capabilities())
    }

    fn state(&self) -> ConnectionState {
        dispatch!(self, a => a.state())
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        dispatch!(self, a => a.watch_state())
    }

    async fn connect(
        &self,
        identity: &Identity,
        endpoints: &[String],
    ) -> Result<ConnectionState, ConnectionError> {
        dispatch!(self, a => a.connect(identity, endpoints).await)
    }

    fn disconnect(&self) {
        dispatch!(self, a => a.disconnect())
    }

    async fn join_channel(&self, id: &ChannelId) -> Result<Channel, ChannelError> {
        dispatch!(self, a => a.join_channel(id).await)
    }

    async fn create_channel(&self, descriptor: ChannelDescriptor) -> Result<Channel, ChannelError> {
        dispatch!(self, a => a.create_channel(descriptor).await)
    }

    async fn rejoin(&self, channel: &Channel) -> Result<(), ChannelError> {
        dispatch!(self, a => a.rejoin(channel).await)
    }

    async fn leave_channel(&self, id: &ChannelId) -> Result<(), ChannelError> {
        dispatch!(self, a => a.leave_channel(id).await)
    }

    fn prepare(
        &self,
        sender: &Identity,
        channel: &Channel,
        content: String,
        attachments: Vec<Attachment>,
        timestamp: DateTime<Utc>,
    ) -> Result<Message, SendError> {
        dispatch!(self, a => a.prepare(sender, channel, content, attachments, timestamp))
    }

    async fn transmit(&self, message: Message) -> Result<Message, SendError> {
        dispatch!(self, a => a.transmit(message).await)
    }

    async fn send(
        &self,
        channel_id: &ChannelId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<Message, SendError> {
        dispatch!(self, a => a.send(channel_id, content, attachments).await)
    }

    fn subscribe(&self, channel_id: &ChannelId, handler: EventHandler) -> SubscriptionId {
        dispatch!(self, a => a.subscribe(channel_id, handler))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        dispatch!(self, a => a.unsubscribe(id))
    }

    async fn mark_read(&self, channel_id: &ChannelId, ids: &[MessageId]) -> Result<(), SendError> {
        dispatch!(self, a => a.mark_read(channel_id, ids).await)
    }
}
