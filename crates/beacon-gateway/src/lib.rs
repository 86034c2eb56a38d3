//! Beacon gateway: one messaging surface over the P2P, relay and secure
//! backends.
//!
//! [`Gateway`] wires the pieces together: a [`RouterHandle`] owning channels
//! and the outbound queue, a supervisor per provider keeping it connected,
//! and an [`EmergencyCoordinator`] owning the emergency state. Everything is
//! explicitly constructed; there is no process-wide singleton.

pub mod adapters;
pub mod config;
pub mod emergency;
pub mod events;
pub mod factory;
pub mod provider;
pub mod router;
pub mod supervisor;

use std::sync::Arc;

use tracing::info;

use beacon_shared::{
    Attachment, Channel, ChannelDescriptor, ChannelId, ChannelKind, ConnectionState,
    EmergencyState, GatewayError, Identity, InboundEvent, Message, MessageId, OutboundEntry,
    ProviderKind, Urgency,
};
use beacon_store::{Database, StoreError};

pub use crate::config::{BackoffConfig, GatewayConfig};
pub use crate::emergency::{EmergencyCoordinator, EmergencyOutcome};
pub use crate::events::{ConnectionEvent, EmergencyEvent, SubscriptionId};
pub use crate::factory::{MemoryFactory, MemoryNetwork, NetworkFactory, ProviderFactory};
pub use crate::router::{BroadcastReport, RouterHandle, RouterStatus};

/// Handle to a running gateway. Must be created inside a tokio runtime.
pub struct Gateway {
    router: RouterHandle,
    emergency: EmergencyCoordinator,
}

impl Gateway {
    /// Gateway over the real backends. Opens the queue database when
    /// `config.queue_db` is set.
    pub fn new(config: GatewayConfig) -> Result<Self, StoreError> {
        let factory = Arc::new(NetworkFactory::new(&config));
        Self::with_factory(config, factory)
    }

    pub fn with_factory(
        config: GatewayConfig,
        factory: Arc<dyn ProviderFactory>,
    ) -> Result<Self, StoreError> {
        let store = match &config.queue_db {
            Some(path) => {
                info!(path = %path.display(), "Opening outbound queue database");
                Some(Database::open_at(path)?)
            }
            None => None,
        };
        Ok(Self::with_store(config, factory, store))
    }

    pub fn with_store(
        config: GatewayConfig,
        factory: Arc<dyn ProviderFactory>,
        store: Option<Database>,
    ) -> Self {
        let router = RouterHandle::spawn(config, factory, store);
        let emergency = EmergencyCoordinator::new(router.clone());
        Self { router, emergency }
    }

    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    // -- connection --------------------------------------------------------

    /// Connect as `identity`. `provider` defaults to the configured one, or
    /// the last one used. Calling again with the same identity and provider
    /// joins the attempt in progress instead of starting another handshake.
    pub async fn connect(
        &self,
        provider: Option<ProviderKind>,
        identity: Identity,
    ) -> Result<ConnectionState, GatewayError> {
        self.router.connect(provider, identity).await
    }

    pub async fn disconnect(&self) -> Result<(), GatewayError> {
        self.router.disconnect().await
    }

    /// Make `provider` the active one. Tracked channels are re-joined on it
    /// and queued messages follow; the previous provider finishes its
    /// in-flight sends first.
    pub async fn switch_provider(&self, provider: ProviderKind) -> Result<ConnectionState, GatewayError> {
        self.router.switch_provider(provider).await
    }

    /// Disconnect and stop the router. The handle is unusable afterwards.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        self.router.shutdown().await
    }

    // -- channels ----------------------------------------------------------

    pub async fn create_channel(
        &self,
        name: &str,
        kind: ChannelKind,
        participant_ids: Vec<String>,
    ) -> Result<Channel, GatewayError> {
        let descriptor = ChannelDescriptor::named(name, kind, participant_ids)?;
        self.router.create_channel(descriptor).await
    }

    /// Create a channel with an explicit encryption level or size limit.
    pub async fn create_channel_with(&self, descriptor: ChannelDescriptor) -> Result<Channel, GatewayError> {
        self.router.create_channel(descriptor).await
    }

    pub async fn join_channel(&self, id: ChannelId) -> Result<Channel, GatewayError> {
        self.router.join_channel(id).await
    }

    pub async fn leave_channel(&self, id: ChannelId) -> Result<(), GatewayError> {
        self.router.leave_channel(id).await
    }

    pub async fn channels(&self) -> Result<Vec<Channel>, GatewayError> {
        self.router.channels().await
    }

    // -- messages ----------------------------------------------------------

    /// Never blocks on network state: while the provider is offline the
    /// message is queued and returned `pending`.
    pub async fn send_message(
        &self,
        channel_id: ChannelId,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Message, GatewayError> {
        self.router.send(channel_id, text.into(), attachments).await
    }

    /// Re-send a failed message. The new message gets a new id.
    pub async fn retry_message(&self, id: MessageId) -> Result<Message, GatewayError> {
        self.router.retry(id).await
    }

    pub async fn abandon_message(&self, id: MessageId) -> Result<Message, GatewayError> {
        self.router.abandon(id).await
    }

    pub async fn mark_read(&self, channel_id: ChannelId, ids: Vec<MessageId>) -> Result<(), GatewayError> {
        self.router.mark_read(channel_id, ids).await
    }

    pub async fn messages(&self, channel_id: ChannelId) -> Result<Vec<Message>, GatewayError> {
        self.router.messages(channel_id).await
    }

    pub async fn outbox(&self) -> Result<Vec<OutboundEntry>, GatewayError> {
        self.router.outbox().await
    }

    // -- events ------------------------------------------------------------

    /// Messages, receipts and presence for one channel.
    pub async fn on_message(
        &self,
        channel_id: ChannelId,
        handler: impl Fn(&InboundEvent) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, GatewayError> {
        self.router.subscribe(channel_id, Arc::new(handler)).await
    }

    pub fn on_connection_change(
        &self,
        handler: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.router.connection_events().subscribe(handler)
    }

    pub fn on_emergency(&self, handler: impl Fn(&EmergencyEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.emergency.subscribe(handler)
    }

    /// Remove any subscription made through this gateway.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, GatewayError> {
        if self.router.connection_events().unsubscribe(id) || self.emergency.unsubscribe(id) {
            return Ok(true);
        }
        self.router.unsubscribe(id).await
    }

    // -- emergency ---------------------------------------------------------

    pub async fn declare_emergency(
        &self,
        reason: &str,
        urgency: Urgency,
    ) -> Result<EmergencyOutcome, GatewayError> {
        self.emergency.declare(reason, urgency).await
    }

    /// Replace the active emergency, if any, with a new declaration.
    pub async fn escalate_emergency(
        &self,
        reason: &str,
        urgency: Urgency,
    ) -> Result<EmergencyOutcome, GatewayError> {
        self.emergency.escalate(reason, urgency).await
    }

    pub async fn resolve_emergency(&self) -> Result<EmergencyOutcome, GatewayError> {
        self.emergency.resolve().await
    }

    // -- synchronous status ------------------------------------------------

    pub fn status(&self) -> RouterStatus {
        self.router.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.router.status().connection
    }

    pub fn emergency_state(&self) -> EmergencyState {
        self.emergency.state()
    }
}
