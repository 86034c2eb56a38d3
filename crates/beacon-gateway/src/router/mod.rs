//! Message router: the single owner of channel membership, the outbound
//! queue and the provider slots.
//!
//! All router state lives on one actor task. Callers talk to it through a
//! [`RouterHandle`]; network work (joins, sends, broadcasts) runs on spawned
//! tasks that report back on an internal event queue, so the actor itself
//! never waits on the network.
//!
//! A *slot* is one provider in one role:
//! - the **active** slot carries every tracked channel and all sends,
//! - **fallback** slots are kept connected for emergency broadcast only and
//!   join emergency channels only,
//! - the **draining** slot is a former active provider finishing its
//!   in-flight sends after a switch.

mod broadcast;
mod queue;
mod registry;

pub use broadcast::{BroadcastAttempt, BroadcastOutcome, BroadcastReport, ChannelBroadcast};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beacon_shared::{
    Attachment, Channel, ChannelDescriptor, ChannelError, ChannelId, ChannelKind,
    ConnectionError, ConnectionState, GatewayError, Identity, InboundEvent, Message, MessageId,
    MessageStatus, MonotonicClock, OutboundEntry, ProviderKind, SendError,
};
use beacon_store::Database;

use crate::config::GatewayConfig;
use crate::events::{ConnectionEvent, EventBus, SubscriptionId};
use crate::factory::ProviderFactory;
use crate::provider::{ChatProvider, EventHandler, Provider};
use crate::supervisor::{backoff, AttemptWatch, SupervisorHandle};

use self::queue::{OutboundQueue, Phase, SendReply};
use self::registry::Registry;

const COMMAND_BUFFER: usize = 64;

/// Identifies one provider slot for the lifetime of the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub kind: ProviderKind,
    pub state: ConnectionState,
    pub ready: bool,
}

/// Snapshot of the router, readable without a round-trip to the actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStatus {
    /// Active provider, or the one the next connect will use.
    pub provider: ProviderKind,
    pub connection: ConnectionState,
    /// Every tracked channel was re-joined on the current session.
    pub ready: bool,
    pub channels: usize,
    pub queued: usize,
    pub failed: usize,
    pub fallbacks: Vec<ProviderStatus>,
    pub draining: Option<ProviderKind>,
}

impl RouterStatus {
    fn idle(provider: ProviderKind) -> Self {
        Self {
            provider,
            connection: ConnectionState::Disconnected,
            ready: false,
            channels: 0,
            queued: 0,
            failed: 0,
            fallbacks: Vec::new(),
            draining: None,
        }
    }
}

/// What a connect or switch hands back: a settled state, or a supervisor
/// whose next attempt decides it.
enum ConnectWait {
    Done(ConnectionState),
    Pending(AttemptWatch, u64),
}

impl ConnectWait {
    async fn resolve(self) -> Result<ConnectionState, ConnectionError> {
        match self {
            ConnectWait::Done(state) => Ok(state),
            ConnectWait::Pending(attempts, after) => attempts.after(after).await,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;
type ChannelReply = Reply<Result<Channel, ChannelError>>;

enum Command {
    Connect {
        kind: Option<ProviderKind>,
        identity: Identity,
        reply: Reply<Result<ConnectWait, ConnectionError>>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Switch {
        kind: ProviderKind,
        reply: Reply<Result<ConnectWait, ConnectionError>>,
    },
    CreateChannel {
        descriptor: ChannelDescriptor,
        reply: ChannelReply,
    },
    JoinChannel {
        id: ChannelId,
        reply: ChannelReply,
    },
    LeaveChannel {
        id: ChannelId,
        reply: Reply<Result<(), ChannelError>>,
    },
    Send {
        channel_id: ChannelId,
        content: String,
        attachments: Vec<Attachment>,
        reply: SendReply,
    },
    Retry {
        id: MessageId,
        reply: SendReply,
    },
    Abandon {
        id: MessageId,
        reply: SendReply,
    },
    MarkRead {
        channel_id: ChannelId,
        ids: Vec<MessageId>,
        reply: Reply<Result<(), SendError>>,
    },
    Subscribe {
        channel_id: ChannelId,
        handler: EventHandler,
        reply: Reply<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: Reply<bool>,
    },
    Messages {
        channel_id: ChannelId,
        reply: Reply<Vec<Message>>,
    },
    Channels {
        reply: Reply<Vec<Channel>>,
    },
    Outbox {
        reply: Reply<Vec<OutboundEntry>>,
    },
    Broadcast {
        content: String,
        reply: Reply<BroadcastReport>,
    },
    Identity {
        reply: Reply<Option<Identity>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

enum Event {
    ProviderState {
        slot: SlotId,
        state: ConnectionState,
    },
    Inbound {
        slot: SlotId,
        event: InboundEvent,
    },
    Joined {
        slot: SlotId,
        session: u64,
        /// Result of a rejoin of everything in scope.
        full: bool,
        results: Vec<(Channel, Result<(), ChannelError>)>,
        reply: Option<ChannelReply>,
    },
    SendFinished {
        seq: u64,
        slot: SlotId,
        result: Result<Message, SendError>,
    },
    GraceElapsed {
        slot: SlotId,
    },
    Broadcasted {
        messages: Vec<Message>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Active,
    Fallback,
    Draining,
}

impl Role {
    fn covers(&self, channel: &Channel) -> bool {
        match self {
            Role::Active => true,
            Role::Fallback => channel.kind() == ChannelKind::Emergency,
            Role::Draining => false,
        }
    }
}

struct Slot {
    id: SlotId,
    kind: ProviderKind,
    provider: Arc<Provider>,
    supervisor: Option<SupervisorHandle>,
    state: ConnectionState,
    /// Bumped on every `Connected`; join results of older sessions are stale.
    session: u64,
    ready: bool,
    joined: HashSet<ChannelId>,
    handlers: HashMap<ChannelId, SubscriptionId>,
    watcher: CancellationToken,
}

impl Slot {
    fn status(&self) -> ProviderStatus {
        ProviderStatus {
            kind: self.kind,
            state: self.state,
            ready: self.ready,
        }
    }

    fn supervising(&self) -> bool {
        self.supervisor.as_ref().map_or(false, |s| !s.is_stopped())
    }

    /// Forward the provider's inbound events for `channel_id` to the router.
    fn attach(&mut self, channel_id: &ChannelId, events: &mpsc::UnboundedSender<Event>) {
        if self.handlers.contains_key(channel_id) {
            return;
        }
        let tx = events.clone();
        let slot = self.id;
        let handler: EventHandler = Arc::new(move |event: &InboundEvent| {
            let _ = tx.send(Event::Inbound {
                slot,
                event: event.clone(),
            });
        });
        let sub = self.provider.subscribe(channel_id, handler);
        self.handlers.insert(channel_id.clone(), sub);
    }

    fn detach(&mut self, channel_id: &ChannelId) {
        if let Some(sub) = self.handlers.remove(channel_id) {
            self.provider.unsubscribe(sub);
        }
        self.joined.remove(channel_id);
    }

    fn close(mut self) {
        self.watcher.cancel();
        self.supervisor = None;
        for (_, sub) in self.handlers.drain() {
            self.provider.unsubscribe(sub);
        }
        self.provider.disconnect();
        debug!(provider = %self.kind, slot = self.id.0, "Slot closed");
    }

    /// How a caller waiting on this slot's connection should wait.
    fn wait(&self) -> ConnectWait {
        match &self.supervisor {
            Some(supervisor) => {
                // Read the attempt count before the state so an attempt that
                // finishes in between is still observed
                let attempts = supervisor.attempts();
                let after = attempts.latest().map_or(0, |a| a.number);
                if self.provider.state().is_connected() {
                    ConnectWait::Done(ConnectionState::Connected)
                } else {
                    ConnectWait::Pending(attempts, after)
                }
            }
            None => ConnectWait::Done(self.provider.state()),
        }
    }
}

fn spawn_watcher(
    slot: SlotId,
    mut state: watch::Receiver<ConnectionState>,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let current = *state.borrow_and_update();
            if events
                .send(Event::ProviderState {
                    slot,
                    state: current,
                })
                .is_err()
            {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    });
}

fn spawn_rejoin(
    slot: &Slot,
    channels: Vec<Channel>,
    full: bool,
    reply: Option<ChannelReply>,
    events: &mpsc::UnboundedSender<Event>,
) {
    let provider = slot.provider.clone();
    let (slot, session, events) = (slot.id, slot.session, events.clone());
    tokio::spawn(async move {
        let mut results = Vec::with_capacity(channels.len());
        for channel in channels {
            let result = provider.rejoin(&channel).await;
            results.push((channel, result));
        }
        let _ = events.send(Event::Joined {
            slot,
            session,
            full,
            results,
            reply,
        });
    });
}

async fn transmit_within(
    provider: &Provider,
    message: Message,
    timeout: Duration,
) -> Result<Message, SendError> {
    match tokio::time::timeout(timeout, provider.transmit(message)).await {
        Ok(result) => result,
        Err(_) => Err(SendError::Timeout(timeout.as_millis() as u64)),
    }
}

struct Target {
    kind: ProviderKind,
    provider: Arc<Provider>,
    state: ConnectionState,
}

async fn broadcast_on(
    target: &Target,
    sender: &Identity,
    channel: &Channel,
    content: String,
    at: DateTime<Utc>,
    timeout: Duration,
) -> Result<Message, String> {
    target
        .provider
        .rejoin(channel)
        .await
        .map_err(|e| e.to_string())?;
    let message = target
        .provider
        .prepare(sender, channel, content, Vec::new(), at)
        .map_err(|e| e.to_string())?;
    transmit_within(&target.provider, message, timeout)
        .await
        .map_err(|e| e.to_string())
}

struct Router {
    config: GatewayConfig,
    factory: Arc<dyn ProviderFactory>,
    store: Option<Database>,
    clock: MonotonicClock,
    identity: Option<Identity>,
    /// Provider used by the next connect.
    preferred: ProviderKind,
    /// One provider per kind, reused across slots.
    providers: HashMap<ProviderKind, Arc<Provider>>,
    next_slot: u64,
    active: Option<Slot>,
    fallbacks: Vec<Slot>,
    draining: Option<Slot>,
    registry: Registry,
    queue: OutboundQueue,
    subscribers: HashMap<ChannelId, Vec<(SubscriptionId, EventHandler)>>,
    events_tx: mpsc::UnboundedSender<Event>,
    status_tx: watch::Sender<RouterStatus>,
    connection_events: Arc<EventBus<ConnectionEvent>>,
    last_connection: ConnectionEvent,
}

impl Router {
    fn new(
        config: GatewayConfig,
        factory: Arc<dyn ProviderFactory>,
        store: Option<Database>,
        events_tx: mpsc::UnboundedSender<Event>,
        connection_events: Arc<EventBus<ConnectionEvent>>,
    ) -> Self {
        let mut registry = Registry::new(config.channel_buffer);
        let mut queue = OutboundQueue::new(config.queue_capacity);
        if let Some(db) = &store {
            match db.list_channels() {
                Ok(channels) => {
                    for channel in channels {
                        registry.insert(channel);
                    }
                }
                Err(e) => warn!(error = %e, "Could not restore channels"),
            }
            match db.load_entries() {
                Ok(entries) => {
                    if !entries.is_empty() {
                        info!(entries = entries.len(), "Restored outbound queue");
                    }
                    queue.restore(entries);
                }
                Err(e) => warn!(error = %e, "Could not restore outbound queue"),
            }
        }

        let preferred = config.default_provider;
        let (status_tx, _) = watch::channel(RouterStatus::idle(preferred));
        let mut router = Self {
            config,
            factory,
            store,
            clock: MonotonicClock::new(),
            identity: None,
            preferred,
            providers: HashMap::new(),
            next_slot: 0,
            active: None,
            fallbacks: Vec::new(),
            draining: None,
            registry,
            queue,
            subscribers: HashMap::new(),
            events_tx,
            status_tx,
            connection_events,
            last_connection: ConnectionEvent {
                provider: preferred,
                state: ConnectionState::Disconnected,
                ready: false,
            },
        };
        router.publish_status();
        router
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            let next_due = self.queue.next_due();
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.handle_event(event),
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.close_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.close_all();
                        break;
                    }
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.queue.release_due(Instant::now());
                    self.pump();
                }
            }
            self.publish_status();
        }
        info!("Router stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                kind,
                identity,
                reply,
            } => {
                let _ = reply.send(self.connect(kind, identity));
            }
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Switch { kind, reply } => {
                let _ = reply.send(self.switch(kind));
            }
            Command::CreateChannel { descriptor, reply } => self.create_channel(descriptor, reply),
            Command::JoinChannel { id, reply } => self.join_channel(id, reply),
            Command::LeaveChannel { id, reply } => {
                let _ = reply.send(self.leave_channel(id));
            }
            Command::Send {
                channel_id,
                content,
                attachments,
                reply,
            } => match self.prepare(&channel_id, content, attachments) {
                Ok(message) => self.enqueue(message, reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Retry { id, reply } => self.retry(id, reply),
            Command::Abandon { id, reply } => {
                let _ = reply.send(self.abandon(id));
            }
            Command::MarkRead {
                channel_id,
                ids,
                reply,
            } => self.mark_read(channel_id, ids, reply),
            Command::Subscribe {
                channel_id,
                handler,
                reply,
            } => {
                let id = SubscriptionId::next();
                self.subscribers
                    .entry(channel_id)
                    .or_default()
                    .push((id, handler));
                let _ = reply.send(id);
            }
            Command::Unsubscribe { id, reply } => {
                let mut removed = false;
                self.subscribers.retain(|_, handlers| {
                    let before = handlers.len();
                    handlers.retain(|(sub, _)| *sub != id);
                    removed |= handlers.len() != before;
                    !handlers.is_empty()
                });
                let _ = reply.send(removed);
            }
            Command::Messages { channel_id, reply } => {
                let mut messages = self.registry.messages(&channel_id);
                messages.extend(
                    self.queue
                        .iter()
                        .filter(|q| q.entry.message.channel_id == channel_id)
                        .map(|q| q.entry.message.clone()),
                );
                let _ = reply.send(messages);
            }
            Command::Channels { reply } => {
                let _ = reply.send(self.registry.channels().cloned().collect());
            }
            Command::Outbox { reply } => {
                let _ = reply.send(self.queue.iter().map(|q| q.entry.clone()).collect());
            }
            Command::Broadcast { content, reply } => self.broadcast(content, reply),
            Command::Identity { reply } => {
                let _ = reply.send(self.identity.clone());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::ProviderState { slot, state } => self.on_provider_state(slot, state),
            Event::Inbound { slot, event } => self.on_inbound(slot, event),
            Event::Joined {
                slot,
                session,
                full,
                results,
                reply,
            } => self.on_joined(slot, session, full, results, reply),
            Event::SendFinished { seq, slot, result } => self.on_send_finished(seq, slot, result),
            Event::GraceElapsed { slot } => {
                if self.draining.as_ref().map(|s| s.id) == Some(slot) {
                    info!("Switch grace period elapsed, closing previous provider");
                    self.finish_drain();
                }
            }
            Event::Broadcasted { messages } => {
                for message in messages {
                    if self.registry.record(message.clone()) {
                        self.notify(&InboundEvent::Message(message));
                    }
                }
            }
        }
    }

    // -- slots -------------------------------------------------------------

    fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.active
            .iter()
            .chain(self.fallbacks.iter())
            .chain(self.draining.iter())
    }

    fn slots_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.active
            .iter_mut()
            .chain(self.fallbacks.iter_mut())
            .chain(self.draining.iter_mut())
    }

    fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots_mut().find(|s| s.id == id)
    }

    fn role_of(&self, id: SlotId) -> Option<Role> {
        if self.active.as_ref().map(|s| s.id) == Some(id) {
            Some(Role::Active)
        } else if self.fallbacks.iter().any(|s| s.id == id) {
            Some(Role::Fallback)
        } else if self.draining.as_ref().map(|s| s.id) == Some(id) {
            Some(Role::Draining)
        } else {
            None
        }
    }

    fn open_slot(&mut self, kind: ProviderKind, role: Role) -> Result<Slot, ConnectionError> {
        let provider = match self.providers.get(&kind) {
            Some(provider) => provider.clone(),
            None => {
                let provider = Arc::new(self.factory.build(kind)?);
                self.providers.insert(kind, provider.clone());
                provider
            }
        };
        self.next_slot += 1;
        let id = SlotId(self.next_slot);
        let watcher = CancellationToken::new();
        spawn_watcher(id, provider.watch_state(), self.events_tx.clone(), watcher.clone());

        let mut slot = Slot {
            id,
            kind,
            state: provider.state(),
            provider,
            supervisor: None,
            session: 0,
            ready: false,
            joined: HashSet::new(),
            handlers: HashMap::new(),
            watcher,
        };
        for channel in self.registry.channels().filter(|c| role.covers(c)) {
            slot.attach(channel.id(), &self.events_tx);
        }
        debug!(provider = %kind, slot = id.0, ?role, "Slot opened");
        Ok(slot)
    }

    fn start_supervisor(&self, slot: &mut Slot, identity: &Identity) {
        slot.supervisor = Some(SupervisorHandle::spawn(
            slot.provider.clone(),
            identity.clone(),
            self.factory.endpoints(slot.kind),
            self.config.backoff,
        ));
    }

    fn open_fallbacks(&mut self, identity: &Identity) {
        for kind in self.config.fallbacks.clone() {
            if self.slots().any(|s| s.kind == kind) {
                continue;
            }
            match self.open_slot(kind, Role::Fallback) {
                Ok(mut slot) => {
                    self.start_supervisor(&mut slot, identity);
                    self.insert_fallback(slot);
                }
                Err(e) => warn!(provider = %kind, error = %e, "Fallback provider unavailable"),
            }
        }
    }

    /// Keep fallbacks in configured priority order.
    fn insert_fallback(&mut self, slot: Slot) {
        let rank = |kind: ProviderKind| {
            self.config
                .fallbacks
                .iter()
                .position(|k| *k == kind)
                .unwrap_or(usize::MAX)
        };
        let at = self
            .fallbacks
            .iter()
            .position(|s| rank(s.kind) > rank(slot.kind))
            .unwrap_or(self.fallbacks.len());
        self.fallbacks.insert(at, slot);
    }

    /// Demote a slot that is no longer active: configured fallback kinds
    /// stay connected for emergencies, anything else is closed.
    fn retire(&mut self, mut slot: Slot) {
        let identity = match &self.identity {
            Some(identity) if self.config.fallbacks.contains(&slot.kind) => identity.clone(),
            _ => {
                slot.close();
                return;
            }
        };
        slot.ready = false;
        let registry = &self.registry;
        let out_of_scope: Vec<ChannelId> = slot
            .handlers
            .keys()
            .filter(|id| !registry.get(id).map_or(false, |c| Role::Fallback.covers(c)))
            .cloned()
            .collect();
        for id in out_of_scope {
            slot.detach(&id);
        }
        if !slot.supervising() {
            self.start_supervisor(&mut slot, &identity);
        }
        info!(provider = %slot.kind, "Provider kept as emergency fallback");
        self.insert_fallback(slot);
    }

    fn finish_drain(&mut self) {
        if let Some(slot) = self.draining.take() {
            info!(provider = %slot.kind, in_flight = self.queue.in_flight_on(slot.id), "Drain finished");
            self.retire(slot);
        }
    }

    fn close_all(&mut self) {
        if let Some(slot) = self.draining.take() {
            slot.close();
        }
        for slot in self.fallbacks.drain(..) {
            slot.close();
        }
        if let Some(slot) = self.active.take() {
            slot.close();
        }
    }

    // -- connection --------------------------------------------------------

    fn connect(
        &mut self,
        kind: Option<ProviderKind>,
        identity: Identity,
    ) -> Result<ConnectWait, ConnectionError> {
        identity.validate()?;
        let kind = kind.unwrap_or(self.preferred);

        let same_session = self.identity.as_ref() == Some(&identity)
            && self.active.as_ref().map(|s| s.kind) == Some(kind);
        if same_session {
            if let Some(mut active) = self.active.take() {
                let state = active.provider.state();
                if !state.is_connected() && (!active.supervising() || state == ConnectionState::Error) {
                    debug!(provider = %kind, "Restarting supervisor");
                    self.start_supervisor(&mut active, &identity);
                }
                let wait = active.wait();
                self.active = Some(active);
                return Ok(wait);
            }
        }

        info!(provider = %kind, identity = %identity.id, "Connecting");
        self.close_all();
        self.identity = Some(identity.clone());
        self.preferred = kind;
        let mut active = self.open_slot(kind, Role::Active)?;
        self.start_supervisor(&mut active, &identity);
        let wait = active.wait();
        self.active = Some(active);
        self.open_fallbacks(&identity);
        Ok(wait)
    }

    fn disconnect(&mut self) {
        if let Some(active) = &self.active {
            self.preferred = active.kind;
        }
        self.close_all();

        let idle: Vec<ChannelId> = self
            .registry
            .ids()
            .into_iter()
            .filter(|id| !self.subscribers.contains_key(id) && !self.queue.has_channel(id))
            .collect();
        for id in &idle {
            self.registry.remove(id);
            self.forget_channel(id);
        }
        info!(dropped_channels = idle.len(), kept_channels = self.registry.len(), "Disconnected");
    }

    fn switch(&mut self, kind: ProviderKind) -> Result<ConnectWait, ConnectionError> {
        if let Some(active) = self.active.as_ref().filter(|s| s.kind == kind) {
            return Ok(active.wait());
        }
        self.preferred = kind;
        let identity = match (&self.identity, &self.active) {
            (Some(identity), Some(_)) => identity.clone(),
            _ => {
                info!(provider = %kind, "Preferred provider set");
                return Ok(ConnectWait::Done(ConnectionState::Disconnected));
            }
        };

        self.finish_drain();
        let mut next = match self.fallbacks.iter().position(|s| s.kind == kind) {
            Some(i) => self.fallbacks.remove(i),
            None => self.open_slot(kind, Role::Active)?,
        };
        for channel in self.registry.channels() {
            next.attach(channel.id(), &self.events_tx);
        }
        if !next.supervising() {
            self.start_supervisor(&mut next, &identity);
        }
        next.ready = false;
        if next.state.is_connected() {
            next.session += 1;
            spawn_rejoin(
                &next,
                self.registry.channels().cloned().collect(),
                true,
                None,
                &self.events_tx,
            );
        }
        let wait = next.wait();
        info!(provider = %kind, channels = self.registry.len(), "Switching provider");

        if let Some(mut previous) = self.active.replace(next) {
            let in_flight = self.queue.in_flight_on(previous.id);
            if in_flight > 0 && previous.state.is_connected() {
                previous.supervisor = None;
                previous.ready = false;
                let grace = self.config.switch_grace;
                info!(
                    provider = %previous.kind,
                    in_flight,
                    grace_ms = grace.as_millis() as u64,
                    "Draining previous provider"
                );
                let (events, slot) = (self.events_tx.clone(), previous.id);
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = events.send(Event::GraceElapsed { slot });
                });
                self.draining = Some(previous);
            } else {
                self.retire(previous);
            }
        }
        Ok(wait)
    }

    fn on_provider_state(&mut self, id: SlotId, state: ConnectionState) {
        let Some(role) = self.role_of(id) else {
            return;
        };
        let channels: Vec<Channel> = if state.is_connected() {
            self.registry
                .channels()
                .filter(|c| role.covers(c))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        let events = self.events_tx.clone();
        let Some(slot) = self.slot_mut(id) else {
            return;
        };
        let previous = slot.state;
        slot.state = state;
        slot.ready = false;
        slot.joined.clear();
        if state.is_connected() {
            slot.session += 1;
            debug!(provider = %slot.kind, session = slot.session, channels = channels.len(), "Re-joining channels");
            spawn_rejoin(slot, channels, true, None, &events);
        } else if previous.is_connected() {
            info!(provider = %slot.kind, state = %state, "Provider lost connection");
        }

        if role == Role::Draining && !state.is_connected() {
            self.finish_drain();
        }
    }

    // -- channels ----------------------------------------------------------

    fn admit(&self, descriptor: &ChannelDescriptor) -> Result<(), ChannelError> {
        descriptor.validate()?;
        if self.identity.is_none() {
            return Err(ChannelError::NotConnected);
        }
        if self.registry.contains(&descriptor.id) {
            return Err(ChannelError::Duplicate(descriptor.id.clone()));
        }
        if let Some(provider) = self.prepare_provider() {
            let max = provider.capabilities().max_encryption;
            let requested = descriptor
                .encryption_level
                .unwrap_or_else(|| descriptor.kind.default_encryption());
            if requested > max {
                return Err(ChannelError::UnsupportedEncryption { requested, max });
            }
        }
        Ok(())
    }

    fn track(&mut self, channel: Channel) {
        self.persist_channel(&channel);
        let events = &self.events_tx;
        if let Some(slot) = self.active.as_mut() {
            slot.attach(channel.id(), events);
        }
        if Role::Fallback.covers(&channel) {
            for slot in &mut self.fallbacks {
                slot.attach(channel.id(), events);
            }
        }
        debug!(channel = %channel.id(), kind = %channel.kind(), "Channel tracked");
        self.registry.insert(channel);
    }

    fn untrack(&mut self, id: &ChannelId) -> Option<Channel> {
        let channel = self.registry.remove(id)?;
        self.forget_channel(id);
        self.subscribers.remove(id);
        for seq in self.queue.on_channel(id) {
            if matches!(self.queue.get(seq).map(|q| q.phase), Some(Phase::InFlight(_))) {
                continue;
            }
            if let Some(q) = self.queue.remove(seq) {
                self.forget_entry(&q.entry.message.id);
                if let Some(waiter) = q.waiter {
                    let _ = waiter.send(Err(SendError::UnknownChannel(id.clone())));
                }
            }
        }
        for slot in self.slots_mut() {
            slot.detach(id);
        }
        Some(channel)
    }

    /// Join `channel` wherever its scope says. Replies once the active
    /// provider answered, or at once when it is offline.
    fn join(&mut self, channel: Channel, reply: ChannelReply) {
        if Role::Fallback.covers(&channel) {
            for slot in self.fallbacks.iter().filter(|s| s.state.is_connected()) {
                spawn_rejoin(slot, vec![channel.clone()], false, None, &self.events_tx);
            }
        }
        match self.active.as_ref().filter(|s| s.state.is_connected()) {
            Some(slot) => spawn_rejoin(slot, vec![channel], false, Some(reply), &self.events_tx),
            None => {
                let _ = reply.send(Ok(channel));
            }
        }
    }

    fn create_channel(&mut self, descriptor: ChannelDescriptor, reply: ChannelReply) {
        if let Err(e) = self.admit(&descriptor) {
            let _ = reply.send(Err(e));
            return;
        }
        let channel = Channel::from_descriptor(descriptor, self.config.max_message_size);
        self.track(channel.clone());
        self.join(channel, reply);
    }

    fn join_channel(&mut self, id: ChannelId, reply: ChannelReply) {
        if let Some(channel) = self.registry.get(&id) {
            let _ = reply.send(Ok(channel.clone()));
            return;
        }
        if self.identity.is_none() {
            let _ = reply.send(Err(ChannelError::NotConnected));
            return;
        }
        let channel = Channel::joined(id, self.config.max_message_size);
        self.track(channel.clone());
        self.join(channel, reply);
    }

    fn leave_channel(&mut self, id: ChannelId) -> Result<(), ChannelError> {
        let joined_on: Vec<Arc<Provider>> = self
            .slots()
            .filter(|s| s.joined.contains(&id))
            .map(|s| s.provider.clone())
            .collect();
        if self.untrack(&id).is_none() {
            return Err(ChannelError::Unknown(id));
        }
        info!(channel = %id, "Channel left");
        tokio::spawn(async move {
            for provider in joined_on {
                if let Err(e) = provider.leave_channel(&id).await {
                    debug!(provider = %provider.kind(), channel = %id, error = %e, "Leave not acknowledged");
                }
            }
        });
        Ok(())
    }

    fn on_joined(
        &mut self,
        id: SlotId,
        session: u64,
        full: bool,
        results: Vec<(Channel, Result<(), ChannelError>)>,
        reply: Option<ChannelReply>,
    ) {
        let is_active = self.active.as_ref().map(|s| s.id) == Some(id);
        let mut became_ready = false;
        if let Some(slot) = self
            .slot_mut(id)
            .filter(|s| s.session == session && s.state.is_connected())
        {
            for (channel, result) in &results {
                match result {
                    Ok(()) => {
                        slot.joined.insert(channel.id().clone());
                    }
                    Err(e) => {
                        warn!(provider = %slot.kind, channel = %channel.id(), error = %e, "Channel not joined")
                    }
                }
            }
            if full {
                slot.ready = true;
                became_ready = true;
                info!(provider = %slot.kind, joined = slot.joined.len(), "Provider ready");
            }
        }
        if became_ready && is_active {
            self.queue.clear_delays();
        }

        if let Some(reply) = reply {
            match results.into_iter().next() {
                Some((channel, Err(e))) if e != ChannelError::NotConnected => {
                    self.untrack(channel.id());
                    let _ = reply.send(Err(e));
                }
                Some((channel, _)) => {
                    let current = self.registry.get(channel.id()).cloned().unwrap_or(channel);
                    let _ = reply.send(Ok(current));
                }
                None => {}
            }
        }
        self.pump();
    }

    // -- sending -----------------------------------------------------------

    /// Provider used to validate drafts: the active one, or the last one
    /// used while disconnected.
    fn prepare_provider(&self) -> Option<Arc<Provider>> {
        self.active
            .as_ref()
            .map(|s| s.provider.clone())
            .or_else(|| self.providers.get(&self.preferred).cloned())
    }

    fn prepare(
        &self,
        channel_id: &ChannelId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<Message, SendError> {
        let identity = self.identity.as_ref().ok_or(SendError::NotConnected)?;
        let channel = self
            .registry
            .get(channel_id)
            .ok_or_else(|| SendError::UnknownChannel(channel_id.clone()))?;
        let provider = self.prepare_provider().ok_or(SendError::NotConnected)?;
        provider.prepare(identity, channel, content, attachments, self.clock.next())
    }

    /// Queue a prepared message. The caller waits for the provider only if
    /// the message went out at once; otherwise it gets the pending message.
    fn enqueue(&mut self, message: Message, reply: SendReply) {
        let seq = match self.queue.push(message.clone()) {
            Ok(seq) => seq,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        self.persist_entry(seq);
        self.pump();
        match self.queue.get_mut(seq) {
            Some(q) if matches!(q.phase, Phase::InFlight(_)) => q.waiter = Some(reply),
            _ => {
                debug!(channel = %message.channel_id, message_id = %message.id, "Message queued");
                let _ = reply.send(Ok(message));
            }
        }
    }

    fn retry(&mut self, id: MessageId, reply: SendReply) {
        let Some(seq) = self.queue.find(&id) else {
            let _ = reply.send(Err(SendError::UnknownMessage(id)));
            return;
        };
        let Some(failed) = self.queue.get(seq).filter(|q| q.phase == Phase::Failed) else {
            let _ = reply.send(Err(SendError::NotRetryable(id)));
            return;
        };
        let original = failed.entry.message.clone();
        let message = match self.prepare(&original.channel_id, original.content, original.attachments) {
            Ok(message) => message,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        self.queue.remove(seq);
        self.forget_entry(&id);
        info!(failed = %id, message_id = %message.id, "Retrying failed message");
        self.enqueue(message, reply);
    }

    fn abandon(&mut self, id: MessageId) -> Result<Message, SendError> {
        let seq = self.queue.find(&id).ok_or(SendError::UnknownMessage(id))?;
        if matches!(self.queue.get(seq).map(|q| q.phase), Some(Phase::InFlight(_))) {
            return Err(SendError::NotRetryable(id));
        }
        let q = self.queue.remove(seq).ok_or(SendError::UnknownMessage(id))?;
        self.forget_entry(&id);
        debug!(message_id = %id, "Message abandoned");
        Ok(q.entry.message)
    }

    fn mark_read(
        &mut self,
        channel_id: ChannelId,
        ids: Vec<MessageId>,
        reply: Reply<Result<(), SendError>>,
    ) {
        if !self.registry.contains(&channel_id) {
            let _ = reply.send(Err(SendError::UnknownChannel(channel_id)));
            return;
        }
        let Some(provider) = self
            .active
            .as_ref()
            .filter(|s| s.state.is_connected())
            .map(|s| s.provider.clone())
        else {
            let _ = reply.send(Err(SendError::NotConnected));
            return;
        };
        for id in &ids {
            self.registry.advance(&channel_id, id, MessageStatus::Read);
        }
        tokio::spawn(async move {
            let _ = reply.send(provider.mark_read(&channel_id, &ids).await);
        });
    }

    /// Hand every dispatchable entry to the active provider.
    fn pump(&mut self) {
        let Some(active) = self
            .active
            .as_ref()
            .filter(|s| s.ready && s.state.is_connected())
        else {
            return;
        };
        let (slot, provider) = (active.id, active.provider.clone());
        let ready = self
            .queue
            .dispatchable(Instant::now(), |c| active.joined.contains(c));
        for seq in ready {
            self.dispatch(seq, slot, provider.clone());
        }
    }

    fn dispatch(&mut self, seq: u64, slot: SlotId, provider: Arc<Provider>) {
        let Some(q) = self.queue.get_mut(seq) else {
            return;
        };
        q.phase = Phase::InFlight(slot);
        q.due = None;
        q.entry.attempts += 1;
        q.entry.next_retry_at = None;
        let message = q.entry.message.clone();
        self.persist_entry(seq);

        let events = self.events_tx.clone();
        let timeout = self.config.send_timeout;
        tokio::spawn(async move {
            let result = transmit_within(&provider, message, timeout).await;
            let _ = events.send(Event::SendFinished { seq, slot, result });
        });
    }

    fn on_send_finished(&mut self, seq: u64, slot: SlotId, result: Result<Message, SendError>) {
        match self.queue.get(seq) {
            Some(q) if q.phase == Phase::InFlight(slot) => {}
            _ => return,
        }

        match result {
            Ok(mut sent) => {
                let Some(q) = self.queue.remove(seq) else {
                    return;
                };
                // A receipt may have overtaken the acknowledgement
                sent.advance(q.entry.message.status());
                self.forget_entry(&sent.id);
                self.registry.record(sent.clone());
                debug!(channel = %sent.channel_id, message_id = %sent.id, attempts = q.entry.attempts, "Message sent");
                match q.waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(sent));
                    }
                    None => self.notify(&InboundEvent::Message(sent)),
                }
            }
            Err(e) if e.is_disconnection() || matches!(e, SendError::UnknownChannel(_)) => {
                let retry = self.config.backoff;
                let Some(q) = self.queue.get_mut(seq) else {
                    return;
                };
                let delay = backoff::delay(&retry, q.entry.attempts);
                q.phase = Phase::Queued;
                q.due = Some(Instant::now() + delay);
                q.entry.next_retry_at = chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d);
                q.entry.last_error = Some(e.to_string());
                let pending = q.entry.message.clone();
                let waiter = q.waiter.take();
                debug!(message_id = %pending.id, error = %e, delay_ms = delay.as_millis() as u64, "Send interrupted, message requeued");
                self.persist_entry(seq);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(pending));
                }
                if let SendError::UnknownChannel(channel_id) = &e {
                    self.rejoin_one(slot, channel_id);
                }
            }
            Err(e) => {
                let Some(q) = self.queue.get_mut(seq) else {
                    return;
                };
                q.phase = Phase::Failed;
                q.entry.message.advance(MessageStatus::Failed);
                q.entry.last_error = Some(e.to_string());
                let waiter = q.waiter.take();
                warn!(message_id = %q.entry.message.id, channel = %q.entry.message.channel_id, error = %e, "Send failed");
                self.persist_entry(seq);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(e));
                }
            }
        }

        if self.draining.as_ref().map(|s| s.id) == Some(slot) && self.queue.in_flight_on(slot) == 0 {
            self.finish_drain();
        }
        self.pump();
    }

    fn rejoin_one(&mut self, id: SlotId, channel_id: &ChannelId) {
        let Some(channel) = self.registry.get(channel_id).cloned() else {
            return;
        };
        let events = self.events_tx.clone();
        if let Some(slot) = self.slot_mut(id).filter(|s| s.state.is_connected()) {
            slot.joined.remove(channel_id);
            spawn_rejoin(slot, vec![channel], false, None, &events);
        }
    }

    // -- inbound -----------------------------------------------------------

    fn on_inbound(&mut self, slot: SlotId, event: InboundEvent) {
        match &event {
            InboundEvent::Message(message) => {
                if !self.registry.record(message.clone()) {
                    return;
                }
            }
            InboundEvent::Receipt(receipt) => {
                let status = receipt.kind.status();
                let buffered = self
                    .registry
                    .advance(&receipt.channel_id, &receipt.message_id, status);
                let queued = !buffered && self.queue.advance(&receipt.message_id, status);
                if queued {
                    if let Some(seq) = self.queue.find(&receipt.message_id) {
                        self.persist_entry(seq);
                    }
                }
                if !buffered && !queued {
                    return;
                }
            }
            InboundEvent::Presence(presence) => {
                if !self.registry.contains(&presence.channel_id) {
                    return;
                }
            }
        }
        debug!(slot = slot.0, channel = %event.channel_id(), "Inbound event");
        self.notify(&event);
    }

    fn notify(&self, event: &InboundEvent) {
        if let Some(handlers) = self.subscribers.get(event.channel_id()) {
            for (_, handler) in handlers {
                handler(event);
            }
        }
    }

    // -- emergency broadcast -----------------------------------------------

    /// Send `content` to every emergency channel, walking providers in
    /// priority order until one succeeds per channel.
    fn broadcast(&mut self, content: String, reply: Reply<BroadcastReport>) {
        let channels: Vec<(Channel, DateTime<Utc>)> = self
            .registry
            .of_kind(ChannelKind::Emergency)
            .into_iter()
            .map(|c| (c, self.clock.next()))
            .collect();
        let targets: Vec<Target> = self
            .slots()
            .map(|s| Target {
                kind: s.kind,
                provider: s.provider.clone(),
                state: s.state,
            })
            .collect();

        let mut unavailable: Vec<ProviderKind> = self
            .fallbacks
            .iter()
            .filter(|s| !s.state.is_connected())
            .map(|s| s.kind)
            .collect();
        for kind in &self.config.fallbacks {
            if !unavailable.contains(kind) && !self.slots().any(|s| s.kind == *kind) {
                unavailable.push(*kind);
            }
        }

        let identity = self.identity.clone();
        let timeout = self.config.send_timeout;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mut report = BroadcastReport {
                channels: Vec::with_capacity(channels.len()),
                unavailable_fallbacks: unavailable,
            };
            let mut delivered = Vec::new();
            for (channel, at) in channels {
                let mut attempts = Vec::new();
                if let Some(sender) = &identity {
                    for target in &targets {
                        if !target.state.is_connected() {
                            attempts.push(BroadcastAttempt {
                                provider: target.kind,
                                outcome: BroadcastOutcome::Skipped(target.state),
                            });
                            continue;
                        }
                        match broadcast_on(target, sender, &channel, content.clone(), at, timeout).await {
                            Ok(message) => {
                                attempts.push(BroadcastAttempt {
                                    provider: target.kind,
                                    outcome: BroadcastOutcome::Delivered(message.id),
                                });
                                delivered.push(message);
                                break;
                            }
                            Err(reason) => {
                                warn!(provider = %target.kind, channel = %channel.id(), reason = %reason, "Emergency broadcast attempt failed");
                                attempts.push(BroadcastAttempt {
                                    provider: target.kind,
                                    outcome: BroadcastOutcome::Failed(reason),
                                });
                            }
                        }
                    }
                }
                report.channels.push(ChannelBroadcast {
                    channel_id: channel.id().clone(),
                    attempts,
                });
            }
            let _ = events.send(Event::Broadcasted { messages: delivered });
            let _ = reply.send(report);
        });
    }

    // -- persistence & status ----------------------------------------------

    fn persist_channel(&self, channel: &Channel) {
        if let Some(db) = &self.store {
            if let Err(e) = db.upsert_channel(channel) {
                warn!(channel = %channel.id(), error = %e, "Could not persist channel");
            }
        }
    }

    fn forget_channel(&self, id: &ChannelId) {
        if let Some(db) = &self.store {
            if let Err(e) = db.delete_channel(id) {
                warn!(channel = %id, error = %e, "Could not delete channel");
            }
        }
    }

    fn persist_entry(&self, seq: u64) {
        if let (Some(db), Some(q)) = (&self.store, self.queue.get(seq)) {
            if let Err(e) = db.upsert_entry(&q.entry) {
                warn!(message_id = %q.entry.message.id, error = %e, "Could not persist outbound entry");
            }
        }
    }

    fn forget_entry(&self, id: &MessageId) {
        if let Some(db) = &self.store {
            if let Err(e) = db.delete_entry(id) {
                warn!(message_id = %id, error = %e, "Could not delete outbound entry");
            }
        }
    }

    fn status(&self) -> RouterStatus {
        let active = self.active.as_ref();
        RouterStatus {
            provider: active.map_or(self.preferred, |s| s.kind),
            connection: active.map_or(ConnectionState::Disconnected, |s| s.state),
            ready: active.map_or(false, |s| s.ready && s.state.is_connected()),
            channels: self.registry.len(),
            queued: self.queue.count(|p| !matches!(p, Phase::Failed)),
            failed: self.queue.count(|p| matches!(p, Phase::Failed)),
            fallbacks: self.fallbacks.iter().map(Slot::status).collect(),
            draining: self.draining.as_ref().map(|s| s.kind),
        }
    }

    fn publish_status(&mut self) {
        let status = self.status();
        let connection = ConnectionEvent {
            provider: status.provider,
            state: status.connection,
            ready: status.ready,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if connection != self.last_connection {
            self.last_connection = connection;
            self.connection_events.publish(&connection);
        }
    }
}

/// Cloneable handle to the router actor.
#[derive(Clone)]
pub struct RouterHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<RouterStatus>,
    connection_events: Arc<EventBus<ConnectionEvent>>,
}

impl RouterHandle {
    /// Start the router. Channels and queued messages in `store` are
    /// restored before the first command is handled.
    pub fn spawn(
        config: GatewayConfig,
        factory: Arc<dyn ProviderFactory>,
        store: Option<Database>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection_events = Arc::new(EventBus::new());
        let router = Router::new(config, factory, store, events_tx, connection_events.clone());
        let status = router.status_tx.subscribe();
        tokio::spawn(router.run(command_rx, events_rx));
        Self {
            commands: command_tx,
            status,
            connection_events,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| GatewayError::Shutdown)?;
        rx.await.map_err(|_| GatewayError::Shutdown)
    }

    /// Connect as `identity` on `kind`, or on the preferred provider.
    /// Resolves with the outcome of the handshake; on failure the
    /// supervisor keeps retrying in the background.
    pub async fn connect(
        &self,
        kind: Option<ProviderKind>,
        identity: Identity,
    ) -> Result<ConnectionState, GatewayError> {
        let wait = self
            .request(|reply| Command::Connect {
                kind,
                identity,
                reply,
            })
            .await??;
        Ok(wait.resolve().await?)
    }

    pub async fn disconnect(&self) -> Result<(), GatewayError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub async fn switch_provider(&self, kind: ProviderKind) -> Result<ConnectionState, GatewayError> {
        let wait = self
            .request(|reply| Command::Switch { kind, reply })
            .await??;
        Ok(wait.resolve().await?)
    }

    pub async fn create_channel(&self, descriptor: ChannelDescriptor) -> Result<Channel, GatewayError> {
        Ok(self
            .request(|reply| Command::CreateChannel { descriptor, reply })
            .await??)
    }

    pub async fn join_channel(&self, id: ChannelId) -> Result<Channel, GatewayError> {
        Ok(self
            .request(|reply| Command::JoinChannel { id, reply })
            .await??)
    }

    pub async fn leave_channel(&self, id: ChannelId) -> Result<(), GatewayError> {
        Ok(self
            .request(|reply| Command::LeaveChannel { id, reply })
            .await??)
    }

    /// Returns the message as sent, or still `pending` when it was queued.
    pub async fn send(
        &self,
        channel_id: ChannelId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<Message, GatewayError> {
        Ok(self
            .request(|reply| Command::Send {
                channel_id,
                content,
                attachments,
                reply,
            })
            .await??)
    }

    /// Re-submit a failed message under a new id.
    pub async fn retry(&self, id: MessageId) -> Result<Message, GatewayError> {
        Ok(self.request(|reply| Command::Retry { id, reply }).await??)
    }

    pub async fn abandon(&self, id: MessageId) -> Result<Message, GatewayError> {
        Ok(self.request(|reply| Command::Abandon { id, reply }).await??)
    }

    pub async fn mark_read(&self, channel_id: ChannelId, ids: Vec<MessageId>) -> Result<(), GatewayError> {
        Ok(self
            .request(|reply| Command::MarkRead {
                channel_id,
                ids,
                reply,
            })
            .await??)
    }

    pub async fn subscribe(
        &self,
        channel_id: ChannelId,
        handler: EventHandler,
    ) -> Result<SubscriptionId, GatewayError> {
        self.request(|reply| Command::Subscribe {
            channel_id,
            handler,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, GatewayError> {
        self.request(|reply| Command::Unsubscribe { id, reply }).await
    }

    /// Buffered messages of a channel followed by its queued and failed ones.
    pub async fn messages(&self, channel_id: ChannelId) -> Result<Vec<Message>, GatewayError> {
        self.request(|reply| Command::Messages { channel_id, reply })
            .await
    }

    pub async fn channels(&self) -> Result<Vec<Channel>, GatewayError> {
        self.request(|reply| Command::Channels { reply }).await
    }

    /// Pending and failed entries in send order.
    pub async fn outbox(&self) -> Result<Vec<OutboundEntry>, GatewayError> {
        self.request(|reply| Command::Outbox { reply }).await
    }

    pub async fn broadcast(&self, content: String) -> Result<BroadcastReport, GatewayError> {
        self.request(|reply| Command::Broadcast { content, reply })
            .await
    }

    pub async fn identity(&self) -> Result<Option<Identity>, GatewayError> {
        self.request(|reply| Command::Identity { reply }).await
    }

    /// Disconnect every provider and stop the actor.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn status(&self) -> RouterStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<RouterStatus> {
        self.status.clone()
    }

    pub async fn wait_for_status(
        &self,
        predicate: impl FnMut(&RouterStatus) -> bool,
    ) -> Result<RouterStatus, GatewayError> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(predicate)
            .await
            .map_err(|_| GatewayError::Shutdown)?
            .clone();
        Ok(status)
    }

    pub fn connection_events(&self) -> &Arc<EventBus<ConnectionEvent>> {
        &self.connection_events
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use beacon_net::BackendError;
    use beacon_shared::ReceiptKind;

    use super::*;
    use crate::adapters::tests::wait_for;
    use crate::config::BackoffConfig;
    use crate::factory::{MemoryFactory, MemoryNetwork};

    fn config() -> GatewayConfig {
        GatewayConfig {
            connect_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_millis(500),
            switch_grace: Duration::from_millis(500),
            backoff: BackoffConfig {
                base: Duration::from_millis(50),
                max: Duration::from_millis(200),
                jitter: 0.0,
            },
            ..GatewayConfig::default()
        }
    }

    fn spawn_router(network: &MemoryNetwork, peer: &str, store: Option<Database>) -> (RouterHandle, Arc<MemoryFactory>) {
        let config = config();
        let factory = network.factory(peer, &config);
        (RouterHandle::spawn(config, factory.clone(), store), factory)
    }

    fn ops() -> ChannelDescriptor {
        ChannelDescriptor::named("ops", ChannelKind::Team, Vec::<String>::new()).unwrap()
    }

    fn alice() -> Identity {
        Identity::new("alice", "Alice")
    }

    fn recorder() -> (EventHandler, Arc<StdMutex<Vec<InboundEvent>>>) {
        crate::adapters::tests::collector()
    }

    #[tokio::test]
    async fn test_send_requires_identity_and_channel() {
        let network = MemoryNetwork::new();
        let (router, _) = spawn_router(&network, "alice", None);
        let channel_id = ChannelId::new("team:ops").unwrap();

        let err = router.send(channel_id.clone(), "hi".into(), vec![]).await.unwrap_err();
        assert_eq!(err, GatewayError::Send(SendError::NotConnected));
        assert_eq!(
            router.create_channel(ops()).await.unwrap_err(),
            GatewayError::Channel(ChannelError::NotConnected)
        );

        router.connect(None, alice()).await.unwrap();
        let err = router.send(channel_id, "hi".into(), vec![]).await.unwrap_err();
        assert!(matches!(err, GatewayError::Send(SendError::UnknownChannel(_))));
    }

    #[tokio::test]
    async fn test_send_reaches_subscriber_on_peer() {
        let network = MemoryNetwork::new();
        let (alice_router, _) = spawn_router(&network, "alice", None);
        let (bob_router, _) = spawn_router(&network, "bob", None);
        alice_router.connect(None, alice()).await.unwrap();
        bob_router.connect(None, Identity::new("bob", "Bob")).await.unwrap();

        let channel = alice_router.create_channel(ops()).await.unwrap();
        bob_router.join_channel(channel.id().clone()).await.unwrap();
        let (handler, seen) = recorder();
        bob_router.subscribe(channel.id().clone(), handler).await.unwrap();
        alice_router.wait_for_status(|s| s.ready).await.unwrap();
        bob_router.wait_for_status(|s| s.ready).await.unwrap();

        let sent = alice_router
            .send(channel.id().clone(), "hello".into(), vec![])
            .await
            .unwrap();
        assert!(matches!(
            sent.status(),
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
        ));
        assert!(wait_for(&seen, |events| events.iter().any(|e| matches!(
            e,
            InboundEvent::Message(m) if m.content == "hello" && m.sender_id == "alice"
        )))
        .await);
        assert_eq!(bob_router.messages(channel.id().clone()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gossip_send_returns_delivered() {
        let network = MemoryNetwork::new();
        let (router, _) = spawn_router(&network, "alice", None);
        router.connect(None, alice()).await.unwrap();
        let channel = router.create_channel(ops()).await.unwrap();
        let (handler, seen) = recorder();
        router.subscribe(channel.id().clone(), handler).await.unwrap();
        router.wait_for_status(|s| s.ready).await.unwrap();

        // A successful gossip publish counts as delivery, and that receipt
        // reaches the router before the send itself completes
        let sent = router
            .send(channel.id().clone(), "hello".into(), vec![])
            .await
            .unwrap();
        assert_eq!(sent.status(), MessageStatus::Delivered);
        assert!(wait_for(&seen, |events| events.iter().any(|e| matches!(
            e,
            InboundEvent::Receipt(r) if r.message_id == sent.id && r.kind == ReceiptKind::Delivered
        )))
        .await);
        assert!(router.outbox().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_send_fails_and_retry_uses_new_id() {
        let network = MemoryNetwork::new();
        let (router, factory) = spawn_router(&network, "alice", None);
        router.connect(None, alice()).await.unwrap();
        let channel = router.create_channel(ops()).await.unwrap();
        router.wait_for_status(|s| s.ready).await.unwrap();

        let backend = factory.backend(ProviderKind::P2p);
        backend.fail_publishes(Some(BackendError::Rejected("channel full".into())));
        let err = router
            .send(channel.id().clone(), "one".into(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Send(SendError::Rejected(_))));
        let status = router.wait_for_status(|s| s.failed == 1).await.unwrap();
        assert_eq!(status.queued, 0);

        let outbox = router.outbox().await.unwrap();
        let failed = outbox[0].message.clone();
        assert_eq!(failed.status(), MessageStatus::Failed);
        assert_eq!(outbox[0].attempts, 1);

        // Not retried by itself
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(router.outbox().await.unwrap()[0].attempts, 1);

        backend.fail_publishes(None);
        let retried = router.retry(failed.id).await.unwrap();
        assert_ne!(retried.id, failed.id);
        assert_eq!(retried.content, "one");
        assert!(matches!(
            retried.status(),
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
        ));
        assert!(router.outbox().await.unwrap().is_empty());
        assert!(matches!(
            router.retry(failed.id).await.unwrap_err(),
            GatewayError::Send(SendError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_leave_drops_queued_entries() {
        let network = MemoryNetwork::new();
        let (router, factory) = spawn_router(&network, "alice", None);
        router.connect(None, alice()).await.unwrap();
        let channel = router.create_channel(ops()).await.unwrap();
        router.wait_for_status(|s| s.ready).await.unwrap();

        factory.backend(ProviderKind::P2p).set_unreachable(true);
        factory.backend(ProviderKind::P2p).drop_link();
        router.wait_for_status(|s| !s.ready).await.unwrap();
        let pending = router
            .send(channel.id().clone(), "later".into(), vec![])
            .await
            .unwrap();
        assert_eq!(pending.status(), MessageStatus::Pending);
        router.wait_for_status(|s| s.queued == 1).await.unwrap();

        router.leave_channel(channel.id().clone()).await.unwrap();
        assert!(router.outbox().await.unwrap().is_empty());
        assert!(router.channels().await.unwrap().is_empty());
        assert_eq!(
            router.leave_channel(channel.id().clone()).await.unwrap_err(),
            GatewayError::Channel(ChannelError::Unknown(channel.id().clone()))
        );
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let network = MemoryNetwork::new();

        let channel_id = {
            let (router, factory) = spawn_router(&network, "alice", Some(Database::open_at(&path).unwrap()));
            factory.backend(ProviderKind::P2p).set_unreachable(true);
            router.connect(None, alice()).await.unwrap_err();
            let channel = router.create_channel(ops()).await.unwrap();
            for text in ["a", "b"] {
                router
                    .send(channel.id().clone(), text.into(), vec![])
                    .await
                    .unwrap();
            }
            router.shutdown().await.unwrap();
            channel.id().clone()
        };

        let (router, _) = spawn_router(&network, "alice", Some(Database::open_at(&path).unwrap()));
        let status = router.status();
        assert_eq!(status.channels, 1);
        assert_eq!(status.queued, 2);

        router.connect(None, alice()).await.unwrap();
        router
            .wait_for_status(|s| s.ready && s.queued == 0)
            .await
            .unwrap();
        let contents: Vec<String> = router
            .messages(channel_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, ["a", "b"]);
        assert!(Database::open_at(&path).unwrap().load_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_only_busy_channels() {
        let network = MemoryNetwork::new();
        let (router, factory) = spawn_router(&network, "alice", None);
        router.connect(None, alice()).await.unwrap();
        let idle = router.create_channel(ops()).await.unwrap();
        let watched = router
            .join_channel(ChannelId::new("team:watch").unwrap())
            .await
            .unwrap();
        let (handler, _) = recorder();
        router.subscribe(watched.id().clone(), handler).await.unwrap();
        let busy = router
            .join_channel(ChannelId::new("team:busy").unwrap())
            .await
            .unwrap();
        router.wait_for_status(|s| s.ready).await.unwrap();

        factory.backend(ProviderKind::P2p).set_unreachable(true);
        factory.backend(ProviderKind::P2p).drop_link();
        router.wait_for_status(|s| !s.ready).await.unwrap();
        router
            .send(busy.id().clone(), "queued".into(), vec![])
            .await
            .unwrap();

        router.disconnect().await.unwrap();
        router
            .wait_for_status(|s| s.connection == ConnectionState::Disconnected)
            .await
            .unwrap();
        let kept: Vec<ChannelId> = router
            .channels()
            .await
            .unwrap()
            .iter()
            .map(|c| c.id().clone())
            .collect();
        assert!(!kept.contains(idle.id()));
        assert!(kept.contains(watched.id()));
        assert!(kept.contains(busy.id()));

        // Identity survives a disconnect, so sends keep queueing
        let pending = router
            .send(busy.id().clone(), "still queued".into(), vec![])
            .await
            .unwrap();
        assert_eq!(pending.status(), MessageStatus::Pending);
        router.wait_for_status(|s| s.queued == 2).await.unwrap();
    }
}
