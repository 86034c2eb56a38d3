//! End-to-end behaviour of the gateway over the in-process memory network.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_gateway::{
    BackoffConfig, EmergencyEvent, Gateway, GatewayConfig, MemoryFactory, MemoryNetwork,
};
use beacon_net::BackendError;
use beacon_shared::protocol::{EmergencyAction, EmergencyNotice};
use beacon_shared::{
    ChannelId, ChannelKind, ConnectionState, GatewayError, Identity, InboundEvent, Message,
    MessageStatus, ProviderKind, SendError, StateError, Urgency,
};

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

fn node(network: &MemoryNetwork, peer: &str, config: GatewayConfig) -> (Gateway, Arc<MemoryFactory>) {
    let factory = network.factory(peer, &config);
    (Gateway::with_store(config, factory.clone(), None), factory)
}

fn identity(id: &str) -> Identity {
    Identity::new(id, id.to_uppercase())
}

/// Collects chat messages a gateway receives on `channel`.
async fn inbox(gateway: &Gateway, channel: &ChannelId) -> Arc<Mutex<Vec<Message>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    gateway
        .on_message(channel.clone(), move |event| {
            if let InboundEvent::Message(m) = event {
                sink.lock().unwrap().push(m.clone());
            }
        })
        .await
        .unwrap();
    seen
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

fn contents(messages: &Arc<Mutex<Vec<Message>>>) -> Vec<String> {
    messages.lock().unwrap().iter().map(|m| m.content.clone()).collect()
}

async fn ready(gateway: &Gateway) {
    gateway.router().wait_for_status(|s| s.ready).await.unwrap();
}

#[tokio::test]
async fn test_sends_on_one_channel_never_overlap() {
    let network = MemoryNetwork::new();
    let (alice, alice_net) = node(&network, "alice", config());
    let (bob, _) = node(&network, "bob", config());
    alice.connect(None, identity("alice")).await.unwrap();
    bob.connect(None, identity("bob")).await.unwrap();

    let channel = alice.create_channel("ops", ChannelKind::Team, vec![]).await.unwrap();
    bob.join_channel(channel.id().clone()).await.unwrap();
    let received = inbox(&bob, channel.id()).await;
    ready(&alice).await;
    ready(&bob).await;

    let backend = alice_net.backend(ProviderKind::P2p);
    backend.set_publish_delay(Duration::from_millis(20));
    let sends = ["one", "two", "three", "four", "five"]
        .into_iter()
        .map(|text| alice.send_message(channel.id().clone(), text, vec![]));
    for result in futures::future::join_all(sends).await {
        result.unwrap();
    }

    alice
        .router()
        .wait_for_status(|s| s.queued == 0)
        .await
        .unwrap();
    assert!(wait_until(|| received.lock().unwrap().len() == 5).await);
    assert_eq!(contents(&received), ["one", "two", "three", "four", "five"]);

    let topic = backend.published().last().map(|(topic, _)| topic.clone()).unwrap();
    assert_eq!(backend.max_concurrent_publishes(&topic), 1);
}

#[tokio::test]
async fn test_queued_messages_replay_once_in_order() {
    let network = MemoryNetwork::new();
    let (alice, alice_net) = node(&network, "alice", config());
    let (bob, _) = node(&network, "bob", config());
    bob.connect(None, identity("bob")).await.unwrap();
    let channel_id = ChannelId::for_name(ChannelKind::Team, "ops").unwrap();
    bob.join_channel(channel_id.clone()).await.unwrap();
    let received = inbox(&bob, &channel_id).await;
    ready(&bob).await;

    let backend = alice_net.backend(ProviderKind::P2p);
    backend.set_unreachable(true);
    assert!(alice.connect(None, identity("alice")).await.is_err());
    alice.create_channel("ops", ChannelKind::Team, vec![]).await.unwrap();

    for text in ["a", "b", "c"] {
        let pending = alice.send_message(channel_id.clone(), text, vec![]).await.unwrap();
        assert_eq!(pending.status(), MessageStatus::Pending);
    }
    assert_eq!(alice.outbox().await.unwrap().len(), 3);
    alice
        .router()
        .wait_for_status(|s| s.connection == ConnectionState::Error)
        .await
        .unwrap();

    backend.set_unreachable(false);
    alice
        .router()
        .wait_for_status(|s| s.ready && s.queued == 0)
        .await
        .unwrap();
    assert!(wait_until(|| received.lock().unwrap().len() == 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(contents(&received), ["a", "b", "c"]);

    let sent = alice.messages(channel_id).await.unwrap();
    assert!(sent.iter().all(|m| m.status() != MessageStatus::Pending));
}

#[tokio::test]
async fn test_single_active_emergency() {
    let network = MemoryNetwork::new();
    let (gateway, _) = node(&network, "alice", config());
    gateway.connect(None, identity("alice")).await.unwrap();

    gateway
        .declare_emergency("grid failure", Urgency::Critical)
        .await
        .unwrap();
    let err = gateway
        .declare_emergency("flood", Urgency::Elevated)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::State(StateError::AlreadyActive { .. })));

    let state = gateway.emergency_state();
    assert!(state.active);
    assert_eq!(state.reason.as_deref(), Some("grid failure"));
    assert_eq!(state.urgency, Some(Urgency::Critical));
    assert_eq!(state.declared_by.as_deref(), Some("alice"));

    gateway.resolve_emergency().await.unwrap();
    assert!(!gateway.emergency_state().active);
    gateway
        .declare_emergency("flood", Urgency::Elevated)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_switch_carries_queue_and_membership() {
    let network = MemoryNetwork::new();
    let (alice, alice_net) = node(&network, "alice", config());
    let (bob, _) = node(&network, "bob", config());

    bob.connect(Some(ProviderKind::Relay), identity("bob")).await.unwrap();
    alice.connect(None, identity("alice")).await.unwrap();
    let channel = alice.create_channel("ops", ChannelKind::Team, vec![]).await.unwrap();
    bob.join_channel(channel.id().clone()).await.unwrap();
    let received = inbox(&bob, channel.id()).await;
    ready(&alice).await;
    ready(&bob).await;

    let p2p = alice_net.backend(ProviderKind::P2p);
    p2p.set_unreachable(true);
    p2p.drop_link();
    alice.router().wait_for_status(|s| !s.ready).await.unwrap();
    for text in ["first", "second"] {
        let pending = alice.send_message(channel.id().clone(), text, vec![]).await.unwrap();
        assert_eq!(pending.status(), MessageStatus::Pending);
    }

    let state = alice.switch_provider(ProviderKind::Relay).await.unwrap();
    assert_eq!(state, ConnectionState::Connected);
    let status = alice
        .router()
        .wait_for_status(|s| s.ready && s.queued == 0)
        .await
        .unwrap();
    assert_eq!(status.provider, ProviderKind::Relay);
    assert!(wait_until(|| received.lock().unwrap().len() == 2).await);
    assert_eq!(contents(&received), ["first", "second"]);

    let channels = alice.channels().await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].id(), channel.id());
}

#[tokio::test]
async fn test_switch_lets_in_flight_send_finish_on_previous_provider() {
    let network = MemoryNetwork::new();
    let patient = GatewayConfig {
        send_timeout: Duration::from_secs(3),
        switch_grace: Duration::from_secs(1),
        ..config()
    };
    let (alice, alice_net) = node(&network, "alice", patient.clone());
    let (bob, _) = node(&network, "bob", patient);

    alice.connect(None, identity("alice")).await.unwrap();
    bob.connect(None, identity("bob")).await.unwrap();
    let channel = alice.create_channel("ops", ChannelKind::Team, vec![]).await.unwrap();
    bob.join_channel(channel.id().clone()).await.unwrap();
    let received = inbox(&bob, channel.id()).await;
    ready(&alice).await;
    ready(&bob).await;

    let p2p = alice_net.backend(ProviderKind::P2p);
    let topic = channel.id().to_topic();
    p2p.set_publish_delay(Duration::from_millis(300));
    let router = alice.router().clone();
    let id = channel.id().clone();
    let send = tokio::spawn(async move { router.send(id, "in flight".into(), vec![]).await });
    assert!(wait_until(|| p2p.publishes_in_flight(&topic) == 1).await);

    alice.switch_provider(ProviderKind::Relay).await.unwrap();
    let status = alice
        .router()
        .wait_for_status(|s| s.provider == ProviderKind::Relay)
        .await
        .unwrap();
    assert_eq!(status.draining, Some(ProviderKind::P2p));

    let sent = send.await.unwrap().unwrap();
    assert!(matches!(sent.status(), MessageStatus::Sent | MessageStatus::Delivered));
    let status = alice
        .router()
        .wait_for_status(|s| s.draining.is_none())
        .await
        .unwrap();
    assert_eq!(status.queued, 0);
    assert_eq!(status.failed, 0);
    assert!(wait_until(|| received.lock().unwrap().len() == 1).await);
    assert_eq!(contents(&received), ["in flight"]);
    assert!(p2p.published().iter().any(|(t, _)| *t == channel.id().to_topic()));
}

#[tokio::test]
async fn test_switch_grace_expiry_requeues_in_flight_send() {
    let network = MemoryNetwork::new();
    let hasty = GatewayConfig {
        send_timeout: Duration::from_secs(3),
        switch_grace: Duration::from_millis(200),
        ..config()
    };
    let (alice, alice_net) = node(&network, "alice", hasty.clone());
    let (bob, _) = node(&network, "bob", hasty);

    bob.connect(Some(ProviderKind::Relay), identity("bob")).await.unwrap();
    alice.connect(None, identity("alice")).await.unwrap();
    let channel = alice.create_channel("ops", ChannelKind::Team, vec![]).await.unwrap();
    bob.join_channel(channel.id().clone()).await.unwrap();
    let received = inbox(&bob, channel.id()).await;
    ready(&alice).await;
    ready(&bob).await;

    let p2p = alice_net.backend(ProviderKind::P2p);
    let topic = channel.id().to_topic();
    p2p.set_publish_delay(Duration::from_secs(1));
    let router = alice.router().clone();
    let id = channel.id().clone();
    let send = tokio::spawn(async move { router.send(id, "stuck".into(), vec![]).await });
    assert!(wait_until(|| p2p.publishes_in_flight(&topic) == 1).await);

    alice.switch_provider(ProviderKind::Relay).await.unwrap();
    let status = alice
        .router()
        .wait_for_status(|s| s.provider == ProviderKind::Relay)
        .await
        .unwrap();
    assert_eq!(status.draining, Some(ProviderKind::P2p));

    // The grace period ends long before the slow publish does
    alice
        .router()
        .wait_for_status(|s| s.draining.is_none())
        .await
        .unwrap();
    assert!(!send.is_finished());
    assert!(!p2p.is_connected());

    // The closed provider reports the send as interrupted; it is queued
    // again and goes out on the new provider
    let requeued = send.await.unwrap().unwrap();
    assert_eq!(requeued.status(), MessageStatus::Pending);
    assert!(wait_until(|| received.lock().unwrap().len() == 1).await);
    assert_eq!(contents(&received), ["stuck"]);
    assert_eq!(received.lock().unwrap()[0].id, requeued.id);

    let status = alice
        .router()
        .wait_for_status(|s| s.queued == 0)
        .await
        .unwrap();
    assert_eq!(status.failed, 0);
    assert!(alice.outbox().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_timed_out_send_fails_without_retry() {
    let network = MemoryNetwork::new();
    let (alice, alice_net) = node(&network, "alice", config());
    alice.connect(None, identity("alice")).await.unwrap();
    let channel = alice.create_channel("ops", ChannelKind::Team, vec![]).await.unwrap();
    ready(&alice).await;

    let backend = alice_net.backend(ProviderKind::P2p);
    let published_before = backend.published().len();
    backend.set_publish_delay(Duration::from_secs(2));
    let err = alice
        .send_message(channel.id().clone(), "slow", vec![])
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Send(SendError::Timeout(500)));

    backend.set_publish_delay(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(400)).await;
    let outbox = alice.outbox().await.unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].attempts, 1);
    assert_eq!(outbox[0].message.status(), MessageStatus::Failed);
    assert!(outbox[0].last_error.is_some());
    assert_eq!(alice.status().failed, 1);
    assert_eq!(backend.published().len(), published_before);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_handshake() {
    let network = MemoryNetwork::new();
    let (alice, alice_net) = node(&network, "alice", config());
    let backend = alice_net.backend(ProviderKind::P2p);
    backend.set_connect_delay(Duration::from_millis(100));

    let (first, second) = tokio::join!(
        alice.connect(None, identity("alice")),
        alice.connect(None, identity("alice")),
    );
    assert_eq!(first, Ok(ConnectionState::Connected));
    assert_eq!(second, Ok(ConnectionState::Connected));
    assert_eq!(backend.connect_attempts(), 1);

    // Already connected: no new handshake either
    alice.connect(None, identity("alice")).await.unwrap();
    assert_eq!(backend.connect_attempts(), 1);
}

#[tokio::test]
async fn test_emergency_reaches_channels_with_fallback_down() {
    let network = MemoryNetwork::new();
    let with_fallback = GatewayConfig {
        fallbacks: vec![ProviderKind::Relay],
        ..config()
    };
    let (alice, alice_net) = node(&network, "alice", with_fallback);
    let (bob, _) = node(&network, "bob", config());
    alice_net.backend(ProviderKind::Relay).set_unreachable(true);

    let degraded = Arc::new(Mutex::new(0));
    let counter = degraded.clone();
    alice.on_emergency(move |event| {
        if let EmergencyEvent::BroadcastDegraded(_) = event {
            *counter.lock().unwrap() += 1;
        }
    });

    bob.connect(None, identity("bob")).await.unwrap();
    alice.connect(None, identity("alice")).await.unwrap();
    let mut inboxes = Vec::new();
    for name in ["north", "south"] {
        let channel = alice
            .create_channel(name, ChannelKind::Emergency, vec![])
            .await
            .unwrap();
        bob.join_channel(channel.id().clone()).await.unwrap();
        inboxes.push((channel.id().clone(), inbox(&bob, channel.id()).await));
    }
    ready(&alice).await;
    ready(&bob).await;

    let outcome = alice
        .declare_emergency("grid failure", Urgency::Critical)
        .await
        .unwrap();
    assert!(outcome.state.active);
    assert!(alice.emergency_state().active);
    assert!(!outcome.report.is_degraded());
    assert_eq!(outcome.report.unavailable_fallbacks, [ProviderKind::Relay]);
    for (id, _) in &inboxes {
        let channel = outcome.report.channel(id).unwrap();
        assert_eq!(channel.delivered_by(), Some(ProviderKind::P2p));
    }

    for (_, received) in &inboxes {
        assert!(wait_until(|| received.lock().unwrap().len() == 1).await);
        let notice = EmergencyNotice::parse(&received.lock().unwrap()[0].content).unwrap();
        assert_eq!(notice.action, EmergencyAction::Declared);
        assert_eq!(notice.reason, "grid failure");
        assert_eq!(notice.urgency, Urgency::Critical);
        assert_eq!(notice.declared_by, "alice");
    }
    assert_eq!(*degraded.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_emergency_falls_back_when_active_rejects() {
    let network = MemoryNetwork::new();
    let with_fallback = GatewayConfig {
        fallbacks: vec![ProviderKind::Relay],
        ..config()
    };
    let (alice, alice_net) = node(&network, "alice", with_fallback);
    let (bob, _) = node(&network, "bob", config());

    bob.connect(Some(ProviderKind::Relay), identity("bob")).await.unwrap();
    alice.connect(None, identity("alice")).await.unwrap();
    let channel = alice
        .create_channel("north", ChannelKind::Emergency, vec![])
        .await
        .unwrap();
    bob.join_channel(channel.id().clone()).await.unwrap();
    let received = inbox(&bob, channel.id()).await;
    alice
        .router()
        .wait_for_status(|s| s.ready && s.fallbacks.iter().all(|f| f.ready))
        .await
        .unwrap();
    ready(&bob).await;

    alice_net
        .backend(ProviderKind::P2p)
        .fail_publishes(Some(BackendError::Rejected("quota".into())));
    let outcome = alice
        .declare_emergency("grid failure", Urgency::High)
        .await
        .unwrap();

    let attempts = &outcome.report.channel(channel.id()).unwrap().attempts;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].provider, ProviderKind::P2p);
    assert_eq!(attempts[1].provider, ProviderKind::Relay);
    assert_eq!(
        outcome.report.channel(channel.id()).unwrap().delivered_by(),
        Some(ProviderKind::Relay)
    );
    assert!(outcome.report.unavailable_fallbacks.is_empty());
    assert!(wait_until(|| received.lock().unwrap().len() == 1).await);
}
