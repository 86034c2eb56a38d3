//! In-process backend for local development and tests.
//!
//! A `MemoryHub` plays the role of the network: every `MemoryBackend`
//! attached to it can publish to topics and receives the envelopes other
//! backends publish. Backends expose fault injection knobs so link loss,
//! slow publishes and rejections can be reproduced deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::backend::{BackendClient, BackendError, BackendNotification, NOTIFICATION_BUFFER};

struct Link {
    peer: String,
    tx: mpsc::Sender<BackendNotification>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct HubState {
    next_link: u64,
    links: HashMap<u64, Link>,
}

/// Shared routing table. Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // A poisoned hub only means a test panicked mid-route
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attach(&self, peer: &str, tx: mpsc::Sender<BackendNotification>) -> u64 {
        let mut state = self.lock();
        state.next_link += 1;
        let id = state.next_link;
        for link in state.links.values() {
            let _ = link.tx.try_send(BackendNotification::PeerJoined {
                peer: peer.to_string(),
            });
        }
        state.links.insert(
            id,
            Link {
                peer: peer.to_string(),
                tx,
                topics: HashSet::new(),
            },
        );
        id
    }

    fn detach(&self, id: u64, reason: Option<String>) {
        let mut state = self.lock();
        let Some(link) = state.links.remove(&id) else {
            return;
        };
        if let Some(reason) = reason {
            let _ = link.tx.try_send(BackendNotification::ConnectionLost { reason });
        }
        for other in state.links.values() {
            let _ = other.tx.try_send(BackendNotification::PeerLeft {
                peer: link.peer.clone(),
            });
        }
    }

    fn set_subscribed(&self, id: u64, topic: &str, subscribed: bool) -> bool {
        let mut state = self.lock();
        let Some(link) = state.links.get_mut(&id) else {
            return false;
        };
        if subscribed {
            link.topics.insert(topic.to_string());
        } else {
            link.topics.remove(topic);
        }
        true
    }

    fn route(&self, from: Option<u64>, source: &str, topic: &str, data: &[u8]) -> usize {
        let state = self.lock();
        let mut delivered = 0;
        for (id, link) in state.links.iter() {
            if Some(*id) == from || !link.topics.contains(topic) {
                continue;
            }
            let sent = link.tx.try_send(BackendNotification::Envelope {
                topic: topic.to_string(),
                source: Some(source.to_string()),
                data: data.to_vec(),
            });
            if sent.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver `data` to every subscriber of `topic` as if `source` had
    /// published it. Returns the number of recipients.
    pub fn inject(&self, topic: &str, source: &str, data: Vec<u8>) -> usize {
        self.route(None, source, topic, &data)
    }

    /// Number of live links subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .links
            .values()
            .filter(|l| l.topics.contains(topic))
            .count()
    }
}

#[derive(Default)]
struct Faults {
    unreachable: bool,
    connect_delay: Duration,
    publish_delay: Duration,
    publish_error: Option<BackendError>,
    connect_attempts: usize,
    published: Vec<(String, Vec<u8>)>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// One client attached to a [`MemoryHub`].
pub struct MemoryBackend {
    hub: MemoryHub,
    peer: String,
    link: Mutex<Option<u64>>,
    faults: Mutex<Faults>,
}

impl MemoryBackend {
    pub fn new(hub: &MemoryHub, peer: impl Into<String>) -> Self {
        Self {
            hub: hub.clone(),
            peer: peer.into(),
            link: Mutex::new(None),
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_link(&self) -> Option<u64> {
        *self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_link(&self) -> Option<u64> {
        self.link.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults().unreachable = unreachable;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.faults().connect_delay = delay;
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        self.faults().publish_delay = delay;
    }

    /// Make every subsequent publish fail with `error` (or succeed again
    /// with `None`).
    pub fn fail_publishes(&self, error: Option<BackendError>) {
        self.faults().publish_error = error;
    }

    /// Simulate a network failure: the session ends with `ConnectionLost`.
    pub fn drop_link(&self) {
        if let Some(id) = self.take_link() {
            self.hub.detach(id, Some("link dropped".into()));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current_link().is_some()
    }

    pub fn connect_attempts(&self) -> usize {
        self.faults().connect_attempts
    }

    /// Successful publishes in completion order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.faults().published.clone()
    }

    /// Highest number of publishes that were in progress at once on `topic`.
    pub fn max_concurrent_publishes(&self, topic: &str) -> usize {
        self.faults().max_in_flight.get(topic).copied().unwrap_or(0)
    }

    pub fn publishes_in_flight(&self, topic: &str) -> usize {
        self.faults().in_flight.get(topic).copied().unwrap_or(0)
    }
}

/// Counts one publish on a topic as in progress until dropped, including
/// when the caller's future is cancelled mid-delay.
struct InFlight<'a> {
    backend: &'a MemoryBackend,
    topic: String,
}

impl<'a> InFlight<'a> {
    fn enter(backend: &'a MemoryBackend, topic: &str) -> (Self, Duration) {
        let mut faults = backend.faults();
        let now = {
            let n = faults.in_flight.entry(topic.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let max = faults.max_in_flight.entry(topic.to_string()).or_insert(0);
        *max = (*max).max(now);
        let delay = faults.publish_delay;
        drop(faults);
        (
            Self {
                backend,
                topic: topic.to_string(),
            },
            delay,
        )
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(n) = self.backend.faults().in_flight.get_mut(&self.topic) {
            *n = n.saturating_sub(1);
        }
    }
}

#[async_trait]
impl BackendClient for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(
        &self,
        _endpoints: &[String],
    ) -> Result<mpsc::Receiver<BackendNotification>, BackendError> {
        let (delay, unreachable) = {
            let mut faults = self.faults();
            faults.connect_attempts += 1;
            (faults.connect_delay, faults.unreachable)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(BackendError::Unreachable(format!("{} is offline", self.peer)));
        }

        self.disconnect();
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let id = self.hub.attach(&self.peer, tx);
        *self.link.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
        debug!(peer = %self.peer, link = id, "Memory backend attached");
        Ok(rx)
    }

    fn disconnect(&self) {
        if let Some(id) = self.take_link() {
            self.hub.detach(id, None);
        }
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), BackendError> {
        if self.current_link().is_none() {
            return Err(BackendError::NotConnected);
        }

        let (guard, delay) = InFlight::enter(self, topic);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        drop(guard);

        let error = self.faults().publish_error.clone();

        // The link may have dropped while the publish was in progress
        let Some(link) = self.current_link() else {
            return Err(BackendError::NotConnected);
        };
        if let Some(e) = error {
            return Err(e);
        }

        self.faults().published.push((topic.to_string(), data.clone()));
        self.hub.route(Some(link), &self.peer, topic, &data);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BackendError> {
        let id = self.current_link().ok_or(BackendError::NotConnected)?;
        if self.hub.set_subscribed(id, topic, true) {
            Ok(())
        } else {
            Err(BackendError::NotConnected)
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BackendError> {
        let id = self.current_link().ok_or(BackendError::NotConnected)?;
        self.hub.set_subscribed(id, topic, false);
        Ok(())
    }
}
