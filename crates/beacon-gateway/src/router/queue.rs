//! Outbound queue: every message from the moment it is accepted until it is
//! sent, abandoned or retried under a new id.

use std::collections::{BTreeMap, HashSet};

use tokio::sync::oneshot;
use tokio::time::Instant;

use beacon_shared::{ChannelId, Message, MessageId, MessageStatus, OutboundEntry, SendError};

use super::SlotId;

pub(crate) type SendReply = oneshot::Sender<Result<Message, SendError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Queued,
    InFlight(SlotId),
    Failed,
}

pub(crate) struct QueuedSend {
    pub entry: OutboundEntry,
    pub phase: Phase,
    /// Not dispatched before this instant.
    pub due: Option<Instant>,
    /// Caller still waiting for the outcome.
    pub waiter: Option<SendReply>,
}

pub(crate) struct OutboundQueue {
    entries: BTreeMap<u64, QueuedSend>,
    next_seq: u64,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 1,
            capacity,
        }
    }

    /// Load persisted entries. In-flight state is not persisted, so
    /// everything not failed comes back queued.
    pub fn restore(&mut self, entries: Vec<OutboundEntry>) {
        for entry in entries {
            self.next_seq = self.next_seq.max(entry.seq + 1);
            let phase = if entry.is_failed() {
                Phase::Failed
            } else {
                Phase::Queued
            };
            self.entries.insert(
                entry.seq,
                QueuedSend {
                    entry,
                    phase,
                    due: None,
                    waiter: None,
                },
            );
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn push(&mut self, message: Message) -> Result<u64, SendError> {
        if self.is_full() {
            return Err(SendError::QueueFull(self.capacity));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            seq,
            QueuedSend {
                entry: OutboundEntry::new(seq, message),
                phase: Phase::Queued,
                due: None,
                waiter: None,
            },
        );
        Ok(seq)
    }

    pub fn get(&self, seq: u64) -> Option<&QueuedSend> {
        self.entries.get(&seq)
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut QueuedSend> {
        self.entries.get_mut(&seq)
    }

    pub fn remove(&mut self, seq: u64) -> Option<QueuedSend> {
        self.entries.remove(&seq)
    }

    /// Entries in send order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedSend> {
        self.entries.values()
    }

    pub fn find(&self, id: &MessageId) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, q)| q.entry.message.id == *id)
            .map(|(seq, _)| *seq)
    }

    /// Entries that may be handed to the provider now, in send order.
    ///
    /// Per channel only the oldest unfinished entry is eligible, and only
    /// when nothing else on that channel is in flight. Failed entries wait
    /// for the caller and do not hold back later ones.
    pub fn dispatchable(&self, now: Instant, joined: impl Fn(&ChannelId) -> bool) -> Vec<u64> {
        let mut blocked: HashSet<&ChannelId> = HashSet::new();
        let mut ready = Vec::new();
        for (seq, q) in &self.entries {
            let channel = &q.entry.message.channel_id;
            match q.phase {
                Phase::Failed => continue,
                Phase::InFlight(_) => {
                    blocked.insert(channel);
                }
                Phase::Queued => {
                    if !blocked.insert(channel) {
                        continue;
                    }
                    let due = q.due.map_or(true, |d| d <= now);
                    if due && joined(channel) {
                        ready.push(*seq);
                    }
                }
            }
        }
        ready
    }

    /// Earliest retry instant among queued entries.
    pub fn next_due(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|q| q.phase == Phase::Queued)
            .filter_map(|q| q.due)
            .min()
    }

    pub fn clear_delays(&mut self) {
        for q in self.entries.values_mut() {
            q.due = None;
        }
    }

    /// Drop delays that have run out.
    pub fn release_due(&mut self, now: Instant) {
        for q in self.entries.values_mut() {
            if q.due.map_or(false, |d| d <= now) {
                q.due = None;
            }
        }
    }

    pub fn in_flight_on(&self, slot: SlotId) -> usize {
        self.entries
            .values()
            .filter(|q| q.phase == Phase::InFlight(slot))
            .count()
    }

    pub fn count(&self, phase: fn(&Phase) -> bool) -> usize {
        self.entries.values().filter(|q| phase(&q.phase)).count()
    }

    pub fn has_channel(&self, channel: &ChannelId) -> bool {
        self.entries
            .values()
            .any(|q| q.entry.message.channel_id == *channel)
    }

    /// Seqs of every entry on `channel`.
    pub fn on_channel(&self, channel: &ChannelId) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, q)| q.entry.message.channel_id == *channel)
            .map(|(seq, _)| *seq)
            .collect()
    }

    /// Raise the status of a queued message from a receipt that overtook
    /// the send acknowledgement.
    pub fn advance(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        match self.find(id).and_then(|seq| self.entries.get_mut(&seq)) {
            Some(q) => q.entry.message.advance(status),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use beacon_shared::Identity;

    use super::*;

    fn message(channel: &str) -> Message {
        Message::draft(
            MessageId::new(),
            ChannelId::new(channel).unwrap(),
            &Identity::new("alice", "Alice"),
            "hi".into(),
            vec![],
            Utc::now(),
        )
    }

    #[test]
    fn test_one_in_flight_per_channel() {
        let mut queue = OutboundQueue::new(10);
        let a1 = queue.push(message("team:a")).unwrap();
        let a2 = queue.push(message("team:a")).unwrap();
        let b1 = queue.push(message("team:b")).unwrap();

        let now = Instant::now();
        assert_eq!(queue.dispatchable(now, |_| true), vec![a1, b1]);

        queue.get_mut(a1).unwrap().phase = Phase::InFlight(SlotId(1));
        queue.get_mut(b1).unwrap().phase = Phase::InFlight(SlotId(1));
        assert!(queue.dispatchable(now, |_| true).is_empty());
        assert_eq!(queue.in_flight_on(SlotId(1)), 2);

        // A failed head does not hold back the rest of the channel
        queue.get_mut(a1).unwrap().phase = Phase::Failed;
        assert_eq!(queue.dispatchable(now, |_| true), vec![a2]);
    }

    #[test]
    fn test_delayed_head_blocks_channel() {
        let mut queue = OutboundQueue::new(10);
        let a1 = queue.push(message("team:a")).unwrap();
        queue.push(message("team:a")).unwrap();

        let now = Instant::now();
        queue.get_mut(a1).unwrap().due = Some(now + Duration::from_secs(1));
        assert!(queue.dispatchable(now, |_| true).is_empty());
        assert_eq!(queue.next_due(), Some(now + Duration::from_secs(1)));

        queue.clear_delays();
        assert_eq!(queue.dispatchable(now, |_| true), vec![a1]);
        assert!(queue.dispatchable(now, |_| false).is_empty());
    }

    #[test]
    fn test_capacity_and_restore() {
        let mut queue = OutboundQueue::new(2);
        queue.push(message("team:a")).unwrap();
        queue.push(message("team:a")).unwrap();
        assert_eq!(queue.push(message("team:a")), Err(SendError::QueueFull(2)));

        let mut failed = OutboundEntry::new(7, message("team:a"));
        failed.message.advance(MessageStatus::Failed);
        let mut restored = OutboundQueue::new(10);
        restored.restore(vec![OutboundEntry::new(3, message("team:b")), failed]);
        assert_eq!(restored.count(|p| *p == Phase::Failed), 1);
        assert_eq!(restored.push(message("team:a")).unwrap(), 8);
    }
}
