//! Channels the router tracks, each with a bounded buffer of rendered
//! messages.

use std::collections::{BTreeMap, HashSet, VecDeque};

use beacon_shared::{Channel, ChannelId, ChannelKind, Message, MessageId, MessageStatus};

struct ChannelRecord {
    channel: Channel,
    buffer: VecDeque<Message>,
    ids: HashSet<MessageId>,
}

pub(crate) struct Registry {
    channels: BTreeMap<ChannelId, ChannelRecord>,
    buffer_capacity: usize,
}

impl Registry {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            channels: BTreeMap::new(),
            buffer_capacity: buffer_capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.contains_key(id)
    }

    pub fn get(&self, id: &ChannelId) -> Option<&Channel> {
        self.channels.get(id).map(|r| &r.channel)
    }

    /// Returns false if the id was already tracked.
    pub fn insert(&mut self, channel: Channel) -> bool {
        if self.channels.contains_key(channel.id()) {
            return false;
        }
        self.channels.insert(
            channel.id().clone(),
            ChannelRecord {
                channel,
                buffer: VecDeque::new(),
                ids: HashSet::new(),
            },
        );
        true
    }

    pub fn remove(&mut self, id: &ChannelId) -> Option<Channel> {
        self.channels.remove(id).map(|r| r.channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values().map(|r| &r.channel)
    }

    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.keys().cloned().collect()
    }

    pub fn of_kind(&self, kind: ChannelKind) -> Vec<Channel> {
        self.channels()
            .filter(|c| c.kind() == kind)
            .cloned()
            .collect()
    }

    /// Buffer a message. Returns false for an id already buffered or an
    /// untracked channel.
    pub fn record(&mut self, message: Message) -> bool {
        let capacity = self.buffer_capacity;
        let Some(record) = self.channels.get_mut(&message.channel_id) else {
            return false;
        };
        if !record.ids.insert(message.id) {
            return false;
        }
        record.buffer.push_back(message);
        while record.buffer.len() > capacity {
            if let Some(evicted) = record.buffer.pop_front() {
                record.ids.remove(&evicted.id);
            }
        }
        true
    }

    /// Move a buffered message forward. Returns whether its status changed.
    pub fn advance(&mut self, channel: &ChannelId, id: &MessageId, status: MessageStatus) -> bool {
        let Some(record) = self.channels.get_mut(channel) else {
            return false;
        };
        if !record.ids.contains(id) {
            return false;
        }
        record
            .buffer
            .iter_mut()
            .rev()
            .find(|m| m.id == *id)
            .map_or(false, |m| m.advance(status))
    }

    pub fn messages(&self, channel: &ChannelId) -> Vec<Message> {
        self.channels
            .get(channel)
            .map(|r| r.buffer.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use beacon_shared::Identity;

    use super::*;

    fn message(channel: &ChannelId) -> Message {
        Message::draft(
            MessageId::new(),
            channel.clone(),
            &Identity::new("bob", "Bob"),
            "hi".into(),
            vec![],
            Utc::now(),
        )
        .received()
    }

    #[test]
    fn test_buffer_dedup_and_bound() {
        let id = ChannelId::new("team:ops").unwrap();
        let mut registry = Registry::new(2);
        assert!(registry.insert(Channel::joined(id.clone(), 1024)));
        assert!(!registry.insert(Channel::joined(id.clone(), 1024)));

        let first = message(&id);
        assert!(registry.record(first.clone()));
        assert!(!registry.record(first.clone()));
        registry.record(message(&id));
        registry.record(message(&id));

        let buffered = registry.messages(&id);
        assert_eq!(buffered.len(), 2);
        assert!(buffered.iter().all(|m| m.id != first.id));
        // Evicted ids may be buffered again
        assert!(registry.record(first));
    }

    #[test]
    fn test_receipts_only_move_forward() {
        let id = ChannelId::new("team:ops").unwrap();
        let mut registry = Registry::new(10);
        registry.insert(Channel::joined(id.clone(), 1024));
        let m = message(&id);
        registry.record(m.clone());

        assert!(registry.advance(&id, &m.id, MessageStatus::Read));
        assert!(!registry.advance(&id, &m.id, MessageStatus::Delivered));
        assert_eq!(registry.messages(&id)[0].status(), MessageStatus::Read);
        assert!(!registry.record(message(&ChannelId::new("team:other").unwrap())));
    }
}
