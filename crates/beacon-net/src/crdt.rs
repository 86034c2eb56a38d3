//! Grow-only message set with a Lamport clock, one per channel.
//!
//! Gossip re-propagates envelopes, so the same message can arrive several
//! times and from several peers. The set makes delivery idempotent and the
//! clock gives each message a causal stamp: if a peer saw message A before
//! sending B, B's stamp is strictly greater than A's.

use std::collections::HashSet;

use beacon_shared::MessageId;

#[derive(Debug, Default, Clone)]
pub struct MessageSet {
    seen: HashSet<MessageId>,
    clock: u64,
}

impl MessageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a locally authored message and return its stamp.
    pub fn insert_local(&mut self, id: MessageId) -> u64 {
        self.clock += 1;
        self.seen.insert(id);
        self.clock
    }

    /// Merge a remote message. Returns false if it was already known.
    pub fn merge(&mut self, id: MessageId, remote_stamp: Option<u64>) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.clock = self.clock.max(remote_stamp.unwrap_or(0)) + 1;
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_are_dropped() {
        let mut set = MessageSet::new();
        let id = MessageId::new();
        assert!(set.merge(id, Some(4)));
        assert!(!set.merge(id, Some(4)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_clock_follows_causality() {
        let mut set = MessageSet::new();
        assert_eq!(set.insert_local(MessageId::new()), 1);

        set.merge(MessageId::new(), Some(10));
        assert_eq!(set.clock(), 11);

        // Stale remote stamps still advance the clock
        set.merge(MessageId::new(), Some(2));
        assert_eq!(set.clock(), 12);

        assert_eq!(set.insert_local(MessageId::new()), 13);
    }

    #[test]
    fn test_own_message_echo_is_duplicate() {
        let mut set = MessageSet::new();
        let id = MessageId::new();
        let stamp = set.insert_local(id);
        assert!(!set.merge(id, Some(stamp)));
        assert!(set.contains(&id));
    }
}
