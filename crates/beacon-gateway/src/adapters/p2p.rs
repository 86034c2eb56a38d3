//! Gossip mesh envelopes: bincode on the wire, a grow-only message set per
//! channel for dedup and causal stamps.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use beacon_net::MessageSet;
use beacon_shared::error::ProtocolError;
use beacon_shared::protocol::{ChatEnvelope, WireEnvelope};
use beacon_shared::{Capabilities, ChannelId, EncryptionLevel, ProviderKind};

use super::codec::EnvelopeCodec;

#[derive(Default)]
pub struct P2pCodec {
    sets: Mutex<HashMap<ChannelId, MessageSet>>,
}

impl P2pCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn sets(&self) -> MutexGuard<'_, HashMap<ChannelId, MessageSet>> {
        self.sets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EnvelopeCodec for P2pCodec {
    const KIND: ProviderKind = ProviderKind::P2p;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            read_receipts: false,
            delivery_receipts: false,
            implicit_delivery: true,
            presence: true,
            max_encryption: EncryptionLevel::Standard,
        }
    }

    fn seal(&self, envelope: &WireEnvelope) -> Result<Vec<u8>, ProtocolError> {
        envelope.to_bytes()
    }

    fn open(&self, data: &[u8]) -> Result<WireEnvelope, ProtocolError> {
        WireEnvelope::from_bytes(data)
    }

    fn stamp_outbound(&self, chat: &mut ChatEnvelope) {
        let stamp = self
            .sets()
            .entry(chat.channel_id.clone())
            .or_default()
            .insert_local(chat.message_id);
        chat.causal_stamp = Some(stamp);
    }

    fn accept_inbound(&self, chat: &ChatEnvelope) -> bool {
        self.sets()
            .entry(chat.channel_id.clone())
            .or_default()
            .merge(chat.message_id, chat.causal_stamp)
    }

    fn forget_channel(&self, id: &ChannelId) {
        self.sets().remove(id);
    }
}
