//! Relay envelopes: each wire envelope rides as base64 content of a signed
//! NIP-01 event tagged with the channel topic.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};

use beacon_net::NostrEvent;
use beacon_shared::constants::{NOSTR_KIND_CHANNEL_MESSAGE, NOSTR_KIND_PRESENCE};
use beacon_shared::error::ProtocolError;
use beacon_shared::identity::NodeKeys;
use beacon_shared::protocol::WireEnvelope;
use beacon_shared::{Capabilities, EncryptionLevel, ProviderKind};

use super::codec::EnvelopeCodec;

pub struct RelayCodec {
    keys: Arc<NodeKeys>,
}

impl RelayCodec {
    pub fn new(keys: Arc<NodeKeys>) -> Self {
        Self { keys }
    }
}

impl EnvelopeCodec for RelayCodec {
    const KIND: ProviderKind = ProviderKind::Relay;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            read_receipts: false,
            delivery_receipts: false,
            implicit_delivery: false,
            presence: true,
            max_encryption: EncryptionLevel::Standard,
        }
    }

    fn seal(&self, envelope: &WireEnvelope) -> Result<Vec<u8>, ProtocolError> {
        let kind = match envelope {
            WireEnvelope::Presence(_) => NOSTR_KIND_PRESENCE,
            _ => NOSTR_KIND_CHANNEL_MESSAGE,
        };
        let tags = vec![vec!["t".to_string(), envelope.channel_id().to_topic()]];
        let content = STANDARD.encode(envelope.to_bytes()?);
        let event = NostrEvent::sign(&self.keys, kind, tags, content);
        Ok(serde_json::to_vec(&event)?)
    }

    fn open(&self, data: &[u8]) -> Result<WireEnvelope, ProtocolError> {
        let event: NostrEvent = serde_json::from_slice(data)?;
        event
            .verify()
            .map_err(|e| ProtocolError::Serialization(format!("event {}: {e}", event.id)))?;
        let raw = STANDARD
            .decode(event.content.as_bytes())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let envelope = WireEnvelope::from_bytes(&raw)?;
        if event.tag("t") != Some(envelope.channel_id().to_topic().as_str()) {
            return Err(ProtocolError::UnexpectedFrame(
                "topic tag does not match envelope channel".into(),
            ));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use beacon_shared::protocol::PresenceEnvelope;
    use beacon_shared::{ChannelId, PresenceStatus};

    use super::*;

    fn presence() -> WireEnvelope {
        WireEnvelope::Presence(PresenceEnvelope {
            channel_id: ChannelId::new("team:ops").unwrap(),
            member_id: "alice".into(),
            display_name: "Alice".into(),
            status: PresenceStatus::Online,
            at: Utc::now(),
        })
    }

    #[test]
    fn test_seal_signs_and_tags() {
        let codec = RelayCodec::new(Arc::new(NodeKeys::generate()));
        let sealed = codec.seal(&presence()).unwrap();

        let event: NostrEvent = serde_json::from_slice(&sealed).unwrap();
        assert_eq!(event.kind, NOSTR_KIND_PRESENCE);
        assert_eq!(event.tag("t"), Some("beacon/channel/team:ops"));
        assert!(event.verify().is_ok());

        let opened = codec.open(&sealed).unwrap();
        assert_eq!(opened.origin(), "alice");
    }

    #[test]
    fn test_tampered_event_rejected() {
        let codec = RelayCodec::new(Arc::new(NodeKeys::generate()));
        let mut event: NostrEvent = serde_json::from_slice(&codec.seal(&presence()).unwrap()).unwrap();
        event.tags = vec![vec!["t".into(), "beacon/channel/team:other".into()]];
        assert!(codec.open(&serde_json::to_vec(&event).unwrap()).is_err());
    }
}
