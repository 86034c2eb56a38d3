use beacon_shared::error::ProtocolError;
use beacon_shared::protocol::WireEnvelope;
use beacon_shared::{Capabilities, EncryptionLevel, ProviderKind};

use super::codec::EnvelopeCodec;

/// Envelopes for the post-quantum hub. The Noise session already seals
/// every frame, so the payload is plain bincode.
#[derive(Debug, Default)]
pub struct SecureCodec;

impl EnvelopeCodec for SecureCodec {
    const KIND: ProviderKind = ProviderKind::Secure;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            read_receipts: true,
            delivery_receipts: true,
            implicit_delivery: false,
            presence: true,
            max_encryption: EncryptionLevel::PostQuantum,
        }
    }

    fn pqc_transport(&self) -> bool {
        true
    }

    fn seal(&self, envelope: &WireEnvelope) -> Result<Vec<u8>, ProtocolError> {
        envelope.to_bytes()
    }

    fn open(&self, data: &[u8]) -> Result<WireEnvelope, ProtocolError> {
        WireEnvelope::from_bytes(data)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use beacon_net::{MemoryBackend, MemoryHub};
    use beacon_shared::{
        ChannelDescriptor, ChannelKind, Identity, InboundEvent, MessageStatus, ReceiptKind,
    };

    use super::*;
    use crate::adapters::tests::{collector, config, wait_for};
    use crate::adapters::{Adapter, SecureAdapter};
    use crate::provider::ChatProvider;

    fn secure(hub: &MemoryHub, peer: &str) -> SecureAdapter {
        Adapter::new(SecureCodec, Arc::new(MemoryBackend::new(hub, peer)), config())
    }

    #[tokio::test]
    async fn test_receipts_flow_back_to_sender() {
        let hub = MemoryHub::new();
        let alice = secure(&hub, "alice");
        let bob = secure(&hub, "bob");
        alice.connect(&Identity::new("alice", "Alice"), &[]).await.unwrap();
        bob.connect(&Identity::new("bob", "Bob"), &[]).await.unwrap();

        let pq = ChannelDescriptor::named("ops", ChannelKind::Team, Vec::<String>::new())
            .unwrap()
            .with_encryption(EncryptionLevel::PostQuantum);
        let channel = alice.create_channel(pq).await.unwrap();
        bob.join_channel(channel.id()).await.unwrap();

        let (alice_handler, alice_seen) = collector();
        alice.subscribe(channel.id(), alice_handler);
        let (bob_handler, bob_seen) = collector();
        bob.subscribe(channel.id(), bob_handler);

        let sent = alice.send(channel.id(), "status?".into(), vec![]).await.unwrap();
        assert!(sent.security.pqc_encrypted);
        assert_eq!(sent.status(), MessageStatus::Sent);

        assert!(wait_for(&alice_seen, |evs| evs.iter().any(|e| matches!(
            e,
            InboundEvent::Receipt(r) if r.message_id == sent.id && r.kind == ReceiptKind::Delivered
        )))
        .await);
        assert!(wait_for(&bob_seen, |evs| evs.iter().any(|e| matches!(e, InboundEvent::Message(_)))).await);

        bob.mark_read(channel.id(), &[sent.id]).await.unwrap();
        assert!(wait_for(&alice_seen, |evs| evs.iter().any(|e| matches!(
            e,
            InboundEvent::Receipt(r) if r.message_id == sent.id && r.kind == ReceiptKind::Read
        )))
        .await);
    }
}
