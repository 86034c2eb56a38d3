use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{Attachment, ChannelId, MessageId, PresenceStatus, ReceiptKind, Urgency};

/// Payload published on a channel topic by every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireEnvelope {
    /// Chat message, body possibly sealed
    Chat(ChatEnvelope),

    /// Delivery or read receipt
    Receipt(ReceiptEnvelope),

    /// Member online/offline on a channel
    Presence(PresenceEnvelope),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEnvelope {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: String,
    pub sender_display_name: String,
    pub timestamp: DateTime<Utc>,
    /// bincode [`ChatBody`], XChaCha20-Poly1305 sealed when `encrypted`
    pub body: Vec<u8>,
    pub encrypted: bool,
    /// Lamport stamp from the P2P message set
    pub causal_stamp: Option<u64>,
}

/// Plaintext part of a chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatBody {
    pub content: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptEnvelope {
    pub channel_id: ChannelId,
    pub message_ids: Vec<MessageId>,
    pub kind: ReceiptKind,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEnvelope {
    pub channel_id: ChannelId,
    pub member_id: String,
    pub display_name: String,
    pub status: PresenceStatus,
    pub at: DateTime<Utc>,
}

impl WireEnvelope {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn channel_id(&self) -> &ChannelId {
        match self {
            WireEnvelope::Chat(c) => &c.channel_id,
            WireEnvelope::Receipt(r) => &r.channel_id,
            WireEnvelope::Presence(p) => &p.channel_id,
        }
    }

    /// Identity that produced the envelope.
    pub fn origin(&self) -> &str {
        match self {
            WireEnvelope::Chat(c) => &c.sender_id,
            WireEnvelope::Receipt(r) => &r.from,
            WireEnvelope::Presence(p) => &p.member_id,
        }
    }
}

impl ChatBody {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

// ---------------------------------------------------------------------------
// Secure transport framing
// ---------------------------------------------------------------------------

/// Cleartext frames of the PQ-hybrid handshake, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandshakeFrame {
    /// initiator -> responder: ephemeral ML-KEM-768 public key
    KemOffer(Vec<u8>),
    /// responder -> initiator: ML-KEM ciphertext
    KemReply(Vec<u8>),
    /// one Noise_XXpsk3 handshake message
    Noise(Vec<u8>),
}

/// Frames exchanged inside the Noise transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SecureFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, data: Vec<u8> },
    Deliver { topic: String, source: Option<String>, data: Vec<u8> },
}

impl HandshakeFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

impl SecureFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

// ---------------------------------------------------------------------------
// Emergency notices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyAction {
    Declared,
    Superseded,
    Resolved,
}

/// Structured content of an emergency broadcast, sent as JSON text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyNotice {
    pub action: EmergencyAction,
    pub reason: String,
    pub urgency: Urgency,
    pub declared_by: String,
    pub at: DateTime<Utc>,
}

impl EmergencyNotice {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse message content; `None` when it is not a notice.
    pub fn parse(content: &str) -> Option<Self> {
        serde_json::from_str(content).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_origin_and_channel() {
        let channel_id = ChannelId::new("team:ops").unwrap();
        let env = WireEnvelope::Receipt(ReceiptEnvelope {
            channel_id: channel_id.clone(),
            message_ids: vec![MessageId::new()],
            kind: ReceiptKind::Read,
            from: "bob".into(),
        });

        let restored = WireEnvelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.channel_id(), &channel_id);
        assert_eq!(restored.origin(), "bob");
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(WireEnvelope::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
        assert!(SecureFrame::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_emergency_notice_json_shape() {
        let notice = EmergencyNotice {
            action: EmergencyAction::Declared,
            reason: "grid failure".into(),
            urgency: Urgency::Critical,
            declared_by: "op-1".into(),
            at: Utc::now(),
        };
        let json = notice.to_json().unwrap();
        assert!(json.contains("\"action\":\"declared\""));
        assert!(json.contains("\"declaredBy\":\"op-1\""));
        assert!(json.contains("\"urgency\":\"critical\""));
        assert_eq!(EmergencyNotice::parse(&json), Some(notice));
        assert_eq!(EmergencyNotice::parse("hello"), None);
    }
}
