//! Unified data model shared by every backend adapter and the router.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{MAX_CHANNEL_ID_LEN, MAX_MESSAGE_SIZE_CEILING, MAX_NAME_LEN, TOPIC_PREFIX};
use crate::error::{ChannelError, ConnectionError};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Channel identifier, unique within a provider.
///
/// Ids are restricted to `[A-Za-z0-9._:-]` so they can be embedded in
/// gossipsub topics and relay tags without escaping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ChannelError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_CHANNEL_ID_LEN {
            return Err(ChannelError::InvalidId(raw));
        }
        let valid = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
        if !valid {
            return Err(ChannelError::InvalidId(raw));
        }
        Ok(Self(raw))
    }

    /// Deterministic id for a named channel: `{kind}:{slug}`.
    ///
    /// Two nodes creating the same named channel land on the same topic.
    pub fn for_name(kind: ChannelKind, name: &str) -> Result<Self, ChannelError> {
        let slug: String = name
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let slug = slug.trim_matches('-');
        if slug.is_empty() {
            return Err(ChannelError::InvalidDescriptor(format!(
                "channel name {name:?} has no usable characters"
            )));
        }
        Self::new(format!("{kind}:{slug}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind encoded in the id prefix, if any.
    pub fn kind_hint(&self) -> Option<ChannelKind> {
        self.0
            .split_once(':')
            .and_then(|(prefix, _)| prefix.parse().ok())
    }

    pub fn to_topic(&self) -> String {
        format!("{TOPIC_PREFIX}{}", self.0)
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        topic
            .strip_prefix(TOPIC_PREFIX)
            .and_then(|raw| Self::new(raw).ok())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ChannelId {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

/// Globally unique message id, assigned by the adapter (never the caller).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Direct,
    Team,
    Global,
    Emergency,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Direct => "direct",
            ChannelKind::Team => "team",
            ChannelKind::Global => "global",
            ChannelKind::Emergency => "emergency",
        }
    }

    /// Encryption applied when a descriptor does not ask for a level.
    pub fn default_encryption(&self) -> EncryptionLevel {
        match self {
            ChannelKind::Global => EncryptionLevel::None,
            _ => EncryptionLevel::Standard,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ChannelKind::Direct),
            "team" => Ok(ChannelKind::Team),
            "global" => Ok(ChannelKind::Global),
            "emergency" => Ok(ChannelKind::Emergency),
            other => Err(format!("unknown channel kind: {other}")),
        }
    }
}

/// Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionLevel {
    None,
    Standard,
    PostQuantum,
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EncryptionLevel::None => "none",
            EncryptionLevel::Standard => "standard",
            EncryptionLevel::PostQuantum => "post-quantum",
        })
    }
}

/// What a caller asks for when creating a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    pub name: String,
    pub kind: ChannelKind,
    pub participant_ids: BTreeSet<String>,
    pub encryption_level: Option<EncryptionLevel>,
    pub max_message_size: Option<usize>,
}

impl ChannelDescriptor {
    /// Descriptor for a named channel with an id derived from kind and name.
    pub fn named(
        name: &str,
        kind: ChannelKind,
        participant_ids: impl IntoIterator<Item = String>,
    ) -> Result<Self, ChannelError> {
        Ok(Self {
            id: ChannelId::for_name(kind, name)?,
            name: name.trim().to_string(),
            kind,
            participant_ids: participant_ids.into_iter().collect(),
            encryption_level: None,
            max_message_size: None,
        })
    }

    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption_level = Some(level);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Backend-independent checks. Backend limits are checked by the adapter.
    pub fn validate(&self) -> Result<(), ChannelError> {
        let name = self.name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(ChannelError::InvalidDescriptor(format!(
                "name must be 1..={MAX_NAME_LEN} characters"
            )));
        }
        if self.kind == ChannelKind::Direct && self.participant_ids.is_empty() {
            return Err(ChannelError::InvalidDescriptor(
                "direct channels need at least one participant".into(),
            ));
        }
        if self.participant_ids.iter().any(|p| p.trim().is_empty()) {
            return Err(ChannelError::InvalidDescriptor(
                "participant ids must not be empty".into(),
            ));
        }
        if let Some(size) = self.max_message_size {
            if size == 0 || size > MAX_MESSAGE_SIZE_CEILING {
                return Err(ChannelError::InvalidDescriptor(format!(
                    "max_message_size must be 1..={MAX_MESSAGE_SIZE_CEILING}"
                )));
            }
        }
        Ok(())
    }
}

/// A named communication scope.
///
/// `kind` is fixed at construction and `encryption_level` can only be raised,
/// so both are reachable through accessors only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    id: ChannelId,
    kind: ChannelKind,
    encryption_level: EncryptionLevel,
    pub name: String,
    pub participant_ids: BTreeSet<String>,
    pub max_message_size: usize,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn from_descriptor(descriptor: ChannelDescriptor, default_max_size: usize) -> Self {
        Self {
            encryption_level: descriptor
                .encryption_level
                .unwrap_or_else(|| descriptor.kind.default_encryption()),
            max_message_size: descriptor
                .max_message_size
                .unwrap_or(default_max_size)
                .min(MAX_MESSAGE_SIZE_CEILING),
            id: descriptor.id,
            kind: descriptor.kind,
            name: descriptor.name,
            participant_ids: descriptor.participant_ids,
            created_at: Utc::now(),
        }
    }

    /// Channel joined by id only; kind comes from the id prefix.
    pub fn joined(id: ChannelId, default_max_size: usize) -> Self {
        let kind = id.kind_hint().unwrap_or(ChannelKind::Global);
        let name = id
            .as_str()
            .split_once(':')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| id.to_string());
        Self {
            encryption_level: kind.default_encryption(),
            max_message_size: default_max_size.min(MAX_MESSAGE_SIZE_CEILING),
            id,
            kind,
            name,
            participant_ids: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        self.encryption_level
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption_level >= EncryptionLevel::Standard
    }

    /// Raise the encryption level. Lowering it is rejected.
    pub fn upgrade_encryption(&mut self, level: EncryptionLevel) -> Result<(), ChannelError> {
        if level < self.encryption_level {
            return Err(ChannelError::EncryptionDowngrade {
                current: self.encryption_level,
                requested: level,
            });
        }
        self.encryption_level = level;
        Ok(())
    }

    /// Fold a later descriptor for the same id into this channel.
    pub fn merge_descriptor(&mut self, descriptor: &ChannelDescriptor) -> Result<(), ChannelError> {
        if descriptor.kind != self.kind {
            return Err(ChannelError::KindChange);
        }
        if let Some(level) = descriptor.encryption_level {
            self.upgrade_encryption(level)?;
        }
        self.participant_ids
            .extend(descriptor.participant_ids.iter().cloned());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content_ref: String,
    pub size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    /// Status only moves forward. `Failed` is terminal and can only be
    /// entered before the backend acknowledged delivery.
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Failed, _) => false,
            (MessageStatus::Pending | MessageStatus::Sent, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityFlags {
    pub encrypted: bool,
    pub pqc_encrypted: bool,
}

/// The unit of communication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: String,
    pub sender_display_name: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Sender-side, monotonic per sender.
    pub timestamp: DateTime<Utc>,
    status: MessageStatus,
    pub security: SecurityFlags,
    /// Per-channel Lamport stamp, set by the P2P backend only.
    pub causal_stamp: Option<u64>,
}

impl Message {
    /// A fresh `pending` message.
    pub fn draft(
        id: MessageId,
        channel_id: ChannelId,
        sender: &Identity,
        content: String,
        attachments: Vec<Attachment>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            channel_id,
            sender_id: sender.id.clone(),
            sender_display_name: sender.display_name.clone(),
            content,
            attachments,
            timestamp,
            status: MessageStatus::Pending,
            security: SecurityFlags::default(),
            causal_stamp: None,
        }
    }

    /// A message received from a backend, already acknowledged by it.
    pub fn received(mut self) -> Self {
        self.status = MessageStatus::Sent;
        self
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    /// Move to `next` if allowed. Returns whether the status changed.
    pub fn advance(&mut self, next: MessageStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Size that counts against the channel `max_message_size`.
    pub fn payload_size(&self) -> usize {
        self.content.len()
    }
}

/// Hands out strictly increasing timestamps for one sender.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stamp = match *last {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

// ---------------------------------------------------------------------------
// Connection & identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        })
    }
}

/// Caller identity presented to a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.id.is_empty() || self.id.len() > MAX_CHANNEL_ID_LEN {
            return Err(ConnectionError::MalformedIdentity(
                "id must be 1..=128 bytes".into(),
            ));
        }
        if self
            .id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(ConnectionError::MalformedIdentity(
                "id must not contain whitespace".into(),
            ));
        }
        if self.display_name.trim().is_empty()
            || self.display_name.chars().count() > MAX_NAME_LEN
            || self.display_name.chars().any(char::is_control)
        {
            return Err(ConnectionError::MalformedIdentity(format!(
                "display name must be 1..={MAX_NAME_LEN} printable characters"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    P2p,
    Relay,
    Secure,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [ProviderKind::P2p, ProviderKind::Relay, ProviderKind::Secure];
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::P2p => "p2p",
            ProviderKind::Relay => "relay",
            ProviderKind::Secure => "secure",
        })
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "p2p" => Ok(ProviderKind::P2p),
            "relay" => Ok(ProviderKind::Relay),
            "secure" | "pqc" => Ok(ProviderKind::Secure),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Capability flags declared by each adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub read_receipts: bool,
    pub delivery_receipts: bool,
    /// Successful publish implies delivery.
    pub implicit_delivery: bool,
    pub presence: bool,
    pub max_encryption: EncryptionLevel,
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEvent {
    pub channel_id: ChannelId,
    pub member_id: String,
    pub display_name: String,
    pub status: PresenceStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    Delivered,
    Read,
}

impl ReceiptKind {
    pub fn status(&self) -> MessageStatus {
        match self {
            ReceiptKind::Delivered => MessageStatus::Delivered,
            ReceiptKind::Read => MessageStatus::Read,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub kind: ReceiptKind,
    pub from: String,
}

/// Normalized inbound event handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(Message),
    Receipt(Receipt),
    Presence(PresenceEvent),
}

impl InboundEvent {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            InboundEvent::Message(m) => &m.channel_id,
            InboundEvent::Receipt(r) => &r.channel_id,
            InboundEvent::Presence(p) => &p.channel_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Emergency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Elevated,
    High,
    Critical,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Urgency::Elevated => "elevated",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        })
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "elevated" => Ok(Urgency::Elevated),
            "high" => Ok(Urgency::High),
            "critical" => Ok(Urgency::Critical),
            other => Err(format!("unknown urgency: {other}")),
        }
    }
}

/// Process-wide emergency state. At most one emergency is active.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmergencyState {
    pub active: bool,
    pub declared_by: Option<String>,
    pub reason: Option<String>,
    pub urgency: Option<Urgency>,
    pub declared_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EmergencyState {
    pub fn declared(declared_by: String, reason: String, urgency: Urgency) -> Self {
        Self {
            active: true,
            declared_by: Some(declared_by),
            reason: Some(reason),
            urgency: Some(urgency),
            declared_at: Some(Utc::now()),
            resolved_at: None,
        }
    }

    pub fn resolved(&self) -> Self {
        Self {
            active: false,
            resolved_at: Some(Utc::now()),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

/// A message plus retry metadata, kept while it is pending or failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundEntry {
    /// Global send order; FIFO per channel follows from it.
    pub seq: u64,
    pub message: Message,
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboundEntry {
    pub fn new(seq: u64, message: Message) -> Self {
        Self {
            seq,
            message,
            attempts: 0,
            next_retry_at: None,
            last_error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.message.status() == MessageStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_MAX_MESSAGE_SIZE;

    #[test]
    fn test_channel_id_validation() {
        assert!(ChannelId::new("team:ops").is_ok());
        assert!(ChannelId::new("").is_err());
        assert!(ChannelId::new("has space").is_err());
        assert!(ChannelId::new("a".repeat(129)).is_err());
    }

    #[test]
    fn test_channel_id_for_name() {
        let id = ChannelId::for_name(ChannelKind::Emergency, "Grid Ops / North").unwrap();
        assert_eq!(id.as_str(), "emergency:grid-ops---north");
        assert_eq!(id.kind_hint(), Some(ChannelKind::Emergency));
        assert!(ChannelId::for_name(ChannelKind::Team, "  !!  ").is_err());
    }

    #[test]
    fn test_topic_mapping() {
        let id = ChannelId::new("team:ops").unwrap();
        let topic = id.to_topic();
        assert_eq!(topic, "beacon/channel/team:ops");
        assert_eq!(ChannelId::from_topic(&topic), Some(id));
        assert_eq!(ChannelId::from_topic("other/topic"), None);
    }

    #[test]
    fn test_channel_id_rejects_invalid_on_deserialize() {
        let res: Result<ChannelId, _> = serde_json::from_str("\"bad id\"");
        assert!(res.is_err());
    }

    #[test]
    fn test_encryption_cannot_downgrade() {
        let desc = ChannelDescriptor::named("ops", ChannelKind::Team, []).unwrap();
        let mut channel = Channel::from_descriptor(desc, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(channel.encryption_level(), EncryptionLevel::Standard);

        assert!(channel.upgrade_encryption(EncryptionLevel::PostQuantum).is_ok());
        let err = channel.upgrade_encryption(EncryptionLevel::None).unwrap_err();
        assert!(matches!(err, ChannelError::EncryptionDowngrade { .. }));
        assert_eq!(channel.encryption_level(), EncryptionLevel::PostQuantum);
    }

    #[test]
    fn test_merge_descriptor_rejects_kind_change() {
        let desc = ChannelDescriptor::named("ops", ChannelKind::Team, []).unwrap();
        let mut channel = Channel::from_descriptor(desc.clone(), DEFAULT_MAX_MESSAGE_SIZE);

        let mut other = desc;
        other.kind = ChannelKind::Global;
        assert_eq!(channel.merge_descriptor(&other), Err(ChannelError::KindChange));
    }

    #[test]
    fn test_descriptor_validation() {
        let direct = ChannelDescriptor::named("dm", ChannelKind::Direct, []).unwrap();
        assert!(direct.validate().is_err());

        let direct = ChannelDescriptor::named("dm", ChannelKind::Direct, ["bob".to_string()]).unwrap();
        assert!(direct.validate().is_ok());

        let too_big = ChannelDescriptor::named("ops", ChannelKind::Team, [])
            .unwrap()
            .with_max_message_size(MAX_MESSAGE_SIZE_CEILING + 1);
        assert!(too_big.validate().is_err());
    }

    #[test]
    fn test_joined_channel_uses_kind_hint() {
        let channel = Channel::joined(ChannelId::new("emergency:north").unwrap(), 1024);
        assert_eq!(channel.kind(), ChannelKind::Emergency);
        assert_eq!(channel.name, "north");

        let channel = Channel::joined(ChannelId::new("lobby").unwrap(), 1024);
        assert_eq!(channel.kind(), ChannelKind::Global);
        assert!(!channel.is_encrypted());
    }

    #[test]
    fn test_status_is_monotonic() {
        use MessageStatus::*;
        assert!(Pending.can_advance_to(Sent));
        assert!(Pending.can_advance_to(Delivered));
        assert!(Sent.can_advance_to(Read));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Read.can_advance_to(Delivered));
        assert!(Sent.can_advance_to(Failed));
        assert!(!Delivered.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Sent));
        assert!(!Failed.can_advance_to(Pending));
    }

    #[test]
    fn test_message_advance() {
        let identity = Identity::new("alice", "Alice");
        let mut msg = Message::draft(
            MessageId::new(),
            ChannelId::new("team:ops").unwrap(),
            &identity,
            "hi".into(),
            Vec::new(),
            Utc::now(),
        );
        assert_eq!(msg.status(), MessageStatus::Pending);
        assert!(msg.advance(MessageStatus::Sent));
        assert!(!msg.advance(MessageStatus::Pending));
        assert!(msg.advance(MessageStatus::Read));
        assert_eq!(msg.status(), MessageStatus::Read);
    }

    #[test]
    fn test_monotonic_clock() {
        let clock = MonotonicClock::new();
        let mut prev = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_identity_validation() {
        assert!(Identity::new("alice", "Alice").validate().is_ok());
        assert!(Identity::new("", "Alice").validate().is_err());
        assert!(Identity::new("al ice", "Alice").validate().is_err());
        assert!(Identity::new("alice", "   ").validate().is_err());
        assert!(Identity::new("alice", "x".repeat(65)).validate().is_err());
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("P2P".parse::<ProviderKind>(), Ok(ProviderKind::P2p));
        assert_eq!("pqc".parse::<ProviderKind>(), Ok(ProviderKind::Secure));
        assert!("carrier-pigeon".parse::<ProviderKind>().is_err());
        assert_eq!(ProviderKind::Relay.to_string(), "relay");
    }

    #[test]
    fn test_emergency_resolution_keeps_declaration() {
        let state = EmergencyState::declared("op-1".into(), "grid failure".into(), Urgency::Critical);
        let resolved = state.resolved();
        assert!(!resolved.active);
        assert_eq!(resolved.reason.as_deref(), Some("grid failure"));
        assert!(resolved.resolved_at.is_some());
    }
}
