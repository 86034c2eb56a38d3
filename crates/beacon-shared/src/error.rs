use thiserror::Error;

use crate::types::{ChannelId, EncryptionLevel, MessageId};

/// Top-level error returned by the gateway facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Gateway is shut down")]
    Shutdown,
}

/// Handshake, authentication and endpoint failures.
///
/// The connection supervisor retries these automatically, except for the
/// ones where [`ConnectionError::is_permanent`] returns true.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Malformed identity: {0}")]
    MalformedIdentity(String),

    #[error("No endpoints configured")]
    NoEndpoints,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("No endpoint reachable: {0}")]
    Unreachable(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connect timed out after {0} ms")]
    Timeout(u64),

    #[error("Connect aborted by disconnect")]
    Aborted,
}

impl ConnectionError {
    /// Errors that no amount of retrying can fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ConnectionError::MalformedIdentity(_)
                | ConnectionError::NoEndpoints
                | ConnectionError::InvalidEndpoint(_)
                | ConnectionError::Aborted
        )
    }
}

/// Invalid, duplicate or unsupported channel descriptors. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Invalid channel id: {0}")]
    InvalidId(String),

    #[error("Invalid channel descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Channel already exists: {0}")]
    Duplicate(ChannelId),

    #[error("Unknown channel: {0}")]
    Unknown(ChannelId),

    #[error("Encryption level {requested} not supported (backend maximum is {max})")]
    UnsupportedEncryption {
        requested: EncryptionLevel,
        max: EncryptionLevel,
    },

    #[error("Cannot downgrade encryption from {current} to {requested}")]
    EncryptionDowngrade {
        current: EncryptionLevel,
        requested: EncryptionLevel,
    },

    #[error("Channel kind is immutable")]
    KindChange,

    #[error("Not connected")]
    NotConnected,

    #[error("Backend rejected channel: {0}")]
    Rejected(String),
}

/// Failures of a single outbound message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Not connected")]
    NotConnected,

    #[error("Backend rejected message: {0}")]
    Rejected(String),

    #[error("Send timed out after {0} ms")]
    Timeout(u64),

    #[error("Outbound queue full ({0} entries)")]
    QueueFull(usize),

    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    #[error("Message {0} is not in a retryable state")]
    NotRetryable(MessageId),

    #[error("Encoding failed: {0}")]
    Encoding(String),
}

impl SendError {
    /// True when the failure is caused purely by missing connectivity, in
    /// which case the router queues the message instead of failing it.
    pub fn is_disconnection(&self) -> bool {
        matches!(self, SendError::NotConnected)
    }
}

/// Invalid emergency-state transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("An emergency is already active: {reason}")]
    AlreadyActive { reason: String },

    #[error("No emergency is active")]
    NotActive,

    #[error("Invalid emergency declaration: {0}")]
    InvalidDeclaration(String),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid signature")]
    InvalidSignature,
}

#[derive(Error, Debug)]
pub enum NoiseError {
    #[error("Noise handshake error: {0}")]
    Handshake(String),

    #[error("Noise transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum PqcError {
    #[error("Invalid ML-KEM public key")]
    InvalidPublicKey,

    #[error("Invalid ML-KEM ciphertext")]
    InvalidCiphertext,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}
