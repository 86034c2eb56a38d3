//! The backend-facing contract every network client implements.
//!
//! A backend knows nothing about channels, messages or receipts: it connects,
//! publishes opaque bytes on a topic, and yields raw envelopes plus
//! connectivity signals. Everything richer is the adapter's job.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the per-session notification channel.
pub const NOTIFICATION_BUFFER: usize = 1024;

/// Events a backend session pushes to its adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendNotification {
    /// Raw payload received on a subscribed topic.
    Envelope {
        topic: String,
        source: Option<String>,
        data: Vec<u8>,
    },
    PeerJoined {
        peer: String,
    },
    PeerLeft {
        peer: String,
    },
    /// The session is gone. No further notifications follow.
    ConnectionLost {
        reason: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Unreachable: {0}")]
    Unreachable(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Timed out")]
    Timeout,

    #[error("Session closed")]
    Closed,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("No endpoints configured")]
    NoEndpoints,
}

/// Native client of one backend family.
///
/// `connect` resolves only once the backend handshake is complete and returns
/// the notification stream of the new session. Dropping the session (through
/// `disconnect` or a link failure) closes that stream.
#[async_trait]
pub trait BackendClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(
        &self,
        endpoints: &[String],
    ) -> Result<mpsc::Receiver<BackendNotification>, BackendError>;

    /// Best-effort teardown; never blocks.
    fn disconnect(&self);

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), BackendError>;

    async fn subscribe(&self, topic: &str) -> Result<(), BackendError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), BackendError>;
}
