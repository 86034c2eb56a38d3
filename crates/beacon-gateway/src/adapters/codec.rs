//! Per-backend envelope codecs and the mapping of backend failures onto the
//! gateway error taxonomy.

use beacon_net::BackendError;
use beacon_shared::error::ProtocolError;
use beacon_shared::protocol::{ChatEnvelope, WireEnvelope};
use beacon_shared::{Capabilities, ChannelError, ChannelId, ConnectionError, ProviderKind, SendError};

/// What differs between backends once connection handling is factored out:
/// the wire shape of an envelope and a few delivery semantics.
pub trait EnvelopeCodec: Send + Sync + 'static {
    const KIND: ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// Whether the transport itself is post-quantum protected.
    fn pqc_transport(&self) -> bool {
        false
    }

    fn seal(&self, envelope: &WireEnvelope) -> Result<Vec<u8>, ProtocolError>;

    fn open(&self, data: &[u8]) -> Result<WireEnvelope, ProtocolError>;

    /// Last chance to annotate an outbound chat envelope.
    fn stamp_outbound(&self, _chat: &mut ChatEnvelope) {}

    /// Returns false for chat envelopes that were already delivered.
    fn accept_inbound(&self, _chat: &ChatEnvelope) -> bool {
        true
    }

    fn forget_channel(&self, _id: &ChannelId) {}
}

pub(crate) fn connect_error(e: BackendError, timeout_ms: u64) -> ConnectionError {
    match e {
        BackendError::Unreachable(reason) => ConnectionError::Unreachable(reason),
        BackendError::Handshake(reason) | BackendError::Rejected(reason) => {
            ConnectionError::Handshake(reason)
        }
        BackendError::Timeout => ConnectionError::Timeout(timeout_ms),
        BackendError::InvalidEndpoint(endpoint) => ConnectionError::InvalidEndpoint(endpoint),
        BackendError::NoEndpoints => ConnectionError::NoEndpoints,
        BackendError::NotConnected | BackendError::Closed => {
            ConnectionError::Unreachable(e.to_string())
        }
    }
}

/// Only an explicit rejection is an application failure; everything else
/// means the link is not usable right now.
pub(crate) fn send_error(e: BackendError) -> SendError {
    match e {
        BackendError::Rejected(reason) => SendError::Rejected(reason),
        _ => SendError::NotConnected,
    }
}

pub(crate) fn channel_error(e: BackendError) -> ChannelError {
    match e {
        BackendError::Rejected(reason) => ChannelError::Rejected(reason),
        _ => ChannelError::NotConnected,
    }
}
