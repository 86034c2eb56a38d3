//! Connection lifecycle transitions, independent of any timer or socket.

use beacon_shared::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Connect,
    HandshakeSucceeded,
    HandshakeFailed,
    LinkLost,
    RetryFired,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StartHandshake,
    ClearTimer,
    ScheduleRetry,
    CancelTimers,
}

/// Next state and side effect for `trigger` in `from`, or `None` when the
/// trigger does not apply in that state.
pub fn transition(from: ConnectionState, trigger: Trigger) -> Option<(ConnectionState, Action)> {
    use ConnectionState::*;

    match (from, trigger) {
        (_, Trigger::Disconnect) => Some((Disconnected, Action::CancelTimers)),
        (Disconnected, Trigger::Connect) => Some((Connecting, Action::StartHandshake)),
        (Connecting, Trigger::HandshakeSucceeded) => Some((Connected, Action::ClearTimer)),
        (Connecting, Trigger::HandshakeFailed) => Some((Error, Action::ScheduleRetry)),
        (Connected, Trigger::LinkLost) => Some((Error, Action::ScheduleRetry)),
        (Error, Trigger::RetryFired) => Some((Connecting, Action::StartHandshake)),
        _ => None,
    }
}
