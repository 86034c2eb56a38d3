//! Connection supervisor: keeps one provider connected, retrying with
//! exponential backoff until stopped or a permanent error is hit.

pub mod backoff;
pub mod state;

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beacon_shared::{ConnectionError, ConnectionState, Identity, ProviderKind};

use crate::config::BackoffConfig;
use crate::provider::{ChatProvider, Provider};

use self::state::{transition, Action, Trigger};

/// Result of one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub number: u64,
    pub result: Result<ConnectionState, ConnectionError>,
}

/// Owner handle of a supervisor task. Dropping it stops the task.
pub struct SupervisorHandle {
    kind: ProviderKind,
    cancel: CancellationToken,
    attempts: AttemptWatch,
}

impl SupervisorHandle {
    pub fn spawn(
        provider: Arc<Provider>,
        identity: Identity,
        endpoints: Vec<String>,
        backoff: BackoffConfig,
    ) -> Self {
        let kind = provider.kind();
        let cancel = CancellationToken::new();
        let (attempt_tx, attempts) = watch::channel(None);
        tokio::spawn(supervise(
            provider,
            identity,
            endpoints,
            backoff,
            attempt_tx,
            cancel.clone(),
        ));
        Self {
            kind,
            cancel,
            attempts: AttemptWatch(attempts),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Stop retrying. The provider itself is left as it is.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Most recent attempt, if any has finished.
    pub fn last_attempt(&self) -> Option<Attempt> {
        self.attempts.latest()
    }

    pub fn attempts(&self) -> AttemptWatch {
        self.attempts.clone()
    }

    /// Waits for the outcome of the first attempt.
    pub async fn first_outcome(&self) -> Result<ConnectionState, ConnectionError> {
        self.attempts.first().await
    }
}

/// Observer of a supervisor's connect attempts, detached from its owner.
#[derive(Clone)]
pub struct AttemptWatch(watch::Receiver<Option<Attempt>>);

impl AttemptWatch {
    pub fn latest(&self) -> Option<Attempt> {
        self.0.borrow().clone()
    }

    /// Outcome of the first attempt.
    pub async fn first(&self) -> Result<ConnectionState, ConnectionError> {
        self.after(0).await
    }

    /// Outcome of the first attempt numbered above `number`. A supervisor
    /// that stops before making one reports `Aborted`.
    pub async fn after(&self, number: u64) -> Result<ConnectionState, ConnectionError> {
        let mut rx = self.0.clone();
        let attempt = rx
            .wait_for(|a| a.as_ref().map_or(false, |a| a.number > number))
            .await
            .map(|a| a.clone());
        match attempt {
            Ok(Some(attempt)) => attempt.result,
            _ => Err(ConnectionError::Aborted),
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Applies `trigger` to `state` and returns the side effect to run next. A
/// trigger the table does not cover stops the supervisor.
fn step(kind: ProviderKind, state: &mut ConnectionState, trigger: Trigger) -> Action {
    match transition(*state, trigger) {
        Some((to, action)) => {
            debug!(provider = %kind, from = %state, to = %to, ?trigger, ?action, "Supervisor transition");
            *state = to;
            action
        }
        None => {
            warn!(provider = %kind, state = %state, ?trigger, "Unexpected supervisor trigger, stopping");
            Action::CancelTimers
        }
    }
}

/// Resolves with the state that ended a live session.
async fn session_end(rx: &mut watch::Receiver<ConnectionState>) -> ConnectionState {
    match rx.wait_for(|s| !s.is_connected()).await {
        Ok(state) => *state,
        Err(_) => ConnectionState::Disconnected,
    }
}

async fn supervise(
    provider: Arc<Provider>,
    identity: Identity,
    endpoints: Vec<String>,
    backoff: BackoffConfig,
    attempt_tx: watch::Sender<Option<Attempt>>,
    cancel: CancellationToken,
) {
    let kind = provider.kind();
    let mut provider_state = provider.watch_state();
    let mut state = ConnectionState::Disconnected;
    let mut action = step(kind, &mut state, Trigger::Connect);
    // Consecutive failures since the last live session, for backoff.
    let mut failures: u32 = 0;
    let mut number: u64 = 0;

    loop {
        let trigger = match action {
            Action::StartHandshake => {
                number += 1;
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(ConnectionError::Aborted),
                    r = provider.connect(&identity, &endpoints) => r,
                };
                if cancel.is_cancelled() {
                    Trigger::Disconnect
                } else {
                    attempt_tx.send_replace(Some(Attempt {
                        number,
                        result: result.clone(),
                    }));
                    match result {
                        Ok(_) => Trigger::HandshakeSucceeded,
                        Err(e) if e.is_permanent() => {
                            warn!(provider = %kind, error = %e, "Permanent connect failure, not retrying");
                            Trigger::Disconnect
                        }
                        Err(_) => {
                            failures = failures.saturating_add(1);
                            Trigger::HandshakeFailed
                        }
                    }
                }
            }
            Action::ClearTimer => {
                let ended = tokio::select! {
                    _ = cancel.cancelled() => ConnectionState::Disconnected,
                    s = session_end(&mut provider_state) => s,
                };
                if ended == ConnectionState::Disconnected {
                    if !cancel.is_cancelled() {
                        info!(provider = %kind, "Provider disconnected, supervisor stopping");
                    }
                    Trigger::Disconnect
                } else {
                    failures = 1;
                    Trigger::LinkLost
                }
            }
            Action::ScheduleRetry => {
                let wait = backoff::delay(&backoff, failures);
                info!(provider = %kind, failures, delay_ms = wait.as_millis() as u64, "Reconnecting after backoff");
                tokio::select! {
                    _ = cancel.cancelled() => Trigger::Disconnect,
                    _ = tokio::time::sleep(wait) => Trigger::RetryFired,
                }
            }
            Action::CancelTimers => break,
        };
        action = step(kind, &mut state, trigger);
    }

    debug!(provider = %kind, attempts = number, "Supervisor stopped");
}
