//! Emergency coordinator: owner of the process-wide [`EmergencyState`].
//!
//! State changes are local and take effect before any notification goes
//! out. Broadcasting the notice is best effort: a channel no provider could
//! reach is reported through [`EmergencyEvent::BroadcastDegraded`], never by
//! undoing the change.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use beacon_shared::protocol::{EmergencyAction, EmergencyNotice};
use beacon_shared::{EmergencyState, GatewayError, SendError, StateError, Urgency};

use crate::events::{EmergencyEvent, EventBus, SubscriptionId};
use crate::router::{BroadcastReport, RouterHandle};

const MAX_REASON_LEN: usize = 1024;

/// Sender recorded when an emergency is declared before any identity is set.
const LOCAL_OPERATOR: &str = "local";

/// State after a transition plus what the notice broadcast achieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyOutcome {
    pub state: EmergencyState,
    pub report: BroadcastReport,
}

pub struct EmergencyCoordinator {
    router: RouterHandle,
    state: watch::Sender<EmergencyState>,
    /// Serialises transitions, held across the broadcast.
    transition: Mutex<()>,
    events: Arc<EventBus<EmergencyEvent>>,
}

impl EmergencyCoordinator {
    pub fn new(router: RouterHandle) -> Self {
        let (state, _) = watch::channel(EmergencyState::default());
        Self {
            router,
            state,
            transition: Mutex::new(()),
            events: Arc::new(EventBus::new()),
        }
    }

    /// Current state, without waiting on any transition in progress.
    pub fn state(&self) -> EmergencyState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<EmergencyState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self, handler: impl Fn(&EmergencyEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Declare an emergency. Fails with [`StateError::AlreadyActive`] while
    /// another one is active; use [`escalate`](Self::escalate) to replace it.
    pub async fn declare(&self, reason: &str, urgency: Urgency) -> Result<EmergencyOutcome, GatewayError> {
        let reason = validate_reason(reason)?;
        let _guard = self.transition.lock().await;
        let current = self.state();
        if current.active {
            return Err(StateError::AlreadyActive {
                reason: current.reason.unwrap_or_default(),
            }
            .into());
        }

        let declared = EmergencyState::declared(self.operator().await?, reason, urgency);
        let content = notice(EmergencyAction::Declared, &declared)?;
        info!(urgency = %urgency, reason = declared.reason.as_deref().unwrap_or_default(), "Emergency declared");
        self.state.send_replace(declared.clone());
        self.events.publish(&EmergencyEvent::Declared(declared.clone()));

        let report = self.broadcast(content).await?;
        Ok(EmergencyOutcome {
            state: declared,
            report,
        })
    }

    /// Replace the active emergency with a new declaration. With nothing
    /// active this is a plain declaration.
    pub async fn escalate(&self, reason: &str, urgency: Urgency) -> Result<EmergencyOutcome, GatewayError> {
        let reason = validate_reason(reason)?;
        let _guard = self.transition.lock().await;
        let previous = self.state();

        let current = EmergencyState::declared(self.operator().await?, reason, urgency);
        let (action, event) = if previous.active {
            info!(
                urgency = %urgency,
                previous_urgency = ?previous.urgency,
                reason = current.reason.as_deref().unwrap_or_default(),
                "Emergency superseded"
            );
            (
                EmergencyAction::Superseded,
                EmergencyEvent::Superseded {
                    previous,
                    current: current.clone(),
                },
            )
        } else {
            info!(urgency = %urgency, "Emergency declared by escalation");
            (EmergencyAction::Declared, EmergencyEvent::Declared(current.clone()))
        };
        let content = notice(action, &current)?;
        self.state.send_replace(current.clone());
        self.events.publish(&event);

        let report = self.broadcast(content).await?;
        Ok(EmergencyOutcome {
            state: current,
            report,
        })
    }

    /// Broadcast the resolution, then clear the active emergency.
    pub async fn resolve(&self) -> Result<EmergencyOutcome, GatewayError> {
        let _guard = self.transition.lock().await;
        let current = self.state();
        if !current.active {
            return Err(StateError::NotActive.into());
        }
        let resolved = current.resolved();
        let content = notice(EmergencyAction::Resolved, &resolved)?;

        let report = self.broadcast(content).await;
        info!(reason = resolved.reason.as_deref().unwrap_or_default(), "Emergency resolved");
        self.state.send_replace(resolved.clone());
        self.events.publish(&EmergencyEvent::Resolved(resolved.clone()));
        Ok(EmergencyOutcome {
            state: resolved,
            report: report?,
        })
    }

    async fn operator(&self) -> Result<String, GatewayError> {
        Ok(self
            .router
            .identity()
            .await?
            .map(|identity| identity.id)
            .unwrap_or_else(|| LOCAL_OPERATOR.to_string()))
    }

    async fn broadcast(&self, content: String) -> Result<BroadcastReport, GatewayError> {
        let report = self.router.broadcast(content).await?;
        if report.is_degraded() {
            let unreached: Vec<String> = report
                .channels
                .iter()
                .filter(|c| c.delivered_by().is_none())
                .map(|c| c.channel_id.to_string())
                .collect();
            warn!(
                ?unreached,
                unavailable_fallbacks = ?report.unavailable_fallbacks,
                "Emergency broadcast degraded"
            );
            self.events
                .publish(&EmergencyEvent::BroadcastDegraded(report.clone()));
        }
        Ok(report)
    }
}

fn validate_reason(reason: &str) -> Result<String, StateError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(StateError::InvalidDeclaration("reason is empty".into()));
    }
    if reason.len() > MAX_REASON_LEN {
        return Err(StateError::InvalidDeclaration(format!(
            "reason longer than {MAX_REASON_LEN} bytes"
        )));
    }
    Ok(reason.to_string())
}

fn notice(action: EmergencyAction, state: &EmergencyState) -> Result<String, GatewayError> {
    let notice = EmergencyNotice {
        action,
        reason: state.reason.clone().unwrap_or_default(),
        urgency: state.urgency.unwrap_or(Urgency::Elevated),
        declared_by: state.declared_by.clone().unwrap_or_default(),
        at: state.resolved_at.or(state.declared_at).unwrap_or_else(Utc::now),
    };
    notice
        .to_json()
        .map_err(|e| SendError::Encoding(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use beacon_shared::{ChannelDescriptor, ChannelKind, Identity, ProviderKind};

    use super::*;
    use crate::config::{BackoffConfig, GatewayConfig};
    use crate::factory::MemoryNetwork;
    use crate::router::BroadcastOutcome;

    fn config() -> GatewayConfig {
        GatewayConfig {
            send_timeout: Duration::from_millis(500),
            backoff: BackoffConfig {
                base: Duration::from_millis(50),
                max: Duration::from_millis(200),
                jitter: 0.0,
            },
            ..GatewayConfig::default()
        }
    }

    fn events(coordinator: &EmergencyCoordinator) -> Arc<StdMutex<Vec<EmergencyEvent>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        coordinator.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        seen
    }

    #[tokio::test]
    async fn test_second_declaration_is_rejected() {
        let network = MemoryNetwork::new();
        let config = config();
        let router = RouterHandle::spawn(config.clone(), network.factory("alice", &config), None);
        let coordinator = EmergencyCoordinator::new(router);

        let first = coordinator.declare("grid failure", Urgency::Critical).await.unwrap();
        assert!(first.state.active);
        assert_eq!(first.state.declared_by.as_deref(), Some("local"));
        assert!(first.report.channels.is_empty());

        let err = coordinator.declare("flood", Urgency::High).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::State(StateError::AlreadyActive {
                reason: "grid failure".into()
            })
        );
        let state = coordinator.state();
        assert_eq!(state.reason.as_deref(), Some("grid failure"));
        assert_eq!(state.urgency, Some(Urgency::Critical));

        assert!(matches!(
            coordinator.declare("   ", Urgency::High).await.unwrap_err(),
            GatewayError::State(StateError::InvalidDeclaration(_))
        ));
    }

    #[tokio::test]
    async fn test_escalate_and_resolve_publish_events() {
        let network = MemoryNetwork::new();
        let config = config();
        let router = RouterHandle::spawn(config.clone(), network.factory("alice", &config), None);
        let coordinator = EmergencyCoordinator::new(router);
        let seen = events(&coordinator);

        assert_eq!(
            coordinator.resolve().await.unwrap_err(),
            GatewayError::State(StateError::NotActive)
        );

        coordinator.declare("storm", Urgency::Elevated).await.unwrap();
        let escalated = coordinator.escalate("storm surge", Urgency::Critical).await.unwrap();
        assert_eq!(escalated.state.urgency, Some(Urgency::Critical));
        let resolved = coordinator.resolve().await.unwrap();
        assert!(!resolved.state.active);
        assert!(resolved.state.resolved_at.is_some());
        assert!(!coordinator.state().active);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], EmergencyEvent::Declared(s) if s.reason.as_deref() == Some("storm")));
        assert!(matches!(
            &seen[1],
            EmergencyEvent::Superseded { previous, current }
                if previous.urgency == Some(Urgency::Elevated) && current.urgency == Some(Urgency::Critical)
        ));
        assert!(matches!(&seen[2], EmergencyEvent::Resolved(_)));
    }

    #[tokio::test]
    async fn test_degraded_broadcast_keeps_state() {
        let network = MemoryNetwork::new();
        let config = config();
        let factory = network.factory("alice", &config);
        factory.backend(ProviderKind::P2p).set_unreachable(true);
        let router = RouterHandle::spawn(config.clone(), factory, None);
        router
            .connect(None, Identity::new("alice", "Alice"))
            .await
            .unwrap_err();
        let channel = router
            .create_channel(ChannelDescriptor::named("north", ChannelKind::Emergency, Vec::<String>::new()).unwrap())
            .await
            .unwrap();

        let coordinator = EmergencyCoordinator::new(router);
        let seen = events(&coordinator);
        let outcome = coordinator.declare("grid failure", Urgency::Critical).await.unwrap();

        assert!(outcome.state.active);
        assert_eq!(outcome.state.declared_by.as_deref(), Some("alice"));
        assert!(outcome.report.is_degraded());
        let attempts = &outcome.report.channel(channel.id()).unwrap().attempts;
        assert_eq!(attempts.len(), 1);
        assert!(matches!(attempts[0].outcome, BroadcastOutcome::Skipped(_)));

        let seen = seen.lock().unwrap();
        assert!(matches!(seen.last(), Some(EmergencyEvent::BroadcastDegraded(_))));
        assert!(coordinator.state().active);
    }
}
