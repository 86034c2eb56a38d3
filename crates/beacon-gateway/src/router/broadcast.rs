//! Outcome of a best-effort broadcast to every emergency channel.

use serde::Serialize;

use beacon_shared::{ChannelId, ConnectionState, MessageId, ProviderKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome", content = "detail")]
pub enum BroadcastOutcome {
    Delivered(MessageId),
    Failed(String),
    /// The provider was not connected.
    Skipped(ConnectionState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastAttempt {
    pub provider: ProviderKind,
    #[serde(flatten)]
    pub outcome: BroadcastOutcome,
}

/// Attempts for one channel, in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBroadcast {
    pub channel_id: ChannelId,
    pub attempts: Vec<BroadcastAttempt>,
}

impl ChannelBroadcast {
    pub fn delivered_by(&self) -> Option<ProviderKind> {
        self.attempts
            .iter()
            .find(|a| matches!(a.outcome, BroadcastOutcome::Delivered(_)))
            .map(|a| a.provider)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub channels: Vec<ChannelBroadcast>,
    /// Fallback providers that were not connected when the broadcast ran.
    pub unavailable_fallbacks: Vec<ProviderKind>,
}

impl BroadcastReport {
    /// True when some emergency channel was reached by no provider.
    pub fn is_degraded(&self) -> bool {
        self.channels.iter().any(|c| c.delivered_by().is_none())
    }

    pub fn channel(&self, id: &ChannelId) -> Option<&ChannelBroadcast> {
        self.channels.iter().find(|c| c.channel_id == *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_when_a_channel_is_unreached() {
        let north = ChannelId::new("emergency:north").unwrap();
        let mut report = BroadcastReport {
            channels: vec![ChannelBroadcast {
                channel_id: north.clone(),
                attempts: vec![
                    BroadcastAttempt {
                        provider: ProviderKind::P2p,
                        outcome: BroadcastOutcome::Failed("rejected".into()),
                    },
                    BroadcastAttempt {
                        provider: ProviderKind::Relay,
                        outcome: BroadcastOutcome::Skipped(ConnectionState::Disconnected),
                    },
                ],
            }],
            unavailable_fallbacks: vec![ProviderKind::Relay],
        };
        assert!(report.is_degraded());

        report.channels[0].attempts.push(BroadcastAttempt {
            provider: ProviderKind::Secure,
            outcome: BroadcastOutcome::Delivered(MessageId::new()),
        });
        assert!(!report.is_degraded());
        assert_eq!(report.channel(&north).and_then(|c| c.delivered_by()), Some(ProviderKind::Secure));

        // No emergency channels at all is not a degradation
        assert!(!BroadcastReport::default().is_degraded());
    }
}
