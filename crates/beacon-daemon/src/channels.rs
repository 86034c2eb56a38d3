//! Opening the channels named in the daemon configuration.

use tracing::debug;

use beacon_gateway::Gateway;
use beacon_shared::{Channel, ChannelError, ChannelKind, GatewayError};

/// Create the channel, or take over the one restored from the queue
/// database of a previous run.
pub async fn open_channel(gateway: &Gateway, kind: ChannelKind, name: &str) -> Result<Channel, GatewayError> {
    match gateway.create_channel(name, kind, Vec::new()).await {
        Err(GatewayError::Channel(ChannelError::Duplicate(id))) => {
            debug!(channel = %id, "Channel already tracked, joining");
            gateway.join_channel(id).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use beacon_gateway::{GatewayConfig, MemoryNetwork};
    use beacon_shared::Identity;
    use beacon_store::Database;

    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig {
            connect_timeout: Duration::from_secs(2),
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_channel_restored_after_restart_opens_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let network = MemoryNetwork::new();
        let config = config();

        let first = Gateway::with_store(
            config.clone(),
            network.factory("alice", &config),
            Some(Database::open_at(&path).unwrap()),
        );
        first.connect(None, Identity::new("alice", "Alice")).await.unwrap();
        let created = open_channel(&first, ChannelKind::Team, "ops").await.unwrap();
        first.shutdown().await.unwrap();
        drop(first);

        let second = Gateway::with_store(
            config.clone(),
            network.factory("alice", &config),
            Some(Database::open_at(&path).unwrap()),
        );
        second.connect(None, Identity::new("alice", "Alice")).await.unwrap();
        let reopened = open_channel(&second, ChannelKind::Team, "ops").await.unwrap();

        assert_eq!(reopened.id(), created.id());
        assert_eq!(second.channels().await.unwrap().len(), 1);
        second
            .on_message(reopened.id().clone(), |_| {})
            .await
            .unwrap();
    }
}
