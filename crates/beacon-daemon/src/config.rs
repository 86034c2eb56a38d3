//! Daemon settings loaded from environment variables.
//!
//! Gateway settings live in [`beacon_gateway::GatewayConfig`]; this covers
//! only what the daemon itself does at startup.

use beacon_shared::{ChannelKind, Identity};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Env: `BEACON_IDENTITY_ID`
    /// Default: `beacon-node`
    pub identity_id: String,

    /// Env: `BEACON_DISPLAY_NAME`
    /// Default: the identity id.
    pub display_name: Option<String>,

    /// Channels created after the first connect, as `kind:name`.
    /// Env: `BEACON_CHANNELS` (comma-separated)
    /// Default: `emergency:alerts`
    pub channels: Vec<(ChannelKind, String)>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            identity_id: "beacon-node".to_string(),
            display_name: None,
            channels: vec![(ChannelKind::Emergency, "alerts".to_string())],
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("BEACON_IDENTITY_ID") {
            if !id.trim().is_empty() {
                config.identity_id = id.trim().to_string();
            }
        }

        if let Ok(name) = std::env::var("BEACON_DISPLAY_NAME") {
            if !name.trim().is_empty() {
                config.display_name = Some(name.trim().to_string());
            }
        }

        if let Ok(list) = std::env::var("BEACON_CHANNELS") {
            config.channels = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|item| match parse_channel(item) {
                    Ok(channel) => Some(channel),
                    Err(e) => {
                        tracing::warn!(value = %item, error = %e, "Ignoring invalid BEACON_CHANNELS entry");
                        None
                    }
                })
                .collect();
        }

        config
    }

    pub fn identity(&self) -> Identity {
        Identity::new(
            self.identity_id.clone(),
            self.display_name.clone().unwrap_or_else(|| self.identity_id.clone()),
        )
    }
}

/// Parse `kind:name`, e.g. `team:ops`.
fn parse_channel(item: &str) -> Result<(ChannelKind, String), String> {
    let (kind, name) = item
        .split_once(':')
        .ok_or_else(|| format!("expected kind:name, got {item}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("empty channel name".to_string());
    }
    Ok((kind.parse()?, name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.identity().id, "beacon-node");
        assert_eq!(config.identity().display_name, "beacon-node");
        assert_eq!(config.channels, [(ChannelKind::Emergency, "alerts".to_string())]);
    }

    #[test]
    fn test_parse_channel() {
        assert_eq!(parse_channel("team:ops"), Ok((ChannelKind::Team, "ops".to_string())));
        assert!(parse_channel("ops").is_err());
        assert!(parse_channel("lobby:ops").is_err());
        assert!(parse_channel("team: ").is_err());
    }
}
