//! Gateway configuration loaded from environment variables.
//!
//! All settings have defaults so a gateway can start with zero
//! configuration for local development.

use std::path::PathBuf;
use std::time::Duration;

use beacon_shared::constants::{
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_QUIC_PORT, DEV_NETWORK_SECRET, MAX_MESSAGE_SIZE_CEILING,
};
use beacon_shared::crypto::parse_secret_hex;
use beacon_shared::ProviderKind;

/// Reconnect backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay randomised in both directions, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

/// Gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Provider used until the caller asks for another one.
    /// Env: `BEACON_PROVIDER`
    pub default_provider: ProviderKind,

    /// Env: `BEACON_P2P_BOOTSTRAP` (comma-separated multiaddrs)
    pub p2p_bootstrap: Vec<String>,

    /// Env: `BEACON_P2P_PORT`
    pub p2p_port: u16,

    /// Env: `BEACON_RELAY_URLS` (comma-separated `ws://`/`wss://` URLs)
    pub relay_urls: Vec<String>,

    /// Env: `BEACON_SECURE_ENDPOINTS` (comma-separated `host:port`)
    pub secure_endpoints: Vec<String>,

    /// Providers kept connected for emergency fallback, in priority order.
    /// Env: `BEACON_FALLBACKS`
    pub fallbacks: Vec<ProviderKind>,

    /// Env: `BEACON_CONNECT_TIMEOUT_MS`
    pub connect_timeout: Duration,

    /// Env: `BEACON_SEND_TIMEOUT_MS`
    pub send_timeout: Duration,

    /// Env: `BEACON_SWITCH_GRACE_MS`
    pub switch_grace: Duration,

    /// Env: `BEACON_BACKOFF_BASE_MS`, `BEACON_BACKOFF_MAX_MS`, `BEACON_BACKOFF_JITTER`
    pub backoff: BackoffConfig,

    /// Default `max_message_size` for channels that do not declare one.
    /// Env: `BEACON_MAX_MESSAGE_SIZE`
    pub max_message_size: usize,

    /// Pending plus failed entries the router will hold.
    /// Env: `BEACON_QUEUE_CAPACITY`
    pub queue_capacity: usize,

    /// Rendered messages kept per channel.
    /// Env: `BEACON_CHANNEL_BUFFER`
    pub channel_buffer: usize,

    /// On-disk queue location. `None` keeps the queue in memory only.
    /// Env: `BEACON_QUEUE_DB`
    pub queue_db: Option<PathBuf>,

    /// Secret every channel key is derived from.
    /// Env: `BEACON_NETWORK_SECRET` (64 hex chars)
    pub network_secret: [u8; 32],

    /// Node signing key seed; random per process when unset.
    /// Env: `BEACON_NODE_SECRET` (64 hex chars)
    pub node_secret: Option<[u8; 32]>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("default_provider", &self.default_provider)
            .field("p2p_bootstrap", &self.p2p_bootstrap)
            .field("p2p_port", &self.p2p_port)
            .field("relay_urls", &self.relay_urls)
            .field("secure_endpoints", &self.secure_endpoints)
            .field("fallbacks", &self.fallbacks)
            .field("connect_timeout", &self.connect_timeout)
            .field("send_timeout", &self.send_timeout)
            .field("switch_grace", &self.switch_grace)
            .field("backoff", &self.backoff)
            .field("max_message_size", &self.max_message_size)
            .field("queue_capacity", &self.queue_capacity)
            .field("channel_buffer", &self.channel_buffer)
            .field("queue_db", &self.queue_db)
            .field("node_secret", &self.node_secret.map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_provider: ProviderKind::P2p,
            p2p_bootstrap: Vec::new(),
            p2p_port: DEFAULT_QUIC_PORT,
            relay_urls: Vec::new(),
            secure_endpoints: Vec::new(),
            fallbacks: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(15),
            switch_grace: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_capacity: 1000,
            channel_buffer: 500,
            queue_db: None,
            network_secret: DEV_NETWORK_SECRET,
            node_secret: None,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Endpoints configured for `kind`.
    pub fn endpoints(&self, kind: ProviderKind) -> &[String] {
        match kind {
            ProviderKind::P2p => &self.p2p_bootstrap,
            ProviderKind::Relay => &self.relay_urls,
            ProviderKind::Secure => &self.secure_endpoints,
        }
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("BEACON_PROVIDER") {
            match val.parse() {
                Ok(kind) => config.default_provider = kind,
                Err(e) => tracing::warn!(value = %val, error = %e, "Invalid BEACON_PROVIDER, using default"),
            }
        }

        if let Some(val) = lookup("BEACON_P2P_BOOTSTRAP") {
            config.p2p_bootstrap = split_list(&val);
        }
        if let Some(val) = lookup("BEACON_P2P_PORT") {
            parse_into(&mut config.p2p_port, "BEACON_P2P_PORT", &val);
        }
        if let Some(val) = lookup("BEACON_RELAY_URLS") {
            config.relay_urls = split_list(&val);
        }
        if let Some(val) = lookup("BEACON_SECURE_ENDPOINTS") {
            config.secure_endpoints = split_list(&val);
        }

        if let Some(val) = lookup("BEACON_FALLBACKS") {
            let mut fallbacks = Vec::new();
            for item in split_list(&val) {
                match item.parse::<ProviderKind>() {
                    Ok(kind) if !fallbacks.contains(&kind) => fallbacks.push(kind),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Ignoring invalid BEACON_FALLBACKS entry"),
                }
            }
            config.fallbacks = fallbacks;
        }

        for (key, slot) in [
            ("BEACON_CONNECT_TIMEOUT_MS", &mut config.connect_timeout),
            ("BEACON_SEND_TIMEOUT_MS", &mut config.send_timeout),
            ("BEACON_SWITCH_GRACE_MS", &mut config.switch_grace),
            ("BEACON_BACKOFF_BASE_MS", &mut config.backoff.base),
            ("BEACON_BACKOFF_MAX_MS", &mut config.backoff.max),
        ] {
            if let Some(val) = lookup(key) {
                match val.trim().parse::<u64>() {
                    Ok(ms) if ms > 0 => *slot = Duration::from_millis(ms),
                    _ => tracing::warn!(key, value = %val, "Invalid duration, using default"),
                }
            }
        }
        if config.backoff.max < config.backoff.base {
            tracing::warn!("BEACON_BACKOFF_MAX_MS below base, clamping to base");
            config.backoff.max = config.backoff.base;
        }

        if let Some(val) = lookup("BEACON_BACKOFF_JITTER") {
            match val.trim().parse::<f64>() {
                Ok(j) if (0.0..=1.0).contains(&j) => config.backoff.jitter = j,
                _ => tracing::warn!(value = %val, "Invalid BEACON_BACKOFF_JITTER, using default"),
            }
        }

        if let Some(val) = lookup("BEACON_MAX_MESSAGE_SIZE") {
            match val.trim().parse::<usize>() {
                Ok(n) if (1..=MAX_MESSAGE_SIZE_CEILING).contains(&n) => config.max_message_size = n,
                _ => tracing::warn!(
                    value = %val,
                    max = MAX_MESSAGE_SIZE_CEILING,
                    "Invalid BEACON_MAX_MESSAGE_SIZE, using default"
                ),
            }
        }
        if let Some(val) = lookup("BEACON_QUEUE_CAPACITY") {
            parse_into(&mut config.queue_capacity, "BEACON_QUEUE_CAPACITY", &val);
        }
        if let Some(val) = lookup("BEACON_CHANNEL_BUFFER") {
            parse_into(&mut config.channel_buffer, "BEACON_CHANNEL_BUFFER", &val);
        }

        if let Some(path) = lookup("BEACON_QUEUE_DB") {
            if !path.trim().is_empty() {
                config.queue_db = Some(PathBuf::from(path.trim()));
            }
        }

        if let Some(hex_key) = lookup("BEACON_NETWORK_SECRET") {
            match parse_secret_hex(&hex_key) {
                Ok(secret) => config.network_secret = secret,
                Err(e) => tracing::warn!(
                    error = %e,
                    "Invalid BEACON_NETWORK_SECRET, using default (dev-only)"
                ),
            }
        }
        if let Some(hex_key) = lookup("BEACON_NODE_SECRET") {
            match parse_secret_hex(&hex_key) {
                Ok(secret) => config.node_secret = Some(secret),
                Err(e) => tracing::warn!(error = %e, "Invalid BEACON_NODE_SECRET, generating one"),
            }
        }

        config
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_into<T>(slot: &mut T, key: &str, raw: &str)
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => *slot = v,
        _ => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}
