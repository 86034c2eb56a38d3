//! Construction of providers for the router.
//!
//! The router never names a backend client. It asks a [`ProviderFactory`]
//! for a provider of some kind plus the endpoints to hand its supervisor,
//! so the same router runs over real networks or an in-process hub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use beacon_net::{BackendClient, MemoryBackend, MemoryHub, RelayClient, SecureClient, SwarmClient};
use beacon_shared::identity::NodeKeys;
use beacon_shared::{ConnectionError, ProviderKind};

use crate::adapters::{Adapter, AdapterConfig, P2pCodec, RelayCodec, SecureCodec};
use crate::config::GatewayConfig;
use crate::provider::Provider;

pub trait ProviderFactory: Send + Sync + 'static {
    fn build(&self, kind: ProviderKind) -> Result<Provider, ConnectionError>;

    fn endpoints(&self, kind: ProviderKind) -> Vec<String>;
}

fn adapter_config(config: &GatewayConfig) -> AdapterConfig {
    AdapterConfig {
        connect_timeout: config.connect_timeout,
        default_max_message_size: config.max_message_size,
        network_secret: config.network_secret,
    }
}

fn wrap(
    kind: ProviderKind,
    backend: Arc<dyn BackendClient>,
    keys: &Arc<NodeKeys>,
    config: AdapterConfig,
) -> Provider {
    match kind {
        ProviderKind::P2p => Provider::P2p(Adapter::new(P2pCodec::new(), backend, config)),
        ProviderKind::Relay => {
            Provider::Relay(Adapter::new(RelayCodec::new(keys.clone()), backend, config))
        }
        ProviderKind::Secure => Provider::Secure(Adapter::new(SecureCodec, backend, config)),
    }
}

/// Providers over the real backends: libp2p gossip, NIP-01 relays and the
/// secure hub.
pub struct NetworkFactory {
    keys: Arc<NodeKeys>,
    p2p_port: u16,
    adapter: AdapterConfig,
    endpoints: HashMap<ProviderKind, Vec<String>>,
}

impl NetworkFactory {
    pub fn new(config: &GatewayConfig) -> Self {
        let keys = match &config.node_secret {
            Some(secret) => NodeKeys::from_secret_bytes(secret),
            None => NodeKeys::generate(),
        };
        info!(node = %keys.public_key_hex(), "Node key loaded");
        Self {
            keys: Arc::new(keys),
            p2p_port: config.p2p_port,
            adapter: adapter_config(config),
            endpoints: ProviderKind::ALL
                .iter()
                .map(|kind| (*kind, config.endpoints(*kind).to_vec()))
                .collect(),
        }
    }

    pub fn keys(&self) -> &NodeKeys {
        &self.keys
    }
}

impl ProviderFactory for NetworkFactory {
    fn build(&self, kind: ProviderKind) -> Result<Provider, ConnectionError> {
        let backend: Arc<dyn BackendClient> = match kind {
            ProviderKind::P2p => Arc::new(
                SwarmClient::new(self.keys.libp2p_seed(), self.p2p_port)
                    .map_err(|e| ConnectionError::Handshake(format!("libp2p identity: {e}")))?,
            ),
            ProviderKind::Relay => Arc::new(RelayClient::new()),
            ProviderKind::Secure => Arc::new(SecureClient::new(self.keys.noise_static_secret())),
        };
        Ok(wrap(kind, backend, &self.keys, self.adapter.clone()))
    }

    fn endpoints(&self, kind: ProviderKind) -> Vec<String> {
        self.endpoints.get(&kind).cloned().unwrap_or_default()
    }
}

/// One in-process hub per provider kind. Every gateway built from the same
/// network sees the others.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hubs: Arc<HashMap<ProviderKind, MemoryHub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            hubs: Arc::new(
                ProviderKind::ALL
                    .iter()
                    .map(|kind| (*kind, MemoryHub::new()))
                    .collect(),
            ),
        }
    }

    pub fn hub(&self, kind: ProviderKind) -> MemoryHub {
        self.hubs.get(&kind).cloned().unwrap_or_default()
    }

    /// Factory for the node called `peer`.
    pub fn factory(&self, peer: &str, config: &GatewayConfig) -> Arc<MemoryFactory> {
        Arc::new(MemoryFactory {
            network: self.clone(),
            peer: peer.to_string(),
            keys: Arc::new(NodeKeys::generate()),
            adapter: adapter_config(config),
            backends: Mutex::new(HashMap::new()),
        })
    }
}

/// Providers over a [`MemoryNetwork`]. Each kind gets one backend for the
/// lifetime of the factory so faults can be injected from outside.
pub struct MemoryFactory {
    network: MemoryNetwork,
    peer: String,
    keys: Arc<NodeKeys>,
    adapter: AdapterConfig,
    backends: Mutex<HashMap<ProviderKind, Arc<MemoryBackend>>>,
}

impl MemoryFactory {
    pub fn backend(&self, kind: ProviderKind) -> Arc<MemoryBackend> {
        let mut backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
        backends
            .entry(kind)
            .or_insert_with(|| Arc::new(MemoryBackend::new(&self.network.hub(kind), self.peer.clone())))
            .clone()
    }
}

impl ProviderFactory for MemoryFactory {
    fn build(&self, kind: ProviderKind) -> Result<Provider, ConnectionError> {
        Ok(wrap(kind, self.backend(kind), &self.keys, self.adapter.clone()))
    }

    fn endpoints(&self, _kind: ProviderKind) -> Vec<String> {
        Vec::new()
    }
}
