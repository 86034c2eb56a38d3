// Backend clients: libp2p gossip swarm, NIP-01 relay, PQ-hybrid secure hub
// client and an in-process memory hub, all behind `BackendClient`.

pub mod backend;
pub mod behaviour;
pub mod crdt;
pub mod discovery;
pub mod memory;
pub mod p2p;
pub mod peers;
pub mod relay;
pub mod secure;
pub mod swarm;
pub mod transport;

pub use backend::{BackendClient, BackendError, BackendNotification};
pub use behaviour::{BeaconBehaviour, BeaconEvent};
pub use crdt::MessageSet;
pub use memory::{MemoryBackend, MemoryHub};
pub use p2p::SwarmClient;
pub use peers::PeerTracker;
pub use relay::{NostrEvent, RelayClient};
pub use secure::{SecureClient, SecureHub};
pub use swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmNotification};
pub use transport::build_swarm;
