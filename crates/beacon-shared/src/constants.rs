/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/beacon/1.0.0";

/// Application name
pub const APP_NAME: &str = "Beacon";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Default channel `max_message_size` in bytes (16 KiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16_384;

/// Upper bound any channel may declare (48 KiB). Keeps a sealed chat
/// envelope inside one Noise transport message.
pub const MAX_MESSAGE_SIZE_CEILING: usize = 49_152;

/// Largest wire frame accepted by any backend (64 KiB)
pub const MAX_FRAME_SIZE: usize = 65_536;

/// Largest plaintext a single Noise transport message can carry
pub const NOISE_MAX_PAYLOAD: usize = 65_535 - 16;

/// Maximum length of a channel id
pub const MAX_CHANNEL_ID_LEN: usize = 128;

/// Maximum length of a channel name or display name
pub const MAX_NAME_LEN: usize = 64;

/// GossipSub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Default QUIC listen port
pub const DEFAULT_QUIC_PORT: u16 = 4011;

/// Prefix of every backend topic carrying a channel
pub const TOPIC_PREFIX: &str = "beacon/channel/";

/// NIP-01 event kinds used on relays
pub const NOSTR_KIND_CHANNEL_MESSAGE: u16 = 42;
pub const NOSTR_KIND_PRESENCE: u16 = 20_001;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_CHANNEL_KEY: &str = "beacon-channel-key-v1";
pub const KDF_CONTEXT_LIBP2P_KEY: &str = "beacon-libp2p-keypair-v1";
pub const KDF_CONTEXT_NOISE_STATIC: &str = "beacon-noise-static-v1";
pub const KDF_CONTEXT_PQ_PSK: &str = "beacon-pq-psk-v1";

/// Network secret used when none is configured (development only).
pub const DEV_NETWORK_SECRET: [u8; 32] = *b"beacon-dev-network-secret-000000";
