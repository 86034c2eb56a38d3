use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::constants::{KDF_CONTEXT_LIBP2P_KEY, KDF_CONTEXT_NOISE_STATIC};
use crate::error::CryptoError;

/// Long-lived key material of this gateway node.
///
/// The Ed25519 key signs relay events; the libp2p identity and the Noise
/// static key are derived from the same secret so one seed describes the node.
#[derive(Clone)]
pub struct NodeKeys {
    signing_key: SigningKey,
}

impl NodeKeys {
    /// Generate a new random node key
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Seed for the libp2p Ed25519 keypair.
    pub fn libp2p_seed(&self) -> [u8; 32] {
        blake3::derive_key(KDF_CONTEXT_LIBP2P_KEY, self.signing_key.as_bytes())
    }

    /// X25519 static private key used by the Noise handshake.
    pub fn noise_static_secret(&self) -> [u8; 32] {
        let seed = blake3::derive_key(KDF_CONTEXT_NOISE_STATIC, self.signing_key.as_bytes());
        x25519_dalek::StaticSecret::from(seed).to_bytes()
    }
}

impl std::fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeys")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Verify a hex-encoded signature against a hex-encoded public key.
pub fn verify_signature_hex(
    pubkey_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), CryptoError> {
    let pubkey: [u8; 32] = hex::decode(pubkey_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(CryptoError::InvalidKeyLength)?;
    let signature: [u8; 64] = hex::decode(signature_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(CryptoError::InvalidSignature)?;

    let verifying_key =
        VerifyingKey::from_bytes(&pubkey).map_err(|_| CryptoError::InvalidKeyLength)?;
    verifying_key
        .verify(message, &Signature::from_bytes(&signature))
        .map_err(|_| CryptoError::InvalidSignature)
}
