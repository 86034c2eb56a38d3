//! ML-KEM-768 (Kyber768) key encapsulation used to seed the Noise PSK.
//!
//! The initiator sends a fresh public key, the responder encapsulates to it,
//! and both sides run the shared secret through a BLAKE3 KDF to obtain the
//! 32-byte pre-shared key for `Noise_XXpsk3`.

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext, PublicKey, SharedSecret};

use crate::constants::KDF_CONTEXT_PQ_PSK;
use crate::error::PqcError;

/// Ephemeral ML-KEM keypair, held by the initiator for one handshake.
pub struct KemKeypair {
    public: kyber768::PublicKey,
    secret: kyber768::SecretKey,
}

impl KemKeypair {
    pub fn generate() -> Self {
        let (public, secret) = kyber768::keypair();
        Self { public, secret }
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    /// Recover the PSK from the responder's ciphertext.
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<[u8; 32], PqcError> {
        let ciphertext =
            kyber768::Ciphertext::from_bytes(ciphertext).map_err(|_| PqcError::InvalidCiphertext)?;
        let shared = kyber768::decapsulate(&ciphertext, &self.secret);
        Ok(derive_psk(shared.as_bytes()))
    }
}

/// Encapsulate to the initiator's public key. Returns `(ciphertext, psk)`.
pub fn encapsulate(public_key: &[u8]) -> Result<(Vec<u8>, [u8; 32]), PqcError> {
    let public_key =
        kyber768::PublicKey::from_bytes(public_key).map_err(|_| PqcError::InvalidPublicKey)?;
    let (shared, ciphertext) = kyber768::encapsulate(&public_key);
    Ok((ciphertext.as_bytes().to_vec(), derive_psk(shared.as_bytes())))
}

fn derive_psk(shared_secret: &[u8]) -> [u8; 32] {
    blake3::derive_key(KDF_CONTEXT_PQ_PSK, shared_secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_psk() {
        let initiator = KemKeypair::generate();
        let (ciphertext, responder_psk) = encapsulate(&initiator.public_bytes()).unwrap();
        let initiator_psk = initiator.decapsulate(&ciphertext).unwrap();
        assert_eq!(initiator_psk, responder_psk);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        assert!(matches!(encapsulate(&[0u8; 10]), Err(PqcError::InvalidPublicKey)));
        let kp = KemKeypair::generate();
        assert!(matches!(kp.decapsulate(&[0u8; 10]), Err(PqcError::InvalidCiphertext)));
    }
}
