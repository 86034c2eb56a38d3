use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_CHANNEL_KEY, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;
use crate::types::ChannelId;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

// BLAKE3 KDF with domain separation
pub fn derive_channel_key(network_secret: &[u8; 32], channel_id: &ChannelId) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_CHANNEL_KEY);
    hasher.update(network_secret);
    hasher.update(channel_id.as_str().as_bytes());
    *hasher.finalize().as_bytes()
}

/// Parse a 64-character hex secret.
pub fn parse_secret_hex(hex_str: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(hex_str.trim()).map_err(|_| CryptoError::InvalidKeyLength)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> SymmetricKey {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = encrypt(&random_key(), b"status report").unwrap();
        assert!(decrypt(&random_key(), &encrypted).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = random_key();
        let mut encrypted = encrypt(&key, b"evacuate sector 4").unwrap();
        let len = encrypted.len();
        encrypted[len - 1] ^= 0xFF;

        assert!(decrypt(&key, &encrypted).is_err());
    }

    #[test]
    fn test_short_input_fails() {
        assert!(decrypt(&random_key(), &[0u8; NONCE_SIZE - 1]).is_err());
    }

    #[test]
    fn test_channel_key_is_scoped_to_channel_and_network() {
        let ops = ChannelId::new("team:ops").unwrap();
        let med = ChannelId::new("team:medical").unwrap();

        let k1 = derive_channel_key(&[1u8; 32], &ops);
        assert_eq!(k1, derive_channel_key(&[1u8; 32], &ops));
        assert_ne!(k1, derive_channel_key(&[1u8; 32], &med));
        assert_ne!(k1, derive_channel_key(&[2u8; 32], &ops));
    }

    #[test]
    fn test_parse_secret_hex() {
        assert_eq!(parse_secret_hex(&"ab".repeat(32)).unwrap(), [0xab; 32]);
        assert!(parse_secret_hex("abcd").is_err());
        assert!(parse_secret_hex(&"zz".repeat(32)).is_err());
    }
}
