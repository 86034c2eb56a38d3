use snow::{Builder, HandshakeState, TransportState};

use crate::constants::NOISE_MAX_PAYLOAD;
use crate::error::NoiseError;

/// XX with a pre-shared key mixed in after the third message. The PSK comes
/// from the ML-KEM exchange, so the session stays confidential even if
/// X25519 falls.
const NOISE_PATTERN: &str = "Noise_XXpsk3_25519_ChaChaPoly_BLAKE2s";

fn builder<'a>(local_private_key: &'a [u8; 32], psk: &'a [u8; 32]) -> Result<Builder<'a>, NoiseError> {
    Ok(Builder::new(
        NOISE_PATTERN
            .parse()
            .map_err(|e| NoiseError::Handshake(format!("{e}")))?,
    )
    .local_private_key(local_private_key)
    .psk(3, psk))
}

pub fn build_initiator(
    local_private_key: &[u8; 32],
    psk: &[u8; 32],
) -> Result<HandshakeState, NoiseError> {
    builder(local_private_key, psk)?
        .build_initiator()
        .map_err(|e| NoiseError::Handshake(format!("{e}")))
}

pub fn build_responder(
    local_private_key: &[u8; 32],
    psk: &[u8; 32],
) -> Result<HandshakeState, NoiseError> {
    builder(local_private_key, psk)?
        .build_responder()
        .map_err(|e| NoiseError::Handshake(format!("{e}")))
}

/// Write the next handshake message (empty payload).
pub fn write_handshake(state: &mut HandshakeState) -> Result<Vec<u8>, NoiseError> {
    let mut buf = vec![0u8; 1024];
    let len = state
        .write_message(&[], &mut buf)
        .map_err(|e| NoiseError::Handshake(format!("{e}")))?;
    buf.truncate(len);
    Ok(buf)
}

/// Read the next handshake message.
pub fn read_handshake(state: &mut HandshakeState, message: &[u8]) -> Result<(), NoiseError> {
    let mut buf = vec![0u8; message.len()];
    state
        .read_message(message, &mut buf)
        .map_err(|e| NoiseError::Handshake(format!("{e}")))?;
    Ok(())
}

// Finalize handshake -> transport mode, returning the remote static key
pub fn into_transport(state: HandshakeState) -> Result<(TransportState, Vec<u8>), NoiseError> {
    let remote_static = state.get_remote_static().map(<[u8]>::to_vec).unwrap_or_default();
    let transport = state
        .into_transport_mode()
        .map_err(|e| NoiseError::Transport(format!("{e}")))?;
    Ok((transport, remote_static))
}

pub fn transport_encrypt(
    transport: &mut TransportState,
    plaintext: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    if plaintext.len() > NOISE_MAX_PAYLOAD {
        return Err(NoiseError::Transport(format!(
            "payload of {} bytes exceeds {NOISE_MAX_PAYLOAD}",
            plaintext.len()
        )));
    }
    let mut buf = vec![0u8; plaintext.len() + 64]; // extra space for auth tag
    let len = transport
        .write_message(plaintext, &mut buf)
        .map_err(|e| NoiseError::Transport(format!("{e}")))?;
    buf.truncate(len);
    Ok(buf)
}

pub fn transport_decrypt(
    transport: &mut TransportState,
    ciphertext: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    let mut buf = vec![0u8; ciphertext.len()];
    let len = transport
        .read_message(ciphertext, &mut buf)
        .map_err(|e| NoiseError::Transport(format!("{e}")))?;
    buf.truncate(len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_key() -> [u8; 32] {
        x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng).to_bytes()
    }

    fn run_handshake(
        psk_i: [u8; 32],
        psk_r: [u8; 32],
    ) -> Result<(TransportState, TransportState), NoiseError> {
        let mut initiator = build_initiator(&static_key(), &psk_i)?;
        let mut responder = build_responder(&static_key(), &psk_r)?;

        // -> e
        let msg1 = write_handshake(&mut initiator)?;
        read_handshake(&mut responder, &msg1)?;
        // <- e, ee, s, es
        let msg2 = write_handshake(&mut responder)?;
        read_handshake(&mut initiator, &msg2)?;
        // -> s, se, psk
        let msg3 = write_handshake(&mut initiator)?;
        read_handshake(&mut responder, &msg3)?;

        Ok((into_transport(initiator)?.0, into_transport(responder)?.0))
    }

    #[test]
    fn test_handshake_with_matching_psk() {
        let (mut i, mut r) = run_handshake([7u8; 32], [7u8; 32]).unwrap();

        let encrypted = transport_encrypt(&mut i, b"channel frame").unwrap();
        assert_eq!(transport_decrypt(&mut r, &encrypted).unwrap(), b"channel frame");

        let encrypted = transport_encrypt(&mut r, b"reply").unwrap();
        assert_eq!(transport_decrypt(&mut i, &encrypted).unwrap(), b"reply");
    }

    #[test]
    fn test_handshake_with_mismatched_psk_fails() {
        assert!(run_handshake([7u8; 32], [8u8; 32]).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (mut i, _) = run_handshake([1u8; 32], [1u8; 32]).unwrap();
        assert!(transport_encrypt(&mut i, &vec![0u8; NOISE_MAX_PAYLOAD + 1]).is_err());
    }
}
