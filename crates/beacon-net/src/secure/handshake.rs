//! PQ-hybrid handshake: ML-KEM-768 seeds the PSK of a Noise_XXpsk3 session.
//!
//! ```text
//! initiator                          responder
//!   KemOffer(pk)            ->
//!                           <-       KemReply(ct)
//!   Noise(e)                ->
//!                           <-       Noise(e, ee, s, es)
//!   Noise(s, se, psk)       ->
//! ```
//!
//! Both halves run over any `AsyncRead + AsyncWrite`, framed with a
//! length-delimited codec.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use snow::TransportState;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use beacon_shared::constants::MAX_FRAME_SIZE;
use beacon_shared::noise;
use beacon_shared::pqc::{self, KemKeypair};
use beacon_shared::protocol::{HandshakeFrame, SecureFrame};

use crate::backend::BackendError;

/// An established, encrypted, framed session.
pub struct SecureChannel<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    transport: TransportState,
    remote_static: Vec<u8>,
}

fn framed<S: AsyncRead + AsyncWrite>(io: S) -> Framed<S, LengthDelimitedCodec> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE + 1024)
        .new_codec();
    Framed::new(io, codec)
}

fn handshake_err(e: impl std::fmt::Display) -> BackendError {
    BackendError::Handshake(e.to_string())
}

async fn send_handshake<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    frame: HandshakeFrame,
) -> Result<(), BackendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = frame.to_bytes().map_err(handshake_err)?;
    framed.send(Bytes::from(bytes)).await.map_err(handshake_err)
}

async fn recv_handshake<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
) -> Result<HandshakeFrame, BackendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(buf)) => HandshakeFrame::from_bytes(&buf).map_err(handshake_err),
        Some(Err(e)) => Err(handshake_err(e)),
        None => Err(BackendError::Handshake("peer closed during handshake".into())),
    }
}

async fn recv_noise<S>(framed: &mut Framed<S, LengthDelimitedCodec>) -> Result<Vec<u8>, BackendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match recv_handshake(framed).await? {
        HandshakeFrame::Noise(msg) => Ok(msg),
        other => Err(BackendError::Handshake(format!("expected Noise frame, got {other:?}"))),
    }
}

/// Run the initiator half.
pub async fn initiate<S>(io: S, static_key: &[u8; 32]) -> Result<SecureChannel<S>, BackendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = framed(io);

    let kem = KemKeypair::generate();
    send_handshake(&mut framed, HandshakeFrame::KemOffer(kem.public_bytes())).await?;
    let psk = match recv_handshake(&mut framed).await? {
        HandshakeFrame::KemReply(ciphertext) => kem.decapsulate(&ciphertext).map_err(handshake_err)?,
        other => return Err(BackendError::Handshake(format!("expected KemReply, got {other:?}"))),
    };

    let mut state = noise::build_initiator(static_key, &psk).map_err(handshake_err)?;
    let msg1 = noise::write_handshake(&mut state).map_err(handshake_err)?;
    send_handshake(&mut framed, HandshakeFrame::Noise(msg1)).await?;
    let msg2 = recv_noise(&mut framed).await?;
    noise::read_handshake(&mut state, &msg2).map_err(handshake_err)?;
    let msg3 = noise::write_handshake(&mut state).map_err(handshake_err)?;
    send_handshake(&mut framed, HandshakeFrame::Noise(msg3)).await?;

    let (transport, remote_static) = noise::into_transport(state).map_err(handshake_err)?;
    Ok(SecureChannel {
        framed,
        transport,
        remote_static,
    })
}

/// Run the responder half.
pub async fn respond<S>(io: S, static_key: &[u8; 32]) -> Result<SecureChannel<S>, BackendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = framed(io);

    let psk = match recv_handshake(&mut framed).await? {
        HandshakeFrame::KemOffer(public_key) => {
            let (ciphertext, psk) = pqc::encapsulate(&public_key).map_err(handshake_err)?;
            send_handshake(&mut framed, HandshakeFrame::KemReply(ciphertext)).await?;
            psk
        }
        other => return Err(BackendError::Handshake(format!("expected KemOffer, got {other:?}"))),
    };

    let mut state = noise::build_responder(static_key, &psk).map_err(handshake_err)?;
    let msg1 = recv_noise(&mut framed).await?;
    noise::read_handshake(&mut state, &msg1).map_err(handshake_err)?;
    let msg2 = noise::write_handshake(&mut state).map_err(handshake_err)?;
    send_handshake(&mut framed, HandshakeFrame::Noise(msg2)).await?;
    let msg3 = recv_noise(&mut framed).await?;
    noise::read_handshake(&mut state, &msg3).map_err(handshake_err)?;

    let (transport, remote_static) = noise::into_transport(state).map_err(handshake_err)?;
    Ok(SecureChannel {
        framed,
        transport,
        remote_static,
    })
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Remote X25519 static key, hex encoded.
    pub fn remote_static_hex(&self) -> String {
        hex::encode(&self.remote_static)
    }

    pub async fn send(&mut self, frame: &SecureFrame) -> Result<(), BackendError> {
        let plaintext = frame
            .to_bytes()
            .map_err(|e| BackendError::Rejected(e.to_string()))?;
        let ciphertext = noise::transport_encrypt(&mut self.transport, &plaintext)
            .map_err(|e| BackendError::Rejected(e.to_string()))?;
        self.framed
            .send(Bytes::from(ciphertext))
            .await
            .map_err(|_| BackendError::Closed)
    }

    /// Next frame; `None` once the peer has closed the stream.
    pub async fn recv(&mut self) -> Option<Result<SecureFrame, BackendError>> {
        let buf = match self.framed.next().await? {
            Ok(buf) => buf,
            Err(_) => return Some(Err(BackendError::Closed)),
        };
        Some(self.open(&buf))
    }

    fn open(&mut self, buf: &[u8]) -> Result<SecureFrame, BackendError> {
        let plaintext = noise::transport_decrypt(&mut self.transport, buf)
            .map_err(|e| BackendError::Rejected(e.to_string()))?;
        SecureFrame::from_bytes(&plaintext).map_err(|e| BackendError::Rejected(e.to_string()))
    }
}
