//! Minimal secure hub: accepts PQ-hybrid sessions and fans `Publish` frames
//! out to every other session subscribed to the topic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beacon_shared::protocol::SecureFrame;

use super::handshake::respond;

type Routes = Arc<Mutex<HashMap<String, HashMap<u64, mpsc::Sender<SecureFrame>>>>>;

/// Running hub. Dropping it stops the listener and every session.
pub struct SecureHub {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl SecureHub {
    pub async fn bind(addr: impl ToSocketAddrs, static_key: [u8; 32]) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let routes: Routes = Arc::default();

        info!(addr = %local_addr, "Secure hub listening");

        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut next_id = 0u64;
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        tokio::spawn(serve_session(
                            next_id,
                            stream,
                            peer,
                            static_key,
                            routes.clone(),
                            accept_cancel.child_token(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Secure hub accept failed"),
                }
            }
            debug!("Secure hub stopped");
        });

        Ok(Self { local_addr, cancel })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for SecureHub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_session(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    static_key: [u8; 32],
    routes: Routes,
    cancel: CancellationToken,
) {
    let mut chan = match respond(stream, &static_key).await {
        Ok(chan) => chan,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Secure hub handshake failed");
            return;
        }
    };
    let source = chan.remote_static_hex();
    let (out_tx, mut out_rx) = mpsc::channel::<SecureFrame>(256);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            outbound = out_rx.recv() => {
                let Some(frame) = outbound else { break };
                if chan.send(&frame).await.is_err() {
                    break;
                }
            }

            incoming = chan.recv() => {
                match incoming {
                    Some(Ok(SecureFrame::Subscribe { topic })) => {
                        if let Ok(mut routes) = routes.lock() {
                            routes.entry(topic).or_default().insert(id, out_tx.clone());
                        }
                    }
                    Some(Ok(SecureFrame::Unsubscribe { topic })) => {
                        if let Ok(mut routes) = routes.lock() {
                            if let Some(subs) = routes.get_mut(&topic) {
                                subs.remove(&id);
                            }
                        }
                    }
                    Some(Ok(SecureFrame::Publish { topic, data })) => {
                        let targets: Vec<mpsc::Sender<SecureFrame>> = routes
                            .lock()
                            .map(|routes| {
                                routes
                                    .get(&topic)
                                    .map(|subs| {
                                        subs.iter()
                                            .filter(|(sub_id, _)| **sub_id != id)
                                            .map(|(_, tx)| tx.clone())
                                            .collect()
                                    })
                                    .unwrap_or_default()
                            })
                            .unwrap_or_default();
                        for tx in targets {
                            let _ = tx.try_send(SecureFrame::Deliver {
                                topic: topic.clone(),
                                source: Some(source.clone()),
                                data: data.clone(),
                            });
                        }
                    }
                    Some(Ok(SecureFrame::Deliver { .. })) => {
                        debug!(peer = %peer, "Client sent Deliver frame, ignoring");
                    }
                    Some(Err(_)) | None => break,
                }
            }
        }
    }

    if let Ok(mut routes) = routes.lock() {
        for subs in routes.values_mut() {
            subs.remove(&id);
        }
    }
    debug!(peer = %peer, "Secure hub session ended");
}
