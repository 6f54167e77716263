//! Real-time push of mesh state to browser viewers.
//!
//! Viewers open a WebSocket to the configured endpoint and receive one text message
//! per event:
//!
//! ```text
//! {"event":"drone_data","data":{"self":{...},"neighbors":[...]}}
//! ```
//!
//! A client gets the current snapshot as soon as the handshake completes and one event
//! per change afterwards. Publishing never waits on clients: slow clients skip missed
//! updates and clients whose socket fails are dropped.
use crate::mesh::{self, MeshHandle, MeshSnapshot, SnapshotPublisher};
use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::Message;

pub const EVENT_NAME: &str = "drone_data";
const CHANNEL_CAPACITY: usize = 64;
/// Wait after a failed accept (e.g. out of file descriptors) before trying again
pub(crate) const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Serialize)]
struct ViewerEvent<'a> {
    event: &'static str,
    data: &'a MeshSnapshot,
}

/// Encode one event as the text of a WebSocket message.
pub fn encode_event(snapshot: &MeshSnapshot) -> Result<String> {
    Ok(serde_json::to_string(&ViewerEvent {
        event: EVENT_NAME,
        data: snapshot,
    })?)
}

#[derive(Debug, Clone)]
pub struct ViewerHub {
    tx: broadcast::Sender<Arc<str>>,
}

impl Default for ViewerHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewerHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    pub fn viewer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow!("Failed to bind viewer endpoint {}: {}", addr, e))
    }

    /// Accept viewers until the engine shuts down.
    pub async fn serve(self, listener: TcpListener, handle: MeshHandle) {
        if let Ok(addr) = listener.local_addr() {
            info!("Viewer endpoint listening on ws://{}", addr);
        }
        let mut shutdown = handle.shutdown_signal();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let rx = self.subscribe();
                        tokio::spawn(serve_client(stream, peer, rx, handle.clone()));
                    }
                    Err(e) => {
                        warn!(
                            "Viewer accept failed: {} (retrying in {:?})",
                            e, ACCEPT_ERROR_BACKOFF
                        );
                        if mesh::pause(&mut shutdown, ACCEPT_ERROR_BACKOFF).await {
                            break;
                        }
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Viewer endpoint shutting down");
    }
}

impl SnapshotPublisher for ViewerHub {
    fn publish(&self, snapshot: &MeshSnapshot) {
        match encode_event(snapshot) {
            // No subscribers is fine
            Ok(line) => {
                let _ = self.tx.send(Arc::from(line));
            }
            Err(e) => warn!("Failed to encode viewer event: {}", e),
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Arc<str>>,
    handle: MeshHandle,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Viewer {} failed the WebSocket handshake: {}", peer, e);
            return;
        }
    };
    info!("Viewer connected: {}", peer);
    let (mut outgoing, mut incoming) = ws.split();
    let mut shutdown = handle.shutdown_signal();

    let first = match encode_event(&handle.snapshot()) {
        Ok(line) => line,
        Err(e) => {
            warn!("Failed to encode viewer event: {}", e);
            return;
        }
    };
    if outgoing.send(Message::text(first)).await.is_err() {
        debug!("Viewer {} went away before the first event", peer);
        return;
    }

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(line) => {
                    if let Err(e) = outgoing.send(Message::text(line.to_string())).await {
                        debug!("Dropping viewer {}: {}", peer, e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Viewer {} lagged, skipped {} updates", peer, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            // Viewers only listen; reading keeps pings answered and notices closes
            frame = incoming.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Dropping viewer {}: {}", peer, e);
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = outgoing.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
    info!("Viewer disconnected: {}", peer);
}
