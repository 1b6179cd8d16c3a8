//! WebSocket transport for the broadcaster.
//!
//! Each accepted connection becomes one subscription. Payloads are sent as
//! JSON text frames; text frames from the client are logged and otherwise
//! ignored; a close frame, a transport error or a failed send ends the
//! connection and unsubscribes it.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::PositionBroadcaster;

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listen address could not be bound. Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The WebSocket handshake with one client failed.
    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: SocketAddr, reason: String },

    /// Sending to one client failed.
    #[error("send to {peer} failed: {reason}")]
    Send { peer: SocketAddr, reason: String },
}

/// Accepts WebSocket subscribers and feeds them from a broadcaster.
pub struct BroadcastServer {
    listener: TcpListener,
    broadcaster: Arc<PositionBroadcaster>,
}

impl BroadcastServer {
    /// Bind the listen address.
    pub async fn bind(
        addr: &str,
        broadcaster: Arc<PositionBroadcaster>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            broadcaster,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "Broadcast server listening");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let broadcaster = Arc::clone(&self.broadcaster);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, broadcaster, cancel).await {
                                warn!(error = %e, "Subscriber connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        self.broadcaster.close_all();
        info!("Broadcast server stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broadcaster: Arc<PositionBroadcaster>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::Handshake {
            peer,
            reason: e.to_string(),
        })?;
    let (mut sink, mut source) = ws.split();

    let mut subscription = broadcaster.subscribe();
    let id = subscription.id();
    info!(%peer, subscriber = %id, "Subscriber connected");

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }
            payload = subscription.recv() => {
                let Some(payload) = payload else { break Ok(()) };
                let text = match payload.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode payload");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    break Err(TransportError::Send { peer, reason: e.to_string() });
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    info!(%peer, subscriber = %id, message = %text, "Message from subscriber");
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "Subscriber transport error");
                    break Ok(());
                }
            },
        }
    };

    broadcaster.unsubscribe(id);
    info!(%peer, subscriber = %id, "Subscriber disconnected");
    result
}
