//! WebSocket transport — server and client connections.
//!
//! Provides the low-level WebSocket plumbing between nodes. Every connection
//! starts with a [`Frame::Hello`] from the dialing side so both ends can key
//! the connection by the remote peer's [`PublicKeyId`]. Received frames are
//! forwarded into the node's event channel as [`TransportEvent`]s.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::driver::ShutdownSignal;
use crate::error::CommError;
use crate::identity::PublicKeyId;
use crate::message::{Frame, Message};

/// Type alias for the write half of a server-side WebSocket.
type ServerWsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Type alias for the write half of a client-side WebSocket.
type ClientWsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Process-wide source of connection ids.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one socket, independent of the peer it belongs to.
pub type ConnectionId = u64;

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A handle to an active WebSocket connection with a peer.
///
/// Wraps the write-half of the WebSocket stream. The read-half is consumed by
/// a background task that forwards incoming frames to the node and reports
/// the end of the stream with this connection's id.
pub struct PeerConnection {
    id: ConnectionId,
    pk_id: PublicKeyId,
    sink: PeerSink,
}

/// The write side can be either a server-accepted or client-initiated socket.
enum PeerSink {
    Server(ServerWsSink),
    Client(ClientWsSink),
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("pk_id", &self.pk_id)
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    fn from_server(id: ConnectionId, pk_id: PublicKeyId, sink: ServerWsSink) -> Self {
        Self {
            id,
            pk_id,
            sink: PeerSink::Server(sink),
        }
    }

    fn from_client(id: ConnectionId, pk_id: PublicKeyId, sink: ClientWsSink) -> Self {
        Self {
            id,
            pk_id,
            sink: PeerSink::Client(sink),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The remote peer this connection is associated with.
    pub fn pk_id(&self) -> &PublicKeyId {
        &self.pk_id
    }

    /// Send a frame over the WebSocket connection.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), CommError> {
        let json = frame.to_json()?;
        let msg = WsMessage::Text(json.into());
        match &mut self.sink {
            PeerSink::Server(sink) => sink
                .send(msg)
                .await
                .map_err(|e| CommError::Transport(format!("Send error: {e}")))?,
            PeerSink::Client(sink) => sink
                .send(msg)
                .await
                .map_err(|e| CommError::Transport(format!("Send error: {e}")))?,
        }
        Ok(())
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        let close_msg = WsMessage::Close(None);
        match &mut self.sink {
            PeerSink::Server(sink) => {
                let _ = sink.send(close_msg).await;
            }
            PeerSink::Client(sink) => {
                let _ = sink.send(close_msg).await;
            }
        }
    }
}

/// An incoming event from the transport layer.
#[derive(Debug)]
pub enum TransportEvent {
    /// A remote node dialed us and introduced itself.
    Inbound {
        pk_id: PublicKeyId,
        endpoint: String,
        conn: PeerConnection,
    },
    /// A session message arrived from a peer.
    Message { from: PublicKeyId, message: Message },
    /// One of a peer's connections ended. Other connections to the same
    /// peer are unaffected.
    Disconnected {
        pk_id: PublicKeyId,
        conn_id: ConnectionId,
    },
}

/// Accept WebSocket connections on `listener` until `shutdown` fires.
///
/// Each accepted socket must open with a `Hello` frame; its write half is
/// then handed to the node through `event_tx` and a read loop is spawned.
pub async fn serve(
    listener: TcpListener,
    event_tx: mpsc::Sender<TransportEvent>,
    mut shutdown: ShutdownSignal,
) -> Result<(), CommError> {
    let local = listener.local_addr()?;
    info!("WebSocket server listening on {local}");

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let event_tx = event_tx.clone();
                        tokio::spawn(async move {
                            let ws_stream = match accept_async(stream).await {
                                Ok(ws) => ws,
                                Err(e) => {
                                    error!("WebSocket accept failed for {peer_addr}: {e}");
                                    return;
                                }
                            };
                            let (sink, mut stream) = ws_stream.split();

                            let (pk_id, endpoint) = match stream.next().await {
                                Some(Ok(WsMessage::Text(text))) => match Frame::from_json(&text) {
                                    Ok(Frame::Hello { pk_id, endpoint }) => (pk_id, endpoint),
                                    Ok(_) => {
                                        warn!("Peer at {peer_addr} skipped the hello frame");
                                        return;
                                    }
                                    Err(e) => {
                                        warn!("Bad hello from {peer_addr}: {e}");
                                        return;
                                    }
                                },
                                _ => {
                                    debug!("Peer at {peer_addr} closed before hello");
                                    return;
                                }
                            };

                            debug!("Inbound connection from {pk_id} at {peer_addr}");
                            let conn_id = next_connection_id();
                            let conn = PeerConnection::from_server(conn_id, pk_id.clone(), sink);
                            let _ = event_tx
                                .send(TransportEvent::Inbound {
                                    pk_id: pk_id.clone(),
                                    endpoint,
                                    conn,
                                })
                                .await;

                            read_loop(stream, pk_id, conn_id, event_tx).await;
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("WebSocket server on {local} shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Dial a remote node, introduce ourselves with `hello`, and spawn a read
/// loop tagging incoming frames with `remote`.
pub async fn connect_to_peer(
    dial_target: &str,
    remote: PublicKeyId,
    hello: &Frame,
    event_tx: mpsc::Sender<TransportEvent>,
) -> Result<PeerConnection, CommError> {
    let url = if dial_target.starts_with("ws://") || dial_target.starts_with("wss://") {
        dial_target.to_string()
    } else {
        format!("ws://{dial_target}")
    };

    let (ws_stream, _) = connect_async(&url)
        .await
        .map_err(|e| CommError::Transport(format!("Connect to {dial_target} failed: {e}")))?;

    let (sink, stream) = ws_stream.split();
    let conn_id = next_connection_id();
    let mut conn = PeerConnection::from_client(conn_id, remote.clone(), sink);
    conn.send(hello).await?;

    tokio::spawn(read_loop(stream, remote, conn_id, event_tx));
    Ok(conn)
}

/// Forward message frames from `stream` until it closes.
async fn read_loop<S>(
    mut stream: S,
    remote: PublicKeyId,
    conn_id: ConnectionId,
    event_tx: mpsc::Sender<TransportEvent>,
) where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match Frame::from_json(&text) {
                Ok(Frame::Message { message }) => {
                    let event = TransportEvent::Message {
                        from: remote.clone(),
                        message,
                    };
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Hello { .. }) => debug!("Ignoring repeated hello from {remote}"),
                Err(e) => warn!("Bad frame from {remote}: {e}"),
            },
            Ok(WsMessage::Close(_)) => {
                debug!("Peer {remote} sent close");
                break;
            }
            Ok(_) => {} // Ignore binary/ping/pong
            Err(e) => {
                debug!("Read error from {remote}: {e}");
                break;
            }
        }
    }

    let _ = event_tx
        .send(TransportEvent::Disconnected {
            pk_id: remote,
            conn_id,
        })
        .await;
}
