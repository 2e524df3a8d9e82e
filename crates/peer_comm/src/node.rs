//! WsNode — a WebSocket transport node.
//!
//! [`WsNode`] implements the [`TransportNode`] contract on top of
//! [`crate::transport`]. It manages:
//! - the listening socket (bound at construction, served by `run`)
//! - peer connections, dialed on demand or accepted, grouped by peer id
//! - the session table and the master session
//! - the bootstrap dial when constructed in [`NodeMode::Joining`]
//!
//! Messages for unknown sessions open a responder-side session and are
//! handed to the master session, where application code picks them up.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, OnceCell, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::address::{PeerAddress, peer_address};
use crate::driver::{
    Metrics, NodeFactory, NodeMode, PrivateKeySource, Shutdown, ShutdownSignal, TransportNode,
};
use crate::error::CommError;
use crate::identity::{Identity, PublicKeyId};
use crate::message::{Frame, Message, MessageStatus};
use crate::session::{MASTER_SESSION_ID, Session, SessionHandle, SessionInfo};
use crate::transport::{self, ConnectionId, PeerConnection, TransportEvent};

/// Messages buffered per session. Arrivals beyond this are dropped with a
/// warning.
pub const SESSION_QUEUE_CAPACITY: usize = 256;

/// A WebSocket transport node.
pub struct WsNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    mode: NodeMode,
    pk_id: PublicKeyId,
    local_addr: SocketAddr,
    /// Endpoint advertised in outgoing messages.
    endpoint: String,
    bootstrap: Option<PeerAddress>,
    metrics: Arc<Metrics>,
    listener: Mutex<Option<TcpListener>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    connections: ConnectionTable,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    master: OnceCell<Arc<NodeSession>>,
    master_tx: parking_lot::Mutex<Option<mpsc::Sender<Message>>>,
    master_rx: parking_lot::Mutex<Option<mpsc::Receiver<Message>>>,
    stopped: Shutdown,
}

struct SessionEntry {
    session: Arc<NodeSession>,
    tx: mpsc::Sender<Message>,
}

/// A registered connection. Its lock only serializes writes to this socket.
struct Link {
    id: ConnectionId,
    conn: Mutex<PeerConnection>,
}

impl Link {
    fn new(conn: PeerConnection) -> Self {
        Self {
            id: conn.id(),
            conn: Mutex::new(conn),
        }
    }

    async fn send(&self, frame: &Frame) -> Result<(), CommError> {
        self.conn.lock().await.send(frame).await
    }

    async fn close(&self) {
        self.conn.lock().await.close().await;
    }
}

/// Live connections per peer, newest last.
///
/// A peer may briefly hold several connections (a reconnect, or both sides
/// dialing at once). Sends use the newest one; entries are removed by
/// connection id so the end of an old socket never evicts a newer one. The
/// map lock is never held across an await.
#[derive(Default)]
struct ConnectionTable {
    peers: parking_lot::RwLock<HashMap<PublicKeyId, Vec<Arc<Link>>>>,
}

impl ConnectionTable {
    fn latest(&self, pk_id: &PublicKeyId) -> Option<Arc<Link>> {
        self.peers.read().get(pk_id).and_then(|links| links.last().cloned())
    }

    fn push(&self, pk_id: PublicKeyId, conn: PeerConnection) -> Arc<Link> {
        let link = Arc::new(Link::new(conn));
        self.peers
            .write()
            .entry(pk_id)
            .or_default()
            .push(Arc::clone(&link));
        link
    }

    /// Register `conn` unless the peer already has a connection. In that case
    /// the existing link is returned along with the rejected `conn`.
    fn push_if_absent(
        &self,
        pk_id: PublicKeyId,
        conn: PeerConnection,
    ) -> (Arc<Link>, Option<PeerConnection>) {
        let mut peers = self.peers.write();
        let links = peers.entry(pk_id).or_default();
        if let Some(existing) = links.last() {
            return (Arc::clone(existing), Some(conn));
        }
        let link = Arc::new(Link::new(conn));
        links.push(Arc::clone(&link));
        (link, None)
    }

    fn remove(&self, pk_id: &PublicKeyId, id: ConnectionId) -> bool {
        let mut peers = self.peers.write();
        let Some(links) = peers.get_mut(pk_id) else {
            return false;
        };
        let before = links.len();
        links.retain(|link| link.id != id);
        let removed = links.len() != before;
        if links.is_empty() {
            peers.remove(pk_id);
        }
        removed
    }

    fn peers(&self) -> Vec<PublicKeyId> {
        self.peers.read().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.peers.read().values().map(Vec::len).sum()
    }

    fn drain(&self) -> Vec<Arc<Link>> {
        self.peers
            .write()
            .drain()
            .flat_map(|(_, links)| links)
            .collect()
    }
}

impl WsNode {
    /// Build a node and bind its listening socket.
    ///
    /// `bootstrap` is required in [`NodeMode::Joining`] and must carry a
    /// `/p2p/` segment naming the bootstrap peer.
    pub async fn bind(
        mode: NodeMode,
        listen_address: &str,
        bootstrap: Option<&str>,
        keys: Arc<dyn PrivateKeySource>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, CommError> {
        let key = keys.private_key().map_err(|e| match e {
            e @ CommError::TransportConstruction(_) => e,
            other => CommError::TransportConstruction(format!("private key unavailable: {other}")),
        })?;
        let pk_id = PublicKeyId::from(hex::encode(Sha256::digest(&key)).as_str());

        let bootstrap = match (mode, bootstrap) {
            (NodeMode::Anchor, _) => None,
            (NodeMode::Joining, None) => {
                return Err(CommError::TransportConstruction(
                    "joining node needs a bootstrap address".to_string(),
                ));
            }
            (NodeMode::Joining, Some(addr)) => {
                let parsed = PeerAddress::parse(addr)
                    .map_err(|e| CommError::TransportConstruction(e.to_string()))?;
                if parsed.pk_id.is_none() {
                    return Err(CommError::TransportConstruction(format!(
                        "bootstrap address [{addr}] has no /p2p/ segment"
                    )));
                }
                Some(parsed)
            }
        };

        let listen = PeerAddress::parse(listen_address)
            .map_err(|e| CommError::TransportConstruction(e.to_string()))?;
        let listener = TcpListener::bind(listen.dial_target()).await.map_err(|e| {
            CommError::TransportConstruction(format!("cannot listen on [{listen_address}]: {e}"))
        })?;
        let local_addr = listener.local_addr()?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (master_tx, master_rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);

        info!("New {mode} node {pk_id} listening on {local_addr}");
        Ok(Self {
            inner: Arc::new(NodeInner {
                mode,
                pk_id,
                local_addr,
                endpoint: local_addr.to_string(),
                bootstrap,
                metrics,
                listener: Mutex::new(Some(listener)),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                connections: ConnectionTable::default(),
                sessions: RwLock::new(HashMap::new()),
                master: OnceCell::new(),
                master_tx: parking_lot::Mutex::new(Some(master_tx)),
                master_rx: parking_lot::Mutex::new(Some(master_rx)),
                stopped: Shutdown::new(),
            }),
        })
    }

    /// This node's peer identifier.
    pub fn pk_id(&self) -> &PublicKeyId {
        &self.inner.pk_id
    }

    /// The socket address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The `host:port` endpoint peers can dial.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// The full dialable address, `/ip4/.../tcp/.../p2p/<pk-id>`.
    pub fn peer_address(&self) -> Result<String, CommError> {
        peer_address(&self.inner.endpoint, &self.inner.pk_id)
    }

    /// Peer ids with an open connection.
    pub fn connected_peers(&self) -> Vec<PublicKeyId> {
        self.inner.connections.peers()
    }

    /// Number of open connections across all peers.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Number of live sessions, excluding the master session.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }
}

impl NodeInner {
    fn hello(&self) -> Frame {
        Frame::Hello {
            pk_id: self.pk_id.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    /// Dial a peer. Does not register the connection.
    async fn dial(&self, target: &PublicKeyId, endpoint: &str) -> Result<PeerConnection, CommError> {
        let addr = PeerAddress::parse(endpoint)?;
        let conn = transport::connect_to_peer(
            &addr.dial_target(),
            target.clone(),
            &self.hello(),
            self.event_tx.clone(),
        )
        .await?;
        self.metrics.connection_opened();
        debug!("Dialed {target} at {endpoint}");
        Ok(conn)
    }

    /// Dial `target` and register the connection.
    ///
    /// If another task connected to `target` while this dial was in flight,
    /// the registered connection wins and the fresh socket is closed.
    async fn connect(&self, target: &PublicKeyId, endpoint: &str) -> Result<Arc<Link>, CommError> {
        let conn = self.dial(target, endpoint).await?;
        let (link, rejected) = self.connections.push_if_absent(target.clone(), conn);
        if let Some(mut duplicate) = rejected {
            debug!(
                "Already connected to {target}, closing duplicate connection {}",
                duplicate.id()
            );
            duplicate.close().await;
            self.metrics.connection_closed();
        }
        Ok(link)
    }

    fn forget(&self, pk_id: &PublicKeyId, id: ConnectionId) -> bool {
        let removed = self.connections.remove(pk_id, id);
        if removed {
            self.metrics.connection_closed();
        }
        removed
    }

    /// Send a frame to `target`, dialing `endpoint` if no connection exists.
    async fn send_frame(
        &self,
        target: &PublicKeyId,
        endpoint: Option<&str>,
        frame: &Frame,
    ) -> Result<(), CommError> {
        while let Some(link) = self.connections.latest(target) {
            match link.send(frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Send to {target} over connection {} failed, dropping it: {e}",
                        link.id
                    );
                    self.forget(target, link.id);
                    if endpoint.is_none() && self.connections.latest(target).is_none() {
                        return Err(e);
                    }
                }
            }
        }

        let endpoint = endpoint
            .ok_or_else(|| CommError::Transport(format!("no route to peer {target}")))?;
        let link = self.connect(target, endpoint).await?;
        if let Err(e) = link.send(frame).await {
            self.forget(target, link.id);
            return Err(e);
        }
        Ok(())
    }

    async fn open_session(
        self: &Arc<Self>,
        info: SessionInfo,
        initial: Option<Message>,
    ) -> Result<Arc<NodeSession>, CommError> {
        if self.stopped.is_triggered() {
            return Err(CommError::Transport("node stopped".to_string()));
        }

        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(info.id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
            self.metrics.session_opened();
            debug!("Opened session {} (context {})", info.id, info.context_id);
            SessionEntry {
                session: Arc::new(NodeSession::new(info, Arc::downgrade(self), rx)),
                tx,
            }
        });
        if let Some(msg) = initial {
            deliver(&entry.tx, &entry.session.info.id, msg);
        }
        Ok(Arc::clone(&entry.session))
    }

    async fn remove_session(&self, session_id: &str) {
        if self.sessions.write().await.remove(session_id).is_some() {
            debug!("Deleted session {session_id}");
        }
    }

    fn master_session(self: &Arc<Self>) -> Result<Arc<NodeSession>, CommError> {
        if let Some(master) = self.master.get() {
            return Ok(Arc::clone(master));
        }
        let mut rx_slot = self.master_rx.lock();
        if let Some(master) = self.master.get() {
            return Ok(Arc::clone(master));
        }
        let rx = rx_slot
            .take()
            .ok_or_else(|| CommError::SessionClosed(MASTER_SESSION_ID.to_string()))?;
        let info = SessionInfo {
            id: MASTER_SESSION_ID.to_string(),
            context_id: String::new(),
            endpoint: None,
            caller: Identity::default(),
            target_pk_id: PublicKeyId::default(),
        };
        let session = Arc::new(NodeSession::new(info, Arc::downgrade(self), rx));
        // Guarded by `master_rx`, so this is the only writer.
        let _ = self.master.set(Arc::clone(&session));
        Ok(session)
    }

    async fn dispatch(self: &Arc<Self>, from: PublicKeyId, message: Message) {
        self.metrics.message_received();

        if message.session_id != MASTER_SESSION_ID {
            let sessions = self.sessions.read().await;
            if let Some(entry) = sessions.get(&message.session_id) {
                deliver(&entry.tx, &entry.session.info.id, message);
                return;
            }
        }

        if message.session_id != MASTER_SESSION_ID {
            let info = SessionInfo {
                id: message.session_id.clone(),
                context_id: message.context_id.clone(),
                endpoint: Some(message.from_endpoint.clone()).filter(|e| !e.is_empty()),
                caller: message.caller.clone(),
                target_pk_id: from,
            };
            if let Err(e) = self.open_session(info, None).await {
                debug!("Dropping message for {}: {e}", message.session_id);
                return;
            }
        }

        let master_tx = self.master_tx.lock().clone();
        match master_tx {
            Some(tx) => deliver(&tx, MASTER_SESSION_ID, message),
            None => debug!("Master session gone, dropping message"),
        }
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Inbound {
                pk_id,
                endpoint,
                conn,
            } => {
                debug!(
                    "Peer {pk_id} connected on connection {} (listening on {endpoint})",
                    conn.id()
                );
                self.metrics.connection_opened();
                self.connections.push(pk_id, conn);
            }
            TransportEvent::Message { from, message } => self.dispatch(from, message).await,
            TransportEvent::Disconnected { pk_id, conn_id } => {
                if self.forget(&pk_id, conn_id) {
                    debug!("Peer {pk_id} connection {conn_id} closed");
                }
            }
        }
    }

    async fn connect_bootstrap(&self) {
        let Some(bootstrap) = &self.bootstrap else {
            return;
        };
        let Some(target) = &bootstrap.pk_id else {
            return;
        };
        if self.connections.latest(target).is_some() {
            return;
        }
        match self.connect(target, &bootstrap.dial_target()).await {
            Ok(_) => info!("Connected to bootstrap peer {bootstrap}"),
            Err(e) => warn!("Failed to connect to bootstrap peer {bootstrap}: {e}"),
        }
    }
}

fn deliver(tx: &mpsc::Sender<Message>, session_id: &str, message: Message) {
    match tx.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!("Session {session_id} queue full, dropping message");
        }
        Err(TrySendError::Closed(_)) => debug!("Session {session_id} closed, dropping message"),
    }
}

#[async_trait]
impl TransportNode for WsNode {
    fn mode(&self) -> NodeMode {
        self.inner.mode
    }

    async fn run(&self, mut shutdown: ShutdownSignal) -> Result<(), CommError> {
        let inner = &self.inner;
        let listener = inner
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| CommError::Transport("node already running".to_string()))?;
        let mut event_rx = inner
            .event_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| CommError::Transport("node already running".to_string()))?;

        let server_stop = Shutdown::new();
        let server = tokio::spawn(transport::serve(
            listener,
            inner.event_tx.clone(),
            server_stop.signal(),
        ));

        let dialer = Arc::clone(inner);
        tokio::spawn(async move { dialer.connect_bootstrap().await });

        let mut stopped = inner.stopped.signal();
        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => inner.handle_event(event).await,
                _ = shutdown.cancelled() => {
                    debug!("Node {} run loop cancelled", inner.pk_id);
                    break;
                }
                _ = stopped.cancelled() => {
                    debug!("Node {} run loop stopped", inner.pk_id);
                    break;
                }
            }
        }

        server_stop.trigger();
        match server.await {
            Ok(result) => result,
            Err(e) => Err(CommError::Transport(format!("server task failed: {e}"))),
        }
    }

    async fn stop(&self) {
        let inner = &self.inner;
        inner.stopped.trigger();

        for link in inner.connections.drain() {
            debug!("Closing connection {}", link.id);
            link.close().await;
            inner.metrics.connection_closed();
        }

        inner.sessions.write().await.clear();
        inner.master_tx.lock().take();
        info!("Node {} stopped", inner.pk_id);
    }

    async fn new_session(
        &self,
        caller: &Identity,
        context_id: &str,
        endpoint: Option<&str>,
        target: &PublicKeyId,
    ) -> Result<SessionHandle, CommError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.new_session_with_id(&session_id, context_id, endpoint, target, caller, None)
            .await
    }

    async fn new_session_with_id(
        &self,
        session_id: &str,
        context_id: &str,
        endpoint: Option<&str>,
        target: &PublicKeyId,
        caller: &Identity,
        initial: Option<Message>,
    ) -> Result<SessionHandle, CommError> {
        if session_id == MASTER_SESSION_ID {
            return self.master_session().await;
        }
        let info = SessionInfo {
            id: session_id.to_string(),
            context_id: context_id.to_string(),
            endpoint: endpoint.map(str::to_string),
            caller: caller.clone(),
            target_pk_id: target.clone(),
        };
        let session = self.inner.open_session(info, initial).await?;
        Ok(session)
    }

    async fn master_session(&self) -> Result<SessionHandle, CommError> {
        let master = self.inner.master_session()?;
        Ok(master)
    }

    async fn delete_sessions(&self, session_id: &str) {
        self.inner.remove_session(session_id).await;
    }
}

/// Session implementation backed by a [`WsNode`].
pub struct NodeSession {
    info: SessionInfo,
    node: Weak<NodeInner>,
    rx: Mutex<mpsc::Receiver<Message>>,
}

impl NodeSession {
    fn new(info: SessionInfo, node: Weak<NodeInner>, rx: mpsc::Receiver<Message>) -> Self {
        Self {
            info,
            node,
            rx: Mutex::new(rx),
        }
    }

    async fn transmit(&self, payload: Vec<u8>, status: MessageStatus) -> Result<(), CommError> {
        let closed = || CommError::SessionClosed(self.info.id.clone());
        let node = self.node.upgrade().ok_or_else(closed)?;
        if !self.info.is_master() && !node.sessions.read().await.contains_key(&self.info.id) {
            return Err(closed());
        }
        if self.info.target_pk_id.is_empty() {
            return Err(CommError::Transport(format!(
                "session {} has no remote peer",
                self.info.id
            )));
        }

        let mut message = Message::new(
            self.info.id.clone(),
            self.info.context_id.clone(),
            self.info.caller.clone(),
            payload,
        )
        .with_status(status);
        message.from_endpoint = node.endpoint.clone();
        message.from_pk_id = node.pk_id.clone();

        node.send_frame(
            &self.info.target_pk_id,
            self.info.endpoint.as_deref(),
            &Frame::Message { message },
        )
        .await?;
        node.metrics.message_sent();
        Ok(())
    }
}

#[async_trait]
impl Session for NodeSession {
    fn info(&self) -> SessionInfo {
        self.info.clone()
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), CommError> {
        self.transmit(payload, MessageStatus::Ok).await
    }

    async fn send_error(&self, payload: Vec<u8>) -> Result<(), CommError> {
        self.transmit(payload, MessageStatus::Error).await
    }

    async fn receive(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        if self.info.is_master() {
            return;
        }
        if let Some(node) = self.node.upgrade() {
            node.remove_session(&self.info.id).await;
        }
    }
}

/// Builds [`WsNode`]s for the communication service.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsNodeFactory;

#[async_trait]
impl NodeFactory for WsNodeFactory {
    async fn anchor(
        &self,
        listen_address: &str,
        keys: Arc<dyn PrivateKeySource>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<dyn TransportNode>, CommError> {
        let node = WsNode::bind(NodeMode::Anchor, listen_address, None, keys, metrics).await?;
        Ok(Arc::new(node))
    }

    async fn joining(
        &self,
        listen_address: &str,
        bootstrap: &str,
        keys: Arc<dyn PrivateKeySource>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<dyn TransportNode>, CommError> {
        let node =
            WsNode::bind(NodeMode::Joining, listen_address, Some(bootstrap), keys, metrics).await?;
        Ok(Arc::new(node))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
