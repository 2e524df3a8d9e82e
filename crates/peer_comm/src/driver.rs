//! The transport-node contract the communication service drives.
//!
//! [`TransportNode`] is the running peer-to-peer endpoint; [`NodeFactory`]
//! builds one in either [`NodeMode`]. The crate ships a WebSocket
//! implementation in [`crate::node`], but the service only sees these traits.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::CommError;
use crate::identity::{Identity, PublicKeyId};
use crate::message::Message;
use crate::session::SessionHandle;

/// How a transport node joins the network. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeMode {
    /// No bootstrap peer; this node is the rendezvous point.
    Anchor,
    /// Dials a resolved bootstrap peer.
    Joining,
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anchor => f.write_str("anchor"),
            Self::Joining => f.write_str("joining"),
        }
    }
}

/// Supplies the key material a node derives its network identity from.
pub trait PrivateKeySource: Send + Sync {
    fn private_key(&self) -> Result<Vec<u8>, CommError>;
}

/// A fixed in-memory key.
#[derive(Clone)]
pub struct StaticKey(Vec<u8>);

impl StaticKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticKey(..)")
    }
}

impl PrivateKeySource for StaticKey {
    fn private_key(&self) -> Result<Vec<u8>, CommError> {
        if self.0.is_empty() {
            return Err(CommError::TransportConstruction(
                "empty private key".to_string(),
            ));
        }
        Ok(self.0.clone())
    }
}

/// Counters handed through to the transport node.
#[derive(Debug, Default)]
pub struct Metrics {
    sessions_opened: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
        }
    }
}

/// Owner side of a cooperative cancellation signal.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A receiver that observes cancellation even if subscribed afterwards.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.tx.subscribe())
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side of [`Shutdown`]. Dropping the owner counts as cancellation.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once the owner triggers (or is dropped).
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A running peer-to-peer endpoint.
#[async_trait]
pub trait TransportNode: Send + Sync {
    /// The mode the node was constructed in.
    fn mode(&self) -> NodeMode;

    /// Drive the network event loop until `shutdown` fires or the node stops.
    async fn run(&self, shutdown: ShutdownSignal) -> Result<(), CommError>;

    /// Release network resources and drop all sessions.
    async fn stop(&self);

    /// Open a session with a freshly allocated id.
    async fn new_session(
        &self,
        caller: &Identity,
        context_id: &str,
        endpoint: Option<&str>,
        target: &PublicKeyId,
    ) -> Result<SessionHandle, CommError>;

    /// Open (or return) the session with the given id, delivering
    /// `initial` to it first when present.
    async fn new_session_with_id(
        &self,
        session_id: &str,
        context_id: &str,
        endpoint: Option<&str>,
        target: &PublicKeyId,
        caller: &Identity,
        initial: Option<Message>,
    ) -> Result<SessionHandle, CommError>;

    /// The node's control session, built on first use.
    async fn master_session(&self) -> Result<SessionHandle, CommError>;

    /// Drop the session with this exact id. Unknown ids are a no-op.
    async fn delete_sessions(&self, session_id: &str);
}

/// Builds transport nodes.
#[async_trait]
pub trait NodeFactory: Send + Sync {
    async fn anchor(
        &self,
        listen_address: &str,
        keys: Arc<dyn PrivateKeySource>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<dyn TransportNode>, CommError>;

    /// `bootstrap` is an already-encoded peer address (`.../p2p/<pk-id>`).
    async fn joining(
        &self,
        listen_address: &str,
        bootstrap: &str,
        keys: Arc<dyn PrivateKeySource>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<dyn TransportNode>, CommError>;
}
