//! Sessions — bidirectional message channels to one remote peer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CommError;
use crate::identity::{Identity, PublicKeyId};
use crate::message::Message;

/// Session id of the node's control session.
pub const MASTER_SESSION_ID: &str = "master";

/// Shared handle to a session.
pub type SessionHandle = Arc<dyn Session>;

/// Static description of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub context_id: String,
    /// Remote endpoint, or `None` when the node resolves the peer itself.
    pub endpoint: Option<String>,
    pub caller: Identity,
    pub target_pk_id: PublicKeyId,
}

impl SessionInfo {
    pub fn is_master(&self) -> bool {
        self.id == MASTER_SESSION_ID
    }
}

/// A message channel scoped by `(session id, context id)`.
#[async_trait]
pub trait Session: Send + Sync {
    fn info(&self) -> SessionInfo;

    /// Send a payload to the remote peer.
    async fn send(&self, payload: Vec<u8>) -> Result<(), CommError>;

    /// Send a payload flagged as an error report.
    async fn send_error(&self, payload: Vec<u8>) -> Result<(), CommError>;

    /// Wait for the next incoming message. `None` once the session is closed.
    ///
    /// Each session buffers a bounded number of undelivered messages. When
    /// the buffer is full, newly arriving messages for this session are
    /// dropped and a warning is logged. Senders are never slowed down.
    async fn receive(&self) -> Option<Message>;

    /// Release the session.
    async fn close(&self);
}
