//! Session messages and the frames that carry them between nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{Identity, PublicKeyId};

/// Outcome flag carried by every session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Ok,
    Error,
}

/// A message exchanged on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Session this message belongs to.
    pub session_id: String,
    /// Context the session runs in.
    pub context_id: String,
    /// Identity of the party that opened the session.
    pub caller: Identity,
    /// Endpoint the sender can be reached on.
    pub from_endpoint: String,
    /// Peer identifier of the sending node.
    pub from_pk_id: PublicKeyId,
    pub status: MessageStatus,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create an `Ok` message.
    pub fn new(
        session_id: impl Into<String>,
        context_id: impl Into<String>,
        caller: Identity,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            context_id: context_id.into(),
            caller,
            from_endpoint: String::new(),
            from_pk_id: PublicKeyId::default(),
            status: MessageStatus::Ok,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Turn this message into an error report.
    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == MessageStatus::Error
    }
}

/// A unit on the wire between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame on every connection: who is dialing and where it listens.
    Hello { pk_id: PublicKeyId, endpoint: String },
    /// A session message.
    Message { message: Message },
}

impl Frame {
    /// Serialize the frame to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a frame from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
