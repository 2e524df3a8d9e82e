//! Peer identities, public-key identifiers and endpoint port roles.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque byte sequence naming a principal (e.g. a serialized certificate).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub Vec<u8>);

impl Identity {
    /// Create an identity from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{s}"),
            _ => write!(f, "{}", hex::encode(&self.0)),
        }
    }
}

/// The peer-identifier token bound to an identity, used as the trailing
/// `/p2p/` segment of a dialable address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyId(pub Vec<u8>);

impl PublicKeyId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The token as an address segment. PublicKeyIDs are textual peer ids,
    /// so this is normally lossless.
    pub fn as_segment(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<&str> for PublicKeyId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Display for PublicKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_segment())
    }
}

/// The role of a named endpoint advertised by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortName {
    /// Main service listen port.
    Listen,
    /// View/API port.
    View,
    /// Peer-to-peer transport port.
    P2P,
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Listen => "Listen",
            Self::View => "View",
            Self::P2P => "P2P",
        };
        f.write_str(s)
    }
}
