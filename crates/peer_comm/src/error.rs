//! Communication error types.

/// Errors that can occur in the peer_comm crate.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// A mandatory configuration key is absent or empty.
    #[error("Missing configuration value: {0}")]
    ConfigurationMissing(String),

    /// A label or identity could not be resolved by the directory.
    #[error("Directory resolution failed: {0}")]
    DirectoryResolution(String),

    /// The resolved peer does not advertise the required port role.
    #[error("Peer {peer} has no {role} endpoint")]
    EndpointRoleMissing { peer: String, role: String },

    /// A network address could not be parsed or encoded.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The transport node rejected its construction parameters.
    #[error("Transport construction failed: {0}")]
    TransportConstruction(String),

    /// A session operation was attempted before the transport node existed.
    #[error("Communication service not ready: {source}")]
    NotInitialized {
        #[source]
        source: Box<CommError>,
    },

    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session was closed or deleted.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommError {
    /// Wrap an initialization failure for a caller of a session operation.
    pub fn not_initialized(source: CommError) -> Self {
        Self::NotInitialized {
            source: Box::new(source),
        }
    }

    /// The underlying cause, looking through [`CommError::NotInitialized`].
    pub fn root(&self) -> &CommError {
        match self {
            Self::NotInitialized { source } => source.root(),
            other => other,
        }
    }
}
