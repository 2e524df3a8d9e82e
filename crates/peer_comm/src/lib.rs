//! Peer Comm — identity-aware sessions over a peer-to-peer transport node.
//!
//! This crate sits in front of a single transport node per process and lets
//! application code exchange messages with remote peers named by identity
//! rather than by raw network address.
//!
//! # Architecture
//!
//! - **Service**: [`CommService`] lazily builds the transport node, either as
//!   the network's bootstrap anchor or as a peer that first resolves the
//!   anchor's address through the directory, and forwards session operations.
//! - **Directory**: [`EndpointResolver`] maps labels and identities to
//!   endpoints and peer identifiers.
//! - **Driver**: [`TransportNode`] / [`NodeFactory`] are the contract the
//!   service drives.
//! - **Node**: [`WsNode`] implements that contract over WebSockets (via
//!   `tokio-tungstenite`).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peer_comm::{CommConfig, CommService, Identity, Metrics, StaticKey, StaticResolver};
//!
//! # async fn example() {
//! let service = Arc::new(CommService::new(
//!     Arc::new(StaticKey::new(b"node-secret".to_vec())),
//!     Arc::new(StaticResolver::new()),
//!     Arc::new(CommConfig::default()),
//!     Identity::from("my-node"),
//!     Arc::new(Metrics::new()),
//! ));
//!
//! service.start();
//! let _master = service.master_session().await.unwrap();
//! // ... receive first messages of incoming sessions ...
//! service.shutdown().await;
//! # }
//! ```

pub mod address;
pub mod config;
pub mod directory;
pub mod driver;
pub mod error;
pub mod identity;
pub mod message;
pub mod node;
pub mod service;
pub mod session;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{CommConfig, ConfigSource};
pub use directory::{EndpointResolver, ResolvedEndpoint, StaticResolver};
pub use driver::{
    Metrics, NodeFactory, NodeMode, PrivateKeySource, Shutdown, ShutdownSignal, StaticKey,
    TransportNode,
};
pub use error::CommError;
pub use identity::{Identity, PortName, PublicKeyId};
pub use message::{Message, MessageStatus};
pub use node::{WsNode, WsNodeFactory};
pub use service::CommService;
pub use session::{Session, SessionHandle, SessionInfo};
