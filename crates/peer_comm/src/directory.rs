//! Directory lookups — turning labels and identities into endpoints.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::CommError;
use crate::identity::{Identity, PortName, PublicKeyId};

/// Everything the directory knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEndpoint {
    /// Canonical identity of the peer.
    pub identity: Identity,
    /// Network addresses keyed by port role.
    pub endpoints: HashMap<PortName, String>,
    /// Peer identifier appended to dialable transport addresses.
    pub pk_id: PublicKeyId,
}

impl ResolvedEndpoint {
    /// Return the endpoint registered for `role`.
    pub fn endpoint(&self, role: PortName) -> Result<&str, CommError> {
        self.endpoints
            .get(&role)
            .map(String::as_str)
            .ok_or_else(|| CommError::EndpointRoleMissing {
                peer: self.identity.to_string(),
                role: role.to_string(),
            })
    }
}

/// Maps peer labels and identities to their directory entries.
pub trait EndpointResolver: Send + Sync {
    /// Look up the identity registered under a label.
    fn identity_for_label(&self, label: &str) -> Result<Identity, CommError>;

    /// Resolve an identity to its canonical identity, endpoints and key id.
    fn resolve(&self, identity: &Identity) -> Result<ResolvedEndpoint, CommError>;
}

/// An in-memory directory, editable at runtime.
#[derive(Debug, Default)]
pub struct StaticResolver {
    labels: RwLock<HashMap<String, Identity>>,
    entries: RwLock<HashMap<Identity, ResolvedEndpoint>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a peer under `label`.
    pub fn bind(&self, label: impl Into<String>, entry: ResolvedEndpoint) {
        let label = label.into();
        tracing::debug!("Binding directory label {label} to {}", entry.identity);
        self.labels.write().insert(label, entry.identity.clone());
        self.entries.write().insert(entry.identity.clone(), entry);
    }

    /// Remove a label. The identity entry is kept if other labels share it.
    pub fn unbind(&self, label: &str) -> Option<Identity> {
        let identity = self.labels.write().remove(label)?;
        let still_referenced = self.labels.read().values().any(|id| *id == identity);
        if !still_referenced {
            self.entries.write().remove(&identity);
        }
        Some(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl EndpointResolver for StaticResolver {
    fn identity_for_label(&self, label: &str) -> Result<Identity, CommError> {
        self.labels
            .read()
            .get(label)
            .cloned()
            .ok_or_else(|| CommError::DirectoryResolution(format!("unknown label [{label}]")))
    }

    fn resolve(&self, identity: &Identity) -> Result<ResolvedEndpoint, CommError> {
        self.entries
            .read()
            .get(identity)
            .cloned()
            .ok_or_else(|| CommError::DirectoryResolution(format!("unknown identity [{identity}]")))
    }
}
