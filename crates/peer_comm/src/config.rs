//! Configuration source for the communication service.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Key holding the local p2p listen address.
pub const LISTEN_ADDRESS_KEY: &str = "fsc.p2p.listenAddress";

/// Key holding the directory label of the bootstrap node. Absent means this
/// process is the bootstrap anchor.
pub const BOOTSTRAP_NODE_KEY: &str = "fsc.p2p.bootstrapNode";

/// Key holding the pause between failed initialization attempts, in seconds.
pub const RETRY_INTERVAL_KEY: &str = "fsc.p2p.retryInterval";

/// Default pause between failed initialization attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// String-keyed configuration lookup.
pub trait ConfigSource: Send + Sync {
    /// Return the value for `key`, or `None` when it is unset.
    fn get_string(&self, key: &str) -> Option<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

/// File-backed configuration for the communication layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommConfig {
    /// Address the transport node listens on (`host:port` or `/ip4/.../tcp/...`).
    pub listen_address: String,

    /// Directory label of the bootstrap node, if any.
    #[serde(default)]
    pub bootstrap_node: Option<String>,

    /// Pause between failed initialization attempts.
    #[serde(with = "duration_serde", default = "default_retry_interval")]
    pub retry_interval: Duration,
}

fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:20001".to_string(),
            bootstrap_node: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl CommConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<CommConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

impl ConfigSource for CommConfig {
    fn get_string(&self, key: &str) -> Option<String> {
        let value = match key {
            LISTEN_ADDRESS_KEY => Some(self.listen_address.clone()),
            BOOTSTRAP_NODE_KEY => self.bootstrap_node.clone(),
            RETRY_INTERVAL_KEY => Some(self.retry_interval.as_secs().to_string()),
            _ => None,
        };
        value.filter(|v| !v.is_empty())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
