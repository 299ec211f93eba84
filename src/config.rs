use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use validator::Validate;

use crate::domain::{NodeId, CSMS_NODE_ID, DEFAULT_MAX_HOPS};
use crate::envelope::secure::{nonce_from_hex, EncryptionContext, KeyId, KeyStore, SecretKey};
use crate::error::EngineError;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "OCPP__";

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct EngineConfig {
    #[validate(nested)]
    pub node: NodeConfig,
    #[validate(nested)]
    pub adapter: AdapterConfig,
    #[validate(nested)]
    pub routing: RoutingConfig,
    #[validate(nested)]
    pub events: EventsConfig,
    #[validate(nested)]
    pub encryption: EncryptionConfig,
    #[validate(nested)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NodeConfig {
    #[validate(length(min = 1, max = 128))]
    pub id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: CSMS_NODE_ID.to_string(),
        }
    }
}

impl NodeConfig {
    pub fn node_id(&self) -> Result<NodeId, EngineError> {
        NodeId::new(self.id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AdapterConfig {
    #[validate(range(min = 1, max = 3_600_000))]
    pub default_timeout_ms: u64,
    #[validate(range(min = 1, max = 60_000))]
    pub timeout_sweep_interval_ms: u64,
    /// How many resolved request ids are remembered to tell late responses
    /// from unmatched ones.
    #[validate(range(min = 1))]
    pub recent_response_memory: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            timeout_sweep_interval_ms: 50,
            recent_response_memory: 1024,
        }
    }
}

impl AdapterConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RoutingConfig {
    #[validate(range(min = 1, max = 64))]
    pub max_hops: usize,
    /// Uplink for destinations without a direct connection or static route.
    #[serde(default)]
    pub default_route: Option<String>,
    /// destination -> neighbour through which it is reached
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            default_route: None,
            routes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EventsConfig {
    #[validate(range(min = 1, max = 1_048_576))]
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::events::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct EncryptionConfig {
    #[serde(default)]
    #[validate(nested)]
    pub keys: Vec<KeyEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDirection {
    Outbound,
    Inbound,
    #[default]
    Both,
}

/// Pre-shared key for one peer. Hex encoded so it can come from the environment.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct KeyEntry {
    #[validate(length(min = 1, max = 128))]
    pub peer: String,
    #[serde(default)]
    pub key_id: u16,
    #[validate(length(equal = 64))]
    pub key: String,
    #[validate(length(equal = 8))]
    pub nonce: String,
    #[serde(default)]
    pub direction: KeyDirection,
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("peer", &self.peer)
            .field("key_id", &self.key_id)
            .field("key", &"<redacted>")
            .field("direction", &self.direction)
            .finish()
    }
}

impl KeyEntry {
    pub fn context(&self) -> Result<EncryptionContext, EngineError> {
        Ok(EncryptionContext::new(
            KeyId(self.key_id),
            SecretKey::from_hex(&self.key)?,
            nonce_from_hex(&self.nonce)?,
        ))
    }
}

impl EncryptionConfig {
    /// Registers every configured key. Returns the number of contexts added.
    pub fn install(&self, keys: &KeyStore) -> Result<usize, EngineError> {
        let mut installed = 0;
        for entry in &self.keys {
            let peer = NodeId::new(entry.peer.as_str())?;
            let context = entry.context()?;
            if matches!(entry.direction, KeyDirection::Outbound | KeyDirection::Both) {
                keys.register_outbound(peer.clone(), context.clone());
                installed += 1;
            }
            if matches!(entry.direction, KeyDirection::Inbound | KeyDirection::Both) {
                keys.register_inbound(peer, context);
                installed += 1;
            }
        }
        Ok(installed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is not set.
    #[validate(length(min = 1))]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            filter: "info,ocpp_netcore=debug".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: EngineConfig = figment.extract().context("invalid engine configuration")?;
        config.validate().context("engine configuration out of range")?;
        Ok(config)
    }
}
