//! Typed configuration for an RPC node.
//!
//! Layers, later wins:
//! 1. built-in defaults
//! 2. optional YAML file
//! 3. `RPC__*` environment variables, `__` separating sections
//!    (e.g. `RPC__CLIENT__CALL_TIMEOUT=5s`)

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::envelope::normalize_call_timeout;
use crate::transport::GrpcClientConfig;

pub const ENV_PREFIX: &str = "RPC__";

/// Configuration error for typed config operations
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config file '{path}' not found")]
    FileNotFound { path: String },
    #[error("invalid rpc config: {source}")]
    Invalid {
        #[source]
        source: Box<figment::Error>,
    },
    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Identity and announcement settings of this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Module name this node serves; the registry key segment.
    pub id: String,
    /// Human readable name used in logs.
    pub name: String,
    pub app_id: String,
    pub end_type: String,
    pub listen_addr: String,
    pub register: bool,
    #[serde(with = "humantime_serde")]
    pub registration_ttl: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            app_id: "default".to_owned(),
            end_type: "backend".to_owned(),
            listen_addr: "127.0.0.1:0".to_owned(),
            register: true,
            registration_ttl: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcConfig {
    pub node: NodeConfig,
    pub client: ClientConfig,
    pub transport: GrpcClientConfig,
}

impl RpcConfig {
    /// Load defaults, then `path` if given, then `RPC__*` environment overrides.
    ///
    /// # Errors
    /// [`ConfigError::FileNotFound`] for a missing file,
    /// [`ConfigError::Invalid`] when a layer does not parse,
    /// [`ConfigError::InvalidField`] when a value is out of range.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                });
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(&figment)
    }

    /// Extract from an already layered figment.
    ///
    /// # Errors
    /// See [`RpcConfig::load`].
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let mut cfg: Self = figment.extract().map_err(|e| ConfigError::Invalid {
            source: Box::new(e),
        })?;
        cfg.client.call_timeout = normalize_call_timeout(cfg.client.call_timeout);
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.client.call_timeout.is_zero() {
            return Err(ConfigError::InvalidField {
                field: "client.call_timeout",
                reason: "must be positive".to_owned(),
            });
        }
        if self.transport.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidField {
                field: "transport.connect_timeout",
                reason: "must be positive".to_owned(),
            });
        }
        Ok(())
    }
}

/// Serde support for `Duration` fields written as humantime strings
/// (`"250ms"`, `"3s"`). Bare integers are read as whole seconds.
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    /// # Errors
    /// Fails when the value is neither an integer nor a humantime string.
    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(d)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(de::Error::custom),
        }
    }

    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.collect_str(&humantime::format_duration(*d))
    }
}
