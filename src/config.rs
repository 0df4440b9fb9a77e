//! Broker identity and bridge configuration
//!
//! [`BrokerConfig`] is what a node asks for; [`ResolvedBroker`] is the
//! normalized form whose [`Fingerprint`] decides which nodes share one
//! physical connection. [`BridgeConfig`] is the TOML file read by the binary.

use crate::message::StaticMessage;
use crate::node::ValueSource;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Credentials exchanged with the auth server for a broker token
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub auth_server: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        auth_server: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            auth_server: auth_server.into(),
        }
    }

    /// Build credentials only when every part is non-empty
    pub fn complete(username: String, password: String, auth_server: String) -> Option<Self> {
        if username.is_empty() || password.is_empty() || auth_server.is_empty() {
            None
        } else {
            Some(Self::new(username, password, auth_server))
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("auth_server", &self.auth_server)
            .finish()
    }
}

/// Broker connection request as built by a node, before normalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub client_id: String,
    pub use_tls: Option<bool>,
    pub verify_server_cert: Option<bool>,
    pub compat_mode: Option<bool>,
    pub keep_alive: Option<u64>,
    pub clean_session: Option<bool>,
    pub credentials: Option<Credentials>,
    /// Published after every successful connect; not part of the identity
    pub birth: Option<StaticMessage>,
    /// Registered with the broker for ungraceful disconnects; not part of the identity
    pub will: Option<StaticMessage>,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Apply defaults and host aliasing (pure function)
    pub fn normalize(&self) -> ResolvedBroker {
        let (host, port) = match self.host.trim() {
            "" => (DEFAULT_HOST.to_string(), DEFAULT_PORT),
            "127.0.0.1" => (DEFAULT_HOST.to_string(), self.port.unwrap_or(DEFAULT_PORT)),
            other => (other.to_string(), self.port.unwrap_or(DEFAULT_PORT)),
        };

        // A persistent session only makes sense with a stable client id
        let clean_session = match self.clean_session {
            Some(false) if self.client_id.is_empty() => true,
            Some(clean) => clean,
            None => true,
        };

        ResolvedBroker {
            host,
            port,
            client_id: self.client_id.clone(),
            use_tls: self.use_tls.unwrap_or(false),
            verify_server_cert: self.verify_server_cert.unwrap_or(false),
            compat_mode: self.compat_mode.unwrap_or(true),
            keep_alive_secs: self.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            clean_session,
            credentials: self.credentials.clone(),
            birth: self.birth.clone(),
            will: self.will.clone(),
        }
    }
}

/// Normalized broker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBroker {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub use_tls: bool,
    pub verify_server_cert: bool,
    pub compat_mode: bool,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub credentials: Option<Credentials>,
    pub birth: Option<StaticMessage>,
    pub will: Option<StaticMessage>,
}

impl ResolvedBroker {
    /// Identity of this broker for connection sharing
    pub fn fingerprint(&self) -> Fingerprint {
        let credentials = serde_json::to_string(&self.credentials).unwrap_or_default();
        Fingerprint(format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.host,
            self.port,
            self.client_id,
            self.use_tls,
            self.verify_server_cert,
            self.compat_mode,
            self.keep_alive_secs,
            self.clean_session,
            credentials
        ))
    }

    /// `mqtt://host:port` or `mqtts://host:port`
    pub fn url(&self) -> String {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Short `host:port` label used in status lines
    pub fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Canonical identity string of a broker configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Everything after the clean-session flag is credential material
        let public: Vec<&str> = self.0.splitn(9, '|').take(8).collect();
        write!(f, "{}", public.join("|"))
    }
}

/// Process-wide connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Delay before an automatic reconnect after a lost connection
    #[serde(default = "default_reconnect_period_ms")]
    pub reconnect_period_ms: u64,
    /// Broker-side username sent together with a fetched token
    #[serde(default = "default_token_username")]
    pub token_username: String,
    /// HTTP timeout for each auth server call
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
}

fn default_reconnect_period_ms() -> u64 {
    5000
}

fn default_token_username() -> String {
    "zosquitto".to_string()
}

fn default_auth_timeout_secs() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reconnect_period_ms: default_reconnect_period_ms(),
            token_username: default_token_username(),
            auth_timeout_secs: default_auth_timeout_secs(),
        }
    }
}

impl Settings {
    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_period_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

/// Which façade a configured node uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Input,
    Output,
}

/// One node as written in the configuration file
///
/// Every field has an independent [`ValueSource`]; omitted fields use the
/// field's default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub host: ValueSource,
    #[serde(default)]
    pub port: ValueSource,
    #[serde(default)]
    pub client_id: ValueSource,
    #[serde(default)]
    pub keep_alive: ValueSource,
    #[serde(default)]
    pub clean_session: ValueSource,
    #[serde(default)]
    pub compat_mode: ValueSource,
    #[serde(default)]
    pub use_tls: ValueSource,
    #[serde(default)]
    pub verify_server_cert: ValueSource,
    #[serde(default)]
    pub topic: ValueSource,
    #[serde(default)]
    pub qos: ValueSource,
    #[serde(default)]
    pub retain: ValueSource,
    #[serde(default)]
    pub username: ValueSource,
    #[serde(default)]
    pub password: ValueSource,
    #[serde(default)]
    pub auth_server: ValueSource,
    pub birth: Option<StaticMessage>,
    pub will: Option<StaticMessage>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            host: ValueSource::Default,
            port: ValueSource::Default,
            client_id: ValueSource::Default,
            keep_alive: ValueSource::Default,
            clean_session: ValueSource::Default,
            compat_mode: ValueSource::Default,
            use_tls: ValueSource::Default,
            verify_server_cert: ValueSource::Default,
            topic: ValueSource::Default,
            qos: ValueSource::Default,
            retain: ValueSource::Default,
            username: ValueSource::Default,
            password: ValueSource::Default,
            auth_server: ValueSource::Default,
            birth: None,
            will: None,
        }
    }
}

/// Bridge configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settings.reconnect_period_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "settings.reconnect_period_ms must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "node id cannot be empty".to_string(),
                ));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate node id: {}",
                    node.id
                )));
            }
        }

        Ok(())
    }
}
