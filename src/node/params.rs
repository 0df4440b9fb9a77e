//! Static node parameters and their per-message resolution

use super::source::{as_bool, as_port, as_text, as_u64, Resolved, ValueSource};
use crate::config::{BrokerConfig, Credentials, NodeConfig, NodeKind, DEFAULT_HOST, DEFAULT_PORT};
use crate::error::{BridgeError, BridgeResult};
use crate::message::Qos;
use serde_json::Value;
use tracing::warn;

/// Fallbacks for malformed literals
const FALLBACK_QOS: u8 = 2;
const FALLBACK_PORT: u16 = DEFAULT_PORT;
const FALLBACK_KEEP_ALIVE_SECS: u64 = 15;

/// Topic and QoS an input node should subscribe with
#[derive(Debug, Clone, PartialEq)]
pub struct TopicRequest {
    pub topic: String,
    pub qos: Qos,
}

impl TopicRequest {
    pub fn new(topic: impl Into<String>, qos: Qos) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// A node's parsed configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NodeParams {
    config: NodeConfig,
}

impl NodeParams {
    /// Parse a node configuration, repairing malformed literals
    pub fn parse(mut config: NodeConfig) -> Self {
        if let ValueSource::Literal(value) = &config.qos {
            if Qos::from_value(value).is_none() {
                warn!(node = %config.id, ?value, "Invalid QoS literal, using {}", FALLBACK_QOS);
                config.qos = ValueSource::literal(FALLBACK_QOS);
            }
        }
        if let ValueSource::Literal(value) = &config.port {
            if as_port(value).is_none() {
                warn!(node = %config.id, ?value, "Invalid port literal, using {}", FALLBACK_PORT);
                config.port = ValueSource::literal(FALLBACK_PORT);
            }
        }
        if let ValueSource::Literal(value) = &config.keep_alive {
            if as_u64(value).is_none() {
                warn!(node = %config.id, ?value, "Invalid keep-alive literal, using {}", FALLBACK_KEEP_ALIVE_SECS);
                config.keep_alive = ValueSource::literal(FALLBACK_KEEP_ALIVE_SECS);
            }
        }
        Self { config }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn kind(&self) -> NodeKind {
        self.config.kind
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn broker_sources(&self) -> [&ValueSource; 11] {
        let c = &self.config;
        [
            &c.host,
            &c.port,
            &c.client_id,
            &c.keep_alive,
            &c.clean_session,
            &c.compat_mode,
            &c.use_tls,
            &c.verify_server_cert,
            &c.username,
            &c.password,
            &c.auth_server,
        ]
    }

    /// True when some broker field is read from the inbound message
    pub fn broker_depends_on_message(&self) -> bool {
        self.broker_sources()
            .iter()
            .any(|source| source.depends_on_message())
    }

    pub fn topic_depends_on_message(&self) -> bool {
        self.config.topic.depends_on_message() || self.config.qos.depends_on_message()
    }

    /// Resolve a field, logging missing message or environment values
    fn value(&self, source: &ValueSource, fields: &Value) -> Option<Value> {
        match source.resolve(fields) {
            Resolved::Value(value) => Some(value),
            Resolved::Default => None,
            Resolved::Missing(name) => {
                warn!(node = %self.config.id, field = %name, "Field is undefined");
                None
            }
        }
    }

    fn text(&self, source: &ValueSource, fields: &Value) -> String {
        self.value(source, fields)
            .and_then(|v| as_text(&v))
            .unwrap_or_default()
    }

    fn flag(&self, source: &ValueSource, fields: &Value) -> Option<bool> {
        self.value(source, fields).and_then(|v| as_bool(&v))
    }

    /// Build the broker request for one inbound message
    ///
    /// A host or port that was asked for but cannot be resolved is
    /// `ConfigInvalid`.
    pub fn broker_request(&self, fields: &Value) -> BridgeResult<BrokerConfig> {
        let c = &self.config;

        let host = match c.host.resolve(fields) {
            Resolved::Default => DEFAULT_HOST.to_string(),
            Resolved::Value(value) => as_text(&value).ok_or_else(|| {
                BridgeError::config_invalid(format!("host must be text, got {value}"))
            })?,
            Resolved::Missing(name) => {
                return Err(BridgeError::config_invalid(format!("{name} is undefined")))
            }
        };

        let port = match c.port.resolve(fields) {
            Resolved::Default => DEFAULT_PORT,
            Resolved::Value(value) => as_port(&value).ok_or_else(|| {
                BridgeError::config_invalid(format!("port must be a number, got {value}"))
            })?,
            Resolved::Missing(name) => {
                return Err(BridgeError::config_invalid(format!("{name} is undefined")))
            }
        };

        let credentials = Credentials::complete(
            self.text(&c.username, fields),
            self.text(&c.password, fields),
            self.text(&c.auth_server, fields),
        );

        let request = BrokerConfig {
            host,
            port: Some(port),
            client_id: self.text(&c.client_id, fields),
            use_tls: self.flag(&c.use_tls, fields),
            verify_server_cert: self.flag(&c.verify_server_cert, fields),
            compat_mode: self.flag(&c.compat_mode, fields),
            keep_alive: self.value(&c.keep_alive, fields).and_then(|v| as_u64(&v)),
            clean_session: self.flag(&c.clean_session, fields),
            credentials,
            birth: c.birth.clone(),
            will: c.will.clone(),
        };

        Ok(request)
    }

    /// The broker request when it does not depend on any message
    pub fn static_broker_request(&self) -> Option<BridgeResult<BrokerConfig>> {
        if self.broker_depends_on_message() {
            None
        } else {
            Some(self.broker_request(&Value::Object(Default::default())))
        }
    }

    pub fn topic(&self, fields: &Value) -> String {
        self.text(&self.config.topic, fields)
    }

    pub fn qos(&self, fields: &Value) -> Qos {
        self.value(&self.config.qos, fields)
            .and_then(|v| Qos::from_value(&v))
            .unwrap_or_default()
    }

    pub fn retain(&self, fields: &Value) -> bool {
        self.flag(&self.config.retain, fields).unwrap_or(false)
    }

    pub fn topic_request(&self, fields: &Value) -> TopicRequest {
        TopicRequest::new(self.topic(fields), self.qos(fields))
    }

    /// The subscription to make at start, when topic and QoS are fixed
    pub fn static_topic_request(&self) -> Option<TopicRequest> {
        if self.topic_depends_on_message() {
            return None;
        }
        let request = self.topic_request(&Value::Object(Default::default()));
        (!request.topic.is_empty()).then_some(request)
    }
}
