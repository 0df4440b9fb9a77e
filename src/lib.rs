//! brokerlink - shared MQTT broker connections
//!
//! Many logical nodes talk to MQTT brokers; nodes with an equivalent broker
//! configuration share one physical connection.
//!
//! # Overview
//!
//! - [`broker::BrokerRegistry`] hands out one [`broker::BrokerConnection`] per
//!   broker fingerprint
//! - connections reference-count their nodes, reconnect after losses and
//!   multiplex subscriptions through [`topic::TopicMatcher`]
//! - [`auth::TokenFetcher`] performs the challenge/response login that turns
//!   user credentials into a broker password
//! - [`node::InputNode`] and [`node::OutputNode`] resolve their broker and
//!   topic per flow message, then subscribe or publish
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use brokerlink::broker::BrokerRegistry;
//! use brokerlink::config::{NodeConfig, NodeKind, Settings};
//! use brokerlink::message::FlowMessage;
//! use brokerlink::node::{NodeParams, OutputNode, ValueSource};
//! use brokerlink::observability::TracingStatus;
//! use brokerlink::{MqttConnector, TokenFetcher};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> brokerlink::BridgeResult<()> {
//! let settings = Settings::default();
//! let tokens = TokenFetcher::new(settings.auth_timeout())?;
//! let registry = Arc::new(BrokerRegistry::new(
//!     settings,
//!     Arc::new(MqttConnector),
//!     Arc::new(tokens),
//! ));
//!
//! let mut config = NodeConfig::new("lights", NodeKind::Output);
//! config.host = ValueSource::literal("broker.local");
//! config.topic = ValueSource::message("topic");
//!
//! let node = OutputNode::new(NodeParams::parse(config), registry, Arc::new(TracingStatus));
//! node.start().await?;
//! node.on_input(&FlowMessage::from_json(json!({
//!     "topic": "lights/kitchen",
//!     "payload": "on"
//! })))
//! .await?;
//! node.close().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod node;
pub mod observability;
pub mod testing;
pub mod topic;
pub mod transport;

pub use auth::{TokenError, TokenFetcher, TokenSource};
pub use broker::{BrokerConnection, BrokerRegistry, LinkState, NodeId};
pub use config::{BridgeConfig, BrokerConfig, ConfigError, Credentials, NodeConfig, Settings};
pub use error::{BridgeError, BridgeResult};
pub use message::{FlowMessage, Message, Payload, Qos};
pub use node::{InputNode, OutputNode};
pub use topic::TopicMatcher;
pub use transport::MqttConnector;
