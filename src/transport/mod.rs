//! Transport seam between broker connections and the MQTT client library
//!
//! A [`Connector`] opens one [`Link`] per connection attempt and hands back the
//! receiving end of that link's event stream. Broker connections never talk to
//! the MQTT library directly, which keeps the lifecycle state machine testable
//! with [`crate::testing::MockConnector`].

use crate::message::{InboundPublish, Qos, StaticMessage};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Events emitted by a link, consumed by exactly one broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker acknowledged the connection
    Connected,
    /// The transport is retrying on its own
    Reconnecting,
    /// An acknowledged connection went away
    Closed,
    /// The attempt failed before any acknowledgement
    Error(String),
    /// A publish arrived on one of the subscribed filters
    Message(InboundPublish),
}

pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// How a link should be torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndMode {
    /// Send DISCONNECT and let queued work drain
    Graceful,
    /// Drop the network connection immediately
    Force,
}

/// Username/password pair handed to the broker
#[derive(Clone, PartialEq)]
pub struct LinkCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LinkCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Options for one connection attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Broker compat flag; part of the connection identity, the protocol level stays MQTT 3.1.1
    pub compat_mode: bool,
    pub verify_server_cert: bool,
    pub credentials: Option<LinkCredentials>,
    pub will: Option<StaticMessage>,
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// One live transport connection
#[async_trait]
pub trait Link: Send + Sync {
    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Tear the link down; no further events are expected afterwards
    async fn end(&self, mode: EndMode) -> Result<(), TransportError>;
}

/// Factory for links
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<(Arc<dyn Link>, EventReceiver), TransportError>;
}

pub use mqtt::MqttConnector;
