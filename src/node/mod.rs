//! Input and output node façades
//!
//! A node owns its parsed parameters and its current broker attachment. It
//! resolves a broker request per inbound flow message, attaches to the shared
//! connection for that broker (switching when the fingerprint changes), and
//! then subscribes (input) or publishes (output).

pub mod input;
pub mod output;
pub mod params;
pub mod source;

pub use input::InputNode;
pub use output::OutputNode;
pub use params::{NodeParams, TopicRequest};
pub use source::{lookup_path, Resolved, ValueSource};

use crate::broker::{BrokerConnection, BrokerRegistry, LinkObserver, NodeId};
use crate::config::{BrokerConfig, ResolvedBroker};
use crate::error::{BridgeError, BridgeResult};
use crate::observability::{NodeStatus, StatusSink};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use url::Url;

/// Reject brokers that cannot form a connection URL (pure function)
pub fn validate_broker(broker: &ResolvedBroker) -> BridgeResult<()> {
    let url = broker.url();
    match Url::parse(&url) {
        Ok(parsed) if parsed.host_str().is_some_and(|h| !h.is_empty()) => Ok(()),
        _ => Err(BridgeError::config_invalid(format!(
            "invalid broker address {url}"
        ))),
    }
}

#[derive(Default)]
struct Attachment {
    connection: Option<Arc<BrokerConnection>>,
    /// Current subscription, input nodes only
    subscription: Option<TopicRequest>,
}

/// State and behaviour shared by both node kinds
pub(crate) struct NodeCore {
    id: NodeId,
    params: NodeParams,
    registry: Arc<BrokerRegistry>,
    status: Arc<dyn StatusSink>,
    attachment: Mutex<Attachment>,
}

impl NodeCore {
    fn new(params: NodeParams, registry: Arc<BrokerRegistry>, status: Arc<dyn StatusSink>) -> Self {
        Self {
            id: NodeId::new(params.id()),
            params,
            registry,
            status,
            attachment: Mutex::new(Attachment::default()),
        }
    }

    fn report(&self, status: NodeStatus) {
        self.status.report(&self.id, status);
    }

    fn connection(&self) -> Option<Arc<BrokerConnection>> {
        self.attachment.lock().connection.clone()
    }

    fn subscription(&self) -> Option<TopicRequest> {
        self.attachment.lock().subscription.clone()
    }

    fn set_subscription(&self, subscription: Option<TopicRequest>) {
        self.attachment.lock().subscription = subscription;
    }

    /// Broker request for a flow message, with a status on failure
    fn resolve_broker(&self, fields: &Value) -> BridgeResult<BrokerConfig> {
        self.params.broker_request(fields).map_err(|e| {
            warn!(node = %self.id, error = %e, "No usable broker for message");
            self.report(NodeStatus::problem(e.redacted()));
            e
        })
    }

    /// Broker request usable before any message arrives
    fn static_broker(&self) -> Option<BridgeResult<BrokerConfig>> {
        let Some(request) = self.params.static_broker_request() else {
            debug!(node = %self.id, "Broker depends on messages, waiting for input");
            return None;
        };
        Some(request.map_err(|e| {
            warn!(node = %self.id, error = %e, "Configured broker is unusable");
            self.report(NodeStatus::problem(e.redacted()));
            e
        }))
    }

    /// Attach to the connection for `request`
    ///
    /// Same fingerprint as the current attachment is a no-op. Otherwise the
    /// old connection is left (subscription first) before registering with
    /// the new one.
    async fn connect(
        &self,
        request: &BrokerConfig,
        observer: Weak<dyn LinkObserver>,
    ) -> BridgeResult<Arc<BrokerConnection>> {
        let broker = request.normalize();
        if let Err(e) = validate_broker(&broker) {
            warn!(node = %self.id, error = %e, "Cannot connect");
            self.report(NodeStatus::problem(e.redacted()));
            return Err(e);
        }
        let fingerprint = broker.fingerprint();

        let previous = {
            let mut attachment = self.attachment.lock();
            if let Some(current) = &attachment.connection {
                if *current.fingerprint() == fingerprint {
                    return Ok(current.clone());
                }
            }
            let subscription = attachment.subscription.take();
            attachment.connection.take().map(|c| (c, subscription))
        };

        if let Some((old, subscription)) = previous {
            debug!(node = %self.id, from = %old.label(), "Switching broker");
            self.leave(&old, subscription).await;
        }

        let connection = self.registry.get_resolved(&broker);
        self.attachment.lock().connection = Some(connection.clone());

        if connection.is_connected() {
            self.report(NodeStatus::ok(connection.label()));
        } else {
            self.report(NodeStatus::problem(format!(
                "connecting to {}",
                connection.label()
            )));
        }
        connection.register(self.id.clone(), observer).await;
        Ok(connection)
    }

    async fn leave(&self, connection: &BrokerConnection, subscription: Option<TopicRequest>) {
        if let Some(subscription) = subscription {
            if let Err(e) = connection.unsubscribe(&subscription.topic, Some(&self.id)).await {
                warn!(node = %self.id, topic = %subscription.topic, error = %e, "Unsubscribe failed");
            }
        }
        connection.deregister(&self.id).await;
    }

    /// Detach from the broker; safe to call more than once
    async fn close(&self) {
        let (connection, subscription) = {
            let mut attachment = self.attachment.lock();
            (attachment.connection.take(), attachment.subscription.take())
        };
        if let Some(connection) = connection {
            self.leave(&connection, subscription).await;
            debug!(node = %self.id, "Node closed");
        }
    }

    fn connected_text(&self) -> Option<String> {
        let attachment = self.attachment.lock();
        let connection = attachment.connection.as_ref()?;
        Some(match &attachment.subscription {
            Some(subscription) => format!("sub on {} @ {}", connection.label(), subscription.topic),
            None => connection.label().to_string(),
        })
    }

    fn on_connected(&self) {
        if let Some(text) = self.connected_text() {
            self.report(NodeStatus::ok(text));
        }
    }

    fn on_connecting(&self) {
        if let Some(connection) = self.connection() {
            self.report(NodeStatus::problem(format!(
                "connecting to {}",
                connection.label()
            )));
        }
    }

    fn on_disconnected(&self) {
        if let Some(connection) = self.connection() {
            self.report(NodeStatus::problem(connection.label()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_broker() {
        assert!(validate_broker(&BrokerConfig::new("broker.local", 1883).normalize()).is_ok());
        assert!(validate_broker(&BrokerConfig::new("10.0.0.7", 8883).normalize()).is_ok());
        assert!(matches!(
            validate_broker(&BrokerConfig::new("bad host", 1883).normalize()),
            Err(BridgeError::ConfigInvalid { .. })
        ));
    }
}
