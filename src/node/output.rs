//! Publishing node

use super::params::NodeParams;
use super::NodeCore;
use crate::broker::{BrokerConnection, BrokerRegistry, LinkObserver, NodeId, PublishError};
use crate::config::BrokerConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::message::{FlowMessage, Message};
use crate::node_span;
use crate::observability::{NodeStatus, StatusSink};
use crate::topic::validate_publish_topic;
use std::sync::{Arc, Weak};
use tracing::{debug, warn, Instrument};

pub struct OutputNode {
    core: NodeCore,
    me: Weak<OutputNode>,
}

impl OutputNode {
    pub fn new(
        params: NodeParams,
        registry: Arc<BrokerRegistry>,
        status: Arc<dyn StatusSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: NodeCore::new(params, registry, status),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.core.id
    }

    pub fn params(&self) -> &NodeParams {
        &self.core.params
    }

    pub fn connection(&self) -> Option<Arc<BrokerConnection>> {
        self.core.connection()
    }

    /// Connect up front when the broker does not depend on a message
    pub async fn start(&self) -> BridgeResult<()> {
        let Some(request) = self.core.static_broker() else {
            return Ok(());
        };
        self.connect(&request?).await?;
        Ok(())
    }

    pub async fn connect(&self, request: &BrokerConfig) -> BridgeResult<Arc<BrokerConnection>> {
        let observer: Weak<dyn LinkObserver> = self.me.clone();
        self.core.connect(request, observer).await
    }

    /// Publish the message payload to the resolved topic
    ///
    /// Publishing while the link is down is `NotConnected`; nothing is queued.
    pub async fn on_input(&self, message: &FlowMessage) -> BridgeResult<()> {
        let span = node_span!(node = %self.core.id);
        self.publish(message).instrument(span).await
    }

    async fn publish(&self, message: &FlowMessage) -> BridgeResult<()> {
        let request = self.core.resolve_broker(&message.fields)?;
        let connection = self.connect(&request).await?;

        let topic = self.core.params.topic(&message.fields);
        if let Err(e) = validate_publish_topic(&topic) {
            warn!(node = %self.core.id, topic = %topic, "Refusing to publish");
            self.core
                .report(NodeStatus::problem(format!("wrong topic : {topic}")));
            return Err(e);
        }

        let outgoing = Message {
            topic,
            payload: message.payload.clone(),
            qos: self.core.params.qos(&message.fields),
            retain: self.core.params.retain(&message.fields),
        };

        if connection.is_connected() {
            self.core.report(NodeStatus::ok(format!(
                "pub on {} @ {}",
                connection.label(),
                outgoing.topic
            )));
        }

        connection.publish(&outgoing).await.map_err(|e| {
            match &e {
                PublishError::NotConnected => {
                    debug!(node = %self.core.id, topic = %outgoing.topic, "Dropped, broker not connected")
                }
                PublishError::Transport(_) => {
                    warn!(node = %self.core.id, topic = %outgoing.topic, error = %e, "Publish failed")
                }
            }
            BridgeError::from(e)
        })
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}

impl LinkObserver for OutputNode {
    fn connected(&self) {
        self.core.on_connected();
    }

    fn connecting(&self) {
        self.core.on_connecting();
    }

    fn disconnected(&self) {
        self.core.on_disconnected();
    }
}
