//! Subscribing node
//!
//! Messages matching the node's filter are decoded and sent to the node's
//! output channel as [`Message`]s.

use super::params::{NodeParams, TopicRequest};
use super::NodeCore;
use crate::broker::{BrokerConnection, BrokerRegistry, DeliveryHandler, LinkObserver, NodeId};
use crate::config::BrokerConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::message::{FlowMessage, Message};
use crate::node_span;
use crate::observability::{NodeStatus, StatusSink};
use crate::topic::validate_filter;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

pub struct InputNode {
    core: NodeCore,
    output: mpsc::UnboundedSender<Message>,
    me: Weak<InputNode>,
}

impl InputNode {
    pub fn new(
        params: NodeParams,
        registry: Arc<BrokerRegistry>,
        status: Arc<dyn StatusSink>,
        output: mpsc::UnboundedSender<Message>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: NodeCore::new(params, registry, status),
            output,
            me: me.clone(),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.core.id
    }

    pub fn params(&self) -> &NodeParams {
        &self.core.params
    }

    /// Current connection, if attached
    pub fn connection(&self) -> Option<Arc<BrokerConnection>> {
        self.core.connection()
    }

    /// Current filter, if subscribed
    pub fn topic(&self) -> Option<String> {
        self.core.subscription().map(|s| s.topic)
    }

    fn observer(&self) -> Weak<dyn LinkObserver> {
        self.me.clone()
    }

    /// Connect (and subscribe) up front when nothing depends on a message
    pub async fn start(&self) -> BridgeResult<()> {
        let Some(request) = self.core.static_broker() else {
            return Ok(());
        };
        self.connect(&request?).await?;

        if let Some(topic) = self.core.params.static_topic_request() {
            self.subscribe(topic).await?;
        }
        Ok(())
    }

    pub async fn connect(&self, request: &BrokerConfig) -> BridgeResult<Arc<BrokerConnection>> {
        self.core.connect(request, self.observer()).await
    }

    /// Replace the current subscription
    ///
    /// An empty filter only drops the current one.
    pub async fn subscribe(&self, request: TopicRequest) -> BridgeResult<()> {
        if let Err(e) = validate_filter(&request.topic) {
            warn!(node = %self.core.id, topic = %request.topic, "Invalid subscription filter");
            self.core
                .report(NodeStatus::problem(format!("wrong topic : {}", request.topic)));
            return Err(e);
        }

        let Some(connection) = self.core.connection() else {
            return Err(BridgeError::config_invalid("not attached to a broker"));
        };
        let previous = self.core.subscription();

        if previous.as_ref() == Some(&request) {
            return Ok(());
        }

        if let Some(previous) = previous {
            if let Err(e) = connection
                .unsubscribe(&previous.topic, Some(&self.core.id))
                .await
            {
                warn!(node = %self.core.id, topic = %previous.topic, error = %e, "Unsubscribe failed");
            }
            self.core.set_subscription(None);
        }

        if request.topic.is_empty() {
            self.core.report(NodeStatus::ok(connection.label()));
            return Ok(());
        }

        self.core.set_subscription(Some(request.clone()));
        connection
            .subscribe(
                &request.topic,
                request.qos,
                self.delivery_handler(),
                Some(self.core.id.clone()),
            )
            .await?;

        if connection.is_connected() {
            self.core.report(NodeStatus::ok(format!(
                "sub on {} @ {}",
                connection.label(),
                request.topic
            )));
        }
        Ok(())
    }

    fn delivery_handler(&self) -> DeliveryHandler {
        let node = self.me.clone();
        Arc::new(move |message: &Message| {
            if let Some(node) = node.upgrade() {
                node.deliver(message);
            }
        })
    }

    fn deliver(&self, message: &Message) {
        if self.core.connection().is_none() {
            return;
        }
        if self.output.send(message.clone()).is_err() {
            debug!(node = %self.core.id, "Output channel closed, dropping message");
        }
    }

    /// Resolve broker and topic from a flow message, then connect and subscribe
    pub async fn on_input(&self, message: &FlowMessage) -> BridgeResult<()> {
        let span = node_span!(node = %self.core.id);
        self.follow(message).instrument(span).await
    }

    async fn follow(&self, message: &FlowMessage) -> BridgeResult<()> {
        let request = self.core.resolve_broker(&message.fields)?;
        self.connect(&request).await?;
        self.subscribe(self.core.params.topic_request(&message.fields))
            .await
    }

    pub async fn close(&self) {
        self.core.close().await;
    }
}

impl LinkObserver for InputNode {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LinkState;
    use crate::config::{NodeConfig, NodeKind, Settings};
    use crate::message::{Payload, Qos};
    use crate::node::ValueSource;
    use crate::observability::StatusFill;
    use crate::testing::{LinkCall, MockConnector, RecordingStatus, StaticTokens};
    use crate::transport::{EndMode, TransportEvent};
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        connector: Arc<MockConnector>,
        registry: Arc<BrokerRegistry>,
        status: Arc<RecordingStatus>,
    }

    impl Fixture {
        fn new() -> Self {
            let connector = Arc::new(MockConnector::new());
            let registry = Arc::new(BrokerRegistry::new(
                Settings::default(),
                connector.clone(),
                Arc::new(StaticTokens::failing()),
            ));
            Self {
                connector,
                registry,
                status: Arc::new(RecordingStatus::new()),
            }
        }

        fn node(&self, config: NodeConfig) -> (Arc<InputNode>, mpsc::UnboundedReceiver<Message>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let node = InputNode::new(
                NodeParams::parse(config),
                self.registry.clone(),
                self.status.clone(),
                tx,
            );
            (node, rx)
        }
    }

    fn config(id: &str) -> NodeConfig {
        let mut config = NodeConfig::new(id, NodeKind::Input);
        config.host = ValueSource::message("broker");
        config.topic = ValueSource::message("topic");
        config.qos = ValueSource::literal(1);
        config
    }

    #[tokio::test]
    async fn test_on_input_connects_and_subscribes() {
        let fixture = Fixture::new();
        let (node, mut rx) = fixture.node(config("in-1"));

        node.on_input(&FlowMessage::from_json(json!({
            "broker": "broker.local",
            "topic": "sensors/+/temp"
        })))
        .await
        .unwrap();

        let link = fixture.connector.wait_for_link(0, WAIT).await;
        assert_eq!(link.url(), "mqtt://broker.local:1883");
        link.emit(TransportEvent::Connected);
        let connection = node.connection().unwrap();
        assert!(connection.wait_for_state(LinkState::Connected, WAIT).await);

        assert_eq!(
            link.subscribe_calls(),
            vec![("sensors/+/temp".to_string(), Qos::AtLeastOnce)]
        );
        assert_eq!(
            fixture.status.latest(node.id()).unwrap(),
            NodeStatus::ok("sub on broker.local:1883 @ sensors/+/temp")
        );

        link.emit_publish("sensors/kitchen/temp", "19");
        let delivered = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.topic, "sensors/kitchen/temp");
        assert_eq!(delivered.payload, Payload::Text("19".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_filter_is_rejected() {
        let fixture = Fixture::new();
        let (node, _rx) = fixture.node(config("in-1"));

        let result = node
            .on_input(&FlowMessage::from_json(json!({
                "broker": "broker.local",
                "topic": "a/#/b"
            })))
            .await;

        assert!(matches!(result, Err(BridgeError::TopicInvalid { .. })));
        let status = fixture.status.latest(node.id()).unwrap();
        assert_eq!(status.fill, StatusFill::Red);
        assert_eq!(status.text, "wrong topic : a/#/b");
        assert!(node.connection().unwrap().filters().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_broker_reports_config_invalid() {
        let fixture = Fixture::new();
        let (node, _rx) = fixture.node(config("in-1"));

        let result = node
            .on_input(&FlowMessage::from_json(json!({"topic": "a"})))
            .await;

        assert!(matches!(result, Err(BridgeError::ConfigInvalid { .. })));
        assert_eq!(fixture.connector.connect_count(), 0);
        assert_eq!(
            fixture.status.latest(node.id()).unwrap().fill,
            StatusFill::Red
        );
    }

    #[tokio::test]
    async fn test_changing_topic_replaces_subscription() {
        let fixture = Fixture::new();
        let (node, _rx) = fixture.node(config("in-1"));
        let message = |topic: &str| {
            FlowMessage::from_json(json!({"broker": "broker.local", "topic": topic}))
        };

        node.on_input(&message("a/1")).await.unwrap();
        node.on_input(&message("a/2")).await.unwrap();

        let connection = node.connection().unwrap();
        assert_eq!(
            connection.filters().await,
            vec![("a/2".to_string(), Qos::AtLeastOnce)]
        );
        assert_eq!(node.topic(), Some("a/2".to_string()));

        // Empty topic drops the subscription
        node.on_input(&message("")).await.unwrap();
        assert!(connection.filters().await.is_empty());
        assert_eq!(node.topic(), None);
    }

    #[tokio::test]
    async fn test_switching_broker_leaves_old_connection() {
        let fixture = Fixture::new();
        let (node, _rx) = fixture.node(config("in-1"));

        node.on_input(&FlowMessage::from_json(json!({"broker": "one", "topic": "t"})))
            .await
            .unwrap();
        let first = node.connection().unwrap();
        let first_link = fixture.connector.wait_for_link(0, WAIT).await;

        node.on_input(&FlowMessage::from_json(json!({"broker": "two", "topic": "t"})))
            .await
            .unwrap();
        let second = node.connection().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.observer_count().await, 0);
        assert!(first.filters().await.is_empty());
        assert_eq!(first_link.end_calls(), 1);
        assert_eq!(second.observer_count().await, 1);
        assert_eq!(fixture.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_same_broker_is_reused() {
        let fixture = Fixture::new();
        let (node, _rx) = fixture.node(config("in-1"));

        for _ in 0..3 {
            node.on_input(&FlowMessage::from_json(json!({"broker": "one", "topic": "t"})))
                .await
                .unwrap();
        }
        assert_eq!(fixture.connector.connect_count(), 1);
        assert_eq!(node.connection().unwrap().observer_count().await, 1);
    }

    #[tokio::test]
    async fn test_start_with_static_config() {
        let fixture = Fixture::new();
        let mut static_config = NodeConfig::new("in-1", NodeKind::Input);
        static_config.topic = ValueSource::literal("status/#");
        let (node, _rx) = fixture.node(static_config);

        node.start().await.unwrap();

        let link = fixture.connector.wait_for_link(0, WAIT).await;
        assert_eq!(link.url(), "mqtt://localhost:1883");
        assert_eq!(node.topic(), Some("status/#".to_string()));
    }

    #[tokio::test]
    async fn test_start_waits_for_message_driven_broker() {
        let fixture = Fixture::new();
        let (node, _rx) = fixture.node(config("in-1"));

        node.start().await.unwrap();
        assert!(node.connection().is_none());
        assert_eq!(fixture.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_delivery() {
        let fixture = Fixture::new();
        let (node, mut rx) = fixture.node(config("in-1"));

        node.on_input(&FlowMessage::from_json(json!({"broker": "one", "topic": "t"})))
            .await
            .unwrap();
        let link = fixture.connector.wait_for_link(0, WAIT).await;
        let connection = node.connection().unwrap();

        node.close().await;
        node.close().await;

        assert_eq!(connection.observer_count().await, 0);
        assert!(connection.filters().await.is_empty());
        assert_eq!(
            link.calls()
                .iter()
                .filter(|c| matches!(c, LinkCall::End(EndMode::Force)))
                .count(),
            1
        );

        link.emit_publish("t", "late");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_with_unusable_configured_host() {
        let fixture = Fixture::new();
        let mut config = NodeConfig::new("in-1", NodeKind::Input);
        config.host = ValueSource::literal(json!(["broker.local"]));
        config.topic = ValueSource::literal("sensors/#");
        let (node, _rx) = fixture.node(config);

        let result = node.start().await;
        assert!(matches!(result, Err(BridgeError::ConfigInvalid { .. })));
        assert_eq!(fixture.connector.connect_count(), 0);
        assert!(node.connection().is_none());

        let status = fixture.status.latest(node.id()).unwrap();
        assert_eq!(status.fill, StatusFill::Red);
        assert!(status.text.contains("host must be text"));
    }
}
