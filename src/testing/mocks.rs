//! Mock implementations for testing
//!
//! Provides a mock connector/link pair, a canned token source and a status
//! recorder so connections and nodes can be driven without a broker or an
//! auth server.

use crate::auth::{TokenError, TokenSource};
use crate::broker::NodeId;
use crate::config::Credentials;
use crate::message::{InboundPublish, Qos};
use crate::observability::{NodeStatus, StatusSink};
use crate::transport::{
    ConnectOptions, Connector, EndMode, EventReceiver, Link, TransportError, TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One call made on a [`MockLink`]
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCall {
    Subscribe {
        filter: String,
        qos: Qos,
    },
    Unsubscribe(String),
    Publish {
        topic: String,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    },
    End(EndMode),
}

/// Link recording every call in order
pub struct MockLink {
    url: String,
    options: ConnectOptions,
    calls: Mutex<Vec<LinkCall>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    fail_publish: AtomicBool,
}

impl MockLink {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Inject an event as if the transport produced it
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_publish(&self, topic: &str, payload: &str) {
        self.emit(TransportEvent::Message(InboundPublish {
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_string()),
            qos: Qos::AtMostOnce,
            retain: false,
        }));
    }

    /// Make every following publish fail
    pub fn fail_publishes(&self) {
        self.fail_publish.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().clone()
    }

    pub fn subscribe_calls(&self) -> Vec<(String, Qos)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LinkCall::Subscribe { filter, qos } => Some((filter, qos)),
                _ => None,
            })
            .collect()
    }

    pub fn publish_calls(&self) -> Vec<LinkCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, LinkCall::Publish { .. }))
            .collect()
    }

    pub fn end_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, LinkCall::End(_)))
            .count()
    }

    fn record(&self, call: LinkCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Link for MockLink {
    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), TransportError> {
        self.record(LinkCall::Subscribe {
            filter: filter.to_string(),
            qos,
        });
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.record(LinkCall::Unsubscribe(filter.to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed("mock publish failure".into()));
        }
        self.record(LinkCall::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn end(&self, mode: EndMode) -> Result<(), TransportError> {
        self.record(LinkCall::End(mode));
        Ok(())
    }
}

/// Connector handing out [`MockLink`]s, remembered in creation order
#[derive(Default)]
pub struct MockConnector {
    links: Mutex<Vec<Arc<MockLink>>>,
    attempts: AtomicUsize,
    should_fail: bool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect attempt fails before a link exists
    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    /// Number of connect attempts, failed ones included
    pub fn connect_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().clone()
    }

    pub fn link(&self, index: usize) -> Option<Arc<MockLink>> {
        self.links.lock().get(index).cloned()
    }

    /// Wait for the `index`-th link to be opened
    ///
    /// # Panics
    ///
    /// Panics when no such link shows up within `timeout`.
    pub async fn wait_for_link(&self, index: usize, timeout: Duration) -> Arc<MockLink> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(link) = self.link(index) {
                return link;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("link #{index} was not opened within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<(Arc<dyn Link>, EventReceiver), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err(TransportError::ConnectionFailed(format!(
                "mock refused {url}"
            )));
        }

        let (events, receiver) = mpsc::unbounded_channel();
        let link = Arc::new(MockLink {
            url: url.to_string(),
            options: options.clone(),
            calls: Mutex::new(Vec::new()),
            events,
            fail_publish: AtomicBool::new(false),
        });
        self.links.lock().push(link.clone());
        Ok((link, receiver))
    }
}

/// Token source returning a fixed token, or always failing
#[derive(Debug, Default)]
pub struct StaticTokens {
    token: Option<String>,
    calls: AtomicUsize,
}

impl StaticTokens {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for StaticTokens {
    async fn fetch(&self, _credentials: &Credentials) -> Result<String, TokenError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token
            .clone()
            .ok_or_else(|| TokenError::Login("mock auth server rejected the login".to_string()))
    }
}

/// Status sink keeping every report
#[derive(Debug, Default)]
pub struct RecordingStatus {
    reports: Mutex<Vec<(NodeId, NodeStatus)>>,
}

impl RecordingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self, node: &NodeId) -> Vec<NodeStatus> {
        self.reports
            .lock()
            .iter()
            .filter(|(id, _)| id == node)
            .map(|(_, status)| status.clone())
            .collect()
    }

    pub fn latest(&self, node: &NodeId) -> Option<NodeStatus> {
        self.statuses(node).pop()
    }
}

impl StatusSink for RecordingStatus {
    fn report(&self, node: &NodeId, status: NodeStatus) {
        self.reports.lock().push((node.clone(), status));
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn eventually<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectOptions {
        ConnectOptions {
            client_id: "mqtt_mock".to_string(),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            compat_mode: true,
            verify_server_cert: false,
            credentials: None,
            will: None,
        }
    }

    #[tokio::test]
    async fn test_mock_link_records_calls_in_order() {
        let connector = MockConnector::new();
        let (link, mut events) = connector
            .connect("mqtt://localhost:1883", &options())
            .await
            .unwrap();

        link.subscribe("a/#", Qos::AtLeastOnce).await.unwrap();
        link.publish("a/b", Bytes::from_static(b"x"), Qos::AtMostOnce, false)
            .await
            .unwrap();
        link.end(EndMode::Graceful).await.unwrap();

        let mock = connector.link(0).unwrap();
        assert_eq!(mock.calls().len(), 3);
        assert_eq!(mock.end_calls(), 1);
        assert_eq!(
            mock.subscribe_calls(),
            vec![("a/#".to_string(), Qos::AtLeastOnce)]
        );

        mock.emit(TransportEvent::Connected);
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
    }

    #[tokio::test]
    async fn test_failing_connector_counts_attempts() {
        let connector = MockConnector::failing();
        assert!(connector.connect("mqtt://x:1", &options()).await.is_err());
        assert_eq!(connector.connect_count(), 1);
        assert!(connector.links().is_empty());
    }

    #[tokio::test]
    async fn test_eventually_times_out() {
        assert!(!eventually(|| false, Duration::from_millis(20)).await);
        assert!(eventually(|| true, Duration::from_millis(20)).await);
    }
}
