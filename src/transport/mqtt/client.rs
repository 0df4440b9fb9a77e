//! Impure I/O for the rumqttc transport
//!
//! Every [`MqttConnector::connect`] builds a fresh client, spawns a task that
//! polls its event loop and forwards [`TransportEvent`]s, and returns the
//! [`MqttLink`] wrapping the client. The poll task stops at the first error so
//! rumqttc never reconnects behind the broker connection's back.

use super::connection::{configure_mqtt_options, to_mqtt_qos};
use super::message_handler::{EventRoute, LoopStep, MessageHandler};
use crate::message::Qos;
use crate::transport::{
    ConnectOptions, Connector, EndMode, EventReceiver, Link, TransportError, TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the request channel between client handle and event loop
const REQUEST_CAPACITY: usize = 10;

/// How long a graceful end waits for the event loop to drain
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Opens rumqttc links
#[derive(Debug, Default, Clone)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<(Arc<dyn Link>, EventReceiver), TransportError> {
        if url.starts_with("mqtts") && !options.verify_server_cert {
            warn!(url, "Server certificate verification is disabled");
        }

        let mqtt_options = configure_mqtt_options(url, options)?;
        let (client, event_loop) = rumqttc::AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let poller = tokio::spawn(drive(event_loop, events_tx, url.to_string()));
        let link = MqttLink::new(client, poller);

        info!(url, client_id = %options.client_id, compat = options.compat_mode, "MQTT link opened");
        Ok((Arc::new(link), events_rx))
    }
}

/// One rumqttc client plus the task polling its event loop
pub struct MqttLink {
    client: rumqttc::AsyncClient,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    fn new(client: rumqttc::AsyncClient, poller: JoinHandle<()>) -> Self {
        Self {
            client,
            poller: Mutex::new(Some(poller)),
        }
    }

    fn take_poller(&self) -> Option<JoinHandle<()>> {
        self.poller.lock().take()
    }
}

#[async_trait]
impl Link for MqttLink {
    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, to_mqtt_qos(qos))
            .await
            .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .publish_bytes(topic, to_mqtt_qos(qos), retain, payload)
            .await
            .map_err(|e| TransportError::PublishFailed(Box::new(e)))
    }

    async fn end(&self, mode: EndMode) -> Result<(), TransportError> {
        let Some(handle) = self.take_poller() else {
            return Ok(());
        };

        if mode == EndMode::Force {
            handle.abort();
            debug!("MQTT link force-closed");
            return Ok(());
        }

        if let Err(e) = self.client.disconnect().await {
            // Event loop already gone, nothing left to drain
            debug!(error = %e, "DISCONNECT not sent");
            handle.abort();
            return Ok(());
        }

        let abort = handle.abort_handle();
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                abort.abort();
            }
        }
        Ok(())
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.get_mut().take() {
            handle.abort();
        }
    }
}

/// Forward one routed event; returns false once polling should stop
fn forward(
    route: EventRoute,
    acknowledged: &mut bool,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> bool {
    match MessageHandler::next_step(route, acknowledged) {
        LoopStep::Emit(event) => events.send(event).is_ok(),
        LoopStep::Finish(event) => {
            let _ = events.send(event);
            false
        }
        LoopStep::Skip => !events.is_closed(),
    }
}

async fn drive(
    mut event_loop: rumqttc::EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    url: String,
) {
    let mut acknowledged = false;
    loop {
        let route = match event_loop.poll().await {
            Ok(event) => MessageHandler::route_event(&event),
            Err(e) => EventRoute::ConnectionLost(e.to_string()),
        };
        if !forward(route, &mut acknowledged, &events) {
            break;
        }
    }
    debug!(url = %url, "MQTT event loop stopped");
}
