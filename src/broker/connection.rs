//! One physical connection to one broker
//!
//! A [`BrokerConnection`] is shared by every node whose broker configuration
//! has the same fingerprint. It connects when the first node registers, tears
//! the link down when the last one leaves, retries after an established
//! connection is lost, and multiplexes subscriptions from all its nodes.
//!
//! All state lives behind one async mutex. Transport events are consumed by a
//! driver task per link and run through [`BrokerConnection::handle_event`], so
//! handlers never interleave. Each link gets a new generation number; events
//! carrying an older generation are dropped.

use super::subscriptions::{DeliveryHandler, Removal, SubscriptionTable};
use super::NodeId;
use crate::auth::TokenSource;
use crate::config::{Fingerprint, ResolvedBroker, Settings};
use crate::link_span;
use crate::message::{Message, Qos};
use crate::transport::{
    ConnectOptions, Connector, EndMode, EventReceiver, Link, LinkCredentials, TransportError,
    TransportEvent,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Lifecycle of a broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Graceful teardown after the last node left
    Closing,
}

/// Callbacks a registered node receives on state changes
///
/// Called with the connection locked; implementations must not call back
/// into the connection.
pub trait LinkObserver: Send + Sync {
    fn connected(&self);
    fn connecting(&self);
    fn disconnected(&self);
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to the broker")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct Inner {
    state: LinkState,
    generation: u64,
    link: Option<Arc<dyn Link>>,
    reconnect_timer: Option<JoinHandle<()>>,
    observers: BTreeMap<NodeId, Weak<dyn LinkObserver>>,
    subscriptions: SubscriptionTable,
}

impl Inner {
    fn live_observers(&self) -> Vec<Arc<dyn LinkObserver>> {
        self.observers.values().filter_map(Weak::upgrade).collect()
    }

    fn notify(&self, callback: impl Fn(&dyn LinkObserver)) {
        for observer in self.live_observers() {
            callback(observer.as_ref());
        }
    }

    /// Link to use for transport calls, only while connected
    fn connected_link(&self) -> Option<Arc<dyn Link>> {
        match self.state {
            LinkState::Connected => self.link.clone(),
            _ => None,
        }
    }
}

pub struct BrokerConnection {
    broker: ResolvedBroker,
    fingerprint: Fingerprint,
    url: String,
    label: String,
    options: ConnectOptions,
    token_username: String,
    reconnect_period: Duration,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<LinkState>,
    me: Weak<BrokerConnection>,
}

/// `mqtt_` plus eight random hex digits
fn generated_client_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("mqtt_{}", &random[..8])
}

impl BrokerConnection {
    pub fn new(
        broker: ResolvedBroker,
        settings: &Settings,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenSource>,
    ) -> Arc<Self> {
        let client_id = if broker.client_id.is_empty() {
            generated_client_id()
        } else {
            broker.client_id.clone()
        };

        let options = ConnectOptions {
            client_id,
            keep_alive: broker.keep_alive(),
            clean_session: broker.clean_session,
            compat_mode: broker.compat_mode,
            verify_server_cert: broker.verify_server_cert,
            credentials: None,
            will: broker.will.clone(),
        };
        let (state_tx, _) = watch::channel(LinkState::Disconnected);

        Arc::new_cyclic(|me| Self {
            fingerprint: broker.fingerprint(),
            url: broker.url(),
            label: broker.label(),
            broker,
            options,
            token_username: settings.token_username.clone(),
            reconnect_period: settings.reconnect_period(),
            connector,
            tokens,
            inner: Mutex::new(Inner {
                state: LinkState::Disconnected,
                generation: 0,
                link: None,
                reconnect_timer: None,
                observers: BTreeMap::new(),
                subscriptions: SubscriptionTable::new(),
            }),
            state_tx,
            me: me.clone(),
        })
    }

    pub fn broker(&self) -> &ResolvedBroker {
        &self.broker
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `host:port`
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Client id sent to the broker, generated once when none was configured
    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    /// State as of the end of the last completed operation
    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Wait until the connection reaches `target`, false on timeout
    pub async fn wait_for_state(&self, target: LinkState, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub async fn observer_count(&self) -> usize {
        self.inner.lock().await.observers.len()
    }

    /// Stored filters with their effective QoS
    pub async fn filters(&self) -> Vec<(String, Qos)> {
        self.inner.lock().await.subscriptions.active_filters()
    }

    fn set_state(&self, inner: &mut Inner, state: LinkState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Add a node; the first one triggers a connect
    pub async fn register(&self, id: NodeId, observer: Weak<dyn LinkObserver>) {
        let first = {
            let mut inner = self.inner.lock().await;
            inner.observers.insert(id.clone(), observer);
            inner.observers.len() == 1
        };
        debug!(broker = %self.label, node = %id, "Node registered");

        if first {
            self.connect().await;
        }
    }

    /// Remove a node; the last one out closes the link
    ///
    /// Returns once teardown has finished. Unknown ids return immediately.
    pub async fn deregister(&self, id: &NodeId) {
        let mut inner = self.inner.lock().await;
        if inner.observers.remove(id).is_none() {
            return;
        }
        debug!(broker = %self.label, node = %id, "Node deregistered");

        if !inner.observers.is_empty() || inner.state == LinkState::Closing {
            return;
        }

        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }

        let Some(link) = inner.link.take() else {
            // A connect may still be in flight; it ends itself on acknowledgement
            return;
        };

        let mode = if inner.state == LinkState::Connected {
            EndMode::Graceful
        } else {
            EndMode::Force
        };
        inner.generation += 1;
        self.set_state(&mut inner, LinkState::Closing);

        info!(broker = %self.label, "Last node left, closing link");
        if let Err(e) = link.end(mode).await {
            warn!(broker = %self.label, error = %e, "Link did not close cleanly");
        }
        self.set_state(&mut inner, LinkState::Disconnected);
    }

    /// Open a link unless one is up or being opened
    pub async fn connect(&self) {
        let generation = {
            let mut inner = self.inner.lock().await;
            if matches!(inner.state, LinkState::Connected | LinkState::Connecting) {
                return;
            }
            inner.generation += 1;
            self.set_state(&mut inner, LinkState::Connecting);
            inner.generation
        };

        let span = link_span!(broker = %self.label, generation);
        self.open_link(generation).instrument(span).await;
    }

    async fn open_link(&self, generation: u64) {
        let mut options = self.options.clone();
        if let Some(credentials) = &self.broker.credentials {
            // Token failures are logged by the source; the broker decides without one
            if let Ok(token) = self.tokens.fetch(credentials).await {
                options.credentials = Some(LinkCredentials {
                    username: self.token_username.clone(),
                    password: token,
                });
            }
        }

        info!(url = %self.url, client_id = %options.client_id, "Connecting to broker");
        let result = self.connector.connect(&self.url, &options).await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok((link, events)) if inner.generation == generation => {
                inner.link = Some(link);
                self.spawn_driver(generation, events);
            }
            Ok((link, _)) => {
                drop(inner);
                debug!("Connect attempt superseded, dropping its link");
                let _ = link.end(EndMode::Force).await;
            }
            Err(e) if inner.generation == generation => {
                warn!(url = %self.url, error = %e, "Could not open broker link");
                self.set_state(&mut inner, LinkState::Disconnected);
            }
            Err(e) => debug!(error = %e, "Superseded connect attempt failed"),
        }
    }

    fn spawn_driver(&self, generation: u64, mut events: EventReceiver) {
        let connection = self.me.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                connection.handle_event(generation, event).await;
            }
        });
    }

    /// Schedule one retry after the reconnect period
    pub async fn reconnect(&self) {
        let mut inner = self.inner.lock().await;
        self.schedule_reconnect(&mut inner);
    }

    fn schedule_reconnect(&self, inner: &mut Inner) {
        if inner.state != LinkState::Disconnected {
            return;
        }
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }

        debug!(broker = %self.label, delay_ms = self.reconnect_period.as_millis() as u64, "Reconnect scheduled");
        let connection = self.me.clone();
        let delay = self.reconnect_period;
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(connection) = connection.upgrade() {
                connection.fire_reconnect().await;
            }
        }));
    }

    async fn fire_reconnect(&self) {
        {
            let mut inner = self.inner.lock().await;
            // Running timers are no longer abortable
            inner.reconnect_timer = None;
            if inner.state != LinkState::Disconnected || inner.observers.is_empty() {
                return;
            }
            info!(broker = %self.label, "Reconnecting");
            inner.notify(|o| o.connecting());
        }
        self.connect().await;
    }

    /// Single dispatcher for link events
    pub(crate) async fn handle_event(&self, generation: u64, event: TransportEvent) {
        let mut inner = self.inner.lock().await;
        if generation != inner.generation {
            debug!(broker = %self.label, ?event, "Dropping event from a stale link");
            return;
        }

        match event {
            TransportEvent::Connected => self.on_connected(inner).await,
            TransportEvent::Reconnecting => inner.notify(|o| o.connecting()),
            TransportEvent::Closed => self.on_closed(&mut inner).await,
            TransportEvent::Error(reason) => self.on_error(&mut inner, reason).await,
            TransportEvent::Message(publish) => {
                let handlers = inner.subscriptions.handlers_for(&publish.topic);
                drop(inner);

                let message = publish.to_message();
                for handler in handlers {
                    handler(&message);
                }
            }
        }
    }

    async fn on_connected(&self, mut inner: MutexGuard<'_, Inner>) {
        if inner.observers.is_empty() {
            info!(broker = %self.label, "Connected with no nodes left, closing");
            inner.generation += 1;
            if let Some(link) = inner.link.take() {
                if let Err(e) = link.end(EndMode::Graceful).await {
                    warn!(broker = %self.label, error = %e, "Link did not close cleanly");
                }
            }
            self.set_state(&mut inner, LinkState::Disconnected);
            return;
        }

        inner.state = LinkState::Connected;
        info!(broker = %self.label, "Connected to broker");
        inner.notify(|o| o.connected());

        if let Some(link) = inner.link.clone() {
            for (filter, qos) in inner.subscriptions.active_filters() {
                if let Err(e) = link.subscribe(&filter, qos).await {
                    warn!(broker = %self.label, filter = %filter, error = %e, "Resubscribe failed");
                }
            }

            if let Some(birth) = &self.broker.birth {
                let message = Message::from(birth);
                if let Err(e) = link
                    .publish(&message.topic, message.payload.to_wire(), message.qos, message.retain)
                    .await
                {
                    warn!(broker = %self.label, topic = %message.topic, error = %e, "Birth message not sent");
                }
            }
        }

        self.set_state(&mut inner, LinkState::Connected);
    }

    async fn on_closed(&self, inner: &mut Inner) {
        if inner.state != LinkState::Connected {
            return;
        }

        warn!(broker = %self.label, "Connection lost");
        inner.generation += 1;
        self.set_state(inner, LinkState::Disconnected);
        inner.notify(|o| o.disconnected());

        if let Some(link) = inner.link.take() {
            let _ = link.end(EndMode::Force).await;
        }
        self.schedule_reconnect(inner);
    }

    async fn on_error(&self, inner: &mut Inner, reason: String) {
        if inner.state != LinkState::Connecting {
            debug!(broker = %self.label, reason = %reason, "Ignoring link error");
            return;
        }

        warn!(broker = %self.label, reason = %reason, "Connect attempt failed");
        inner.generation += 1;
        if let Some(link) = inner.link.take() {
            let _ = link.end(EndMode::Force).await;
        }
        self.set_state(inner, LinkState::Disconnected);
    }

    /// Add a subscriber on `filter`; `None` files it under id `"0"`
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: Qos,
        handler: DeliveryHandler,
        subscriber: Option<NodeId>,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let effective = inner
            .subscriptions
            .insert(filter, subscriber.unwrap_or_default(), qos, handler);

        if let Some(link) = inner.connected_link() {
            link.subscribe(filter, effective).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        filter: &str,
        subscriber: Option<&NodeId>,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let removal = match subscriber {
            Some(id) => inner.subscriptions.remove(filter, id),
            None => inner.subscriptions.remove(filter, &NodeId::default()),
        };

        if removal == Removal::FilterRemoved {
            if let Some(link) = inner.connected_link() {
                link.unsubscribe(filter).await?;
            }
        }
        Ok(())
    }

    /// Publish when connected; `NotConnected` without any transport call otherwise
    pub async fn publish(&self, message: &Message) -> Result<(), PublishError> {
        let inner = self.inner.lock().await;
        let link = inner.connected_link().ok_or(PublishError::NotConnected)?;
        link.publish(
            &message.topic,
            message.payload.to_wire(),
            message.qos,
            message.retain,
        )
        .await?;
        Ok(())
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.get_mut().reconnect_timer.take() {
            timer.abort();
        }
    }
}
