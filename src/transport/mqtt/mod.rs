//! rumqttc-backed transport
//!
//! The module keeps the pure parts apart from the I/O:
//!
//! - [`connection`] - URL parsing, TLS setup and option building
//! - [`message_handler`] - pure routing of rumqttc events to [`TransportEvent`]s
//! - [`client`] - the connector, the link and the event loop driver
//!
//! Links speak MQTT 3.1.1 whether or not compat mode is set.
//!
//! # Usage
//!
//! ```rust,no_run
//! use brokerlink::message::Qos;
//! use brokerlink::transport::{ConnectOptions, Connector, EndMode, MqttConnector, TransportEvent};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let options = ConnectOptions {
//!     client_id: "mqtt_1a2b3c4d".to_string(),
//!     keep_alive: Duration::from_secs(60),
//!     clean_session: true,
//!     compat_mode: true,
//!     verify_server_cert: false,
//!     credentials: None,
//!     will: None,
//! };
//!
//! let (link, mut events) = MqttConnector.connect("mqtt://localhost:1883", &options).await?;
//! if let Some(TransportEvent::Connected) = events.recv().await {
//!     link.subscribe("sensors/#", Qos::AtLeastOnce).await?;
//! }
//! link.end(EndMode::Graceful).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```
//!
//! [`TransportEvent`]: crate::transport::TransportEvent

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnector, MqttLink};
pub use connection::{configure_mqtt_options, parse_broker_url, tls_mode, BrokerAddress, TlsMode};
pub use message_handler::{EventRoute, LoopStep, MessageHandler};
