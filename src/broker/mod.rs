//! Shared broker connections
//!
//! One [`BrokerConnection`] exists per distinct broker fingerprint; the
//! [`BrokerRegistry`] hands out the shared instance. Nodes register as
//! [`LinkObserver`]s to keep a connection alive and hear about its state.

pub mod connection;
pub mod registry;
pub mod subscriptions;

pub use connection::{BrokerConnection, LinkObserver, LinkState, PublishError};
pub use registry::BrokerRegistry;
pub use subscriptions::{DeliveryHandler, Removal, SubscriptionTable};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node registered with a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Subscriptions made without a subscriber land under id `"0"`
impl Default for NodeId {
    fn default() -> Self {
        Self("0".to_string())
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
