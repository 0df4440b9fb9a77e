//! Fingerprint-keyed registry of shared broker connections

use super::connection::BrokerConnection;
use crate::auth::TokenSource;
use crate::config::{BrokerConfig, Fingerprint, ResolvedBroker, Settings};
use crate::transport::Connector;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Hands out one [`BrokerConnection`] per distinct broker configuration
///
/// Entries live as long as the registry. A connection whose last node left
/// keeps its subscription table and is reused by the next node asking for the
/// same broker.
pub struct BrokerRegistry {
    settings: Settings,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
    entries: Mutex<HashMap<Fingerprint, Arc<BrokerConnection>>>,
}

impl BrokerRegistry {
    pub fn new(
        settings: Settings,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            settings,
            connector,
            tokens,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Shared connection for `config`, created on first request
    pub fn get(&self, config: &BrokerConfig) -> Arc<BrokerConnection> {
        self.get_resolved(&config.normalize())
    }

    /// Same as [`get`](Self::get) for an already normalized broker
    ///
    /// Non-identity fields (birth, will) of later requests are ignored.
    pub fn get_resolved(&self, broker: &ResolvedBroker) -> Arc<BrokerConnection> {
        let fingerprint = broker.fingerprint();
        let mut entries = self.entries.lock();

        entries
            .entry(fingerprint)
            .or_insert_with_key(|fingerprint| {
                debug!(fingerprint = %fingerprint, "Creating broker connection");
                BrokerConnection::new(
                    broker.clone(),
                    &self.settings,
                    self.connector.clone(),
                    self.tokens.clone(),
                )
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn connections(&self) -> Vec<Arc<BrokerConnection>> {
        self.entries.lock().values().cloned().collect()
    }
}
