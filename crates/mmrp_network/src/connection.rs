//! Peer bookkeeping — known relays and clients and the routes to reach them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A relay this node can route to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConnection {
    /// Network address, unset when the relay was only learned from a handshake.
    pub uri: Option<String>,
    /// Hops to reach the relay; the last hop is the relay itself.
    pub route: Vec<String>,
    /// Freshness of the registration. Higher wins on same-uri conflicts.
    pub timestamp: u64,
}

impl RelayConnection {
    pub fn new(uri: Option<String>, route: Vec<String>, timestamp: u64) -> Self {
        Self { uri, route, timestamp }
    }

    pub fn identity(&self) -> Option<&str> {
        self.route.last().map(String::as_str)
    }
}

/// A client attached to this relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConnection {
    pub route: Vec<String>,
}

impl ClientConnection {
    pub fn new(route: Vec<String>) -> Self {
        Self { route }
    }

    pub fn identity(&self) -> Option<&str> {
        self.route.last().map(String::as_str)
    }
}

/// Relays keyed by cluster id and clients keyed by identity.
#[derive(Debug, Default)]
pub struct PeerTables {
    pub relays: HashMap<String, RelayConnection>,
    pub clients: HashMap<String, ClientConnection>,
}

impl PeerTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster ids of relays registered at `uri` under a different cluster id.
    pub fn relays_at_uri_except(&self, uri: &str, cluster_id: &str) -> Vec<(String, u64)> {
        self.relays
            .iter()
            .filter(|(id, relay)| id.as_str() != cluster_id && relay.uri.as_deref() == Some(uri))
            .map(|(id, relay)| (id.clone(), relay.timestamp))
            .collect()
    }

    /// Register a relay learned from a handshake, keeping any uri and
    /// timestamp already recorded for it.
    pub fn upsert_relay_route(&mut self, cluster_id: &str, route: Vec<String>) {
        self.relays
            .entry(cluster_id.to_string())
            .and_modify(|relay| relay.route = route.clone())
            .or_insert_with(|| RelayConnection::new(None, route, 0));
    }

    pub fn clear(&mut self) {
        self.relays.clear();
        self.clients.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
