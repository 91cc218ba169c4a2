//! Routing node configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::identity::is_wildcard;

/// Which sockets a node owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Binds a multi-peer socket and forwards between relays and its clients.
    Relay,
    /// Talks to the mesh through exactly one relay.
    Client,
    /// Relay that also hosts local client traffic.
    Both,
}

impl NodeRole {
    pub fn is_relay(self) -> bool {
        matches!(self, Self::Relay | Self::Both)
    }

    pub fn is_client(self) -> bool {
        matches!(self, Self::Client | Self::Both)
    }
}

/// Configuration for a single routing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Role of this node in the mesh.
    pub role: NodeRole,

    /// Address the relay socket binds to. Port 0 picks a free port.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,

    /// Host other nodes use to reach this relay; part of the derived cluster id.
    pub advertise_host: String,

    /// Explicit cluster id. Relays derive one from their bound port when
    /// unset; pure clients must be given their local relay's id.
    pub cluster_id: Option<String>,

    /// Delay between send attempts.
    #[serde(rename = "retry_delay_ms", with = "duration_ms_serde")]
    pub retry_delay: Duration,

    /// Attempts used for the handshake sent after connecting.
    pub handshake_attempts: u32,

    /// Delay between redials of a dropped outbound link.
    #[serde(rename = "reconnect_interval_ms", with = "duration_ms_serde")]
    pub reconnect_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Relay,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9480)),
            advertise_host: "127.0.0.1".to_string(),
            cluster_id: None,
            retry_delay: Duration::from_millis(200),
            handshake_attempts: 50,
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

impl NodeConfig {
    /// Config for a relay with an explicit cluster id.
    pub fn relay(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: Some(cluster_id.into()),
            ..Self::default()
        }
    }

    /// Config for a pure client of the relay owning `cluster_id`.
    pub fn client(cluster_id: impl Into<String>) -> Self {
        Self {
            role: NodeRole::Client,
            cluster_id: Some(cluster_id.into()),
            ..Self::default()
        }
    }

    /// Reject configurations a node cannot start with.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.role == NodeRole::Client && self.cluster_id.is_none() {
            return Err(MeshError::Config(
                "a pure client needs the cluster_id of its local relay".into(),
            ));
        }
        if let Some(id) = &self.cluster_id {
            if id.is_empty() || is_wildcard(id) {
                return Err(MeshError::Config(format!("invalid cluster_id {id:?}")));
            }
        }
        if self.handshake_attempts == 0 {
            return Err(MeshError::Config("handshake_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
