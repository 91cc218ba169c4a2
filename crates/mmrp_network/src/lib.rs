//! MMRP Network — brokerless message routing between relays and clients.
//!
//! A fleet of processes forms a mesh: relays accept links and forward
//! traffic between each other and the clients attached to them, clients
//! talk to the mesh through exactly one relay. Messages travel as
//! [`Envelope`]s carrying an explicit route, so no node needs to know the
//! whole topology.
//!
//! # Architecture
//!
//! - **Envelope**: multi-frame wire unit with route, payload and return route.
//! - **Node**: [`MeshNode`] keeps the peer tables, handshakes, routes unicast
//!   sends with retry, floods broadcasts and dispatches local deliveries.
//! - **Transport**: ROUTER/DEALER style socket traits with a WebSocket
//!   implementation (via `tokio-tungstenite`) and an in-memory one.
//! - **Discovery**: UDP broadcast on the LAN reporting relays up and down.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mmrp_network::{Envelope, MeshNode, NodeConfig, PeerMeta};
//!
//! # async fn example() -> Result<(), mmrp_network::MeshError> {
//! let node = MeshNode::bind(&NodeConfig::relay("east")).await?;
//! let (_, mut inbox) = node.subscribe_channel("delivery.chat");
//!
//! node.connect("ws://10.0.0.6:9480", PeerMeta::now("west")).await?;
//! let hello = Envelope::new("chat.say", ["hello"])?.with_route(["west"]);
//! node.send(hello, 1).await?;
//!
//! while let Some(envelope) = inbox.recv().await {
//!     println!("{envelope}");
//! }
//! node.close();
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod node;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use broadcast::RoutingStyle;
pub use config::{NodeConfig, NodeRole};
pub use connection::{ClientConnection, RelayConnection};
pub use discovery::{Announcement, DiscoveryConfig, DiscoveryEvent, DiscoveryService};
pub use dispatch::SubscriptionId;
pub use envelope::{Envelope, TRACK_ROUTE};
pub use error::MeshError;
pub use node::{MeshNode, PeerMeta};
pub use transport::memory::MemoryNetwork;
