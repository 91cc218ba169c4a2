//! Socket capabilities the routing node is built on.
//!
//! Two kinds of socket exist, modelled on ROUTER/DEALER message-queue sockets:
//!
//! - [`PeerMultiplexedTransport`]: bound, addressable, many peers. The first
//!   outgoing frame names the destination peer and is stripped before
//!   transmission; sending to an unknown peer fails instead of dropping.
//!   Inbound frames are tagged with the identity of the peer that sent them.
//! - [`PeerSingleTransport`]: connects to a single remote and passes frames
//!   through unchanged. Inbound frames carry no sender.
//!
//! Both push what they receive into the node's inbound channel.

pub mod memory;
pub mod websocket;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::MeshError;

/// Frames received by a socket.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Identity of the peer that physically delivered the frames, if the
    /// socket can tell.
    pub sender: Option<String>,
    pub frames: Vec<Bytes>,
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

/// Operations shared by both socket kinds.
///
/// All methods are non-blocking; link setup happens in the background and
/// sends fail with [`MeshError::Unreachable`] until it completes.
pub trait Transport: Send + Sync {
    /// Identity this socket presents to its peers.
    fn identity(&self) -> &str;

    fn connect(&self, uri: &str) -> Result<(), MeshError>;

    fn disconnect(&self, uri: &str) -> Result<(), MeshError>;

    /// Queue a frame sequence for transmission. Returns the number of bytes
    /// handed to the link.
    fn send(&self, frames: Vec<Bytes>) -> Result<usize, MeshError>;

    fn close(&self);
}

/// A bound socket that reaches many peers by identity.
pub trait PeerMultiplexedTransport: Transport {
    /// Address other nodes connect to.
    fn endpoint(&self) -> &str;
}

/// A connecting socket that talks to exactly one remote.
pub trait PeerSingleTransport: Transport {
    /// Number of remotes this socket is currently configured to reach.
    fn peer_count(&self) -> usize;
}

/// The sockets a routing node owns.
#[derive(Clone, Default)]
pub struct Sockets {
    pub router: Option<std::sync::Arc<dyn PeerMultiplexedTransport>>,
    pub dealer: Option<std::sync::Arc<dyn PeerSingleTransport>>,
}

/// Total payload size of a frame sequence.
pub(crate) fn frames_len(frames: &[Bytes]) -> usize {
    frames.iter().map(Bytes::len).sum()
}

/// Split a router send into its destination and the frames to transmit.
pub(crate) fn split_destination(mut frames: Vec<Bytes>) -> Result<(String, Vec<Bytes>), MeshError> {
    if frames.is_empty() {
        return Err(MeshError::InvalidEnvelope("no frames to send".into()));
    }
    let rest = frames.split_off(1);
    let destination = std::str::from_utf8(&frames[0])
        .map_err(|_| MeshError::InvalidEnvelope("destination is not UTF-8".into()))?;
    if destination.is_empty() {
        return Err(MeshError::InvalidEnvelope("no destination to route to".into()));
    }
    Ok((destination.to_string(), rest))
}
