//! In-process transport.
//!
//! A [`MemoryNetwork`] is a hub that sockets bind to and connect through by
//! uri. Links are resolved at send time, the way a message-queue socket
//! connects lazily, so connecting to a uri nobody has bound yet succeeds and
//! sends fail as unreachable until someone binds it. Per-socket counters let
//! tests observe how often a node touched the wire.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use super::{
    Inbound, InboundSender, PeerMultiplexedTransport, PeerSingleTransport, Transport, frames_len,
    split_destination,
};
use crate::error::MeshError;

/// Send counters for one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Calls to `send`, successful or not.
    pub attempts: usize,
    /// Frame sequences handed to a peer.
    pub sent: usize,
}

struct Endpoint {
    inbound: InboundSender,
    bound_uri: Option<String>,
    connected: HashSet<String>,
    tags_sender: bool,
}

#[derive(Default)]
struct Hub {
    endpoints: HashMap<String, Endpoint>,
    bound: HashMap<String, String>,
    stats: HashMap<String, SocketStats>,
}

impl Hub {
    fn endpoint_mut(&mut self, identity: &str) -> Result<&mut Endpoint, MeshError> {
        self.endpoints.get_mut(identity).ok_or(MeshError::Closed)
    }

    fn record_attempt(&mut self, identity: &str) -> Result<(), MeshError> {
        if !self.endpoints.contains_key(identity) {
            return Err(MeshError::Closed);
        }
        self.stats.entry(identity.to_string()).or_default().attempts += 1;
        Ok(())
    }

    /// Whether `from` has a link to `to`, in either direction.
    fn linked(&self, from: &str, to: &str) -> bool {
        let (Some(a), Some(b)) = (self.endpoints.get(from), self.endpoints.get(to)) else {
            return false;
        };
        let outbound = a
            .connected
            .iter()
            .any(|uri| self.bound.get(uri).map(String::as_str) == Some(to));
        let inbound = a
            .bound_uri
            .as_ref()
            .is_some_and(|uri| b.connected.contains(uri));
        outbound || inbound
    }

    fn deliver(&mut self, from: &str, to: &str, frames: Vec<Bytes>) -> Result<usize, MeshError> {
        let endpoint = self
            .endpoints
            .get(to)
            .ok_or_else(|| MeshError::Unreachable(to.to_string()))?;
        let len = frames_len(&frames);
        let sender = endpoint.tags_sender.then(|| from.to_string());
        endpoint
            .inbound
            .send(Inbound { sender, frames })
            .map_err(|_| MeshError::Unreachable(to.to_string()))?;
        self.stats.entry(from.to_string()).or_default().sent += 1;
        trace!("memory: {from} -> {to} ({len} bytes)");
        Ok(len)
    }

    fn register(&mut self, identity: &str, endpoint: Endpoint) -> Result<(), MeshError> {
        if self.endpoints.contains_key(identity) {
            return Err(MeshError::Config(format!("identity {identity} already in use")));
        }
        if let Some(uri) = &endpoint.bound_uri {
            if self.bound.contains_key(uri) {
                return Err(MeshError::Bind {
                    addr: uri.clone(),
                    hint: "close the socket bound there first".into(),
                    source: std::io::ErrorKind::AddrInUse.into(),
                });
            }
            self.bound.insert(uri.clone(), identity.to_string());
        }
        self.endpoints.insert(identity.to_string(), endpoint);
        Ok(())
    }

    fn remove(&mut self, identity: &str) {
        if let Some(endpoint) = self.endpoints.remove(identity) {
            if let Some(uri) = endpoint.bound_uri {
                self.bound.remove(&uri);
            }
        }
    }
}

/// Shared in-process hub.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a multi-peer socket at `uri`.
    pub fn router(
        &self,
        identity: impl Into<String>,
        uri: impl Into<String>,
        inbound: InboundSender,
    ) -> Result<MemoryRouter, MeshError> {
        let identity = identity.into();
        let uri = uri.into();
        self.hub.lock().register(
            &identity,
            Endpoint {
                inbound,
                bound_uri: Some(uri.clone()),
                connected: HashSet::new(),
                tags_sender: true,
            },
        )?;
        Ok(MemoryRouter {
            identity,
            uri,
            hub: Arc::clone(&self.hub),
        })
    }

    /// Create an unbound single-peer socket.
    pub fn dealer(
        &self,
        identity: impl Into<String>,
        inbound: InboundSender,
    ) -> Result<MemoryDealer, MeshError> {
        let identity = identity.into();
        self.hub.lock().register(
            &identity,
            Endpoint {
                inbound,
                bound_uri: None,
                connected: HashSet::new(),
                tags_sender: false,
            },
        )?;
        Ok(MemoryDealer {
            identity,
            hub: Arc::clone(&self.hub),
        })
    }

    /// Send counters for the socket with `identity`.
    pub fn stats(&self, identity: &str) -> SocketStats {
        self.hub.lock().stats.get(identity).copied().unwrap_or_default()
    }
}

/// Multi-peer socket on a [`MemoryNetwork`].
pub struct MemoryRouter {
    identity: String,
    uri: String,
    hub: Arc<Mutex<Hub>>,
}

impl Transport for MemoryRouter {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn connect(&self, uri: &str) -> Result<(), MeshError> {
        let mut hub = self.hub.lock();
        hub.endpoint_mut(&self.identity)?.connected.insert(uri.to_string());
        Ok(())
    }

    fn disconnect(&self, uri: &str) -> Result<(), MeshError> {
        let mut hub = self.hub.lock();
        hub.endpoint_mut(&self.identity)?.connected.remove(uri);
        Ok(())
    }

    fn send(&self, frames: Vec<Bytes>) -> Result<usize, MeshError> {
        let (destination, frames) = split_destination(frames)?;
        let mut hub = self.hub.lock();
        hub.record_attempt(&self.identity)?;
        if !hub.linked(&self.identity, &destination) {
            return Err(MeshError::Unreachable(destination));
        }
        hub.deliver(&self.identity, &destination, frames)
    }

    fn close(&self) {
        self.hub.lock().remove(&self.identity);
    }
}

impl PeerMultiplexedTransport for MemoryRouter {
    fn endpoint(&self) -> &str {
        &self.uri
    }
}

/// Single-peer socket on a [`MemoryNetwork`].
pub struct MemoryDealer {
    identity: String,
    hub: Arc<Mutex<Hub>>,
}

impl Transport for MemoryDealer {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn connect(&self, uri: &str) -> Result<(), MeshError> {
        let mut hub = self.hub.lock();
        let endpoint = hub.endpoint_mut(&self.identity)?;
        if let Some(existing) = endpoint.connected.iter().find(|u| u.as_str() != uri) {
            return Err(MeshError::Config(format!(
                "single-peer socket {} is already connected to {existing}",
                self.identity
            )));
        }
        endpoint.connected.insert(uri.to_string());
        Ok(())
    }

    fn disconnect(&self, uri: &str) -> Result<(), MeshError> {
        let mut hub = self.hub.lock();
        hub.endpoint_mut(&self.identity)?.connected.remove(uri);
        Ok(())
    }

    fn send(&self, frames: Vec<Bytes>) -> Result<usize, MeshError> {
        let mut hub = self.hub.lock();
        hub.record_attempt(&self.identity)?;
        let uri = {
            let endpoint = hub.endpoint_mut(&self.identity)?;
            match endpoint.connected.len() {
                0 => return Err(MeshError::Unreachable("no relay connected".into())),
                1 => endpoint.connected.iter().next().cloned().unwrap_or_default(),
                n => {
                    return Err(MeshError::Config(format!(
                        "single-peer socket has {n} connections"
                    )));
                }
            }
        };
        let Some(remote) = hub.bound.get(&uri).cloned() else {
            return Err(MeshError::Unreachable(uri));
        };
        hub.deliver(&self.identity, &remote, frames)
    }

    fn close(&self) {
        self.hub.lock().remove(&self.identity);
    }
}

impl PeerSingleTransport for MemoryDealer {
    fn peer_count(&self) -> usize {
        self.hub
            .lock()
            .endpoints
            .get(&self.identity)
            .map_or(0, |e| e.connected.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn frames(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[test]
    fn test_router_to_router_after_connect() {
        let net = MemoryNetwork::new();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = net.router("A", "mem://a", a_tx).unwrap();
        let _b = net.router("B", "mem://", b_tx).unwrap();

        assert!(matches!(a.send(frames(&["B", "x"])), Err(MeshError::Unreachable(_))));

        a.connect("mem://").unwrap();
        assert_eq!(a.send(frames(&["B", "x"])).unwrap(), 1);

        let inbound = b_rx.try_recv().unwrap();
        assert_eq!(inbound.sender.as_deref(), Some("A"));
        assert_eq!(inbound.frames, frames(&["x"]));
        assert_eq!(net.stats("A"), SocketStats { attempts: 2, sent: 1 });
    }

    #[test]
    fn test_accepted_peer_is_reachable_both_ways() {
        let net = MemoryNetwork::new();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = net.router("A", "mem://a", a_tx).unwrap();
        let b = net.router("B", "mem://b", b_tx).unwrap();
        b.connect("mem://a").unwrap();

        // A never connected out, but B connected to it.
        a.send(frames(&["B", "from-a"])).unwrap();
        assert_eq!(b_rx.try_recv().unwrap().sender.as_deref(), Some("A"));

        let (x_tx, mut x_rx) = mpsc::unbounded_channel();
        let x = net.dealer("X", x_tx).unwrap();
        x.connect("mem://b").unwrap();

        b.send(frames(&["X", "hi"])).unwrap();
        let inbound = x_rx.try_recv().unwrap();
        assert!(inbound.sender.is_none());
        assert_eq!(inbound.frames, frames(&["hi"]));

        // A has no link to X.
        assert!(matches!(a.send(frames(&["X", "hi"])), Err(MeshError::Unreachable(_))));
    }

    #[test]
    fn test_dealer_single_peer() {
        let net = MemoryNetwork::new();
        let (r_tx, mut r_rx) = mpsc::unbounded_channel();
        let _r = net.router("R", "mem://r", r_tx).unwrap();
        let x = net.dealer("X", mpsc::unbounded_channel().0).unwrap();

        assert!(matches!(x.send(frames(&["x"])), Err(MeshError::Unreachable(_))));

        x.connect("mem://r").unwrap();
        x.connect("mem://r").unwrap();
        assert_eq!(x.peer_count(), 1);
        assert!(matches!(x.connect("mem://other"), Err(MeshError::Config(_))));

        x.send(frames(&["R", "x"])).unwrap();
        let inbound = r_rx.try_recv().unwrap();
        assert_eq!(inbound.sender.as_deref(), Some("X"));
        assert_eq!(inbound.frames.len(), 2);
    }

    #[test]
    fn test_bind_conflicts() {
        let net = MemoryNetwork::new();
        let _r = net.router("R", "mem://r", mpsc::unbounded_channel().0).unwrap();
        assert!(matches!(
            net.router("S", "mem://r", mpsc::unbounded_channel().0),
            Err(MeshError::Bind { .. })
        ));
        assert!(matches!(
            net.dealer("R", mpsc::unbounded_channel().0),
            Err(MeshError::Config(_))
        ));
    }

    #[test]
    fn test_closed_socket() {
        let net = MemoryNetwork::new();
        let r = net.router("R", "mem://r", mpsc::unbounded_channel().0).unwrap();
        r.close();
        assert!(matches!(r.send(frames(&["S", "x"])), Err(MeshError::Closed)));
        // The uri can be bound again.
        assert!(net.router("R", "mem://r", mpsc::unbounded_channel().0).is_ok());
    }
}
