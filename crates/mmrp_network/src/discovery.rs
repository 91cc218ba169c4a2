//! LAN relay discovery via UDP broadcast.
//!
//! Relays periodically broadcast an [`Announcement`] on the local network.
//! Listeners track who they have heard from and report relays appearing,
//! moving and going silent as [`DiscoveryEvent`]s, which [`drive`] feeds into
//! a [`MeshNode`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::MeshError;
use crate::node::{MeshNode, PeerMeta};

/// An announcement broadcast by a relay on the LAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub cluster_id: String,
    /// Where the relay accepts links.
    pub uri: String,
    /// When the relay started; a restarted relay announces a newer value.
    pub timestamp: u64,
}

impl Announcement {
    fn meta(&self) -> PeerMeta {
        PeerMeta::new(self.cluster_id.clone(), self.timestamp)
    }
}

/// A change in the set of relays heard on the LAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    RelayUp { uri: String, meta: PeerMeta },
    RelayDown { uri: String, meta: PeerMeta },
}

/// Configuration for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port to broadcast on and listen on.
    pub port: u16,
    /// How often to broadcast and to check for silent relays.
    pub interval: Duration,
    /// Silence after which a relay is reported down.
    pub expiry: Duration,
    /// What to announce. Pure clients only listen.
    pub announcement: Option<Announcement>,
}

struct Heard {
    announcement: Announcement,
    last_seen: Instant,
}

/// Turns a stream of announcements into up/down events.
pub struct RelayTracker {
    expiry: Duration,
    heard: HashMap<String, Heard>,
    /// Cluster id and start time of the local relay.
    own: Option<(String, u64)>,
}

impl RelayTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            heard: HashMap::new(),
            own: None,
        }
    }

    /// Skip the local relay's own announcements, which come back through
    /// the broadcast address.
    pub fn ignoring(mut self, own: &Announcement) -> Self {
        self.own = Some((own.cluster_id.clone(), own.timestamp));
        self
    }

    /// Record an announcement. Reports new relays, and relays that moved
    /// or restarted (down at the old address, up at the new one).
    pub fn observe(&mut self, announcement: Announcement, now: Instant) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();

        if let Some((cluster_id, timestamp)) = &self.own {
            if *cluster_id == announcement.cluster_id {
                if *timestamp != announcement.timestamp {
                    warn!(
                        "Relay at {} announces this relay's cluster id {cluster_id}; ignoring it",
                        announcement.uri
                    );
                }
                return events;
            }
        }

        match self.heard.get_mut(&announcement.cluster_id) {
            Some(heard) if heard.announcement == announcement => {
                heard.last_seen = now;
                return events;
            }
            Some(heard) => {
                if heard.announcement.uri != announcement.uri {
                    events.push(DiscoveryEvent::RelayDown {
                        uri: heard.announcement.uri.clone(),
                        meta: heard.announcement.meta(),
                    });
                }
            }
            None => {}
        }

        events.push(DiscoveryEvent::RelayUp {
            uri: announcement.uri.clone(),
            meta: announcement.meta(),
        });
        self.heard.insert(
            announcement.cluster_id.clone(),
            Heard {
                announcement,
                last_seen: now,
            },
        );
        events
    }

    /// Report and forget relays not heard from within the expiry.
    pub fn expire(&mut self, now: Instant) -> Vec<DiscoveryEvent> {
        let expiry = self.expiry;
        let mut events = Vec::new();
        self.heard.retain(|_, heard| {
            let alive = now.duration_since(heard.last_seen) < expiry;
            if !alive {
                events.push(DiscoveryEvent::RelayDown {
                    uri: heard.announcement.uri.clone(),
                    meta: heard.announcement.meta(),
                });
            }
            alive
        });
        events
    }
}

/// LAN discovery service using UDP broadcast.
pub struct DiscoveryService;

impl DiscoveryService {
    /// Start the discovery service in the background.
    ///
    /// Spawns a broadcaster (when there is something to announce) and a
    /// listener that reports changes through `events_tx`. Both exit when the
    /// shutdown signal is received.
    pub async fn start(
        config: DiscoveryConfig,
        events_tx: mpsc::Sender<DiscoveryEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), MeshError> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener_socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| MeshError::Bind {
                addr: bind_addr.to_string(),
                hint: format!(
                    "another discovery listener holds UDP port {}; check with `lsof -i UDP:{}` or disable discovery",
                    config.port, config.port
                ),
                source,
            })?;
        listener_socket.set_broadcast(true)?;
        info!("Discovery service listening on {bind_addr}");

        let interval = config.interval;
        let mut tracker = RelayTracker::new(config.expiry);
        if let Some(own) = &config.announcement {
            tracker = tracker.ignoring(own);
        }

        if let Some(announcement) = config.announcement {
            let payload = serde_json::to_vec(&announcement)?;
            let broadcast_addr = SocketAddr::from(([255, 255, 255, 255], config.port));
            let sender_socket = UdpSocket::bind("0.0.0.0:0").await?;
            sender_socket.set_broadcast(true)?;

            let mut shutdown_bcast = shutdown.resubscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match sender_socket.send_to(&payload, broadcast_addr).await {
                                Ok(_) => trace!("Announced {}", announcement.cluster_id),
                                Err(e) => debug!("Announcement send failed: {e}"),
                            }
                        }
                        _ = shutdown_bcast.recv() => {
                            debug!("Discovery broadcaster shutting down");
                            break;
                        }
                    }
                }
            });
        }

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut sweep = tokio::time::interval(interval);
            loop {
                let events = tokio::select! {
                    result = listener_socket.recv_from(&mut buf) => match result {
                        Ok((len, src_addr)) => {
                            match serde_json::from_slice::<Announcement>(&buf[..len]) {
                                Ok(announcement) => {
                                    trace!("Heard {} from {src_addr}", announcement.cluster_id);
                                    tracker.observe(announcement, Instant::now())
                                }
                                Err(e) => {
                                    debug!("Ignoring datagram from {src_addr}: {e}");
                                    continue;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("Discovery recv error: {e}");
                            continue;
                        }
                    },
                    _ = sweep.tick() => tracker.expire(Instant::now()),
                    _ = shutdown.recv() => {
                        debug!("Discovery listener shutting down");
                        break;
                    }
                };

                for event in events {
                    if events_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(())
    }
}

/// Address of the interface this host uses to reach the LAN.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub async fn lan_address() -> Result<IpAddr, MeshError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("192.0.2.1:9").await?;
    let ip = socket.local_addr()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        return Err(MeshError::Config(format!("no LAN address found (got {ip})")));
    }
    Ok(ip)
}

/// Feed discovery events into `node` until the channel closes or the node
/// is closed.
///
/// Connects run in their own tasks since the handshake may wait for the
/// remote to come up.
pub async fn drive(node: MeshNode, mut events: mpsc::Receiver<DiscoveryEvent>) {
    while let Some(event) = events.recv().await {
        if node.is_closed() {
            break;
        }
        match event {
            DiscoveryEvent::RelayUp { uri, meta } => {
                info!("Relay {} up at {uri}", meta.cluster_id);
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) = node.relay_up(&uri, meta).await {
                        warn!("Linking to relay at {uri} failed: {e}");
                    }
                });
            }
            DiscoveryEvent::RelayDown { uri, meta } => {
                info!("Relay {} down at {uri}", meta.cluster_id);
                if let Err(e) = node.relay_down(&uri, &meta) {
                    warn!("Unlinking relay at {uri} failed: {e}");
                }
            }
        }
    }
    debug!("Discovery driver for {} stopped", node.identity());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::transport::memory::MemoryNetwork;

    fn announcement(cluster_id: &str, uri: &str, timestamp: u64) -> Announcement {
        Announcement {
            cluster_id: cluster_id.to_string(),
            uri: uri.to_string(),
            timestamp,
        }
    }

    #[test]
    fn test_announcement_wire_format() {
        let json = serde_json::to_string(&announcement("east", "ws://10.0.0.5:9480", 7)).unwrap();
        assert_eq!(json, r#"{"cluster_id":"east","uri":"ws://10.0.0.5:9480","timestamp":7}"#);
    }

    #[test]
    fn test_tracker_reports_new_relay_once() {
        let mut tracker = RelayTracker::new(Duration::from_secs(15));
        let now = Instant::now();

        let events = tracker.observe(announcement("east", "ws://a", 1), now);
        assert_eq!(
            events,
            vec![DiscoveryEvent::RelayUp {
                uri: "ws://a".into(),
                meta: PeerMeta::new("east", 1),
            }]
        );
        assert!(tracker.observe(announcement("east", "ws://a", 1), now).is_empty());
        assert_eq!(tracker.heard.len(), 1);
    }

    #[test]
    fn test_tracker_reports_moved_relay() {
        let mut tracker = RelayTracker::new(Duration::from_secs(15));
        let now = Instant::now();
        tracker.observe(announcement("east", "ws://a", 1), now);

        let events = tracker.observe(announcement("east", "ws://b", 2), now);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DiscoveryEvent::RelayDown { uri, .. } if uri == "ws://a"));
        assert!(matches!(&events[1], DiscoveryEvent::RelayUp { uri, .. } if uri == "ws://b"));

        // A restart at the same address is reported up again with its new time.
        let events = tracker.observe(announcement("east", "ws://b", 3), now);
        assert_eq!(
            events,
            vec![DiscoveryEvent::RelayUp {
                uri: "ws://b".into(),
                meta: PeerMeta::new("east", 3),
            }]
        );
    }

    #[test]
    fn test_tracker_expires_silent_relays() {
        let mut tracker = RelayTracker::new(Duration::from_secs(15));
        let start = Instant::now();
        tracker.observe(announcement("east", "ws://a", 1), start);
        tracker.observe(announcement("west", "ws://b", 1), start + Duration::from_secs(10));

        let events = tracker.expire(start + Duration::from_secs(16));
        assert_eq!(
            events,
            vec![DiscoveryEvent::RelayDown {
                uri: "ws://a".into(),
                meta: PeerMeta::new("east", 1),
            }]
        );
        assert_eq!(tracker.heard.len(), 1);
    }

    #[test]
    fn test_tracker_skips_own_announcement_only() {
        let own = announcement("127.0.0.1:9480", "ws://127.0.0.1:9480", 100);
        let mut tracker = RelayTracker::new(Duration::from_secs(15)).ignoring(&own);
        let now = Instant::now();

        assert!(tracker.observe(own.clone(), now).is_empty());
        // Another relay with the same uri but its own cluster id is reported.
        let peer = announcement("10.0.0.6:9480", "ws://127.0.0.1:9480", 100);
        assert_eq!(tracker.observe(peer, now).len(), 1);
        // A different relay claiming this relay's cluster id is not linked to.
        assert!(tracker.observe(announcement("127.0.0.1:9480", "ws://x", 7), now).is_empty());
        assert_eq!(tracker.heard.len(), 1);
    }

    #[tokio::test]
    async fn test_drive_links_and_unlinks() {
        let net = MemoryNetwork::new();
        let mut config = NodeConfig::relay("A");
        config.handshake_attempts = 1;
        let a = MeshNode::in_memory(&net, &config).unwrap();
        let _b = MeshNode::in_memory(&net, &NodeConfig::relay("B")).unwrap();

        let (tx, rx) = mpsc::channel(8);
        let driver = tokio::spawn(drive(a.clone(), rx));

        tx.send(DiscoveryEvent::RelayUp {
            uri: "mem://B".into(),
            meta: PeerMeta::new("B", 1),
        })
        .await
        .unwrap();
        for _ in 0..50 {
            if a.relay("B").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(a.relay("B").unwrap().uri.as_deref(), Some("mem://B"));

        tx.send(DiscoveryEvent::RelayDown {
            uri: "mem://B".into(),
            meta: PeerMeta::new("B", 1),
        })
        .await
        .unwrap();
        drop(tx);
        driver.await.unwrap();
        assert!(a.relay("B").is_none());
    }

    #[tokio::test]
    async fn test_lan_address_is_never_loopback() {
        // Hosts without a route report an error instead of a loopback address.
        if let Ok(ip) = lan_address().await {
            assert!(!ip.is_loopback());
        }
    }

    #[tokio::test]
    async fn test_discovery_udp_loopback() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let sent = announcement("east", "ws://127.0.0.1:9480", 42);
        socket.send_to(&serde_json::to_vec(&sent).unwrap(), addr).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        let received: Announcement = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(received, sent);
    }
}
