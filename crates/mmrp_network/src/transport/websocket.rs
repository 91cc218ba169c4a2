//! WebSocket transport — relay and client sockets over TCP.
//!
//! Every link starts with each side sending a JSON greeting that carries its
//! socket identity, so both ends can address the other by identity. After
//! that, each binary WebSocket message carries one frame sequence:
//!
//! ```text
//! u32 frame_count, (u32 frame_len, frame_bytes) * frame_count     (big-endian)
//! ```
//!
//! A link's write half is owned by a writer task fed through an unbounded
//! channel, which keeps [`Transport::send`] non-blocking. Outbound links are
//! redialled until the uri is disconnected or the socket is closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, warn};

use super::{
    Inbound, InboundSender, PeerMultiplexedTransport, PeerSingleTransport, Transport, frames_len,
    split_destination,
};
use crate::config::NodeConfig;
use crate::error::MeshError;
use crate::identity::cluster_id_for;

const GREETING_TIMEOUT: Duration = Duration::from_secs(10);

/// First message on every link, in both directions.
#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    identity: String,
}

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// Encode a frame sequence into one WebSocket payload.
pub fn encode_frames(frames: &[Bytes]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + frames.len() * 4 + frames_len(frames));
    buf.put_u32(frames.len() as u32);
    for frame in frames {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
    buf
}

/// Decode a WebSocket payload into its frame sequence.
pub fn decode_frames(mut data: &[u8]) -> Result<Vec<Bytes>, MeshError> {
    if data.remaining() < 4 {
        return Err(MeshError::Malformed("payload shorter than frame count".into()));
    }
    let count = data.get_u32() as usize;
    // Each frame needs at least its length prefix.
    if count > data.remaining() / 4 {
        return Err(MeshError::Malformed(format!("frame count {count} exceeds payload")));
    }

    let mut frames = Vec::with_capacity(count);
    for i in 0..count {
        if data.remaining() < 4 {
            return Err(MeshError::Malformed(format!("frame {i} has no length")));
        }
        let len = data.get_u32() as usize;
        if data.remaining() < len {
            return Err(MeshError::Malformed(format!("frame {i} truncated")));
        }
        frames.push(Bytes::copy_from_slice(&data[..len]));
        data.advance(len);
    }
    if data.has_remaining() {
        return Err(MeshError::Malformed("trailing bytes after last frame".into()));
    }
    Ok(frames)
}

/// Normalize a discovery uri into a WebSocket url.
pub fn ws_url(uri: &str) -> String {
    if uri.starts_with("ws://") || uri.starts_with("wss://") {
        uri.to_string()
    } else if let Some(rest) = uri.strip_prefix("tcp://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{uri}")
    }
}

fn bind_hint(addr: SocketAddr, err: &std::io::Error) -> String {
    let port = addr.port();
    match err.kind() {
        std::io::ErrorKind::AddrInUse => format!(
            "another process holds port {port}; find it with `lsof -i :{port}` or set bind_addr to port 0"
        ),
        std::io::ErrorKind::PermissionDenied => {
            format!("port {port} needs elevated privileges; choose a port above 1024")
        }
        std::io::ErrorKind::AddrNotAvailable => {
            format!("{} is not an address of this host; check bind_addr", addr.ip())
        }
        _ => "check bind_addr in the node config".to_string(),
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a stop.
    let _ = rx.wait_for(|stop| *stop).await;
}

fn greeting_message(identity: &str) -> Result<Message, MeshError> {
    let json = serde_json::to_string(&Greeting {
        identity: identity.to_string(),
    })?;
    Ok(Message::Text(json.into()))
}

async fn read_greeting<S>(ws: &mut WebSocketStream<S>) -> Result<String, MeshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(GREETING_TIMEOUT, next_greeting(ws))
        .await
        .map_err(|_| MeshError::Transport(format!("no greeting within {GREETING_TIMEOUT:?}")))?
}

async fn next_greeting<S>(ws: &mut WebSocketStream<S>) -> Result<String, MeshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let greeting: Greeting = serde_json::from_str(&text)?;
                if greeting.identity.is_empty() {
                    return Err(MeshError::Malformed("greeting without identity".into()));
                }
                return Ok(greeting.identity);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => {
                return Err(MeshError::Malformed(format!("expected greeting, got {other:?}")));
            }
            Some(Err(e)) => return Err(MeshError::Transport(format!("Greeting read: {e}"))),
            None => return Err(MeshError::Transport("closed before greeting".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared socket core
// ---------------------------------------------------------------------------

struct Link {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

/// Live links by peer identity, oldest first.
///
/// Two relays that dial each other end up with two links between them.
/// Both stay up; sends use the oldest one that still has a writer, so
/// frames to a peer keep their order.
#[derive(Default)]
struct LinkTable {
    next_id: u64,
    by_peer: HashMap<String, Vec<Link>>,
}

/// State shared by a socket handle and its background tasks.
struct SocketCore {
    identity: String,
    inbound: InboundSender,
    tags_sender: bool,
    reconnect_interval: Duration,
    links: Mutex<LinkTable>,
    dials: Mutex<HashMap<String, watch::Sender<bool>>>,
    shutdown: watch::Sender<bool>,
}

impl SocketCore {
    fn new(
        identity: String,
        inbound: InboundSender,
        tags_sender: bool,
        reconnect_interval: Duration,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            identity,
            inbound,
            tags_sender,
            reconnect_interval,
            links: Mutex::new(LinkTable::default()),
            dials: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn register_link(&self, peer: &str, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let mut table = self.links.lock();
        let id = table.next_id;
        table.next_id += 1;
        let links = table.by_peer.entry(peer.to_string()).or_default();
        if !links.is_empty() {
            debug!("{}: {} links to {peer}", self.identity, links.len() + 1);
        }
        links.push(Link { id, tx });
        id
    }

    fn unregister_link(&self, peer: &str, id: u64) {
        let mut table = self.links.lock();
        if let Some(links) = table.by_peer.get_mut(peer) {
            links.retain(|link| link.id != id);
            if links.is_empty() {
                table.by_peer.remove(peer);
            }
        }
    }

    fn link_count(&self, peer: &str) -> usize {
        self.links.lock().by_peer.get(peer).map_or(0, Vec::len)
    }

    fn send_to(&self, peer: &str, frames: &[Bytes]) -> Result<usize, MeshError> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        let table = self.links.lock();
        let links = table
            .by_peer
            .get(peer)
            .ok_or_else(|| MeshError::Unreachable(peer.to_string()))?;
        let mut msg = Message::Binary(encode_frames(frames).into());
        for link in links {
            // A link whose writer has ended is on its way out of the table.
            match link.tx.send(msg) {
                Ok(()) => return Ok(frames_len(frames)),
                Err(mpsc::error::SendError(returned)) => msg = returned,
            }
        }
        Err(MeshError::Unreachable(peer.to_string()))
    }

    fn only_peer(&self) -> Result<String, MeshError> {
        let table = self.links.lock();
        let mut peers = table.by_peer.keys();
        match (peers.next(), peers.next()) {
            (Some(peer), None) => Ok(peer.clone()),
            (None, _) => Err(MeshError::Unreachable("no relay linked".into())),
            (Some(_), Some(_)) => Err(MeshError::Config(format!(
                "single-peer socket {} has {} links",
                self.identity,
                table.by_peer.len()
            ))),
        }
    }

    fn accept_frames(&self, peer: &str, data: &[u8]) {
        match decode_frames(data) {
            Ok(frames) => {
                let sender = self.tags_sender.then(|| peer.to_string());
                if self.inbound.send(Inbound { sender, frames }).is_err() {
                    debug!("{}: inbound channel closed, dropping frames from {peer}", self.identity);
                }
            }
            Err(e) => warn!("{}: undecodable message from {peer}: {e}", self.identity),
        }
    }

    /// Pump one established link until it drops or `stop` fires.
    async fn serve_link<S>(
        self: Arc<Self>,
        peer: String,
        ws: WebSocketStream<S>,
        mut stop: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let link_id = self.register_link(&peer, tx);

        let writer_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!("Write to {writer_peer} failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => self.accept_frames(&peer, &data),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("{}: {peer} closed the link", self.identity);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("{}: link to {peer} failed: {e}", self.identity);
                        break;
                    }
                },
                _ = stopped(&mut stop) => break,
            }
        }

        self.unregister_link(&peer, link_id);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let core = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = core.accept_link(stream).await {
                                warn!("Inbound link from {addr} failed: {e}");
                            }
                        });
                    }
                    Err(e) => error!("TCP accept failed: {e}"),
                },
                _ = stopped(&mut shutdown) => {
                    info!("{}: listener shutting down", self.identity);
                    break;
                }
            }
        }
    }

    async fn accept_link(self: Arc<Self>, stream: TcpStream) -> Result<(), MeshError> {
        let mut ws = accept_async(stream)
            .await
            .map_err(|e| MeshError::Transport(format!("WebSocket accept: {e}")))?;
        let peer = read_greeting(&mut ws).await?;
        ws.send(greeting_message(&self.identity)?)
            .await
            .map_err(|e| MeshError::Transport(format!("Greeting write: {e}")))?;

        debug!("{}: accepted link from {peer}", self.identity);
        let stop = self.shutdown.subscribe();
        self.serve_link(peer, ws, stop).await;
        Ok(())
    }

    fn dial(self: &Arc<Self>, uri: &str) -> Result<(), MeshError> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        let mut dials = self.dials.lock();
        if dials.contains_key(uri) {
            return Ok(());
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        dials.insert(uri.to_string(), stop_tx);

        let core = Arc::clone(self);
        let uri = uri.to_string();
        tokio::spawn(async move { core.dial_loop(uri, stop_rx).await });
        Ok(())
    }

    fn hang_up(&self, uri: &str) {
        if let Some(stop) = self.dials.lock().remove(uri) {
            stop.send_replace(true);
        }
    }

    async fn dial_loop(self: Arc<Self>, uri: String, mut stop: watch::Receiver<bool>) {
        let url = ws_url(&uri);
        loop {
            let opened = tokio::select! {
                opened = self.open_outbound(&url) => opened,
                _ = stopped(&mut stop) => break,
            };
            match opened {
                Ok((peer, ws)) => {
                    info!("{}: linked to {peer} at {uri}", self.identity);
                    Arc::clone(&self).serve_link(peer, ws, stop.clone()).await;
                }
                Err(e) => debug!("{}: dial {uri} failed: {e}", self.identity),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_interval) => {}
                _ = stopped(&mut stop) => break,
            }
        }
        debug!("{}: stopped dialling {uri}", self.identity);
    }

    async fn open_outbound(
        &self,
        url: &str,
    ) -> Result<
        (
            String,
            WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
        ),
        MeshError,
    > {
        let (mut ws, _) = connect_async(url)
            .await
            .map_err(|e| MeshError::Transport(format!("Connect to {url} failed: {e}")))?;
        ws.send(greeting_message(&self.identity)?)
            .await
            .map_err(|e| MeshError::Transport(format!("Greeting write: {e}")))?;
        let peer = read_greeting(&mut ws).await?;
        Ok((peer, ws))
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
        for (_, stop) in self.dials.lock().drain() {
            stop.send_replace(true);
        }
        self.links.lock().by_peer.clear();
    }
}

// ---------------------------------------------------------------------------
// Relay socket
// ---------------------------------------------------------------------------

/// Bound multi-peer socket. Its identity is the relay's cluster id.
pub struct WsRouter {
    core: Arc<SocketCore>,
    endpoint: String,
    local_addr: SocketAddr,
}

impl WsRouter {
    /// Bind the relay socket described by `config`.
    ///
    /// The cluster id is `config.cluster_id` when set, otherwise derived from
    /// the advertised host and the port actually bound.
    pub async fn bind(config: &NodeConfig, inbound: InboundSender) -> Result<Self, MeshError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| MeshError::Bind {
                addr: config.bind_addr.to_string(),
                hint: bind_hint(config.bind_addr, &source),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let identity = config
            .cluster_id
            .clone()
            .unwrap_or_else(|| cluster_id_for(&config.advertise_host, local_addr.port()));
        let endpoint = format!("ws://{}:{}", config.advertise_host, local_addr.port());

        let core = SocketCore::new(identity, inbound, true, config.reconnect_interval);
        tokio::spawn(Arc::clone(&core).accept_loop(listener));
        info!("Relay socket {} listening on {local_addr}", core.identity);

        Ok(Self {
            core,
            endpoint,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live links to `peer`. Two relays that dial each other
    /// hold two.
    pub fn link_count(&self, peer: &str) -> usize {
        self.core.link_count(peer)
    }
}

impl Transport for WsRouter {
    fn identity(&self) -> &str {
        &self.core.identity
    }

    fn connect(&self, uri: &str) -> Result<(), MeshError> {
        self.core.dial(uri)
    }

    fn disconnect(&self, uri: &str) -> Result<(), MeshError> {
        self.core.hang_up(uri);
        Ok(())
    }

    fn send(&self, frames: Vec<Bytes>) -> Result<usize, MeshError> {
        let (destination, frames) = split_destination(frames)?;
        self.core.send_to(&destination, &frames)
    }

    fn close(&self) {
        self.core.close();
    }
}

impl PeerMultiplexedTransport for WsRouter {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

// ---------------------------------------------------------------------------
// Client socket
// ---------------------------------------------------------------------------

/// Connecting single-peer socket.
pub struct WsDealer {
    core: Arc<SocketCore>,
}

impl WsDealer {
    pub fn new(identity: impl Into<String>, inbound: InboundSender, reconnect_interval: Duration) -> Self {
        Self {
            core: SocketCore::new(identity.into(), inbound, false, reconnect_interval),
        }
    }
}

impl Transport for WsDealer {
    fn identity(&self) -> &str {
        &self.core.identity
    }

    fn connect(&self, uri: &str) -> Result<(), MeshError> {
        {
            let dials = self.core.dials.lock();
            if let Some(existing) = dials.keys().find(|u| u.as_str() != uri) {
                return Err(MeshError::Config(format!(
                    "single-peer socket {} is already connected to {existing}",
                    self.core.identity
                )));
            }
        }
        self.core.dial(uri)
    }

    fn disconnect(&self, uri: &str) -> Result<(), MeshError> {
        self.core.hang_up(uri);
        Ok(())
    }

    fn send(&self, frames: Vec<Bytes>) -> Result<usize, MeshError> {
        if self.core.is_closed() {
            return Err(MeshError::Closed);
        }
        let peer = self.core.only_peer()?;
        self.core.send_to(&peer, &frames)
    }

    fn close(&self) {
        self.core.close();
    }
}

impl PeerSingleTransport for WsDealer {
    fn peer_count(&self) -> usize {
        self.core.dials.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config(cluster_id: &str) -> NodeConfig {
        let mut config = NodeConfig::relay(cluster_id);
        config.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.reconnect_interval = Duration::from_millis(50);
        config
    }

    fn frames(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    /// Retry a send until the link is up.
    async fn send_when_linked(socket: &dyn Transport, parts: &[&str]) -> usize {
        for _ in 0..100 {
            if let Ok(n) = socket.send(frames(parts)) {
                return n;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("link never came up");
    }

    #[test]
    fn test_frame_codec() {
        let original = frames(&["route", "", "payload", "", "\u{1}t"]);
        let encoded = encode_frames(&original);
        assert_eq!(&encoded[..4], &[0, 0, 0, 5]);
        assert_eq!(decode_frames(&encoded).unwrap(), original);
    }

    #[test]
    fn test_frame_codec_rejects_garbage() {
        assert!(decode_frames(&[0, 0]).is_err());
        assert!(decode_frames(&[0, 0, 0, 9]).is_err());
        assert!(decode_frames(&[0, 0, 0, 1, 0, 0, 0, 5, b'a']).is_err());

        let mut trailing = encode_frames(&frames(&["a"]));
        trailing.push(0);
        assert!(decode_frames(&trailing).is_err());
    }

    #[test]
    fn test_ws_url() {
        assert_eq!(ws_url("ws://h:1"), "ws://h:1");
        assert_eq!(ws_url("tcp://h:1"), "ws://h:1");
        assert_eq!(ws_url("h:1"), "ws://h:1");
    }

    #[test]
    fn test_bind_hint_for_port_in_use() {
        let addr: SocketAddr = "0.0.0.0:9480".parse().unwrap();
        let hint = bind_hint(addr, &std::io::ErrorKind::AddrInUse.into());
        assert!(hint.contains("lsof -i :9480"));
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_hint() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = WsRouter::bind(&loopback_config("A"), tx.clone()).await.unwrap();

        let mut config = loopback_config("B");
        config.bind_addr = first.local_addr();
        match WsRouter::bind(&config, tx).await {
            Err(MeshError::Bind { hint, .. }) => assert!(hint.contains("lsof")),
            Err(other) => panic!("expected bind error, got {other}"),
            Ok(_) => panic!("second bind on the same port succeeded"),
        }
        first.close();
    }

    #[tokio::test]
    async fn test_derived_cluster_id() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = loopback_config("unused");
        config.cluster_id = None;
        let router = WsRouter::bind(&config, tx).await.unwrap();
        let port = router.local_addr().port();
        assert_eq!(router.identity(), format!("127.0.0.1:{port}"));
        assert_eq!(router.endpoint(), format!("ws://127.0.0.1:{port}"));
        router.close();
    }

    #[tokio::test]
    async fn test_routers_exchange_frames() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = WsRouter::bind(&loopback_config("A"), a_tx).await.unwrap();
        let b = WsRouter::bind(&loopback_config("B"), b_tx).await.unwrap();

        assert!(matches!(b.send(frames(&["A", "x"])), Err(MeshError::Unreachable(_))));
        b.connect(a.endpoint()).unwrap();

        send_when_linked(&b, &["A", "hello"]).await;
        let inbound = tokio::time::timeout(Duration::from_secs(2), a_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.sender.as_deref(), Some("B"));
        assert_eq!(inbound.frames, frames(&["hello"]));

        // The accepting side can address the dialer too.
        a.send(frames(&["B", "back"])).unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.sender.as_deref(), Some("A"));

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn test_mutual_dials_keep_both_links() {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = WsRouter::bind(&loopback_config("A"), a_tx).await.unwrap();
        let b = WsRouter::bind(&loopback_config("B"), b_tx).await.unwrap();

        a.connect(b.endpoint()).unwrap();
        b.connect(a.endpoint()).unwrap();
        for _ in 0..100 {
            if a.link_count("B") == 2 && b.link_count("A") == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(a.link_count("B"), 2);
        assert_eq!(b.link_count("A"), 2);

        // Several reconnect intervals later neither side has evicted a link.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(a.link_count("B"), 2);
        assert_eq!(b.link_count("A"), 2);

        for i in 0..50 {
            a.send(frames(&["B", i.to_string().as_str()])).unwrap();
        }
        for i in 0..50 {
            let inbound = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(inbound.frames, frames(&[i.to_string().as_str()]));
        }

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn test_dealer_talks_to_one_relay() {
        let (r_tx, mut r_rx) = mpsc::unbounded_channel();
        let (x_tx, mut x_rx) = mpsc::unbounded_channel();
        let relay = WsRouter::bind(&loopback_config("R"), r_tx).await.unwrap();
        let dealer = WsDealer::new("R/1-0", x_tx, Duration::from_millis(50));

        dealer.connect(relay.endpoint()).unwrap();
        assert!(matches!(dealer.connect("ws://127.0.0.1:1"), Err(MeshError::Config(_))));
        assert_eq!(dealer.peer_count(), 1);

        send_when_linked(&dealer, &["R", "up"]).await;
        let inbound = tokio::time::timeout(Duration::from_secs(2), r_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.sender.as_deref(), Some("R/1-0"));
        assert_eq!(inbound.frames, frames(&["R", "up"]));

        relay.send(frames(&["R/1-0", "down"])).unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(2), x_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(inbound.sender.is_none());
        assert_eq!(inbound.frames, frames(&["down"]));

        dealer.close();
        assert!(matches!(dealer.send(frames(&["x"])), Err(MeshError::Closed)));
        relay.close();
    }
}
