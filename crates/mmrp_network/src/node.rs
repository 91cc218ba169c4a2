//! MeshNode — the routing node at the center of the mesh.
//!
//! [`MeshNode`] is the primary public API for mmrp_network. It owns:
//! - a multi-peer socket when acting as a relay
//! - a single-peer socket when acting as a pure client
//! - the peer tables (known relays and attached clients)
//! - the delivery dispatcher for locally addressed envelopes
//!
//! Frames arriving on either socket are parsed into envelopes by one spawned
//! event loop per node and routed through the same [`send`](MeshNode::send)
//! logic applications use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::broadcast::{RoutingStyle, broadcast_targets};
use crate::config::NodeConfig;
use crate::connection::{ClientConnection, PeerTables, RelayConnection};
use crate::dispatch::{DELIVERY, DeliveryDispatcher, DeliveryHandler, SubscriptionId};
use crate::envelope::{Envelope, TRACK_ROUTE};
use crate::error::MeshError;
use crate::handshake::{HANDSHAKE_TYPE, HandshakePayload, send_error_envelope};
use crate::identity::{cluster_id_for, generate_client_identity};
use crate::transport::memory::MemoryNetwork;
use crate::transport::websocket::{WsDealer, WsRouter};
use crate::transport::{
    Inbound, InboundReceiver, PeerMultiplexedTransport, PeerSingleTransport, Sockets,
};

/// What discovery knows about a relay it reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMeta {
    pub cluster_id: String,
    /// Freshness of the report; higher wins when two relays claim one uri.
    pub timestamp: u64,
}

impl PeerMeta {
    pub fn new(cluster_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            timestamp,
        }
    }

    /// Meta stamped with the current wall-clock time in milliseconds.
    pub fn now(cluster_id: impl Into<String>) -> Self {
        let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self::new(cluster_id, millis)
    }
}

struct NodeInner {
    identity: String,
    cluster_id: String,
    is_relay: bool,
    is_client: bool,
    retry_delay: Duration,
    handshake_attempts: u32,
    router: Option<Arc<dyn PeerMultiplexedTransport>>,
    dealer: Option<Arc<dyn PeerSingleTransport>>,
    /// Guards every read and multi-step update of the relay/client tables.
    tables: Mutex<PeerTables>,
    dispatcher: RwLock<DeliveryDispatcher>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

/// A node in the mesh. Cheap to clone; all clones share one node.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<NodeInner>,
}

impl MeshNode {
    /// Create a node over already constructed sockets.
    ///
    /// `inbound` must be the receiving half of the channel the sockets push
    /// into. Spawns the inbound event loop, so this must run inside a tokio
    /// runtime.
    pub fn new(
        config: &NodeConfig,
        sockets: Sockets,
        inbound: InboundReceiver,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let is_relay = config.role.is_relay();
        let is_client = config.role.is_client();

        let (identity, cluster_id) = if is_relay {
            let router = sockets.router.as_ref().ok_or_else(|| {
                MeshError::Config("a relay node needs a multi-peer socket".into())
            })?;
            let identity = router.identity().to_string();
            if let Some(configured) = config.cluster_id.as_deref() {
                if configured != identity {
                    return Err(MeshError::Config(format!(
                        "relay socket identity {identity} does not match cluster_id {configured}"
                    )));
                }
            }
            (identity.clone(), identity)
        } else {
            if sockets.router.is_some() {
                return Err(MeshError::Config(
                    "a pure client cannot own a multi-peer socket".into(),
                ));
            }
            let dealer = sockets.dealer.as_ref().ok_or_else(|| {
                MeshError::Config("a client node needs a single-peer socket".into())
            })?;
            let cluster_id = config.cluster_id.clone().unwrap_or_default();
            (dealer.identity().to_string(), cluster_id)
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let inner = Arc::new(NodeInner {
            identity,
            cluster_id,
            is_relay,
            is_client,
            retry_delay: config.retry_delay,
            handshake_attempts: config.handshake_attempts,
            router: sockets.router,
            dealer: sockets.dealer,
            tables: Mutex::new(PeerTables::new()),
            dispatcher: RwLock::new(DeliveryDispatcher::new()),
            closed: AtomicBool::new(false),
            shutdown_tx,
        });

        // Built-in handshake handler. Holds a weak reference so the
        // subscription does not keep the node alive.
        let weak = Arc::downgrade(&inner);
        inner.dispatcher.write().subscribe(
            format!("{DELIVERY}.{HANDSHAKE_TYPE}"),
            Arc::new(move |envelope: &Envelope| {
                if let Some(inner) = weak.upgrade() {
                    MeshNode { inner }.on_handshake(envelope);
                }
            }),
        );

        tokio::spawn(run_inbound(Arc::downgrade(&inner), inbound, shutdown_rx));

        info!(
            "Mesh node {} up (cluster {}, relay={is_relay}, client={is_client})",
            inner.identity, inner.cluster_id
        );
        Ok(Self { inner })
    }

    /// Create a node with WebSocket sockets for the configured role.
    pub async fn bind(config: &NodeConfig) -> Result<Self, MeshError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sockets = Sockets::default();

        if config.role.is_relay() {
            sockets.router = Some(Arc::new(WsRouter::bind(config, tx).await?));
        } else {
            let cluster_id = config.cluster_id.as_deref().unwrap_or_default();
            sockets.dealer = Some(Arc::new(WsDealer::new(
                generate_client_identity(cluster_id),
                tx,
                config.reconnect_interval,
            )));
        }

        Self::new(config, sockets, rx)
    }

    /// Create a node with sockets on an in-process [`MemoryNetwork`].
    ///
    /// Relays bind at `mem://{cluster_id}`.
    pub fn in_memory(network: &MemoryNetwork, config: &NodeConfig) -> Result<Self, MeshError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sockets = Sockets::default();

        if config.role.is_relay() {
            let cluster_id = config
                .cluster_id
                .clone()
                .unwrap_or_else(|| cluster_id_for(&config.advertise_host, config.bind_addr.port()));
            let uri = format!("mem://{cluster_id}");
            sockets.router = Some(Arc::new(network.router(cluster_id, uri, tx)?));
        } else {
            let cluster_id = config.cluster_id.as_deref().unwrap_or_default();
            sockets.dealer = Some(Arc::new(
                network.dealer(generate_client_identity(cluster_id), tx)?,
            ));
        }

        Self::new(config, sockets, rx)
    }

    // -- Introspection -------------------------------------------------------

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn cluster_id(&self) -> &str {
        &self.inner.cluster_id
    }

    pub fn is_relay(&self) -> bool {
        self.inner.is_relay
    }

    pub fn is_client(&self) -> bool {
        self.inner.is_client
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Uri other nodes connect to, for relays.
    pub fn endpoint(&self) -> Option<String> {
        self.inner.router.as_ref().map(|r| r.endpoint().to_string())
    }

    /// Snapshot of known relays keyed by cluster id.
    pub fn relays(&self) -> HashMap<String, RelayConnection> {
        self.inner.tables.lock().relays.clone()
    }

    pub fn relay(&self, cluster_id: &str) -> Option<RelayConnection> {
        self.inner.tables.lock().relays.get(cluster_id).cloned()
    }

    /// Snapshot of attached clients keyed by identity.
    pub fn clients(&self) -> HashMap<String, ClientConnection> {
        self.inner.tables.lock().clients.clone()
    }

    // -- Subscriptions -------------------------------------------------------

    /// Run `handler` for every envelope delivered under `key`
    /// (e.g. `delivery.chat` or just `delivery`).
    pub fn subscribe<F>(&self, key: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let handler: DeliveryHandler = Arc::new(handler);
        self.inner.dispatcher.write().subscribe(key, handler)
    }

    /// Receive envelopes delivered under `key` on a channel.
    pub fn subscribe_channel(
        &self,
        key: impl Into<String>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(key, move |envelope: &Envelope| {
            let _ = tx.send(envelope.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.dispatcher.write().unsubscribe(id)
    }

    // -- Peer lifecycle ------------------------------------------------------

    /// Connect to the relay advertised at `uri` and handshake with it.
    ///
    /// When another cluster id is already registered at `uri`, the fresher
    /// timestamp wins; a stale request is ignored, a stale registration is
    /// forgotten without tearing down its link.
    pub async fn connect(&self, uri: &str, meta: PeerMeta) -> Result<(), MeshError> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }

        {
            let mut tables = self.inner.tables.lock();
            let stale = tables.relays_at_uri_except(uri, &meta.cluster_id);
            if let Some((holder, _)) = stale.iter().find(|(_, ts)| *ts >= meta.timestamp) {
                debug!(
                    "{}: ignoring {} at {uri}, {holder} registered there more recently",
                    self.inner.identity, meta.cluster_id
                );
                return Ok(());
            }
            for (holder, _) in &stale {
                info!(
                    "{}: {holder} at {uri} superseded by {}",
                    self.inner.identity, meta.cluster_id
                );
                tables.relays.remove(holder);
            }

            if tables
                .relays
                .get(&meta.cluster_id)
                .is_some_and(|relay| relay.uri.is_some())
            {
                return Ok(());
            }

            let relay = tables
                .relays
                .entry(meta.cluster_id.clone())
                .or_insert_with(|| RelayConnection::new(None, vec![meta.cluster_id.clone()], 0));
            relay.uri = Some(uri.to_string());
            relay.timestamp = meta.timestamp;

            if let Err(e) = self.connect_socket(uri) {
                tables.relays.remove(&meta.cluster_id);
                return Err(e);
            }
        }

        info!("{}: connected to {} at {uri}", self.inner.identity, meta.cluster_id);
        self.handshake(&meta.cluster_id).await
    }

    /// Forget the relay `cluster_id` and drop the link to `uri`.
    pub fn disconnect(&self, uri: &str, cluster_id: &str) -> Result<(), MeshError> {
        let mut tables = self.inner.tables.lock();
        let Some(stored) = tables.relays.get(cluster_id).map(|relay| relay.uri.clone()) else {
            return Ok(());
        };

        match stored {
            None => {
                tables.relays.remove(cluster_id);
                Ok(())
            }
            Some(stored) if stored != uri => Err(MeshError::UriMismatch {
                cluster_id: cluster_id.to_string(),
                stored: Some(stored),
                requested: uri.to_string(),
            }),
            Some(_) => {
                tables.relays.remove(cluster_id);
                drop(tables);
                info!("{}: disconnecting {cluster_id} at {uri}", self.inner.identity);
                self.disconnect_socket(uri)
            }
        }
    }

    /// Discovery reports a relay. Relays link to other clusters; pure clients
    /// link to their own cluster's relay.
    pub async fn relay_up(&self, uri: &str, meta: PeerMeta) -> Result<(), MeshError> {
        let same_cluster = meta.cluster_id == self.inner.cluster_id;
        let wanted = if self.inner.is_relay {
            !same_cluster
        } else {
            same_cluster
        };
        if !wanted {
            debug!("{}: not linking to {} at {uri}", self.inner.identity, meta.cluster_id);
            return Ok(());
        }
        self.connect(uri, meta).await
    }

    /// Discovery reports a relay gone.
    pub fn relay_down(&self, uri: &str, meta: &PeerMeta) -> Result<(), MeshError> {
        self.disconnect(uri, &meta.cluster_id)
    }

    fn connect_socket(&self, uri: &str) -> Result<(), MeshError> {
        if let Some(router) = &self.inner.router {
            router.connect(uri)
        } else if let Some(dealer) = &self.inner.dealer {
            dealer.connect(uri)
        } else {
            Err(MeshError::NoTransport)
        }
    }

    fn disconnect_socket(&self, uri: &str) -> Result<(), MeshError> {
        if let Some(router) = &self.inner.router {
            router.disconnect(uri)
        } else if let Some(dealer) = &self.inner.dealer {
            dealer.disconnect(uri)
        } else {
            Err(MeshError::NoTransport)
        }
    }

    async fn handshake(&self, cluster_id: &str) -> Result<(), MeshError> {
        let envelope = HandshakePayload {
            cluster_id: self.inner.cluster_id.clone(),
            identity: self.inner.identity.clone(),
            is_relay: self.inner.is_relay,
            is_client: self.inner.is_client,
        }
        .into_envelope(vec![cluster_id.to_string()])?;

        self.send(envelope, self.inner.handshake_attempts).await?;
        Ok(())
    }

    fn on_handshake(&self, envelope: &Envelope) {
        let payload = match HandshakePayload::from_envelope(envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{}: bad handshake: {e}", self.inner.identity);
                return;
            }
        };
        let route_or = |fallback: &str| {
            if envelope.return_route().is_empty() {
                vec![fallback.to_string()]
            } else {
                envelope.return_route().to_vec()
            }
        };

        if payload.is_relay && payload.cluster_id != self.inner.cluster_id {
            let route = route_or(&payload.cluster_id);
            debug!("{}: relay {} reachable via {route:?}", self.inner.identity, payload.cluster_id);
            self.inner
                .tables
                .lock()
                .upsert_relay_route(&payload.cluster_id, route);
        } else if payload.is_client
            && payload.cluster_id == self.inner.cluster_id
            && self.inner.is_relay
        {
            let route = route_or(&payload.identity);
            debug!("{}: client {} attached via {route:?}", self.inner.identity, payload.identity);
            self.inner
                .tables
                .lock()
                .clients
                .insert(payload.identity, ClientConnection::new(route));
        } else {
            debug!(
                "{}: ignoring handshake from {} of {}",
                self.inner.identity, payload.identity, payload.cluster_id
            );
        }
    }

    // -- Routing -------------------------------------------------------------

    /// Route an envelope one step onward, delivering it here when its route
    /// ends at this node. Returns the bytes handed to a socket.
    ///
    /// The physical send is attempted up to `attempts` times, `retry_delay`
    /// apart. When every attempt fails and the envelope has a return route,
    /// an `mmrp.sendError` report is sent back along it once.
    pub async fn send(&self, mut envelope: Envelope, attempts: u32) -> Result<usize, MeshError> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }

        envelope.consume_route(Some(self.inner.identity.as_str()));
        let Some(front) = envelope.route().first() else {
            self.deliver(&envelope);
            return Ok(0);
        };

        if let Some(style) = RoutingStyle::from_marker(front) {
            envelope.consume_route(Some(style.marker()));
            self.defer_delivery(envelope.clone());
            if !self.inner.is_relay {
                return Ok(0);
            }
            return Ok(self.forward(&envelope, style).await);
        }

        match self.transmit_with_retry(&envelope, attempts).await {
            Ok(sent) => Ok(sent),
            Err(e) => {
                warn!("{}: giving up on {envelope}: {e}", self.inner.identity);
                self.report_send_error(&envelope, &e);
                Err(e)
            }
        }
    }

    /// Flood an envelope through the mesh and deliver it locally.
    ///
    /// Local delivery is deferred to the next scheduler tick so local
    /// subscribers see the broadcast in the same order as remote ones.
    pub async fn broadcast(
        &self,
        mut envelope: Envelope,
        style: RoutingStyle,
    ) -> Result<usize, MeshError> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        envelope.set_flag(TRACK_ROUTE);
        self.defer_delivery(envelope.clone());
        Ok(self.forward(&envelope, style).await)
    }

    async fn forward(&self, envelope: &Envelope, style: RoutingStyle) -> usize {
        let targets = {
            let tables = self.inner.tables.lock();
            broadcast_targets(
                style,
                self.inner.is_relay,
                tables.relays.values(),
                tables.clients.values(),
                envelope.return_route(),
            )
        };

        let mut total = 0;
        for route in targets {
            let copy = envelope.readdressed(route);
            match self.transmit_with_retry(&copy, 1).await {
                Ok(sent) => total += sent,
                Err(e) => warn!(
                    "{}: broadcast hop {:?} failed: {e}",
                    self.inner.identity,
                    copy.route()
                ),
            }
        }
        total
    }

    async fn transmit_with_retry(
        &self,
        envelope: &Envelope,
        attempts: u32,
    ) -> Result<usize, MeshError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transmit(envelope) {
                Ok(sent) => {
                    debug!("{}: sent {envelope}", self.inner.identity);
                    return Ok(sent);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(
                        "{}: attempt {attempt}/{attempts} for {envelope} failed: {e}",
                        self.inner.identity
                    );
                    tokio::time::sleep(self.inner.retry_delay).await;
                    if self.is_closed() {
                        return Ok(0);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One physical send through whichever socket this node owns.
    fn transmit(&self, envelope: &Envelope) -> Result<usize, MeshError> {
        if let Some(router) = &self.inner.router {
            if envelope.is_flagged(TRACK_ROUTE) {
                let mut tracked = envelope.clone();
                tracked.inject_sender(&self.inner.identity);
                return router.send(tracked.to_frames());
            }
            return router.send(envelope.to_frames());
        }

        if let Some(dealer) = &self.inner.dealer {
            let peers = dealer.peer_count();
            if peers > 1 {
                return Err(MeshError::Config(format!(
                    "client socket of {} is connected to {peers} relays",
                    self.inner.identity
                )));
            }
            return dealer.send(envelope.to_frames());
        }

        Err(MeshError::NoTransport)
    }

    fn report_send_error(&self, failed: &Envelope, error: &MeshError) {
        let Some(mut report) = send_error_envelope(failed, error) else {
            return;
        };
        report.consume_route(Some(self.inner.identity.as_str()));
        if !report.route_remains() {
            self.deliver(&report);
            return;
        }
        if let Err(e) = self.transmit(&report) {
            debug!("{}: could not return send error: {e}", self.inner.identity);
        }
    }

    fn deliver(&self, envelope: &Envelope) {
        let handlers = self.inner.dispatcher.read().handlers_for(envelope.message_type());
        if handlers.is_empty() {
            debug!("{}: no subscriber for {}", self.inner.identity, envelope.message_type());
        }
        for handler in handlers {
            handler(envelope);
        }
    }

    fn defer_delivery(&self, envelope: Envelope) {
        let node = self.clone();
        tokio::spawn(async move { node.deliver(&envelope) });
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        let mut envelope = match Envelope::from_frames(inbound.frames, inbound.sender.as_deref()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    "{}: dropping frames from {:?}: {e}",
                    self.inner.identity, inbound.sender
                );
                return;
            }
        };

        envelope.inject_route(&[self.inner.identity.as_str()]);
        if let Err(e) = self.send(envelope, 1).await {
            debug!("{}: inbound envelope not routed: {e}", self.inner.identity);
        }
    }

    /// Close both sockets and drop all state. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = &self.inner.router {
            router.close();
        }
        if let Some(dealer) = &self.inner.dealer {
            dealer.close();
        }
        self.inner.dispatcher.write().clear();
        self.inner.tables.lock().clear();
        let _ = self.inner.shutdown_tx.send(());
        info!("Mesh node {} closed", self.inner.identity);
    }
}

async fn run_inbound(
    node: Weak<NodeInner>,
    mut inbound: InboundReceiver,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            next = inbound.recv() => {
                let Some(frames) = next else { break };
                let Some(inner) = node.upgrade() else { break };
                MeshNode { inner }.handle_inbound(frames).await;
            }
            _ = shutdown.recv() => break,
        }
    }
    debug!("Inbound loop stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
