//! # P2P Manager (broker side)
//!
//! Matches connection requests between registered clients, advertises relay
//! servers, and vouches for peers that present themselves to a relay.
//!
//! ```text
//! A ──p2p-conn-request(B)──► broker ──p2p-conn-request(A's addrs)──► B
//! A ◄──p2p-conn-data(B's addrs)── broker ◄──p2p-conn-data(ok)────── B
//! ```
//!
//! A tracked connection is probed with `p2p-conn-status` on both peers every
//! check interval ([`TICKER_DURATION`] by default) and dropped when a peer
//! leaves or reports it unknown.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use super::{ConnectionMode, KEY_CONNECTION_ID, KEY_PORT, REQUEST_TIMEOUT, TAG_RELAY, TICKER_DURATION};
use crate::message::Message;
use crate::model::{
    ClientContext, ClientValidateData, P2pConnectionData, P2pConnectionRequest, P2pConnectionStatus, P2pPeerData,
    P2pRelayConnectionData, P2pRelayServers, P2P_CONNECTION_DATA, P2P_CONNECTION_REQUEST, P2P_CONNECTION_STATUS,
    P2P_RELAY_CONNECTION_DATA, P2P_RELAY_SERVERS, P2P_RELAY_VALIDATE,
};
use crate::server::{client_hook, message_handler, RegistryServer, ServerClient};
use crate::stream::ClientHandle;
use crate::util::{dedup, ExitSignal, Ticker};

/// Produces ids for new connections.
pub type ConnectionIdGenerator = Arc<dyn Fn() -> Result<String> + Send + Sync>;

fn uuid_generator() -> ConnectionIdGenerator {
    Arc::new(|| Ok(uuid::Uuid::new_v4().to_string()))
}

/// A connection the broker brokered between two registered clients.
pub struct BrokerConnection {
    id: String,
    mode: ConnectionMode,
    source: Arc<ServerClient>,
    target: Arc<ServerClient>,
    ticker: std::sync::Mutex<Option<Ticker>>,
    closed: AtomicBool,
    exit: ExitSignal,
}

impl BrokerConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn source_id(&self) -> String {
        self.source.id()
    }

    pub fn target_id(&self) -> String {
        self.target.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }

    fn involves(&self, client: &Arc<ServerClient>) -> bool {
        Arc::ptr_eq(&self.source, client) || Arc::ptr_eq(&self.target, client)
    }

    async fn check_peers(&self) -> Result<()> {
        for peer in [&self.source, &self.target] {
            if peer.is_closed() {
                bail!("peer disconnected: {}", peer.id());
            }
        }
        for peer in [&self.source, &self.target] {
            let probe = P2pConnectionStatus { id: self.id.clone(), status: true, message: String::new() };
            let reply = peer
                .send(Message::with_ack(P2P_CONNECTION_STATUS, probe, REQUEST_TIMEOUT))
                .await?
                .ok_or_else(|| anyhow!("status probe got no reply"))?;
            let status = reply.body::<P2pConnectionStatus>()?;
            if !status.status {
                bail!("peer {} reported: {}", peer.id(), status.message);
            }
        }
        Ok(())
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.ticker.lock() {
            slot.take();
        }
        self.exit.fire();
        warn!(conn = %self, reason, "broker connection closed");
    }
}

impl fmt::Display for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id({}) with mode({}) source({}) target({})",
            self.id,
            self.mode,
            self.source.id(),
            self.target.id()
        )
    }
}

pub struct BrokerManager {
    me: Weak<BrokerManager>,
    server: Arc<RegistryServer>,
    conns: DashMap<String, Arc<BrokerConnection>>,
    id_generator: std::sync::RwLock<ConnectionIdGenerator>,
    check_interval: std::sync::RwLock<Duration>,
}

impl BrokerManager {
    /// Registers the p2p handlers on `server`.
    pub async fn new(server: Arc<RegistryServer>) -> Result<Arc<Self>> {
        let manager = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            server,
            conns: DashMap::new(),
            id_generator: std::sync::RwLock::new(uuid_generator()),
            check_interval: std::sync::RwLock::new(TICKER_DURATION),
        });
        info!(tag = %manager.server.tag(), "registering p2p broker");
        manager.register_handlers().await?;
        Ok(manager)
    }

    async fn register_handlers(&self) -> Result<()> {
        self.route(P2P_CONNECTION_REQUEST, Self::handle_connection_request)?;
        self.route(P2P_CONNECTION_STATUS, Self::handle_connection_status)?;
        self.route(P2P_RELAY_SERVERS, Self::handle_relay_servers)?;
        self.route(P2P_RELAY_VALIDATE, Self::handle_relay_validate)?;

        let me = self.me.clone();
        self.server
            .set_disconnected_hook(client_hook(move |client| {
                let me = me.clone();
                async move {
                    if let Some(manager) = me.upgrade() {
                        manager.close_connections_of(&client);
                    }
                }
            }))
            .await;
        Ok(())
    }

    fn route<F, Fut>(&self, msg_type: &str, handler: F) -> Result<()>
    where
        F: Fn(Arc<Self>, Arc<ServerClient>, Message) -> Fut + Send + Sync + Copy + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let me = self.me.clone();
        self.server.register_handler(
            msg_type,
            message_handler(move |client, msg| {
                let me = me.clone();
                async move {
                    if let Some(manager) = me.upgrade() {
                        handler(manager, client, msg).await;
                    }
                }
            }),
        )
    }

    pub fn set_connection_id_generator(&self, generator: ConnectionIdGenerator) {
        if let Ok(mut slot) = self.id_generator.write() {
            *slot = generator;
        }
    }

    /// Applies to connections created after the call.
    pub fn set_check_interval(&self, interval: Duration) {
        if let Ok(mut slot) = self.check_interval.write() {
            *slot = interval;
        }
    }

    pub fn get_connection(&self, id: &str) -> Option<Arc<BrokerConnection>> {
        self.conns.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    fn generate_id(&self) -> Result<String> {
        let generator = self
            .id_generator
            .read()
            .map(|g| Arc::clone(&g))
            .map_err(|_| anyhow!("id generator poisoned"))?;
        generator()
    }

    // ------------------------------------------------------------------------
    // Connection requests
    // ------------------------------------------------------------------------

    async fn handle_connection_request(self: Arc<Self>, client: Arc<ServerClient>, msg: Message) {
        let body = match self.create_connection(&client, &msg).await {
            Ok((conn, relay_address, peer)) => P2pConnectionData {
                status: true,
                message: "Created".into(),
                id: conn.id.clone(),
                mode: conn.mode.to_string(),
                relay_address,
                peer: P2pPeerData {
                    id: conn.target.id(),
                    address: conn.target.addr().to_string(),
                    addresses: address_set(&peer, conn.target.addr()),
                },
            },
            Err(e) => {
                error!(client = %client, error = %e, "error creating connection");
                P2pConnectionData { status: false, message: e.to_string(), ..P2pConnectionData::default() }
            }
        };
        if let Ok(reply) = msg.reply(P2P_CONNECTION_DATA, body) {
            if let Err(e) = client.send(reply).await {
                debug!(error = %e, "failed to send connection data");
            }
        }
    }

    /// Returns the connection, the relay address and the target's own
    /// address report.
    async fn create_connection(
        &self,
        source: &Arc<ServerClient>,
        msg: &Message,
    ) -> Result<(Arc<BrokerConnection>, String, P2pPeerData)> {
        if !matches!(source.meta().map(|m| &m.ctx), Some(ClientContext::Broker)) {
            bail!("client does not have a broker context");
        }
        let request = msg.body::<P2pConnectionRequest>()?;
        let mode: ConnectionMode = request.mode.parse()?;
        info!(from = %source.id(), to = %request.peer.id, mode = %mode, "connection request");

        if request.peer.id == source.id() {
            bail!("cannot connect to self");
        }
        if mode == ConnectionMode::Relay && request.relay_address.is_empty() {
            bail!("relay address must be provided");
        }
        let target = self.server.get_client(&request.peer.id)?;

        let conn = Arc::new(BrokerConnection {
            id: self.generate_id()?,
            mode,
            source: Arc::clone(source),
            target: Arc::clone(&target),
            ticker: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            exit: ExitSignal::new(),
        });
        // Tracked before forwarding so relay validation can find it.
        self.conns.insert(conn.id.clone(), Arc::clone(&conn));

        let forward = P2pConnectionRequest {
            id: conn.id.clone(),
            mode: mode.to_string(),
            relay_address: request.relay_address.clone(),
            peer: P2pPeerData {
                id: source.id(),
                address: source.addr().to_string(),
                addresses: address_set(&request.peer, source.addr()),
            },
        };
        let confirmed = async {
            let reply = target
                .send(Message::with_ack(P2P_CONNECTION_REQUEST, forward, REQUEST_TIMEOUT))
                .await?
                .ok_or_else(|| anyhow!("peer did not answer the connection request"))?;
            let data = reply.body::<P2pConnectionData>()?;
            if !data.status {
                bail!("{}", data.message);
            }
            Ok::<P2pPeerData, anyhow::Error>(data.peer.clone())
        }
        .await;

        match confirmed {
            Ok(peer) => {
                self.start_ticker(&conn);
                info!(conn = %conn, "connection initialization complete");
                Ok((conn, request.relay_address.clone(), peer))
            }
            Err(e) => {
                self.close_connection(&conn.id, "Peer rejected");
                Err(e)
            }
        }
    }

    fn start_ticker(&self, conn: &Arc<BrokerConnection>) {
        let me = self.me.clone();
        let weak = Arc::downgrade(conn);
        let period = self.check_interval.read().map(|p| *p).unwrap_or(TICKER_DURATION);
        let ticker = Ticker::start(period, move || {
            let me = me.clone();
            let weak = weak.clone();
            async move {
                let Some(conn) = weak.upgrade() else { return };
                if conn.is_closed() {
                    return;
                }
                if let Err(e) = conn.check_peers().await {
                    error!(conn = %conn, error = %e, "connection check failed");
                    // Closing drops this ticker; run it outside the ticker task.
                    tokio::spawn(async move {
                        if let Some(manager) = me.upgrade() {
                            manager.close_connection(&conn.id, "Liveness check failed");
                        }
                    });
                }
            }
        });
        if let Ok(mut slot) = conn.ticker.lock() {
            *slot = Some(ticker);
        }
    }

    async fn handle_connection_status(self: Arc<Self>, client: Arc<ServerClient>, msg: Message) {
        let id = msg.body::<P2pConnectionStatus>().map(|s| s.id.clone()).unwrap_or_default();
        let result = match self.get_connection(&id) {
            None => Err(anyhow!("connection not found")),
            Some(conn) if conn.is_closed() => Err(anyhow!("connection closed")),
            Some(_) => Ok(()),
        };
        if let Ok(reply) = msg.reply(P2P_CONNECTION_STATUS, P2pConnectionStatus::from_result(id, &result)) {
            if let Err(e) = client.send(reply).await {
                debug!(error = %e, "failed to send connection status");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Relays
    // ------------------------------------------------------------------------

    /// `ip:port` of every registered relay that reported its port.
    pub fn relay_servers(&self) -> Vec<String> {
        self.server
            .get_clients_with_tag(TAG_RELAY)
            .into_iter()
            .filter_map(|relay| {
                let port = relay.meta().and_then(|m| m.data.get(KEY_PORT)).and_then(|p| p.parse::<u16>().ok());
                match port {
                    Some(port) => Some(SocketAddr::new(relay.addr().ip(), port).to_string()),
                    None => {
                        warn!(relay = %relay, "relay did not send a valid {} entry", KEY_PORT);
                        None
                    }
                }
            })
            .collect()
    }

    async fn handle_relay_servers(self: Arc<Self>, client: Arc<ServerClient>, msg: Message) {
        let servers = self.relay_servers();
        if let Ok(reply) = msg.reply(P2P_RELAY_SERVERS, P2pRelayServers { servers }) {
            if let Err(e) = client.send(reply).await {
                debug!(error = %e, "failed to send relay servers");
            }
        }
    }

    async fn handle_relay_validate(self: Arc<Self>, client: Arc<ServerClient>, msg: Message) {
        let body = match self.validate_relay_peer(&client, &msg).await {
            Ok(body) => body,
            Err(e) => {
                warn!(relay = %client, error = %e, "relay peer rejected");
                P2pRelayConnectionData { status: false, message: e.to_string(), ..P2pRelayConnectionData::default() }
            }
        };
        if let Ok(reply) = msg.reply(P2P_RELAY_CONNECTION_DATA, body) {
            if let Err(e) = client.send(reply).await {
                debug!(error = %e, "failed to send relay connection data");
            }
        }
    }

    async fn validate_relay_peer(&self, relay: &Arc<ServerClient>, msg: &Message) -> Result<P2pRelayConnectionData> {
        let request: &ClientValidateData = msg.body()?;
        let data = self.server.validator().validate(relay.addr(), request).await?;

        let conn_id = request.data.get(KEY_CONNECTION_ID).map(String::as_str).unwrap_or_default();
        let conn = self.get_connection(conn_id).ok_or_else(|| anyhow!("connection not found"))?;
        let (source_id, target_id) = (conn.source_id(), conn.target_id());
        if data.id != source_id && data.id != target_id {
            bail!("invalid connection id");
        }

        Ok(P2pRelayConnectionData {
            status: !conn.is_closed(),
            message: "OK".into(),
            id: conn.id.clone(),
            mode: conn.mode.to_string(),
            peer: P2pPeerData { id: data.id, ..P2pPeerData::default() },
            source_peer: P2pPeerData { id: source_id, ..P2pPeerData::default() },
            target_peer: P2pPeerData { id: target_id, ..P2pPeerData::default() },
        })
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    pub fn close_connection(&self, id: &str, reason: &str) {
        if let Some((_, conn)) = self.conns.remove(id) {
            conn.close(reason);
        }
    }

    fn close_connections_of(&self, client: &Arc<ServerClient>) {
        let ids: Vec<String> = self
            .conns
            .iter()
            .filter(|c| c.value().involves(client))
            .map(|c| c.key().clone())
            .collect();
        for id in ids {
            self.close_connection(&id, "Peer disconnected");
        }
    }

    pub fn close_all(&self) {
        let conns: Vec<_> = self.conns.iter().map(|c| Arc::clone(c.value())).collect();
        self.conns.clear();
        if !conns.is_empty() {
            warn!(count = conns.len(), "closing all broker connections");
        }
        for conn in conns {
            conn.close("Close all");
        }
    }
}

/// Addresses a peer reported plus its primary and the address the broker
/// observed, without duplicates.
fn address_set(reported: &P2pPeerData, observed: SocketAddr) -> Vec<String> {
    dedup(
        reported
            .addresses
            .iter()
            .cloned()
            .chain([reported.address.clone(), observed.to_string()]),
    )
}
