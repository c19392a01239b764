//! # P2P Manager (client side)
//!
//! Owns the connections of one broker client. The broker client's endpoint
//! doubles as a peer server so that the address the broker observed is the
//! one peers dial:
//!
//! ```text
//!             shared UDP socket
//!   ┌────────────────┴────────────────┐
//!   RegistryClient ──► broker         RegistryServer ◄── peers (token = conn id)
//!   p2p-conn-request / p2p-conn-status  p2p-client-init
//! ```
//!
//! Inbound streams are dispatched on their metadata:
//!
//! | Key                 | Action                                         |
//! |---------------------|------------------------------------------------|
//! | `__STREAM_IGNORE`   | opened for a local relay `open_stream`, left alone |
//! | `__STREAM_MESSAGE`  | wrapped in a [`MessageStream`]                  |
//! | neither             | passed to the peer stream handler             |

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::conn::PathContext;
use super::message_stream::MessageStream;
use super::{
    Connection, ConnectionMode, Peer, CONNECTION_TIMEOUT, KEY_CONNECTION_ID, KEY_STREAM_IGNORE, KEY_STREAM_MESSAGE,
};
use crate::client::{client_message_handler, RegistryClient};
use crate::message::{Message, REQUEST_TIMEOUT};
use crate::model::{
    ClientContext, ClientData, ClientSearch, ClientValidateData, P2pConnectionData, P2pConnectionRequest,
    P2pConnectionStatus, P2pPeerData, P2pRelayServers, P2P_CLIENT_INIT, P2P_CONNECTION_DATA, P2P_CONNECTION_REQUEST,
    P2P_CONNECTION_STATUS, P2P_RELAY_SERVERS,
};
use crate::ping::{ping_addrs, LatencyProbe, QuicHandshakeProbe, DEFAULT_PROBE_COUNT};
use crate::server::{client_hook, message_handler, ClientValidator, RegistryServer, RegistryServerConfig, ServerClient};
use crate::stream::{stream_handler, ClientHandle, Stream, StreamHandler};
use crate::transport::{resolve, unspecified_for};
use crate::util::{dedup, BoxFuture};

/// Called once an accepted connection is established.
pub type ConnectionHandler = Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called for each raw stream a peer opens on a connection.
pub type PeerStreamHandler = Arc<dyn Fn(Arc<Connection>, Arc<Stream>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called for each message stream a peer opens on a connection.
pub type MessageStreamHandler = Arc<dyn Fn(Arc<MessageStream>) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn connection_handler<F, Fut>(f: F) -> ConnectionHandler
where
    F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |conn| Box::pin(f(conn)))
}

pub fn peer_stream_handler<F, Fut>(f: F) -> PeerStreamHandler
where
    F: Fn(Arc<Connection>, Arc<Stream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |conn, stream| Box::pin(f(conn, stream)))
}

pub fn message_stream_handler<F, Fut>(f: F) -> MessageStreamHandler
where
    F: Fn(Arc<MessageStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream| Box::pin(f(stream)))
}

#[derive(Debug, Clone, Default)]
pub struct P2pConfig {
    /// Fixed relay `host:port`. When unset the broker is asked for relays
    /// and the nearest responder is used.
    pub relay_addr: Option<String>,
    /// IPs advertised as direct candidates. When empty they are detected.
    pub local_ips: Vec<IpAddr>,
}

pub struct P2pManager {
    me: Weak<P2pManager>,
    config: P2pConfig,
    client: Arc<RegistryClient>,
    peer_server: Arc<RegistryServer>,
    conns: DashMap<String, Arc<Connection>>,
    connection_handler: RwLock<Option<ConnectionHandler>>,
    stream_handler: RwLock<Option<PeerStreamHandler>>,
    message_stream_handler: RwLock<Option<MessageStreamHandler>>,
    probe: std::sync::RwLock<Arc<dyn LatencyProbe>>,
}

impl P2pManager {
    /// Attaches to `client`, whose endpoint must accept inbound sessions.
    /// Registers the p2p handlers and starts the peer server.
    pub async fn new(config: P2pConfig, client: Arc<RegistryClient>) -> Result<Arc<Self>> {
        let probe: Arc<dyn LatencyProbe> = Arc::new(QuicHandshakeProbe::new(client.endpoint().clone()));
        let manager = Arc::new_cyclic(|me: &Weak<P2pManager>| {
            let server_config = RegistryServerConfig {
                tag: "p2p".to_string(),
                addr: client.local_addr(),
                unmarshaler: client.unmarshaler(),
            };
            let validator = Arc::new(PeerValidator { manager: me.clone() });
            Self {
                me: me.clone(),
                config,
                peer_server: RegistryServer::with_endpoint(server_config, client.endpoint().clone(), validator),
                client,
                conns: DashMap::new(),
                connection_handler: RwLock::new(None),
                stream_handler: RwLock::new(None),
                message_stream_handler: RwLock::new(None),
                probe: std::sync::RwLock::new(probe),
            }
        });

        manager.register_handlers().await?;
        manager.peer_server.listen()?;

        let weak = Arc::downgrade(&manager);
        let client_exit = manager.client.exited();
        tokio::spawn(async move {
            client_exit.wait().await;
            if let Some(manager) = weak.upgrade() {
                manager.close().await;
            }
        });

        info!(addr = %manager.client.local_addr(), "p2p manager registered");
        Ok(manager)
    }

    async fn register_handlers(self: &Arc<Self>) -> Result<()> {
        let me = self.me.clone();
        self.client.register_handler(
            P2P_CONNECTION_REQUEST,
            client_message_handler(move |client, msg| {
                let me = me.clone();
                async move {
                    if let Some(manager) = me.upgrade() {
                        manager.handle_connection_request(client, msg).await;
                    }
                }
            }),
        )?;

        let me = self.me.clone();
        self.client.register_handler(
            P2P_CONNECTION_STATUS,
            client_message_handler(move |client, msg| {
                let me = me.clone();
                async move {
                    if let Some(manager) = me.upgrade() {
                        manager.handle_connection_status(client, msg).await;
                    }
                }
            }),
        )?;

        let me = self.me.clone();
        self.peer_server.register_handler(
            P2P_CLIENT_INIT,
            message_handler(move |client, msg| {
                let me = me.clone();
                async move {
                    if let Some(manager) = me.upgrade() {
                        manager.handle_client_init(client, msg).await;
                    }
                }
            }),
        )?;

        let me = self.me.clone();
        self.peer_server
            .set_disconnected_hook(client_hook(move |client| {
                let me = me.clone();
                async move {
                    let Some(manager) = me.upgrade() else { return };
                    if !client.is_active() {
                        return;
                    }
                    if let Some(ClientContext::P2p { conn_id, .. }) = client.meta().map(|m| &m.ctx) {
                        manager.close_connection(conn_id, "Peer disconnected").await;
                    }
                }
            }))
            .await;

        self.peer_server.set_stream_handler(self.stream_dispatcher()).await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors and handlers
    // ------------------------------------------------------------------------

    pub fn client(&self) -> &Arc<RegistryClient> {
        &self.client
    }

    pub fn peer_server(&self) -> &Arc<RegistryServer> {
        &self.peer_server
    }

    pub fn get_connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.conns.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.conns.iter().map(|c| Arc::clone(c.value())).collect()
    }

    pub async fn set_connection_handler(&self, handler: ConnectionHandler) {
        *self.connection_handler.write().await = Some(handler);
    }

    pub async fn set_stream_handler(&self, handler: PeerStreamHandler) {
        *self.stream_handler.write().await = Some(handler);
    }

    pub async fn set_message_stream_handler(&self, handler: MessageStreamHandler) {
        *self.message_stream_handler.write().await = Some(handler);
    }

    /// Replaces the probe used to rank relays.
    pub fn set_latency_probe(&self, probe: Arc<dyn LatencyProbe>) {
        if let Ok(mut slot) = self.probe.write() {
            *slot = probe;
        }
    }

    // ------------------------------------------------------------------------
    // Outbound connections
    // ------------------------------------------------------------------------

    /// Asks the broker for a connection to `peer_id` and establishes it.
    pub async fn connect_by_id(&self, peer_id: &str, mode: ConnectionMode) -> Result<Arc<Connection>> {
        if peer_id == self.client.id() {
            bail!("cannot connect to self");
        }
        info!(peer = %peer_id, mode = %mode, "requesting connection");

        let relay_addr = match mode {
            ConnectionMode::Relay => Some(self.nearest_relay().await?),
            ConnectionMode::P2p => None,
        };
        let request = P2pConnectionRequest {
            id: String::new(),
            mode: mode.as_str().to_string(),
            relay_address: relay_addr.map(|a| a.to_string()).unwrap_or_default(),
            peer: P2pPeerData {
                id: peer_id.to_string(),
                address: self.client.local_addr().to_string(),
                addresses: self.local_candidates(),
            },
        };
        let reply = self
            .client
            .send(Message::with_ack(P2P_CONNECTION_REQUEST, request, CONNECTION_TIMEOUT))
            .await?
            .ok_or_else(|| anyhow!("connection request got no reply"))?;
        let data = reply.body::<P2pConnectionData>()?;
        if !data.status {
            bail!("connection request rejected: {}", data.message);
        }

        let peer = Peer::resolve(&data.peer).await?;
        let conn = Connection::new(self.path_context(&data.id, peer, true), mode, relay_addr)?;
        self.conns.insert(data.id.clone(), Arc::clone(&conn));
        if let Err(e) = conn.connect().await {
            self.close_connection(conn.id(), "Connect failed").await;
            return Err(e);
        }
        self.watch_removal(&conn);
        Ok(conn)
    }

    /// Picks one client with `tag` at random and connects to it.
    pub async fn connect_by_tag(&self, tag: &str, mode: ConnectionMode) -> Result<Arc<Connection>> {
        let own_id = self.client.id();
        let candidates: Vec<String> = self
            .client
            .search_clients(ClientSearch { id: String::new(), tag: tag.to_string() })
            .await?
            .into_iter()
            .filter(|id| *id != own_id)
            .collect();
        let peer_id = candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| anyhow!("no peers found with tag ({})", tag))?;
        self.connect_by_id(&peer_id, mode).await
    }

    /// Relay to use: the configured one, else the lowest-latency relay the
    /// broker knows about.
    pub async fn nearest_relay(&self) -> Result<SocketAddr> {
        if let Some(addr) = &self.config.relay_addr {
            return resolve(addr).await;
        }

        let reply = self
            .client
            .send(Message::with_ack(P2P_RELAY_SERVERS, P2pRelayServers::default(), REQUEST_TIMEOUT))
            .await?
            .ok_or_else(|| anyhow!("relay list request got no reply"))?;
        let servers = reply.body::<P2pRelayServers>()?.servers.clone();
        if servers.is_empty() {
            bail!("no relay servers found");
        }

        let probe = self.probe.read().map(|p| Arc::clone(&p)).map_err(|_| anyhow!("latency probe poisoned"))?;
        let results = ping_addrs(probe, &servers, DEFAULT_PROBE_COUNT).await;
        for failed in &results.failed {
            warn!(relay = %failed.label, error = ?failed.error, "relay did not respond");
        }
        let nearest = results
            .fastest()
            .and_then(|r| r.addr)
            .ok_or_else(|| anyhow!("error pinging relay servers: none of {} responded", servers.len()))?;
        info!(relay = %nearest, "selected relay");
        Ok(nearest)
    }

    /// `ip:port` candidates advertised to peers for direct dialing.
    pub fn local_candidates(&self) -> Vec<String> {
        let port = self.client.local_addr().port();
        let mut ips = self.config.local_ips.clone();
        if ips.is_empty() {
            let bound = self.client.local_addr().ip();
            if !bound.is_unspecified() {
                ips.push(bound);
            }
            if let Some(outbound) = outbound_ip(self.client.server_addr()) {
                ips.push(outbound);
            }
        }
        dedup(ips.into_iter().map(|ip| SocketAddr::new(ip, port).to_string()))
    }

    fn path_context(&self, conn_id: &str, peer: Peer, initiator: bool) -> PathContext {
        PathContext {
            conn_id: conn_id.to_string(),
            peer,
            initiator,
            endpoint: self.client.endpoint().clone(),
            broker_token: self.client.token().to_string(),
            broker_data: self.client.validate_data().clone(),
            unmarshaler: self.client.unmarshaler(),
            stream_handler: self.stream_dispatcher(),
        }
    }

    /// Drops the map entry once the connection exits.
    fn watch_removal(&self, conn: &Arc<Connection>) {
        let me = self.me.clone();
        let exited = conn.exited();
        let weak_conn = Arc::downgrade(conn);
        tokio::spawn(async move {
            exited.wait().await;
            let (Some(manager), Some(conn)) = (me.upgrade(), weak_conn.upgrade()) else { return };
            manager.conns.remove_if(conn.id(), |_, c| Arc::ptr_eq(c, &conn));
            debug!(conn = %conn.id(), "connection removed");
        });
    }

    // ------------------------------------------------------------------------
    // Inbound requests
    // ------------------------------------------------------------------------

    async fn handle_connection_request(self: Arc<Self>, client: Arc<RegistryClient>, msg: Message) {
        let body = match self.accept_connection(&msg).await {
            Ok(()) => P2pConnectionData {
                status: true,
                message: "Ok".into(),
                peer: P2pPeerData {
                    id: client.id(),
                    address: client.local_addr().to_string(),
                    addresses: self.local_candidates(),
                },
                ..P2pConnectionData::default()
            },
            Err(e) => {
                error!(error = %e, "error accepting connection");
                P2pConnectionData { status: false, message: e.to_string(), ..P2pConnectionData::default() }
            }
        };
        match msg.reply(P2P_CONNECTION_DATA, body) {
            Ok(reply) => {
                if let Err(e) = client.send(reply).await {
                    warn!(error = %e, "failed to answer connection request");
                }
            }
            Err(e) => warn!(error = %e, "failed to answer connection request"),
        }
    }

    async fn accept_connection(self: &Arc<Self>, msg: &Message) -> Result<()> {
        let request = msg.body::<P2pConnectionRequest>()?;
        if request.peer.id == self.client.id() {
            bail!("cannot accept a connection from self");
        }
        let mode: ConnectionMode = request.mode.parse()?;
        info!(conn = %request.id, peer = %request.peer.id, mode = %mode, "incoming connection request");

        let peer = Peer::resolve(&request.peer).await?;
        let relay_addr = match mode {
            ConnectionMode::Relay => Some(resolve(&request.relay_address).await.context("invalid relay address")?),
            ConnectionMode::P2p => None,
        };
        let conn = Connection::new(self.path_context(&request.id, peer, false), mode, relay_addr)?;
        self.conns.insert(request.id.clone(), Arc::clone(&conn));

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = conn.connect().await {
                error!(conn = %conn.id(), error = %e, "incoming connection failed");
                manager.close_connection(conn.id(), "Connect failed").await;
                return;
            }
            manager.watch_removal(&conn);
            let handler = manager.connection_handler.read().await.clone();
            if let Some(handler) = handler {
                handler(conn).await;
            }
        });
        Ok(())
    }

    async fn handle_connection_status(self: Arc<Self>, client: Arc<RegistryClient>, msg: Message) {
        let id = msg.body::<P2pConnectionStatus>().map(|s| s.id.clone()).unwrap_or_default();
        let result = match self.get_connection(&id) {
            None => Err(anyhow!("connection not found")),
            Some(conn) if !conn.is_connected() => Err(anyhow!("connection pending")),
            Some(_) => Ok(()),
        };
        if let Ok(reply) = msg.reply(P2P_CONNECTION_STATUS, P2pConnectionStatus::from_result(id, &result)) {
            if let Err(e) = client.send(reply).await {
                debug!(error = %e, "failed to send connection status");
            }
        }
    }

    async fn handle_client_init(self: Arc<Self>, client: Arc<ServerClient>, msg: Message) {
        let conn_id = match client.meta().map(|m| &m.ctx) {
            Some(ClientContext::P2p { conn_id, .. }) => conn_id.clone(),
            _ => String::new(),
        };
        let result = self
            .get_connection(&conn_id)
            .ok_or_else(|| anyhow!("connection with id ({}) not found", conn_id))
            .and_then(|conn| conn.checkin_remote(Arc::clone(&client)));
        match &result {
            Ok(()) => {
                client.mark_active();
                info!(conn = %conn_id, client = %client, "peer checked in");
            }
            Err(e) => warn!(conn = %conn_id, client = %client, error = %e, "peer check-in rejected"),
        }
        if let Ok(reply) = msg.reply(P2P_CONNECTION_STATUS, P2pConnectionStatus::from_result(conn_id, &result)) {
            if let Err(e) = client.send(reply).await {
                debug!(error = %e, "failed to send check-in result");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Stream dispatch
    // ------------------------------------------------------------------------

    fn stream_dispatcher(&self) -> StreamHandler {
        let me = self.me.clone();
        stream_handler(move |from, stream| {
            let me = me.clone();
            async move {
                match me.upgrade() {
                    Some(manager) => manager.dispatch_stream(from, stream).await,
                    None => stream.close().await,
                }
            }
        })
    }

    async fn dispatch_stream(&self, from: Arc<dyn ClientHandle>, stream: Arc<Stream>) {
        if stream.get(KEY_STREAM_IGNORE).is_some() {
            return;
        }
        let conn = stream.get(KEY_CONNECTION_ID).and_then(|id| self.get_connection(id));
        let Some(conn) = conn else {
            warn!(from = %from.id(), stream = %stream.id(), "stream for unknown connection");
            stream.close().await;
            return;
        };

        if stream.get(KEY_STREAM_MESSAGE).is_some() {
            let handler = self.message_stream_handler.read().await.clone();
            match handler {
                Some(handler) => handler(MessageStream::new(conn, stream)).await,
                None => {
                    warn!(conn = %conn.id(), "no message stream handler, closing stream");
                    stream.close().await;
                }
            }
            return;
        }

        let handler = self.stream_handler.read().await.clone();
        match handler {
            Some(handler) => handler(conn, stream).await,
            None => {
                warn!(conn = %conn.id(), "no stream handler, closing stream");
                stream.close().await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    pub async fn close_connection(&self, id: &str, reason: &str) {
        if let Some((_, conn)) = self.conns.remove(id) {
            conn.close(reason).await;
        }
    }

    pub async fn close_all(&self) {
        let conns: Vec<_> = self.conns.iter().map(|c| Arc::clone(c.value())).collect();
        self.conns.clear();
        if !conns.is_empty() {
            warn!(count = conns.len(), "closing all connections");
        }
        for conn in conns {
            conn.close("Close all").await;
        }
    }

    /// Closes every connection and the peer server. The broker client is
    /// left to its owner.
    pub async fn close(&self) {
        self.close_all().await;
        self.peer_server.close(0, "P2P manager closed").await;
    }
}

/// Source IP the OS would use to reach `target`. No packet is sent.
fn outbound_ip(target: SocketAddr) -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(SocketAddr::new(unspecified_for(&target), 0)).ok()?;
    socket.connect(target).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

// ============================================================================
// Peer server validation
// ============================================================================

/// Admits peer-server sessions whose token names a connection waiting for
/// an inbound direct session from that peer.
struct PeerValidator {
    manager: Weak<P2pManager>,
}

#[async_trait]
impl ClientValidator for PeerValidator {
    async fn validate(&self, addr: SocketAddr, request: &ClientValidateData) -> Result<ClientData> {
        let manager = self.manager.upgrade().ok_or_else(|| anyhow!("p2p manager closed"))?;
        let conn = manager
            .get_connection(&request.token)
            .ok_or_else(|| anyhow!("connection with id ({}) not found", request.token))?;
        if let Some(reason) = conn.inbound_refusal() {
            bail!("{}", reason);
        }
        if !conn.peer().has_ip(addr.ip()) {
            bail!("peer address mismatch");
        }

        Ok(ClientData {
            id: format!("{}:{}", conn.id(), addr),
            address: addr.to_string(),
            data: request.data.clone(),
            ctx: ClientContext::P2p {
                conn_id: conn.id().to_string(),
                peer_id: conn.peer().id.clone(),
                active: false,
            },
            ..ClientData::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RegistryClientConfig;
    use crate::model::Metadata;
    use crate::transport::QuicEndpoint;

    async fn detached_manager() -> Arc<P2pManager> {
        let endpoint = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), true).await.unwrap();
        let config = RegistryClientConfig {
            server_addr: "127.0.0.1:9".parse().unwrap(),
            token: "alice".to_string(),
            ..RegistryClientConfig::default()
        };
        let client = RegistryClient::with_endpoint(config, endpoint).unwrap();
        P2pManager::new(P2pConfig::default(), client).await.unwrap()
    }

    fn bob() -> Peer {
        Peer {
            id: "bob".into(),
            addr: "203.0.113.9:61000".parse().unwrap(),
            addrs: vec!["10.0.0.7:4000".parse().unwrap()],
        }
    }

    fn track(manager: &P2pManager, id: &str, initiator: bool, mode: ConnectionMode) {
        let relay_addr = (mode == ConnectionMode::Relay).then(|| "127.0.0.1:10001".parse().unwrap());
        let conn = Connection::new(manager.path_context(id, bob(), initiator), mode, relay_addr).unwrap();
        manager.conns.insert(id.to_string(), conn);
    }

    fn token(id: &str) -> ClientValidateData {
        ClientValidateData { token: id.to_string(), data: Metadata::new() }
    }

    #[tokio::test]
    async fn peer_validator_checks_the_source_address() {
        let manager = detached_manager().await;
        track(&manager, "c1", false, ConnectionMode::P2p);
        let validator = PeerValidator { manager: Arc::downgrade(&manager) };

        let err = validator.validate("10.0.0.8:4000".parse().unwrap(), &token("c1")).await.unwrap_err();
        assert!(err.to_string().contains("peer address mismatch"), "{}", err);

        // Any port on a known IP is accepted; NATs remap ports.
        let data = validator.validate("10.0.0.7:5555".parse().unwrap(), &token("c1")).await.unwrap();
        assert_eq!(data.id, "c1:10.0.0.7:5555");
        assert_eq!(
            data.ctx,
            ClientContext::P2p { conn_id: "c1".into(), peer_id: "bob".into(), active: false }
        );
        let observed = validator.validate("203.0.113.9:1".parse().unwrap(), &token("c1")).await;
        assert!(observed.is_ok());

        manager.close().await;
    }

    #[tokio::test]
    async fn peer_validator_refuses_connections_not_waiting() {
        let manager = detached_manager().await;
        track(&manager, "outbound", true, ConnectionMode::P2p);
        track(&manager, "relayed", false, ConnectionMode::Relay);
        let validator = PeerValidator { manager: Arc::downgrade(&manager) };
        let from = "10.0.0.7:4000".parse().unwrap();

        assert!(validator.validate(from, &token("unknown")).await.is_err());
        let err = validator.validate(from, &token("outbound")).await.unwrap_err();
        assert!(err.to_string().contains("peer not ready"), "{}", err);
        let err = validator.validate(from, &token("relayed")).await.unwrap_err();
        assert!(err.to_string().contains("not in p2p mode"), "{}", err);

        manager.close().await;
    }

    #[tokio::test]
    async fn local_candidates_use_configured_ips() {
        let endpoint = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), true).await.unwrap();
        let port = endpoint.local_addr().port();
        let config = RegistryClientConfig {
            server_addr: "127.0.0.1:9".parse().unwrap(),
            token: "alice".to_string(),
            ..RegistryClientConfig::default()
        };
        let client = RegistryClient::with_endpoint(config, endpoint).unwrap();
        let p2p = P2pConfig { relay_addr: None, local_ips: vec!["192.168.1.4".parse().unwrap()] };
        let manager = P2pManager::new(p2p, client).await.unwrap();

        assert_eq!(manager.local_candidates(), vec![format!("192.168.1.4:{}", port)]);
        manager.close().await;
    }
}
