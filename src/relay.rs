//! # Relay Server
//!
//! Splices streams between two peers that cannot reach each other directly.
//!
//! ## Lifecycle
//!
//! ```text
//!   peer ──validate(token, __CONNECTION_ID)──► relay ──p2p-relay-validate──► broker
//!                                               │ ok: client id = "{peer}:{conn}"
//!   peer ──p2p-relay-await───────────────────► relay waits for the counterpart
//!   peer ──p2p-relay-open-stream─────────────► relay opens a stream to each side
//!                                               and copies bytes both ways
//! ```
//!
//! The relay registers with the broker under the `relay` tag and reports its
//! listen port, so brokers can hand it out to clients. Each relay connection
//! is probed against the broker every `check_interval` ([`TICKER_DURATION`]
//! by default) and closed, together
//! with both of its clients, once the broker no longer knows it.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::client::{RegistryClient, RegistryClientConfig};
use crate::message::{Message, REQUEST_TIMEOUT};
use crate::model::{
    metadata, ClientContext, ClientData, ClientValidateData, P2pConnectionStatus, P2pRelayConnectionData,
    P2pRelayOpenStream, P2pRelayStreamInfo, P2P_CONNECTION_STATUS, P2P_RELAY_AWAIT, P2P_RELAY_OPEN_STREAM,
    P2P_RELAY_STREAM_INFO, P2P_RELAY_VALIDATE,
};
use crate::p2p::{KEY_CONNECTION_ID, KEY_PORT, KEY_STREAM_IGNORE, KEY_TAGS, TAG_RELAY};
use crate::server::{client_hook, message_handler, ClientValidator, RegistryServer, RegistryServerConfig, ServerClient};
use crate::stream::{ClientHandle, Stream};
use crate::transport::QuicEndpoint;
use crate::util::{spawn_supervised, ExitSignal, Ticker};

// ============================================================================
// Constants
// ============================================================================

/// Interval between broker liveness probes for a relay connection.
pub const TICKER_DURATION: Duration = Duration::from_secs(30);

/// How long a client waits on the relay for its counterpart.
pub const AWAIT_PEER_TIMEOUT: Duration = Duration::from_secs(15);

/// Reconnect attempts after the broker session drops. The relay closes once
/// they run out.
pub const BROKER_RECONNECT_TRIES: u32 = 3;

/// Capacity of a connection's arrival bus. Only two peers ever publish.
const BUS_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address the relay accepts peers on.
    pub addr: SocketAddr,
    pub broker_addr: SocketAddr,
    /// Token the relay registers with at the broker.
    pub broker_token: String,
    /// Interval between broker liveness probes per connection.
    pub check_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 10001)),
            broker_addr: SocketAddr::from(([127, 0, 0, 1], 10000)),
            broker_token: String::new(),
            check_interval: TICKER_DURATION,
        }
    }
}

// ============================================================================
// Relay connection
// ============================================================================

/// Both peers of one broker connection, as seen by the relay.
pub struct RelayConnection {
    me: Weak<RelayConnection>,
    id: String,
    source_peer_id: String,
    target_peer_id: String,
    server: Weak<RegistryServer>,
    bus: broadcast::Sender<String>,
    ticker: std::sync::Mutex<Option<Ticker>>,
    closed: AtomicBool,
    exit: ExitSignal,
}

impl RelayConnection {
    fn new(data: &P2pRelayConnectionData, server: Weak<RegistryServer>) -> Arc<Self> {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: data.id.clone(),
            source_peer_id: data.source_peer.id.clone(),
            target_peer_id: data.target_peer.id.clone(),
            server,
            bus,
            ticker: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            exit: ExitSignal::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registry id of `peer_id`'s client on this connection.
    pub fn client_id(&self, peer_id: &str) -> String {
        format!("{}:{}", peer_id, self.id)
    }

    fn counterpart_id(&self, client_id: &str) -> Result<String> {
        if client_id == self.client_id(&self.source_peer_id) {
            Ok(self.client_id(&self.target_peer_id))
        } else if client_id == self.client_id(&self.target_peer_id) {
            Ok(self.client_id(&self.source_peer_id))
        } else {
            bail!("client ({}) is not part of connection ({})", client_id, self.id)
        }
    }

    fn counterpart(&self, client_id: &str) -> Result<Arc<ServerClient>> {
        let server = self.server.upgrade().ok_or_else(|| anyhow!("relay closed"))?;
        server.get_client(&self.counterpart_id(client_id)?)
    }

    fn publish(&self, client_id: String) {
        // No subscribers is normal before anyone awaits.
        let _ = self.bus.send(client_id);
    }

    /// Resolves once the counterpart is registered, or fails after
    /// [`AWAIT_PEER_TIMEOUT`].
    async fn await_peer(&self, client_id: &str) -> Result<()> {
        let peer_id = self.counterpart_id(client_id)?;
        let mut arrivals = self.bus.subscribe();
        self.publish(client_id.to_string());
        if self.counterpart(client_id).is_ok() {
            return Ok(());
        }

        let wait = async {
            loop {
                match arrivals.recv().await {
                    Ok(id) if id == peer_id => return Ok(()),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.counterpart(client_id).is_ok() {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => bail!("connection closed"),
                }
            }
        };
        tokio::select! {
            _ = self.exit.wait() => bail!("connection closed"),
            waited = tokio::time::timeout(AWAIT_PEER_TIMEOUT, wait) => {
                waited.map_err(|_| anyhow!("error awaiting peer"))?
            }
        }
    }

    /// Opens a stream to the counterpart, then one to `client`, and splices
    /// them. Returns the id of the stream opened to `client`.
    async fn open_stream(&self, client: &Arc<ServerClient>, mut data: crate::model::Metadata) -> Result<String> {
        data.insert(KEY_CONNECTION_ID.to_string(), self.id.clone());

        let peer = self.counterpart(&client.id())?;
        let peer_stream = peer.open_stream(data.clone()).await?;

        data.insert(KEY_STREAM_IGNORE.to_string(), "true".to_string());
        let stream = match client.open_stream(data).await {
            Ok(stream) => stream,
            Err(e) => {
                peer_stream.close().await;
                return Err(e);
            }
        };

        let id = stream.id().to_string();
        let me = self.me.clone();
        spawn_supervised("relay-splice", splice(stream, peer_stream), move || {
            if let Some(conn) = me.upgrade() {
                tokio::spawn(async move { conn.close("Splice task panicked").await });
            }
        });
        Ok(id)
    }

    async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.ticker.lock() {
            slot.take();
        }
        self.exit.fire();
        if let Some(server) = self.server.upgrade() {
            for peer in [&self.source_peer_id, &self.target_peer_id] {
                if let Ok(client) = server.get_client(&self.client_id(peer)) {
                    client.close(0, "Connection closed").await;
                }
            }
        }
        warn!(conn = %self, reason, "relay connection closed");
    }
}

impl fmt::Display for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id({}) peers[{}, {}]", self.id, self.source_peer_id, self.target_peer_id)
    }
}

/// Copies both directions until each side finishes; an error in either
/// direction tears down both streams.
async fn splice(a: Arc<Stream>, b: Arc<Stream>) {
    let copy = |from: Arc<Stream>, to: Arc<Stream>| async move {
        match from.pipe_to(&to).await {
            Ok(bytes) => debug!(from = %from.id(), to = %to.id(), bytes, "relay direction finished"),
            Err(e) => {
                debug!(from = %from.id(), to = %to.id(), error = %e, "relay direction failed");
                from.close().await;
                to.close().await;
            }
        }
    };
    tokio::join!(copy(Arc::clone(&a), Arc::clone(&b)), copy(Arc::clone(&b), Arc::clone(&a)));
    a.close().await;
    b.close().await;
}

// ============================================================================
// Server
// ============================================================================

pub struct RelayServer {
    me: Weak<RelayServer>,
    endpoint: QuicEndpoint,
    broker: Arc<RegistryClient>,
    server: Arc<RegistryServer>,
    conns: DashMap<String, Arc<RelayConnection>>,
    check_interval: Duration,
    listening: AtomicBool,
    closed: AtomicBool,
    exit: ExitSignal,
}

impl RelayServer {
    /// Binds the relay endpoint and prepares the broker registration. Nothing
    /// is accepted until [`listen`](Self::listen).
    pub async fn new(config: RelayServerConfig) -> Result<Arc<Self>> {
        let endpoint = QuicEndpoint::bind(config.addr, true).await?;
        let port = endpoint.local_addr().port().to_string();
        let broker = RegistryClient::new(RegistryClientConfig {
            tag: TAG_RELAY.to_string(),
            server_addr: config.broker_addr,
            connect_tries: 0,
            reconnect_tries: BROKER_RECONNECT_TRIES,
            token: config.broker_token.clone(),
            data: metadata([(KEY_PORT, port.as_str()), (KEY_TAGS, TAG_RELAY)]),
            unmarshaler: None,
        })
        .await?;

        let relay = Arc::new_cyclic(|me: &Weak<RelayServer>| {
            let server_config = RegistryServerConfig {
                tag: TAG_RELAY.to_string(),
                addr: endpoint.local_addr(),
                unmarshaler: None,
            };
            let validator = Arc::new(RelayValidator { relay: me.clone() });
            Self {
                me: me.clone(),
                server: RegistryServer::with_endpoint(server_config, endpoint.clone(), validator),
                endpoint,
                broker,
                conns: DashMap::new(),
                check_interval: config.check_interval,
                listening: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                exit: ExitSignal::new(),
            }
        });
        relay.register_handlers().await?;
        Ok(relay)
    }

    async fn register_handlers(&self) -> Result<()> {
        let me = self.me.clone();
        self.server.register_handler(
            P2P_RELAY_AWAIT,
            message_handler(move |client, msg| {
                let me = me.clone();
                async move {
                    if let Some(relay) = me.upgrade() {
                        relay.handle_await(client, msg).await;
                    }
                }
            }),
        )?;

        let me = self.me.clone();
        self.server.register_handler(
            P2P_RELAY_OPEN_STREAM,
            message_handler(move |client, msg| {
                let me = me.clone();
                async move {
                    if let Some(relay) = me.upgrade() {
                        relay.handle_open_stream(client, msg).await;
                    }
                }
            }),
        )?;

        let me = self.me.clone();
        self.server
            .set_connected_hook(client_hook(move |client| {
                let me = me.clone();
                async move {
                    let Some(relay) = me.upgrade() else { return };
                    if let Ok(conn) = relay.connection_for(&client) {
                        conn.publish(client.id());
                    }
                }
            }))
            .await;

        let me = self.me.clone();
        self.server
            .set_disconnected_hook(client_hook(move |client| {
                let me = me.clone();
                async move {
                    let Some(relay) = me.upgrade() else { return };
                    if let Ok(conn) = relay.connection_for(&client) {
                        relay.close_connection(conn.id(), "Peer disconnected").await;
                    }
                }
            }))
            .await;
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn broker(&self) -> &Arc<RegistryClient> {
        &self.broker
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }

    /// Starts accepting peers and registers with the broker. Returns once
    /// the broker has accepted the registration.
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        if self.listening.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.server.listen()?;
        if let Err(e) = self.broker.connect().await {
            self.close("Broker unreachable").await;
            return Err(e);
        }

        let me = Arc::downgrade(self);
        let broker_exit = self.broker.exited();
        let server_exit = self.server.exited();
        tokio::spawn(async move {
            tokio::select! {
                _ = broker_exit.wait() => {}
                _ = server_exit.wait() => {}
            }
            if let Some(relay) = me.upgrade() {
                relay.close("Relay server shutdown").await;
            }
        });
        info!(addr = %self.local_addr(), broker = %self.broker.server_addr(), "relay server listening");
        Ok(())
    }

    fn connection_for(&self, client: &ServerClient) -> Result<Arc<RelayConnection>> {
        let conn_id = match client.meta().map(|m| &m.ctx) {
            Some(ClientContext::Relay { connection_id, .. }) => connection_id,
            _ => bail!("client has no relay context"),
        };
        self.conns
            .get(conn_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| anyhow!("connection not found"))
    }

    /// Asks the broker to vouch for a connecting peer.
    async fn validate_with_broker(&self, request: &ClientValidateData) -> Result<P2pRelayConnectionData> {
        let reply = self
            .broker
            .send(Message::with_ack(P2P_RELAY_VALIDATE, request.clone(), REQUEST_TIMEOUT))
            .await?
            .ok_or_else(|| anyhow!("relay validation got no reply"))?;
        let data = reply.body::<P2pRelayConnectionData>()?;
        if !data.status {
            bail!("{}", data.message);
        }
        Ok(data.clone())
    }

    fn connection_or_insert(&self, data: &P2pRelayConnectionData) -> Arc<RelayConnection> {
        let entry = self.conns.entry(data.id.clone()).or_insert_with(|| {
            let conn = RelayConnection::new(data, Arc::downgrade(&self.server));
            self.start_ticker(&conn);
            info!(conn = %conn, "relay connection created");
            conn
        });
        Arc::clone(entry.value())
    }

    fn start_ticker(&self, conn: &Arc<RelayConnection>) {
        let me = self.me.clone();
        let weak = Arc::downgrade(conn);
        let ticker = Ticker::start(self.check_interval, move || {
            let me = me.clone();
            let weak = weak.clone();
            async move {
                let (Some(relay), Some(conn)) = (me.upgrade(), weak.upgrade()) else { return };
                if conn.is_closed() {
                    return;
                }
                if let Err(e) = relay.check_with_broker(&conn).await {
                    error!(conn = %conn, error = %e, "broker no longer vouches for connection");
                    // Closing drops this ticker; run it outside the ticker task.
                    tokio::spawn(async move { relay.close_connection(conn.id(), "Liveness check failed").await });
                }
            }
        });
        if let Ok(mut slot) = conn.ticker.lock() {
            *slot = Some(ticker);
        }
    }

    async fn check_with_broker(&self, conn: &RelayConnection) -> Result<()> {
        let probe = P2pConnectionStatus { id: conn.id.clone(), ..P2pConnectionStatus::default() };
        let reply = self
            .broker
            .send(Message::with_ack(P2P_CONNECTION_STATUS, probe, REQUEST_TIMEOUT))
            .await?
            .ok_or_else(|| anyhow!("status probe got no reply"))?;
        let status = reply.body::<P2pConnectionStatus>()?;
        if !status.status {
            bail!("{}", status.message);
        }
        Ok(())
    }

    async fn handle_await(self: Arc<Self>, client: Arc<ServerClient>, msg: Message) {
        info!(client = %client, "awaiting peer connection");
        let result = match self.connection_for(&client) {
            Ok(conn) => conn.await_peer(&client.id()).await,
            Err(e) => Err(e),
        };
        let body = match result {
            Ok(()) => {
                info!(client = %client, "peer connected to relay");
                P2pRelayStreamInfo { status: true, message: "Ok".into(), id: String::new() }
            }
            Err(e) => {
                error!(client = %client, error = %e, "error awaiting peer connection");
                P2pRelayStreamInfo { status: false, message: e.to_string(), id: String::new() }
            }
        };
        if let Ok(reply) = msg.reply(P2P_RELAY_STREAM_INFO, body) {
            if let Err(e) = client.send(reply).await {
                debug!(client = %client, error = %e, "failed to send await result");
            }
        }
    }

    async fn handle_open_stream(self: Arc<Self>, client: Arc<ServerClient>, msg: Message) {
        let result: Result<String> = async {
            let request = msg.body::<P2pRelayOpenStream>()?;
            let conn = self.connection_for(&client)?;
            conn.open_stream(&client, request.metadata.clone()).await
        }
        .await;
        let body = match result {
            Ok(id) => {
                info!(client = %client, stream = %id, "opened peer stream");
                P2pRelayStreamInfo { status: true, message: "Ok".into(), id }
            }
            Err(e) => {
                error!(client = %client, error = %e, "error opening peer stream");
                P2pRelayStreamInfo { status: false, message: e.to_string(), id: String::new() }
            }
        };
        if let Ok(reply) = msg.reply(P2P_RELAY_STREAM_INFO, body) {
            if let Err(e) = client.send(reply).await {
                debug!(client = %client, error = %e, "failed to send stream info");
            }
        }
    }

    pub async fn close_connection(&self, id: &str, reason: &str) {
        if let Some((_, conn)) = self.conns.remove(id) {
            conn.close(reason).await;
        }
    }

    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let conns: Vec<_> = self.conns.iter().map(|c| Arc::clone(c.value())).collect();
        self.conns.clear();
        for conn in conns {
            conn.close(reason).await;
        }
        self.broker.close(0, reason).await;
        self.server.close(0, reason).await;
        self.endpoint.close(0, reason);
        self.exit.fire();
        warn!(reason, "relay server closed");
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Admits a peer once the broker confirms it belongs to the connection it
/// names. Runs under the registry server's validation lock.
struct RelayValidator {
    relay: Weak<RelayServer>,
}

#[async_trait]
impl ClientValidator for RelayValidator {
    async fn validate(&self, addr: SocketAddr, request: &ClientValidateData) -> Result<ClientData> {
        let relay = self.relay.upgrade().ok_or_else(|| anyhow!("relay closed"))?;
        if relay.is_closed() {
            bail!("relay closed");
        }
        let data = relay.validate_with_broker(request).await.map_err(|e| {
            error!(addr = %addr, error = %e, "error accepting client");
            e
        })?;
        let conn = relay.connection_or_insert(&data);

        Ok(ClientData {
            id: conn.client_id(&data.peer.id),
            address: addr.to_string(),
            tag: data.id.clone(),
            data: request.data.clone(),
            ctx: ClientContext::Relay {
                connection_id: data.id.clone(),
                source_peer_id: data.source_peer.id.clone(),
                target_peer_id: data.target_peer.id.clone(),
            },
            ..ClientData::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::P2pPeerData;

    /// A connection between alice and bob with no registry behind it, so no
    /// counterpart is ever found by lookup.
    fn detached_connection() -> Arc<RelayConnection> {
        let data = P2pRelayConnectionData {
            id: "c1".into(),
            source_peer: P2pPeerData { id: "alice".into(), ..P2pPeerData::default() },
            target_peer: P2pPeerData { id: "bob".into(), ..P2pPeerData::default() },
            ..P2pRelayConnectionData::default()
        };
        RelayConnection::new(&data, Weak::new())
    }

    #[test]
    fn client_ids_pair_the_two_peers() {
        let conn = detached_connection();
        assert_eq!(conn.client_id("alice"), "alice:c1");
        assert_eq!(conn.counterpart_id("alice:c1").unwrap(), "bob:c1");
        assert_eq!(conn.counterpart_id("bob:c1").unwrap(), "alice:c1");
        assert!(conn.counterpart_id("mallory:c1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn await_peer_fails_after_timeout() {
        let conn = detached_connection();
        let started = tokio::time::Instant::now();
        let err = conn.await_peer("alice:c1").await.unwrap_err();
        assert!(started.elapsed() >= AWAIT_PEER_TIMEOUT);
        assert!(err.to_string().contains("error awaiting peer"), "{}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn await_peer_resolves_when_counterpart_arrives() {
        let conn = detached_connection();
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.await_peer("alice:c1").await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        conn.publish("mallory:c1".into());
        conn.publish("bob:c1".into());
        waiter.await.unwrap().expect("counterpart arrival must end the wait");
    }

    #[tokio::test(start_paused = true)]
    async fn close_ends_await_peer() {
        let conn = detached_connection();
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.await_peer("bob:c1").await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        conn.close("test").await;
        assert!(conn.is_closed());
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("connection closed"), "{}", err);
    }

    #[tokio::test]
    async fn strangers_cannot_await() {
        let conn = detached_connection();
        assert!(conn.await_peer("mallory:c1").await.is_err());
    }
}
