//! # Registry Server
//!
//! Accepts QUIC sessions, validates each client through a pluggable
//! [`ClientValidator`], and keeps a registry of validated clients by id.
//!
//! ## Session lifecycle
//!
//! ```text
//! accept session ─► accept control stream ─► message loop
//!                                                │
//!            network-client-validate ◄───────────┘
//!                     │ ok                 │ err
//!                     ▼                    ▼
//!        register, connected hook     close 401
//!        start stream-accept loop
//! ```
//!
//! A client that has not validated within [`CLIENT_INIT_TIMEOUT`] is closed
//! with code 401. Any message other than validate, ping or search before
//! validation also closes the client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::client::CLOSE_UNAVAILABLE;
use crate::message::{new_message_id, Message};
use crate::model::{
    ClientData, ClientSearch, ClientValidateData, Clients, Metadata, Unmarshal, UnmarshalChain, CLIENTS,
    CLIENT_DATA, CLIENT_PING, CLIENT_SEARCH, CLIENT_VALIDATE,
};
use crate::stream::{ClientHandle, Stream, StreamHandler};
use crate::transport::QuicEndpoint;
use crate::util::{spawn_supervised, BoxFuture, ExitSignal, Ticker};

/// A client must validate within this window after connecting.
pub const CLIENT_INIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Close code for failed or missing validation.
pub const CLOSE_UNAUTHORIZED: u32 = 401;

/// Close code for protocol failures on the control stream.
pub const CLOSE_BAD_REQUEST: u32 = 400;

/// Decides whether a connecting client may register, and under which id.
#[async_trait]
pub trait ClientValidator: Send + Sync {
    async fn validate(&self, addr: SocketAddr, request: &ClientValidateData) -> Result<ClientData>;
}

/// Handler for an application message type received from a client.
pub type MessageHandler = Arc<dyn Fn(Arc<ServerClient>, Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Connected/disconnected notification.
pub type ClientHook = Arc<dyn Fn(Arc<ServerClient>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Arc<ServerClient>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |client, msg| Box::pin(f(client, msg)))
}

/// Wraps an async closure as a [`ClientHook`].
pub fn client_hook<F, Fut>(f: F) -> ClientHook
where
    F: Fn(Arc<ServerClient>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |client| Box::pin(f(client)))
}

#[derive(Clone)]
pub struct RegistryServerConfig {
    /// Label used in log lines.
    pub tag: String,
    /// Listen address when the server binds its own endpoint.
    pub addr: SocketAddr,
    /// Decoder for application content types.
    pub unmarshaler: Option<Arc<dyn Unmarshal>>,
}

impl Default for RegistryServerConfig {
    fn default() -> Self {
        Self {
            tag: "default".to_string(),
            addr: SocketAddr::from(([0, 0, 0, 0], 10000)),
            unmarshaler: None,
        }
    }
}

impl std::fmt::Debug for RegistryServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryServerConfig")
            .field("tag", &self.tag)
            .field("addr", &self.addr)
            .finish()
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct RegistryServer {
    tag: String,
    endpoint: QuicEndpoint,
    /// The endpoint belongs to someone else and is left open on close.
    managed: bool,
    decoders: UnmarshalChain,
    validator: Arc<dyn ClientValidator>,
    clients: DashMap<String, Arc<ServerClient>>,
    handlers: DashMap<String, MessageHandler>,
    on_connected: RwLock<Option<ClientHook>>,
    on_disconnected: RwLock<Option<ClientHook>>,
    stream_handler: RwLock<Option<StreamHandler>>,
    validate_lock: Mutex<()>,
    listening: AtomicBool,
    closed: AtomicBool,
    exit: ExitSignal,
}

impl RegistryServer {
    /// Creates a server on its own endpoint bound to `config.addr`.
    pub async fn new(config: RegistryServerConfig, validator: Arc<dyn ClientValidator>) -> Result<Arc<Self>> {
        let endpoint = QuicEndpoint::bind(config.addr, true).await?;
        Ok(Self::build(config, endpoint, false, validator))
    }

    /// Creates a server that accepts on an endpoint owned by someone else,
    /// typically a [`RegistryClient`](crate::client::RegistryClient) sharing
    /// its UDP socket.
    pub fn with_endpoint(
        config: RegistryServerConfig,
        endpoint: QuicEndpoint,
        validator: Arc<dyn ClientValidator>,
    ) -> Arc<Self> {
        Self::build(config, endpoint, true, validator)
    }

    fn build(
        config: RegistryServerConfig,
        endpoint: QuicEndpoint,
        managed: bool,
        validator: Arc<dyn ClientValidator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tag: config.tag,
            endpoint,
            managed,
            decoders: UnmarshalChain::new(config.unmarshaler),
            validator,
            clients: DashMap::new(),
            handlers: DashMap::new(),
            on_connected: RwLock::new(None),
            on_disconnected: RwLock::new(None),
            stream_handler: RwLock::new(None),
            validate_lock: Mutex::new(()),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exit: ExitSignal::new(),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }

    pub fn validator(&self) -> Arc<dyn ClientValidator> {
        Arc::clone(&self.validator)
    }

    /// Registers a server-level handler. Fails if the type already has one.
    pub fn register_handler(&self, msg_type: &str, handler: MessageHandler) -> Result<()> {
        match self.handlers.entry(msg_type.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                bail!("handler for message type ({}) already exists", msg_type)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    pub async fn set_connected_hook(&self, hook: ClientHook) {
        *self.on_connected.write().await = Some(hook);
    }

    pub async fn set_disconnected_hook(&self, hook: ClientHook) {
        *self.on_disconnected.write().await = Some(hook);
    }

    pub async fn set_stream_handler(&self, handler: StreamHandler) {
        *self.stream_handler.write().await = Some(handler);
    }

    pub fn get_client(&self, id: &str) -> Result<Arc<ServerClient>> {
        self.clients
            .get(id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| anyhow!("client not found: {}", id))
    }

    /// Registered clients whose tag set contains `tag`.
    pub fn get_clients_with_tag(&self, tag: &str) -> Vec<Arc<ServerClient>> {
        self.clients
            .iter()
            .filter(|entry| entry.value().meta().is_some_and(|m| m.tags.contains_key(tag)))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Starts the accept loop.
    pub fn listen(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            bail!("server closed");
        }
        if self.listening.swap(true, Ordering::AcqRel) {
            bail!("server already listening");
        }

        let server = Arc::clone(self);
        tokio::spawn(async move { server.accept_loop().await });
        info!(tag = %self.tag, addr = %self.local_addr(), "registry server started");
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>) {
        let exit = self.exit.subscribe();
        tokio::pin!(exit);
        loop {
            let incoming = tokio::select! {
                _ = &mut exit => return,
                incoming = self.endpoint.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                debug!(tag = %self.tag, "endpoint closed, accept loop exiting");
                return;
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_session(incoming).await {
                    debug!(tag = %server.tag, error = %e, "session setup failed");
                }
            });
        }
    }

    async fn handle_session(self: &Arc<Self>, incoming: quinn::Incoming) -> Result<()> {
        let connection = incoming.await.context("handshake failed")?;
        let (send, recv) = tokio::time::timeout(CLIENT_INIT_TIMEOUT, connection.accept_bi())
            .await
            .map_err(|_| anyhow!("no control stream from {}", connection.remote_address()))?
            .context("failed to accept control stream")?;

        let client = ServerClient::new(self, connection, Channel::from_quic(send, recv, self.decoders.clone()));
        info!(tag = %self.tag, addr = %client.addr, "client session established");
        spawn_supervised("server-client-messages", Arc::clone(&client).message_loop(), client.fault_handler());
        Ok(())
    }

    async fn validate(&self, client: &Arc<ServerClient>, request: &ClientValidateData) -> Result<ClientData> {
        let _guard = self.validate_lock.lock().await;

        let data = self.validator.validate(client.addr, request).await?;
        if data.id.is_empty() {
            bail!("validator returned an empty client id");
        }
        client
            .meta
            .set(data.clone())
            .map_err(|_| anyhow!("client already initialized"))?;

        if let Some(old) = self.clients.insert(data.id.clone(), Arc::clone(client)) {
            if old.session_id != client.session_id {
                warn!(tag = %self.tag, client = %old, "closing previous session for client id");
                old.close(CLOSE_BAD_REQUEST, "New client connected").await;
            }
        }
        Ok(data)
    }

    /// Closes every client and stops accepting. Leaves a shared endpoint
    /// open.
    pub async fn close(&self, code: u32, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let clients: Vec<_> = self.clients.iter().map(|e| Arc::clone(e.value())).collect();
        self.clients.clear();
        for client in clients {
            client.close(code, reason).await;
        }
        if !self.managed {
            self.endpoint.close(code, reason);
        }
        self.exit.fire();
        warn!(tag = %self.tag, reason, "registry server shut down");
    }
}

// ============================================================================
// Server-side client
// ============================================================================

/// Server-side view of one connected client session.
pub struct ServerClient {
    me: Weak<ServerClient>,
    server: Weak<RegistryServer>,
    session_id: String,
    connection: quinn::Connection,
    channel: Arc<Channel>,
    decoders: UnmarshalChain,
    addr: SocketAddr,
    meta: OnceLock<ClientData>,
    handlers: DashMap<String, MessageHandler>,
    streams: DashMap<String, Arc<Stream>>,
    init_ticker: std::sync::Mutex<Option<Ticker>>,
    active: AtomicBool,
    closed: AtomicBool,
    exit: ExitSignal,
}

impl ServerClient {
    fn new(server: &Arc<RegistryServer>, connection: quinn::Connection, channel: Arc<Channel>) -> Arc<Self> {
        let mut session = [0u8; 16];
        let session_id = match getrandom::getrandom(&mut session) {
            Ok(()) => hex::encode(session),
            Err(_) => new_message_id(),
        };

        let client = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            server: Arc::downgrade(server),
            session_id,
            addr: connection.remote_address(),
            connection,
            channel,
            decoders: server.decoders.clone(),
            meta: OnceLock::new(),
            handlers: DashMap::new(),
            streams: DashMap::new(),
            init_ticker: std::sync::Mutex::new(None),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exit: ExitSignal::new(),
        });

        let weak = Arc::downgrade(&client);
        let ticker = Ticker::start(CLIENT_INIT_TIMEOUT, move || {
            let weak = weak.clone();
            async move {
                let Some(client) = weak.upgrade() else { return };
                if client.is_initialized() || client.is_closed() {
                    return;
                }
                // Closing stops this ticker; run it outside the ticker task.
                tokio::spawn(async move {
                    client.close(CLOSE_UNAUTHORIZED, "Client initialization incomplete").await;
                });
            }
        });
        if let Ok(mut slot) = client.init_ticker.lock() {
            *slot = Some(ticker);
        }
        client
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Validated registration record, once the client has validated.
    pub fn meta(&self) -> Option<&ClientData> {
        self.meta.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.meta.get().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the session as claimed by an application-level owner.
    pub fn mark_active(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn connection(&self) -> &quinn::Connection {
        &self.connection
    }

    /// Registers a handler that takes precedence over server-level handlers
    /// for this client only.
    pub fn register_handler(&self, msg_type: &str, handler: MessageHandler) -> Result<()> {
        if self.handlers.contains_key(msg_type) {
            bail!("handler with message type ({}) already exists", msg_type);
        }
        self.handlers.insert(msg_type.to_string(), handler);
        Ok(())
    }

    pub fn get_stream(&self, id: &str) -> Option<Arc<Stream>> {
        self.streams.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Closes the session when one of its loops panics.
    fn fault_handler(&self) -> impl FnOnce() + Send + 'static {
        let me = self.me.clone();
        move || {
            if let Some(client) = me.upgrade() {
                tokio::spawn(async move { client.close(CLOSE_UNAVAILABLE, "session task panicked").await });
            }
        }
    }

    fn track_stream(&self, stream: Arc<Stream>) {
        self.streams.insert(stream.id().to_string(), Arc::clone(&stream));
        let me = self.me.clone();
        let exited = stream.exited();
        tokio::spawn(async move {
            exited.wait().await;
            if let Some(client) = me.upgrade() {
                client.streams.remove(stream.id());
            }
        });
    }

    async fn close_all_streams(&self) {
        let streams: Vec<_> = self.streams.iter().map(|e| Arc::clone(e.value())).collect();
        self.streams.clear();
        for stream in streams {
            stream.close().await;
        }
    }

    async fn message_loop(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                return;
            }
            let msg = match self.channel.read(true).await {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(client = %self, error = %e, "closing message stream");
                    self.close(CLOSE_BAD_REQUEST, &e.to_string()).await;
                    return;
                }
            };
            let Some(server) = self.server.upgrade() else {
                return;
            };

            match msg.msg_type() {
                CLIENT_VALIDATE => {
                    if self.is_initialized() {
                        warn!(client = %self, "already initialized");
                        continue;
                    }
                    if !self.handle_validate(&server, msg).await {
                        return;
                    }
                }
                CLIENT_PING => debug!(client = %self, "ping"),
                CLIENT_SEARCH => self.handle_search(&server, msg).await,
                other => {
                    if !self.is_initialized() {
                        self.close(CLOSE_UNAUTHORIZED, "Initialization incomplete").await;
                        return;
                    }
                    let handler = self
                        .handlers
                        .get(other)
                        .map(|h| Arc::clone(h.value()))
                        .or_else(|| server.handlers.get(other).map(|h| Arc::clone(h.value())));
                    match handler {
                        Some(handler) => {
                            tokio::spawn(handler(Arc::clone(&self), msg));
                        }
                        None => warn!(client = %self, msg = %msg, "message handler not found"),
                    }
                }
            }
        }
    }

    /// Returns false when validation failed and the client was closed.
    async fn handle_validate(self: &Arc<Self>, server: &Arc<RegistryServer>, msg: Message) -> bool {
        let request = match msg.body::<ClientValidateData>() {
            Ok(request) => request.clone(),
            Err(e) => {
                self.close(CLOSE_UNAUTHORIZED, &format!("Initialization Failed: {}", e)).await;
                return false;
            }
        };

        let result = server.validate(self, &request).await;
        let data = match &result {
            Ok(data) => ClientData { status: true, message: "Ok".into(), ..data.clone() },
            Err(e) => ClientData { status: false, message: e.to_string(), ..ClientData::default() },
        };
        if let Ok(reply) = msg.reply(CLIENT_DATA, data) {
            if let Err(e) = self.channel.send(reply).await {
                debug!(client = %self, error = %e, "failed to send validation result");
            }
        }

        if let Err(e) = result {
            self.close(CLOSE_UNAUTHORIZED, &format!("Initialization Failed: {}", e)).await;
            return false;
        }
        if let Ok(mut slot) = self.init_ticker.lock() {
            slot.take();
        }
        info!(tag = %server.tag, client = %self, "client initialized");

        if let Some(hook) = server.on_connected.read().await.clone() {
            tokio::spawn(hook(Arc::clone(self)));
        }
        spawn_supervised("server-client-streams", Arc::clone(self).stream_loop(), self.fault_handler());
        true
    }

    async fn handle_search(&self, server: &RegistryServer, msg: Message) {
        let result = msg.body::<ClientSearch>().map_err(anyhow::Error::from).and_then(|params| {
            if !params.id.is_empty() {
                Ok(vec![server.get_client(&params.id)?.id()])
            } else if !params.tag.is_empty() {
                let found: Vec<String> = server.get_clients_with_tag(&params.tag).iter().map(|c| c.id()).collect();
                if found.is_empty() {
                    bail!("search yielded no results");
                }
                Ok(found)
            } else {
                bail!("invalid search params")
            }
        });

        let body = match result {
            Ok(clients) => {
                debug!(client = %self, results = clients.len(), "search clients");
                Clients { status: true, message: "Ok".into(), clients }
            }
            Err(e) => {
                debug!(client = %self, error = %e, "search clients failed");
                Clients { status: false, message: e.to_string(), clients: Vec::new() }
            }
        };
        if let Ok(reply) = msg.reply(CLIENTS, body) {
            if let Err(e) = self.channel.send(reply).await {
                debug!(client = %self, error = %e, "failed to send search result");
            }
        }
    }

    async fn stream_loop(self: Arc<Self>) {
        let exit = self.exit.subscribe();
        tokio::pin!(exit);
        loop {
            let accepted = tokio::select! {
                _ = &mut exit => return,
                accepted = self.connection.accept_bi() => accepted,
            };
            let (send, recv) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(client = %self, error = %e, "stream accept loop ended");
                    return;
                }
            };

            let client = Arc::clone(&self);
            tokio::spawn(async move {
                let tracker = Arc::clone(&client);
                let stream = match Stream::accept(send, recv, client.decoders.clone(), move |s| {
                    tracker.track_stream(s)
                })
                .await
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(client = %client, error = %e, "error accepting stream");
                        return;
                    }
                };
                debug!(client = %client, stream = %stream.id(), "accepted stream");

                let handler = match client.server.upgrade() {
                    Some(server) => server.stream_handler.read().await.clone(),
                    None => None,
                };
                match handler {
                    Some(handler) => handler(client as Arc<dyn ClientHandle>, stream).await,
                    None => debug!(stream = %stream.id(), "no stream handler, stream kept for lookup"),
                }
            });
        }
    }

    pub async fn open_stream(&self, data: Metadata) -> Result<Arc<Stream>> {
        if self.is_closed() {
            bail!("client closed");
        }
        let stream = Stream::open(&self.connection, data, self.decoders.clone()).await?;
        self.track_stream(Arc::clone(&stream));
        debug!(client = %self, stream = %stream.id(), "opened stream");
        Ok(stream)
    }

    pub async fn close_stream(&self, id: &str) {
        if let Some((_, stream)) = self.streams.remove(id) {
            stream.close().await;
        }
    }

    pub async fn send(&self, msg: Message) -> Result<Option<Message>> {
        Ok(self.channel.send(msg).await?)
    }

    /// Idempotent. Removes the registry entry only if it still points at this
    /// session.
    pub async fn close(&self, code: u32, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.init_ticker.lock() {
            slot.take();
        }
        self.close_all_streams().await;
        self.channel.close().await;
        self.connection.close(quinn::VarInt::from_u32(code), reason.as_bytes());
        self.handlers.clear();
        self.exit.fire();

        if let Some(server) = self.server.upgrade() {
            if let Some(meta) = self.meta.get() {
                server.clients.remove_if(&meta.id, |_, c| c.session_id == self.session_id);
            }
            let hook = server.on_disconnected.read().await.clone();
            if let (Some(hook), Some(me)) = (hook, self.me.upgrade()) {
                tokio::spawn(hook(me));
            }
        }
        warn!(client = %self, code, reason, "client connection closed");
    }
}

impl std::fmt::Display for ServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id = self.meta.get().map(|m| m.id.as_str()).unwrap_or("");
        write!(f, "id({}) with addr({})", id, self.addr)
    }
}

#[async_trait]
impl ClientHandle for ServerClient {
    fn id(&self) -> String {
        self.meta.get().map(|m| m.id.clone()).unwrap_or_default()
    }

    async fn send(&self, msg: Message) -> Result<Option<Message>> {
        ServerClient::send(self, msg).await
    }

    async fn open_stream(&self, data: Metadata) -> Result<Arc<Stream>> {
        ServerClient::open_stream(self, data).await
    }

    async fn close_stream(&self, id: &str) {
        ServerClient::close_stream(self, id).await
    }

    async fn close(&self, code: u32, reason: &str) {
        ServerClient::close(self, code, reason).await
    }

    fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::client::{RegistryClient, RegistryClientConfig};

    struct TokenIsId;

    #[async_trait]
    impl ClientValidator for TokenIsId {
        async fn validate(&self, addr: SocketAddr, request: &ClientValidateData) -> Result<ClientData> {
            Ok(ClientData { id: request.token.clone(), address: addr.to_string(), ..ClientData::default() })
        }
    }

    async fn server_with_client(token: &str) -> (Arc<RegistryServer>, Arc<RegistryClient>) {
        let config = RegistryServerConfig { addr: "127.0.0.1:0".parse().unwrap(), ..RegistryServerConfig::default() };
        let server = RegistryServer::new(config, Arc::new(TokenIsId)).await.unwrap();
        server.listen().unwrap();
        let client = RegistryClient::new(RegistryClientConfig {
            server_addr: server.local_addr(),
            connect_tries: 1,
            reconnect_tries: 1,
            token: token.to_string(),
            ..RegistryClientConfig::default()
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(10), client.connect()).await.unwrap().unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn panicking_session_task_unregisters_the_client() {
        let (server, client) = server_with_client("alice").await;
        let (tx, mut gone) = mpsc::unbounded_channel();
        server
            .set_disconnected_hook(client_hook(move |c| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(c.id());
                }
            }))
            .await;
        let session = server.get_client("alice").unwrap();

        spawn_supervised("boom", async { panic!("session loop bug") }, session.fault_handler());

        let id = tokio::time::timeout(Duration::from_secs(5), gone.recv()).await.unwrap().unwrap();
        assert_eq!(id, "alice");
        assert!(session.is_closed());
        // The client may already have reconnected under a fresh session.
        let current = server.get_client("alice").ok();
        assert!(current.map_or(true, |c| c.session_id() != session.session_id()));

        client.close(0, "done").await;
        server.close(0, "done").await;
    }

    #[tokio::test]
    async fn search_answers_from_the_registry() {
        let (server, client) = server_with_client("alice").await;

        let found = client.search_clients(ClientSearch { id: "alice".into(), tag: String::new() }).await.unwrap();
        assert_eq!(found, vec!["alice".to_string()]);
        assert!(client.search_clients(ClientSearch::default()).await.is_err(), "empty search params");

        client.close(0, "done").await;
        server.close(0, "done").await;
    }
}
