//! # Registry Client
//!
//! Dials a [`RegistryServer`](crate::server::RegistryServer), validates with a
//! token, and keeps the session alive:
//!
//! - a ping every [`PING_INTERVAL`],
//! - a message loop dispatching inbound messages to registered handlers,
//! - a stream-accept loop for server-opened streams.
//!
//! When the message loop ends on a client that was not closed, the client
//! reconnects with the configured retry budget and closes with code 503 once
//! the budget is spent. A server that explicitly rejects the validation data
//! ends the retry loop early.
//!
//! Each successful dial starts a new session generation; loops belonging to a
//! superseded generation exit on their own.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::message::{Message, REQUEST_TIMEOUT};
use crate::model::{
    ClientData, ClientPing, ClientSearch, ClientValidateData, Clients, Metadata, Unmarshal, UnmarshalChain,
    CLIENT_PING, CLIENT_SEARCH, CLIENT_VALIDATE,
};
use crate::stream::{ClientHandle, Stream, StreamHandler};
use crate::transport::QuicEndpoint;
use crate::util::{spawn_supervised, BoxFuture, ExitSignal};

/// Interval between keep-alive pings to the server.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Time allowed for the validation exchange.
pub const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between connection attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Close code used when the reconnect budget is exhausted.
pub const CLOSE_UNAVAILABLE: u32 = 503;

/// Handler for a message type received from the server.
pub type ClientMessageHandler = Arc<dyn Fn(Arc<RegistryClient>, Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Decides whether attempt number `tries` (zero-based) may run.
pub type RetryPredicate = Arc<dyn Fn(u32) -> bool + Send + Sync>;

/// Called once with the close reason.
pub type ClosedHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Wraps an async closure as a [`ClientMessageHandler`].
pub fn client_message_handler<F, Fut>(f: F) -> ClientMessageHandler
where
    F: Fn(Arc<RegistryClient>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |client, msg| Box::pin(f(client, msg)))
}

#[derive(Clone)]
pub struct RegistryClientConfig {
    /// Label used in log lines.
    pub tag: String,
    pub server_addr: SocketAddr,
    /// Dial attempts for [`RegistryClient::connect`]; 0 retries forever.
    pub connect_tries: u32,
    /// Dial attempts after a lost session; 0 retries forever.
    pub reconnect_tries: u32,
    /// Presented to the server's validator. Must not be empty.
    pub token: String,
    pub data: Metadata,
    pub unmarshaler: Option<Arc<dyn Unmarshal>>,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            tag: "client".to_string(),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 10000)),
            connect_tries: 0,
            reconnect_tries: 0,
            token: String::new(),
            data: Metadata::new(),
            unmarshaler: None,
        }
    }
}

impl std::fmt::Debug for RegistryClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClientConfig")
            .field("tag", &self.tag)
            .field("server_addr", &self.server_addr)
            .field("connect_tries", &self.connect_tries)
            .field("reconnect_tries", &self.reconnect_tries)
            .field("data", &self.data)
            .finish()
    }
}

struct Session {
    generation: u64,
    connection: quinn::Connection,
    channel: Arc<Channel>,
}

impl Session {
    async fn close(&self, code: u32, reason: &str) {
        self.channel.close().await;
        self.connection.close(quinn::VarInt::from_u32(code), reason.as_bytes());
    }
}

pub struct RegistryClient {
    me: Weak<RegistryClient>,
    config: RegistryClientConfig,
    endpoint: QuicEndpoint,
    /// The endpoint is shared and stays open when this client closes.
    managed: bool,
    decoders: UnmarshalChain,

    session: RwLock<Option<Arc<Session>>>,
    generation: AtomicU64,
    lifecycle: Mutex<()>,
    data: std::sync::RwLock<Option<ClientData>>,

    can_connect: std::sync::RwLock<Option<RetryPredicate>>,
    handlers: DashMap<String, ClientMessageHandler>,
    stream_handler: RwLock<Option<StreamHandler>>,
    closed_hook: std::sync::RwLock<Option<ClosedHook>>,

    streams: DashMap<String, Arc<Stream>>,
    stream_added: Notify,

    connected: AtomicBool,
    closed: AtomicBool,
    exit: ExitSignal,
}

impl RegistryClient {
    /// Creates a client on its own ephemeral, non-listening endpoint.
    pub async fn new(config: RegistryClientConfig) -> Result<Arc<Self>> {
        let endpoint = QuicEndpoint::bind_for(&config.server_addr, false).await?;
        Self::build(config, endpoint, false)
    }

    /// Creates a client that dials from an endpoint owned by someone else.
    pub fn with_endpoint(config: RegistryClientConfig, endpoint: QuicEndpoint) -> Result<Arc<Self>> {
        Self::build(config, endpoint, true)
    }

    fn build(config: RegistryClientConfig, endpoint: QuicEndpoint, managed: bool) -> Result<Arc<Self>> {
        if config.token.is_empty() {
            bail!("token cannot be empty");
        }
        let decoders = UnmarshalChain::new(config.unmarshaler.clone());
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            endpoint,
            managed,
            decoders,
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
            data: std::sync::RwLock::new(None),
            can_connect: std::sync::RwLock::new(None),
            handlers: DashMap::new(),
            stream_handler: RwLock::new(None),
            closed_hook: std::sync::RwLock::new(None),
            streams: DashMap::new(),
            stream_added: Notify::new(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exit: ExitSignal::new(),
        }))
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Id assigned by the server on validation; empty before.
    pub fn id(&self) -> String {
        self.client_data().map(|d| d.id).unwrap_or_default()
    }

    /// Last validation reply received from the server.
    pub fn client_data(&self) -> Option<ClientData> {
        self.data.read().ok().and_then(|d| d.clone())
    }

    pub fn tag(&self) -> &str {
        &self.config.tag
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.config.server_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn endpoint(&self) -> &QuicEndpoint {
        &self.endpoint
    }

    /// Token presented to the server on validation.
    pub fn token(&self) -> &str {
        &self.config.token
    }

    /// Data presented to the server on validation.
    pub fn validate_data(&self) -> &Metadata {
        &self.config.data
    }

    pub fn unmarshaler(&self) -> Option<Arc<dyn Unmarshal>> {
        self.config.unmarshaler.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Overrides the attempt predicate used by [`connect`](Self::connect).
    pub fn set_can_connect(&self, predicate: RetryPredicate) {
        if let Ok(mut slot) = self.can_connect.write() {
            *slot = Some(predicate);
        }
    }

    pub fn register_handler(&self, msg_type: &str, handler: ClientMessageHandler) -> Result<()> {
        if self.handlers.contains_key(msg_type) {
            bail!("handler with message type ({}) already exists", msg_type);
        }
        self.handlers.insert(msg_type.to_string(), handler);
        Ok(())
    }

    pub async fn set_stream_handler(&self, handler: StreamHandler) {
        *self.stream_handler.write().await = Some(handler);
    }

    pub fn set_closed_hook(&self, hook: ClosedHook) {
        if let Ok(mut slot) = self.closed_hook.write() {
            *slot = Some(hook);
        }
    }

    fn can_connect(&self, tries: u32) -> bool {
        let custom = self.can_connect.read().ok().and_then(|p| p.clone());
        match custom {
            Some(predicate) => predicate(tries),
            None => self.config.connect_tries == 0 || tries < self.config.connect_tries,
        }
    }

    fn can_reconnect(&self, tries: u32) -> bool {
        self.config.reconnect_tries == 0 || tries < self.config.reconnect_tries
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Dials and validates, retrying per the attempt predicate.
    pub async fn connect(&self) -> Result<()> {
        let guard = self.lifecycle.lock().await;
        if self.is_closed() {
            bail!("client closed");
        }

        let mut last_err = anyhow!("did not try to connect cause of the attempt predicate");
        let mut tries = 0;
        let mut dialed = false;
        while self.can_connect(tries) && !self.is_closed() {
            debug!(tag = %self.config.tag, server = %self.config.server_addr, try_no = tries + 1, "connecting");
            match self.dial().await {
                Ok(()) => {
                    dialed = true;
                    break;
                }
                Err(e) => {
                    warn!(tag = %self.config.tag, server = %self.config.server_addr, error = %e, "could not connect");
                    last_err = e;
                    if self.can_connect(tries + 1) {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
            tries += 1;
        }
        if !dialed {
            return Err(last_err);
        }
        info!(tag = %self.config.tag, server = %self.config.server_addr, "connection established");

        if let Err(e) = self.initialize().await {
            drop(guard);
            self.close(0, &e.to_string()).await;
            return Err(e);
        }
        info!(tag = %self.config.tag, client = %self, "connected");
        Ok(())
    }

    /// Opens a fresh session and control stream, replacing the previous one.
    async fn dial(&self) -> Result<()> {
        self.reset(0, "Reset").await;

        let connection = self.endpoint.dial(self.config.server_addr).await?;
        let (send, recv) = connection.open_bi().await.context("failed to open control stream")?;
        let session = Arc::new(Session {
            generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
            connection,
            channel: Channel::from_quic(send, recv, self.decoders.clone()),
        });

        *self.session.write().await = Some(Arc::clone(&session));
        if self.is_closed() {
            self.reset(0, "Client closed").await;
            bail!("client closed");
        }
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        let session = self.current_session().await?;
        let request = Message::with_ack(
            CLIENT_VALIDATE,
            ClientValidateData { token: self.config.token.clone(), data: self.config.data.clone() },
            VALIDATE_TIMEOUT,
        );
        let reply = session
            .channel
            .send_and_read(request)
            .await
            .context("validation exchange failed")?
            .ok_or_else(|| anyhow!("validation got no reply"))?;
        let data = reply.body::<ClientData>()?.clone();

        let status = data.status;
        let message = data.message.clone();
        if let Ok(mut slot) = self.data.write() {
            *slot = Some(data);
        }
        if !status {
            error!(tag = %self.config.tag, reason = %message, "initialization failed");
            bail!("{}", message);
        }

        let me = self.me.upgrade().ok_or_else(|| anyhow!("client dropped"))?;
        self.spawn_session_tasks(&me, &session);
        self.connected.store(true, Ordering::Release);
        info!(tag = %self.config.tag, client = %self, "initialization complete");
        Ok(())
    }

    fn spawn_session_tasks(&self, me: &Arc<Self>, session: &Arc<Session>) {
        let fault = |me: &Arc<Self>| {
            let me = Arc::clone(me);
            move || {
                tokio::spawn(async move { me.close(CLOSE_UNAVAILABLE, "session task panicked").await });
            }
        };
        spawn_supervised("client-ping", Arc::clone(me).ping_loop(Arc::clone(session)), fault(me));
        spawn_supervised("client-messages", Arc::clone(me).message_loop(Arc::clone(session)), fault(me));
        spawn_supervised("client-streams", Arc::clone(me).stream_loop(Arc::clone(session)), fault(me));
    }

    fn is_current(&self, session: &Session) -> bool {
        !self.is_closed() && self.generation.load(Ordering::Acquire) == session.generation
    }

    async fn current_session(&self) -> Result<Arc<Session>> {
        self.session.read().await.clone().ok_or_else(|| anyhow!("not connected"))
    }

    async fn ping_loop(self: Arc<Self>, session: Arc<Session>) {
        loop {
            let ping = Message::new(CLIENT_PING, ClientPing { time: format!("{:?}", std::time::SystemTime::now()) });
            if let Err(e) = session.channel.send(ping).await {
                warn!(tag = %self.config.tag, error = %e, "error sending ping to server");
                return;
            }
            tokio::time::sleep(PING_INTERVAL).await;
            if !self.is_current(&session) {
                return;
            }
        }
    }

    async fn message_loop(self: Arc<Self>, session: Arc<Session>) {
        loop {
            if !self.is_current(&session) {
                return;
            }
            let msg = match session.channel.read(true).await {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(tag = %self.config.tag, client = %self, error = %e, "closing message stream");
                    break;
                }
            };
            match self.handlers.get(msg.msg_type()).map(|h| Arc::clone(h.value())) {
                Some(handler) => {
                    tokio::spawn(handler(Arc::clone(&self), msg));
                }
                None => warn!(tag = %self.config.tag, msg_type = %msg.msg_type(), "message handler not found"),
            }
        }

        if self.is_current(&session) {
            self.reconnect().await;
        }
    }

    async fn reconnect(self: &Arc<Self>) {
        let guard = self.lifecycle.lock().await;
        if self.is_closed() {
            return;
        }
        self.connected.store(false, Ordering::Release);

        let mut last_err = anyhow!("did not try to reconnect");
        let mut tries = 0;
        while self.can_reconnect(tries) && !self.is_closed() {
            warn!(tag = %self.config.tag, server = %self.config.server_addr, try_no = tries + 1, "reconnecting");
            let result = match self.dial().await {
                Ok(()) => self.initialize().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    info!(tag = %self.config.tag, server = %self.config.server_addr, "reconnected");
                    return;
                }
                Err(e) => {
                    warn!(tag = %self.config.tag, error = %e, "could not reconnect");
                    last_err = e;
                    if self.client_data().is_some_and(|d| !d.status) {
                        break;
                    }
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
            tries += 1;
        }
        drop(guard);

        error!(tag = %self.config.tag, server = %self.config.server_addr, error = %last_err, "giving up on server");
        self.close(CLOSE_UNAVAILABLE, "Could not reconnect").await;
    }

    async fn stream_loop(self: Arc<Self>, session: Arc<Session>) {
        loop {
            if !self.is_current(&session) {
                return;
            }
            let (send, recv) = match session.connection.accept_bi().await {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(tag = %self.config.tag, error = %e, "stream accept loop ended");
                    return;
                }
            };

            let client = Arc::clone(&self);
            tokio::spawn(async move {
                let tracker = Arc::clone(&client);
                let stream = match Stream::accept(send, recv, client.decoders.clone(), move |s| tracker.track_stream(s)).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(tag = %client.config.tag, error = %e, "error accepting stream");
                        return;
                    }
                };
                debug!(tag = %client.config.tag, stream = %stream.id(), "accepted stream");

                let handler = client.stream_handler.read().await.clone();
                match handler {
                    Some(handler) => handler(client as Arc<dyn ClientHandle>, stream).await,
                    None => debug!(stream = %stream.id(), "no stream handler, stream kept for lookup"),
                }
            });
        }
    }

    /// Tears down the current session, if any.
    async fn reset(&self, code: u32, reason: &str) {
        self.connected.store(false, Ordering::Release);
        let previous = self.session.write().await.take();
        self.close_all_streams().await;
        if let Some(session) = previous {
            session.close(code, reason).await;
        }
    }

    /// Idempotent. Closes the session, the endpoint if owned, and fires the
    /// exit signal.
    pub async fn close(&self, code: u32, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reset(code, reason).await;
        if !self.managed {
            self.endpoint.close(code, reason);
        }
        self.exit.fire();

        let hook = self.closed_hook.read().ok().and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook(reason);
        }
        warn!(tag = %self.config.tag, server = %self.config.server_addr, code, reason, "connection closed");
    }

    // ------------------------------------------------------------------------
    // Messaging and streams
    // ------------------------------------------------------------------------

    pub async fn send(&self, msg: Message) -> Result<Option<Message>> {
        let session = self.current_session().await?;
        Ok(session.channel.send(msg).await?)
    }

    /// Finds registered client ids by id or by tag.
    pub async fn search_clients(&self, params: ClientSearch) -> Result<Vec<String>> {
        let reply = self
            .send(Message::with_ack(CLIENT_SEARCH, params, REQUEST_TIMEOUT))
            .await?
            .ok_or_else(|| anyhow!("search got no reply"))?;
        let clients = reply.body::<Clients>()?;
        if !clients.status {
            bail!("{}", clients.message);
        }
        Ok(clients.clients.clone())
    }

    pub async fn open_stream(&self, data: Metadata) -> Result<Arc<Stream>> {
        if !self.is_connected() {
            bail!("not connected");
        }
        let session = self.current_session().await?;
        let stream = Stream::open(&session.connection, data, self.decoders.clone()).await?;
        self.track_stream(Arc::clone(&stream));
        debug!(tag = %self.config.tag, stream = %stream.id(), "opened stream");
        Ok(stream)
    }

    pub fn get_stream(&self, id: &str) -> Option<Arc<Stream>> {
        self.streams.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Waits up to `timeout` for a server-opened stream with `id` to be
    /// registered by the accept loop.
    pub async fn await_stream(&self, id: &str, timeout: Duration) -> Result<Arc<Stream>> {
        let wait = async {
            loop {
                let notified = self.stream_added.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(stream) = self.get_stream(id) {
                    return stream;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| anyhow!("stream not found: {}", id))
    }

    pub async fn close_stream(&self, id: &str) {
        if let Some((_, stream)) = self.streams.remove(id) {
            stream.close().await;
        }
    }

    fn track_stream(&self, stream: Arc<Stream>) {
        self.streams.insert(stream.id().to_string(), Arc::clone(&stream));
        self.stream_added.notify_waiters();

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
}

impl std::fmt::Display for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "id({}) with addr({})", self.id(), self.endpoint.local_addr())
    }
}

#[async_trait]
impl ClientHandle for RegistryClient {
    fn id(&self) -> String {
        RegistryClient::id(self)
    }

    async fn send(&self, msg: Message) -> Result<Option<Message>> {
        RegistryClient::send(self, msg).await
    }

    async fn open_stream(&self, data: Metadata) -> Result<Arc<Stream>> {
        RegistryClient::open_stream(self, data).await
    }

    async fn close_stream(&self, id: &str) {
        RegistryClient::close_stream(self, id).await
    }

    async fn close(&self, code: u32, reason: &str) {
        RegistryClient::close(self, code, reason).await
    }

    fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }
}
