//! # Connection
//!
//! A [`Connection`] is the client-side half of a broker-allocated connection
//! id. The transport-specific work lives behind [`PathOps`]:
//!
//! | Mode    | Path                         | Session                          |
//! |---------|------------------------------|----------------------------------|
//! | `p2p`   | [`DirectPath`](super::direct::DirectPath) | QUIC session straight to the peer |
//! | `relay` | [`RelayPath`](super::relay::RelayPath)    | registry session with a relay      |
//!
//! A connection closes when its path exits, and closing is idempotent.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::direct::DirectPath;
use super::message_stream::MessageStream;
use super::relay::RelayPath;
use super::{ConnectionMode, ConnectionState, Peer, KEY_CONNECTION_ID, KEY_STREAM_MESSAGE};
use crate::model::{Metadata, Unmarshal};
use crate::server::ServerClient;
use crate::stream::{Stream, StreamHandler};
use crate::transport::QuicEndpoint;
use crate::util::{spawn_supervised, ExitSignal};

/// Everything a path needs from its owning manager.
#[derive(Clone)]
pub(crate) struct PathContext {
    pub conn_id: String,
    pub peer: Peer,
    pub initiator: bool,
    /// Endpoint shared with the broker client and the peer server.
    pub endpoint: QuicEndpoint,
    /// Credentials presented to relays, which forward them to the broker.
    pub broker_token: String,
    pub broker_data: Metadata,
    pub unmarshaler: Option<Arc<dyn Unmarshal>>,
    /// Handler for streams the remote side opens on this connection.
    pub stream_handler: StreamHandler,
}

/// Operations every connection path provides.
#[async_trait]
pub(crate) trait PathOps: Send + Sync {
    /// Establishes the path. On error the caller closes it.
    async fn connect(&self) -> Result<()>;

    async fn open_stream(&self, data: Metadata) -> Result<Arc<Stream>>;

    fn is_connected(&self) -> bool;

    async fn close(&self);

    /// Fires when the path has closed for any reason.
    fn exited(&self) -> ExitSignal;
}

pub(crate) enum ConnectionPath {
    Direct(Arc<DirectPath>),
    Relay(Arc<RelayPath>),
}

impl ConnectionPath {
    fn ops(&self) -> &dyn PathOps {
        match self {
            ConnectionPath::Direct(path) => path.as_ref(),
            ConnectionPath::Relay(path) => path.as_ref(),
        }
    }
}

pub struct Connection {
    me: Weak<Connection>,
    id: String,
    mode: ConnectionMode,
    initiator: bool,
    peer: Peer,
    relay_addr: Option<SocketAddr>,
    path: ConnectionPath,
    teardown: Mutex<()>,
    closed: AtomicBool,
    exit: ExitSignal,
}

impl Connection {
    /// Builds the connection and its path without connecting. Relay mode
    /// requires `relay_addr`.
    pub(crate) fn new(ctx: PathContext, mode: ConnectionMode, relay_addr: Option<SocketAddr>) -> Result<Arc<Self>> {
        let path = match (mode, relay_addr) {
            (ConnectionMode::P2p, _) => ConnectionPath::Direct(DirectPath::new(ctx.clone())),
            (ConnectionMode::Relay, Some(addr)) => ConnectionPath::Relay(RelayPath::new(ctx.clone(), addr)),
            (ConnectionMode::Relay, None) => bail!("relay address must be provided"),
        };

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: ctx.conn_id,
            mode,
            initiator: ctx.initiator,
            peer: ctx.peer,
            relay_addr,
            path,
            teardown: Mutex::new(()),
            closed: AtomicBool::new(false),
            exit: ExitSignal::new(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay_addr
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.path.ops().is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else if self.path.ops().is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Connecting
        }
    }

    pub fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }

    /// Establishes the path. A failed path is closed; a connected one is
    /// watched so its exit closes this connection.
    pub(crate) async fn connect(&self) -> Result<()> {
        info!(conn = %self.id, mode = %self.mode, peer = %self.peer, initiator = self.initiator, "connecting");
        if let Err(e) = self.path.ops().connect().await {
            error!(conn = %self.id, error = %e, "connection failed");
            self.path.ops().close().await;
            return Err(e);
        }
        if self.is_closed() {
            self.path.ops().close().await;
            bail!("connection closed while connecting");
        }

        let me = self.me.clone();
        let path_exit = self.path.ops().exited();
        let watch = async move {
            path_exit.wait().await;
            if let Some(conn) = me.upgrade() {
                conn.close("Exited").await;
            }
        };
        let me = self.me.clone();
        spawn_supervised("connection-path-watch", watch, move || {
            if let Some(conn) = me.upgrade() {
                tokio::spawn(async move { conn.close("Path watcher panicked").await });
            }
        });
        info!(conn = %self.id, mode = %self.mode, peer = %self.peer.id, "connected");
        Ok(())
    }

    /// Hands an inbound peer-server session to a waiting direct acceptor.
    pub(crate) fn checkin_remote(&self, client: Arc<ServerClient>) -> Result<()> {
        match &self.path {
            ConnectionPath::Direct(path) => path.checkin_remote(client),
            ConnectionPath::Relay(_) => bail!("connection not in p2p mode"),
        }
    }

    /// Why an inbound peer-server session for this connection must be
    /// refused, if it must.
    pub(crate) fn inbound_refusal(&self) -> Option<&'static str> {
        match &self.path {
            ConnectionPath::Relay(_) => Some("connection not in p2p mode"),
            ConnectionPath::Direct(_) if self.initiator || self.is_closed() => Some("peer not ready"),
            ConnectionPath::Direct(path) if path.is_claimed() => Some("connection already open"),
            ConnectionPath::Direct(_) => None,
        }
    }

    /// Opens a stream to the peer, tagged with this connection's id.
    pub async fn open_stream(&self, mut data: Metadata) -> Result<Arc<Stream>> {
        if !self.is_connected() {
            bail!("connection not connected");
        }
        data.insert(KEY_CONNECTION_ID.to_string(), self.id.clone());
        self.path.ops().open_stream(data).await
    }

    /// Opens a stream carrying framed messages.
    pub async fn open_message_stream(&self, mut data: Metadata) -> Result<Arc<MessageStream>> {
        data.insert(KEY_STREAM_MESSAGE.to_string(), "true".to_string());
        let stream = self.open_stream(data).await?;
        let conn = self.me.upgrade().ok_or_else(|| anyhow::anyhow!("connection dropped"))?;
        Ok(MessageStream::new(conn, stream))
    }

    pub async fn close(&self, reason: &str) {
        let _guard = self.teardown.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.path.ops().close().await;
        self.exit.fire();
        warn!(conn = %self, reason, "connection closed");
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id({}) with mode({}) peer({})", self.id, self.mode, self.peer.id)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("peer", &self.peer)
            .field("initiator", &self.initiator)
            .finish()
    }
}
